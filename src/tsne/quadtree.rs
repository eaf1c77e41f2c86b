/// Deeper than this, distinct points are kept together in one leaf.
const MAX_DEPTH: usize = 64;

#[derive(Debug, Clone)]
struct Node {
    center: [f64; 2],
    half_width: f64,
    center_of_mass: [f64; 2],
    count: usize,
    /// Index of the first of four consecutive children.
    children: Option<usize>,
    points: Vec<usize>,
}

impl Node {
    fn new(center: [f64; 2], half_width: f64) -> Self {
        Self {
            center,
            half_width,
            center_of_mass: [0.0, 0.0],
            count: 0,
            children: None,
            points: Vec::new(),
        }
    }

    fn quadrant(&self, p: [f64; 2]) -> usize {
        let east = usize::from(p[0] >= self.center[0]);
        let north = usize::from(p[1] >= self.center[1]);
        east | (north << 1)
    }
}

pub struct QuadTree<'a> {
    points: &'a [[f64; 2]],
    nodes: Vec<Node>,
}

impl<'a> QuadTree<'a> {
    pub fn build(points: &'a [[f64; 2]]) -> Self {
        let mut min = [f64::INFINITY; 2];
        let mut max = [f64::NEG_INFINITY; 2];
        for p in points {
            for d in 0..2 {
                min[d] = min[d].min(p[d]);
                max[d] = max[d].max(p[d]);
            }
        }

        let (center, half_width) = if points.is_empty() {
            ([0.0, 0.0], 1.0)
        } else {
            let center = [(min[0] + max[0]) / 2.0, (min[1] + max[1]) / 2.0];
            let extent = (max[0] - min[0]).max(max[1] - min[1]);
            (center, extent / 2.0 + 1e-5 * extent.max(1.0))
        };

        let mut tree = Self {
            points,
            nodes: vec![Node::new(center, half_width)],
        };
        for i in 0..points.len() {
            tree.insert(i);
        }
        tree
    }

    fn insert(&mut self, idx: usize) {
        let p = self.points[idx];
        let mut node = 0;
        let mut depth = 0;

        loop {
            {
                let n = &mut self.nodes[node];
                let count = n.count as f64;
                n.center_of_mass[0] = (n.center_of_mass[0] * count + p[0]) / (count + 1.0);
                n.center_of_mass[1] = (n.center_of_mass[1] * count + p[1]) / (count + 1.0);
                n.count += 1;
            }

            if self.nodes[node].children.is_none() {
                let leaf = &self.nodes[node];
                let duplicate = leaf
                    .points
                    .first()
                    .is_some_and(|&other| self.points[other] == p);
                if leaf.points.is_empty() || duplicate || depth >= MAX_DEPTH {
                    self.nodes[node].points.push(idx);
                    return;
                }
                self.subdivide(node);
            }

            let first_child = self.nodes[node].children.unwrap_or_default();
            node = first_child + self.nodes[node].quadrant(p);
            depth += 1;
        }
    }

    /// Splits a leaf and pushes its points one level down.
    fn subdivide(&mut self, node: usize) {
        let Node {
            center,
            half_width,
            ..
        } = self.nodes[node];
        let quarter = half_width / 2.0;
        let first_child = self.nodes.len();

        for q in 0..4 {
            let dx = if q & 1 == 1 { quarter } else { -quarter };
            let dy = if q & 2 == 2 { quarter } else { -quarter };
            self.nodes
                .push(Node::new([center[0] + dx, center[1] + dy], quarter));
        }
        self.nodes[node].children = Some(first_child);

        let moved = std::mem::take(&mut self.nodes[node].points);
        for idx in moved {
            let p = self.points[idx];
            let quadrant = self.nodes[node].quadrant(p);
            let child = &mut self.nodes[first_child + quadrant];
            let count = child.count as f64;
            child.center_of_mass[0] = (child.center_of_mass[0] * count + p[0]) / (count + 1.0);
            child.center_of_mass[1] = (child.center_of_mass[1] * count + p[1]) / (count + 1.0);
            child.count += 1;
            child.points.push(idx);
        }
    }

    /// Accumulates the unnormalized repulsive force on point `i` into `force`
    /// and returns its contribution to the normalization sum Z.
    pub fn repulsion(
        &self,
        i: usize,
        theta: f64,
        force: &mut [f64; 2],
        stack: &mut Vec<usize>,
    ) -> f64 {
        let p = self.points[i];
        let mut sum_q = 0.0;
        stack.clear();
        stack.push(0);

        while let Some(n) = stack.pop() {
            let node = &self.nodes[n];
            if node.count == 0 {
                continue;
            }

            match node.children {
                None => {
                    for &j in &node.points {
                        if j == i {
                            continue;
                        }
                        let dx = p[0] - self.points[j][0];
                        let dy = p[1] - self.points[j][1];
                        let q = 1.0 / (1.0 + dx * dx + dy * dy);
                        sum_q += q;
                        force[0] += q * q * dx;
                        force[1] += q * q * dy;
                    }
                }
                Some(first_child) => {
                    let dx = p[0] - node.center_of_mass[0];
                    let dy = p[1] - node.center_of_mass[1];
                    let dist2 = dx * dx + dy * dy;
                    let width = 2.0 * node.half_width;

                    if dist2 > 0.0 && width / dist2.sqrt() < theta {
                        let count = node.count as f64;
                        let q = 1.0 / (1.0 + dist2);
                        sum_q += count * q;
                        force[0] += count * q * q * dx;
                        force[1] += count * q * q * dy;
                    } else {
                        stack.extend(first_child..first_child + 4);
                    }
                }
            }
        }

        sum_q
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exact_repulsion(points: &[[f64; 2]], i: usize) -> ([f64; 2], f64) {
        let mut force = [0.0, 0.0];
        let mut sum_q = 0.0;
        for (j, q_point) in points.iter().enumerate() {
            if j == i {
                continue;
            }
            let dx = points[i][0] - q_point[0];
            let dy = points[i][1] - q_point[1];
            let q = 1.0 / (1.0 + dx * dx + dy * dy);
            sum_q += q;
            force[0] += q * q * dx;
            force[1] += q * q * dy;
        }
        (force, sum_q)
    }

    fn grid() -> Vec<[f64; 2]> {
        let mut points = Vec::new();
        for x in 0..8 {
            for y in 0..8 {
                points.push([x as f64 * 0.7, y as f64 * 1.3 - 2.0]);
            }
        }
        points
    }

    #[test]
    fn test_theta_zero_matches_exact() {
        let points = grid();
        let tree = QuadTree::build(&points);
        let mut stack = Vec::new();

        for i in [0, 17, 63] {
            let mut force = [0.0, 0.0];
            let sum_q = tree.repulsion(i, 0.0, &mut force, &mut stack);
            let (expected, expected_q) = exact_repulsion(&points, i);
            assert!((sum_q - expected_q).abs() < 1e-9);
            assert!((force[0] - expected[0]).abs() < 1e-9);
            assert!((force[1] - expected[1]).abs() < 1e-9);
        }
    }

    #[test]
    fn test_approximation_is_close() {
        let points = grid();
        let tree = QuadTree::build(&points);
        let mut stack = Vec::new();

        let mut force = [0.0, 0.0];
        let sum_q = tree.repulsion(5, 0.5, &mut force, &mut stack);
        let (_, expected_q) = exact_repulsion(&points, 5);
        assert!((sum_q - expected_q).abs() / expected_q < 0.1);
    }

    #[test]
    fn test_duplicates_share_a_leaf() {
        let points = vec![[1.0, 1.0], [1.0, 1.0], [1.0, 1.0], [3.0, 3.0]];
        let tree = QuadTree::build(&points);
        assert_eq!(tree.nodes[0].count, 4);

        let mut force = [0.0, 0.0];
        let sum_q = tree.repulsion(0, 0.0, &mut force, &mut Vec::new());
        // two coincident neighbours at q = 1, one at distance^2 = 8
        assert!((sum_q - (2.0 + 1.0 / 9.0)).abs() < 1e-12);
    }
}
