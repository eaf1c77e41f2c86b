use crate::npy::Matrix;
use rand::Rng;
use std::cmp::Ordering;
use std::collections::BinaryHeap;

struct VpNode {
    point: usize,
    /// Median distance from `point`; closer points live under `inside`.
    threshold: f64,
    inside: Option<usize>,
    outside: Option<usize>,
}

/// Max-heap entry ordered by distance, then index.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Candidate {
    distance: f64,
    index: usize,
}

impl Eq for Candidate {}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.distance
            .total_cmp(&other.distance)
            .then(self.index.cmp(&other.index))
    }
}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

pub struct VpTree<'a> {
    data: &'a Matrix,
    nodes: Vec<VpNode>,
    root: Option<usize>,
}

fn distance(data: &Matrix, a: usize, b: usize) -> f64 {
    data.row(a)
        .iter()
        .zip(data.row(b))
        .map(|(x, y)| {
            let d = f64::from(*x) - f64::from(*y);
            d * d
        })
        .sum::<f64>()
        .sqrt()
}

impl<'a> VpTree<'a> {
    pub fn build<R: Rng>(data: &'a Matrix, rng: &mut R) -> Self {
        let mut tree = Self {
            data,
            nodes: Vec::with_capacity(data.rows),
            root: None,
        };
        let mut items: Vec<usize> = (0..data.rows).collect();
        tree.root = tree.build_node(&mut items, rng);
        tree
    }

    fn build_node<R: Rng>(&mut self, items: &mut [usize], rng: &mut R) -> Option<usize> {
        if items.is_empty() {
            return None;
        }

        let pick = rng.gen_range(0..items.len());
        items.swap(0, pick);
        let (vantage, rest) = items.split_first_mut()?;
        let vantage = *vantage;

        let node = self.nodes.len();
        self.nodes.push(VpNode {
            point: vantage,
            threshold: 0.0,
            inside: None,
            outside: None,
        });
        if rest.is_empty() {
            return Some(node);
        }

        let median = rest.len() / 2;
        let data = self.data;
        rest.select_nth_unstable_by(median, |&a, &b| {
            distance(data, vantage, a).total_cmp(&distance(data, vantage, b))
        });
        let threshold = distance(data, vantage, rest[median]);

        let (inside, outside) = rest.split_at_mut(median);
        let inside = self.build_node(inside, rng);
        let outside = self.build_node(outside, rng);

        let n = &mut self.nodes[node];
        n.threshold = threshold;
        n.inside = inside;
        n.outside = outside;
        Some(node)
    }

    /// The `k` points nearest to row `target`, excluding itself, as
    /// `(distance, index)` sorted by distance then index.
    pub fn nearest(&self, target: usize, k: usize) -> Vec<(f64, usize)> {
        let mut heap = BinaryHeap::with_capacity(k + 1);
        if k > 0 {
            if let Some(root) = self.root {
                let mut tau = f64::INFINITY;
                self.search(root, target, k, &mut heap, &mut tau);
            }
        }

        let mut found: Vec<(f64, usize)> = heap
            .into_iter()
            .map(|c: Candidate| (c.distance, c.index))
            .collect();
        found.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
        found
    }

    fn search(
        &self,
        node: usize,
        target: usize,
        k: usize,
        heap: &mut BinaryHeap<Candidate>,
        tau: &mut f64,
    ) {
        let VpNode {
            point,
            threshold,
            inside,
            outside,
        } = self.nodes[node];
        let d = distance(self.data, target, point);

        if point != target {
            let candidate = Candidate {
                distance: d,
                index: point,
            };
            if heap.len() < k {
                heap.push(candidate);
            } else if heap.peek().is_some_and(|worst| candidate < *worst) {
                heap.pop();
                heap.push(candidate);
            }
            if heap.len() == k {
                *tau = heap.peek().map_or(f64::INFINITY, |c| c.distance);
            }
        }

        if d < threshold {
            if let Some(child) = inside {
                if d - *tau <= threshold {
                    self.search(child, target, k, heap, tau);
                }
            }
            if let Some(child) = outside {
                if d + *tau >= threshold {
                    self.search(child, target, k, heap, tau);
                }
            }
        } else {
            if let Some(child) = outside {
                if d + *tau >= threshold {
                    self.search(child, target, k, heap, tau);
                }
            }
            if let Some(child) = inside {
                if d - *tau <= threshold {
                    self.search(child, target, k, heap, tau);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn brute_force(data: &Matrix, target: usize, k: usize) -> Vec<(f64, usize)> {
        let mut all: Vec<(f64, usize)> = (0..data.rows)
            .filter(|&j| j != target)
            .map(|j| (distance(data, target, j), j))
            .collect();
        all.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
        all.truncate(k);
        all
    }

    fn scattered(n: usize, dim: usize) -> Matrix {
        let mut rng = StdRng::seed_from_u64(7);
        let rows: Vec<Vec<f32>> = (0..n)
            .map(|_| (0..dim).map(|_| rng.gen_range(-10.0f32..10.0)).collect())
            .collect();
        Matrix::from_rows(&rows).unwrap()
    }

    #[test]
    fn test_matches_brute_force() {
        let data = scattered(200, 5);
        let tree = VpTree::build(&data, &mut StdRng::seed_from_u64(42));

        for target in [0, 17, 99, 199] {
            for k in [1, 7, 31] {
                let got = tree.nearest(target, k);
                let want = brute_force(&data, target, k);
                let got_idx: Vec<usize> = got.iter().map(|c| c.1).collect();
                let want_idx: Vec<usize> = want.iter().map(|c| c.1).collect();
                assert_eq!(got_idx, want_idx, "target {target}, k {k}");
            }
        }
    }

    #[test]
    fn test_k_larger_than_data() {
        let data = scattered(4, 2);
        let tree = VpTree::build(&data, &mut StdRng::seed_from_u64(1));
        let got = tree.nearest(2, 10);
        assert_eq!(got.len(), 3);
        assert!(got.iter().all(|&(_, j)| j != 2));
        assert!(tree.nearest(0, 0).is_empty());
    }

    #[test]
    fn test_duplicates_are_found() {
        let data = Matrix::from_rows(&[
            vec![1.0, 1.0],
            vec![1.0, 1.0],
            vec![1.0, 1.0],
            vec![5.0, 5.0],
        ])
        .unwrap();
        let tree = VpTree::build(&data, &mut StdRng::seed_from_u64(3));
        assert_eq!(tree.nearest(0, 2), vec![(0.0, 1), (0.0, 2)]);
    }
}
