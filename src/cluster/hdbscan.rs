//! HDBSCAN over 2-D points with leaf cluster selection.
//!
//! Builds the minimum spanning tree of the mutual reachability graph, turns it
//! into a single-linkage hierarchy, condenses that hierarchy with
//! `min_cluster_size` and selects the leaves of the condensed tree. There is
//! no selection epsilon, so neighbouring dense regions stay separate.

use std::collections::VecDeque;

/// Label of points outside every dense region.
pub const NOISE: i32 = -1;

#[derive(Debug, Clone)]
pub struct HdbscanParams {
    pub min_cluster_size: usize,
    /// Neighbourhood size for core distances, counting the point itself.
    /// `None` means `min_cluster_size`.
    pub min_samples: Option<usize>,
    /// When the condensed tree never splits, keep its densest core as one
    /// cluster instead of calling everything noise.
    pub allow_single_cluster: bool,
}

impl Default for HdbscanParams {
    fn default() -> Self {
        Self {
            min_cluster_size: 15,
            min_samples: Some(7),
            allow_single_cluster: true,
        }
    }
}

impl HdbscanParams {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.min_cluster_size < 2 {
            anyhow::bail!(
                "min_cluster_size must be at least 2, got {}",
                self.min_cluster_size
            );
        }
        if self.min_samples == Some(0) {
            anyhow::bail!("min_samples must be at least 1");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
struct Merge {
    left: usize,
    right: usize,
    distance: f64,
    size: usize,
}

#[derive(Debug, Clone, Copy)]
struct CondensedEdge {
    parent: usize,
    child: usize,
    lambda: f64,
}

fn distance(a: [f64; 2], b: [f64; 2]) -> f64 {
    ((a[0] - b[0]).powi(2) + (a[1] - b[1]).powi(2)).sqrt()
}

fn core_distances(points: &[[f64; 2]], k: usize) -> Vec<f64> {
    let mut row = Vec::with_capacity(points.len());
    points
        .iter()
        .map(|&p| {
            row.clear();
            row.extend(points.iter().map(|&q| distance(p, q)));
            let (_, kth, _) = row.select_nth_unstable_by(k - 1, f64::total_cmp);
            *kth
        })
        .collect()
}

/// Prim's algorithm on the dense mutual reachability graph. Edges come back
/// sorted by weight.
fn mutual_reachability_mst(points: &[[f64; 2]], core: &[f64]) -> Vec<(usize, usize, f64)> {
    let n = points.len();
    let mut in_tree = vec![false; n];
    let mut best = vec![f64::INFINITY; n];
    let mut from = vec![0usize; n];
    let mut edges = Vec::with_capacity(n.saturating_sub(1));

    let mut current = 0;
    in_tree[0] = true;
    for _ in 1..n {
        let mut next: Option<usize> = None;
        for j in 0..n {
            if in_tree[j] {
                continue;
            }
            let reach = distance(points[current], points[j])
                .max(core[current])
                .max(core[j]);
            if reach < best[j] {
                best[j] = reach;
                from[j] = current;
            }
            if next.map_or(true, |b| best[j] < best[b]) {
                next = Some(j);
            }
        }

        let Some(j) = next else { break };
        in_tree[j] = true;
        edges.push((from[j], j, best[j]));
        current = j;
    }

    edges.sort_by(|a, b| a.2.total_cmp(&b.2));
    edges
}

/// Single-linkage merges; merge `i` creates node `n + i`.
fn single_linkage(n: usize, edges: &[(usize, usize, f64)]) -> Vec<Merge> {
    let mut parent: Vec<usize> = (0..2 * n - 1).collect();
    let mut size = vec![1usize; 2 * n - 1];
    let mut merges = Vec::with_capacity(n - 1);

    fn find(parent: &mut [usize], mut x: usize) -> usize {
        while parent[x] != x {
            parent[x] = parent[parent[x]];
            x = parent[x];
        }
        x
    }

    for (i, &(a, b, w)) in edges.iter().enumerate() {
        let ra = find(&mut parent, a);
        let rb = find(&mut parent, b);
        let node = n + i;
        parent[ra] = node;
        parent[rb] = node;
        size[node] = size[ra] + size[rb];
        merges.push(Merge {
            left: ra,
            right: rb,
            distance: w,
            size: size[node],
        });
    }

    merges
}

fn subtree_points(n: usize, merges: &[Merge], node: usize, out: &mut Vec<usize>) {
    let mut stack = vec![node];
    while let Some(x) = stack.pop() {
        if x < n {
            out.push(x);
        } else {
            let m = merges[x - n];
            stack.push(m.right);
            stack.push(m.left);
        }
    }
}

/// Condensed tree edges. Cluster ids start at `n` (the root) and are handed
/// out in breadth-first order.
fn condense(n: usize, merges: &[Merge], min_cluster_size: usize) -> Vec<CondensedEdge> {
    let root = 2 * n - 2;
    let node_size = |x: usize| if x < n { 1 } else { merges[x - n].size };

    let mut relabel = vec![0usize; 2 * n - 1];
    relabel[root] = n;
    let mut next_label = n + 1;
    let mut edges = Vec::new();
    let mut fallen = Vec::new();

    let mut queue = VecDeque::from([root]);
    while let Some(node) = queue.pop_front() {
        if node < n {
            continue;
        }
        let Merge {
            left,
            right,
            distance,
            ..
        } = merges[node - n];
        let lambda = if distance > 0.0 {
            1.0 / distance
        } else {
            f64::INFINITY
        };
        let parent = relabel[node];
        let left_big = node_size(left) >= min_cluster_size;
        let right_big = node_size(right) >= min_cluster_size;

        for (child, big, other_big) in [(left, left_big, right_big), (right, right_big, left_big)] {
            if big && other_big {
                relabel[child] = next_label;
                edges.push(CondensedEdge {
                    parent,
                    child: next_label,
                    lambda,
                });
                next_label += 1;
                queue.push_back(child);
            } else if big {
                // The parent cluster carries on through the big side
                relabel[child] = parent;
                queue.push_back(child);
            } else {
                fallen.clear();
                subtree_points(n, merges, child, &mut fallen);
                edges.extend(fallen.iter().map(|&p| CondensedEdge {
                    parent,
                    child: p,
                    lambda,
                }));
            }
        }
    }

    edges
}

/// Labels each point with its selected cluster or [`NOISE`].
fn label_points(n: usize, edges: &[CondensedEdge], allow_single_cluster: bool) -> Vec<i32> {
    let root = n;
    let cluster_count = edges
        .iter()
        .flat_map(|e| [e.parent, e.child])
        .filter(|&c| c >= n)
        .max()
        .map_or(1, |max| max - n + 1);

    let mut has_child_cluster = vec![false; cluster_count];
    for e in edges.iter().filter(|e| e.child >= n) {
        has_child_cluster[e.parent - n] = true;
    }
    // Every non-root cluster is some edge's child; ids ascend with creation
    let leaf_ids: Vec<usize> = (1..cluster_count)
        .filter(|&c| !has_child_cluster[c])
        .map(|c| c + n)
        .collect();

    let mut labels = vec![NOISE; n];

    if leaf_ids.is_empty() {
        if !allow_single_cluster {
            return labels;
        }
        let densest = edges
            .iter()
            .filter(|e| e.parent == root)
            .map(|e| e.lambda)
            .fold(f64::NEG_INFINITY, f64::max);
        for e in edges.iter().filter(|e| e.child < n) {
            if e.lambda >= densest {
                labels[e.child] = 0;
            }
        }
        return labels;
    }

    for e in edges.iter().filter(|e| e.child < n) {
        if let Ok(label) = leaf_ids.binary_search(&e.parent) {
            labels[e.child] = label as i32;
        }
    }
    labels
}

pub struct Hdbscan {
    params: HdbscanParams,
}

impl Hdbscan {
    pub fn new(params: HdbscanParams) -> anyhow::Result<Self> {
        params.validate()?;
        Ok(Self { params })
    }

    /// One label per point: `0..k` for clusters, [`NOISE`] otherwise.
    pub fn fit_predict(&self, points: &[[f64; 2]]) -> Vec<i32> {
        let n = points.len();
        if n < 2 || n < self.params.min_cluster_size {
            return vec![NOISE; n];
        }

        let k = self
            .params
            .min_samples
            .unwrap_or(self.params.min_cluster_size)
            .clamp(1, n);
        let core = core_distances(points, k);
        let mst = mutual_reachability_mst(points, &core);
        let merges = single_linkage(n, &mst);
        let condensed = condense(n, &merges, self.params.min_cluster_size);
        label_points(n, &condensed, self.params.allow_single_cluster)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(min_cluster_size: usize, min_samples: Option<usize>) -> HdbscanParams {
        HdbscanParams {
            min_cluster_size,
            min_samples,
            allow_single_cluster: true,
        }
    }

    /// `count` points on a small ring around `center`.
    fn blob(center: [f64; 2], count: usize, radius: f64) -> Vec<[f64; 2]> {
        (0..count)
            .map(|i| {
                let angle = i as f64 / count as f64 * std::f64::consts::TAU;
                let r = radius * (1.0 + (i % 3) as f64 * 0.2);
                [center[0] + r * angle.cos(), center[1] + r * angle.sin()]
            })
            .collect()
    }

    #[test]
    fn test_core_distance_counts_self() {
        let points = [[0.0, 0.0], [1.0, 0.0], [3.0, 0.0]];
        assert_eq!(core_distances(&points, 1), vec![0.0, 0.0, 0.0]);
        assert_eq!(core_distances(&points, 2), vec![1.0, 1.0, 2.0]);
    }

    #[test]
    fn test_two_blobs_and_outlier() {
        let mut points = blob([0.0, 0.0], 10, 0.5);
        points.extend(blob([20.0, 20.0], 10, 0.5));
        points.push([-40.0, 50.0]);

        // min_cluster_size above half a blob keeps each blob in one piece
        let labels = Hdbscan::new(params(6, Some(3))).unwrap().fit_predict(&points);

        assert_eq!(labels[20], NOISE);
        let first = labels[0];
        let second = labels[10];
        assert_ne!(first, NOISE);
        assert_ne!(second, NOISE);
        assert_ne!(first, second);
        assert!(labels[..10].iter().all(|&l| l == first));
        assert!(labels[10..20].iter().all(|&l| l == second));
        let mut distinct = vec![first, second];
        distinct.sort();
        assert_eq!(distinct, vec![0, 1]);
    }

    #[test]
    fn test_leaf_selection_splits_nested_regions() {
        // Two tight pairs of blobs, the pairs far apart: leaf selection must
        // return the four small blobs rather than the two pairs.
        let mut points = Vec::new();
        for center in [[0.0, 0.0], [4.0, 0.0], [100.0, 0.0], [104.0, 0.0]] {
            points.extend(blob(center, 8, 0.3));
        }

        let labels = Hdbscan::new(params(5, Some(2))).unwrap().fit_predict(&points);

        let mut per_blob: Vec<i32> = labels.chunks(8).map(|c| c[0]).collect();
        for (chunk, label) in labels.chunks(8).zip(&per_blob) {
            assert!(chunk.iter().all(|l| l == label));
        }
        per_blob.sort();
        per_blob.dedup();
        assert_eq!(per_blob.len(), 4);
        assert!(!per_blob.contains(&NOISE));
    }

    #[test]
    fn test_single_dense_pair_with_outlier() {
        let points = [[0.0, 0.0], [0.1, 0.0], [10.0, 10.0]];
        let labels = Hdbscan::new(params(2, None)).unwrap().fit_predict(&points);
        assert_eq!(labels, vec![0, 0, NOISE]);

        let strict = HdbscanParams {
            allow_single_cluster: false,
            ..params(2, None)
        };
        let labels = Hdbscan::new(strict).unwrap().fit_predict(&points);
        assert_eq!(labels, vec![NOISE; 3]);
    }

    #[test]
    fn test_too_few_points_are_noise() {
        let hdbscan = Hdbscan::new(params(5, None)).unwrap();
        assert!(hdbscan.fit_predict(&[]).is_empty());
        assert_eq!(hdbscan.fit_predict(&[[0.0, 0.0]; 4]), vec![NOISE; 4]);
    }

    #[test]
    fn test_duplicate_points() {
        let mut points = vec![[1.0, 1.0]; 6];
        points.extend(vec![[9.0, 9.0]; 6]);
        let labels = Hdbscan::new(params(4, Some(2))).unwrap().fit_predict(&points);

        assert!(labels[..6].iter().all(|&l| l == labels[0]));
        assert!(labels[6..].iter().all(|&l| l == labels[6]));
        assert_ne!(labels[0], labels[6]);
        assert!(!labels.contains(&NOISE));
    }

    #[test]
    fn test_invalid_params() {
        assert!(Hdbscan::new(params(1, None)).is_err());
        assert!(Hdbscan::new(params(5, Some(0))).is_err());
    }

    #[test]
    fn test_deterministic() {
        let mut points = blob([0.0, 0.0], 12, 1.0);
        points.extend(blob([6.0, 1.0], 12, 1.0));
        let hdbscan = Hdbscan::new(params(4, Some(3))).unwrap();
        assert_eq!(hdbscan.fit_predict(&points), hdbscan.fit_predict(&points));
    }
}
