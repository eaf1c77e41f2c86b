//! Stage 3: t-SNE projection of the embeddings onto the plane.
//!
//! Input affinities come from a per-point binary search on the Gaussian
//! bandwidth that matches the requested perplexity. The layout is optimised
//! with gradient descent using momentum and per-coordinate gains, first under
//! early exaggeration and then normally. The exact gradient is O(n²); the
//! Barnes-Hut variant uses sparse affinities over vantage-point tree
//! neighbours and a quadtree for the repulsive forces.

mod quadtree;
mod vptree;

use crate::artifacts::{self, Artifacts};
use crate::model::MessageRecord;
use crate::npy::{self, Matrix};
use quadtree::QuadTree;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::str::FromStr;
use std::time::Instant;
use tracing::{debug, info};
use vptree::VpTree;

const MACHINE_EPSILON: f64 = f64::EPSILON;
const PERPLEXITY_TOLERANCE: f64 = 1e-5;
const PERPLEXITY_STEPS: usize = 100;
const MIN_GAIN: f64 = 0.01;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TsneMethod {
    Exact,
    #[default]
    BarnesHut,
}

impl FromStr for TsneMethod {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "exact" => Ok(TsneMethod::Exact),
            "barnes_hut" | "barnes-hut" | "bh" => Ok(TsneMethod::BarnesHut),
            other => Err(anyhow::anyhow!(
                "Unknown t-SNE method '{}', expected 'exact' or 'barnes_hut'",
                other
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TsneParams {
    pub perplexity: f64,
    pub max_iter: usize,
    pub seed: u64,
    pub method: TsneMethod,
    pub early_exaggeration: f64,
    pub exploration_iter: usize,
    /// Barnes-Hut opening angle.
    pub angle: f64,
    pub min_grad_norm: f64,
}

impl Default for TsneParams {
    fn default() -> Self {
        Self {
            perplexity: 30.0,
            max_iter: 1000,
            seed: 42,
            method: TsneMethod::BarnesHut,
            early_exaggeration: 12.0,
            exploration_iter: 250,
            angle: 0.5,
            min_grad_norm: 1e-7,
        }
    }
}

/// Perplexity actually used for `n` samples.
pub fn effective_perplexity(perplexity: f64, n: usize) -> f64 {
    let ceiling = n.saturating_sub(1) as f64 / 3.0;
    perplexity.min(ceiling).max(1.0)
}

/// Input affinities: symmetric, summing to one, without the diagonal.
enum Affinities {
    Dense { n: usize, p: Vec<f64> },
    Sparse { rows: Vec<Vec<(usize, f64)>> },
}

impl Affinities {
    fn scale(&mut self, factor: f64) {
        match self {
            Affinities::Dense { p, .. } => p.iter_mut().for_each(|v| *v *= factor),
            Affinities::Sparse { rows } => rows
                .iter_mut()
                .flat_map(|r| r.iter_mut())
                .for_each(|(_, v)| *v *= factor),
        }
    }
}

fn squared_distance(a: &[f32], b: &[f32]) -> f64 {
    a.iter()
        .zip(b)
        .map(|(x, y)| {
            let d = f64::from(*x) - f64::from(*y);
            d * d
        })
        .sum()
}

/// Conditional probabilities p(j|i) over `distances` (squared) whose entropy
/// matches ln(perplexity).
fn conditional_row(distances: &[f64], perplexity: f64) -> Vec<f64> {
    let desired_entropy = perplexity.ln();
    let mut beta = 1.0;
    let mut beta_min = f64::NEG_INFINITY;
    let mut beta_max = f64::INFINITY;
    let mut row = vec![0.0; distances.len()];

    for _ in 0..PERPLEXITY_STEPS {
        for (p, d) in row.iter_mut().zip(distances) {
            *p = (-d * beta).exp();
        }
        let mut sum_p: f64 = row.iter().sum();
        if sum_p == 0.0 {
            sum_p = 1e-8;
        }
        let mut sum_dist_p = 0.0;
        for (p, d) in row.iter_mut().zip(distances) {
            *p /= sum_p;
            sum_dist_p += d * *p;
        }

        let entropy = sum_p.ln() + beta * sum_dist_p;
        let diff = entropy - desired_entropy;
        if diff.abs() <= PERPLEXITY_TOLERANCE {
            break;
        }

        if diff > 0.0 {
            beta_min = beta;
            beta = if beta_max == f64::INFINITY {
                beta * 2.0
            } else {
                (beta + beta_max) / 2.0
            };
        } else {
            beta_max = beta;
            beta = if beta_min == f64::NEG_INFINITY {
                beta / 2.0
            } else {
                (beta + beta_min) / 2.0
            };
        }
    }

    row
}

fn dense_affinities(data: &Matrix, perplexity: f64) -> Affinities {
    let n = data.rows;
    let mut conditional = vec![0.0; n * n];
    let mut distances = Vec::with_capacity(n - 1);

    for i in 0..n {
        distances.clear();
        distances.extend(
            (0..n)
                .filter(|&j| j != i)
                .map(|j| squared_distance(data.row(i), data.row(j))),
        );
        let row = conditional_row(&distances, perplexity);
        for (k, j) in (0..n).filter(|&j| j != i).enumerate() {
            conditional[i * n + j] = row[k];
        }
    }

    let mut p = vec![0.0; n * n];
    let mut total = 0.0;
    for i in 0..n {
        for j in 0..n {
            let v = conditional[i * n + j] + conditional[j * n + i];
            p[i * n + j] = v;
            total += v;
        }
    }
    let total = total.max(MACHINE_EPSILON);
    for i in 0..n {
        for j in 0..n {
            p[i * n + j] = if i == j {
                0.0
            } else {
                (p[i * n + j] / total).max(MACHINE_EPSILON)
            };
        }
    }

    Affinities::Dense { n, p }
}

fn sparse_affinities(data: &Matrix, perplexity: f64, seed: u64) -> Affinities {
    let n = data.rows;
    let k = ((3.0 * perplexity + 1.0) as usize).min(n - 1);
    let mut rows: Vec<Vec<(usize, f64)>> = vec![Vec::new(); n];

    let tree = VpTree::build(data, &mut StdRng::seed_from_u64(seed));
    for i in 0..n {
        let neighbours = tree.nearest(i, k);
        let distances: Vec<f64> = neighbours.iter().map(|&(d, _)| d * d).collect();
        let row = conditional_row(&distances, perplexity);
        for (&(_, j), p) in neighbours.iter().zip(row) {
            rows[i].push((j, p));
            rows[j].push((i, p));
        }
    }

    let mut total = 0.0;
    for row in rows.iter_mut() {
        row.sort_by_key(|&(j, _)| j);
        row.dedup_by(|next, kept| {
            if next.0 == kept.0 {
                kept.1 += next.1;
                true
            } else {
                false
            }
        });
        total += row.iter().map(|(_, p)| p).sum::<f64>();
    }
    let total = total.max(MACHINE_EPSILON);
    rows.iter_mut()
        .flat_map(|r| r.iter_mut())
        .for_each(|(_, p)| *p /= total);

    Affinities::Sparse { rows }
}

fn exact_gradient(p: &[f64], n: usize, y: &[[f64; 2]], grad: &mut [[f64; 2]]) {
    let mut num = vec![0.0; n * n];
    let mut sum_q = 0.0;
    for i in 0..n {
        for j in (i + 1)..n {
            let dx = y[i][0] - y[j][0];
            let dy = y[i][1] - y[j][1];
            let q = 1.0 / (1.0 + dx * dx + dy * dy);
            num[i * n + j] = q;
            num[j * n + i] = q;
            sum_q += 2.0 * q;
        }
    }
    let sum_q = sum_q.max(MACHINE_EPSILON);

    for i in 0..n {
        let mut g = [0.0, 0.0];
        for j in 0..n {
            if i == j {
                continue;
            }
            let q = num[i * n + j];
            let mult = (p[i * n + j] - (q / sum_q).max(MACHINE_EPSILON)) * q;
            g[0] += mult * (y[i][0] - y[j][0]);
            g[1] += mult * (y[i][1] - y[j][1]);
        }
        grad[i] = [4.0 * g[0], 4.0 * g[1]];
    }
}

fn barnes_hut_gradient(
    rows: &[Vec<(usize, f64)>],
    y: &[[f64; 2]],
    angle: f64,
    grad: &mut [[f64; 2]],
) {
    let tree = QuadTree::build(y);
    let mut stack = Vec::new();
    let mut negative = vec![[0.0, 0.0]; y.len()];
    let mut sum_q = 0.0;

    for (i, neg) in negative.iter_mut().enumerate() {
        sum_q += tree.repulsion(i, angle, neg, &mut stack);
    }
    let sum_q = sum_q.max(MACHINE_EPSILON);

    for (i, row) in rows.iter().enumerate() {
        let mut positive = [0.0, 0.0];
        for &(j, p) in row {
            let dx = y[i][0] - y[j][0];
            let dy = y[i][1] - y[j][1];
            let q = 1.0 / (1.0 + dx * dx + dy * dy);
            positive[0] += p * q * dx;
            positive[1] += p * q * dy;
        }
        grad[i] = [
            4.0 * (positive[0] - negative[i][0] / sum_q),
            4.0 * (positive[1] - negative[i][1] / sum_q),
        ];
    }
}

struct Phase {
    iterations: usize,
    momentum: f64,
}

/// Embeds the rows of `data` in 2-D.
pub fn fit_transform(data: &Matrix, params: &TsneParams) -> Vec<[f64; 2]> {
    let n = data.rows;
    match n {
        0 => return Vec::new(),
        1 => return vec![[0.0, 0.0]],
        _ => {}
    }

    let perplexity = effective_perplexity(params.perplexity, n);
    if perplexity < params.perplexity {
        debug!(
            "Perplexity {} too large for {} samples, using {:.2}",
            params.perplexity, n, perplexity
        );
    }

    let mut affinities = match params.method {
        TsneMethod::Exact => dense_affinities(data, perplexity),
        TsneMethod::BarnesHut => sparse_affinities(data, perplexity, params.seed),
    };

    let mut rng = StdRng::seed_from_u64(params.seed);
    let mut y: Vec<[f64; 2]> = (0..n)
        .map(|_| [1e-4 * gaussian(&mut rng), 1e-4 * gaussian(&mut rng)])
        .collect();

    let learning_rate = (n as f64 / params.early_exaggeration / 4.0).max(50.0);
    let exploration = params.exploration_iter.min(params.max_iter);
    let phases = [
        Phase {
            iterations: exploration,
            momentum: 0.5,
        },
        Phase {
            iterations: params.max_iter - exploration,
            momentum: 0.8,
        },
    ];

    let mut grad = vec![[0.0, 0.0]; n];
    let mut done = 0usize;
    affinities.scale(params.early_exaggeration);

    for (phase_no, phase) in phases.iter().enumerate() {
        if phase_no == 1 {
            affinities.scale(1.0 / params.early_exaggeration);
        }
        let mut update = vec![[0.0f64, 0.0]; n];
        let mut gains = vec![[1.0f64, 1.0]; n];

        for _ in 0..phase.iterations {
            match &affinities {
                Affinities::Dense { n, p } => exact_gradient(p, *n, &y, &mut grad),
                Affinities::Sparse { rows } => {
                    barnes_hut_gradient(rows, &y, params.angle, &mut grad)
                }
            }

            let mut grad_norm = 0.0;
            for i in 0..n {
                for d in 0..2 {
                    let gain = &mut gains[i][d];
                    if update[i][d] * grad[i][d] < 0.0 {
                        *gain += 0.2;
                    } else {
                        *gain *= 0.8;
                    }
                    *gain = gain.max(MIN_GAIN);

                    let g = grad[i][d] * *gain;
                    grad_norm += g * g;
                    update[i][d] = phase.momentum * update[i][d] - learning_rate * g;
                    y[i][d] += update[i][d];
                }
            }
            done += 1;

            let grad_norm = grad_norm.sqrt();
            if done % 50 == 0 {
                debug!("t-SNE iteration {}: gradient norm {:.7}", done, grad_norm);
            }
            if grad_norm <= params.min_grad_norm {
                debug!("t-SNE converged at iteration {}", done);
                break;
            }
        }
    }

    y
}

/// Standard normal sample (Box-Muller).
fn gaussian<R: Rng>(rng: &mut R) -> f64 {
    let u1: f64 = 1.0 - rng.gen::<f64>();
    let u2: f64 = rng.gen::<f64>();
    (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
}

/// Runs the projection stage: `embeddings.npy` and
/// `messages_with_embeddings.json` in, `messages_with_coords.json` out.
pub fn run(out: &Artifacts, params: &TsneParams) -> anyhow::Result<usize> {
    let embeddings = npy::read_matrix(&out.path(artifacts::EMBEDDINGS))?;
    info!(
        "Loaded {} embeddings with {} dimensions",
        embeddings.rows, embeddings.cols
    );
    let mut messages: Vec<MessageRecord> =
        artifacts::read_json(&out.path(artifacts::MESSAGES_WITH_EMBEDDINGS))?;

    if messages.len() != embeddings.rows {
        anyhow::bail!(
            "{} has {} rows but {} lists {} messages",
            artifacts::EMBEDDINGS,
            embeddings.rows,
            artifacts::MESSAGES_WITH_EMBEDDINGS,
            messages.len()
        );
    }

    info!(
        "Running t-SNE ({:?}, perplexity={}, max_iter={}, seed={})...",
        params.method, params.perplexity, params.max_iter, params.seed
    );
    let start = Instant::now();
    let coords = fit_transform(&embeddings, params);
    info!(
        "t-SNE completed in {}",
        humantime::format_duration(std::time::Duration::from_millis(
            start.elapsed().as_millis() as u64
        ))
    );

    for (msg, [x, y]) in messages.iter_mut().zip(&coords) {
        msg.x = Some(*x);
        msg.y = Some(*y);
    }

    artifacts::write_json(&out.path(artifacts::MESSAGES_WITH_COORDS), &messages)?;
    info!("Saved {} messages with 2D coordinates", messages.len());

    if let Some((x_range, y_range)) = coordinate_ranges(&coords) {
        info!("X range: [{:.2}, {:.2}]", x_range.0, x_range.1);
        info!("Y range: [{:.2}, {:.2}]", y_range.0, y_range.1);
    }

    Ok(messages.len())
}

type Range = (f64, f64);

fn coordinate_ranges(coords: &[[f64; 2]]) -> Option<(Range, Range)> {
    let first = coords.first()?;
    let init = ((first[0], first[0]), (first[1], first[1]));
    Some(coords.iter().fold(init, |(xr, yr), p| {
        (
            (xr.0.min(p[0]), xr.1.max(p[0])),
            (yr.0.min(p[1]), yr.1.max(p[1])),
        )
    }))
}
