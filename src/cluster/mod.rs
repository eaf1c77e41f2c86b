pub mod hdbscan;
pub mod naming;

use crate::artifacts::{self, Artifacts};
use crate::model::MessageRecord;
use hdbscan::{Hdbscan, HdbscanParams, NOISE};
use naming::{NamingConfig, NOISE_NAME};
use std::collections::BTreeMap;
use tracing::{info, warn};

/// Clusters above this share of all points are reported as oversized.
const OVERSIZED_DIVISOR: usize = 10;

/// Size diagnostics for one clustering run.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterReport {
    pub total: usize,
    pub clusters: usize,
    pub noise: usize,
    /// Integer percentage of noise points, rounded down.
    pub noise_pct: usize,
    /// `(label, size)` of clusters holding more than a tenth of all points.
    pub oversized: Vec<(i32, usize)>,
    pub sizes: BTreeMap<i32, usize>,
}

impl ClusterReport {
    pub fn from_labels(labels: &[i32]) -> Self {
        let total = labels.len();
        let mut sizes: BTreeMap<i32, usize> = BTreeMap::new();
        for &label in labels {
            *sizes.entry(label).or_default() += 1;
        }

        let noise = sizes.get(&NOISE).copied().unwrap_or(0);
        let clusters = sizes.keys().filter(|&&l| l != NOISE).count();
        let noise_pct = if total == 0 { 0 } else { noise * 100 / total };
        let max_cluster_size = total / OVERSIZED_DIVISOR;
        let oversized = sizes
            .iter()
            .filter(|(&label, &count)| label != NOISE && count > max_cluster_size)
            .map(|(&label, &count)| (label, count))
            .collect();

        Self {
            total,
            clusters,
            noise,
            noise_pct,
            oversized,
            sizes,
        }
    }

    pub fn log(&self) {
        info!(
            "Found {} clusters, {} noise points ({}% unclustered)",
            self.clusters, self.noise, self.noise_pct
        );
        for (label, count) in &self.oversized {
            let pct = if self.total == 0 { 0 } else { count * 100 / self.total };
            warn!(
                "Cluster {} has {} messages ({}% of data)",
                label, count, pct
            );
        }
    }
}

/// Assigns `cluster` and `cluster_name` to every message from its `x`/`y`.
pub fn cluster_messages(
    messages: &mut [MessageRecord],
    params: &HdbscanParams,
    naming: &NamingConfig,
) -> anyhow::Result<ClusterReport> {
    let points = messages
        .iter()
        .map(|m| match (m.x, m.y) {
            (Some(x), Some(y)) => Ok([x, y]),
            _ => Err(anyhow::anyhow!("Message {} has no 2D coordinates", m.id)),
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    info!(
        "Running HDBSCAN clustering (min_cluster_size={}, min_samples={:?}, selection=leaf)...",
        params.min_cluster_size, params.min_samples
    );
    let labels = Hdbscan::new(params.clone())?.fit_predict(&points);

    let report = ClusterReport::from_labels(&labels);
    report.log();

    let mut members: BTreeMap<i32, Vec<usize>> = BTreeMap::new();
    for (i, &label) in labels.iter().enumerate() {
        members.entry(label).or_default().push(i);
    }

    info!("Generating cluster names...");
    let mut names: BTreeMap<i32, String> = BTreeMap::new();
    for (&label, idxs) in &members {
        let name = if label == NOISE {
            NOISE_NAME.to_string()
        } else {
            let name = naming.name_cluster(idxs.iter().map(|&i| messages[i].content.as_str()));
            info!("  Cluster {} ({} msgs): {}", label, idxs.len(), name);
            name
        };
        names.insert(label, name);
    }

    for (msg, &label) in messages.iter_mut().zip(&labels) {
        msg.cluster = Some(label);
        msg.cluster_name = names.get(&label).cloned();
    }

    Ok(report)
}

/// Runs the clustering stage: `messages_with_coords.json` in, `viz_data.json` out.
pub fn run(
    out: &Artifacts,
    params: &HdbscanParams,
    naming: &NamingConfig,
) -> anyhow::Result<ClusterReport> {
    let mut messages: Vec<MessageRecord> =
        artifacts::read_json(&out.path(artifacts::MESSAGES_WITH_COORDS))?;
    info!("Loaded {} messages", messages.len());

    let report = cluster_messages(&mut messages, params, naming)?;

    let viz_path = out.path(artifacts::VIZ_DATA);
    artifacts::write_json_compact(&viz_path, &messages)?;
    info!(
        "Saved {} messages with cluster data to {}",
        messages.len(),
        viz_path.display()
    );

    info!("Cluster summary:");
    let mut summary: BTreeMap<i32, (&str, usize)> = BTreeMap::new();
    for msg in messages.iter().filter(|m| m.cluster != Some(NOISE)) {
        if let (Some(label), Some(name)) = (msg.cluster, msg.cluster_name.as_deref()) {
            summary.entry(label).or_insert((name, 0)).1 += 1;
        }
    }
    for (name, count) in summary.values() {
        info!("  {}: {} messages", name, count);
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn placed(id: &str, content: &str, x: f64, y: f64) -> MessageRecord {
        MessageRecord {
            id: id.to_string(),
            channel: Some("c1".to_string()),
            channel_name: "general".to_string(),
            guild_id: Some("g1".to_string()),
            guild_name: "Guild".to_string(),
            author: "ana".to_string(),
            content: content.to_string(),
            timestamp: None,
            x: Some(x),
            y: Some(y),
            cluster: None,
            cluster_name: None,
        }
    }

    fn small_params() -> HdbscanParams {
        HdbscanParams {
            min_cluster_size: 2,
            min_samples: None,
            allow_single_cluster: true,
        }
    }

    #[test]
    fn test_report_counts() {
        let labels = [0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1, 1, -1, -1, -1, -1, -1, -1];
        let report = ClusterReport::from_labels(&labels);

        assert_eq!(report.total, 20);
        assert_eq!(report.clusters, 2);
        assert_eq!(report.noise, 6);
        assert_eq!(report.noise_pct, 30);
        // 20 / 10 = 2, cluster 1 with exactly 2 is not oversized
        assert_eq!(report.oversized, vec![(0, 12)]);
    }

    #[test]
    fn test_report_empty() {
        let report = ClusterReport::from_labels(&[]);
        assert_eq!(report.clusters, 0);
        assert_eq!(report.noise_pct, 0);
        assert!(report.oversized.is_empty());
    }

    #[test]
    fn test_noise_is_unclustered_and_stopwords_are_misc() {
        let mut messages = vec![
            placed("1", "the and but yeah", 0.0, 0.0),
            placed("2", "okay really actually", 0.05, 0.0),
            placed("3", "kubernetes kubernetes kubernetes", 50.0, 50.0),
        ];

        let report =
            cluster_messages(&mut messages, &small_params(), &NamingConfig::default()).unwrap();

        assert_eq!(report.clusters, 1);
        assert_eq!(messages[0].cluster, Some(0));
        assert_eq!(messages[0].cluster_name.as_deref(), Some("misc"));
        assert_eq!(messages[2].cluster, Some(NOISE));
        assert_eq!(messages[2].cluster_name.as_deref(), Some(NOISE_NAME));
    }

    #[test]
    fn test_missing_coordinates_is_an_error() {
        let mut messages = vec![placed("1", "hello world again", 0.0, 0.0)];
        messages[0].y = None;
        assert!(cluster_messages(&mut messages, &small_params(), &NamingConfig::default()).is_err());
    }

    #[test]
    fn test_every_message_gets_a_cluster() {
        let mut messages: Vec<MessageRecord> = (0..12)
            .map(|i| {
                let x = if i < 6 { i as f64 * 0.1 } else { 30.0 + i as f64 * 0.1 };
                placed(&i.to_string(), "database migration script", x, 0.0)
            })
            .collect();

        let params = HdbscanParams {
            min_cluster_size: 4,
            min_samples: Some(2),
            allow_single_cluster: true,
        };
        cluster_messages(&mut messages, &params, &NamingConfig::default()).unwrap();

        assert!(messages.iter().all(|m| m.cluster.is_some() && m.cluster_name.is_some()));
        assert_eq!(messages[0].cluster_name.as_deref(), Some("database migration script"));
    }
}
