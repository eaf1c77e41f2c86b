use crate::artifacts::{self, Artifacts};
use crate::cache::{self, CacheDecision};
use crate::config::Config;
use crate::embed::{self, vectors, WordVectors};
use crate::model::MessageRecord;
use crate::{cluster, export, tsne};
use std::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Parse,
    Embed,
    Project,
    Cluster,
}

impl Stage {
    pub const ALL: [Stage; 4] = [Stage::Parse, Stage::Embed, Stage::Project, Stage::Cluster];

    pub fn name(self) -> &'static str {
        match self {
            Stage::Parse => "parse exports",
            Stage::Embed => "generate embeddings",
            Stage::Project => "t-SNE projection",
            Stage::Cluster => "cluster",
        }
    }
}

pub struct Pipeline {
    pub config: Config,
    pub artifacts: Artifacts,
}

impl Pipeline {
    pub fn new(config: Config) -> Self {
        let artifacts = Artifacts::new(&config.output_dir);
        Self { config, artifacts }
    }

    /// Loads the word vector table, downloading it first when a URL is
    /// configured and the file is missing.
    pub async fn load_word_vectors(&self) -> anyhow::Result<WordVectors> {
        let path = self.config.word_vectors_path.clone();
        if let Some(url) = &self.config.word_vectors_url {
            vectors::ensure_downloaded(url, &path).await?;
        }
        if !path.exists() {
            anyhow::bail!(
                "Word vectors not found at {} (set WORD_VECTORS_PATH or WORD_VECTORS_URL)",
                path.display()
            );
        }

        let limit = self.config.word_vectors_limit;
        let table = tokio::task::spawn_blocking(move || WordVectors::load(&path, limit)).await??;
        Ok(table)
    }

    /// Runs one stage to completion. Returns the number of records it wrote.
    pub async fn run_stage(&self, stage: Stage) -> anyhow::Result<usize> {
        info!("=== {} ===", stage.name());
        let start = Instant::now();
        let out = self.artifacts.clone();
        let config = self.config.clone();

        let count = match stage {
            Stage::Parse => {
                tokio::task::spawn_blocking(move || {
                    export::run(&config.exports_dir, &out, config.min_message_length)
                })
                .await??
            }
            Stage::Embed => {
                let table = self.load_word_vectors().await?;
                tokio::task::spawn_blocking(move || embed::run(&table, &out)).await??
            }
            Stage::Project => {
                tokio::task::spawn_blocking(move || tsne::run(&out, &config.tsne_params())).await??
            }
            Stage::Cluster => {
                let report = tokio::task::spawn_blocking(move || {
                    cluster::run(&out, &config.hdbscan_params(), &config.naming)
                })
                .await??;
                report.total
            }
        };

        info!(
            "{} finished in {}",
            stage.name(),
            humantime::format_duration(std::time::Duration::from_secs(start.elapsed().as_secs()))
        );
        Ok(count)
    }

    /// Runs every stage unless the cached output is still valid. Returns
    /// `false` when the run was skipped or no message survived parsing.
    pub async fn run_all(&self, force: bool) -> anyhow::Result<bool> {
        let decision = cache::check(&self.config.exports_dir, &self.artifacts)?;
        match &decision {
            CacheDecision::Skip if !force => {
                info!("Exports unchanged and viz_data.json exists - skipping pipeline");
                return Ok(false);
            }
            CacheDecision::Skip => info!("Cache is valid but --force was given"),
            CacheDecision::Run(reason) => info!("{} - pipeline needs to run", reason),
        }

        for stage in Stage::ALL {
            let count = self.run_stage(stage).await?;
            if stage == Stage::Parse && count == 0 {
                warn!("No messages to process, stopping");
                self.clear_viz_data()?;
                cache::save_hash(&self.config.exports_dir, &self.artifacts)?;
                return Ok(false);
            }
        }

        cache::save_hash(&self.config.exports_dir, &self.artifacts)?;
        Ok(true)
    }

    /// Replaces `viz_data.json` with an empty array so a previous export set
    /// is not served.
    fn clear_viz_data(&self) -> anyhow::Result<()> {
        self.artifacts.ensure_dir()?;
        let empty: [MessageRecord; 0] = [];
        artifacts::write_json_compact(&self.artifacts.path(artifacts::VIZ_DATA), &empty)
    }
}
