use clap::{Parser, Subcommand};
use discord_atlas::cache::{self, CacheDecision};
use discord_atlas::config::Config;
use discord_atlas::pipeline::{Pipeline, Stage};
use discord_atlas::server;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(version, about = "Map Discord chat exports into a clustered 2D visualization", long_about = None)]
struct Cli {
    /// Directory holding DiscordChatExporter JSON files
    #[arg(long, global = true)]
    exports_dir: Option<PathBuf>,

    /// Directory for intermediate and final artifacts
    #[arg(long, global = true)]
    output_dir: Option<PathBuf>,

    /// Directory with the static visualization
    #[arg(long, global = true)]
    frontend_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Parse, filter and deduplicate exported messages
    Parse,
    /// Embed messages with the word vector table
    Embed,
    /// Project embeddings to 2D with t-SNE
    Project,
    /// Cluster the 2D layout and name the clusters
    Cluster,
    /// Exit 0 when the pipeline should run, 1 when the cached output is valid
    CheckCache,
    /// Record the exports fingerprint after a successful run
    SaveHash,
    /// Serve the visualization
    Serve,
    /// Run every stage unless the cache is valid
    Run {
        /// Ignore the cache
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    // Load configuration
    let mut config = Config::from_env()?;
    if let Some(dir) = cli.exports_dir {
        config.exports_dir = dir;
    }
    if let Some(dir) = cli.output_dir {
        config.output_dir = dir;
    }
    if let Some(dir) = cli.frontend_dir {
        config.frontend_dir = dir;
    }
    tracing::debug!("{:?}", config);

    let pipeline = Pipeline::new(config);

    match cli.command {
        Commands::Parse => {
            pipeline.run_stage(Stage::Parse).await?;
        }
        Commands::Embed => {
            pipeline.run_stage(Stage::Embed).await?;
        }
        Commands::Project => {
            pipeline.run_stage(Stage::Project).await?;
        }
        Commands::Cluster => {
            pipeline.run_stage(Stage::Cluster).await?;
        }
        Commands::CheckCache => {
            let decision = cache::check(&pipeline.config.exports_dir, &pipeline.artifacts)?;
            match &decision {
                CacheDecision::Run(reason) => info!("{} - pipeline needs to run", reason),
                CacheDecision::Skip => {
                    info!("Exports unchanged and viz_data.json exists - skipping pipeline")
                }
            }
            std::process::exit(if decision.should_run() { 0 } else { 1 });
        }
        Commands::SaveHash => {
            cache::save_hash(&pipeline.config.exports_dir, &pipeline.artifacts)?;
        }
        Commands::Serve => {
            server::serve(
                &pipeline.artifacts,
                &pipeline.config.frontend_dir,
                &pipeline.config.host,
                pipeline.config.port,
                !pipeline.config.no_browser,
            )
            .await?;
        }
        Commands::Run { force } => {
            if pipeline.run_all(force).await? {
                info!("Pipeline complete");
            }
        }
    }

    Ok(())
}
