use crate::cluster::hdbscan::HdbscanParams;
use crate::cluster::naming::NamingConfig;
use crate::tsne::{TsneMethod, TsneParams};
use dotenvy::dotenv;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::PathBuf;
use tracing::{debug, warn};

#[derive(Clone)]
pub struct Config {
    pub exports_dir: PathBuf,
    pub output_dir: PathBuf,
    pub frontend_dir: PathBuf,
    pub min_message_length: usize,

    // Word vector settings
    pub word_vectors_path: PathBuf,
    pub word_vectors_url: Option<String>,
    pub word_vectors_limit: Option<usize>,

    // t-SNE settings
    pub tsne_perplexity: f64,
    pub tsne_max_iter: usize,
    pub tsne_seed: u64,
    pub tsne_method: TsneMethod,

    // Clustering settings
    pub min_cluster_size: usize,
    pub min_samples: Option<usize>,
    pub naming: NamingConfig,

    // Server settings
    pub host: String,
    pub port: u16,
    pub no_browser: bool,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv().ok();
        Self::build()
    }

    fn build() -> anyhow::Result<Self> {
        let naming_path = env::var("NAMING_CONFIG").unwrap_or_else(|_| "naming.toml".to_string());

        Ok(Config {
            exports_dir: env::var("EXPORTS_DIR")
                .unwrap_or_else(|_| "exports".to_string())
                .into(),
            output_dir: env::var("OUTPUT_DIR")
                .unwrap_or_else(|_| "output".to_string())
                .into(),
            frontend_dir: env::var("FRONTEND_DIR")
                .unwrap_or_else(|_| "frontend".to_string())
                .into(),
            min_message_length: env::var("MIN_MESSAGE_LENGTH")
                .unwrap_or_else(|_| "20".to_string())
                .parse()
                .unwrap_or(20),
            word_vectors_path: env::var("WORD_VECTORS_PATH")
                .unwrap_or_else(|_| "models/word2vec.txt".to_string())
                .into(),
            word_vectors_url: env::var("WORD_VECTORS_URL").ok().filter(|u| !u.is_empty()),
            word_vectors_limit: env::var("WORD_VECTORS_LIMIT")
                .ok()
                .and_then(|v| v.parse().ok()),
            tsne_perplexity: env::var("TSNE_PERPLEXITY")
                .unwrap_or_else(|_| "30".to_string())
                .parse()
                .unwrap_or(30.0),
            tsne_max_iter: env::var("TSNE_MAX_ITER")
                .unwrap_or_else(|_| "1000".to_string())
                .parse()
                .unwrap_or(1000),
            tsne_seed: env::var("TSNE_SEED")
                .unwrap_or_else(|_| "42".to_string())
                .parse()
                .unwrap_or(42),
            tsne_method: env::var("TSNE_METHOD")
                .ok()
                .map(|m| m.parse())
                .transpose()?
                .unwrap_or_default(),
            min_cluster_size: env::var("MIN_CLUSTER_SIZE")
                .unwrap_or_else(|_| "15".to_string())
                .parse()
                .unwrap_or(15),
            min_samples: match env::var("MIN_SAMPLES") {
                Ok(v) if v.eq_ignore_ascii_case("none") || v.is_empty() => None,
                Ok(v) => Some(v.parse().unwrap_or(7)),
                Err(_) => Some(7),
            },
            naming: Self::load_naming(&naming_path)?,
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: env::var("PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse()
                .unwrap_or(8080),
            no_browser: env::var("NO_BROWSER")
                .map(|v| parse_flag(&v))
                .unwrap_or(false),
        })
    }

    /// Reads cluster naming overrides. A missing file means the built-in
    /// stopword list and top-3 naming; a malformed file is an error.
    pub fn load_naming(path: &str) -> anyhow::Result<NamingConfig> {
        #[derive(Deserialize)]
        struct NamingFile {
            top_words: Option<usize>,
            stopwords: Option<Vec<String>>,
            #[serde(default)]
            extra_stopwords: Vec<String>,
        }

        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(_) => {
                debug!("No naming config at {}, using defaults", path);
                return Ok(NamingConfig::default());
            }
        };

        let file: NamingFile = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Invalid naming config {}: {}", path, e))?;

        let mut naming = NamingConfig::default();
        if let Some(top_words) = file.top_words {
            if top_words == 0 {
                warn!("naming config: top_words = 0 would name every cluster \"misc\"");
            }
            naming.top_words = top_words;
        }
        if let Some(stopwords) = file.stopwords {
            naming.stopwords = stopwords.into_iter().map(|w| w.to_lowercase()).collect();
        }
        naming
            .stopwords
            .extend(file.extra_stopwords.into_iter().map(|w| w.to_lowercase()));

        Ok(naming)
    }

    pub fn tsne_params(&self) -> TsneParams {
        TsneParams {
            perplexity: self.tsne_perplexity,
            max_iter: self.tsne_max_iter,
            seed: self.tsne_seed,
            method: self.tsne_method,
            ..Default::default()
        }
    }

    pub fn hdbscan_params(&self) -> HdbscanParams {
        HdbscanParams {
            min_cluster_size: self.min_cluster_size,
            min_samples: self.min_samples,
            ..Default::default()
        }
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes")
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("exports_dir", &self.exports_dir)
            .field("output_dir", &self.output_dir)
            .field("frontend_dir", &self.frontend_dir)
            .field("min_message_length", &self.min_message_length)
            .field("word_vectors_path", &self.word_vectors_path)
            .field("word_vectors_url", &self.word_vectors_url)
            .field("word_vectors_limit", &self.word_vectors_limit)
            .field("tsne_perplexity", &self.tsne_perplexity)
            .field("tsne_max_iter", &self.tsne_max_iter)
            .field("tsne_seed", &self.tsne_seed)
            .field("tsne_method", &self.tsne_method)
            .field("min_cluster_size", &self.min_cluster_size)
            .field("min_samples", &self.min_samples)
            .field("naming_top_words", &self.naming.top_words)
            .field("naming_stopwords", &self.naming.stopwords.len())
            .field("host", &self.host)
            .field("port", &self.port)
            .field("no_browser", &self.no_browser)
            .finish()
    }
}
