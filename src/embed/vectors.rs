use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

pub type Result<T> = std::result::Result<T, VectorsError>;

#[derive(Error, Debug)]
pub enum VectorsError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed header: {0}")]
    BadHeader(String),

    #[error("Line {line}: {reason}")]
    BadLine { line: usize, reason: String },

    #[error("Invalid vector dimension for '{word}': expected {expected}, got {actual}")]
    InvalidDimension {
        word: String,
        expected: usize,
        actual: usize,
    },

    #[error("Download failed: {0}")]
    Download(#[from] reqwest::Error),

    #[error("Word vector table is empty")]
    Empty,
}

/// Word -> dense vector lookup table.
pub struct WordVectors {
    dim: usize,
    index: HashMap<String, usize>,
    data: Vec<f32>,
}

impl std::fmt::Debug for WordVectors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WordVectors")
            .field("dim", &self.dim)
            .field("words", &self.index.len())
            .finish()
    }
}

impl WordVectors {
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            index: HashMap::new(),
            data: Vec::new(),
        }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Adds `word`. The first occurrence of a word wins, as in gensim.
    pub fn insert(&mut self, word: &str, vector: &[f32]) -> Result<()> {
        if vector.len() != self.dim {
            return Err(VectorsError::InvalidDimension {
                word: word.to_string(),
                expected: self.dim,
                actual: vector.len(),
            });
        }
        if self.index.contains_key(word) {
            return Ok(());
        }
        self.index.insert(word.to_string(), self.index.len());
        self.data.extend_from_slice(vector);
        Ok(())
    }

    pub fn get(&self, word: &str) -> Option<&[f32]> {
        self.index
            .get(word)
            .map(|&i| &self.data[i * self.dim..(i + 1) * self.dim])
    }

    /// Loads `path`, choosing the binary reader for `.bin` files.
    pub fn load(path: &Path, limit: Option<usize>) -> Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        let vectors = if path.extension().is_some_and(|e| e == "bin") {
            Self::read_binary(reader, limit)?
        } else {
            Self::read_text(reader, limit)?
        };

        if vectors.is_empty() {
            return Err(VectorsError::Empty);
        }
        info!(
            "Loaded {} word vectors ({} dimensions) from {}",
            vectors.len(),
            vectors.dim,
            path.display()
        );
        Ok(vectors)
    }

    /// Reads the word2vec text format. The `<count> <dim>` header line is
    /// optional, so GloVe-style files load too.
    pub fn read_text<R: BufRead>(reader: R, limit: Option<usize>) -> Result<Self> {
        let mut vectors: Option<WordVectors> = None;

        for (i, line) in reader.lines().enumerate() {
            let line = line?;
            let line_no = i + 1;
            if limit.is_some_and(|l| vectors.as_ref().is_some_and(|v| v.len() >= l)) {
                break;
            }

            let mut parts = line.split_whitespace();
            let Some(word) = parts.next() else {
                continue;
            };
            let values: Vec<&str> = parts.collect();

            if i == 0 && values.len() == 1 {
                if let (Ok(_count), Ok(dim)) = (word.parse::<usize>(), values[0].parse::<usize>()) {
                    debug!("word2vec header: {} dimensions", dim);
                    vectors = Some(WordVectors::new(dim));
                    continue;
                }
            }

            let vector = values
                .iter()
                .map(|v| v.parse::<f32>())
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| VectorsError::BadLine {
                    line: line_no,
                    reason: e.to_string(),
                })?;

            vectors
                .get_or_insert_with(|| WordVectors::new(vector.len()))
                .insert(word, &vector)?;
        }

        Ok(vectors.unwrap_or_else(|| WordVectors::new(0)))
    }

    /// Reads the word2vec binary format: a text header line, then per entry the
    /// word, a space, and `dim` little-endian `f32`s.
    pub fn read_binary<R: BufRead>(mut reader: R, limit: Option<usize>) -> Result<Self> {
        let mut header = String::new();
        reader.read_line(&mut header)?;
        let mut fields = header.split_whitespace().map(str::parse::<usize>);
        let (count, dim) = match (fields.next(), fields.next()) {
            (Some(Ok(count)), Some(Ok(dim))) => (count, dim),
            _ => return Err(VectorsError::BadHeader(header.trim().to_string())),
        };

        let wanted = limit.map_or(count, |l| l.min(count));
        let mut vectors = WordVectors::new(dim);
        let mut word = Vec::new();
        let mut raw = vec![0u8; dim * 4];
        let mut vector = vec![0f32; dim];

        for entry in 0..wanted {
            word.clear();
            reader.read_until(b' ', &mut word)?;
            if word.last() != Some(&b' ') {
                return Err(VectorsError::BadLine {
                    line: entry + 2,
                    reason: "unexpected end of file".to_string(),
                });
            }
            word.pop();
            // Entries may be separated by a newline
            let text = String::from_utf8_lossy(&word);
            let text = text.trim_start_matches('\n');

            reader.read_exact(&mut raw)?;
            for (v, bytes) in vector.iter_mut().zip(raw.chunks_exact(4)) {
                *v = f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
            }
            vectors.insert(text, &vector)?;
        }

        Ok(vectors)
    }

    /// Mean of the vectors of the lowercased whitespace tokens found in the
    /// table, or `None` when no token is known.
    pub fn average(&self, text: &str) -> Option<Vec<f32>> {
        let mut sum = vec![0f64; self.dim];
        let mut found = 0usize;

        for token in text.to_lowercase().split_whitespace() {
            if let Some(vector) = self.get(token) {
                for (acc, v) in sum.iter_mut().zip(vector) {
                    *acc += f64::from(*v);
                }
                found += 1;
            }
        }

        if found == 0 {
            return None;
        }
        Some(sum.into_iter().map(|s| (s / found as f64) as f32).collect())
    }
}

/// Fetches `url` into `path` unless the file already exists.
pub async fn ensure_downloaded(url: &str, path: &Path) -> Result<()> {
    if path.exists() {
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    info!("Downloading word vectors from {} (first run only)...", url);
    let mut response = reqwest::get(url).await?.error_for_status()?;

    let partial = path.with_extension("partial");
    let mut file = tokio::fs::File::create(&partial).await?;
    let mut written: u64 = 0;
    while let Some(chunk) = response.chunk().await? {
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    file.flush().await?;
    tokio::fs::rename(&partial, path).await?;

    info!("Downloaded {} bytes to {}", written, path.display());
    Ok(())
}
