pub mod vectors;

use crate::artifacts::{self, Artifacts};
use crate::model::MessageRecord;
use crate::npy::{self, Matrix};
use std::time::Instant;
use tracing::info;

pub use vectors::WordVectors;

const PROGRESS_EVERY: usize = 10_000;

/// Maps text to a fixed-length vector. `None` means the text carries nothing
/// the embedder recognizes.
pub trait TextEmbedder {
    fn dimension(&self) -> usize;
    fn embed(&self, text: &str) -> Option<Vec<f32>>;
}

impl TextEmbedder for WordVectors {
    fn dimension(&self) -> usize {
        self.dim()
    }

    fn embed(&self, text: &str) -> Option<Vec<f32>> {
        self.average(text)
    }
}

pub struct EmbeddedMessages {
    pub embeddings: Matrix,
    pub messages: Vec<MessageRecord>,
}

/// Embeds every message, dropping the ones the embedder returns nothing for.
pub fn embed_messages<E: TextEmbedder>(
    embedder: &E,
    messages: Vec<MessageRecord>,
) -> anyhow::Result<EmbeddedMessages> {
    let total = messages.len();
    let start = Instant::now();
    let mut rows = Vec::new();
    let mut kept = Vec::new();

    for (i, msg) in messages.into_iter().enumerate() {
        if let Some(embedding) = embedder.embed(&msg.content) {
            rows.push(embedding);
            kept.push(msg);
        }

        if (i + 1) % PROGRESS_EVERY == 0 {
            let elapsed = start.elapsed().as_secs_f64();
            let rate = (i + 1) as f64 / elapsed.max(f64::EPSILON);
            let remaining = (total - i - 1) as f64 / rate;
            info!(
                "  {}/{} processed... ({:.0}/sec, ~{:.0}s remaining)",
                i + 1,
                total,
                rate,
                remaining
            );
        }
    }

    let mut embeddings = Matrix::from_rows(&rows)?;
    if embeddings.rows == 0 {
        embeddings.cols = embedder.dimension();
    }

    info!(
        "Generated {} embeddings in {}",
        embeddings.rows,
        humantime::format_duration(std::time::Duration::from_millis(
            start.elapsed().as_millis() as u64
        ))
    );

    Ok(EmbeddedMessages {
        embeddings,
        messages: kept,
    })
}

/// Runs the embed stage: `messages_raw.json` in, `embeddings.npy` and
/// `messages_with_embeddings.json` out.
pub fn run<E: TextEmbedder>(embedder: &E, out: &Artifacts) -> anyhow::Result<usize> {
    let messages: Vec<MessageRecord> = artifacts::read_json(&out.path(artifacts::MESSAGES_RAW))?;
    info!("Processing {} messages...", messages.len());

    let embedded = embed_messages(embedder, messages)?;

    npy::write_matrix(&out.path(artifacts::EMBEDDINGS), &embedded.embeddings)?;
    artifacts::write_json(
        &out.path(artifacts::MESSAGES_WITH_EMBEDDINGS),
        &embedded.messages,
    )?;

    info!(
        "Saved {} messages with embeddings, shape ({}, {})",
        embedded.messages.len(),
        embedded.embeddings.rows,
        embedded.embeddings.cols
    );
    Ok(embedded.messages.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, content: &str) -> MessageRecord {
        MessageRecord {
            id: id.to_string(),
            channel: None,
            channel_name: "general".to_string(),
            guild_id: None,
            guild_name: "Guild".to_string(),
            author: "ana".to_string(),
            content: content.to_string(),
            timestamp: None,
            x: None,
            y: None,
            cluster: None,
            cluster_name: None,
        }
    }

    #[test]
    fn test_messages_without_known_words_are_dropped() {
        let table = "deploy 1 0\nservice 0 1\n";
        let vectors = WordVectors::read_text(table.as_bytes(), None).unwrap();

        let embedded = embed_messages(
            &vectors,
            vec![
                record("1", "deploy the service"),
                record("2", "zzz qqq"),
                record("3", "service service"),
            ],
        )
        .unwrap();

        assert_eq!(embedded.messages.len(), 2);
        assert_eq!(embedded.messages[1].id, "3");
        assert_eq!(embedded.embeddings.rows, 2);
        assert_eq!(embedded.embeddings.row(0), &[0.5, 0.5]);
        assert_eq!(embedded.embeddings.row(1), &[0.0, 1.0]);
    }

    #[test]
    fn test_no_embeddings_keeps_dimension() {
        let vectors = WordVectors::read_text("a 1 2 3\n".as_bytes(), None).unwrap();
        let embedded = embed_messages(&vectors, vec![record("1", "nothing")]).unwrap();
        assert_eq!(embedded.embeddings.rows, 0);
        assert_eq!(embedded.embeddings.cols, 3);
    }
}
