use anyhow::{anyhow, Context, Result};
use std::io::BufRead;
use tracing::info;

use crate::embedding::Embedder;
use crate::error::IndexError;
use crate::model::Fragment;
use crate::store::{FragmentInsert, RagStore};

/// Embeds already-chunked fragments and writes them to the store in one
/// transaction. Any embedding failure aborts the batch; nothing is written
/// with a placeholder vector.
pub async fn index_fragments(
    store: &RagStore,
    embedder: &dyn Embedder,
    fragments: Vec<Fragment>,
) -> Result<usize, IndexError> {
    for fragment in &fragments {
        validate_fragment(fragment).map_err(|e| IndexError::InvalidFragment(e.to_string()))?;
    }
    let mut inserts = Vec::with_capacity(fragments.len());
    for fragment in fragments {
        let embedding = embedder.embed(&fragment.text).await.map_err(|e| {
            IndexError::EmbeddingUnavailable(format!("fragment {}: {e:#}", fragment.id))
        })?;
        if embedding.len() != store.dimensions() {
            return Err(IndexError::DimensionMismatch {
                expected: store.dimensions(),
                actual: embedding.len(),
            });
        }
        inserts.push(FragmentInsert {
            fragment,
            embedding,
        });
    }
    let store_ref = store.clone();
    let written = tokio::task::spawn_blocking(move || store_ref.add_fragments(&inserts))
        .await
        .map_err(|e| IndexError::Store(format!("index task failed: {e}")))??;
    info!(fragments = written, "indexed fragments");
    Ok(written)
}

/// One fragment per line. `domain_id` may be omitted when a default is
/// given; a line that names another domain than the default is rejected.
pub fn read_fragments_jsonl<R: BufRead>(
    reader: R,
    default_domain: Option<&str>,
) -> Result<Vec<Fragment>> {
    let mut out = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record: FragmentLine = serde_json::from_str(&line)
            .with_context(|| format!("line {}: invalid fragment record", idx + 1))?;
        let domain_id = match (record.domain_id, default_domain) {
            (Some(own), Some(default)) if own != default => {
                return Err(anyhow!(
                    "line {}: fragment {} belongs to domain {own}, expected {default}",
                    idx + 1,
                    record.id
                ))
            }
            (Some(own), _) => own,
            (None, Some(default)) => default.to_string(),
            (None, None) => {
                return Err(anyhow!("line {}: fragment {} has no domain", idx + 1, record.id))
            }
        };
        out.push(Fragment {
            id: record.id,
            text: record.text,
            source_document_id: record.source_document_id,
            domain_id,
        });
    }
    Ok(out)
}

fn validate_fragment(fragment: &Fragment) -> Result<()> {
    if fragment.id.trim().is_empty() {
        return Err(anyhow!("fragment id must not be empty"));
    }
    if fragment.domain_id.trim().is_empty() {
        return Err(anyhow!("fragment {} has an empty domain id", fragment.id));
    }
    if fragment.text.trim().is_empty() {
        return Err(anyhow!("fragment {} has no text", fragment.id));
    }
    Ok(())
}

#[derive(serde::Deserialize)]
struct FragmentLine {
    id: String,
    text: String,
    source_document_id: String,
    domain_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::EmbeddingClient;
    use std::io::Cursor;

    #[test]
    fn jsonl_fills_default_domain() {
        let input = r#"{"id":"f1","text":"alpha","source_document_id":"doc1"}

{"id":"f2","text":"beta","source_document_id":"doc1","domain_id":"hr"}
"#;
        let fragments = read_fragments_jsonl(Cursor::new(input), Some("hr")).unwrap();
        assert_eq!(fragments.len(), 2);
        assert!(fragments.iter().all(|f| f.domain_id == "hr"));
    }

    #[test]
    fn jsonl_rejects_conflicting_domain() {
        let input = r#"{"id":"f1","text":"alpha","source_document_id":"doc1","domain_id":"it"}"#;
        let err = read_fragments_jsonl(Cursor::new(input), Some("hr")).unwrap_err();
        assert!(err.to_string().contains("belongs to domain it"));
    }

    #[test]
    fn jsonl_requires_some_domain() {
        let input = r#"{"id":"f1","text":"alpha","source_document_id":"doc1"}"#;
        assert!(read_fragments_jsonl(Cursor::new(input), None).is_err());
    }

    #[tokio::test]
    async fn indexing_embeds_and_stores() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = RagStore::open(dir.path().join("idx.sqlite"), 32).unwrap();
        let embedder = EmbeddingClient::hash(32);
        let fragments = vec![Fragment {
            id: "f1".to_string(),
            text: "Annual leave is 20 days".to_string(),
            source_document_id: "handbook".to_string(),
            domain_id: "hr".to_string(),
        }];
        assert_eq!(index_fragments(&store, &embedder, fragments).await.unwrap(), 1);
        assert_eq!(store.count_fragments("hr").unwrap(), 1);
    }

    #[tokio::test]
    async fn empty_text_is_rejected_before_embedding() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = RagStore::open(dir.path().join("idx.sqlite"), 8).unwrap();
        let fragments = vec![Fragment {
            id: "f1".to_string(),
            text: "  ".to_string(),
            source_document_id: "d".to_string(),
            domain_id: "hr".to_string(),
        }];
        let err = index_fragments(&store, &EmbeddingClient::hash(8), fragments)
            .await
            .unwrap_err();
        assert!(matches!(err, IndexError::InvalidFragment(_)));
        assert_eq!(store.count_fragments("hr").unwrap(), 0);
    }

    #[tokio::test]
    async fn embedder_outage_is_not_a_caller_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = RagStore::open(dir.path().join("idx.sqlite"), 8).unwrap();
        let embedder = EmbeddingClient::ollama(
            "http://127.0.0.1:9",
            "nomic-embed-text",
            8,
            std::time::Duration::from_secs(2),
        )
        .unwrap();
        let fragments = vec![Fragment {
            id: "f1".to_string(),
            text: "Annual leave is 20 days".to_string(),
            source_document_id: "handbook".to_string(),
            domain_id: "hr".to_string(),
        }];
        let err = index_fragments(&store, &embedder, fragments).await.unwrap_err();
        assert!(matches!(err, IndexError::EmbeddingUnavailable(_)));
        assert!(!err.is_caller_error());
        assert_eq!(store.count_fragments("hr").unwrap(), 0);
    }

    #[tokio::test]
    async fn embedder_of_the_wrong_width_is_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = RagStore::open(dir.path().join("idx.sqlite"), 8).unwrap();
        let fragments = vec![Fragment {
            id: "f1".to_string(),
            text: "Annual leave is 20 days".to_string(),
            source_document_id: "handbook".to_string(),
            domain_id: "hr".to_string(),
        }];
        let err = index_fragments(&store, &EmbeddingClient::hash(16), fragments)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            IndexError::DimensionMismatch {
                expected: 8,
                actual: 16
            }
        ));
    }
}
