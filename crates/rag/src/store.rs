use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use bytemuck::{cast_slice, pod_read_unaligned};
use rusqlite::functions::FunctionFlags;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use std::path::{Path, PathBuf};
use tokio::task;

use crate::error::IndexError;
use crate::escalation::{Escalation, EscalationStatus, NewEscalation};
use crate::model::Fragment;

/// One nearest-neighbor hit, closest first.
#[derive(Debug, Clone, PartialEq)]
pub struct Neighbor {
    pub fragment_id: String,
    pub document_id: String,
    pub domain_id: String,
    pub text: String,
    pub distance: f32,
}

/// Similarity search over indexed fragments. Implementations must apply the
/// domain filter inside the query and order by ascending L2 distance.
#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn nearest_neighbors(
        &self,
        vector: &[f32],
        domain_id: &str,
        k: usize,
    ) -> Result<Vec<Neighbor>>;
}

#[derive(Debug, Clone)]
pub struct FragmentInsert {
    pub fragment: Fragment,
    pub embedding: Vec<f32>,
}

#[derive(Clone)]
pub struct RagStore {
    path: PathBuf,
    dimensions: usize,
}

impl RagStore {
    pub fn open<P: AsRef<Path>>(path: P, dimensions: usize) -> Result<Self> {
        if dimensions == 0 {
            return Err(anyhow!("vector store dimension must be positive"));
        }
        let store = Self {
            path: path.as_ref().to_path_buf(),
            dimensions,
        };
        store.init()?;
        Ok(store)
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn connection(&self) -> Result<Connection> {
        let conn = Connection::open(&self.path)
            .with_context(|| format!("opening vector store {}", self.path.display()))?;
        register_l2_distance(&conn)?;
        Ok(conn)
    }

    pub fn init(&self) -> Result<()> {
        let conn = self.connection()?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            CREATE TABLE IF NOT EXISTS domains (
                id TEXT PRIMARY KEY,
                created_at TEXT DEFAULT CURRENT_TIMESTAMP
            );
            CREATE TABLE IF NOT EXISTS documents (
                id TEXT PRIMARY KEY,
                domain_id TEXT NOT NULL,
                created_at TEXT DEFAULT CURRENT_TIMESTAMP,
                FOREIGN KEY(domain_id) REFERENCES domains(id)
            );
            CREATE TABLE IF NOT EXISTS fragments (
                id TEXT PRIMARY KEY,
                document_id TEXT NOT NULL,
                domain_id TEXT NOT NULL,
                text TEXT NOT NULL,
                dimensions INTEGER NOT NULL,
                embedding BLOB NOT NULL,
                created_at TEXT DEFAULT CURRENT_TIMESTAMP,
                FOREIGN KEY(document_id) REFERENCES documents(id)
            );
            CREATE INDEX IF NOT EXISTS idx_fragments_domain ON fragments(domain_id);
            CREATE TABLE IF NOT EXISTS escalations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                question_text TEXT NOT NULL,
                domain_id TEXT NOT NULL,
                subject_id TEXT,
                answer_text TEXT NOT NULL,
                confidence REAL NOT NULL,
                status TEXT NOT NULL DEFAULT 'Pending',
                created_at TEXT DEFAULT CURRENT_TIMESTAMP
            );
            CREATE INDEX IF NOT EXISTS idx_escalations_status ON escalations(status);
            "#,
        )?;
        Ok(())
    }

    /// Inserts pre-chunked fragments in one transaction. A vector whose length
    /// differs from the store dimension, or an id (fragment or document) already
    /// owned by another domain, rejects the whole batch. Re-indexing an id in
    /// its own domain replaces it.
    pub fn add_fragments(&self, fragments: &[FragmentInsert]) -> Result<usize, IndexError> {
        for insert in fragments {
            if insert.embedding.len() != self.dimensions {
                return Err(IndexError::DimensionMismatch {
                    expected: self.dimensions,
                    actual: insert.embedding.len(),
                });
            }
        }
        let mut conn = self
            .connection()
            .map_err(|e| IndexError::Store(format!("{e:#}")))?;
        let tx = conn.transaction()?;
        for insert in fragments {
            let fragment = &insert.fragment;
            ensure_domain(&tx, "fragment", "fragments", &fragment.id, &fragment.domain_id)?;
            ensure_domain(
                &tx,
                "document",
                "documents",
                &fragment.source_document_id,
                &fragment.domain_id,
            )?;
            tx.execute(
                "INSERT OR IGNORE INTO domains (id) VALUES (?1)",
                params![fragment.domain_id],
            )?;
            tx.execute(
                "INSERT OR IGNORE INTO documents (id, domain_id) VALUES (?1, ?2)",
                params![fragment.source_document_id, fragment.domain_id],
            )?;
            tx.execute(
                "INSERT OR REPLACE INTO fragments (id, document_id, domain_id, text, dimensions, embedding) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    fragment.id,
                    fragment.source_document_id,
                    fragment.domain_id,
                    fragment.text,
                    self.dimensions as i64,
                    cast_slice::<f32, u8>(&insert.embedding),
                ],
            )?;
        }
        tx.commit()?;
        Ok(fragments.len())
    }

    pub fn record_escalation(&self, escalation: &NewEscalation) -> Result<Escalation> {
        let conn = self.connection()?;
        conn.execute(
            "INSERT INTO escalations (question_text, domain_id, subject_id, answer_text, confidence, status) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                escalation.question_text,
                escalation.domain_id,
                escalation.subject_id,
                escalation.answer_text,
                f64::from(escalation.confidence),
                EscalationStatus::Pending.as_str(),
            ],
        )?;
        let id = conn.last_insert_rowid();
        fetch_escalation(&conn, id)?.ok_or_else(|| anyhow!("escalation {id} vanished after insert"))
    }

    /// Oldest first, optionally restricted to one status.
    pub fn list_escalations(&self, status: Option<EscalationStatus>) -> Result<Vec<Escalation>> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {ESCALATION_COLUMNS} FROM escalations WHERE ?1 IS NULL OR status = ?1 ORDER BY id ASC"
        ))?;
        let rows = stmt.query_map([status.map(|s| s.as_str())], escalation_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Marks an escalation resolved. `None` when the id is unknown; resolving
    /// twice is harmless.
    pub fn resolve_escalation(&self, id: i64) -> Result<Option<Escalation>> {
        let conn = self.connection()?;
        conn.execute(
            "UPDATE escalations SET status = ?2 WHERE id = ?1",
            params![id, EscalationStatus::Resolved.as_str()],
        )?;
        fetch_escalation(&conn, id)
    }

    pub fn count_fragments(&self, domain_id: &str) -> Result<usize> {
        let conn = self.connection()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM fragments WHERE domain_id = ?1",
            [domain_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    pub fn search_fragments(
        &self,
        domain_id: &str,
        query_embedding: &[f32],
        k: usize,
    ) -> Result<Vec<Neighbor>> {
        if query_embedding.len() != self.dimensions {
            return Err(anyhow!(
                "query vector has {} dimensions, store expects {}",
                query_embedding.len(),
                self.dimensions
            ));
        }
        if k == 0 {
            return Ok(Vec::new());
        }
        let conn = self.connection()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT id, document_id, domain_id, text, l2_distance(embedding, ?2) AS distance
            FROM fragments
            WHERE domain_id = ?1
            ORDER BY distance ASC, rowid ASC
            LIMIT ?3
            "#,
        )?;
        let query_blob = cast_slice::<f32, u8>(query_embedding);
        let mut rows = stmt.query(params![domain_id, query_blob, k as i64])?;
        let mut hits = Vec::new();
        while let Some(row) = rows.next()? {
            hits.push(Neighbor {
                fragment_id: row.get(0)?,
                document_id: row.get(1)?,
                domain_id: row.get(2)?,
                text: row.get(3)?,
                distance: row.get::<_, f64>(4)? as f32,
            });
        }
        Ok(hits)
    }
}

#[async_trait]
impl VectorStore for RagStore {
    async fn nearest_neighbors(
        &self,
        vector: &[f32],
        domain_id: &str,
        k: usize,
    ) -> Result<Vec<Neighbor>> {
        let store = self.clone();
        let vector = vector.to_vec();
        let domain_id = domain_id.to_string();
        task::spawn_blocking(move || store.search_fragments(&domain_id, &vector, k))
            .await
            .context("vector search task failed")?
    }
}

/// Fails when `id` already exists in `table` under a different domain.
fn ensure_domain(
    tx: &Transaction<'_>,
    kind: &'static str,
    table: &str,
    id: &str,
    domain_id: &str,
) -> Result<(), IndexError> {
    let existing: Option<String> = tx
        .query_row(
            &format!("SELECT domain_id FROM {table} WHERE id = ?1"),
            [id],
            |row| row.get(0),
        )
        .optional()?;
    match existing {
        Some(existing) if existing != domain_id => Err(IndexError::DomainConflict {
            kind,
            id: id.to_string(),
            existing,
            requested: domain_id.to_string(),
        }),
        _ => Ok(()),
    }
}

const ESCALATION_COLUMNS: &str =
    "id, question_text, domain_id, subject_id, answer_text, confidence, status, created_at";

fn fetch_escalation(conn: &Connection, id: i64) -> Result<Option<Escalation>> {
    let escalation = conn
        .query_row(
            &format!("SELECT {ESCALATION_COLUMNS} FROM escalations WHERE id = ?1"),
            [id],
            escalation_from_row,
        )
        .optional()?;
    Ok(escalation)
}

fn escalation_from_row(row: &Row<'_>) -> rusqlite::Result<Escalation> {
    let status: String = row.get(6)?;
    let status = EscalationStatus::from_str(&status).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            6,
            Type::Text,
            format!("unknown escalation status {status:?}").into(),
        )
    })?;
    Ok(Escalation {
        id: row.get(0)?,
        question_text: row.get(1)?,
        domain_id: row.get(2)?,
        subject_id: row.get(3)?,
        answer_text: row.get(4)?,
        confidence: row.get::<_, f64>(5)? as f32,
        status,
        created_at: row.get(7)?,
    })
}

fn register_l2_distance(conn: &Connection) -> Result<()> {
    conn.create_scalar_function(
        "l2_distance",
        2,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| {
            let a = ctx
                .get_raw(0)
                .as_blob()
                .map_err(|e| rusqlite::Error::UserFunctionError(e.into()))?;
            let b = ctx
                .get_raw(1)
                .as_blob()
                .map_err(|e| rusqlite::Error::UserFunctionError(e.into()))?;
            l2_distance(a, b)
                .map(f64::from)
                .ok_or_else(|| rusqlite::Error::UserFunctionError("embedding length mismatch".into()))
        },
    )?;
    Ok(())
}

/// Euclidean distance between two native-endian f32 blobs. SQLite blobs carry
/// no alignment guarantee, so values are read unaligned.
fn l2_distance(a: &[u8], b: &[u8]) -> Option<f32> {
    if a.len() != b.len() || a.len() % 4 != 0 {
        return None;
    }
    let sum = a
        .chunks_exact(4)
        .zip(b.chunks_exact(4))
        .map(|(x, y)| {
            let d = pod_read_unaligned::<f32>(x) - pod_read_unaligned::<f32>(y);
            d * d
        })
        .sum::<f32>();
    Some(sum.sqrt())
}
