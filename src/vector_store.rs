//! Almacén vectorial de chunks, por colección.
//!
//! API pública:
//!   - trait `VectorStore` (drop/create/upsert/query/get/flush).
//!   - `LocalVectorStore`: SQLite en `DATABASE_DIR`, una tabla por colección.
//!   - `Neo4jVectorStore`: nodos `:Chunk` con índice vectorial nativo.

use std::cmp::Ordering;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info};

use crate::graph::{GraphQuery, GraphRow, GraphStore};
use crate::models::{ChunkMetadata, MetadataFilter, VectorDocument, VectorHit, VectorRecord};

#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn drop_collection(&self, collection: &str) -> Result<()>;
    async fn create_collection(&self, collection: &str) -> Result<()>;
    async fn collection_exists(&self, collection: &str) -> Result<bool>;
    async fn upsert(&self, collection: &str, records: Vec<VectorRecord>) -> Result<()>;
    /// Los `top_k` chunks más similares, de mayor a menor puntuación.
    async fn query(&self, collection: &str, vector: &[f64], top_k: usize) -> Result<Vec<VectorHit>>;
    async fn get(&self, collection: &str, filter: &MetadataFilter) -> Result<Vec<VectorDocument>>;
    /// Persiste lo escrito desde el último `flush`.
    async fn flush(&self, collection: &str) -> Result<()>;
}

pub fn cosine_similarity(a: &[f64], b: &[f64]) -> Option<f64> {
    if a.len() != b.len() || a.is_empty() {
        return None;
    }
    let mut dot = 0.0;
    let mut norm_a = 0.0;
    let mut norm_b = 0.0;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom <= f64::EPSILON {
        None
    } else {
        Some(dot / denom)
    }
}

// ---------------------------------------------------------------------------
// Almacén local
// ---------------------------------------------------------------------------

pub const LOCAL_DB_FILE: &str = "vectors.sqlite3";

/// Colecciones en `<root>/vectors.sqlite3`. La conexión se abre en el primer
/// uso; cada colección es una tabla `chunks_<colección>`.
pub struct LocalVectorStore {
    root: PathBuf,
    conn: Mutex<Option<Connection>>,
}

type ChunkRow = (String, String, ChunkMetadata, Vec<u8>);

impl LocalVectorStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            conn: Mutex::new(None),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Option<Connection>>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("Almacén vectorial envenenado"))
    }

    fn with_conn<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let mut guard = self.lock()?;
        if guard.is_none() {
            std::fs::create_dir_all(&self.root)?;
            let path = self.root.join(LOCAL_DB_FILE);
            let conn = Connection::open(&path)?;
            debug!("Índice local abierto en {}", path.display());
            *guard = Some(conn);
        }
        match guard.as_mut() {
            Some(conn) => f(conn),
            None => bail!("Conexión SQLite no disponible"),
        }
    }

    /// Las tablas no admiten parámetros: el nombre se limpia antes de
    /// interpolarlo.
    fn table(collection: &str) -> String {
        let clean: String = collection
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        format!("chunks_{clean}")
    }

    fn exists(conn: &Connection, collection: &str) -> Result<bool> {
        let found = conn
            .query_row(
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?1",
                params![Self::table(collection)],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn require(conn: &Connection, collection: &str) -> Result<String> {
        if !Self::exists(conn, collection)? {
            bail!("La colección '{collection}' no existe");
        }
        Ok(Self::table(collection))
    }

    fn select_chunks(conn: &Connection, sql: &str, value: Option<&str>) -> Result<Vec<ChunkRow>> {
        let mut stmt = conn.prepare(sql)?;
        let map = |row: &rusqlite::Row<'_>| -> rusqlite::Result<ChunkRow> {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                ChunkMetadata {
                    source: row.get(2)?,
                    process_id: row.get(3)?,
                    global_key: row.get(4)?,
                    category: row.get(5)?,
                    section: row.get(6)?,
                },
                row.get::<_, Vec<u8>>(7)?,
            ))
        };
        let rows = match value {
            Some(v) => stmt.query_map(params![v], map)?.collect::<rusqlite::Result<Vec<_>>>()?,
            None => stmt.query_map([], map)?.collect::<rusqlite::Result<Vec<_>>>()?,
        };
        Ok(rows)
    }
}

const CHUNK_SELECT: &str =
    "SELECT id, text, source, process_id, global_key, category, section, embedding";

fn encode_embedding(embedding: &[f64]) -> Vec<u8> {
    embedding.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn decode_embedding(blob: &[u8]) -> Result<Vec<f64>> {
    if blob.len() % 8 != 0 {
        bail!("Embedding corrupto: {} bytes", blob.len());
    }
    Ok(blob
        .chunks_exact(8)
        .map(|chunk| {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(chunk);
            f64::from_le_bytes(bytes)
        })
        .collect())
}

#[async_trait]
impl VectorStore for LocalVectorStore {
    async fn drop_collection(&self, collection: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute_batch(&format!("DROP TABLE IF EXISTS \"{}\"", Self::table(collection)))?;
            Ok(())
        })
    }

    /// Deja la colección vacía, exista o no.
    async fn create_collection(&self, collection: &str) -> Result<()> {
        let table = Self::table(collection);
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            tx.execute_batch(&format!(
                "DROP TABLE IF EXISTS \"{table}\";
                 CREATE TABLE \"{table}\" (
                     id          TEXT PRIMARY KEY,
                     text        TEXT NOT NULL,
                     source      TEXT NOT NULL,
                     process_id  TEXT,
                     global_key  TEXT,
                     category    TEXT NOT NULL,
                     section     TEXT,
                     dimension   INTEGER NOT NULL,
                     embedding   BLOB NOT NULL
                 );"
            ))?;
            tx.commit()?;
            Ok(())
        })
    }

    async fn collection_exists(&self, collection: &str) -> Result<bool> {
        self.with_conn(|conn| Self::exists(conn, collection))
    }

    async fn upsert(&self, collection: &str, records: Vec<VectorRecord>) -> Result<()> {
        self.with_conn(|conn| {
            let table = Self::require(conn, collection)?;
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare(&format!(
                    "INSERT INTO \"{table}\" (
                         id, text, source, process_id, global_key, category, section,
                         dimension, embedding
                     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                     ON CONFLICT(id) DO UPDATE SET
                         text = excluded.text,
                         source = excluded.source,
                         process_id = excluded.process_id,
                         global_key = excluded.global_key,
                         category = excluded.category,
                         section = excluded.section,
                         dimension = excluded.dimension,
                         embedding = excluded.embedding"
                ))?;
                for record in &records {
                    let meta = &record.metadata;
                    stmt.execute(params![
                        record.id,
                        record.text,
                        meta.source,
                        meta.process_id,
                        meta.global_key,
                        meta.category,
                        meta.section,
                        record.embedding.len() as i64,
                        encode_embedding(&record.embedding),
                    ])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
    }

    async fn query(&self, collection: &str, vector: &[f64], top_k: usize) -> Result<Vec<VectorHit>> {
        let rows = self.with_conn(|conn| {
            let table = Self::require(conn, collection)?;
            Self::select_chunks(
                conn,
                &format!("{CHUNK_SELECT} FROM \"{table}\" WHERE dimension = {} ORDER BY id", vector.len()),
                None,
            )
        })?;

        let mut hits = Vec::with_capacity(rows.len());
        for (id, text, metadata, blob) in rows {
            let embedding = decode_embedding(&blob)?;
            if let Some(score) = cosine_similarity(vector, &embedding) {
                hits.push(VectorHit {
                    id,
                    score,
                    text,
                    metadata,
                });
            }
        }
        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
        hits.truncate(top_k);
        Ok(hits)
    }

    async fn get(&self, collection: &str, filter: &MetadataFilter) -> Result<Vec<VectorDocument>> {
        let rows = self.with_conn(|conn| {
            let table = Self::require(conn, collection)?;
            Self::select_chunks(
                conn,
                &format!(
                    "{CHUNK_SELECT} FROM \"{table}\" WHERE {} = ?1 ORDER BY id",
                    filter.field.property()
                ),
                Some(filter.value.as_str()),
            )
        })?;
        Ok(rows
            .into_iter()
            .map(|(id, text, metadata, _)| VectorDocument { id, text, metadata })
            .collect())
    }

    /// Cada `upsert` ya confirma su transacción; sólo se comprueba que la
    /// colección exista.
    async fn flush(&self, collection: &str) -> Result<()> {
        self.with_conn(|conn| Self::require(conn, collection).map(|_| ()))
    }
}

// ---------------------------------------------------------------------------
// Neo4j
// ---------------------------------------------------------------------------

/// Chunks como nodos `:Chunk:<colección>` con un índice vectorial por
/// colección.
pub struct Neo4jVectorStore {
    graph: Arc<dyn GraphStore>,
    dimensions: usize,
}

impl Neo4jVectorStore {
    pub fn new(graph: Arc<dyn GraphStore>, dimensions: usize) -> Self {
        Self { graph, dimensions }
    }

    /// Las etiquetas no admiten parámetros: se limpian antes de interpolar.
    fn label(collection: &str) -> String {
        collection
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
            .collect()
    }

    fn index_name(collection: &str) -> String {
        format!("{}_embedding_idx", Self::label(collection))
    }
}

const CHUNK_PROJECTION: &str = "c.id AS id, c.text AS text, c.source AS source,
     c.process_id AS process_id, c.global_key AS global_key,
     c.category AS category, c.section AS section";
const CHUNK_COLUMNS: [&str; 7] = [
    "id",
    "text",
    "source",
    "process_id",
    "global_key",
    "category",
    "section",
];

fn optional(row: &GraphRow, key: &str) -> Option<String> {
    row.str(key).filter(|s| !s.is_empty()).map(str::to_string)
}

fn metadata_from_row(row: &GraphRow) -> ChunkMetadata {
    ChunkMetadata {
        source: row.str("source").unwrap_or_default().to_string(),
        process_id: optional(row, "process_id"),
        global_key: optional(row, "global_key"),
        category: row.str("category").unwrap_or_default().to_string(),
        section: optional(row, "section"),
    }
}

#[async_trait]
impl VectorStore for Neo4jVectorStore {
    async fn drop_collection(&self, collection: &str) -> Result<()> {
        let label = Self::label(collection);
        self.graph
            .run(GraphQuery::new(format!("MATCH (c:Chunk:`{label}`) DETACH DELETE c")))
            .await?;
        self.graph
            .run(GraphQuery::new(format!(
                "DROP INDEX {} IF EXISTS",
                Self::index_name(collection)
            )))
            .await?;
        Ok(())
    }

    async fn create_collection(&self, collection: &str) -> Result<()> {
        let cypher = format!(
            "\
CREATE VECTOR INDEX {index_name} IF NOT EXISTS
FOR (c:`{label}`)
ON (c.embedding)
OPTIONS {{
  indexConfig: {{
    `vector.dimensions`: {dimensions},
    `vector.similarity_function`: 'cosine'
  }}
}}",
            index_name = Self::index_name(collection),
            label = Self::label(collection),
            dimensions = self.dimensions,
        );
        self.graph.run(GraphQuery::new(cypher)).await?;
        info!("Índice vectorial '{}' creado.", Self::index_name(collection));
        Ok(())
    }

    async fn collection_exists(&self, collection: &str) -> Result<bool> {
        let rows = self
            .graph
            .execute(
                GraphQuery::new("SHOW VECTOR INDEXES YIELD name WHERE name = $name RETURN name")
                    .param("name", Self::index_name(collection))
                    .returns(&["name"]),
            )
            .await?;
        Ok(!rows.is_empty())
    }

    async fn upsert(&self, collection: &str, records: Vec<VectorRecord>) -> Result<()> {
        let cypher = format!(
            "MERGE (c:Chunk:`{}` {{id: $id}})
             SET c.text = $text, c.embedding = $embedding, c.source = $source,
                 c.process_id = $process_id, c.global_key = $global_key,
                 c.category = $category, c.section = $section",
            Self::label(collection)
        );
        for record in records {
            let meta = record.metadata;
            self.graph
                .run(
                    GraphQuery::new(cypher.as_str())
                        .param("id", record.id)
                        .param("text", record.text)
                        .param("embedding", record.embedding)
                        .param("source", meta.source)
                        .param("process_id", meta.process_id.unwrap_or_default())
                        .param("global_key", meta.global_key.unwrap_or_default())
                        .param("category", meta.category)
                        .param("section", meta.section.unwrap_or_default()),
                )
                .await?;
        }
        Ok(())
    }

    async fn query(&self, collection: &str, vector: &[f64], top_k: usize) -> Result<Vec<VectorHit>> {
        let rows = self
            .graph
            .execute(
                GraphQuery::new(format!(
                    "CALL db.index.vector.queryNodes($index_name, $k, $embedding)
                     YIELD node AS c, score
                     RETURN score, {CHUNK_PROJECTION}
                     ORDER BY score DESC"
                ))
                .param("index_name", Self::index_name(collection))
                .param("k", top_k as i64)
                .param("embedding", vector.to_vec())
                .returns(&[
                    "score",
                    "id",
                    "text",
                    "source",
                    "process_id",
                    "global_key",
                    "category",
                    "section",
                ]),
            )
            .await?;

        Ok(rows
            .iter()
            .map(|row| VectorHit {
                id: row.str("id").unwrap_or_default().to_string(),
                score: row.float("score").unwrap_or(0.0),
                text: row.str("text").unwrap_or_default().to_string(),
                metadata: metadata_from_row(row),
            })
            .collect())
    }

    async fn get(&self, collection: &str, filter: &MetadataFilter) -> Result<Vec<VectorDocument>> {
        let rows = self
            .graph
            .execute(
                GraphQuery::new(format!(
                    "MATCH (c:Chunk:`{}`) WHERE c[$field] = $value
                     RETURN {CHUNK_PROJECTION}
                     ORDER BY c.id",
                    Self::label(collection)
                ))
                .param("field", filter.field.property())
                .param("value", filter.value.as_str())
                .returns(&CHUNK_COLUMNS),
            )
            .await?;

        Ok(rows
            .iter()
            .map(|row| VectorDocument {
                id: row.str("id").unwrap_or_default().to_string(),
                text: row.str("text").unwrap_or_default().to_string(),
                metadata: metadata_from_row(row),
            })
            .collect())
    }

    async fn flush(&self, _collection: &str) -> Result<()> {
        // Neo4j persiste cada escritura.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MetadataField;

    fn record(id: &str, embedding: Vec<f64>, global_key: &str) -> VectorRecord {
        VectorRecord {
            id: id.to_string(),
            embedding,
            text: format!("texto {id}"),
            metadata: ChunkMetadata {
                source: format!("{global_key}.md"),
                process_id: global_key.split('_').next().map(str::to_string),
                global_key: Some(global_key.to_string()),
                category: "BP".to_string(),
                section: Some("기본정보".to_string()),
            },
        }
    }

    #[test]
    fn cosine_handles_degenerate_vectors() {
        assert_eq!(cosine_similarity(&[], &[]), None);
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[1.0]), None);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), None);
        let s = cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]).unwrap();
        assert!((s - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn local_store_queries_by_similarity_and_filters() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalVectorStore::new(dir.path());
        store.create_collection("process_collection").await.unwrap();
        store
            .upsert(
                "process_collection",
                vec![
                    record("a.md_0", vec![1.0, 0.0], "1_재고"),
                    record("b.md_0", vec![0.0, 1.0], "2_출하"),
                ],
            )
            .await
            .unwrap();

        let hits = store
            .query("process_collection", &[0.9, 0.1], 1)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "a.md_0");

        let docs = store
            .get(
                "process_collection",
                &MetadataFilter::new(MetadataField::ProcessId, "2"),
            )
            .await
            .unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].metadata.global_key.as_deref(), Some("2_출하"));
    }

    #[tokio::test]
    async fn local_store_persists_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = LocalVectorStore::new(dir.path());
            store.create_collection("c").await.unwrap();
            store
                .upsert("c", vec![record("x_0", vec![1.0], "1_재고")])
                .await
                .unwrap();
            // Mismo id: se reemplaza, no se duplica.
            store
                .upsert("c", vec![record("x_0", vec![1.0], "1_재고")])
                .await
                .unwrap();
            store.flush("c").await.unwrap();
        }
        let reopened = LocalVectorStore::new(dir.path());
        assert!(reopened.collection_exists("c").await.unwrap());
        let docs = reopened
            .get("c", &MetadataFilter::new(MetadataField::GlobalKey, "1_재고"))
            .await
            .unwrap();
        assert_eq!(docs.len(), 1);

        assert!(dir.path().join(LOCAL_DB_FILE).exists());

        reopened.drop_collection("c").await.unwrap();
        assert!(!reopened.collection_exists("c").await.unwrap());
        assert!(reopened.query("c", &[1.0], 3).await.is_err());
        assert!(reopened
            .upsert("c", vec![record("y_0", vec![1.0], "1_재고")])
            .await
            .is_err());
    }

    #[tokio::test]
    async fn upsert_replaces_in_place_and_skips_other_dimensions() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalVectorStore::new(dir.path());
        store.create_collection("process-collection").await.unwrap();
        let mut updated = record("a_0", vec![0.0, 1.0], "1_재고");
        updated.text = "actualizado".into();
        store
            .upsert(
                "process-collection",
                vec![
                    record("a_0", vec![1.0, 0.0], "1_재고"),
                    updated,
                    record("b_0", vec![1.0, 0.0, 0.0], "2_출하"),
                ],
            )
            .await
            .unwrap();

        let hits = store
            .query("process-collection", &[0.0, 1.0], 5)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].text, "actualizado");
        assert!((hits[0].score - 1.0).abs() < 1e-9);

        // Recrear deja la colección vacía.
        store.create_collection("process-collection").await.unwrap();
        assert!(store
            .query("process-collection", &[0.0, 1.0], 5)
            .await
            .unwrap()
            .is_empty());
    }

    #[test]
    fn embeddings_survive_blob_encoding() {
        let v = vec![0.25, -1.5, 3.0e-7];
        assert_eq!(decode_embedding(&encode_embedding(&v)).unwrap(), v);
        assert!(decode_embedding(&[0u8; 5]).is_err());
        assert_eq!(LocalVectorStore::table("process-db"), "chunks_process_db");
    }

    #[test]
    fn neo4j_labels_are_sanitised() {
        assert_eq!(Neo4jVectorStore::label("process`) DETACH"), "processDETACH");
        assert_eq!(
            Neo4jVectorStore::index_name("process_collection"),
            "process_collection_embedding_idx"
        );
    }
}
