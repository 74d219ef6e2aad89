//! Reconstrucción completa del conocimiento: documentos de proceso → grafo
//! Process/Attribute en Neo4j + índice vectorial por secciones, y manuales →
//! índice vectorial por ventanas de texto.

use std::{
    fmt,
    fs,
    path::{Path, PathBuf},
    str::FromStr,
    sync::{Arc, Mutex},
};

use anyhow::Result;
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, warn};
use walkdir::WalkDir;

use crate::{
    app_state::{KnowledgeContext, Status},
    config::AppConfig,
    graph::{GraphQuery, GraphStore},
    llm::EmbeddingService,
    models::{ChunkMetadata, ParsedDocument, ProcessNode, VectorRecord},
    parser::{self, MANUAL_CHUNK_OVERLAP, MANUAL_CHUNK_SIZE},
    vector_store::VectorStore,
};

const MANUAL_CATEGORY: &str = "Manual";

/// Parámetros de una reconstrucción.
#[derive(Debug, Clone)]
pub struct BuildParams {
    pub source_folder: PathBuf,
    pub collection: String,
    pub file_extension: String,
    /// `true`: documentos de proceso (parser + grafo). `false`: manuales.
    pub structured: bool,
    pub limit: Option<usize>,
}

/// Resumen de los resultados de una reconstrucción.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct BuildSummary {
    pub files_scanned: usize,
    pub files_ingested: usize,
    pub files_failed: usize,
    pub total_chunks: usize,
}

impl fmt::Display for BuildSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ficheros escaneados, {} ingeridos, {} con error. {} chunks en total.",
            self.files_scanned, self.files_ingested, self.files_failed, self.total_chunks
        )
    }
}

/// Qué parte del conocimiento se reconstruye.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RebuildTarget {
    Process,
    Project,
    All,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("objetivo de reconstrucción desconocido: '{0}' (process | project | all)")]
pub struct UnknownRebuildTarget(pub String);

impl FromStr for RebuildTarget {
    type Err = UnknownRebuildTarget;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "process" => Ok(Self::Process),
            "project" => Ok(Self::Project),
            "all" | "" => Ok(Self::All),
            other => Err(UnknownRebuildTarget(other.to_string())),
        }
    }
}

impl RebuildTarget {
    pub fn includes_process(&self) -> bool {
        matches!(self, Self::Process | Self::All)
    }

    pub fn includes_project(&self) -> bool {
        matches!(self, Self::Project | Self::All)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Process => "process",
            Self::Project => "project",
            Self::All => "all",
        }
    }
}

/// Resultado de `rebuild_knowledge`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BuildStatus {
    pub target: RebuildTarget,
    pub process: Option<BuildSummary>,
    pub project: Option<BuildSummary>,
    pub indexed_files: usize,
}

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DB Build Complete ({})", self.target.as_str())?;
        if let Some(s) = &self.process {
            write!(f, " | process: {s}")?;
        }
        if let Some(s) = &self.project {
            write!(f, " | project: {s}")?;
        }
        Ok(())
    }
}

/// Carpetas y colecciones de cada tipo de conocimiento.
#[derive(Debug, Clone)]
pub struct BuildLayout {
    pub markdown_dir: PathBuf,
    pub manual_dir: PathBuf,
    pub process_collection: String,
    pub project_collection: String,
    pub manual_extension: String,
}

impl BuildLayout {
    pub fn from_config(cfg: &AppConfig) -> Self {
        Self {
            markdown_dir: cfg.markdown_dir(),
            manual_dir: cfg.manual_dir(),
            process_collection: cfg.process_collection.clone(),
            project_collection: cfg.project_collection.clone(),
            manual_extension: cfg.manual_extension.clone(),
        }
    }
}

pub struct KnowledgeBuilder {
    embedder: Arc<dyn EmbeddingService>,
    vectors: Arc<dyn VectorStore>,
    graph: Option<Arc<dyn GraphStore>>,
    layout: BuildLayout,
}

impl KnowledgeBuilder {
    pub fn new(
        embedder: Arc<dyn EmbeddingService>,
        vectors: Arc<dyn VectorStore>,
        graph: Option<Arc<dyn GraphStore>>,
        layout: BuildLayout,
    ) -> Self {
        Self {
            embedder,
            vectors,
            graph,
            layout,
        }
    }

    pub async fn build_process_db(
        &self,
        limit: Option<usize>,
        status: Option<&Mutex<Status>>,
    ) -> Result<BuildSummary> {
        let params = BuildParams {
            source_folder: self.layout.markdown_dir.clone(),
            collection: self.layout.process_collection.clone(),
            file_extension: ".md".to_string(),
            structured: true,
            limit,
        };
        self.build_graph(&params, status).await
    }

    pub async fn build_project_db(
        &self,
        limit: Option<usize>,
        status: Option<&Mutex<Status>>,
    ) -> Result<BuildSummary> {
        let params = BuildParams {
            source_folder: self.layout.manual_dir.clone(),
            collection: self.layout.project_collection.clone(),
            file_extension: self.layout.manual_extension.clone(),
            structured: false,
            limit,
        };
        self.build_graph(&params, status).await
    }

    /// Reconstruye lo pedido y refresca las cachés del contexto.
    pub async fn rebuild_knowledge(
        &self,
        knowledge: &KnowledgeContext,
        target: RebuildTarget,
        limit: Option<usize>,
        status: Option<&Mutex<Status>>,
    ) -> Result<BuildStatus> {
        let process = if target.includes_process() {
            Some(self.build_process_db(limit, status).await?)
        } else {
            None
        };
        let project = if target.includes_project() {
            Some(self.build_project_db(limit, status).await?)
        } else {
            None
        };

        let indexed_files = knowledge.reload().await?;

        Ok(BuildStatus {
            target,
            process,
            project,
            indexed_files,
        })
    }

    /// Reconstrucción destructiva: la colección se recrea y, en modo
    /// estructurado, el grafo se vacía antes de volver a fusionar nodos.
    pub async fn build_graph(
        &self,
        params: &BuildParams,
        status: Option<&Mutex<Status>>,
    ) -> Result<BuildSummary> {
        info!("Reconstrucción de '{}' desde {}", params.collection, params.source_folder.display());

        self.vectors.drop_collection(&params.collection).await?;
        self.vectors.create_collection(&params.collection).await?;

        if params.structured {
            if let Some(graph) = &self.graph {
                info!("Vaciando nodos Process/Attribute existentes...");
                graph.delete_all().await?;
            }
        }

        let files = collect_files(&params.source_folder, &params.file_extension, params.limit);
        let mut summary = BuildSummary::default();
        if files.is_empty() {
            warn!(
                "No hay ficheros '{}' en {}",
                params.file_extension,
                params.source_folder.display()
            );
            return Ok(summary);
        }

        let total_files = files.len();
        for (index, (path, category)) in files.iter().enumerate() {
            summary.files_scanned += 1;
            let file_name = file_name_of(path);

            if let Some(status) = status {
                Status::update(status, |s| {
                    s.message = format!("[{}/{}] Procesando: {}...", index + 1, total_files, file_name);
                    s.progress = (index + 1) as f32 / total_files as f32;
                });
            }

            let result = if params.structured {
                self.ingest_document(path, &file_name, category, &params.collection).await
            } else {
                self.ingest_manual(path, &file_name, &params.collection).await
            };

            match result {
                Ok(chunks) => {
                    summary.files_ingested += 1;
                    summary.total_chunks += chunks;
                }
                Err(err) => {
                    summary.files_failed += 1;
                    error!("Error ingiriendo {}: {err}", path.display());
                }
            }
        }

        self.vectors.flush(&params.collection).await?;
        info!("Reconstrucción de '{}' completada: {summary}", params.collection);
        Ok(summary)
    }

    async fn ingest_document(
        &self,
        path: &Path,
        file_name: &str,
        category: &str,
        collection: &str,
    ) -> Result<usize> {
        let text = fs::read_to_string(path)?;
        let doc = parser::parse_document(&text);

        if let Some(graph) = &self.graph {
            let node = ProcessNode::from_parsed(&doc, file_name, category);
            upsert_process(graph.as_ref(), &node, &doc).await?;
        }

        let mut records = Vec::with_capacity(doc.chunks.len());
        for (i, chunk) in doc.chunks.iter().enumerate() {
            records.push(VectorRecord {
                id: format!("{file_name}_{i}"),
                embedding: self.embedder.embed(&chunk.text).await?,
                text: chunk.text.clone(),
                metadata: ChunkMetadata {
                    source: file_name.to_string(),
                    process_id: Some(doc.process_id.clone()),
                    global_key: Some(doc.global_key.clone()),
                    category: category.to_string(),
                    section: Some(chunk.section.clone()),
                },
            });
        }

        let count = records.len();
        if count > 0 {
            self.vectors.upsert(collection, records).await?;
        }
        Ok(count)
    }

    async fn ingest_manual(&self, path: &Path, file_name: &str, collection: &str) -> Result<usize> {
        let text = parser::extract_manual_text(path)?;
        let mut records = Vec::new();
        for (i, chunk) in parser::chunk_text(&text, MANUAL_CHUNK_SIZE, MANUAL_CHUNK_OVERLAP)
            .into_iter()
            .enumerate()
        {
            if chunk.trim().is_empty() {
                continue;
            }
            records.push(VectorRecord {
                id: format!("{file_name}_{i}"),
                embedding: self.embedder.embed(&chunk).await?,
                text: chunk,
                metadata: ChunkMetadata {
                    source: file_name.to_string(),
                    category: MANUAL_CATEGORY.to_string(),
                    ..ChunkMetadata::default()
                },
            });
        }

        let count = records.len();
        if count > 0 {
            self.vectors.upsert(collection, records).await?;
        }
        Ok(count)
    }
}

/// Fusiona el nodo Process, sus atributos y sus relaciones. Los destinos de
/// `RELATED_TO` se crean con nombre provisional si aún no se han ingerido.
async fn upsert_process(graph: &dyn GraphStore, node: &ProcessNode, doc: &ParsedDocument) -> Result<()> {
    graph
        .run(
            GraphQuery::new(
                "MERGE (p:Process {id: $gkey})
                 SET p.name = $pname, p.display_id = $pid, p.source = $fname, p.category = $category",
            )
            .param("gkey", &node.id)
            .param("pname", &node.name)
            .param("pid", &node.display_id)
            .param("fname", &node.source_file)
            .param("category", &node.category),
        )
        .await?;

    for attr in &doc.attributes {
        graph
            .run(
                GraphQuery::new(
                    "MATCH (p:Process {id: $gkey})
                     MERGE (a:Attribute {id: $gkey + '_' + $key})
                     SET a.name = $key, a.value = $value
                     MERGE (p)-[:HAS_ATTRIBUTE]->(a)",
                )
                .param("gkey", &node.id)
                .param("key", &attr.key)
                .param("value", &attr.value),
            )
            .await?;
    }

    for rel in &doc.related {
        graph
            .run(
                GraphQuery::new(
                    "MATCH (p:Process {id: $gkey})
                     MERGE (r:Process {id: $rel_gkey})
                     ON CREATE SET r.name = $rel_name
                     MERGE (p)-[link:RELATED_TO]->(r)
                     SET link.label = $rel_label",
                )
                .param("gkey", &node.id)
                .param("rel_gkey", &rel.global_key)
                .param("rel_name", &rel.name)
                .param("rel_label", &rel.relation_label),
            )
            .await?;
    }
    Ok(())
}

/// Ficheros con la extensión dada, en orden determinista, con su categoría
/// (nombre del directorio abuelo).
fn collect_files(root: &Path, extension: &str, limit: Option<usize>) -> Vec<(PathBuf, String)> {
    let mut files: Vec<(PathBuf, String)> = WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| e.file_name().to_string_lossy().ends_with(extension))
        .map(|e| {
            let category = e
                .path()
                .parent()
                .and_then(Path::parent)
                .and_then(Path::file_name)
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            (e.into_path(), category)
        })
        .collect();

    if let Some(limit) = limit {
        files.truncate(limit);
    }
    files
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| path.to_string_lossy().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MetadataField, MetadataFilter};
    use crate::testing::{FakeGraph, KeywordEmbedder};
    use crate::vector_store::LocalVectorStore;

    const INVENTORY: &str = "# 항목 정보: [103906_재고관리]
## [기본정보] 항목: [103906_재고관리]
재고를 관리한다
## [상세속성] 항목: [103906_재고관리]
#### 담당자
물류팀
## [연관항목] 항목: [103906_재고관리]
- 연관 No. 1
  - **항목 식별 정보 (Item Identity)**: [104001_출하]
  - **선행 프로세스**: 출하
";

    const SHIPPING: &str = "# 항목 정보: [104001_출하]
## [기본정보] 항목: [104001_출하]
출하를 처리한다
";

    struct Fixture {
        _dataset: tempfile::TempDir,
        _db: tempfile::TempDir,
        layout: BuildLayout,
        vectors: Arc<LocalVectorStore>,
        graph: Arc<FakeGraph>,
        embedder: Arc<KeywordEmbedder>,
        builder: KnowledgeBuilder,
    }

    fn fixture() -> Fixture {
        let dataset = tempfile::tempdir().unwrap();
        let db = tempfile::tempdir().unwrap();

        let docs = dataset.path().join("markdown/물류/재고");
        fs::create_dir_all(&docs).unwrap();
        fs::write(docs.join("103906_재고관리.md"), INVENTORY).unwrap();
        fs::write(docs.join("104001_출하.md"), SHIPPING).unwrap();
        fs::write(docs.join("broken.md"), [0xff_u8, 0xfe, 0x00]).unwrap();
        fs::write(docs.join("notes.txt"), "ignorado").unwrap();

        let manuals = dataset.path().join("manual/pi/v1");
        fs::create_dir_all(&manuals).unwrap();
        fs::write(manuals.join("guide.txt"), "재고 ".repeat(600)).unwrap();

        let layout = BuildLayout {
            markdown_dir: dataset.path().join("markdown"),
            manual_dir: dataset.path().join("manual"),
            process_collection: "process".into(),
            project_collection: "project".into(),
            manual_extension: ".txt".into(),
        };
        let vectors = Arc::new(LocalVectorStore::new(db.path()));
        let graph = Arc::new(FakeGraph::new());
        let embedder = Arc::new(KeywordEmbedder::new(&["재고", "출하"]));
        let builder = KnowledgeBuilder::new(
            embedder.clone(),
            vectors.clone(),
            Some(graph.clone() as Arc<dyn GraphStore>),
            layout.clone(),
        );
        Fixture {
            _dataset: dataset,
            _db: db,
            layout,
            vectors,
            graph,
            embedder,
            builder,
        }
    }

    #[test]
    fn rebuild_target_parsing() {
        assert_eq!("process".parse::<RebuildTarget>(), Ok(RebuildTarget::Process));
        assert_eq!(" ALL ".parse::<RebuildTarget>(), Ok(RebuildTarget::All));
        assert_eq!(
            "index".parse::<RebuildTarget>(),
            Err(UnknownRebuildTarget("index".into()))
        );
        assert!(RebuildTarget::All.includes_process() && RebuildTarget::All.includes_project());
        assert!(!RebuildTarget::Project.includes_process());
    }

    #[test]
    fn files_are_sorted_limited_and_categorised() {
        let f = fixture();
        let files = collect_files(&f.layout.markdown_dir, ".md", None);
        let names: Vec<_> = files.iter().map(|(p, _)| file_name_of(p)).collect();
        assert_eq!(names, vec!["103906_재고관리.md", "104001_출하.md", "broken.md"]);
        assert!(files.iter().all(|(_, c)| c == "물류"));
        assert_eq!(collect_files(&f.layout.markdown_dir, ".md", Some(1)).len(), 1);
    }

    #[tokio::test]
    async fn structured_build_writes_graph_and_chunks() {
        let f = fixture();
        let summary = f.builder.build_process_db(None, None).await.unwrap();
        assert_eq!(
            summary,
            BuildSummary {
                files_scanned: 3,
                files_ingested: 2,
                files_failed: 1,
                total_chunks: 4,
            }
        );

        let nodes = f.graph.node_ids();
        assert!(nodes.contains("103906_재고관리"));
        assert!(nodes.contains("103906_재고관리_담당자"));
        assert!(nodes.contains("104001_출하"));
        assert!(f.graph.edges.lock().unwrap().contains(&(
            "103906_재고관리".to_string(),
            "104001_출하".to_string(),
            "선행 프로세스".to_string()
        )));

        // Proceso + atributo + relación del inventario, y el proceso de salida.
        let writes = f.graph.ran();
        assert_eq!(writes.len(), 4);
        assert!(writes[0].text.contains("MERGE (p:Process"));
        assert_eq!(writes[0].str_param("gkey"), Some("103906_재고관리"));
        assert_eq!(f.embedder.calls(), summary.total_chunks);

        let docs = f
            .vectors
            .get("process", &MetadataFilter::new(MetadataField::GlobalKey, "103906_재고관리"))
            .await
            .unwrap();
        assert_eq!(docs.len(), 3);
        assert_eq!(docs[0].id, "103906_재고관리.md_0");
        assert_eq!(docs[0].metadata.category, "물류");
        assert_eq!(docs[0].metadata.process_id.as_deref(), Some("103906"));
        assert_eq!(docs[0].metadata.section.as_deref(), Some("기본정보"));
    }

    #[tokio::test]
    async fn rebuilding_twice_is_idempotent() {
        let f = fixture();
        let first = f.builder.build_process_db(None, None).await.unwrap();
        let nodes_first = f.graph.node_ids();
        let second = f.builder.build_process_db(None, None).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(nodes_first, f.graph.node_ids());
        let all = f.vectors.query("process", &[1.0, 1.0, 1.0], 100).await.unwrap();
        assert_eq!(all.len(), second.total_chunks);
    }

    #[tokio::test]
    async fn manual_build_uses_windows_and_manual_category() {
        let f = fixture();
        let summary = f.builder.build_project_db(None, None).await.unwrap();
        // 1800 caracteres con ventanas de 1000 y paso 900.
        assert_eq!(summary.total_chunks, 2);
        let docs = f
            .vectors
            .get("project", &MetadataFilter::new(MetadataField::Source, "guide.txt"))
            .await
            .unwrap();
        assert_eq!(docs.len(), 2);
        assert!(docs.iter().all(|d| d.metadata.category == "Manual"));
        assert!(docs.iter().all(|d| d.metadata.global_key.is_none()));
        assert!(f.graph.node_ids().is_empty());
        assert!(f.graph.ran().is_empty());
        assert_eq!(f.embedder.calls(), 2);
    }

    #[tokio::test]
    async fn rebuild_knowledge_reloads_context() {
        let f = fixture();
        let knowledge = KnowledgeContext::new(
            f.layout.markdown_dir.parent().unwrap(),
            f.vectors.clone(),
            "process",
            "project",
        );
        knowledge.init().await.unwrap();
        assert!(!knowledge.loaded().process);

        let status = Mutex::new(Status::default());
        let result = f
            .builder
            .rebuild_knowledge(&knowledge, RebuildTarget::Process, Some(2), Some(&status))
            .await
            .unwrap();

        assert_eq!(result.process.as_ref().map(|s| s.files_scanned), Some(2));
        assert!(result.project.is_none());
        assert!(knowledge.loaded().process);
        assert!(!knowledge.loaded().project);
        assert_eq!(result.indexed_files, 5);
        assert_eq!(Status::snapshot(&status).progress, 1.0);
        assert!(result.to_string().starts_with("DB Build Complete (process)"));
    }
}
