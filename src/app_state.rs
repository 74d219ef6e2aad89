use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::{
    config::AppConfig, graph::GraphStore, ingest::KnowledgeBuilder, rag::QueryEngine,
    vector_store::VectorStore,
};

#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub engine: Arc<QueryEngine>,
    pub builder: Arc<KnowledgeBuilder>,
    pub knowledge: Arc<KnowledgeContext>,
    /// `None` si Neo4j no estaba disponible al arrancar.
    pub graph: Option<Arc<dyn GraphStore>>,
    pub status: Arc<Mutex<Status>>,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct Status {
    pub is_busy: bool,
    pub message: String,
    pub progress: f32, // Valor entre 0.0 y 1.0
    pub updated_at: Option<DateTime<Utc>>,
}

impl Status {
    pub fn ready(message: &str) -> Self {
        Self {
            is_busy: false,
            message: message.to_string(),
            progress: 0.0,
            updated_at: Some(Utc::now()),
        }
    }

    /// Aplica `f` al estado compartido; un mutex envenenado se recupera.
    pub fn update(status: &Mutex<Status>, f: impl FnOnce(&mut Status)) {
        let mut guard = status.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard);
        guard.updated_at = Some(Utc::now());
    }

    pub fn snapshot(status: &Mutex<Status>) -> Status {
        status.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Marca el estado como ocupado si no lo estaba. Devuelve `false` si ya
    /// había una reconstrucción en curso.
    pub fn try_begin(status: &Mutex<Status>, message: &str) -> bool {
        let mut guard = status.lock().unwrap_or_else(PoisonError::into_inner);
        if guard.is_busy {
            return false;
        }
        guard.is_busy = true;
        guard.message = message.to_string();
        guard.progress = 0.0;
        guard.updated_at = Some(Utc::now());
        true
    }
}

/// Colecciones del índice disponibles para el motor de consultas.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadedCollections {
    pub process: bool,
    pub project: bool,
}

/// Cachés de proceso: mapa nombre de fichero → ruta bajo el dataset y
/// colecciones cargadas. Se inicializa con `init` y se refresca con
/// `reload` tras cada reconstrucción.
pub struct KnowledgeContext {
    dataset_dir: PathBuf,
    vectors: Arc<dyn VectorStore>,
    process_collection: String,
    project_collection: String,
    files: RwLock<HashMap<String, PathBuf>>,
    loaded: RwLock<LoadedCollections>,
}

impl KnowledgeContext {
    pub fn new(
        dataset_dir: impl Into<PathBuf>,
        vectors: Arc<dyn VectorStore>,
        process_collection: impl Into<String>,
        project_collection: impl Into<String>,
    ) -> Self {
        Self {
            dataset_dir: dataset_dir.into(),
            vectors,
            process_collection: process_collection.into(),
            project_collection: project_collection.into(),
            files: RwLock::new(HashMap::new()),
            loaded: RwLock::new(LoadedCollections::default()),
        }
    }

    pub fn from_config(cfg: &AppConfig, vectors: Arc<dyn VectorStore>) -> Self {
        Self::new(
            cfg.dataset_dir.clone(),
            vectors,
            cfg.process_collection.clone(),
            cfg.project_collection.clone(),
        )
    }

    pub async fn init(&self) -> Result<()> {
        self.reload().await.map(|_| ())
    }

    /// Reindexa los ficheros y vuelve a comprobar qué colecciones existen.
    /// Devuelve el número de ficheros indexados.
    pub async fn reload(&self) -> Result<usize> {
        let indexed = self.reindex_files();
        let loaded = LoadedCollections {
            process: self.vectors.collection_exists(&self.process_collection).await?,
            project: self.vectors.collection_exists(&self.project_collection).await?,
        };
        *self.loaded.write().unwrap_or_else(PoisonError::into_inner) = loaded;
        info!(
            "Contexto recargado: {indexed} ficheros, process={} project={}",
            loaded.process, loaded.project
        );
        Ok(indexed)
    }

    pub fn reindex_files(&self) -> usize {
        let map = index_files(&self.dataset_dir);
        let count = map.len();
        *self.files.write().unwrap_or_else(PoisonError::into_inner) = map;
        count
    }

    /// Ruta de un fichero del dataset por su nombre. Si no está en la caché
    /// (o ya no existe) se reindexa una vez y se reintenta.
    pub fn file_path(&self, file_name: &str) -> Option<PathBuf> {
        if let Some(path) = self.cached_path(file_name) {
            return Some(path);
        }
        self.reindex_files();
        self.cached_path(file_name)
    }

    fn cached_path(&self, file_name: &str) -> Option<PathBuf> {
        self.files
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(file_name)
            .filter(|p| p.exists())
            .cloned()
    }

    pub fn loaded(&self) -> LoadedCollections {
        *self.loaded.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn process_collection(&self) -> &str {
        &self.process_collection
    }

    pub fn project_collection(&self) -> &str {
        &self.project_collection
    }
}

fn index_files(root: &Path) -> HashMap<String, PathBuf> {
    if !root.is_dir() {
        warn!("No se encuentra la carpeta del dataset: {}", root.display());
        return HashMap::new();
    }
    WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| (e.file_name().to_string_lossy().to_string(), e.into_path()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector_store::LocalVectorStore;

    #[tokio::test]
    async fn file_cache_reindexes_on_miss() {
        let dataset = tempfile::tempdir().unwrap();
        let db = tempfile::tempdir().unwrap();
        let vectors = Arc::new(LocalVectorStore::new(db.path()));
        let ctx = KnowledgeContext::new(dataset.path(), vectors.clone(), "process", "project");
        ctx.init().await.unwrap();
        assert!(ctx.file_path("a.md").is_none());
        assert_eq!(ctx.loaded(), LoadedCollections::default());

        let nested = dataset.path().join("markdown/영업/sub");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(nested.join("a.md"), "# 항목 정보: [1_a]").unwrap();
        assert_eq!(ctx.file_path("a.md"), Some(nested.join("a.md")));

        vectors.create_collection("process").await.unwrap();
        ctx.reload().await.unwrap();
        assert!(ctx.loaded().process);
        assert!(!ctx.loaded().project);
    }

    #[test]
    fn busy_status_rejects_second_rebuild() {
        let status = Mutex::new(Status::ready("listo"));
        assert!(Status::try_begin(&status, "construyendo"));
        assert!(!Status::try_begin(&status, "otra vez"));
        Status::update(&status, |s| s.is_busy = false);
        assert!(Status::try_begin(&status, "de nuevo"));
        let snapshot = Status::snapshot(&status);
        assert_eq!(snapshot.message, "de nuevo");
        assert!(snapshot.updated_at.is_some());
    }
}
