//! Carga y gestión de configuración de la aplicación (Neo4j, LLM, dataset y
//! almacén vectorial).

use std::env;
use std::path::PathBuf;

use anyhow::{anyhow, Result};

#[derive(Clone, Debug, PartialEq)]
pub enum LlmProvider {
    OpenAI,
    Gemini,
    Ollama,
}

impl LlmProvider {
    pub fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "openai" => Ok(Self::OpenAI),
            "gemini" => Ok(Self::Gemini),
            "ollama" => Ok(Self::Ollama),
            other => Err(anyhow!("Proveedor LLM no soportado: {other}")),
        }
    }
}

/// Dónde viven los embeddings de los chunks.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum VectorBackend {
    /// Fichero JSON por colección bajo `database_dir`.
    Local,
    /// Índice vectorial nativo de Neo4j.
    Neo4j,
}

impl VectorBackend {
    pub fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "neo4j" => Ok(Self::Neo4j),
            other => Err(anyhow!("Backend vectorial no soportado: {other}")),
        }
    }
}

/// Configuración completa de la aplicación.
#[derive(Clone, Debug)]
pub struct AppConfig {
    pub neo4j_uri: String,
    pub neo4j_user: String,
    pub neo4j_password: String,
    pub server_addr: String,

    pub llm_provider: LlmProvider,
    pub llm_embedding_model: String,
    pub llm_chat_model: String,
    pub embedding_dimensions: usize,

    pub dataset_dir: PathBuf,
    pub database_dir: PathBuf,
    pub vector_backend: VectorBackend,
    pub process_collection: String,
    pub project_collection: String,
    /// Extensión de los manuales (ruta no estructurada).
    pub manual_extension: String,
}

impl AppConfig {
    /// Carga la configuración desde variables de entorno (usando .env si existe).
    pub fn from_env() -> Result<Self> {
        let neo4j_uri =
            env::var("NEO4J_URI").unwrap_or_else(|_| "bolt://localhost:7687".to_string());
        let neo4j_user = env::var("NEO4J_USER").unwrap_or_else(|_| "neo4j".to_string());
        let neo4j_password = env::var("NEO4J_PASSWORD")
            .map_err(|_| anyhow!("Falta NEO4J_PASSWORD en el entorno"))?;

        let server_addr =
            env::var("SERVER_ADDR").unwrap_or_else(|_| "127.0.0.1:8050".to_string());

        let llm_provider_str =
            env::var("LLM_PROVIDER").unwrap_or_else(|_| "openai".to_string());
        let llm_provider = LlmProvider::from_str(&llm_provider_str)?;

        let llm_embedding_model = env::var("LLM_EMBEDDING_MODEL")
            .unwrap_or_else(|_| "text-embedding-3-small".to_string());
        let llm_chat_model =
            env::var("LLM_CHAT_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string());
        let embedding_dimensions = match env::var("EMBEDDING_DIMENSIONS") {
            Ok(raw) => raw
                .trim()
                .parse::<usize>()
                .map_err(|e| anyhow!("EMBEDDING_DIMENSIONS inválido ({raw}): {e}"))?,
            Err(_) => 1536,
        };

        let dataset_dir =
            PathBuf::from(env::var("DATASET_DIR").unwrap_or_else(|_| "./dataset".to_string()));
        let database_dir =
            PathBuf::from(env::var("DATABASE_DIR").unwrap_or_else(|_| "./database".to_string()));
        let vector_backend = VectorBackend::from_str(
            &env::var("VECTOR_BACKEND").unwrap_or_else(|_| "local".to_string()),
        )?;

        let process_collection = env::var("PROCESS_COLLECTION")
            .unwrap_or_else(|_| "process_collection".to_string());
        let project_collection = env::var("PROJECT_COLLECTION")
            .unwrap_or_else(|_| "project_collection".to_string());
        let manual_extension =
            env::var("MANUAL_EXTENSION").unwrap_or_else(|_| ".pdf".to_string());

        Ok(Self {
            neo4j_uri,
            neo4j_user,
            neo4j_password,
            server_addr,
            llm_provider,
            llm_embedding_model,
            llm_chat_model,
            embedding_dimensions,
            dataset_dir,
            database_dir,
            vector_backend,
            process_collection,
            project_collection,
            manual_extension,
        })
    }

    /// Carpeta con los documentos estructurados (markdown).
    pub fn markdown_dir(&self) -> PathBuf {
        self.dataset_dir.join("markdown")
    }

    /// Carpeta con los manuales del proyecto.
    pub fn manual_dir(&self) -> PathBuf {
        self.dataset_dir.join("manual")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_parsing_is_case_insensitive() {
        assert_eq!(LlmProvider::from_str("OpenAI").unwrap(), LlmProvider::OpenAI);
        assert!(LlmProvider::from_str("claude-local").is_err());
    }

    #[test]
    fn vector_backend_parsing() {
        assert_eq!(VectorBackend::from_str("LOCAL").unwrap(), VectorBackend::Local);
        assert_eq!(VectorBackend::from_str("neo4j").unwrap(), VectorBackend::Neo4j);
        assert!(VectorBackend::from_str("chroma").is_err());
    }
}
