//! Modelos de dominio: documentos de proceso parseados, nodos del grafo y
//! registros del índice vectorial.

use serde::{Deserialize, Serialize};

/// Clave centinela cuando la cabecera del documento no se puede leer.
pub const UNKNOWN_KEY: &str = "unknown";

/// Un bloque de sección convertido en chunk (una sección = un chunk).
#[derive(Debug, Clone, PartialEq)]
pub struct SectionChunk {
    pub text: String,
    pub section: String,
    pub owner_key: String,
}

/// Par clave/valor de la sección "상세속성" (atributos detallados).
#[derive(Debug, Clone, PartialEq)]
pub struct AttributePair {
    pub key: String,
    pub value: String,
}

/// Referencia cruzada de la sección "연관항목" (elementos relacionados).
#[derive(Debug, Clone, PartialEq)]
pub struct RelatedItem {
    pub global_key: String,
    pub name: String,
    pub relation_label: String,
}

/// Resultado del parser estructural de un documento.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedDocument {
    pub process_id: String,
    pub process_name: String,
    pub global_key: String,
    pub attributes: Vec<AttributePair>,
    pub related: Vec<RelatedItem>,
    pub chunks: Vec<SectionChunk>,
}

/// Representa un nodo (:Process) en Neo4j.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessNode {
    pub id: String,
    pub name: String,
    pub display_id: String,
    pub source_file: String,
    pub category: String,
}

impl ProcessNode {
    pub fn from_parsed(doc: &ParsedDocument, source_file: &str, category: &str) -> Self {
        Self {
            id: doc.global_key.clone(),
            name: doc.process_name.clone(),
            display_id: doc.process_id.clone(),
            source_file: source_file.to_string(),
            category: category.to_string(),
        }
    }
}

/// Metadatos guardados junto a cada chunk del índice vectorial.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub source: String,
    pub process_id: Option<String>,
    pub global_key: Option<String>,
    pub category: String,
    pub section: Option<String>,
}

/// Campo de metadatos por el que se puede filtrar un `get`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataField {
    Source,
    ProcessId,
    GlobalKey,
}

impl MetadataField {
    pub fn property(&self) -> &'static str {
        match self {
            Self::Source => "source",
            Self::ProcessId => "process_id",
            Self::GlobalKey => "global_key",
        }
    }

    pub fn value_of<'a>(&self, meta: &'a ChunkMetadata) -> Option<&'a str> {
        match self {
            Self::Source => Some(meta.source.as_str()),
            Self::ProcessId => meta.process_id.as_deref(),
            Self::GlobalKey => meta.global_key.as_deref(),
        }
    }
}

/// Filtro de igualdad sobre un campo de metadatos.
#[derive(Debug, Clone, PartialEq)]
pub struct MetadataFilter {
    pub field: MetadataField,
    pub value: String,
}

impl MetadataFilter {
    pub fn new(field: MetadataField, value: impl Into<String>) -> Self {
        Self {
            field,
            value: value.into(),
        }
    }

    pub fn matches(&self, meta: &ChunkMetadata) -> bool {
        self.field.value_of(meta) == Some(self.value.as_str())
    }
}

/// Registro del índice vectorial (chunk + embedding + metadatos).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorRecord {
    pub id: String,
    pub embedding: Vec<f64>,
    pub text: String,
    pub metadata: ChunkMetadata,
}

/// Resultado de una búsqueda por similitud.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorHit {
    pub id: String,
    pub score: f64,
    pub text: String,
    pub metadata: ChunkMetadata,
}

/// Documento devuelto por un `get` filtrado.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorDocument {
    pub id: String,
    pub text: String,
    pub metadata: ChunkMetadata,
}

/// Mensaje previo de la conversación.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn is_assistant(&self) -> bool {
        self.role == "assistant"
    }
}
