//! Contrato del almacén de grafo y tipos de fila independientes del driver.
//!
//! Las consultas se construyen como en `neo4rs` (`GraphQuery::new(..).param(..)`)
//! pero además declaran qué columnas devuelven, porque las filas se convierten
//! a `GraphRow` antes de salir del cliente.

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;

/// Parámetro de una consulta Cypher.
#[derive(Debug, Clone, PartialEq)]
pub enum GraphParam {
    Str(String),
    Int(i64),
    Float(f64),
    FloatList(Vec<f64>),
}

impl From<String> for GraphParam {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

impl From<&str> for GraphParam {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<&String> for GraphParam {
    fn from(v: &String) -> Self {
        Self::Str(v.clone())
    }
}

impl From<i64> for GraphParam {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for GraphParam {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<Vec<f64>> for GraphParam {
    fn from(v: Vec<f64>) -> Self {
        Self::FloatList(v)
    }
}

/// Consulta Cypher con parámetros y columnas esperadas.
#[derive(Debug, Clone, PartialEq)]
pub struct GraphQuery {
    pub text: String,
    pub params: Vec<(String, GraphParam)>,
    pub columns: Vec<String>,
}

impl GraphQuery {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            params: Vec::new(),
            columns: Vec::new(),
        }
    }

    pub fn param(mut self, key: &str, value: impl Into<GraphParam>) -> Self {
        self.params.push((key.to_string(), value.into()));
        self
    }

    pub fn returns(mut self, columns: &[&str]) -> Self {
        self.columns = columns.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn get_param(&self, key: &str) -> Option<&GraphParam> {
        self.params.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn str_param(&self, key: &str) -> Option<&str> {
        match self.get_param(key) {
            Some(GraphParam::Str(s)) => Some(s.as_str()),
            _ => None,
        }
    }
}

/// Nodo de un camino nativo del driver.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NativeNode {
    /// Identificador interno del driver.
    pub element_id: String,
    pub id: Option<String>,
    pub name: Option<String>,
}

impl NativeNode {
    /// `id` de negocio si existe; si no, el identificador del driver.
    pub fn key(&self) -> String {
        self.id
            .as_deref()
            .filter(|id| !id.trim().is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| self.element_id.clone())
    }
}

/// Relación de un camino nativo, ya orientada por el driver.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NativeRelation {
    pub start: NativeNode,
    pub end: NativeNode,
    pub rel_type: String,
}

/// Camino tal y como lo entrega el driver.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NativePath {
    pub nodes: Vec<NativeNode>,
    pub relations: Vec<NativeRelation>,
}

/// Valor de una columna. Las consultas proyectan escalares o listas
/// paralelas de escalares; los mapas literales no se leen.
#[derive(Debug, Clone, PartialEq)]
pub enum GraphValue {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    StrList(Vec<String>),
    FloatList(Vec<f64>),
    Path(NativePath),
}

/// Fila de resultados con columnas nombradas.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GraphRow {
    fields: HashMap<String, GraphValue>,
}

impl GraphRow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: GraphValue) -> Self {
        self.insert(key, value);
        self
    }

    pub fn with_str(self, key: &str, value: &str) -> Self {
        self.with(key, GraphValue::Str(value.to_string()))
    }

    pub fn with_float(self, key: &str, value: f64) -> Self {
        self.with(key, GraphValue::Float(value))
    }

    pub fn with_list(self, key: &str, values: &[&str]) -> Self {
        self.with(
            key,
            GraphValue::StrList(values.iter().map(|v| v.to_string()).collect()),
        )
    }

    pub fn insert(&mut self, key: &str, value: GraphValue) {
        self.fields.insert(key.to_string(), value);
    }

    pub fn get(&self, key: &str) -> Option<&GraphValue> {
        self.fields.get(key)
    }

    pub fn path(&self, key: &str) -> Option<&NativePath> {
        match self.fields.get(key) {
            Some(GraphValue::Path(p)) => Some(p),
            _ => None,
        }
    }

    pub fn str(&self, key: &str) -> Option<&str> {
        match self.fields.get(key) {
            Some(GraphValue::Str(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Número de la columna; los enteros se aceptan como flotantes.
    pub fn float(&self, key: &str) -> Option<f64> {
        match self.fields.get(key) {
            Some(GraphValue::Float(f)) => Some(*f),
            Some(GraphValue::Int(i)) => Some(*i as f64),
            _ => None,
        }
    }

    /// Lista de textos. Una lista vacía puede llegar como cualquiera de las
    /// variantes de lista.
    pub fn str_list(&self, key: &str) -> Option<&[String]> {
        match self.fields.get(key) {
            Some(GraphValue::StrList(items)) => Some(items.as_slice()),
            Some(GraphValue::FloatList(items)) if items.is_empty() => Some(&[]),
            _ => None,
        }
    }
}

/// Almacén de grafo gestionado externamente (Neo4j en producción).
#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Ejecuta una consulta de lectura y devuelve sus filas.
    async fn execute(&self, query: GraphQuery) -> Result<Vec<GraphRow>>;
    /// Ejecuta una escritura sin leer filas.
    async fn run(&self, query: GraphQuery) -> Result<()>;
    /// Borra todos los nodos de proceso y atributos con sus relaciones.
    async fn delete_all(&self) -> Result<()>;
    /// Descripción textual del esquema, para inyectarla en prompts.
    async fn schema(&self) -> Result<String>;
}
