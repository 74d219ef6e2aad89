//! Dobles en memoria de los colaboradores externos, sólo para tests.

use std::collections::{BTreeSet, VecDeque};
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use crate::graph::{GraphQuery, GraphRow, GraphStore};
use crate::llm::{prepare_embedding_input, CompletionService, EmbeddingService};

/// Devuelve las respuestas en orden; sin respuestas pendientes, falla.
pub struct ScriptedCompletion {
    replies: Mutex<VecDeque<Result<String>>>,
    pub prompts: Mutex<Vec<(String, String, f64)>>,
}

impl ScriptedCompletion {
    pub fn new(replies: Vec<Result<String>>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn prompts(&self) -> Vec<(String, String, f64)> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl CompletionService for ScriptedCompletion {
    async fn complete(&self, system: &str, user: &str, temperature: f64) -> Result<String> {
        self.prompts
            .lock()
            .unwrap()
            .push((system.to_string(), user.to_string(), temperature));
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(anyhow!("sin respuesta programada")))
    }
}

/// Un eje por palabra clave, más un eje constante para no tener norma cero.
pub struct KeywordEmbedder {
    keywords: Vec<String>,
    calls: Mutex<usize>,
}

impl KeywordEmbedder {
    pub fn new(keywords: &[&str]) -> Self {
        Self {
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
            calls: Mutex::new(0),
        }
    }

    /// Embeddings calculados (las entradas vacías no cuentan).
    pub fn calls(&self) -> usize {
        *self.calls.lock().unwrap()
    }
}

#[async_trait]
impl EmbeddingService for KeywordEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f64>> {
        let Some(input) = prepare_embedding_input(text) else {
            return Ok(Vec::new());
        };
        *self.calls.lock().unwrap() += 1;
        let mut v: Vec<f64> = self
            .keywords
            .iter()
            .map(|k| if input.contains(k.as_str()) { 1.0 } else { 0.0 })
            .collect();
        v.push(0.01);
        Ok(v)
    }
}

/// Grafo falso: registra las consultas, responde por subcadena y lleva la
/// cuenta de los nodos fusionados por la ingesta.
#[derive(Default)]
pub struct FakeGraph {
    executed: Mutex<Vec<GraphQuery>>,
    ran: Mutex<Vec<GraphQuery>>,
    responses: Mutex<Vec<(String, Vec<GraphRow>)>>,
    pub nodes: Mutex<BTreeSet<String>>,
    pub edges: Mutex<BTreeSet<(String, String, String)>>,
    pub fail_execute: bool,
}

impl FakeGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            fail_execute: true,
            ..Self::default()
        }
    }

    pub fn respond(self, needle: &str, rows: Vec<GraphRow>) -> Self {
        self.responses
            .lock()
            .unwrap()
            .push((needle.to_string(), rows));
        self
    }

    pub fn executed(&self) -> Vec<GraphQuery> {
        self.executed.lock().unwrap().clone()
    }

    /// Escrituras recibidas por `run`, en orden.
    pub fn ran(&self) -> Vec<GraphQuery> {
        self.ran.lock().unwrap().clone()
    }

    pub fn node_ids(&self) -> BTreeSet<String> {
        self.nodes.lock().unwrap().clone()
    }
}

#[async_trait]
impl GraphStore for FakeGraph {
    async fn execute(&self, query: GraphQuery) -> Result<Vec<GraphRow>> {
        self.executed.lock().unwrap().push(query.clone());
        if self.fail_execute {
            return Err(anyhow!("grafo no disponible"));
        }
        let responses = self.responses.lock().unwrap();
        Ok(responses
            .iter()
            .find(|(needle, _)| query.text.contains(needle.as_str()))
            .map(|(_, rows)| rows.clone())
            .unwrap_or_default())
    }

    async fn run(&self, query: GraphQuery) -> Result<()> {
        let text = query.text.clone();
        let mut nodes = self.nodes.lock().unwrap();
        if text.contains("MERGE (p:Process") {
            if let Some(id) = query.str_param("gkey") {
                nodes.insert(id.to_string());
            }
        }
        if text.contains("MERGE (a:Attribute") {
            if let (Some(g), Some(k)) = (query.str_param("gkey"), query.str_param("key")) {
                nodes.insert(format!("{g}_{k}"));
            }
        }
        if text.contains("MERGE (r:Process") {
            if let (Some(g), Some(r), Some(l)) = (
                query.str_param("gkey"),
                query.str_param("rel_gkey"),
                query.str_param("rel_label"),
            ) {
                nodes.insert(r.to_string());
                self.edges
                    .lock()
                    .unwrap()
                    .insert((g.to_string(), r.to_string(), l.to_string()));
            }
        }
        drop(nodes);
        self.ran.lock().unwrap().push(query);
        Ok(())
    }

    async fn delete_all(&self) -> Result<()> {
        self.nodes.lock().unwrap().clear();
        self.edges.lock().unwrap().clear();
        Ok(())
    }

    async fn schema(&self) -> Result<String> {
        Ok("Node properties:\nProcess {id, name, display_id}\nThe relationships:\n(:Process)-[:RELATED_TO]->(:Process)\n".to_string())
    }
}
