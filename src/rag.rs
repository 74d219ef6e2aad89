//! Motor de consultas Graph-RAG.
//!
//! Flujo por pregunta:
//!   1. Router de intención (con anulación por vocabulario del dominio).
//!   2. Resolución de las dos entidades de la pregunta contra el índice, o
//!      búsqueda por similitud de respaldo (con el contexto activo de la
//!      conversación).
//!   3. Búsqueda de camino: generar → validar → reescribir → ejecutar.
//!   4. Síntesis de la respuesta con el LLM y saneado del texto.
//!   5. Grafo de vecindad para el visualizador.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::{
    app_state::KnowledgeContext,
    entities::{extract_two_entities, pick_best_candidate, Candidate},
    graph::{GraphQuery, GraphStore},
    llm::{CompletionService, EmbeddingService},
    models::{ChatMessage, MetadataField, MetadataFilter, VectorHit},
    path_query::{
        detect_path_mode, extract_must_pass_term, generate_path_query, validate_path_query,
        wrap_path_return, PathMode, MAX_HOPS, PATH_COLUMNS,
    },
    router::{IntentRouter, Route},
    vector_store::VectorStore,
    visualize::{normalize_path_rows, GraphVisualization, PathPayload, VisualizationAssembler},
};

pub const GREETING: &str = "안녕하세요! 무엇을 도와드릴까요?";
pub const PATH_NOT_FOUND: &str = "경로를 찾지 못했습니다.";
pub const NO_ANSWER: &str = "정보를 찾을 수 없습니다.";

const SYSTEM_PROMPT: &str = "너는 하림그룹 PI 프로젝트 도우미야. 최대한 간결하게 요약해서 답해.\n제공된 정의서와 그래프 경로를 통합해서 답해.";

/// Con cualquiera de estos términos la pregunta se responde por `both`.
const DOMAIN_KEYWORDS: &[&str] = &["프로세스", "BP", "특성", "품목", "코드", "관리", "연결", "경로"];

const CANDIDATE_TOP_K: usize = 5;
const FALLBACK_TOP_K: usize = 3;
const MANUAL_TOP_K: usize = 2;
const CONTEXT_SEPARATOR: &str = "\n\n---\n\n";

/// Respuesta final de un turno.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Answer {
    pub answer_text: String,
    pub graph_visualization: GraphVisualization,
}

/// Estado acumulado durante un turno.
#[derive(Default)]
struct TurnContext {
    items: Vec<Candidate>,
    full_text: HashMap<String, String>,
    passages: Vec<String>,
}

pub struct QueryEngine {
    router: IntentRouter,
    completion: Arc<dyn CompletionService>,
    embedder: Arc<dyn EmbeddingService>,
    vectors: Arc<dyn VectorStore>,
    graph: Option<Arc<dyn GraphStore>>,
    knowledge: Arc<KnowledgeContext>,
    assembler: VisualizationAssembler,
}

impl QueryEngine {
    pub fn new(
        completion: Arc<dyn CompletionService>,
        embedder: Arc<dyn EmbeddingService>,
        vectors: Arc<dyn VectorStore>,
        graph: Option<Arc<dyn GraphStore>>,
        knowledge: Arc<KnowledgeContext>,
    ) -> Self {
        let assembler = VisualizationAssembler::new(
            graph.clone(),
            vectors.clone(),
            knowledge.process_collection(),
        )
        .with_source_files(knowledge.clone());
        Self {
            router: IntentRouter::new(completion.clone()),
            completion,
            embedder,
            vectors,
            graph,
            knowledge,
            assembler,
        }
    }

    /// Clasifica la pregunta y construye la respuesta completa. Los fallos
    /// de los colaboradores se degradan; esta función no falla.
    pub async fn classify_and_answer(&self, question: &str, history: &[ChatMessage]) -> Answer {
        let routed = self.router.route(question).await;
        let route = if is_domain_question(question) {
            Route::Both
        } else {
            routed.route
        };
        info!(
            "Ruta: {:?} (router: {:?} {:.2} '{}', pista {:?})",
            route, routed.route, routed.confidence, routed.reason, routed.path_mode_hint
        );

        if route == Route::Chat {
            return Answer {
                answer_text: GREETING.to_string(),
                graph_visualization: GraphVisualization::default(),
            };
        }

        let mut turn = TurnContext::default();
        let process_loaded = self.knowledge.loaded().process;
        if !process_loaded {
            warn!("La colección de procesos no está cargada; se responde sin contexto");
        }

        if process_loaded {
            if let Some((a, b)) = extract_two_entities(question) {
                debug!("Pregunta de relación: [{a}] -> [{b}]");
                for term in [&a, &b] {
                    self.resolve_entity(term, &mut turn).await;
                }
            }
            if turn.items.is_empty() {
                self.fallback_search(question, history, &mut turn).await;
            }
        }

        let mut path = PathPayload::default();
        let mut graph_answer = String::new();
        let mode = detect_path_mode(question);
        if let (true, Some(graph), [from, to, ..]) =
            (route.wants_graph() && mode != PathMode::None, &self.graph, turn.items.as_slice())
        {
            path = self.find_path(graph.as_ref(), question, &from.id, &to.id, mode).await;
            graph_answer = if path.is_empty() {
                PATH_NOT_FOUND.to_string()
            } else {
                path.describe()
            };
        }

        let answer_text = self.synthesize(question, &graph_answer, &turn.passages).await;

        let root = turn.items.first().map(|c| c.id.clone());
        let graph_visualization = self
            .assembler
            .build_neighborhood(question, root.as_deref(), &mut turn.full_text, &path)
            .await;

        Answer {
            answer_text,
            graph_visualization,
        }
    }

    /// Los 5 candidatos más similares al término; se queda con el mejor y
    /// trae su documento completo.
    async fn resolve_entity(&self, term: &str, turn: &mut TurnContext) {
        let candidates = match self.search(self.knowledge.process_collection(), term, CANDIDATE_TOP_K).await {
            Ok(hits) => hits.iter().filter_map(Candidate::from_hit).collect::<Vec<_>>(),
            Err(e) => {
                warn!("No se pudieron resolver candidatos para '{term}': {e}");
                return;
            }
        };
        let Some(best) = pick_best_candidate(term, &candidates).cloned() else {
            return;
        };
        debug!("'{term}' resuelto como {} ({:.3})", best.id, best.score);

        match self.full_document(&best.id).await {
            Ok(text) if !text.is_empty() => {
                turn.passages.push(text.clone());
                turn.full_text.insert(best.id.clone(), text);
            }
            Ok(_) => {}
            Err(e) => warn!("No se pudo leer el documento {}: {e}", best.id),
        }
        turn.items.push(best);
    }

    /// Búsqueda top-3 sobre la pregunta (reescrita con el contexto activo)
    /// más hasta 2 pasajes de los manuales.
    async fn fallback_search(&self, question: &str, history: &[ChatMessage], turn: &mut TurnContext) {
        let active = extract_active_context(history);
        let query = rewrite_query(question, active.as_deref());
        debug!("Búsqueda de respaldo: {query}");

        let vector = match self.embedder.embed(&query).await {
            Ok(v) if !v.is_empty() => v,
            Ok(_) => return,
            Err(e) => {
                warn!("Embedding de la pregunta fallido: {e}");
                return;
            }
        };

        match self
            .vectors
            .query(self.knowledge.process_collection(), &vector, FALLBACK_TOP_K)
            .await
        {
            Ok(hits) => {
                for hit in &hits {
                    if let Some(candidate) = Candidate::from_hit(hit) {
                        turn.full_text
                            .entry(candidate.id.clone())
                            .or_insert_with(|| hit.text.clone());
                        turn.passages.push(hit.text.clone());
                        turn.items.push(candidate);
                    }
                }
            }
            Err(e) => warn!("Búsqueda de respaldo fallida: {e}"),
        }

        if self.knowledge.loaded().project {
            match self
                .vectors
                .query(self.knowledge.project_collection(), &vector, MANUAL_TOP_K)
                .await
            {
                Ok(hits) => turn.passages.extend(
                    hits.into_iter()
                        .map(|h| format!("[매뉴얼: {}]\n{}", h.metadata.source, h.text)),
                ),
                Err(e) => warn!("Búsqueda en manuales fallida: {e}"),
            }
        }
    }

    async fn find_path(
        &self,
        graph: &dyn GraphStore,
        question: &str,
        from_id: &str,
        to_id: &str,
        mode: PathMode,
    ) -> PathPayload {
        let mut mode = mode;
        let mut must_pass_id = None;
        if mode == PathMode::Conditional {
            must_pass_id = match extract_must_pass_term(question) {
                Some(term) => self.resolve_must_pass(&term).await,
                None => None,
            };
            if must_pass_id.is_none() {
                debug!("Sin nodo intermedio resoluble, se busca el camino más corto");
                mode = PathMode::Shortest;
            }
        }

        match self.run_path_query(graph, from_id, to_id, mode, must_pass_id).await {
            Ok(path) => path,
            Err(e) => {
                warn!("Búsqueda de camino fallida ({}): {e}", mode.as_str());
                PathPayload::default()
            }
        }
    }

    async fn run_path_query(
        &self,
        graph: &dyn GraphStore,
        from_id: &str,
        to_id: &str,
        mode: PathMode,
        must_pass_id: Option<String>,
    ) -> Result<PathPayload> {
        let schema = graph.schema().await.unwrap_or_else(|e| {
            warn!("Esquema del grafo no disponible: {e}");
            String::new()
        });
        let cypher = generate_path_query(&self.completion, &schema, mode).await?;
        validate_path_query(&cypher)?;

        let mut q = GraphQuery::new(wrap_path_return(&cypher))
            .param("fromId", from_id)
            .param("toId", to_id)
            .param("maxHops", MAX_HOPS)
            .returns(&PATH_COLUMNS);
        if let Some(id) = must_pass_id {
            q = q.param("mustPassId", id);
        }

        let rows = graph.execute(q).await?;
        Ok(normalize_path_rows(&rows))
    }

    /// Primer hit con GlobalKey para el término intermedio.
    async fn resolve_must_pass(&self, term: &str) -> Option<String> {
        match self.search(self.knowledge.process_collection(), term, CANDIDATE_TOP_K).await {
            Ok(hits) => hits.into_iter().find_map(|h| h.metadata.global_key),
            Err(e) => {
                warn!("No se pudo resolver el nodo intermedio '{term}': {e}");
                None
            }
        }
    }

    async fn search(&self, collection: &str, text: &str, top_k: usize) -> Result<Vec<VectorHit>> {
        let vector = self.embedder.embed(text).await?;
        if vector.is_empty() {
            return Ok(Vec::new());
        }
        self.vectors.query(collection, &vector, top_k).await
    }

    async fn full_document(&self, global_key: &str) -> Result<String> {
        let docs = self
            .vectors
            .get(
                self.knowledge.process_collection(),
                &MetadataFilter::new(MetadataField::GlobalKey, global_key),
            )
            .await?;
        Ok(docs
            .into_iter()
            .map(|d| d.text)
            .collect::<Vec<_>>()
            .join(CONTEXT_SEPARATOR))
    }

    async fn synthesize(&self, question: &str, graph_answer: &str, passages: &[String]) -> String {
        let user = format!(
            "[그래프 결과]: {graph_answer}\n\n[상세 정의서]: {}\n\n질문: {question}",
            passages.join(CONTEXT_SEPARATOR)
        );
        let raw = match self.completion.complete(SYSTEM_PROMPT, &user, 0.0).await {
            Ok(text) => text,
            Err(e) => {
                warn!("Síntesis de la respuesta fallida: {e}");
                if graph_answer.is_empty() {
                    NO_ANSWER.to_string()
                } else {
                    graph_answer.to_string()
                }
            }
        };
        sanitize_answer(&raw)
    }
}

fn is_domain_question(question: &str) -> bool {
    DOMAIN_KEYWORDS.iter().any(|k| question.contains(k))
}

static BRACKET_KEY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[([\d.]+_?[^\]]+)\]").expect("regex de clave entre corchetes"));
static HEADING_KEY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"#\s*([\d.]+_?[^\n]+)").expect("regex de clave en encabezado"));

/// Clave del último elemento del que habló el asistente.
pub fn extract_active_context(history: &[ChatMessage]) -> Option<String> {
    history
        .iter()
        .rev()
        .filter(|m| m.is_assistant())
        .find_map(|m| {
            BRACKET_KEY_RE
                .captures(&m.content)
                .or_else(|| HEADING_KEY_RE.captures(&m.content))
                .map(|c| c[1].trim().to_string())
        })
}

pub fn rewrite_query(question: &str, active_context: Option<&str>) -> String {
    let query = question
        .replace("서브프로세스", "Sub Process")
        .replace("액티비티", "Activity");
    match active_context {
        Some(ctx) => format!("항목 {ctx} 에 대한 {query}"),
        None => query,
    }
}

static LEAKED_CLAUSE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^\s*(RETURN|MATCH|CALL)\s").expect("regex de cláusulas"));
static CYPHER_TAIL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)cypher\s*query\s*:.*$").expect("regex de cola cypher"));
static INLINE_SHORTEST_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bshortestPath\s*\([^\n]*\)").expect("regex de shortestPath"));

/// Quita del texto generado cualquier fragmento de consulta filtrado.
pub fn sanitize_answer(text: &str) -> String {
    let without_tail = CYPHER_TAIL_RE.replace(text, "");
    without_tail
        .lines()
        .filter(|line| !LEAKED_CLAUSE_RE.is_match(line))
        .map(|line| INLINE_SHORTEST_RE.replace_all(line, "").into_owned())
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}
