use axum::{
    extract::{Json, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::spawn;
use tracing::{error, info, warn};
use url::Url;

use crate::{
    app_state::{AppState, Status},
    graph::GraphQuery,
    ingest::{RebuildTarget, UnknownRebuildTarget},
    models::ChatMessage,
    visualize::GraphVisualization,
};

type ApiError = (StatusCode, Json<serde_json::Value>);

fn api_error(code: StatusCode, message: impl Into<String>) -> ApiError {
    (code, Json(json!({ "error": message.into() })))
}

// --- Payloads y Respuestas de la API ---

#[derive(Deserialize)]
pub struct ChatPayload {
    message: String,
    #[serde(default)]
    history: Vec<ChatMessage>,
}

#[derive(Serialize)]
pub struct ChatResponse {
    response: String,
    graph_data: GraphVisualization,
}

#[derive(Deserialize)]
pub struct BuildParamsQuery {
    #[serde(default)]
    target: String,
    limit: Option<usize>,
}

// --- Router ---

pub fn create_router(app_state: AppState) -> Router {
    Router::new()
        .route("/api/chat", post(chat_handler))
        .route("/api/build", post(build_handler))
        .route("/api/status", get(status_handler))
        .route("/api/neo4j-info", get(neo4j_info_handler))
        .with_state(app_state)
}

// --- Handlers ---

/// Un mensaje vacío también llega al motor, que lo trata como charla.
#[axum::debug_handler]
async fn chat_handler(
    State(state): State<AppState>,
    Json(payload): Json<ChatPayload>,
) -> Json<ChatResponse> {
    let answer = state
        .engine
        .classify_and_answer(&payload.message, &payload.history)
        .await;
    Json(ChatResponse {
        response: answer.answer_text,
        graph_data: answer.graph_visualization,
    })
}

/// Lanza la reconstrucción en segundo plano; el progreso se consulta en
/// `/api/status`.
#[axum::debug_handler]
async fn build_handler(
    State(state): State<AppState>,
    Query(params): Query<BuildParamsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let target: RebuildTarget = params
        .target
        .parse()
        .map_err(|e: UnknownRebuildTarget| {
            api_error(StatusCode::BAD_REQUEST, e.to_string())
        })?;

    if !Status::try_begin(&state.status, "Iniciando reconstrucción...") {
        return Err(api_error(
            StatusCode::CONFLICT,
            "Ya hay una reconstrucción en curso.",
        ));
    }

    info!("Reconstrucción solicitada: target={} limit={:?}", target.as_str(), params.limit);
    spawn(async move {
        let result = state
            .builder
            .rebuild_knowledge(&state.knowledge, target, params.limit, Some(state.status.as_ref()))
            .await;

        Status::update(&state.status, |status| {
            status.is_busy = false;
            status.progress = 0.0;
            match &result {
                Ok(summary) => status.message = summary.to_string(),
                Err(err) => {
                    status.message = format!("Error en la reconstrucción: {err}");
                    error!("Error de reconstrucción: {err:#}");
                }
            }
        });
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "message": format!("Reconstrucción iniciada ({})", target.as_str()) })),
    ))
}

#[axum::debug_handler]
async fn status_handler(State(state): State<AppState>) -> Json<Status> {
    Json(Status::snapshot(&state.status))
}

#[axum::debug_handler]
async fn neo4j_info_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    let browser_url = browser_url(&state.config.neo4j_uri);
    let Some(graph) = &state.graph else {
        return Json(json!({ "status": "unavailable", "browser_url": browser_url }));
    };

    match graph.execute(GraphQuery::new("RETURN 1 AS ok").returns(&["ok"])).await {
        Ok(_) => Json(json!({ "status": "ok", "browser_url": browser_url })),
        Err(e) => {
            warn!("Error en el health check de Neo4j: {e}");
            Json(json!({ "status": "unavailable", "browser_url": browser_url }))
        }
    }
}

/// URL del Neo4j Browser (http, puerto 7474) a partir de la URI bolt.
fn browser_url(neo4j_uri: &str) -> String {
    match Url::parse(neo4j_uri) {
        Ok(url) => match url.host_str() {
            Some(host) => format!("http://{host}:7474/"),
            None => "http://localhost:7474/".to_string(),
        },
        Err(_) => "http://localhost:7474/".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use crate::app_state::KnowledgeContext;
    use crate::config::{AppConfig, LlmProvider, VectorBackend};
    use crate::graph::GraphStore;
    use crate::ingest::{BuildLayout, KnowledgeBuilder};
    use crate::rag::{QueryEngine, GREETING};
    use crate::testing::{FakeGraph, KeywordEmbedder, ScriptedCompletion};
    use crate::vector_store::LocalVectorStore;

    fn config(dir: &std::path::Path) -> AppConfig {
        AppConfig {
            neo4j_uri: "bolt://graph.internal:7687".into(),
            neo4j_user: "neo4j".into(),
            neo4j_password: "secret".into(),
            server_addr: "127.0.0.1:0".into(),
            llm_provider: LlmProvider::OpenAI,
            llm_embedding_model: "emb".into(),
            llm_chat_model: "chat".into(),
            embedding_dimensions: 3,
            dataset_dir: dir.join("dataset"),
            database_dir: dir.join("database"),
            vector_backend: VectorBackend::Local,
            process_collection: "process".into(),
            project_collection: "project".into(),
            manual_extension: ".pdf".into(),
        }
    }

    fn state(dir: &std::path::Path, replies: Vec<anyhow::Result<String>>, graph: Option<FakeGraph>) -> AppState {
        let cfg = config(dir);
        let vectors = Arc::new(LocalVectorStore::new(cfg.database_dir.clone()));
        let graph = graph.map(|g| Arc::new(g) as Arc<dyn GraphStore>);
        let embedder = Arc::new(KeywordEmbedder::new(&["재고"]));
        let knowledge = Arc::new(KnowledgeContext::from_config(&cfg, vectors.clone()));
        let builder = Arc::new(KnowledgeBuilder::new(
            embedder.clone(),
            vectors.clone(),
            graph.clone(),
            BuildLayout::from_config(&cfg),
        ));
        let engine = Arc::new(QueryEngine::new(
            Arc::new(ScriptedCompletion::new(replies)),
            embedder,
            vectors,
            graph.clone(),
            knowledge.clone(),
        ));
        AppState {
            config: cfg,
            engine,
            builder,
            knowledge,
            graph,
            status: Arc::new(Mutex::new(Status::ready("listo"))),
        }
    }

    #[tokio::test]
    async fn chat_returns_engine_answer() {
        let dir = tempfile::tempdir().unwrap();
        let st = state(dir.path(), vec![Ok(r#"{"route":"chat","confidence":1.0}"#.into())], None);
        let Json(res) = chat_handler(
            State(st),
            Json(ChatPayload {
                message: "안녕".into(),
                history: Vec::new(),
            }),
        )
        .await;
        assert_eq!(res.response, GREETING);
        assert!(res.graph_data.nodes.is_empty());
    }

    #[tokio::test]
    async fn empty_chat_message_gets_greeting() {
        let dir = tempfile::tempdir().unwrap();
        // Sin respuestas programadas: el enrutado no debe necesitar al LLM.
        let st = state(dir.path(), Vec::new(), None);
        let Json(res) = chat_handler(
            State(st),
            Json(ChatPayload {
                message: "  ".into(),
                history: Vec::new(),
            }),
        )
        .await;
        assert_eq!(res.response, GREETING);
        assert!(res.graph_data.nodes.is_empty());
    }

    #[tokio::test]
    async fn build_rejects_unknown_target_and_concurrent_runs() {
        let dir = tempfile::tempdir().unwrap();
        let st = state(dir.path(), Vec::new(), None);

        let bad = build_handler(
            State(st.clone()),
            Query(BuildParamsQuery {
                target: "everything".into(),
                limit: None,
            }),
        )
        .await
        .err()
        .unwrap();
        assert_eq!(bad.0, StatusCode::BAD_REQUEST);

        assert!(Status::try_begin(&st.status, "ocupado"));
        let busy = build_handler(
            State(st.clone()),
            Query(BuildParamsQuery {
                target: "process".into(),
                limit: Some(1),
            }),
        )
        .await
        .err()
        .unwrap();
        assert_eq!(busy.0, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn neo4j_info_reports_health() {
        let dir = tempfile::tempdir().unwrap();
        let Json(down) = neo4j_info_handler(State(state(dir.path(), Vec::new(), None))).await;
        assert_eq!(down["status"], "unavailable");
        assert_eq!(down["browser_url"], "http://graph.internal:7474/");

        let Json(up) =
            neo4j_info_handler(State(state(dir.path(), Vec::new(), Some(FakeGraph::new())))).await;
        assert_eq!(up["status"], "ok");

        let Json(failing) =
            neo4j_info_handler(State(state(dir.path(), Vec::new(), Some(FakeGraph::failing())))).await;
        assert_eq!(failing["status"], "unavailable");
    }

    #[test]
    fn browser_url_falls_back_to_localhost() {
        assert_eq!(browser_url("neo4j://10.0.0.5:7687"), "http://10.0.0.5:7474/");
        assert_eq!(browser_url("no es una uri"), "http://localhost:7474/");
    }
}
