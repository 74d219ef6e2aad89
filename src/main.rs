// Módulos de la aplicación
mod api;
mod app_state;
mod config;
mod entities;
mod graph;
mod ingest;
mod llm;
mod models;
mod neo4j_client;
mod parser;
mod path_query;
mod rag;
mod router;
mod vector_store;
mod visualize;

#[cfg(test)]
mod testing;

use crate::app_state::{AppState, KnowledgeContext, Status};
use crate::config::VectorBackend;
use crate::graph::GraphStore;
use crate::vector_store::VectorStore;
use axum::Router;
use std::sync::{Arc, Mutex};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // 1. Cargar .env e inicializar logging
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // 2. Cargar configuración
    let cfg = config::AppConfig::from_env().expect("Error al cargar la configuración");

    // 3. Conectar a Neo4j. Sin grafo el servicio sigue en modo sólo-vectores.
    let graph: Option<Arc<dyn GraphStore>> = match neo4j_client::connect_from_config(&cfg).await {
        Ok(graph) => {
            if let Err(e) = neo4j_client::ensure_schema(&graph).await {
                warn!("No se pudo asegurar el esquema de Neo4j: {e}");
            }
            Some(Arc::new(neo4j_client::Neo4jGraphStore::new(Arc::new(graph))))
        }
        Err(e) => {
            warn!("Neo4j no disponible, se desactiva la búsqueda de caminos: {e}");
            None
        }
    };

    // 4. Índice vectorial
    let vectors: Arc<dyn VectorStore> = match (cfg.vector_backend, &graph) {
        (VectorBackend::Neo4j, Some(g)) => {
            info!("Índice vectorial en Neo4j ({} dimensiones)", cfg.embedding_dimensions);
            Arc::new(vector_store::Neo4jVectorStore::new(g.clone(), cfg.embedding_dimensions))
        }
        (VectorBackend::Neo4j, None) => {
            warn!("Backend neo4j sin grafo disponible; se usa el índice local");
            Arc::new(vector_store::LocalVectorStore::new(cfg.database_dir.clone()))
        }
        (VectorBackend::Local, _) => {
            info!("Índice vectorial local en {}", cfg.database_dir.display());
            Arc::new(vector_store::LocalVectorStore::new(cfg.database_dir.clone()))
        }
    };

    // 5. Inicializar gestor de LLMs
    let llm_manager =
        Arc::new(llm::LlmManager::from_config(&cfg).expect("Error inicializando LLM Manager"));

    // 6. Cachés de proceso y servicios
    let knowledge = Arc::new(KnowledgeContext::from_config(&cfg, vectors.clone()));
    if let Err(e) = knowledge.init().await {
        warn!("No se pudo inicializar el contexto de conocimiento: {e}");
    }

    let builder = Arc::new(ingest::KnowledgeBuilder::new(
        llm_manager.clone(),
        vectors.clone(),
        graph.clone(),
        ingest::BuildLayout::from_config(&cfg),
    ));
    let engine = Arc::new(rag::QueryEngine::new(
        llm_manager.clone(),
        llm_manager,
        vectors,
        graph.clone(),
        knowledge.clone(),
    ));

    let app_state = AppState {
        config: cfg.clone(),
        engine,
        builder,
        knowledge,
        graph,
        status: Arc::new(Mutex::new(Status::ready("Servidor listo."))),
    };

    // 7. Router de la API
    let app = Router::new()
        .merge(api::create_router(app_state.clone()))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    // 8. Iniciar el servidor
    let server_addr = &app_state.config.server_addr;
    let listener = tokio::net::TcpListener::bind(server_addr)
        .await
        .expect("No se pudo abrir la dirección del servidor");
    info!("🚀 Servidor escuchando en http://{}", server_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            info!("Señal de apagado recibida, iniciando cierre del servidor.");
        })
        .await
        .expect("Error en el servidor");

    info!("✅ Servidor cerrado correctamente.");
}
