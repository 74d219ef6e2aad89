//! Completado y embeddings sobre Rig. Sólo OpenAI está conectado; los demás
//! proveedores de `LlmProvider` responden con error.
//!
//! El resto del sistema sólo ve los traits `CompletionService` y
//! `EmbeddingService`, así el router, el generador de consultas y la ingesta
//! se pueden probar con dobles en memoria.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use rig::completion::Prompt;
use rig::embeddings::EmbeddingModel;

use crate::config::{AppConfig, LlmProvider};

/// Servicio de completado: `complete(system, user, temperature) -> texto`.
#[async_trait]
pub trait CompletionService: Send + Sync {
    async fn complete(&self, system_prompt: &str, user_prompt: &str, temperature: f64)
        -> Result<String>;
}

/// Servicio de embeddings. Un texto vacío produce un vector vacío sin
/// llamar al proveedor.
#[async_trait]
pub trait EmbeddingService: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f64>>;
}

/// Normaliza la entrada de un embedding: saltos de línea a espacios.
/// Devuelve `None` si no queda texto útil.
pub fn prepare_embedding_input(text: &str) -> Option<String> {
    let flattened = text.replace('\n', " ");
    if flattened.trim().is_empty() {
        None
    } else {
        Some(flattened)
    }
}

/// Quita las vallas de código (```json ... ```) que a veces añade el modelo.
pub fn strip_code_fences(raw: &str) -> String {
    raw.replace("```json", "").replace("```", "").trim().to_string()
}

/// Gestor de LLMs y embeddings.
#[derive(Debug, Clone)]
pub struct LlmManager {
    pub provider: LlmProvider,
    pub embedding_model: String,
    pub chat_model: String,
}

impl LlmManager {
    /// Construye el manager a partir de la configuración.
    pub fn from_config(cfg: &AppConfig) -> Result<Self> {
        Ok(Self {
            provider: cfg.llm_provider.clone(),
            embedding_model: cfg.llm_embedding_model.clone(),
            chat_model: cfg.llm_chat_model.clone(),
        })
    }

    fn chat_model_name(&self) -> &str {
        if self.chat_model.is_empty() {
            "gpt-4o-mini"
        } else {
            self.chat_model.as_str()
        }
    }

    // ---------------------------------------------------------------------
    // EMBEDDINGS
    // ---------------------------------------------------------------------

    async fn embed_with_openai(&self, text: String) -> Result<Vec<f64>> {
        use rig::client::EmbeddingsClient as _;
        use rig::providers::openai::{self, TEXT_EMBEDDING_3_SMALL};

        let client = openai::Client::from_env();
        let model_name = if self.embedding_model.is_empty() {
            TEXT_EMBEDDING_3_SMALL
        } else {
            self.embedding_model.as_str()
        };
        let embedding_model = client.embedding_model(model_name);

        let embeddings = embedding_model.embed_texts(vec![text]).await?;
        embeddings
            .into_iter()
            .next()
            .map(|e| e.vec)
            .ok_or_else(|| anyhow!("El proveedor no devolvió ningún embedding"))
    }

    // ---------------------------------------------------------------------
    // CHAT / COMPLETION
    // ---------------------------------------------------------------------

    async fn complete_with_openai(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        temperature: f64,
    ) -> Result<String> {
        use rig::client::CompletionClient as _;
        use rig::providers::openai;

        let client = openai::Client::from_env();
        let agent = client
            .agent(self.chat_model_name())
            .preamble(system_prompt)
            .temperature(temperature)
            .build();

        let answer = agent.prompt(user_prompt).await?;
        Ok(answer)
    }
}

#[async_trait]
impl CompletionService for LlmManager {
    async fn complete(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        temperature: f64,
    ) -> Result<String> {
        match self.provider {
            LlmProvider::OpenAI => {
                self.complete_with_openai(system_prompt, user_prompt, temperature)
                    .await
            }
            ref other => Err(anyhow!(
                "Proveedor LLM {:?} aún no implementado para chat",
                other
            )),
        }
    }
}

#[async_trait]
impl EmbeddingService for LlmManager {
    async fn embed(&self, text: &str) -> Result<Vec<f64>> {
        let Some(input) = prepare_embedding_input(text) else {
            return Ok(Vec::new());
        };
        match self.provider {
            LlmProvider::OpenAI => self.embed_with_openai(input).await,
            ref other => Err(anyhow!(
                "Proveedor LLM {:?} aún no implementado para embeddings",
                other
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_input_is_not_embedded() {
        assert_eq!(prepare_embedding_input("  \n\t "), None);
        assert_eq!(
            prepare_embedding_input("재고\n관리").as_deref(),
            Some("재고 관리")
        );
    }

    #[test]
    fn blank_text_short_circuits_before_provider() {
        // Gemini no está implementado: si se llamara al proveedor fallaría.
        let manager = LlmManager {
            provider: LlmProvider::Gemini,
            embedding_model: String::new(),
            chat_model: String::new(),
        };
        let vector = tokio_test::block_on(manager.embed("   ")).unwrap();
        assert!(vector.is_empty());
        assert!(tokio_test::block_on(manager.embed("texto")).is_err());
    }

    #[test]
    fn code_fences_are_stripped() {
        assert_eq!(
            strip_code_fences("```json\n{\"route\":\"graph\"}\n```"),
            "{\"route\":\"graph\"}"
        );
    }
}
