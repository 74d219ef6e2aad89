//! Router de intención: clasifica cada pregunta en `graph`, `vector`, `both`
//! o `chat`.
//!
//! Primer nivel: el LLM a temperatura 0 con salida sólo-JSON. Si la llamada o
//! el parseo fallan, se aplica una cascada de palabras clave determinista.

use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::llm::{strip_code_fences, CompletionService};

/// Por debajo de esta confianza la clasificación no se considera accionable.
pub const MIN_CONFIDENCE: f64 = 0.35;
const DEFAULT_CONFIDENCE: f64 = 0.7;
const MAX_REASON_CHARS: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Route {
    Graph,
    Vector,
    Both,
    Chat,
}

impl Route {
    /// Rutas desconocidas colapsan a `Chat`.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "graph" => Self::Graph,
            "vector" => Self::Vector,
            "both" => Self::Both,
            _ => Self::Chat,
        }
    }

    pub fn wants_graph(&self) -> bool {
        matches!(self, Self::Graph | Self::Both)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PathModeHint {
    Shortest,
    Longest,
}

impl PathModeHint {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "shortest" => Some(Self::Shortest),
            "longest" => Some(Self::Longest),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RouteResult {
    pub route: Route,
    pub confidence: f64,
    pub reason: String,
    pub path_mode_hint: Option<PathModeHint>,
}

impl RouteResult {
    pub fn new(route: Route, confidence: f64, reason: &str) -> Self {
        Self {
            route,
            confidence: clamp_confidence(confidence),
            reason: reason.to_string(),
            path_mode_hint: None,
        }
    }

    pub fn with_hint(mut self, hint: Option<PathModeHint>) -> Self {
        self.path_mode_hint = hint;
        self
    }

    /// Construye un resultado normalizado a partir del JSON del modelo.
    pub fn from_json(value: &Value) -> Self {
        let route = value
            .get("route")
            .and_then(Value::as_str)
            .map(Route::parse)
            .unwrap_or(Route::Chat);
        let confidence = match value.get("confidence") {
            Some(Value::Number(n)) => n.as_f64().unwrap_or(DEFAULT_CONFIDENCE),
            Some(Value::String(s)) => s.trim().parse().unwrap_or(DEFAULT_CONFIDENCE),
            _ => DEFAULT_CONFIDENCE,
        };
        let reason: String = value
            .get("reason")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .trim()
            .chars()
            .take(MAX_REASON_CHARS)
            .collect();
        let hint = value
            .get("graphModeHint")
            .and_then(Value::as_str)
            .and_then(PathModeHint::parse);

        Self {
            route,
            confidence: clamp_confidence(confidence),
            reason,
            path_mode_hint: hint,
        }
    }
}

fn clamp_confidence(c: f64) -> f64 {
    if c.is_nan() {
        DEFAULT_CONFIDENCE
    } else {
        c.clamp(0.0, 1.0)
    }
}

const ROUTER_PROMPT: &str = r#"
너는 질문을 분류하는 Router다. 반드시 JSON만 출력한다.

[ROUTES]
- graph: 노드/관계/흐름/경로/연결/단계/최단/최장/전체 프로세스 맵 탐색
- vector: 특정 항목의 정의/설명/요약/담당자/시스템ID/규정/문서 내용 확인
- both: 관계 탐색 + 상세 내용(담당자 포함) 확인이 모두 필요한 경우
- chat: 인사/잡담/감정/일상/프로젝트와 무관한 단순 질문

[HINTS]
- "담당자가 누구야?", "~은 어디서 확인해?", "상세 내용 알려줘" -> vector 우선
- "최장/최단/경로" -> graphModeHint 필수

[OUTPUT]
{"route": "graph|vector|both|chat", "confidence": 0.0~1.0, "reason": "...", "graphModeHint": "shortest|longest|null"}
"#;

const PATH_VOCABULARY: &[&str] = &[
    "경로", "단계", "흐름", "연결", "관계", "최단", "최장", "route", "step", "flow", "connect",
    "relation", "shortest", "longest",
];
const LONGEST_VOCABULARY: &[&str] = &["최장", "가장 긴", "가장 먼", "최대", "longest"];
const SHORTEST_VOCABULARY: &[&str] = &["최단", "shortest"];
const DEFINITION_VOCABULARY: &[&str] = &[
    "정의", "설명", "요약", "근거", "문서", "규정", "담당자", "누구", "어디", "definition",
    "explanation", "summary", "basis", "document", "regulation", "owner", "who", "where",
];

fn mentions(question: &str, vocabulary: &[&str]) -> bool {
    let lowered = question.to_lowercase();
    vocabulary.iter().any(|k| lowered.contains(k))
}

/// Cascada de respaldo, evaluada en orden: la primera regla que aplica gana.
const FALLBACK_RULES: &[(&[&str], Route, f64)] = &[
    (PATH_VOCABULARY, Route::Graph, 0.6),
    (DEFINITION_VOCABULARY, Route::Vector, 0.6),
];
const FALLBACK_HINTS: &[(&[&str], PathModeHint)] = &[
    (LONGEST_VOCABULARY, PathModeHint::Longest),
    (SHORTEST_VOCABULARY, PathModeHint::Shortest),
];

/// Clasificación determinista por palabras clave.
pub fn keyword_route(question: &str) -> RouteResult {
    for (vocabulary, route, confidence) in FALLBACK_RULES {
        if mentions(question, vocabulary) {
            let hint = if *route == Route::Graph {
                FALLBACK_HINTS
                    .iter()
                    .find(|(vocab, _)| mentions(question, vocab))
                    .map(|(_, hint)| *hint)
            } else {
                None
            };
            return RouteResult::new(*route, *confidence, "keyword_fallback").with_hint(hint);
        }
    }
    RouteResult::new(Route::Chat, 0.5, "keyword_fallback")
}

#[derive(Clone)]
pub struct IntentRouter {
    completion: Arc<dyn CompletionService>,
}

impl IntentRouter {
    pub fn new(completion: Arc<dyn CompletionService>) -> Self {
        Self { completion }
    }

    pub async fn route(&self, user_input: &str) -> RouteResult {
        let question = user_input.trim();
        if question.is_empty() {
            return RouteResult::new(Route::Chat, 0.9, "empty");
        }

        match self.classify_with_llm(question).await {
            Ok(result) if result.confidence < MIN_CONFIDENCE => {
                debug!("Confianza baja ({:.2}), se trata como chat", result.confidence);
                RouteResult::new(Route::Chat, result.confidence, "low_confidence_fallback")
            }
            Ok(result) => result,
            Err(e) => {
                warn!("Router LLM no disponible, usando palabras clave: {e}");
                keyword_route(question)
            }
        }
    }

    async fn classify_with_llm(&self, question: &str) -> Result<RouteResult> {
        let raw = self.completion.complete(ROUTER_PROMPT, question, 0.0).await?;
        let value: Value = serde_json::from_str(&strip_code_fences(&raw))?;
        Ok(RouteResult::from_json(&value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedCompletion;
    use serde_json::json;

    fn router(replies: Vec<Result<String>>) -> IntentRouter {
        IntentRouter::new(Arc::new(ScriptedCompletion::new(replies)))
    }

    #[test]
    fn normalisation_keeps_values_in_range() {
        let cases = [
            json!({"route": "GRAPH ", "confidence": 3.2, "graphModeHint": "Longest"}),
            json!({"route": "sql", "confidence": -1, "graphModeHint": "widest"}),
            json!({"route": "vector", "confidence": "0.8"}),
            json!({"confidence": "alta", "reason": "x".repeat(500)}),
        ];
        let results: Vec<_> = cases.iter().map(RouteResult::from_json).collect();

        assert_eq!(results[0].route, Route::Graph);
        assert_eq!(results[0].confidence, 1.0);
        assert_eq!(results[0].path_mode_hint, Some(PathModeHint::Longest));
        assert_eq!(results[1].route, Route::Chat);
        assert_eq!(results[1].confidence, 0.0);
        assert_eq!(results[1].path_mode_hint, None);
        assert_eq!(results[2].confidence, 0.8);
        assert_eq!(results[3].confidence, 0.7);
        assert_eq!(results[3].reason.chars().count(), 200);
        for r in &results {
            assert!((0.0..=1.0).contains(&r.confidence));
        }
    }

    #[tokio::test]
    async fn empty_question_is_chat_without_calling_llm() {
        let r = router(vec![]);
        let result = r.route("   ").await;
        assert_eq!(result.route, Route::Chat);
        assert_eq!(result.confidence, 0.9);
    }

    #[tokio::test]
    async fn parses_fenced_json_reply() {
        let r = router(vec![Ok(
            "```json\n{\"route\":\"both\",\"confidence\":0.8,\"reason\":\"관계+담당자\"}\n```".into(),
        )]);
        let result = r.route("재고관리와 출하 관계와 담당자").await;
        assert_eq!(result.route, Route::Both);
        assert_eq!(result.reason, "관계+담당자");
    }

    #[tokio::test]
    async fn low_confidence_downgrades_to_chat() {
        let r = router(vec![Ok(r#"{"route":"graph","confidence":0.2}"#.into())]);
        let result = r.route("재고 흐름").await;
        assert_eq!(result.route, Route::Chat);
        assert_eq!(result.reason, "low_confidence_fallback");
        assert_eq!(result.confidence, 0.2);
    }

    #[tokio::test]
    async fn invalid_reply_uses_keyword_cascade() {
        let r = router(vec![Ok("no es json".into())]);
        let result = r.route("재고에서 출하까지 최장 경로").await;
        assert_eq!(result.route, Route::Graph);
        assert_eq!(result.confidence, 0.6);
        assert_eq!(result.path_mode_hint, Some(PathModeHint::Longest));
        assert_eq!(result.reason, "keyword_fallback");
    }

    #[tokio::test]
    async fn transport_error_uses_keyword_cascade() {
        let r = router(vec![Err(anyhow::anyhow!("timeout"))]);
        let result = r.route("재고관리 담당자가 누구야?").await;
        assert_eq!(result.route, Route::Vector);
        assert_eq!(result.confidence, 0.6);
        assert_eq!(result.path_mode_hint, None);
    }

    #[test]
    fn keyword_cascade_order() {
        let shortest = keyword_route("Which is the shortest route?");
        assert_eq!(shortest.route, Route::Graph);
        assert_eq!(shortest.path_mode_hint, Some(PathModeHint::Shortest));

        let plain_graph = keyword_route("두 프로세스 관계");
        assert_eq!(plain_graph.path_mode_hint, None);

        let chat = keyword_route("오늘 점심 뭐 먹지");
        assert_eq!(chat.route, Route::Chat);
        assert_eq!(chat.confidence, 0.5);
    }
}
