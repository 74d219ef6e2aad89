//! Generación de consultas de camino (text-to-Cypher) con una puerta de
//! validación estricta: generar → validar → reescribir → ejecutar.

use std::sync::Arc;

use anyhow::Result;
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;
use tracing::debug;

use crate::llm::{strip_code_fences, CompletionService};

/// Límite de saltos de cualquier búsqueda de camino.
pub const MAX_HOPS: i64 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathMode {
    Shortest,
    Longest,
    Conditional,
    None,
}

impl PathMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Shortest => "shortest",
            Self::Longest => "longest",
            Self::Conditional => "conditional",
            Self::None => "none",
        }
    }
}

const LONGEST_VOCABULARY: &[&str] = &["최장", "가장 긴", "최대", "최장거리", "가장 먼", "longest"];
const CONDITIONAL_VOCABULARY: &[&str] =
    &["거쳐", "반드시", "포함", "경유", "must", "via", "through"];
const SHORTEST_VOCABULARY: &[&str] = &[
    "최단", "경로", "흐름", "순서", "단계", "부터", "까지", "shortest", "path", "route",
];

/// Se evalúa de arriba abajo; la primera coincidencia decide el modo.
const PATH_MODE_RULES: &[(&[&str], PathMode)] = &[
    (LONGEST_VOCABULARY, PathMode::Longest),
    (CONDITIONAL_VOCABULARY, PathMode::Conditional),
    (SHORTEST_VOCABULARY, PathMode::Shortest),
];

pub fn detect_path_mode(question: &str) -> PathMode {
    let q = question.trim().to_lowercase();
    PATH_MODE_RULES
        .iter()
        .find(|(vocabulary, _)| vocabulary.iter().any(|k| q.contains(k)))
        .map(|(_, mode)| *mode)
        .unwrap_or(PathMode::None)
}

static VIA_BEFORE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"([^\s,]+?)(?:을|를)?\s*(?:거쳐서|거쳐|경유해서|경유)").expect("regex de paso previo")
});
static VIA_AFTER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:반드시|포함해서|포함|경유해서|경유)\s+([^\s,]+)").expect("regex de paso posterior")
});
static VIA_ENGLISH_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:via|through|must\s+include)\s+([^\s,?]+)").expect("regex de paso en inglés")
});
static OBJECT_PARTICLE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(을|를|은|는)$").expect("regex de partícula"));

/// Término por el que el camino debe pasar ("C를 거쳐서", "반드시 C", "via C").
pub fn extract_must_pass_term(question: &str) -> Option<String> {
    for pattern in [&*VIA_BEFORE_RE, &*VIA_AFTER_RE, &*VIA_ENGLISH_RE] {
        if let Some(m) = pattern.captures(question).and_then(|c| c.get(1)) {
            let term = OBJECT_PARTICLE_RE.replace(m.as_str().trim(), "").to_string();
            if !term.is_empty() {
                return Some(term);
            }
        }
    }
    None
}

/// Descripción en lenguaje natural de la tarea para el generador.
pub fn describe_task(mode: PathMode) -> String {
    let mut task = format!(
        "Find {} path from fromId=$fromId to toId=$toId with maxHops=$maxHops",
        mode.as_str()
    );
    if mode == PathMode::Conditional {
        task.push_str(" and mustPassId=$mustPassId");
    }
    task
}

const PATH_CYPHER_TEMPLATE: &str = r#"
You are a Neo4j Cypher generator for PATH queries ONLY.

Schema:
{schema}

Hard Rules (must follow):
1) Use label :Process only.
2) Match nodes by id property only (GlobalKey). Never use name for matching.
3) You MUST return a single path variable named p: RETURN p
4) Never write any explanation. Output ONLY Cypher.
5) Read-only query only. Do NOT use: CREATE, MERGE, DELETE, SET, CALL dbms, LOAD CSV, apoc.* except explicitly allowed below.

Allowed patterns by mode:
- shortest:
MATCH (a:Process {id: $fromId}), (b:Process {id: $toId})
MATCH p = shortestPath((a)-[:RELATED_TO*..8]->(b))
RETURN p

- longest (uses APOC):
MATCH (a:Process {id: $fromId}), (b:Process {id: $toId})
CALL apoc.algo.allSimplePaths(a, b, 'RELATED_TO>', $maxHops) YIELD path
WITH path AS p
RETURN p
ORDER BY length(p) DESC
LIMIT 1

- conditional (must pass $mustPassId):
MATCH (a:Process {id: $fromId}), (b:Process {id: $toId})
MATCH p = (a)-[:RELATED_TO*..8]->(b)
WHERE any(n IN nodes(p) WHERE n.id = $mustPassId)
RETURN p
LIMIT 1

User Question:
{question}
"#;

const GENERATOR_SYSTEM_PROMPT: &str = "Return ONLY Cypher. No markdown. No explanation.";

pub fn build_generation_prompt(schema: &str, mode: PathMode, task: &str) -> String {
    PATH_CYPHER_TEMPLATE
        .trim()
        .replace("{schema}", schema)
        .replace("{question}", &format!("[mode={}] {task}", mode.as_str()))
}

/// Pide al LLM la consulta de camino (sin validar).
pub async fn generate_path_query(
    completion: &Arc<dyn CompletionService>,
    schema: &str,
    mode: PathMode,
) -> Result<String> {
    let prompt = build_generation_prompt(schema, mode, &describe_task(mode));
    let raw = completion
        .complete(GENERATOR_SYSTEM_PROMPT, &prompt, 0.0)
        .await?;
    let cypher = strip_code_fences(&raw);
    let cypher = cypher
        .strip_prefix("cypher")
        .map(str::trim_start)
        .unwrap_or(&cypher)
        .to_string();
    debug!("Cypher generado: {cypher}");
    Ok(cypher)
}

/// Motivo de rechazo de una consulta generada.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathQueryRejection {
    #[error("consulta vacía")]
    Empty,
    #[error("palabra clave prohibida: {0}")]
    ForbiddenKeyword(String),
    #[error("la consulta debe contener 'RETURN p'")]
    MissingReturnPath,
    #[error("no es una consulta de camino")]
    NotAPathQuery,
}

static FORBIDDEN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(CREATE|MERGE|DELETE|DETACH|SET|REMOVE|DROP|LOAD\s+CSV|CALL\s+DBMS|DBMS\.\w+|APOC\.LOAD\w*|APOC\.CYPHER\w*|APOC\.PERIODIC\w*|FOREACH)\b",
    )
    .expect("regex de palabras prohibidas")
});
static RETURN_P_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bRETURN\s+p\b").expect("regex de RETURN p"));
const PATH_CONSTRUCTS: [&str; 4] = [
    "SHORTESTPATH",
    "NODES(P)",
    "RELATIONSHIPS(P)",
    "ALLSIMPLEPATHS",
];

/// Puerta de validación pura: sólo lectura, `RETURN p` y algún constructo
/// de camino.
pub fn validate_path_query(cypher: &str) -> Result<(), PathQueryRejection> {
    if cypher.trim().is_empty() {
        return Err(PathQueryRejection::Empty);
    }
    if let Some(m) = FORBIDDEN_RE.find(cypher) {
        return Err(PathQueryRejection::ForbiddenKeyword(
            m.as_str().to_uppercase(),
        ));
    }
    if !RETURN_P_RE.is_match(cypher) {
        return Err(PathQueryRejection::MissingReturnPath);
    }
    let compact: String = cypher
        .to_uppercase()
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();
    if !PATH_CONSTRUCTS.iter().any(|c| compact.contains(c)) {
        return Err(PathQueryRejection::NotAPathQuery);
    }
    Ok(())
}

static MODIFIERS_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)\b(ORDER\s+BY|SKIP|LIMIT)\b.*$").expect("regex de modificadores")
});

/// Columnas que devuelve una consulta envuelta, en orden.
pub const PATH_COLUMNS: [&str; 6] = [
    "p",
    "nodeIds",
    "nodeNames",
    "relSources",
    "relTargets",
    "relLabels",
];

// Listas paralelas de escalares: el driver no lee mapas literales.
const PATH_PROJECTIONS: &str = "  [n IN nodes(p) | coalesce(n.id, elementId(n))] AS nodeIds,
  [n IN nodes(p) | coalesce(n.name, n.id, elementId(n))] AS nodeNames,
  [r IN relationships(p) | coalesce(startNode(r).id, elementId(startNode(r)))] AS relSources,
  [r IN relationships(p) | coalesce(endNode(r).id, elementId(endNode(r)))] AS relTargets,
  [r IN relationships(p) | coalesce(r.label, type(r))] AS relLabels";

/// Sustituye el `RETURN p` final por `p` más las listas de `PATH_COLUMNS`.
/// Las proyecciones extra del modelo se conservan para que ORDER BY / SKIP /
/// LIMIT sigan viendo sus alias.
pub fn wrap_path_return(cypher: &str) -> String {
    let Some(found) = RETURN_P_RE.find_iter(cypher).last() else {
        return cypher.to_string();
    };
    let base = cypher[..found.start()].trim_end();
    let rest = &cypher[found.end()..];
    let (items, modifiers) = match MODIFIERS_RE.find(rest) {
        Some(m) => (&rest[..m.start()], m.as_str().trim()),
        None => (rest, ""),
    };
    let extra = items
        .trim()
        .strip_prefix(',')
        .map(str::trim)
        .unwrap_or_default();

    let mut out = format!("{base}\nRETURN\n  p,\n");
    if !extra.is_empty() {
        out.push_str(&format!("  {extra},\n"));
    }
    out.push_str(PATH_PROJECTIONS);
    if !modifiers.is_empty() {
        out.push('\n');
        out.push_str(modifiers);
    }
    out
}
