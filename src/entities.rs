//! Extracción de las dos entidades de una pregunta "A와 B는 어떻게 연결돼?"
//! y selección del mejor candidato del índice para cada término.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::models::VectorHit;
use crate::parser::split_global_key;

/// Candidato de entidad resuelto contra el índice vectorial.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    /// GlobalKey del proceso.
    pub id: String,
    pub name: String,
    pub score: f64,
}

impl Candidate {
    /// El nombre es el del proceso (segunda parte de la GlobalKey); si el hit
    /// no trae clave se usa la sección.
    pub fn from_hit(hit: &VectorHit) -> Option<Self> {
        let id = hit.metadata.global_key.clone()?;
        let (_, process_name) = split_global_key(&id);
        let name = if process_name == crate::models::UNKNOWN_KEY {
            hit.metadata.section.clone().unwrap_or_default()
        } else {
            process_name
        };
        Some(Self {
            id,
            name,
            score: hit.score,
        })
    }
}

static PAIR_WITH_SUFFIX_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(.+?)\s*(와|과|랑|하고|및)\s*(.+?)\s*(은|는|을|를|이|가)?\s*(어떻게|어떤|연결|관계|흐름|순서|단계|경로).*$",
    )
    .expect("regex de pares con sufijo")
});
static PAIR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(.+?)\s*(와|과|랑|하고|및)\s*(.+)$").expect("regex de pares"));
static TRAILING_PARTICLE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(은|는|을|를|이|가)\s*$").expect("regex de partículas"));

/// Devuelve `None` cuando la pregunta no es de relación entre dos entidades;
/// no es un error.
pub fn extract_two_entities(question: &str) -> Option<(String, String)> {
    let q = question.trim();
    if q.is_empty() {
        return None;
    }

    for pattern in [&*PAIR_WITH_SUFFIX_RE, &*PAIR_RE] {
        if let Some(caps) = pattern.captures(q) {
            let a = caps.get(1).map(|m| m.as_str().trim()).unwrap_or_default();
            let b = caps.get(3).map(|m| m.as_str().trim()).unwrap_or_default();
            let b = TRAILING_PARTICLE_RE.replace(b, "").trim().to_string();
            return Some((a.to_string(), b));
        }
    }

    if q.contains(',') {
        let parts: Vec<&str> = q.split(',').map(str::trim).filter(|p| !p.is_empty()).collect();
        if parts.len() >= 2 {
            return Some((parts[0].to_string(), parts[1].to_string()));
        }
    }

    None
}

/// Desempate determinista:
/// 1. nombre exacto;
/// 2. el término está contenido en el nombre (gana el nombre más corto);
/// 3. el término está contenido en el id;
/// 4. mayor puntuación de similitud (en empate, el primero).
pub fn pick_best_candidate<'a>(term: &str, candidates: &'a [Candidate]) -> Option<&'a Candidate> {
    let term = term.trim();

    if let Some(exact) = candidates.iter().find(|c| c.name.trim() == term) {
        return Some(exact);
    }

    if let Some(partial) = candidates
        .iter()
        .filter(|c| c.name.contains(term))
        .min_by_key(|c| c.name.chars().count())
    {
        return Some(partial);
    }

    if let Some(by_id) = candidates.iter().find(|c| c.id.contains(term)) {
        return Some(by_id);
    }

    candidates
        .iter()
        .reduce(|best, c| if c.score > best.score { c } else { best })
}
