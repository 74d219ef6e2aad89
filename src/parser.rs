//! Parser estructural de los documentos de proceso (markdown exportado) y
//! troceado de texto plano para los manuales.
//!
//! Formato esperado de un documento:
//!
//! ```text
//! # 항목 정보: [103906_재고관리]
//! ## [기본정보] 항목: [103906_재고관리]
//! ...
//! ## [상세속성] 항목: [103906_재고관리]
//! #### 담당자
//! 홍길동
//! ## [연관항목] 항목: [103906_재고관리]
//! - 연관 No. 1
//!   - **항목 식별 정보 (Item Identity)**: [104001_출하]
//!   - **선행 프로세스**: 출하
//! ```

use std::io::Read;
use std::path::Path;

use anyhow::{anyhow, Result};
use once_cell::sync::Lazy;
use quick_xml::events::Event;
use quick_xml::Reader;
use regex::Regex;
use tracing::debug;

use crate::models::{AttributePair, ParsedDocument, RelatedItem, SectionChunk, UNKNOWN_KEY};

/// Nombre de la sección de atributos detallados.
pub const ATTRIBUTES_SECTION: &str = "상세속성";
/// Nombre de la sección de elementos relacionados.
pub const RELATED_SECTION: &str = "연관항목";
/// Etiqueta de relación cuando ninguna línea etiquetada es válida.
pub const DEFAULT_RELATION_LABEL: &str = "연관";

/// Etiquetas que nunca se usan como nombre de relación (identificadores y
/// accesos directos).
// TODO: contrastar la lista con el corpus completo; una etiqueta nueva de
// identificador acabaría como nombre de arista.
pub const RELATION_LABEL_EXCLUSIONS: [&str; 5] = [
    "시스템 ID",
    "System ID",
    "항목 식별 정보",
    "Item Identity",
    "바로가기",
];

pub const MANUAL_CHUNK_SIZE: usize = 1000;
pub const MANUAL_CHUNK_OVERLAP: usize = 100;

static HEADER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"#\s+항목\s+정보:\s+\[([^\]]+)\]").expect("regex de cabecera"));
static SECTION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"##\s+\[([^\]]+)\]\s+항목:\s+\[([^\]]+)\]").expect("regex de sección")
});
static ATTRIBUTE_MARK_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"####\s+").expect("regex de atributo"));
static RELATED_MARK_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"-\s+연관\s+No\.").expect("regex de relacionado"));
static IDENTITY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Identity\)\*\*:\s*\[([^\]]+)\]").expect("regex de identidad"));
static LABELED_LINE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"-\s+\*\*([^*]+)\*\*:\s*([^\n]+)").expect("regex de etiqueta"));

/// Parsea un documento completo. Nunca falla: una cabecera rota degrada a la
/// clave centinela y un bloque mal formado simplemente se omite.
pub fn parse_document(text: &str) -> ParsedDocument {
    let global_key = HEADER_RE
        .captures(text)
        .map(|c| c[1].trim().to_string())
        .filter(|k| !k.is_empty())
        .unwrap_or_else(|| UNKNOWN_KEY.to_string());

    let (process_id, process_name) = split_global_key(&global_key);

    let mut doc = ParsedDocument {
        process_id,
        process_name,
        global_key,
        attributes: Vec::new(),
        related: Vec::new(),
        chunks: Vec::new(),
    };

    let headings: Vec<_> = SECTION_RE.captures_iter(text).collect();
    for (i, caps) in headings.iter().enumerate() {
        let (Some(whole), Some(name), Some(owner)) = (caps.get(0), caps.get(1), caps.get(2)) else {
            continue;
        };
        let end = headings
            .get(i + 1)
            .and_then(|next| next.get(0))
            .map(|m| m.start())
            .unwrap_or(text.len());
        let section = name.as_str().trim().to_string();
        let owner_key = owner.as_str().trim().to_string();
        let content = text[whole.end()..end].trim();

        doc.chunks.push(SectionChunk {
            text: format!("[{owner_key}] [{section}]\n{content}"),
            section: section.clone(),
            owner_key,
        });

        if section.contains(ATTRIBUTES_SECTION) {
            doc.attributes.extend(parse_attributes(content));
        } else if section.contains(RELATED_SECTION) {
            doc.related.extend(parse_related(content));
        }
    }

    debug!(
        "Documento {} parseado: {} secciones, {} atributos, {} relacionados",
        doc.global_key,
        doc.chunks.len(),
        doc.attributes.len(),
        doc.related.len()
    );
    doc
}

/// Divide `processId_processName`; cada parte ausente vale "unknown".
pub fn split_global_key(global_key: &str) -> (String, String) {
    let mut parts = global_key.split('_').map(str::trim);
    let id = parts
        .next()
        .filter(|p| !p.is_empty())
        .unwrap_or(UNKNOWN_KEY)
        .to_string();
    let name = parts
        .next()
        .filter(|p| !p.is_empty())
        .unwrap_or(UNKNOWN_KEY)
        .to_string();
    (id, name)
}

fn parse_attributes(content: &str) -> Vec<AttributePair> {
    // El texto anterior al primer `####` no es un atributo.
    ATTRIBUTE_MARK_RE
        .split(content)
        .skip(1)
        .filter_map(|block| {
            let mut lines = block.trim().lines();
            let key = lines.next()?.trim();
            let value = lines.collect::<Vec<_>>().join("\n").trim().to_string();
            if key.is_empty() || value.is_empty() {
                return None;
            }
            Some(AttributePair {
                key: key.to_string(),
                value,
            })
        })
        .collect()
}

fn parse_related(content: &str) -> Vec<RelatedItem> {
    RELATED_MARK_RE
        .split(content)
        .filter(|block| !block.trim().is_empty())
        .filter_map(|block| {
            let global_key = IDENTITY_RE.captures(block)?[1].trim().to_string();
            let name = global_key
                .split('_')
                .nth(1)
                .map(str::to_string)
                .unwrap_or_else(|| global_key.clone());
            Some(RelatedItem {
                relation_label: relation_label(block),
                global_key,
                name,
            })
        })
        .collect()
}

/// Primera línea etiquetada cuya etiqueta no está excluida.
pub fn relation_label(block: &str) -> String {
    LABELED_LINE_RE
        .captures_iter(block)
        .map(|c| c[1].trim().to_string())
        .find(|label| {
            !RELATION_LABEL_EXCLUSIONS
                .iter()
                .any(|excluded| label.contains(excluded))
        })
        .unwrap_or_else(|| DEFAULT_RELATION_LABEL.to_string())
}

/// Trocea texto plano en ventanas de `chunk_size` caracteres con
/// `overlap` caracteres de solape.
pub fn chunk_text(text: &str, chunk_size: usize, overlap: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    if chars.is_empty() || chunk_size == 0 {
        return Vec::new();
    }
    let step = chunk_size.saturating_sub(overlap).max(1);

    let mut chunks = Vec::new();
    let mut start = 0;
    loop {
        let end = (start + chunk_size).min(chars.len());
        chunks.push(chars[start..end].iter().collect());
        if end == chars.len() {
            break;
        }
        start += step;
    }
    chunks
}

/// Extrae el texto de un manual. Los PDF se leen con `pdf-extract` y cada
/// página se prefija con `[Page N]`; en los PPTX cada diapositiva lleva
/// `[Slide N]`.
pub fn extract_manual_text(path: &Path) -> Result<String> {
    let extension = path
        .extension()
        .and_then(std::ffi::OsStr::to_str)
        .unwrap_or("")
        .to_lowercase();

    match extension.as_str() {
        "pdf" => {
            let raw = pdf_extract::extract_text(path)
                .map_err(|e| anyhow!("No se pudo extraer texto del PDF {}: {e}", path.display()))?;
            Ok(label_pages(&raw))
        }
        "pptx" => extract_pptx_text(path),
        "txt" | "md" => Ok(std::fs::read_to_string(path)?),
        other => Err(anyhow!(
            "Extensión de manual no soportada ('.{other}'): {}",
            path.display()
        )),
    }
}

fn label_pages(raw: &str) -> String {
    raw.split('\u{c}')
        .enumerate()
        .filter(|(_, page)| !page.trim().is_empty())
        .map(|(i, page)| format!("\n[Page {}] {}", i + 1, page.trim()))
        .collect::<Vec<_>>()
        .join("\n")
}

/// `ppt/slides/slideN.xml` → N.
fn slide_number(entry: &str) -> Option<usize> {
    entry
        .strip_prefix("ppt/slides/slide")?
        .strip_suffix(".xml")?
        .parse()
        .ok()
}

fn extract_pptx_text(path: &Path) -> Result<String> {
    let file = std::fs::File::open(path)?;
    let mut archive = zip::ZipArchive::new(file)
        .map_err(|e| anyhow!("PPTX ilegible {}: {e}", path.display()))?;

    let mut slides: Vec<(usize, String)> = archive
        .file_names()
        .filter_map(|name| slide_number(name).map(|n| (n, name.to_string())))
        .collect();
    slides.sort();

    let mut labelled = Vec::with_capacity(slides.len());
    for (i, (_, name)) in slides.iter().enumerate() {
        let mut xml = String::new();
        archive.by_name(name)?.read_to_string(&mut xml)?;
        labelled.push(format!("\n[Slide {}] {}", i + 1, slide_text(&xml)?));
    }
    debug!("{} diapositivas leídas de {}", labelled.len(), path.display());
    Ok(labelled.join("\n"))
}

/// Concatena las series de texto `<a:t>` de una diapositiva.
fn slide_text(xml: &str) -> Result<String> {
    let mut reader = Reader::from_str(xml);
    let mut runs: Vec<String> = Vec::new();
    let mut in_run = false;
    loop {
        match reader.read_event()? {
            Event::Start(e) if e.name().as_ref() == b"a:t" => {
                in_run = true;
                runs.push(String::new());
            }
            Event::End(e) if e.name().as_ref() == b"a:t" => in_run = false,
            Event::Text(t) if in_run => {
                if let Some(run) = runs.last_mut() {
                    run.push_str(&t.unescape()?);
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(runs
        .iter()
        .map(|r| r.trim())
        .filter(|r| !r.is_empty())
        .collect::<Vec<_>>()
        .join(" "))
}
