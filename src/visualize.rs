//! Normalización de filas de camino y montaje del grafo de vecindad que se
//! envía al visualizador.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::Result;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use tracing::warn;

use crate::app_state::KnowledgeContext;
use crate::graph::{GraphQuery, GraphRow, GraphStore, NativePath};
use crate::models::{MetadataField, MetadataFilter};
use crate::vector_store::VectorStore;

pub const DEFAULT_DEPTH: usize = 3;
pub const MAX_DEPTH: usize = 6;
pub const PATH_LABEL: &str = "PATH";
pub const NO_INFORMATION: &str = "정보없음";
const CONTENT_SEPARATOR: &str = "\n\n---\n\n";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PathNode {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PathLink {
    pub source: String,
    pub target: String,
    pub label: String,
    pub is_path: bool,
}

impl PathLink {
    fn path(source: String, target: String) -> Self {
        Self {
            source,
            target,
            label: PATH_LABEL.to_string(),
            is_path: true,
        }
    }
}

/// Camino encontrado, ya deduplicado por id de nodo.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PathPayload {
    pub nodes: Vec<PathNode>,
    pub links: Vec<PathLink>,
}

impl PathPayload {
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// "A → B → C" para el contexto de síntesis.
    pub fn describe(&self) -> String {
        self.nodes
            .iter()
            .map(|n| n.name.as_str())
            .collect::<Vec<_>>()
            .join(" → ")
    }

    fn push_node(&mut self, seen: &mut HashSet<String>, id: String, name: Option<String>) {
        let id = id.trim().to_string();
        if id.is_empty() || !seen.insert(id.clone()) {
            return;
        }
        let name = name.filter(|n| !n.trim().is_empty()).unwrap_or_else(|| id.clone());
        self.nodes.push(PathNode { id, name });
    }
}

/// Forma de una fila de camino: con las listas paralelas añadidas al
/// reescribir la consulta, o sólo con el camino nativo del driver.
#[derive(Debug, Clone, PartialEq)]
pub enum PathRow {
    Projected {
        node_ids: Vec<String>,
        node_names: Vec<String>,
        rel_sources: Vec<String>,
        rel_targets: Vec<String>,
    },
    Native(NativePath),
}

impl PathRow {
    pub fn from_row(row: &GraphRow) -> Option<Self> {
        if let (Some(ids), Some(sources)) = (row.str_list("nodeIds"), row.str_list("relSources")) {
            return Some(Self::Projected {
                node_ids: ids.to_vec(),
                node_names: list(row, "nodeNames").to_vec(),
                rel_sources: sources.to_vec(),
                rel_targets: list(row, "relTargets").to_vec(),
            });
        }
        row.path("p").cloned().map(Self::Native)
    }

    pub fn into_payload(self) -> PathPayload {
        let mut payload = PathPayload::default();
        let mut seen = HashSet::new();
        match self {
            Self::Projected {
                node_ids,
                node_names,
                rel_sources,
                rel_targets,
            } => {
                for (i, id) in node_ids.into_iter().enumerate() {
                    payload.push_node(&mut seen, id, node_names.get(i).cloned());
                }
                for (s, t) in rel_sources.into_iter().zip(rel_targets) {
                    if !s.trim().is_empty() && !t.trim().is_empty() {
                        payload.links.push(PathLink::path(s, t));
                    }
                }
            }
            Self::Native(path) => {
                for node in &path.nodes {
                    payload.push_node(&mut seen, node.key(), node.name.clone());
                }
                for rel in &path.relations {
                    let (s, t) = (rel.start.key(), rel.end.key());
                    if !s.is_empty() && !t.is_empty() {
                        payload.links.push(PathLink::path(s, t));
                    }
                }
            }
        }
        payload
    }
}

fn list<'a>(row: &'a GraphRow, key: &str) -> &'a [String] {
    row.str_list(key).unwrap_or_default()
}

/// Elemento `i` de una lista paralela, si no está vacío.
fn nth(items: &[String], i: usize) -> Option<String> {
    items
        .get(i)
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Sólo se usa la primera fila: las consultas de camino devuelven uno.
pub fn normalize_path_rows(rows: &[GraphRow]) -> PathPayload {
    rows.first()
        .and_then(PathRow::from_row)
        .map(PathRow::into_payload)
        .unwrap_or_default()
}

static DEPTH_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d+)\s*(단계|depth|뎁스)").expect("regex de profundidad"));

/// Profundidad pedida en la pregunta ("5단계"), por defecto 3, acotada a [1, 6].
/// Un número que desborda `usize` cuenta como el máximo.
pub fn parse_depth(question: &str) -> usize {
    let Some(digits) = DEPTH_RE.captures(question).and_then(|c| c.get(1)) else {
        return DEFAULT_DEPTH;
    };
    digits
        .as_str()
        .parse::<usize>()
        .unwrap_or(MAX_DEPTH)
        .clamp(1, MAX_DEPTH)
}

/// Una sola consulta: raíz, sus atributos y un OPTIONAL MATCH por salto.
/// Cada colección sale como listas paralelas de textos.
pub fn neighborhood_query(root_id: &str, depth: usize) -> GraphQuery {
    let mut lines = vec![
        "MATCH (root:Process) WHERE root.id CONTAINS $targetPid OR root.display_id CONTAINS $targetPid WITH root LIMIT 1".to_string(),
        "OPTIONAL MATCH (root)-[:HAS_ATTRIBUTE]->(a:Attribute)".to_string(),
        "WITH root, collect(DISTINCT a) AS attrNodes".to_string(),
    ];
    let mut carried = vec!["root".to_string(), "attrNodes".to_string()];
    let mut returns = vec![
        "coalesce(root.id, elementId(root)) AS rootId".to_string(),
        "coalesce(root.name, root.id, elementId(root)) AS rootName".to_string(),
        "[x IN attrNodes | coalesce(x.id, elementId(x))] AS attrIds".to_string(),
        "[x IN attrNodes | coalesce(x.name, x.id, elementId(x))] AS attrNames".to_string(),
        "[x IN attrNodes | coalesce(toString(x.value), '')] AS attrValues".to_string(),
    ];
    let mut columns: Vec<String> = ["rootId", "rootName", "attrIds", "attrNames", "attrValues"]
        .iter()
        .map(|c| c.to_string())
        .collect();

    for i in 1..=depth {
        let prev = if i == 1 { "root".to_string() } else { format!("node{}", i - 1) };
        lines.push(format!(
            "OPTIONAL MATCH ({prev})-[rel{i}:RELATED_TO]->(node{i}:Process)"
        ));
        carried.push(format!("collect(DISTINCT node{i}) AS hop{i}"));
        carried.push(format!("collect(DISTINCT rel{i}) AS hopRels{i}"));
        returns.extend([
            format!("[x IN hop{i} | coalesce(x.id, elementId(x))] AS nodes{i}Ids"),
            format!("[x IN hop{i} | coalesce(x.name, x.id, elementId(x))] AS nodes{i}Names"),
            format!("[r IN hopRels{i} | coalesce(startNode(r).id, elementId(startNode(r)))] AS rels{i}Sources"),
            format!("[r IN hopRels{i} | coalesce(endNode(r).id, elementId(endNode(r)))] AS rels{i}Targets"),
            format!("[r IN hopRels{i} | coalesce(r.label, '')] AS rels{i}Labels"),
        ]);
        for suffix in ["Ids", "Names"] {
            columns.push(format!("nodes{i}{suffix}"));
        }
        for suffix in ["Sources", "Targets", "Labels"] {
            columns.push(format!("rels{i}{suffix}"));
        }
    }

    let text = format!(
        "{}\nWITH {}\nRETURN {}",
        lines.join("\n"),
        carried.join(", "),
        returns.join(",\n       ")
    );
    let mut q = GraphQuery::new(text).param("targetPid", root_id.trim());
    q.columns = columns;
    q
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VizNode {
    pub id: String,
    pub name: String,
    pub group: u32,
    pub val: u32,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VizLink {
    pub source: String,
    pub target: String,
    pub label: String,
    pub is_path: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GraphVisualization {
    pub nodes: Vec<VizNode>,
    pub links: Vec<VizLink>,
    pub path: PathPayload,
}

/// Acumula nodos y enlaces sin repetir ids ni claves (source, target, label).
#[derive(Default)]
struct VisualizationBuilder {
    nodes: Vec<VizNode>,
    node_ids: HashSet<String>,
    links: Vec<VizLink>,
    link_keys: HashSet<(String, String, String)>,
}

impl VisualizationBuilder {
    fn add_node(&mut self, node: VizNode) {
        if !node.id.is_empty() && self.node_ids.insert(node.id.clone()) {
            self.nodes.push(node);
        }
    }

    fn add_link(&mut self, source: &str, target: &str, label: &str, is_path: bool) {
        if source.is_empty() || target.is_empty() {
            return;
        }
        let key = (source.to_string(), target.to_string(), label.to_string());
        if self.link_keys.insert(key) {
            self.links.push(VizLink {
                source: source.to_string(),
                target: target.to_string(),
                label: label.to_string(),
                is_path,
            });
        }
    }

    fn finish(self, path: &PathPayload) -> GraphVisualization {
        GraphVisualization {
            nodes: self.nodes,
            links: self.links,
            path: path.clone(),
        }
    }
}

fn titled(name: &str, content: Option<&String>) -> String {
    match content {
        Some(text) if !text.trim().is_empty() => format!("# {name}\n\n{text}"),
        _ => format!("# {name}\n\n{NO_INFORMATION}"),
    }
}

/// Monta el grafo de vecindad alrededor de la entidad raíz y lo fusiona con
/// el camino encontrado.
#[derive(Clone)]
pub struct VisualizationAssembler {
    graph: Option<Arc<dyn GraphStore>>,
    vectors: Arc<dyn VectorStore>,
    collection: String,
    /// Último recurso: el fichero fuente `<id>.md` del dataset.
    files: Option<Arc<KnowledgeContext>>,
}

impl VisualizationAssembler {
    pub fn new(
        graph: Option<Arc<dyn GraphStore>>,
        vectors: Arc<dyn VectorStore>,
        collection: impl Into<String>,
    ) -> Self {
        Self {
            graph,
            vectors,
            collection: collection.into(),
            files: None,
        }
    }

    pub fn with_source_files(mut self, files: Arc<KnowledgeContext>) -> Self {
        self.files = Some(files);
        self
    }

    pub async fn build_neighborhood(
        &self,
        question: &str,
        root_id: Option<&str>,
        full_text: &mut HashMap<String, String>,
        path: &PathPayload,
    ) -> GraphVisualization {
        let mut builder = VisualizationBuilder::default();
        let depth = parse_depth(question);

        let row = match (&self.graph, root_id) {
            (Some(graph), Some(root)) if !root.trim().is_empty() => {
                let q = neighborhood_query(root, depth);
                match graph.execute(q).await {
                    Ok(rows) => rows.into_iter().next(),
                    Err(e) => {
                        warn!("Consulta de vecindad fallida: {e}");
                        None
                    }
                }
            }
            _ => None,
        };

        // Ids a enriquecer con el texto completo del índice.
        let mut ids: Vec<String> = path.nodes.iter().map(|n| n.id.clone()).collect();
        if let Some(row) = &row {
            ids.extend(row.str("rootId").map(str::to_string));
            for i in 1..=depth {
                ids.extend(list(row, &format!("nodes{i}Ids")).iter().cloned());
            }
        }
        for id in ids {
            if !full_text.contains_key(&id) {
                if let Some(text) = self.lookup_content(&id).await {
                    full_text.insert(id, text);
                }
            }
        }

        for node in &path.nodes {
            builder.add_node(VizNode {
                id: node.id.clone(),
                name: node.name.clone(),
                group: 1,
                val: 15,
                content: titled(&node.name, full_text.get(&node.id)),
            });
        }
        for link in &path.links {
            builder.add_link(&link.source, &link.target, PATH_LABEL, true);
        }

        if let Some(row) = &row {
            if let Some(root_id) = row.str("rootId").filter(|id| !id.trim().is_empty()) {
                let root_id = root_id.to_string();
                let root_name = row
                    .str("rootName")
                    .filter(|n| !n.trim().is_empty())
                    .map(str::to_string)
                    .unwrap_or_else(|| root_id.clone());
                builder.add_node(VizNode {
                    content: titled(&root_name, full_text.get(&root_id)),
                    id: root_id.clone(),
                    name: root_name,
                    group: 1,
                    val: 10,
                });

                let (names, values) = (list(row, "attrNames"), list(row, "attrValues"));
                for (j, attr_id) in list(row, "attrIds").iter().enumerate() {
                    if attr_id.trim().is_empty() {
                        continue;
                    }
                    builder.add_node(VizNode {
                        id: attr_id.clone(),
                        name: nth(names, j).unwrap_or_else(|| attr_id.clone()),
                        group: 0,
                        val: 5,
                        content: values.get(j).cloned().unwrap_or_default(),
                    });
                    builder.add_link(&root_id, attr_id, "HAS_ATTRIBUTE", false);
                }
            }

            for i in 1..=depth {
                let names = list(row, &format!("nodes{i}Names"));
                for (j, id) in list(row, &format!("nodes{i}Ids")).iter().enumerate() {
                    if id.trim().is_empty() {
                        continue;
                    }
                    let name = nth(names, j).unwrap_or_else(|| id.clone());
                    builder.add_node(VizNode {
                        content: titled(&name, full_text.get(id)),
                        id: id.clone(),
                        name,
                        group: i as u32 + 2,
                        val: 10,
                    });
                }
                let targets = list(row, &format!("rels{i}Targets"));
                let labels = list(row, &format!("rels{i}Labels"));
                for (j, source) in list(row, &format!("rels{i}Sources")).iter().enumerate() {
                    let Some(target) = targets.get(j) else {
                        continue;
                    };
                    let label = nth(labels, j)
                        .unwrap_or_else(|| crate::parser::DEFAULT_RELATION_LABEL.to_string());
                    builder.add_link(source.trim(), target.trim(), &label, false);
                }
            }
        }

        builder.finish(path)
    }

    /// Búsqueda escalonada: GlobalKey → id corto (antes del primer `_`) →
    /// source `<id>.md` → fichero `<id>.md` en disco.
    async fn lookup_content(&self, id: &str) -> Option<String> {
        let short = id.split('_').next().unwrap_or(id).trim();
        let tiers = [
            MetadataFilter::new(MetadataField::GlobalKey, id.trim()),
            MetadataFilter::new(MetadataField::ProcessId, short),
            MetadataFilter::new(MetadataField::Source, format!("{}.md", id.trim())),
        ];
        for filter in &tiers {
            match self.fetch_documents(filter).await {
                Ok(text) if !text.is_empty() => return Some(text),
                Ok(_) => {}
                Err(e) => {
                    warn!("No se pudo leer el contenido de {id}: {e}");
                    break;
                }
            }
        }
        self.read_source_file(id).await
    }

    async fn read_source_file(&self, id: &str) -> Option<String> {
        let path = self.files.as_ref()?.file_path(&format!("{}.md", id.trim()))?;
        match tokio::fs::read_to_string(&path).await {
            Ok(text) if !text.trim().is_empty() => Some(text),
            Ok(_) => None,
            Err(e) => {
                warn!("No se pudo leer {}: {e}", path.display());
                None
            }
        }
    }

    async fn fetch_documents(&self, filter: &MetadataFilter) -> Result<String> {
        let docs = self.vectors.get(&self.collection, filter).await?;
        Ok(docs
            .into_iter()
            .map(|d| d.text)
            .collect::<Vec<_>>()
            .join(CONTENT_SEPARATOR))
    }
}
