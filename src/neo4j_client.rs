use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use neo4rs::{query, Graph, Path, Query, Row};
use tracing::info;
use url::Url;

use crate::config::AppConfig;
use crate::graph::{
    GraphParam, GraphQuery, GraphRow, GraphStore, GraphValue, NativeNode, NativePath,
    NativeRelation,
};

pub async fn connect_from_config(cfg: &AppConfig) -> Result<Graph> {
    let url = Url::parse(&cfg.neo4j_uri)?;
    let host = url.host_str().unwrap_or("localhost");
    let port = url.port().unwrap_or(7687);
    let addr = format!("{host}:{port}");

    info!("Conectando a Neo4j en {addr}...");
    let graph = Graph::new(&addr, &cfg.neo4j_user, &cfg.neo4j_password).await?;
    info!("Conexión a Neo4j OK");
    Ok(graph)
}

/// Crea constraints básicos para las etiquetas usadas en el grafo:
/// :Process y :Attribute.
pub async fn ensure_schema(graph: &Graph) -> Result<()> {
    let statements = [
        // Process.id único (GlobalKey)
        "CREATE CONSTRAINT process_id IF NOT EXISTS
         FOR (p:Process)
         REQUIRE p.id IS UNIQUE",
        // Attribute.id único (GlobalKey + '_' + clave)
        "CREATE CONSTRAINT attribute_id IF NOT EXISTS
         FOR (a:Attribute)
         REQUIRE a.id IS UNIQUE",
    ];

    for stmt in statements {
        graph.run(query(stmt)).await?;
    }

    info!("Esquema de Neo4j asegurado (constraints básicos creados).");
    Ok(())
}

/// `GraphStore` sobre una conexión `neo4rs`.
#[derive(Clone)]
pub struct Neo4jGraphStore {
    graph: Arc<Graph>,
}

impl Neo4jGraphStore {
    pub fn new(graph: Arc<Graph>) -> Self {
        Self { graph }
    }
}

pub(crate) fn to_bolt_query(q: &GraphQuery) -> Query {
    let mut cypher = query(&q.text);
    for (key, value) in &q.params {
        cypher = match value {
            GraphParam::Str(s) => cypher.param(key, s.clone()),
            GraphParam::Int(i) => cypher.param(key, *i),
            GraphParam::Float(f) => cypher.param(key, *f),
            GraphParam::FloatList(v) => cypher.param(key, v.clone()),
        };
    }
    cypher
}

/// Lee cada columna declarada probando los tipos que proyectan nuestras
/// consultas. El driver no expone sus valores Bolt, así que la conversión
/// pasa por `Row::get` con tipos concretos.
pub(crate) fn convert_row(row: &Row, columns: &[String]) -> GraphRow {
    let mut out = GraphRow::new();
    for column in columns {
        if let Some(value) = read_column(row, column) {
            out.insert(column, value);
        }
    }
    out
}

fn read_column(row: &Row, column: &str) -> Option<GraphValue> {
    if let Some(path) = row.get::<Path>(column) {
        return Some(GraphValue::Path(convert_path(&path)));
    }
    if let Some(s) = row.get::<String>(column) {
        return Some(GraphValue::Str(s));
    }
    if let Some(i) = row.get::<i64>(column) {
        return Some(GraphValue::Int(i));
    }
    if let Some(f) = row.get::<f64>(column) {
        return Some(GraphValue::Float(f));
    }
    if let Some(b) = row.get::<bool>(column) {
        return Some(GraphValue::Bool(b));
    }
    if let Some(items) = row.get::<Vec<String>>(column) {
        return Some(GraphValue::StrList(items));
    }
    if let Some(items) = row.get::<Vec<f64>>(column) {
        return Some(GraphValue::FloatList(items));
    }
    None
}

fn convert_path(path: &Path) -> NativePath {
    let nodes: Vec<NativeNode> = path
        .nodes()
        .into_iter()
        .map(|node| NativeNode {
            element_id: node.id().to_string(),
            id: node.get::<String>("id"),
            name: node.get::<String>("name"),
        })
        .collect();

    // Los caminos de RELATED_TO se recorren en el sentido de la arista.
    let relations = path
        .rels()
        .into_iter()
        .zip(nodes.windows(2))
        .map(|(rel, pair)| NativeRelation {
            start: pair[0].clone(),
            end: pair[1].clone(),
            rel_type: rel.typ(),
        })
        .collect();

    NativePath { nodes, relations }
}

#[async_trait]
impl GraphStore for Neo4jGraphStore {
    async fn execute(&self, q: GraphQuery) -> Result<Vec<GraphRow>> {
        let mut cursor = self.graph.execute(to_bolt_query(&q)).await?;
        let mut rows = Vec::new();
        while let Some(row) = cursor.next().await? {
            rows.push(convert_row(&row, &q.columns));
        }
        Ok(rows)
    }

    async fn run(&self, q: GraphQuery) -> Result<()> {
        self.graph.run(to_bolt_query(&q)).await?;
        Ok(())
    }

    async fn delete_all(&self) -> Result<()> {
        self.graph
            .run(query(
                "MATCH (n) WHERE n:Process OR n:Attribute DETACH DELETE n",
            ))
            .await?;
        info!("Grafo de procesos vaciado.");
        Ok(())
    }

    async fn schema(&self) -> Result<String> {
        let node_rows = self
            .execute(
                GraphQuery::new(
                    "MATCH (n) WHERE n:Process OR n:Attribute
                     UNWIND labels(n) AS label
                     UNWIND keys(n) AS key
                     RETURN label, collect(DISTINCT key) AS props
                     ORDER BY label",
                )
                .returns(&["label", "props"]),
            )
            .await?;
        let rel_rows = self
            .execute(
                GraphQuery::new(
                    "MATCH (a)-[r]->(b) WHERE a:Process
                     RETURN DISTINCT labels(a)[0] AS src, type(r) AS rel, labels(b)[0] AS dst,
                            keys(r) AS props
                     LIMIT 20",
                )
                .returns(&["src", "rel", "dst", "props"]),
            )
            .await?;
        Ok(format_schema(&node_rows, &rel_rows))
    }
}

fn string_list(items: Option<&[String]>) -> String {
    items.map(|items| items.join(", ")).unwrap_or_default()
}

/// Formatea el esquema como lo esperan los prompts de generación.
pub(crate) fn format_schema(node_rows: &[GraphRow], rel_rows: &[GraphRow]) -> String {
    let mut out = String::from("Node properties:\n");
    for row in node_rows {
        if let Some(label) = row.str("label") {
            out.push_str(&format!("{label} {{{}}}\n", string_list(row.str_list("props"))));
        }
    }
    out.push_str("Relationship properties:\n");
    for row in rel_rows {
        if let Some(rel) = row.str("rel") {
            out.push_str(&format!("{rel} {{{}}}\n", string_list(row.str_list("props"))));
        }
    }
    out.push_str("The relationships:\n");
    for row in rel_rows {
        if let (Some(src), Some(rel), Some(dst)) = (row.str("src"), row.str("rel"), row.str("dst")) {
            out.push_str(&format!("(:{src})-[:{rel}]->(:{dst})\n"));
        }
    }
    out
}
