//! Gremlin Server client speaking the HTTP endpoint, with a small
//! GraphSON v3 unwrapper so callers see plain JSON.

use std::collections::BTreeMap;

use anyhow::Context;
use async_trait::async_trait;
use cardbox_core::PERSON_LABEL;
use serde_json::{json, Value};

use crate::{GraphStore, StoreError, DEFAULT_TIMEOUT};

/// Graph store backed by a Gremlin Server HTTP endpoint. Scripts are
/// submitted with bindings so user-derived values never splice into the
/// script text.
#[derive(Debug, Clone)]
pub struct GremlinGraph {
    client: reqwest::Client,
    endpoint: String,
}

impl GremlinGraph {
    pub fn new(endpoint: impl Into<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .context("building gremlin client")?;
        let endpoint = endpoint.into().trim_end_matches('/').to_string();
        Ok(Self { client, endpoint })
    }

    async fn execute(&self, gremlin: &str, bindings: Value) -> Result<Value, StoreError> {
        let body = json!({"gremlin": gremlin, "bindings": bindings});
        let response = self.client.post(&self.endpoint).json(&body).send().await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(StoreError::Api {
                service: "graph",
                status: status.as_u16(),
                message,
            });
        }

        let reply: Value = response.json().await?;
        let data = reply.pointer("/result/data").cloned().unwrap_or(Value::Null);
        Ok(untype(&data))
    }
}

/// Strip GraphSON v3 type wrappers: `g:Map` pair arrays become objects,
/// every other `@type`/`@value` envelope collapses to its unwrapped value.
pub fn untype(value: &Value) -> Value {
    match value {
        Value::Object(map) => match (map.get("@type").and_then(Value::as_str), map.get("@value")) {
            (Some("g:Map"), Some(Value::Array(pairs))) => {
                let mut out = serde_json::Map::new();
                for pair in pairs.chunks(2) {
                    if let [key, entry] = pair {
                        let key = match untype(key) {
                            Value::String(text) => text,
                            other => other.to_string(),
                        };
                        out.insert(key, untype(entry));
                    }
                }
                Value::Object(out)
            }
            (Some(_), Some(inner)) => untype(inner),
            _ => {
                let mut out = serde_json::Map::new();
                for (key, entry) in map {
                    out.insert(key.clone(), untype(entry));
                }
                Value::Object(out)
            }
        },
        Value::Array(items) => Value::Array(items.iter().map(untype).collect()),
        other => other.clone(),
    }
}

fn first_u64(data: &Value) -> u64 {
    data.get(0).and_then(Value::as_u64).unwrap_or(0)
}

fn string_list(data: &Value) -> Vec<String> {
    data.as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// First hit of a `valueMap()` traversal as flat string properties. The
/// server wraps each property value in a list; only the first element is
/// kept.
fn flatten_value_map(data: &Value) -> BTreeMap<String, String> {
    let mut props = BTreeMap::new();
    if let Some(map) = data.get(0).and_then(Value::as_object) {
        for (key, value) in map {
            let flattened = match value {
                Value::Array(items) => items.first().cloned().unwrap_or(Value::Null),
                other => other.clone(),
            };
            if let Some(text) = flattened.as_str() {
                props.insert(key.clone(), text.to_string());
            } else if !flattened.is_null() {
                props.insert(key.clone(), flattened.to_string());
            }
        }
    }
    props
}

#[async_trait]
impl GraphStore for GremlinGraph {
    async fn vertex_exists(&self, id: &str) -> Result<bool, StoreError> {
        let data = self
            .execute("g.V(vid).limit(1).count()", json!({"vid": id}))
            .await?;
        Ok(first_u64(&data) > 0)
    }

    async fn upsert_vertex(
        &self,
        label: &str,
        id: &str,
        properties: &BTreeMap<String, String>,
    ) -> Result<(), StoreError> {
        if !self.vertex_exists(id).await? {
            self.execute(
                "g.addV(vlabel).property(T.id, vid)",
                json!({"vlabel": label, "vid": id}),
            )
            .await?;
        }

        if properties.is_empty() {
            return Ok(());
        }
        let mut script = String::from("g.V(vid)");
        let mut bindings = serde_json::Map::new();
        bindings.insert("vid".to_string(), Value::String(id.to_string()));
        for (i, (key, value)) in properties.iter().enumerate() {
            script.push_str(&format!(".property(k{i}, v{i})"));
            bindings.insert(format!("k{i}"), Value::String(key.clone()));
            bindings.insert(format!("v{i}"), Value::String(value.clone()));
        }
        self.execute(&script, Value::Object(bindings)).await?;
        Ok(())
    }

    async fn find_person_by_name(&self, name_lower: &str) -> Result<Option<String>, StoreError> {
        let data = self
            .execute(
                "g.V().hasLabel(vlabel).has('_name', pname).limit(1).id()",
                json!({"vlabel": PERSON_LABEL, "pname": name_lower}),
            )
            .await?;
        Ok(string_list(&data).into_iter().next())
    }

    async fn neighbors(&self, id: &str, edge_label: &str) -> Result<Vec<String>, StoreError> {
        let data = self
            .execute(
                "g.V(vid).both(elabel).id()",
                json!({"vid": id, "elabel": edge_label}),
            )
            .await?;
        Ok(string_list(&data))
    }

    async fn vertex_properties(&self, id: &str) -> Result<BTreeMap<String, String>, StoreError> {
        let data = self
            .execute("g.V(vid).valueMap()", json!({"vid": id}))
            .await?;
        Ok(flatten_value_map(&data))
    }

    async fn edge_exists(
        &self,
        from: &str,
        to: &str,
        edge_label: &str,
    ) -> Result<bool, StoreError> {
        let data = self
            .execute(
                "g.V(vfrom).outE(elabel).where(__.inV().hasId(vto)).count()",
                json!({"vfrom": from, "vto": to, "elabel": edge_label}),
            )
            .await?;
        Ok(first_u64(&data) > 0)
    }

    async fn add_edge(
        &self,
        from: &str,
        to: &str,
        edge_label: &str,
        weight: f64,
    ) -> Result<(), StoreError> {
        self.execute(
            "g.V(vfrom).addE(elabel).to(__.V(vto)).property('weight', w)",
            json!({"vfrom": from, "vto": to, "elabel": edge_label, "w": weight}),
        )
        .await?;
        Ok(())
    }

    async fn update_edge_weight(
        &self,
        from: &str,
        to: &str,
        edge_label: &str,
        weight: f64,
    ) -> Result<(), StoreError> {
        self.execute(
            "g.V(vfrom).outE(elabel).where(__.inV().hasId(vto)).property('weight', w)",
            json!({"vfrom": from, "vto": to, "elabel": edge_label, "w": weight}),
        )
        .await?;
        Ok(())
    }

    async fn drop_edges(&self, limit: usize) -> Result<u64, StoreError> {
        self.execute("g.E().limit(n).drop()", json!({"n": limit}))
            .await?;
        let data = self.execute("g.E().count()", json!({})).await?;
        Ok(first_u64(&data))
    }

    async fn drop_vertices(&self, limit: usize) -> Result<u64, StoreError> {
        self.execute("g.V().limit(n).drop()", json!({"n": limit}))
            .await?;
        let data = self.execute("g.V().count()", json!({})).await?;
        Ok(first_u64(&data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn untype_collapses_scalar_envelopes() {
        let typed = json!({"@type": "g:Int64", "@value": 3});
        assert_eq!(untype(&typed), json!(3));
    }

    #[test]
    fn untype_turns_map_pairs_into_objects() {
        let typed = json!({
            "@type": "g:Map",
            "@value": [
                "name", {"@type": "g:List", "@value": ["Edy Kim"]},
                "score", {"@type": "g:Int64", "@value": 3},
            ]
        });
        assert_eq!(untype(&typed), json!({"name": ["Edy Kim"], "score": 3}));
    }

    #[test]
    fn untype_recurses_through_lists_and_plain_objects() {
        let typed = json!({
            "result": {
                "data": {
                    "@type": "g:List",
                    "@value": [
                        {"@type": "g:Int64", "@value": 1},
                        "edy-1234",
                    ]
                }
            }
        });
        assert_eq!(
            untype(&typed),
            json!({"result": {"data": [1, "edy-1234"]}})
        );
    }

    #[test]
    fn value_maps_flatten_to_first_elements() {
        let data = json!([{
            "name": ["Edy Kim"],
            "_name": ["edy kim"],
            "email": ["edy@amazon.com"],
        }]);
        let props = flatten_value_map(&data);
        assert_eq!(props.get("name").map(String::as_str), Some("Edy Kim"));
        assert_eq!(props.get("_name").map(String::as_str), Some("edy kim"));
        assert_eq!(
            props.get("email").map(String::as_str),
            Some("edy@amazon.com")
        );
    }

    #[test]
    fn counts_read_the_first_element() {
        assert_eq!(first_u64(&json!([4])), 4);
        assert_eq!(first_u64(&json!([])), 0);
        assert_eq!(first_u64(&Value::Null), 0);
    }
}
