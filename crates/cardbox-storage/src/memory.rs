//! In-memory fakes for every collaborator trait. Tests drive them directly
//! and the CLI wires them in for offline invocations.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use cardbox_core::{ObjectRef, ProcessingStatus, PERSON_LABEL};
use serde_json::Value;

use crate::{
    Cache, GraphStore, ObjectStore, PutRecordsOutcome, SearchIndex, SearchResults, StatusStore,
    StoreError, StreamRecord, StreamTransport, TextDetector,
};

fn service_failure(service: &'static str, status: u16) -> StoreError {
    StoreError::Api {
        service,
        status,
        message: "injected failure".to_string(),
    }
}

/// Records copy requests instead of moving bytes.
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    copies: Mutex<Vec<(ObjectRef, ObjectRef)>>,
    fail: AtomicBool,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn copies(&self) -> Vec<(ObjectRef, ObjectRef)> {
        self.copies.lock().expect("lock poisoned").clone()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn copy(&self, src: &ObjectRef, dest: &ObjectRef) -> Result<(), StoreError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(service_failure("s3", 500));
        }
        self.copies
            .lock()
            .expect("lock poisoned")
            .push((src.clone(), dest.clone()));
        Ok(())
    }
}

/// Serves preset text lines per object key; unknown keys fail like a
/// detector that cannot read the document.
#[derive(Debug, Default)]
pub struct MemoryTextDetector {
    lines: Mutex<HashMap<String, Vec<String>>>,
}

impl MemoryTextDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: impl Into<String>, lines: Vec<String>) {
        self.lines
            .lock()
            .expect("lock poisoned")
            .insert(key.into(), lines);
    }
}

#[async_trait]
impl TextDetector for MemoryTextDetector {
    async fn detect_lines(&self, object: &ObjectRef) -> Result<Vec<String>, StoreError> {
        self.lines
            .lock()
            .expect("lock poisoned")
            .get(&object.key)
            .cloned()
            .ok_or_else(|| service_failure("textract", 400))
    }
}

/// Captures successful puts and can inject terminal, transient, or partial
/// failures for a fixed number of upcoming calls.
#[derive(Debug, Default)]
pub struct MemoryStream {
    published: Mutex<Vec<(String, Vec<StreamRecord>)>>,
    calls: AtomicUsize,
    fail_remaining: AtomicUsize,
    fail_status: AtomicU16,
    partial_remaining: AtomicUsize,
}

impl MemoryStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_calls(&self, calls: usize, status: u16) {
        self.fail_remaining.store(calls, Ordering::SeqCst);
        self.fail_status.store(status, Ordering::SeqCst);
    }

    pub fn report_partial_failures(&self, calls: usize) {
        self.partial_remaining.store(calls, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn published(&self) -> Vec<(String, Vec<StreamRecord>)> {
        self.published.lock().expect("lock poisoned").clone()
    }
}

#[async_trait]
impl StreamTransport for MemoryStream {
    async fn put_records(
        &self,
        stream: &str,
        records: &[StreamRecord],
    ) -> Result<PutRecordsOutcome, StoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        if self.fail_remaining.load(Ordering::SeqCst) > 0 {
            self.fail_remaining.fetch_sub(1, Ordering::SeqCst);
            return Err(service_failure(
                "stream",
                self.fail_status.load(Ordering::SeqCst),
            ));
        }
        if self.partial_remaining.load(Ordering::SeqCst) > 0 {
            self.partial_remaining.fetch_sub(1, Ordering::SeqCst);
            return Ok(PutRecordsOutcome { failed: 1 });
        }

        self.published
            .lock()
            .expect("lock poisoned")
            .push((stream.to_string(), records.to_vec()));
        Ok(PutRecordsOutcome { failed: 0 })
    }
}

/// Captures status upserts in arrival order.
#[derive(Debug, Default)]
pub struct MemoryStatusStore {
    updates: Mutex<Vec<(ObjectRef, ProcessingStatus)>>,
    fail: AtomicBool,
}

impl MemoryStatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn updates(&self) -> Vec<(ObjectRef, ProcessingStatus)> {
        self.updates.lock().expect("lock poisoned").clone()
    }
}

#[async_trait]
impl StatusStore for MemoryStatusStore {
    async fn update(&self, object: &ObjectRef, status: ProcessingStatus) -> Result<(), StoreError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(service_failure("dynamodb", 500));
        }
        self.updates
            .lock()
            .expect("lock poisoned")
            .push((object.clone(), status));
        Ok(())
    }
}

/// Captures bulk upserts and answers searches from a preset result.
#[derive(Debug, Default)]
pub struct MemorySearchIndex {
    bulks: Mutex<Vec<(String, Vec<(String, Value)>)>>,
    searches: Mutex<Vec<(String, Value, usize)>>,
    results: Mutex<SearchResults>,
    fail_bulk: AtomicBool,
    fail_search: AtomicBool,
}

impl MemorySearchIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_results(&self, results: SearchResults) {
        *self.results.lock().expect("lock poisoned") = results;
    }

    pub fn fail_next_bulk(&self, fail: bool) {
        self.fail_bulk.store(fail, Ordering::SeqCst);
    }

    pub fn fail_next_search(&self, fail: bool) {
        self.fail_search.store(fail, Ordering::SeqCst);
    }

    pub fn bulks(&self) -> Vec<(String, Vec<(String, Value)>)> {
        self.bulks.lock().expect("lock poisoned").clone()
    }

    pub fn searches(&self) -> Vec<(String, Value, usize)> {
        self.searches.lock().expect("lock poisoned").clone()
    }
}

#[async_trait]
impl SearchIndex for MemorySearchIndex {
    async fn bulk_upsert(&self, index: &str, docs: &[(String, Value)]) -> Result<(), StoreError> {
        if self.fail_bulk.load(Ordering::SeqCst) {
            return Err(service_failure("search", 500));
        }
        self.bulks
            .lock()
            .expect("lock poisoned")
            .push((index.to_string(), docs.to_vec()));
        Ok(())
    }

    async fn search(
        &self,
        index: &str,
        query: &Value,
        limit: usize,
    ) -> Result<SearchResults, StoreError> {
        if self.fail_search.load(Ordering::SeqCst) {
            return Err(service_failure("search", 500));
        }
        self.searches
            .lock()
            .expect("lock poisoned")
            .push((index.to_string(), query.clone(), limit));
        Ok(self.results.lock().expect("lock poisoned").clone())
    }
}

/// One directed edge in [`MemoryGraph`].
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryEdge {
    pub from: String,
    pub to: String,
    pub label: String,
    pub weight: f64,
}

/// Small adjacency-list graph. Edges are stored individually so traversals
/// report one entry per edge, matching how a real graph walks them.
#[derive(Debug, Default)]
pub struct MemoryGraph {
    vertices: Mutex<BTreeMap<String, (String, BTreeMap<String, String>)>>,
    edges: Mutex<Vec<MemoryEdge>>,
    fail_edge_ops: AtomicUsize,
}

impl MemoryGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `calls` edge operations with a transient error.
    pub fn fail_edge_ops(&self, calls: usize) {
        self.fail_edge_ops.store(calls, Ordering::SeqCst);
    }

    pub fn edges(&self) -> Vec<MemoryEdge> {
        self.edges.lock().expect("lock poisoned").clone()
    }

    pub fn vertex_count(&self) -> usize {
        self.vertices.lock().expect("lock poisoned").len()
    }

    fn edge_op_gate(&self) -> Result<(), StoreError> {
        if self.fail_edge_ops.load(Ordering::SeqCst) > 0 {
            self.fail_edge_ops.fetch_sub(1, Ordering::SeqCst);
            return Err(service_failure("graph", 500));
        }
        Ok(())
    }
}

#[async_trait]
impl GraphStore for MemoryGraph {
    async fn vertex_exists(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self
            .vertices
            .lock()
            .expect("lock poisoned")
            .contains_key(id))
    }

    async fn upsert_vertex(
        &self,
        label: &str,
        id: &str,
        properties: &BTreeMap<String, String>,
    ) -> Result<(), StoreError> {
        let mut vertices = self.vertices.lock().expect("lock poisoned");
        let entry = vertices
            .entry(id.to_string())
            .or_insert_with(|| (label.to_string(), BTreeMap::new()));
        for (key, value) in properties {
            entry.1.insert(key.clone(), value.clone());
        }
        Ok(())
    }

    async fn find_person_by_name(&self, name_lower: &str) -> Result<Option<String>, StoreError> {
        let vertices = self.vertices.lock().expect("lock poisoned");
        Ok(vertices
            .iter()
            .find(|(_, (label, props))| {
                label == PERSON_LABEL
                    && props.get("_name").map(String::as_str) == Some(name_lower)
            })
            .map(|(id, _)| id.clone()))
    }

    async fn neighbors(&self, id: &str, edge_label: &str) -> Result<Vec<String>, StoreError> {
        let edges = self.edges.lock().expect("lock poisoned");
        let mut out = Vec::new();
        for edge in edges.iter().filter(|edge| edge.label == edge_label) {
            if edge.from == id {
                out.push(edge.to.clone());
            }
            if edge.to == id {
                out.push(edge.from.clone());
            }
        }
        Ok(out)
    }

    async fn vertex_properties(&self, id: &str) -> Result<BTreeMap<String, String>, StoreError> {
        let vertices = self.vertices.lock().expect("lock poisoned");
        Ok(vertices
            .get(id)
            .map(|(_, props)| props.clone())
            .unwrap_or_default())
    }

    async fn edge_exists(
        &self,
        from: &str,
        to: &str,
        edge_label: &str,
    ) -> Result<bool, StoreError> {
        self.edge_op_gate()?;
        let edges = self.edges.lock().expect("lock poisoned");
        Ok(edges
            .iter()
            .any(|edge| edge.from == from && edge.to == to && edge.label == edge_label))
    }

    async fn add_edge(
        &self,
        from: &str,
        to: &str,
        edge_label: &str,
        weight: f64,
    ) -> Result<(), StoreError> {
        self.edge_op_gate()?;
        self.edges.lock().expect("lock poisoned").push(MemoryEdge {
            from: from.to_string(),
            to: to.to_string(),
            label: edge_label.to_string(),
            weight,
        });
        Ok(())
    }

    async fn update_edge_weight(
        &self,
        from: &str,
        to: &str,
        edge_label: &str,
        weight: f64,
    ) -> Result<(), StoreError> {
        self.edge_op_gate()?;
        let mut edges = self.edges.lock().expect("lock poisoned");
        if let Some(edge) = edges
            .iter_mut()
            .find(|edge| edge.from == from && edge.to == to && edge.label == edge_label)
        {
            edge.weight = weight;
        }
        Ok(())
    }

    async fn drop_edges(&self, limit: usize) -> Result<u64, StoreError> {
        let mut edges = self.edges.lock().expect("lock poisoned");
        let take = limit.min(edges.len());
        edges.drain(..take);
        Ok(edges.len() as u64)
    }

    async fn drop_vertices(&self, limit: usize) -> Result<u64, StoreError> {
        let mut vertices = self.vertices.lock().expect("lock poisoned");
        let doomed: Vec<String> = vertices.keys().take(limit).cloned().collect();
        for id in doomed {
            vertices.remove(&id);
        }
        Ok(vertices.len() as u64)
    }
}

/// Map-backed cache with set-if-absent semantics. Entries never expire;
/// the requested TTL is recorded so callers can assert on it.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, (String, Option<Duration>)>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an entry directly, bypassing set-if-absent.
    pub fn put(&self, key: impl Into<String>, value: impl Into<String>) {
        self.entries
            .lock()
            .expect("lock poisoned")
            .insert(key.into(), (value.into(), None));
    }

    pub fn ttl_of(&self, key: &str) -> Option<Duration> {
        self.entries
            .lock()
            .expect("lock poisoned")
            .get(key)
            .and_then(|(_, ttl)| *ttl)
    }

    pub fn keys(&self) -> Vec<String> {
        self.entries
            .lock()
            .expect("lock poisoned")
            .keys()
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self
            .entries
            .lock()
            .expect("lock poisoned")
            .get(key)
            .map(|(value, _)| value.clone()))
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut entries = self.entries.lock().expect("lock poisoned");
        if entries.contains_key(key) {
            return Ok(false);
        }
        entries.insert(key.to_string(), (value.to_string(), Some(ttl)));
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn graph_neighbors_report_one_entry_per_edge() {
        let graph = MemoryGraph::new();
        graph
            .upsert_vertex("person", "edy", &BTreeMap::new())
            .await
            .unwrap();
        graph
            .upsert_vertex("person", "poby", &BTreeMap::new())
            .await
            .unwrap();
        graph.add_edge("edy", "poby", "knows", 1.0).await.unwrap();
        graph.add_edge("poby", "edy", "knows", 1.0).await.unwrap();

        let neighbors = graph.neighbors("edy", "knows").await.unwrap();
        assert_eq!(neighbors, vec!["poby".to_string(), "poby".to_string()]);
    }

    #[tokio::test]
    async fn graph_vertex_upserts_overwrite_instead_of_duplicating() {
        let graph = MemoryGraph::new();
        let mut props = BTreeMap::new();
        props.insert("company".to_string(), "Iconix".to_string());
        graph.upsert_vertex("person", "edy", &props).await.unwrap();

        props.insert("company".to_string(), "Ocon".to_string());
        graph.upsert_vertex("person", "edy", &props).await.unwrap();

        assert_eq!(graph.vertex_count(), 1);
        let stored = graph.vertex_properties("edy").await.unwrap();
        assert_eq!(stored.get("company").map(String::as_str), Some("Ocon"));
    }

    #[tokio::test]
    async fn graph_drop_returns_remaining_counts() {
        let graph = MemoryGraph::new();
        for pair in [("a", "b"), ("b", "c"), ("c", "a")] {
            graph.add_edge(pair.0, pair.1, "knows", 1.0).await.unwrap();
        }

        assert_eq!(graph.drop_edges(2).await.unwrap(), 1);
        assert_eq!(graph.drop_edges(2).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn cache_set_if_absent_keeps_the_first_value() {
        let cache = MemoryCache::new();
        let ttl = Duration::from_secs(600);

        assert!(cache.set_if_absent("k", "first", ttl).await.unwrap());
        assert!(!cache.set_if_absent("k", "second", ttl).await.unwrap());
        assert_eq!(cache.get("k").await.unwrap().as_deref(), Some("first"));
        assert_eq!(cache.ttl_of("k"), Some(ttl));
    }
}
