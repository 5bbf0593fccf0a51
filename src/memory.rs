//! Tiered context memory: hot message log, warm embedded summaries, cold archive.
//!
//! Every tier is keyed by project. The [`MemoryManager`] is an owned value;
//! the orchestrator wraps it in a lock so writes for a project are serialized
//! while `retrieve` stays a pure read.

use std::collections::{HashMap, HashSet};
use std::hash::{DefaultHasher, Hash, Hasher};

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Tag that marks a hot message as a decision worth always retrieving.
pub const DEFAULT_DECISION_TAG: &str = "@DECISION";

/// Turns text into a fixed-length vector. Implementations usually call out
/// to a model, so the call is asynchronous.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

/// Deterministic bag-of-words embedder using feature hashing.
///
/// Good enough for local runs and tests where no embedding model is wired in.
#[derive(Debug, Clone, Copy)]
pub struct HashingEmbedder {
    dimensions: usize,
}

impl HashingEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
        }
    }

    pub fn embed_sync(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimensions];
        for word in text.split_whitespace() {
            let mut hasher = DefaultHasher::new();
            word.to_lowercase().hash(&mut hasher);
            let slot = (hasher.finish() % self.dimensions as u64) as usize;
            vector[slot] += 1.0;
        }
        vector
    }
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(64)
    }
}

#[async_trait]
impl Embedder for HashingEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.embed_sync(text))
    }
}

/// A message as submitted by an agent or user, before it gets an identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewMessage {
    pub agent_id: String,
    pub role: String,
    pub content: String,
    #[serde(default)]
    pub token_count: u32,
}

/// Hot-tier record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub project_id: String,
    pub agent_id: String,
    pub role: String,
    pub content: String,
    pub token_count: u32,
    /// Insertion order across all projects.
    pub seq: u64,
}

/// Warm-tier record derived from a batch of hot messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WarmEntry {
    pub summary: String,
    pub embedding: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ContextItem {
    Message(Message),
    Summary { summary: String, similarity: f32 },
}

/// Cosine similarity, or `None` when dimensions differ or a vector is all zeros.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Option<f32> {
    if a.len() != b.len() || a.is_empty() {
        return None;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return None;
    }
    Some(dot / (norm_a * norm_b))
}

#[derive(Debug, Clone)]
pub struct MemoryManager {
    hot_window: usize,
    decision_tag: String,
    hot: HashMap<String, Vec<Message>>,
    warm: HashMap<String, Vec<WarmEntry>>,
    cold: HashMap<String, Vec<Vec<u8>>>,
    next_seq: u64,
}

impl Default for MemoryManager {
    fn default() -> Self {
        Self::new(20, DEFAULT_DECISION_TAG)
    }
}

impl MemoryManager {
    pub fn new(hot_window: usize, decision_tag: impl Into<String>) -> Self {
        Self {
            hot_window,
            decision_tag: decision_tag.into(),
            hot: HashMap::new(),
            warm: HashMap::new(),
            cold: HashMap::new(),
            next_seq: 0,
        }
    }

    pub fn decision_tag(&self) -> &str {
        &self.decision_tag
    }

    pub fn append_hot(&mut self, project_id: &str, message: NewMessage) -> Message {
        let record = Message {
            id: Uuid::new_v4().to_string(),
            project_id: project_id.to_string(),
            agent_id: message.agent_id,
            role: message.role,
            content: message.content,
            token_count: message.token_count,
            seq: self.next_seq,
        };
        self.next_seq += 1;
        self.hot
            .entry(project_id.to_string())
            .or_default()
            .push(record.clone());
        record
    }

    /// The `k` most recent hot messages, oldest first.
    pub fn fetch_hot(&self, project_id: &str, k: usize) -> Vec<Message> {
        let Some(history) = self.hot.get(project_id) else {
            return Vec::new();
        };
        let start = history.len().saturating_sub(k);
        history[start..].to_vec()
    }

    pub fn hot_len(&self, project_id: &str) -> usize {
        self.hot.get(project_id).map_or(0, Vec::len)
    }

    /// Concatenate message contents and embed the result. The caller decides
    /// whether the entry goes into the warm tier.
    pub async fn compress(messages: &[Message], embedder: &dyn Embedder) -> Result<WarmEntry> {
        let summary = messages
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join(" ");
        let embedding = embedder.embed(&summary).await?;
        Ok(WarmEntry { summary, embedding })
    }

    pub fn insert_warm(&mut self, project_id: &str, entry: WarmEntry) {
        self.warm.entry(project_id.to_string()).or_default().push(entry);
    }

    pub fn warm_len(&self, project_id: &str) -> usize {
        self.warm.get(project_id).map_or(0, Vec::len)
    }

    /// Archive an opaque blob. Nothing in this crate reads it back.
    pub fn store_cold(&mut self, project_id: &str, blob: Vec<u8>) {
        self.cold.entry(project_id.to_string()).or_default().push(blob);
    }

    pub fn cold_len(&self, project_id: &str) -> usize {
        self.cold.get(project_id).map_or(0, Vec::len)
    }

    /// Context bundle for decision-making.
    ///
    /// Hot window, then decision-tagged hot messages not already included,
    /// then the `top` warm summaries by descending cosine similarity. The warm
    /// part is omitted when there is no query or no warm entry.
    pub fn retrieve(&self, project_id: &str, query_embedding: Option<&[f32]>, top: usize) -> Vec<ContextItem> {
        let mut bundle = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();

        for message in self.fetch_hot(project_id, self.hot_window) {
            if seen.insert(message.id.clone()) {
                bundle.push(ContextItem::Message(message));
            }
        }

        let tagged = self
            .hot
            .get(project_id)
            .into_iter()
            .flatten()
            .filter(|m| m.content.contains(&self.decision_tag));
        for message in tagged {
            if seen.insert(message.id.clone()) {
                bundle.push(ContextItem::Message(message.clone()));
            }
        }

        if let (Some(query), Some(warm)) = (query_embedding, self.warm.get(project_id)) {
            let mut ranked: Vec<(f32, &WarmEntry)> = warm
                .iter()
                .filter_map(|entry| cosine_similarity(query, &entry.embedding).map(|s| (s, entry)))
                .collect();
            ranked.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
            bundle.extend(ranked.into_iter().take(top).map(|(similarity, entry)| ContextItem::Summary {
                summary: entry.summary.clone(),
                similarity,
            }));
        }

        bundle
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(content: &str) -> NewMessage {
        NewMessage {
            agent_id: "agent".into(),
            role: "assistant".into(),
            content: content.into(),
            token_count: 1,
        }
    }

    fn contents(items: &[ContextItem]) -> Vec<String> {
        items
            .iter()
            .map(|item| match item {
                ContextItem::Message(m) => m.content.clone(),
                ContextItem::Summary { summary, .. } => format!("warm:{summary}"),
            })
            .collect()
    }

    #[test]
    fn fetch_hot_returns_most_recent_oldest_first() {
        let mut mm = MemoryManager::default();
        for i in 0..30 {
            mm.append_hot("p1", msg(&format!("msg{i}")));
        }
        let hot = mm.fetch_hot("p1", 10);
        let got: Vec<&str> = hot.iter().map(|m| m.content.as_str()).collect();
        let expected: Vec<String> = (20..30).map(|i| format!("msg{i}")).collect();
        assert_eq!(got, expected);
    }

    #[test]
    fn fetch_hot_larger_than_history_returns_everything() {
        let mut mm = MemoryManager::default();
        mm.append_hot("p1", msg("only"));
        assert_eq!(mm.fetch_hot("p1", 50).len(), 1);
        assert!(mm.fetch_hot("nobody", 5).is_empty());
        assert!(mm.fetch_hot("p1", 0).is_empty());
    }

    #[tokio::test]
    async fn compress_concatenates_contents() {
        let mut mm = MemoryManager::default();
        let a = mm.append_hot("p1", msg("hello"));
        let b = mm.append_hot("p1", msg("world"));
        let embedder = HashingEmbedder::new(8);

        let entry = MemoryManager::compress(&[a, b], &embedder).await.unwrap();
        assert_eq!(entry.summary, "hello world");
        assert_eq!(entry.embedding.len(), 8);

        let again = MemoryManager::compress(&mm.fetch_hot("p1", 2), &embedder).await.unwrap();
        assert_eq!(again, entry);

        mm.insert_warm("p1", entry);
        assert_eq!(mm.warm_len("p1"), 1);
    }

    #[test]
    fn retrieve_combines_hot_tagged_and_ranked_warm() {
        let mut mm = MemoryManager::new(2, DEFAULT_DECISION_TAG);
        mm.append_hot("p1", msg("@DECISION(reason=bar) important decision"));
        mm.append_hot("p1", msg("foo"));
        mm.append_hot("p1", msg("baz"));
        mm.insert_warm("p1", WarmEntry { summary: "summary1".into(), embedding: vec![1.0, 0.0, 0.0] });
        mm.insert_warm("p1", WarmEntry { summary: "summary2".into(), embedding: vec![0.0, 1.0, 0.0] });
        mm.insert_warm("p1", WarmEntry { summary: "summary3".into(), embedding: vec![0.7, 0.7, 0.0] });

        let result = mm.retrieve("p1", Some(&[1.0, 0.0, 0.0][..]), 2);
        assert_eq!(
            contents(&result),
            vec![
                "foo",
                "baz",
                "@DECISION(reason=bar) important decision",
                "warm:summary1",
                "warm:summary3",
            ]
        );
    }

    #[test]
    fn retrieve_deduplicates_tagged_messages_in_window() {
        let mut mm = MemoryManager::new(5, DEFAULT_DECISION_TAG);
        mm.append_hot("p1", msg("foo"));
        mm.append_hot("p1", msg("@DECISION keep"));
        let result = mm.retrieve("p1", None, 3);
        assert_eq!(contents(&result), vec!["foo", "@DECISION keep"]);
    }

    #[test]
    fn retrieve_without_query_or_warm_is_hot_only() {
        let mut mm = MemoryManager::default();
        mm.append_hot("p1", msg("foo"));
        assert_eq!(mm.retrieve("p1", Some(&[1.0][..]), 3).len(), 1);

        mm.insert_warm("p1", WarmEntry { summary: "s".into(), embedding: vec![1.0] });
        assert_eq!(mm.retrieve("p1", None, 3).len(), 1);
        assert_eq!(mm.retrieve("p1", Some(&[1.0][..]), 3).len(), 2);
    }

    #[test]
    fn retrieve_skips_mismatched_dimensions() {
        let mut mm = MemoryManager::default();
        mm.insert_warm("p1", WarmEntry { summary: "short".into(), embedding: vec![1.0] });
        mm.insert_warm("p1", WarmEntry { summary: "zero".into(), embedding: vec![0.0, 0.0] });
        mm.insert_warm("p1", WarmEntry { summary: "ok".into(), embedding: vec![0.0, 2.0] });
        assert_eq!(contents(&mm.retrieve("p1", Some(&[0.0, 1.0][..]), 5)), vec!["warm:ok"]);
    }

    #[test]
    fn cold_tier_is_write_only() {
        let mut mm = MemoryManager::default();
        mm.store_cold("p1", b"archived transcript".to_vec());
        assert_eq!(mm.cold_len("p1"), 1);
        assert!(mm.retrieve("p1", None, 3).is_empty());
    }

    #[test]
    fn cosine_similarity_basics() {
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[2.0, 0.0]), Some(1.0));
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]), Some(0.0));
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), None);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), None);
    }

    #[test]
    fn hashing_embedder_is_deterministic() {
        let e = HashingEmbedder::new(16);
        assert_eq!(e.embed_sync("Plan the build"), e.embed_sync("plan the BUILD"));
        assert_eq!(e.embed_sync("a b c").iter().sum::<f32>(), 3.0);
    }
}
