//! In-memory collaborators for pipeline and route tests.

use std::{
    collections::{BTreeMap, HashMap, HashSet, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering::Relaxed},
        Mutex,
    },
    time::Duration,
};

use anyhow::anyhow;
use async_trait::async_trait;
use serde_json::{json, Value};

use crate::{
    analysis::{AnalysisService, AnalyzeError},
    backfill::{Datastore, Item},
    error::{AppError, AppResult},
};

pub fn term_for(id: i64) -> String {
    format!("term-{}", id)
}

#[derive(Default)]
pub struct MockDatastore {
    items: Mutex<BTreeMap<i64, Item>>,
    persists: Mutex<HashMap<i64, usize>>,
    fail_fetches: AtomicBool,
    fetch_calls: AtomicUsize,
    longest_exclude: AtomicUsize,
    count_latency: Duration,
}

impl MockDatastore {
    /// Unfilled items `1..=count` for `language`.
    pub fn with_unfilled(language: &str, count: i64) -> Self {
        let store = Self::default();
        for id in 1..=count {
            store.insert(Item {
                id,
                language: language.to_string(),
                term: term_for(id),
                analysis: None,
            });
        }
        store
    }

    /// Makes `count_unfilled` take `latency` of virtual time.
    pub fn with_count_latency(mut self, latency: Duration) -> Self {
        self.count_latency = latency;
        self
    }

    pub fn insert(&self, item: Item) {
        self.items.lock().unwrap().insert(item.id, item);
    }

    /// Fills an item behind the pipeline's back.
    pub fn fill(&self, id: i64) {
        if let Some(item) = self.items.lock().unwrap().get_mut(&id) {
            item.analysis = Some(json!({ "definition": "filled elsewhere" }));
        }
    }

    pub fn fail_fetches(&self, fail: bool) {
        self.fail_fetches.store(fail, Relaxed);
    }

    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Relaxed)
    }

    /// Longest exclusion list any poll has sent.
    pub fn longest_exclude(&self) -> usize {
        self.longest_exclude.load(Relaxed)
    }

    pub fn analysis(&self, id: i64) -> Option<Value> {
        self.items
            .lock()
            .unwrap()
            .get(&id)
            .and_then(|item| item.analysis.clone())
    }

    pub fn persist_count(&self, id: i64) -> usize {
        self.persists.lock().unwrap().get(&id).copied().unwrap_or(0)
    }

    pub fn unfilled(&self, language: &str) -> Vec<i64> {
        self.items
            .lock()
            .unwrap()
            .values()
            .filter(|item| item.language == language && item.is_unfilled())
            .map(|item| item.id)
            .collect()
    }
}

#[async_trait]
impl Datastore for MockDatastore {
    async fn count_unfilled(&self, language: &str) -> AppResult<u64> {
        if !self.count_latency.is_zero() {
            tokio::time::sleep(self.count_latency).await;
        }
        Ok(self.unfilled(language).len() as u64)
    }

    async fn fetch_unfilled(
        &self,
        language: &str,
        limit: u64,
        after: Option<i64>,
        exclude: &[i64],
    ) -> AppResult<Vec<Item>> {
        self.fetch_calls.fetch_add(1, Relaxed);
        self.longest_exclude.fetch_max(exclude.len(), Relaxed);
        if self.fail_fetches.load(Relaxed) {
            return Err(AppError::Internal(anyhow!("connection reset by peer")));
        }

        Ok(self
            .items
            .lock()
            .unwrap()
            .values()
            .filter(|item| item.language == language && item.is_unfilled())
            .filter(|item| after.map_or(true, |after| item.id > after))
            .filter(|item| !exclude.contains(&item.id))
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn refetch_one(&self, id: i64) -> AppResult<Option<Item>> {
        Ok(self.items.lock().unwrap().get(&id).cloned())
    }

    async fn persist_analysis(&self, id: i64, analysis: Value) -> AppResult<()> {
        let mut items = self.items.lock().unwrap();
        let item = items
            .get_mut(&id)
            .ok_or_else(|| AppError::NotFound(format!("item {}", id)))?;
        item.analysis = Some(analysis);
        *self.persists.lock().unwrap().entry(id).or_default() += 1;
        Ok(())
    }
}

/// Scripted reply for one call on a term. Terms without a script succeed.
#[derive(Debug, Clone)]
pub enum Reply {
    RateLimited,
    Fail(String),
    Panic,
}

#[derive(Default)]
pub struct MockAnalyzer {
    latency: Duration,
    scripts: Mutex<HashMap<String, VecDeque<Reply>>>,
    calls: Mutex<Vec<String>>,
    outstanding: Mutex<HashSet<String>>,
    overlaps: AtomicUsize,
}

impl MockAnalyzer {
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency,
            ..Default::default()
        }
    }

    /// Queues replies for the next calls on `term`.
    pub fn script(&self, term: &str, replies: impl IntoIterator<Item = Reply>) {
        self.scripts
            .lock()
            .unwrap()
            .entry(term.to_string())
            .or_default()
            .extend(replies);
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn calls_for(&self, term: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|t| t.as_str() == term)
            .count()
    }

    /// Calls that started while another call for the same term was still running.
    pub fn overlaps(&self) -> usize {
        self.overlaps.load(Relaxed)
    }
}

#[async_trait]
impl AnalysisService for MockAnalyzer {
    async fn analyze(&self, term: &str, language: &str) -> Result<Value, AnalyzeError> {
        self.calls.lock().unwrap().push(term.to_string());
        if !self.outstanding.lock().unwrap().insert(term.to_string()) {
            self.overlaps.fetch_add(1, Relaxed);
        }

        let reply = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(term)
            .and_then(|replies| replies.pop_front());

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.outstanding.lock().unwrap().remove(term);

        match reply {
            None => Ok(json!({ "term": term, "language": language, "definition": "ok" })),
            Some(Reply::RateLimited) => Err(AnalyzeError::RateLimited(format!(
                "429 Too Many Requests for '{}'",
                term
            ))),
            Some(Reply::Fail(message)) => Err(anyhow!(message).into()),
            Some(Reply::Panic) => panic!("analyzer blew up on {}", term),
        }
    }
}
