use async_trait::async_trait;
use serde_json::Value;

use crate::error::AppResult;

/// An item as the pipeline sees it. The analysis payload is opaque; the only
/// question asked of it is whether it is present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    pub id: i64,
    pub language: String,
    pub term: String,
    pub analysis: Option<Value>,
}

impl Item {
    pub fn is_unfilled(&self) -> bool {
        is_empty_analysis(self.analysis.as_ref())
    }
}

/// `None`, JSON `null`, `{}`, `[]` and `""` all count as missing.
pub fn is_empty_analysis(analysis: Option<&Value>) -> bool {
    match analysis {
        None | Some(Value::Null) => true,
        Some(Value::Object(map)) => map.is_empty(),
        Some(Value::Array(list)) => list.is_empty(),
        Some(Value::String(s)) => s.is_empty(),
        Some(_) => false,
    }
}

/// Record store the backfill pipeline reads from and writes to.
#[async_trait]
pub trait Datastore: Send + Sync + 'static {
    async fn count_unfilled(&self, language: &str) -> AppResult<u64>;

    /// Up to `limit` unfilled items for `language` in ascending id order,
    /// starting above `after` when set and leaving out any id in `exclude`.
    async fn fetch_unfilled(
        &self,
        language: &str,
        limit: u64,
        after: Option<i64>,
        exclude: &[i64],
    ) -> AppResult<Vec<Item>>;

    /// Current state of one item, `None` if it no longer exists.
    async fn refetch_one(&self, id: i64) -> AppResult<Option<Item>>;

    /// Single-row, last-write-wins update of the analysis payload.
    async fn persist_analysis(&self, id: i64, analysis: Value) -> AppResult<()>;
}
