use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value as Json;

use crate::{
    backfill::{Datastore, Item as BackfillItem},
    db_core::prelude::*,
    error::{AppError, AppResult},
};

/// Postgres stores an explicit JSON `null` or an empty object for analyses
/// that were reset, so both count as unfilled alongside SQL NULL.
const EMPTY_ANALYSIS_SQL: [&str; 4] = [
    "item.analysis = 'null'::jsonb",
    "item.analysis = '{}'::jsonb",
    "item.analysis = '[]'::jsonb",
    "item.analysis = '\"\"'::jsonb",
];

pub struct ItemCtrl;

impl ItemCtrl {
    fn unfilled_condition(language: &str) -> Condition {
        let empty = EMPTY_ANALYSIS_SQL.iter().fold(
            Condition::any().add(item::Column::Analysis.is_null()),
            |cond, sql| cond.add(Expr::cust(*sql)),
        );

        Condition::all()
            .add(item::Column::Language.eq(language))
            .add(empty)
    }

    pub async fn count_unfilled(conn: &DatabaseConnection, language: &str) -> AppResult<u64> {
        let count = Item::find()
            .filter(Self::unfilled_condition(language))
            .count(conn)
            .await?;

        Ok(count)
    }

    pub async fn get_unfilled(
        conn: &DatabaseConnection,
        language: &str,
        limit: u64,
        after: Option<i64>,
        exclude: &[i64],
    ) -> AppResult<Vec<item::Model>> {
        let mut query = Item::find().filter(Self::unfilled_condition(language));

        if let Some(after) = after {
            query = query.filter(item::Column::Id.gt(after));
        }
        if !exclude.is_empty() {
            query = query.filter(item::Column::Id.is_not_in(exclude.iter().copied()));
        }

        let items = query
            .order_by_asc(item::Column::Id)
            .limit(limit)
            .all(conn)
            .await?;

        Ok(items)
    }

    pub async fn get_by_id(conn: &DatabaseConnection, id: i64) -> AppResult<Option<item::Model>> {
        Ok(Item::find_by_id(id).one(conn).await?)
    }

    pub async fn set_analysis(conn: &DatabaseConnection, id: i64, analysis: Json) -> AppResult<()> {
        let result = Item::update_many()
            .col_expr(item::Column::Analysis, Expr::value(analysis))
            .col_expr(
                item::Column::AnalyzedAt,
                Expr::value(Utc::now().fixed_offset()),
            )
            .filter(item::Column::Id.eq(id))
            .exec(conn)
            .await?;

        if result.rows_affected == 0 {
            return Err(AppError::NotFound(format!("Item {} not found", id)));
        }

        Ok(())
    }
}

impl From<item::Model> for BackfillItem {
    fn from(model: item::Model) -> Self {
        Self {
            id: model.id,
            language: model.language,
            term: model.term,
            analysis: model.analysis,
        }
    }
}

/// [`Datastore`] over the `item` table.
pub struct SeaOrmItemStore {
    conn: DatabaseConnection,
}

impl SeaOrmItemStore {
    pub fn new(conn: DatabaseConnection) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl Datastore for SeaOrmItemStore {
    async fn count_unfilled(&self, language: &str) -> AppResult<u64> {
        ItemCtrl::count_unfilled(&self.conn, language).await
    }

    async fn fetch_unfilled(
        &self,
        language: &str,
        limit: u64,
        after: Option<i64>,
        exclude: &[i64],
    ) -> AppResult<Vec<BackfillItem>> {
        let items = ItemCtrl::get_unfilled(&self.conn, language, limit, after, exclude).await?;
        Ok(items.into_iter().map(BackfillItem::from).collect())
    }

    async fn refetch_one(&self, id: i64) -> AppResult<Option<BackfillItem>> {
        let item = ItemCtrl::get_by_id(&self.conn, id).await?;
        Ok(item.map(BackfillItem::from))
    }

    async fn persist_analysis(&self, id: i64, analysis: Json) -> AppResult<()> {
        ItemCtrl::set_analysis(&self.conn, id, analysis).await
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use sea_orm::{DatabaseBackend, MockDatabase, MockExecResult, Value};
    use serde_json::json;

    use super::*;

    fn model(id: i64, analysis: Option<Json>) -> item::Model {
        item::Model {
            id,
            language: "ko".to_string(),
            term: format!("term-{}", id),
            analysis,
            analyzed_at: None,
        }
    }

    #[tokio::test]
    async fn test_fetch_unfilled_orders_and_excludes() {
        let conn = MockDatabase::new(DatabaseBackend::Postgres)
            .append_query_results([vec![model(1, None), model(4, Some(json!({})))]])
            .into_connection();
        let store = SeaOrmItemStore::new(conn);

        let items = store.fetch_unfilled("ko", 10, None, &[2, 3]).await.unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].id, 1);
        assert!(items[1].is_unfilled());

        let log = format!("{:?}", store.conn.into_transaction_log());
        assert!(log.contains("IS NULL"));
        assert!(log.contains("NOT IN"));
        assert!(log.contains("ORDER BY"));
        assert!(log.contains("LIMIT"));
    }

    #[tokio::test]
    async fn test_fetch_without_exclusions_skips_not_in() {
        let conn = MockDatabase::new(DatabaseBackend::Postgres)
            .append_query_results([Vec::<item::Model>::new()])
            .into_connection();
        let store = SeaOrmItemStore::new(conn);

        assert!(store
            .fetch_unfilled("ko", 10, None, &[])
            .await
            .unwrap()
            .is_empty());

        let log = format!("{:?}", store.conn.into_transaction_log());
        assert!(!log.contains("NOT IN"));
        assert!(!log.contains(" > "));
    }

    #[tokio::test]
    async fn test_fetch_after_floor_starts_above_it() {
        let conn = MockDatabase::new(DatabaseBackend::Postgres)
            .append_query_results([vec![model(41, None)]])
            .into_connection();
        let store = SeaOrmItemStore::new(conn);

        let items = store.fetch_unfilled("ko", 10, Some(40), &[]).await.unwrap();
        assert_eq!(items[0].id, 41);

        let log = format!("{:?}", store.conn.into_transaction_log());
        assert!(log.contains(" > "));
        assert!(!log.contains("NOT IN"));
    }

    #[tokio::test]
    async fn test_count_unfilled() {
        let conn = MockDatabase::new(DatabaseBackend::Postgres)
            .append_query_results([[BTreeMap::from([(
                "num_items".to_string(),
                Value::BigInt(Some(42)),
            )])]])
            .into_connection();
        let store = SeaOrmItemStore::new(conn);

        assert_eq!(store.count_unfilled("ko").await.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_refetch_missing_item_is_none() {
        let conn = MockDatabase::new(DatabaseBackend::Postgres)
            .append_query_results([Vec::<item::Model>::new()])
            .into_connection();
        let store = SeaOrmItemStore::new(conn);

        assert!(store.refetch_one(9).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_persist_missing_item_is_not_found() {
        let conn = MockDatabase::new(DatabaseBackend::Postgres)
            .append_exec_results([
                MockExecResult {
                    last_insert_id: 0,
                    rows_affected: 1,
                },
                MockExecResult {
                    last_insert_id: 0,
                    rows_affected: 0,
                },
            ])
            .into_connection();
        let store = SeaOrmItemStore::new(conn);

        store
            .persist_analysis(1, json!({ "definition": "water" }))
            .await
            .unwrap();

        let missing = store.persist_analysis(2, json!({ "definition": "fire" })).await;
        assert!(matches!(missing, Err(AppError::NotFound(_))));
    }
}
