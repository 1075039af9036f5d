//! To-do rows and the repository trait behind them.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Longest accepted task text, matching the storage column.
pub const MAX_TEXT_LEN: usize = 500;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Todo {
    pub id: i64,
    pub text: String,
    pub done: bool,
    pub created_at: DateTime<Utc>,
}

/// Row selection for exports. An empty filter selects every row.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TodoFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub done: Option<bool>,
    /// Case-insensitive substring match on the text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contains: Option<String>,
}

impl TodoFilter {
    pub fn matches(&self, todo: &Todo) -> bool {
        if let Some(done) = self.done {
            if todo.done != done {
                return false;
            }
        }
        if let Some(needle) = &self.contains {
            if !todo.text.to_lowercase().contains(&needle.to_lowercase()) {
                return false;
            }
        }
        true
    }
}

#[async_trait]
pub trait TodoRepository: Send + Sync {
    /// All rows, newest first.
    async fn list(&self) -> anyhow::Result<Vec<Todo>>;

    async fn add(&self, text: &str) -> anyhow::Result<Todo>;

    /// Delete the row at `index` in the newest-first listing.
    async fn delete_at(&self, index: usize) -> anyhow::Result<Option<Todo>>;

    async fn count(&self) -> anyhow::Result<u64>;

    /// Upper bound on the ids of existing rows, `None` when nothing was ever
    /// added. Ids are never reused, so rows added later get a larger one.
    async fn latest_id(&self) -> anyhow::Result<Option<i64>>;
}

#[derive(Clone, Default)]
pub struct InMemoryTodoRepository {
    table: Arc<RwLock<Table>>,
}

#[derive(Default)]
struct Table {
    rows: Vec<Todo>,
    last_id: i64,
}

impl InMemoryTodoRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TodoRepository for InMemoryTodoRepository {
    async fn list(&self) -> anyhow::Result<Vec<Todo>> {
        let mut rows = self.table.read().rows.clone();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(rows)
    }

    async fn add(&self, text: &str) -> anyhow::Result<Todo> {
        let mut table = self.table.write();
        table.last_id += 1;
        let todo = Todo {
            id: table.last_id,
            text: text.to_string(),
            done: false,
            created_at: Utc::now(),
        };
        table.rows.push(todo.clone());
        Ok(todo)
    }

    async fn delete_at(&self, index: usize) -> anyhow::Result<Option<Todo>> {
        let listing = self.list().await?;
        let Some(target) = listing.get(index) else {
            return Ok(None);
        };
        let mut table = self.table.write();
        let position = table.rows.iter().position(|t| t.id == target.id);
        Ok(position.map(|p| table.rows.remove(p)))
    }

    async fn count(&self) -> anyhow::Result<u64> {
        Ok(self.table.read().rows.len() as u64)
    }

    async fn latest_id(&self) -> anyhow::Result<Option<i64>> {
        let last_id = self.table.read().last_id;
        Ok((last_id > 0).then_some(last_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_list_is_newest_first() {
        let repo = InMemoryTodoRepository::new();
        repo.add("first").await.unwrap();
        repo.add("second").await.unwrap();

        let listing = repo.list().await.unwrap();
        assert_eq!(listing[0].text, "second");
        assert_eq!(listing[1].text, "first");
    }

    #[tokio::test]
    async fn test_delete_by_position() {
        let repo = InMemoryTodoRepository::new();
        repo.add("keep").await.unwrap();
        repo.add("drop").await.unwrap();

        let removed = repo.delete_at(0).await.unwrap().unwrap();
        assert_eq!(removed.text, "drop");
        assert!(repo.delete_at(5).await.unwrap().is_none());
        assert_eq!(repo.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_ids_are_not_reused_after_delete() {
        let repo = InMemoryTodoRepository::new();
        assert_eq!(repo.latest_id().await.unwrap(), None);
        repo.add("a").await.unwrap();
        repo.add("b").await.unwrap();
        repo.delete_at(0).await.unwrap();

        let c = repo.add("c").await.unwrap();
        assert_eq!(c.id, 3);
        assert_eq!(repo.latest_id().await.unwrap(), Some(3));
    }

    #[test]
    fn test_filter_matching() {
        let todo = Todo {
            id: 1,
            text: "Buy Milk".into(),
            done: false,
            created_at: Utc::now(),
        };
        assert!(TodoFilter::default().matches(&todo));
        assert!(TodoFilter { contains: Some("milk".into()), ..Default::default() }.matches(&todo));
        assert!(!TodoFilter { done: Some(true), ..Default::default() }.matches(&todo));
    }

    #[test]
    fn test_filter_rejects_unknown_keys() {
        assert!(serde_json::from_str::<TodoFilter>(r#"{"owner": "bob"}"#).is_err());
        let empty: TodoFilter = serde_json::from_str("{}").unwrap();
        assert_eq!(empty, TodoFilter::default());
    }
}
