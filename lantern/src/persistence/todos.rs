use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

use crate::todo::{Todo, TodoRepository};

/// To-do rows in the `todos` table.
#[derive(Clone, Debug)]
pub struct PostgresTodoRepository {
    pool: PgPool,
}

impl PostgresTodoRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn todo_from_row(row: &PgRow) -> anyhow::Result<Todo> {
        Ok(Todo {
            id: row.try_get("id")?,
            text: row.try_get("text")?,
            done: row.try_get("done")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

#[async_trait]
impl TodoRepository for PostgresTodoRepository {
    async fn list(&self) -> anyhow::Result<Vec<Todo>> {
        let rows = sqlx::query(
            "SELECT id, text, done, created_at FROM todos ORDER BY created_at DESC, id DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::todo_from_row).collect()
    }

    async fn add(&self, text: &str) -> anyhow::Result<Todo> {
        let row = sqlx::query(
            "INSERT INTO todos (text) VALUES ($1) RETURNING id, text, done, created_at",
        )
        .bind(text)
        .fetch_one(&self.pool)
        .await?;
        Self::todo_from_row(&row)
    }

    async fn delete_at(&self, index: usize) -> anyhow::Result<Option<Todo>> {
        let offset = i64::try_from(index)?;
        let row = sqlx::query(
            r#"
            DELETE FROM todos
            WHERE id = (
                SELECT id FROM todos
                ORDER BY created_at DESC, id DESC
                OFFSET $1
                LIMIT 1
            )
            RETURNING id, text, done, created_at
            "#,
        )
        .bind(offset)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::todo_from_row).transpose()
    }

    async fn count(&self) -> anyhow::Result<u64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM todos")
            .fetch_one(&self.pool)
            .await?;
        let n: i64 = row.try_get("n")?;
        Ok(u64::try_from(n)?)
    }

    async fn latest_id(&self) -> anyhow::Result<Option<i64>> {
        let row = sqlx::query("SELECT MAX(id) AS latest FROM todos")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("latest")?)
    }
}
