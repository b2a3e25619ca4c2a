use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Row, params};
use thiserror::Error;
use uuid::Uuid;

use crate::db::{Database, DbError};

const CATEGORY_COLUMNS: &str = "id, user_id, name, description, created_at";

/// A user-defined bucket that classified messages are filed into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Category {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum CategoryError {
    #[error("database error: {0}")]
    Database(#[from] DbError),
    #[error("sql error: {0}")]
    Sql(#[from] libsql::Error),
    #[error("datetime parse error: {0}")]
    DateTimeParse(#[from] chrono::ParseError),
    #[error("category not found: {0}")]
    NotFound(String),
    #[error("category {0} already exists for this user")]
    Duplicate(String),
}

#[derive(Clone)]
pub struct CategoryRepository {
    db: Database,
}

impl CategoryRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn create(
        &self,
        user_id: &str,
        name: &str,
        description: Option<&str>,
    ) -> Result<Category, CategoryError> {
        let id = Uuid::new_v4().to_string();
        let now = now_rfc3339();
        let conn = self.db.connection().await?;

        let result = conn
            .query(
                &format!(
                    "INSERT INTO categories (id, user_id, name, description, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)
                     RETURNING {CATEGORY_COLUMNS}"
                ),
                params![id, user_id, name, description, now],
            )
            .await;

        match result {
            Ok(mut rows) => {
                let row = rows
                    .next()
                    .await?
                    .ok_or_else(|| CategoryError::NotFound("insert returned no row".into()))?;
                row_to_category(row)
            }
            Err(err) if is_unique_violation(&err) => {
                Err(CategoryError::Duplicate(name.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    pub async fn list_by_user(&self, user_id: &str) -> Result<Vec<Category>, CategoryError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {CATEGORY_COLUMNS} FROM categories WHERE user_id = ?1 ORDER BY name"
                ),
                params![user_id],
            )
            .await?;

        let mut categories = Vec::new();
        while let Some(row) = rows.next().await? {
            categories.push(row_to_category(row)?);
        }
        Ok(categories)
    }

    pub async fn delete(&self, id: &str) -> Result<(), CategoryError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                "DELETE FROM categories WHERE id = ?1 RETURNING id",
                params![id],
            )
            .await?;

        match rows.next().await? {
            Some(_) => Ok(()),
            None => Err(CategoryError::NotFound(id.to_string())),
        }
    }
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn is_unique_violation(err: &libsql::Error) -> bool {
    err.to_string()
        .to_ascii_lowercase()
        .contains("unique constraint failed")
}

fn row_to_category(row: Row) -> Result<Category, CategoryError> {
    let created_at: String = row.get(4)?;

    Ok(Category {
        id: row.get(0)?,
        user_id: row.get(1)?,
        name: row.get(2)?,
        description: row.get(3)?,
        created_at: DateTime::parse_from_rfc3339(&created_at)?.with_timezone(&Utc),
    })
}
