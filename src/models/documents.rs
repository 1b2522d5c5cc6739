use crate::models::schema::{documents, suggestions};
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum DocumentError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] diesel::result::Error),
    #[error("Document not found")]
    NotFound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentKind {
    Text,
    Code,
}

impl DocumentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentKind::Text => "text",
            DocumentKind::Code => "code",
        }
    }
}

/// Every save creates a new version; `(id, created_at)` identifies one version.
#[derive(Queryable, Serialize, Deserialize, Clone, Debug)]
#[diesel(table_name = documents)]
#[diesel(check_for_backend(diesel::pg::Pg))]
#[serde(rename_all = "camelCase")]
pub struct Document {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub title: String,
    pub content: Option<String>,
    pub kind: String,
    pub user_id: Uuid,
}

impl Document {
    pub fn get_versions_by_id(
        conn: &mut PgConnection,
        id: Uuid,
    ) -> Result<Vec<Document>, DocumentError> {
        documents::table
            .filter(documents::id.eq(id))
            .order(documents::created_at.asc())
            .load::<Document>(conn)
            .map_err(DocumentError::DatabaseError)
    }

    pub fn get_latest_by_id(
        conn: &mut PgConnection,
        id: Uuid,
    ) -> Result<Option<Document>, DocumentError> {
        documents::table
            .filter(documents::id.eq(id))
            .order(documents::created_at.desc())
            .first::<Document>(conn)
            .optional()
            .map_err(DocumentError::DatabaseError)
    }

    /// Drops the versions newer than `timestamp` together with their suggestions.
    pub fn delete_by_id_after_timestamp(
        conn: &mut PgConnection,
        id: Uuid,
        timestamp: DateTime<Utc>,
    ) -> Result<usize, DocumentError> {
        conn.transaction(|conn| {
            diesel::delete(
                suggestions::table
                    .filter(suggestions::document_id.eq(id))
                    .filter(suggestions::document_created_at.gt(timestamp)),
            )
            .execute(conn)?;

            diesel::delete(
                documents::table
                    .filter(documents::id.eq(id))
                    .filter(documents::created_at.gt(timestamp)),
            )
            .execute(conn)
        })
        .map_err(DocumentError::DatabaseError)
    }
}

#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = documents)]
pub struct NewDocument {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub title: String,
    pub content: Option<String>,
    pub kind: String,
    pub user_id: Uuid,
}

impl NewDocument {
    pub fn insert(&self, conn: &mut PgConnection) -> Result<Document, DocumentError> {
        diesel::insert_into(documents::table)
            .values(self)
            .get_result::<Document>(conn)
            .map_err(DocumentError::DatabaseError)
    }
}

#[derive(Queryable, Serialize, Deserialize, Clone, Debug)]
#[diesel(table_name = suggestions)]
#[diesel(check_for_backend(diesel::pg::Pg))]
#[serde(rename_all = "camelCase")]
pub struct Suggestion {
    pub id: Uuid,
    pub document_id: Uuid,
    pub document_created_at: DateTime<Utc>,
    pub original_text: String,
    pub suggested_text: String,
    pub description: Option<String>,
    pub is_resolved: bool,
    pub user_id: Uuid,
    pub created_at: DateTime<Utc>,
}

impl Suggestion {
    pub fn get_by_document_id(
        conn: &mut PgConnection,
        document_id: Uuid,
    ) -> Result<Vec<Suggestion>, DocumentError> {
        suggestions::table
            .filter(suggestions::document_id.eq(document_id))
            .order(suggestions::created_at.asc())
            .load::<Suggestion>(conn)
            .map_err(DocumentError::DatabaseError)
    }
}

#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = suggestions)]
pub struct NewSuggestion {
    pub id: Uuid,
    pub document_id: Uuid,
    pub document_created_at: DateTime<Utc>,
    pub original_text: String,
    pub suggested_text: String,
    pub description: Option<String>,
    pub is_resolved: bool,
    pub user_id: Uuid,
}

impl NewSuggestion {
    pub fn insert_all(
        conn: &mut PgConnection,
        new_suggestions: &[NewSuggestion],
    ) -> Result<(), DocumentError> {
        diesel::insert_into(suggestions::table)
            .values(new_suggestions)
            .execute(conn)
            .map(|_| ())
            .map_err(DocumentError::DatabaseError)
    }
}
