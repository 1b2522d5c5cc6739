use crate::models::schema::chats;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum ChatError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] diesel::result::Error),
    #[error("Chat not found")]
    NotFound,
    #[error("Unknown visibility: {0}")]
    InvalidVisibility(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Public,
    Private,
}

impl Visibility {
    pub fn as_str(&self) -> &'static str {
        match self {
            Visibility::Public => "public",
            Visibility::Private => "private",
        }
    }
}

impl std::str::FromStr for Visibility {
    type Err = ChatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "public" => Ok(Visibility::Public),
            "private" => Ok(Visibility::Private),
            other => Err(ChatError::InvalidVisibility(other.to_string())),
        }
    }
}

#[derive(Queryable, Identifiable, Serialize, Deserialize, Clone, Debug)]
#[diesel(table_name = chats)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct Chat {
    pub id: Uuid,
    pub user_id: Uuid,
    pub title: String,
    pub visibility: String,
    pub total_cost: BigDecimal,
    pub is_deleted: bool,
    pub created_at: DateTime<Utc>,
}

impl Chat {
    pub fn visibility(&self) -> Visibility {
        self.visibility.parse().unwrap_or(Visibility::Private)
    }

    pub fn is_owned_by(&self, user_id: Uuid) -> bool {
        self.user_id == user_id
    }

    pub fn get_by_id(conn: &mut PgConnection, id: Uuid) -> Result<Option<Chat>, ChatError> {
        chats::table
            .filter(chats::id.eq(id))
            .first::<Chat>(conn)
            .optional()
            .map_err(ChatError::DatabaseError)
    }

    pub fn get_not_deleted_by_user_id(
        conn: &mut PgConnection,
        user_id: Uuid,
    ) -> Result<Vec<Chat>, ChatError> {
        chats::table
            .filter(chats::user_id.eq(user_id))
            .filter(chats::is_deleted.eq(false))
            .order(chats::created_at.desc())
            .load::<Chat>(conn)
            .map_err(ChatError::DatabaseError)
    }

    /// Flags the chat as deleted; the row itself is kept.
    pub fn soft_delete(conn: &mut PgConnection, id: Uuid, user_id: Uuid) -> Result<(), ChatError> {
        let rows = diesel::update(
            chats::table
                .filter(chats::id.eq(id))
                .filter(chats::user_id.eq(user_id)),
        )
        .set(chats::is_deleted.eq(true))
        .execute(conn)
        .map_err(ChatError::DatabaseError)?;

        if rows == 0 {
            Err(ChatError::NotFound)
        } else {
            Ok(())
        }
    }

    pub fn update_title(conn: &mut PgConnection, id: Uuid, title: &str) -> Result<(), ChatError> {
        diesel::update(chats::table.filter(chats::id.eq(id)))
            .set(chats::title.eq(title))
            .execute(conn)
            .map(|_| ())
            .map_err(ChatError::DatabaseError)
    }

    pub fn update_visibility(
        conn: &mut PgConnection,
        id: Uuid,
        user_id: Uuid,
        visibility: Visibility,
    ) -> Result<(), ChatError> {
        let rows = diesel::update(
            chats::table
                .filter(chats::id.eq(id))
                .filter(chats::user_id.eq(user_id)),
        )
        .set(chats::visibility.eq(visibility.as_str()))
        .execute(conn)
        .map_err(ChatError::DatabaseError)?;

        if rows == 0 {
            Err(ChatError::NotFound)
        } else {
            Ok(())
        }
    }

    /// Adds a turn cost to the running total and returns the new total.
    pub fn add_cost(
        conn: &mut PgConnection,
        id: Uuid,
        cost: &BigDecimal,
    ) -> Result<BigDecimal, ChatError> {
        diesel::update(chats::table.filter(chats::id.eq(id)))
            .set(chats::total_cost.eq(chats::total_cost + cost.clone()))
            .returning(chats::total_cost)
            .get_result::<BigDecimal>(conn)
            .map_err(|e| match e {
                diesel::result::Error::NotFound => ChatError::NotFound,
                _ => ChatError::DatabaseError(e),
            })
    }
}

#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = chats)]
pub struct NewChat {
    pub id: Uuid,
    pub user_id: Uuid,
    pub title: String,
    pub visibility: String,
}

impl NewChat {
    pub fn new(id: Uuid, user_id: Uuid, title: String, visibility: Visibility) -> Self {
        Self {
            id,
            user_id,
            title,
            visibility: visibility.as_str().to_string(),
        }
    }

    pub fn insert(&self, conn: &mut PgConnection) -> Result<Chat, ChatError> {
        diesel::insert_into(chats::table)
            .values(self)
            .get_result::<Chat>(conn)
            .map_err(ChatError::DatabaseError)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_visibility_round_trips_through_text_column() {
        assert_eq!("public".parse::<Visibility>().unwrap(), Visibility::Public);
        assert_eq!(Visibility::Private.as_str(), "private");
        assert!(matches!(
            "friends".parse::<Visibility>(),
            Err(ChatError::InvalidVisibility(_))
        ));
    }
}
