use crate::models::schema::{messages, votes};
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum MessageError {
    #[error("Database error: {0}")]
    DatabaseError(DieselError),
    #[error("Message not found")]
    NotFound,
    #[error("Message id already exists")]
    DuplicateId,
    #[error("Malformed message content: {0}")]
    MalformedContent(#[from] serde_json::Error),
}

impl From<DieselError> for MessageError {
    fn from(err: DieselError) -> Self {
        match err {
            DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, _) => {
                MessageError::DuplicateId
            }
            other => MessageError::DatabaseError(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }

    pub fn parse(s: &str) -> Option<Role> {
        match s {
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            "tool" => Some(Role::Tool),
            _ => None,
        }
    }
}

/// One typed part of a stored message. Persisted as a JSON array in `messages.content`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ContentPart {
    Text {
        text: String,
    },
    Image {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        media_type: Option<String>,
    },
    File {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        media_type: String,
    },
    ToolCall {
        tool_call_id: String,
        tool_name: String,
        args: Value,
    },
    ToolResult {
        tool_call_id: String,
        tool_name: String,
        result: Value,
        #[serde(default)]
        is_error: bool,
    },
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        ContentPart::Text { text: text.into() }
    }
}

/// Concatenates the text parts of a message, ignoring attachments and tool traffic.
pub fn text_of(parts: &[ContentPart]) -> String {
    parts
        .iter()
        .filter_map(|p| match p {
            ContentPart::Text { text } => Some(text.as_str()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[derive(Queryable, Identifiable, Serialize, Deserialize, Clone, Debug)]
#[diesel(table_name = messages)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct Message {
    pub id: Uuid,
    pub chat_id: Uuid,
    pub role: String,
    pub content: Value,
    pub cost: BigDecimal,
    pub model_label: Option<String>,
    pub input_tokens: i32,
    pub output_tokens: i32,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn parts(&self) -> Result<Vec<ContentPart>, MessageError> {
        serde_json::from_value(self.content.clone()).map_err(MessageError::MalformedContent)
    }

    pub fn role(&self) -> Option<Role> {
        Role::parse(&self.role)
    }

    pub fn get_by_id(conn: &mut PgConnection, id: Uuid) -> Result<Option<Message>, MessageError> {
        messages::table
            .filter(messages::id.eq(id))
            .first::<Message>(conn)
            .optional()
            .map_err(MessageError::DatabaseError)
    }

    pub fn get_by_chat_id(
        conn: &mut PgConnection,
        chat_id: Uuid,
    ) -> Result<Vec<Message>, MessageError> {
        messages::table
            .filter(messages::chat_id.eq(chat_id))
            .order(messages::created_at.asc())
            .load::<Message>(conn)
            .map_err(MessageError::DatabaseError)
    }

    /// Removes every message of the chat created at or after `timestamp`.
    pub fn delete_by_chat_id_after_timestamp(
        conn: &mut PgConnection,
        chat_id: Uuid,
        timestamp: DateTime<Utc>,
    ) -> Result<usize, MessageError> {
        conn.transaction(|conn| {
            let doomed: Vec<Uuid> = messages::table
                .filter(messages::chat_id.eq(chat_id))
                .filter(messages::created_at.ge(timestamp))
                .select(messages::id)
                .load(conn)?;

            if doomed.is_empty() {
                return Ok(0);
            }

            diesel::delete(
                votes::table
                    .filter(votes::chat_id.eq(chat_id))
                    .filter(votes::message_id.eq_any(doomed.clone())),
            )
            .execute(conn)?;

            diesel::delete(messages::table.filter(messages::id.eq_any(doomed))).execute(conn)
        })
        .map_err(MessageError::DatabaseError)
    }
}

#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = messages)]
pub struct NewMessage {
    pub id: Uuid,
    pub chat_id: Uuid,
    pub role: String,
    pub content: Value,
    pub cost: BigDecimal,
    pub model_label: Option<String>,
    pub input_tokens: i32,
    pub output_tokens: i32,
    pub created_at: DateTime<Utc>,
}

impl NewMessage {
    /// A message with zeroed cost and token fields.
    pub fn unbilled(
        id: Uuid,
        chat_id: Uuid,
        role: Role,
        parts: &[ContentPart],
        model_label: Option<String>,
        created_at: DateTime<Utc>,
    ) -> Result<Self, MessageError> {
        Ok(Self {
            id,
            chat_id,
            role: role.as_str().to_string(),
            content: serde_json::to_value(parts)?,
            cost: BigDecimal::from(0),
            model_label,
            input_tokens: 0,
            output_tokens: 0,
            created_at,
        })
    }

    pub fn insert_all(
        conn: &mut PgConnection,
        new_messages: &[NewMessage],
    ) -> Result<Vec<Message>, MessageError> {
        diesel::insert_into(messages::table)
            .values(new_messages)
            .get_results::<Message>(conn)
            .map_err(MessageError::from)
    }
}

#[derive(Queryable, Insertable, Serialize, Deserialize, Clone, Debug, PartialEq)]
#[diesel(table_name = votes)]
#[serde(rename_all = "camelCase")]
pub struct Vote {
    pub chat_id: Uuid,
    pub message_id: Uuid,
    pub is_upvoted: bool,
}

impl Vote {
    pub fn upsert(&self, conn: &mut PgConnection) -> Result<(), MessageError> {
        diesel::insert_into(votes::table)
            .values(self)
            .on_conflict((votes::chat_id, votes::message_id))
            .do_update()
            .set(votes::is_upvoted.eq(self.is_upvoted))
            .execute(conn)
            .map(|_| ())
            .map_err(MessageError::DatabaseError)
    }

    pub fn get_by_chat_id(conn: &mut PgConnection, chat_id: Uuid) -> Result<Vec<Vote>, MessageError> {
        votes::table
            .filter(votes::chat_id.eq(chat_id))
            .load::<Vote>(conn)
            .map_err(MessageError::DatabaseError)
    }
}
