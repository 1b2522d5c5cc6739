use crate::models::schema::{ip_history, user_interest_logs};
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum AuditError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] diesel::result::Error),
}

#[derive(Queryable, Serialize, Deserialize, Clone, Debug)]
#[diesel(table_name = ip_history)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct IpHistory {
    pub id: i64,
    pub user_id: Uuid,
    pub ip_address: String,
    pub user_agent: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = ip_history)]
pub struct NewIpHistory {
    pub user_id: Uuid,
    pub ip_address: String,
    pub user_agent: Option<String>,
}

impl NewIpHistory {
    pub fn insert(&self, conn: &mut PgConnection) -> Result<IpHistory, AuditError> {
        diesel::insert_into(ip_history::table)
            .values(self)
            .get_result::<IpHistory>(conn)
            .map_err(AuditError::DatabaseError)
    }
}

#[derive(Queryable, Serialize, Deserialize, Clone, Debug)]
#[diesel(table_name = user_interest_logs)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct UserInterestLog {
    pub id: i64,
    pub user_id: Uuid,
    pub interest: String,
    pub source: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = user_interest_logs)]
pub struct NewUserInterestLog {
    pub user_id: Uuid,
    pub interest: String,
    pub source: Option<String>,
}

impl NewUserInterestLog {
    pub fn insert(&self, conn: &mut PgConnection) -> Result<UserInterestLog, AuditError> {
        diesel::insert_into(user_interest_logs::table)
            .values(self)
            .get_result::<UserInterestLog>(conn)
            .map_err(AuditError::DatabaseError)
    }
}
