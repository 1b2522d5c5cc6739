use crate::models::schema::users;
use bigdecimal::{BigDecimal, Zero};
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum UserError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] diesel::result::Error),
    #[error("User not found")]
    NotFound,
}

#[derive(Queryable, Identifiable, Serialize, Deserialize, Clone)]
#[diesel(table_name = users)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct User {
    pub id: Uuid,
    pub email: String,
    #[serde(skip_serializing)]
    pub password_hash: Option<String>,
    pub api_balance_cents: BigDecimal,
    pub message_count: i32,
    pub message_limit: i32,
    pub referral_code_used: Option<String>,
    pub referral_coupon: Option<String>,
    #[serde(skip_serializing)]
    pub otp: Option<String>,
    #[serde(skip_serializing)]
    pub otp_expires_at: Option<DateTime<Utc>>,
    pub is_registration_complete: bool,
    pub last_ip: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl std::fmt::Debug for User {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("User")
            .field("id", &self.id)
            .field("email", &self.email)
            .field("password_hash", &"<redacted>")
            .field("api_balance_cents", &self.api_balance_cents)
            .field("message_count", &self.message_count)
            .field("referral_code_used", &self.referral_code_used)
            .field("otp", &"<redacted>")
            .field("is_registration_complete", &self.is_registration_complete)
            .finish()
    }
}

impl User {
    /// A user may start a turn only while holding a strictly positive balance.
    pub fn has_spendable_balance(&self) -> bool {
        self.api_balance_cents > BigDecimal::zero()
    }

    pub fn get_by_uuid(conn: &mut PgConnection, uuid: Uuid) -> Result<User, UserError> {
        users::table
            .filter(users::id.eq(uuid))
            .first::<User>(conn)
            .map_err(|e| match e {
                diesel::result::Error::NotFound => UserError::NotFound,
                _ => UserError::DatabaseError(e),
            })
    }

    pub fn get_balance(conn: &mut PgConnection, uuid: Uuid) -> Result<BigDecimal, UserError> {
        users::table
            .filter(users::id.eq(uuid))
            .select(users::api_balance_cents)
            .first::<BigDecimal>(conn)
            .map_err(|e| match e {
                diesel::result::Error::NotFound => UserError::NotFound,
                _ => UserError::DatabaseError(e),
            })
    }

    /// Adds `amount` to the balance with SQL-side arithmetic and returns the new balance.
    pub fn credit_balance(
        conn: &mut PgConnection,
        uuid: Uuid,
        amount: &BigDecimal,
    ) -> Result<BigDecimal, UserError> {
        diesel::update(users::table.filter(users::id.eq(uuid)))
            .set((
                users::api_balance_cents.eq(users::api_balance_cents + amount.clone()),
                users::updated_at.eq(diesel::dsl::now),
            ))
            .returning(users::api_balance_cents)
            .get_result::<BigDecimal>(conn)
            .map_err(|e| match e {
                diesel::result::Error::NotFound => UserError::NotFound,
                _ => UserError::DatabaseError(e),
            })
    }

    /// Unconditionally subtracts a settled turn cost and bumps the lifetime message counter.
    pub fn charge_turn(
        conn: &mut PgConnection,
        uuid: Uuid,
        amount: &BigDecimal,
    ) -> Result<BigDecimal, UserError> {
        diesel::update(users::table.filter(users::id.eq(uuid)))
            .set((
                users::api_balance_cents.eq(users::api_balance_cents - amount.clone()),
                users::message_count.eq(users::message_count + 1),
                users::updated_at.eq(diesel::dsl::now),
            ))
            .returning(users::api_balance_cents)
            .get_result::<BigDecimal>(conn)
            .map_err(|e| match e {
                diesel::result::Error::NotFound => UserError::NotFound,
                _ => UserError::DatabaseError(e),
            })
    }

    /// Debits `amount` only when the balance covers it. `Ok(None)` means insufficient funds.
    pub fn try_debit_balance(
        conn: &mut PgConnection,
        uuid: Uuid,
        amount: &BigDecimal,
    ) -> Result<Option<BigDecimal>, UserError> {
        diesel::update(
            users::table
                .filter(users::id.eq(uuid))
                .filter(users::api_balance_cents.ge(amount.clone())),
        )
        .set((
            users::api_balance_cents.eq(users::api_balance_cents - amount.clone()),
            users::updated_at.eq(diesel::dsl::now),
        ))
        .returning(users::api_balance_cents)
        .get_result::<BigDecimal>(conn)
        .optional()
        .map_err(UserError::DatabaseError)
    }

    /// Records the referral code on a user that has not used one yet.
    /// Returns false when the user already carries a referral code.
    pub fn claim_referral_slot(
        conn: &mut PgConnection,
        uuid: Uuid,
        code: &str,
    ) -> Result<bool, UserError> {
        let rows = diesel::update(
            users::table
                .filter(users::id.eq(uuid))
                .filter(users::referral_code_used.is_null()),
        )
        .set((
            users::referral_code_used.eq(code),
            users::updated_at.eq(diesel::dsl::now),
        ))
        .execute(conn)
        .map_err(UserError::DatabaseError)?;
        Ok(rows == 1)
    }

    pub fn set_last_ip(conn: &mut PgConnection, uuid: Uuid, ip: &str) -> Result<(), UserError> {
        diesel::update(users::table.filter(users::id.eq(uuid)))
            .set(users::last_ip.eq(ip))
            .execute(conn)
            .map(|_| ())
            .map_err(UserError::DatabaseError)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn user_with_balance(balance: &str) -> User {
        User {
            id: Uuid::new_v4(),
            email: "someone@example.com".to_string(),
            password_hash: None,
            api_balance_cents: BigDecimal::from_str(balance).unwrap(),
            message_count: 0,
            message_limit: 0,
            referral_code_used: None,
            referral_coupon: None,
            otp: Some("123456".to_string()),
            otp_expires_at: None,
            is_registration_complete: true,
            last_ip: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_spendable_balance_requires_positive_amount() {
        assert!(user_with_balance("0.01").has_spendable_balance());
        assert!(!user_with_balance("0").has_spendable_balance());
        assert!(!user_with_balance("-3.5").has_spendable_balance());
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let user = user_with_balance("10");
        let rendered = format!("{:?}", user);
        assert!(!rendered.contains("123456"));
        assert!(rendered.contains("<redacted>"));
    }
}
