use crate::models::schema::{bkash_auth_tokens, bkash_payments};
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum BkashRecordError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] diesel::result::Error),
    #[error("Payment not found")]
    NotFound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentStatus {
    Initiated,
    Successful,
    Failure,
    #[serde(rename = "canceled")]
    Canceled,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Initiated => "Initiated",
            PaymentStatus::Successful => "Successful",
            PaymentStatus::Failure => "Failure",
            PaymentStatus::Canceled => "canceled",
        }
    }

    pub fn parse(s: &str) -> Option<PaymentStatus> {
        match s {
            "Initiated" => Some(PaymentStatus::Initiated),
            "Successful" => Some(PaymentStatus::Successful),
            "Failure" => Some(PaymentStatus::Failure),
            "canceled" => Some(PaymentStatus::Canceled),
            _ => None,
        }
    }

    pub fn is_final(&self) -> bool {
        !matches!(self, PaymentStatus::Initiated)
    }
}

#[derive(Queryable, Identifiable, Serialize, Deserialize, Clone, Debug)]
#[diesel(table_name = bkash_payments)]
#[diesel(primary_key(payment_id))]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct BkashPayment {
    pub payment_id: String,
    pub user_id: Uuid,
    pub trx_id: Option<String>,
    pub status: String,
    pub mobile_number: Option<String>,
    pub amount_bdt: BigDecimal,
    pub credited_cents: Option<BigDecimal>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BkashPayment {
    pub fn status(&self) -> Option<PaymentStatus> {
        PaymentStatus::parse(&self.status)
    }

    pub fn get_by_payment_id(
        conn: &mut PgConnection,
        payment_id: &str,
    ) -> Result<Option<BkashPayment>, BkashRecordError> {
        bkash_payments::table
            .filter(bkash_payments::payment_id.eq(payment_id))
            .first::<BkashPayment>(conn)
            .optional()
            .map_err(BkashRecordError::DatabaseError)
    }

    /// Moves an `Initiated` payment to its final status. Returns false when the row
    /// was already settled, so a replayed callback cannot credit twice.
    pub fn finalize(
        conn: &mut PgConnection,
        payment_id: &str,
        outcome: &PaymentOutcome,
    ) -> Result<bool, BkashRecordError> {
        let rows = diesel::update(
            bkash_payments::table
                .filter(bkash_payments::payment_id.eq(payment_id))
                .filter(bkash_payments::status.eq(PaymentStatus::Initiated.as_str())),
        )
        .set((
            bkash_payments::status.eq(outcome.status.as_str()),
            bkash_payments::trx_id.eq(outcome.trx_id.clone()),
            bkash_payments::mobile_number.eq(outcome.mobile_number.clone()),
            bkash_payments::credited_cents.eq(outcome.credited_cents.clone()),
            bkash_payments::updated_at.eq(diesel::dsl::now),
        ))
        .execute(conn)?;
        Ok(rows == 1)
    }
}

/// Final state recorded for a payment once the gateway has answered.
#[derive(Debug, Clone, PartialEq)]
pub struct PaymentOutcome {
    pub status: PaymentStatus,
    pub trx_id: Option<String>,
    pub mobile_number: Option<String>,
    pub credited_cents: Option<BigDecimal>,
}

impl PaymentOutcome {
    pub fn without_credit(status: PaymentStatus) -> Self {
        Self {
            status,
            trx_id: None,
            mobile_number: None,
            credited_cents: None,
        }
    }
}

#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = bkash_payments)]
pub struct NewBkashPayment {
    pub payment_id: String,
    pub user_id: Uuid,
    pub status: String,
    pub amount_bdt: BigDecimal,
}

impl NewBkashPayment {
    pub fn initiated(payment_id: String, user_id: Uuid, amount_bdt: BigDecimal) -> Self {
        Self {
            payment_id,
            user_id,
            status: PaymentStatus::Initiated.as_str().to_string(),
            amount_bdt,
        }
    }

    pub fn insert(&self, conn: &mut PgConnection) -> Result<BkashPayment, BkashRecordError> {
        diesel::insert_into(bkash_payments::table)
            .values(self)
            .get_result::<BkashPayment>(conn)
            .map_err(BkashRecordError::DatabaseError)
    }
}

#[derive(Queryable, Insertable, Clone)]
#[diesel(table_name = bkash_auth_tokens)]
pub struct BkashAuthToken {
    pub user_id: Uuid,
    pub id_token: String,
    pub refresh_token: String,
    pub created_at: DateTime<Utc>,
}

impl std::fmt::Debug for BkashAuthToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BkashAuthToken")
            .field("user_id", &self.user_id)
            .field("id_token", &"[REDACTED]")
            .field("refresh_token", &"[REDACTED]")
            .field("created_at", &self.created_at)
            .finish()
    }
}

impl BkashAuthToken {
    pub fn get_by_user_id(
        conn: &mut PgConnection,
        user_id: Uuid,
    ) -> Result<Option<BkashAuthToken>, BkashRecordError> {
        bkash_auth_tokens::table
            .filter(bkash_auth_tokens::user_id.eq(user_id))
            .first::<BkashAuthToken>(conn)
            .optional()
            .map_err(BkashRecordError::DatabaseError)
    }

    pub fn upsert(&self, conn: &mut PgConnection) -> Result<(), BkashRecordError> {
        diesel::insert_into(bkash_auth_tokens::table)
            .values(self)
            .on_conflict(bkash_auth_tokens::user_id)
            .do_update()
            .set((
                bkash_auth_tokens::id_token.eq(&self.id_token),
                bkash_auth_tokens::refresh_token.eq(&self.refresh_token),
                bkash_auth_tokens::created_at.eq(self.created_at),
            ))
            .execute(conn)
            .map(|_| ())
            .map_err(BkashRecordError::DatabaseError)
    }
}
