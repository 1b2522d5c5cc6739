use crate::models::audit::{AuditError, NewIpHistory, NewUserInterestLog};
use crate::models::bkash::{
    BkashAuthToken, BkashPayment, BkashRecordError, NewBkashPayment, PaymentOutcome,
    PaymentStatus,
};
use crate::models::chats::{Chat, ChatError, NewChat, Visibility};
use crate::models::documents::{Document, DocumentError, NewDocument, NewSuggestion, Suggestion};
use crate::models::messages::{Message, MessageError, NewMessage, Vote};
use crate::models::referrals::{
    Coupon, CouponError, CouponRedemption, Referral, ReferralError,
};
use crate::models::users::{User, UserError};
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, Pool};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info};
use uuid::Uuid;

pub mod ledger;
#[cfg(test)]
pub mod memory;

use ledger::LedgerTx;

#[derive(Error, Debug)]
pub enum DBError {
    #[error("Database connection error")]
    ConnectionError,
    #[error("Database error: {0}")]
    DatabaseError(#[from] diesel::result::Error),
    #[error("User error: {0}")]
    UserError(#[from] UserError),
    #[error("Chat error: {0}")]
    ChatError(#[from] ChatError),
    #[error("Message error: {0}")]
    MessageError(#[from] MessageError),
    #[error("Document error: {0}")]
    DocumentError(#[from] DocumentError),
    #[error("Referral error: {0}")]
    ReferralError(#[from] ReferralError),
    #[error("Coupon error: {0}")]
    CouponError(#[from] CouponError),
    #[error("bKash record error: {0}")]
    BkashRecordError(#[from] BkashRecordError),
    #[error("Audit log error: {0}")]
    AuditError(#[from] AuditError),
}

/// Everything persisted when a turn finishes. Applied all-or-nothing.
#[derive(Debug, Clone)]
pub struct TurnCompletion {
    pub user_id: Uuid,
    pub chat_id: Uuid,
    pub messages: Vec<NewMessage>,
    /// Full cost of the turn, recorded on the chat total.
    pub cost: BigDecimal,
    /// Part of `cost` already taken from the balance when the turn started.
    pub reserved: BigDecimal,
}

impl TurnCompletion {
    pub fn outstanding(&self) -> BigDecimal {
        &self.cost - &self.reserved
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TurnReceipt {
    pub balance_cents: BigDecimal,
    pub chat_total_cost: BigDecimal,
}

/// Result of applying a gateway answer to a stored bKash payment.
#[derive(Debug, Clone, PartialEq)]
pub enum Settlement {
    Credited { balance_cents: BigDecimal },
    Recorded(PaymentStatus),
    AlreadySettled,
}

pub trait DBConnection {
    // users
    fn get_user_by_uuid(&self, uuid: Uuid) -> Result<User, DBError>;
    fn get_balance(&self, uuid: Uuid) -> Result<BigDecimal, DBError>;
    fn credit_balance(&self, uuid: Uuid, amount: &BigDecimal) -> Result<BigDecimal, DBError>;
    fn try_debit_balance(
        &self,
        uuid: Uuid,
        amount: &BigDecimal,
    ) -> Result<Option<BigDecimal>, DBError>;

    // chats
    fn create_chat(&self, new_chat: NewChat) -> Result<Chat, DBError>;
    fn get_chat_by_id(&self, id: Uuid) -> Result<Option<Chat>, DBError>;
    fn get_not_deleted_chats_by_user_id(&self, user_id: Uuid) -> Result<Vec<Chat>, DBError>;
    fn soft_delete_chat(&self, id: Uuid, user_id: Uuid) -> Result<(), DBError>;
    fn update_chat_title(&self, id: Uuid, title: &str) -> Result<(), DBError>;
    fn update_chat_visibility(
        &self,
        id: Uuid,
        user_id: Uuid,
        visibility: Visibility,
    ) -> Result<(), DBError>;

    // messages
    fn save_messages(&self, messages: Vec<NewMessage>) -> Result<Vec<Message>, DBError>;
    fn get_messages_by_chat_id(&self, chat_id: Uuid) -> Result<Vec<Message>, DBError>;
    fn get_message_by_id(&self, id: Uuid) -> Result<Option<Message>, DBError>;
    fn delete_messages_by_chat_id_after_timestamp(
        &self,
        chat_id: Uuid,
        timestamp: DateTime<Utc>,
    ) -> Result<usize, DBError>;
    fn complete_turn(&self, completion: TurnCompletion) -> Result<TurnReceipt, DBError>;

    // votes
    fn vote_message(&self, vote: Vote) -> Result<(), DBError>;
    fn get_votes_by_chat_id(&self, chat_id: Uuid) -> Result<Vec<Vote>, DBError>;

    // documents
    fn save_document(&self, document: NewDocument) -> Result<Document, DBError>;
    fn get_documents_by_id(&self, id: Uuid) -> Result<Vec<Document>, DBError>;
    fn get_document_by_id(&self, id: Uuid) -> Result<Option<Document>, DBError>;
    fn delete_documents_by_id_after_timestamp(
        &self,
        id: Uuid,
        timestamp: DateTime<Utc>,
    ) -> Result<usize, DBError>;
    fn save_suggestions(&self, suggestions: Vec<NewSuggestion>) -> Result<(), DBError>;
    fn get_suggestions_by_document_id(&self, document_id: Uuid)
        -> Result<Vec<Suggestion>, DBError>;

    // ledgers
    fn redeem_referral(&self, user_id: Uuid, code: &str) -> Result<BigDecimal, DBError>;
    fn redeem_coupon(
        &self,
        user_id: Uuid,
        code: &str,
        now: DateTime<Utc>,
    ) -> Result<BigDecimal, DBError>;

    // bKash
    fn get_bkash_auth_token(&self, user_id: Uuid) -> Result<Option<BkashAuthToken>, DBError>;
    fn upsert_bkash_auth_token(&self, token: BkashAuthToken) -> Result<(), DBError>;
    fn create_bkash_payment(&self, payment: NewBkashPayment) -> Result<BkashPayment, DBError>;
    fn get_bkash_payment(&self, payment_id: &str) -> Result<Option<BkashPayment>, DBError>;
    fn settle_bkash_payment(
        &self,
        payment_id: &str,
        outcome: PaymentOutcome,
    ) -> Result<Settlement, DBError>;

    // audit
    fn log_ip(&self, entry: NewIpHistory) -> Result<(), DBError>;
    fn log_user_interest(&self, entry: NewUserInterestLog) -> Result<(), DBError>;
}

pub struct PostgresConnection {
    db: Pool<ConnectionManager<PgConnection>>,
}

impl PostgresConnection {
    fn conn(
        &self,
    ) -> Result<diesel::r2d2::PooledConnection<ConnectionManager<PgConnection>>, DBError> {
        self.db.get().map_err(|e| {
            error!("Could not get pooled connection: {:?}", e);
            DBError::ConnectionError
        })
    }
}

impl DBConnection for PostgresConnection {
    fn get_user_by_uuid(&self, uuid: Uuid) -> Result<User, DBError> {
        debug!("Getting user by uuid");
        let conn = &mut self.conn()?;
        Ok(User::get_by_uuid(conn, uuid)?)
    }

    fn get_balance(&self, uuid: Uuid) -> Result<BigDecimal, DBError> {
        let conn = &mut self.conn()?;
        Ok(User::get_balance(conn, uuid)?)
    }

    fn credit_balance(&self, uuid: Uuid, amount: &BigDecimal) -> Result<BigDecimal, DBError> {
        debug!("Crediting balance for user {}", uuid);
        let conn = &mut self.conn()?;
        Ok(User::credit_balance(conn, uuid, amount)?)
    }

    fn try_debit_balance(
        &self,
        uuid: Uuid,
        amount: &BigDecimal,
    ) -> Result<Option<BigDecimal>, DBError> {
        let conn = &mut self.conn()?;
        Ok(User::try_debit_balance(conn, uuid, amount)?)
    }

    fn create_chat(&self, new_chat: NewChat) -> Result<Chat, DBError> {
        debug!("Creating chat {}", new_chat.id);
        let conn = &mut self.conn()?;
        Ok(new_chat.insert(conn)?)
    }

    fn get_chat_by_id(&self, id: Uuid) -> Result<Option<Chat>, DBError> {
        let conn = &mut self.conn()?;
        Ok(Chat::get_by_id(conn, id)?)
    }

    fn get_not_deleted_chats_by_user_id(&self, user_id: Uuid) -> Result<Vec<Chat>, DBError> {
        let conn = &mut self.conn()?;
        Ok(Chat::get_not_deleted_by_user_id(conn, user_id)?)
    }

    fn soft_delete_chat(&self, id: Uuid, user_id: Uuid) -> Result<(), DBError> {
        debug!("Soft deleting chat {}", id);
        let conn = &mut self.conn()?;
        Ok(Chat::soft_delete(conn, id, user_id)?)
    }

    fn update_chat_title(&self, id: Uuid, title: &str) -> Result<(), DBError> {
        let conn = &mut self.conn()?;
        Ok(Chat::update_title(conn, id, title)?)
    }

    fn update_chat_visibility(
        &self,
        id: Uuid,
        user_id: Uuid,
        visibility: Visibility,
    ) -> Result<(), DBError> {
        let conn = &mut self.conn()?;
        Ok(Chat::update_visibility(conn, id, user_id, visibility)?)
    }

    fn save_messages(&self, messages: Vec<NewMessage>) -> Result<Vec<Message>, DBError> {
        let conn = &mut self.conn()?;
        Ok(NewMessage::insert_all(conn, &messages)?)
    }

    fn get_messages_by_chat_id(&self, chat_id: Uuid) -> Result<Vec<Message>, DBError> {
        let conn = &mut self.conn()?;
        Ok(Message::get_by_chat_id(conn, chat_id)?)
    }

    fn get_message_by_id(&self, id: Uuid) -> Result<Option<Message>, DBError> {
        let conn = &mut self.conn()?;
        Ok(Message::get_by_id(conn, id)?)
    }

    fn delete_messages_by_chat_id_after_timestamp(
        &self,
        chat_id: Uuid,
        timestamp: DateTime<Utc>,
    ) -> Result<usize, DBError> {
        let conn = &mut self.conn()?;
        Ok(Message::delete_by_chat_id_after_timestamp(
            conn, chat_id, timestamp,
        )?)
    }

    fn complete_turn(&self, completion: TurnCompletion) -> Result<TurnReceipt, DBError> {
        debug!(
            "Completing turn for chat {} with {} messages",
            completion.chat_id,
            completion.messages.len()
        );
        let conn: &mut PgConnection = &mut *self.conn()?;
        conn.transaction::<_, DBError, _>(|conn| ledger::complete_turn(conn, &completion))
    }

    fn vote_message(&self, vote: Vote) -> Result<(), DBError> {
        let conn = &mut self.conn()?;
        Ok(vote.upsert(conn)?)
    }

    fn get_votes_by_chat_id(&self, chat_id: Uuid) -> Result<Vec<Vote>, DBError> {
        let conn = &mut self.conn()?;
        Ok(Vote::get_by_chat_id(conn, chat_id)?)
    }

    fn save_document(&self, document: NewDocument) -> Result<Document, DBError> {
        let conn = &mut self.conn()?;
        Ok(document.insert(conn)?)
    }

    fn get_documents_by_id(&self, id: Uuid) -> Result<Vec<Document>, DBError> {
        let conn = &mut self.conn()?;
        Ok(Document::get_versions_by_id(conn, id)?)
    }

    fn get_document_by_id(&self, id: Uuid) -> Result<Option<Document>, DBError> {
        let conn = &mut self.conn()?;
        Ok(Document::get_latest_by_id(conn, id)?)
    }

    fn delete_documents_by_id_after_timestamp(
        &self,
        id: Uuid,
        timestamp: DateTime<Utc>,
    ) -> Result<usize, DBError> {
        let conn = &mut self.conn()?;
        Ok(Document::delete_by_id_after_timestamp(conn, id, timestamp)?)
    }

    fn save_suggestions(&self, suggestions: Vec<NewSuggestion>) -> Result<(), DBError> {
        if suggestions.is_empty() {
            return Ok(());
        }
        let conn = &mut self.conn()?;
        Ok(NewSuggestion::insert_all(conn, &suggestions)?)
    }

    fn get_suggestions_by_document_id(
        &self,
        document_id: Uuid,
    ) -> Result<Vec<Suggestion>, DBError> {
        let conn = &mut self.conn()?;
        Ok(Suggestion::get_by_document_id(conn, document_id)?)
    }

    fn redeem_referral(&self, user_id: Uuid, code: &str) -> Result<BigDecimal, DBError> {
        info!("Redeeming referral code for user {}", user_id);
        let conn: &mut PgConnection = &mut *self.conn()?;
        conn.transaction::<_, DBError, _>(|conn| ledger::redeem_referral(conn, user_id, code))
    }

    fn redeem_coupon(
        &self,
        user_id: Uuid,
        code: &str,
        now: DateTime<Utc>,
    ) -> Result<BigDecimal, DBError> {
        info!("Redeeming coupon for user {}", user_id);
        let conn: &mut PgConnection = &mut *self.conn()?;
        conn.transaction::<_, DBError, _>(|conn| ledger::redeem_coupon(conn, user_id, code, now))
    }

    fn get_bkash_auth_token(&self, user_id: Uuid) -> Result<Option<BkashAuthToken>, DBError> {
        let conn = &mut self.conn()?;
        Ok(BkashAuthToken::get_by_user_id(conn, user_id)?)
    }

    fn upsert_bkash_auth_token(&self, token: BkashAuthToken) -> Result<(), DBError> {
        let conn = &mut self.conn()?;
        Ok(token.upsert(conn)?)
    }

    fn create_bkash_payment(&self, payment: NewBkashPayment) -> Result<BkashPayment, DBError> {
        debug!("Recording bKash payment {}", payment.payment_id);
        let conn = &mut self.conn()?;
        Ok(payment.insert(conn)?)
    }

    fn get_bkash_payment(&self, payment_id: &str) -> Result<Option<BkashPayment>, DBError> {
        let conn = &mut self.conn()?;
        Ok(BkashPayment::get_by_payment_id(conn, payment_id)?)
    }

    fn settle_bkash_payment(
        &self,
        payment_id: &str,
        outcome: PaymentOutcome,
    ) -> Result<Settlement, DBError> {
        let conn: &mut PgConnection = &mut *self.conn()?;
        conn.transaction::<_, DBError, _>(|conn| {
            ledger::settle_bkash_payment(conn, payment_id, &outcome)
        })
    }

    fn log_ip(&self, entry: NewIpHistory) -> Result<(), DBError> {
        let conn = &mut self.conn()?;
        conn.transaction::<_, DBError, _>(|conn| {
            entry.insert(conn)?;
            User::set_last_ip(conn, entry.user_id, &entry.ip_address)?;
            Ok(())
        })
    }

    fn log_user_interest(&self, entry: NewUserInterestLog) -> Result<(), DBError> {
        let conn = &mut self.conn()?;
        entry.insert(conn)?;
        Ok(())
    }
}

impl LedgerTx for PgConnection {
    fn credit(&mut self, user_id: Uuid, amount: &BigDecimal) -> Result<BigDecimal, DBError> {
        Ok(User::credit_balance(self, user_id, amount)?)
    }

    fn charge_turn(&mut self, user_id: Uuid, amount: &BigDecimal) -> Result<BigDecimal, DBError> {
        Ok(User::charge_turn(self, user_id, amount)?)
    }

    fn add_chat_cost(&mut self, chat_id: Uuid, cost: &BigDecimal) -> Result<BigDecimal, DBError> {
        Ok(Chat::add_cost(self, chat_id, cost)?)
    }

    fn insert_messages(&mut self, messages: &[NewMessage]) -> Result<(), DBError> {
        NewMessage::insert_all(self, messages)?;
        Ok(())
    }

    fn referral(&mut self, code: &str) -> Result<Referral, DBError> {
        Ok(Referral::get_by_code(self, code)?)
    }

    fn claim_referral_slot(&mut self, user_id: Uuid, code: &str) -> Result<bool, DBError> {
        Ok(User::claim_referral_slot(self, user_id, code)?)
    }

    fn try_increment_referral(&mut self, code: &str) -> Result<bool, DBError> {
        Ok(Referral::try_increment_usage(self, code)?)
    }

    fn coupon(&mut self, code: &str) -> Result<Coupon, DBError> {
        Ok(Coupon::get_by_code(self, code)?)
    }

    fn insert_redemption(&mut self, redemption: &CouponRedemption) -> Result<(), DBError> {
        Ok(redemption.insert(self)?)
    }

    fn try_increment_coupon(&mut self, code: &str) -> Result<bool, DBError> {
        Ok(Coupon::try_increment_usage(self, code)?)
    }

    fn bkash_payment(&mut self, payment_id: &str) -> Result<Option<BkashPayment>, DBError> {
        Ok(BkashPayment::get_by_payment_id(self, payment_id)?)
    }

    fn finalize_bkash_payment(
        &mut self,
        payment_id: &str,
        outcome: &PaymentOutcome,
    ) -> Result<bool, DBError> {
        Ok(BkashPayment::finalize(self, payment_id, outcome)?)
    }
}

pub fn setup_db(url: String) -> Arc<dyn DBConnection + Send + Sync> {
    let manager = ConnectionManager::<PgConnection>::new(url);
    let pool = Pool::builder()
        .max_size(10)
        .test_on_check_out(true)
        .build_unchecked(manager);
    info!("Database pool configured");
    Arc::new(PostgresConnection { db: pool })
}
