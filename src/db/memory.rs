//! In-process `DBConnection` used by tests. Mirrors the conditional updates and
//! transaction boundaries of the Postgres implementation.

use super::ledger::{self, LedgerTx};
use super::{DBConnection, DBError, Settlement, TurnCompletion, TurnReceipt};
use crate::models::audit::{NewIpHistory, NewUserInterestLog};
use crate::models::bkash::{
    BkashAuthToken, BkashPayment, BkashRecordError, NewBkashPayment, PaymentOutcome,
    PaymentStatus,
};
use crate::models::chats::{Chat, ChatError, NewChat, Visibility};
use crate::models::documents::{Document, NewDocument, NewSuggestion, Suggestion};
use crate::models::messages::{Message, MessageError, NewMessage, Vote};
use crate::models::referrals::{Coupon, CouponError, CouponRedemption, Referral, ReferralError};
use crate::models::users::{User, UserError};
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use uuid::Uuid;

#[derive(Default, Clone)]
pub struct MemoryState {
    pub users: HashMap<Uuid, User>,
    pub chats: HashMap<Uuid, Chat>,
    pub messages: Vec<Message>,
    pub votes: Vec<Vote>,
    pub documents: Vec<Document>,
    pub suggestions: Vec<Suggestion>,
    pub referrals: HashMap<String, Referral>,
    pub coupons: HashMap<String, Coupon>,
    pub redemptions: HashSet<(Uuid, String)>,
    pub bkash_payments: HashMap<String, BkashPayment>,
    pub bkash_tokens: HashMap<Uuid, BkashAuthToken>,
    pub ip_history: Vec<NewIpHistory>,
    pub interests: Vec<NewUserInterestLog>,
}

#[derive(Default)]
pub struct InMemoryDb {
    state: Mutex<MemoryState>,
    fail_complete_turn: Mutex<bool>,
}

impl InMemoryDb {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_user(&self, email: &str, balance_cents: BigDecimal) -> User {
        let now = Utc::now();
        let user = User {
            id: Uuid::new_v4(),
            email: email.to_string(),
            password_hash: None,
            api_balance_cents: balance_cents,
            message_count: 0,
            message_limit: 0,
            referral_code_used: None,
            referral_coupon: None,
            otp: None,
            otp_expires_at: None,
            is_registration_complete: true,
            last_ip: None,
            created_at: now,
            updated_at: now,
        };
        self.state
            .lock()
            .unwrap()
            .users
            .insert(user.id, user.clone());
        user
    }

    pub fn insert_referral(
        &self,
        code: &str,
        owner: Option<Uuid>,
        bonus_cents: BigDecimal,
        max_limit: i32,
    ) {
        self.state.lock().unwrap().referrals.insert(
            code.to_string(),
            Referral {
                code: code.to_string(),
                owner_user_id: owner,
                bonus_cents,
                max_limit,
                times_used: 0,
                created_at: Utc::now(),
            },
        );
    }

    pub fn insert_coupon(&self, coupon: Coupon) {
        self.state
            .lock()
            .unwrap()
            .coupons
            .insert(coupon.code.clone(), coupon);
    }

    /// Makes the next `complete_turn` fail after it has applied part of its writes.
    pub fn fail_next_complete_turn(&self) {
        *self.fail_complete_turn.lock().unwrap() = true;
    }

    pub fn snapshot(&self) -> MemoryState {
        self.state.lock().unwrap().clone()
    }

    fn user_mut<'a>(state: &'a mut MemoryState, id: Uuid) -> Result<&'a mut User, DBError> {
        state
            .users
            .get_mut(&id)
            .ok_or(DBError::UserError(UserError::NotFound))
    }

    fn to_message(m: NewMessage) -> Message {
        Message {
            id: m.id,
            chat_id: m.chat_id,
            role: m.role,
            content: m.content,
            cost: m.cost,
            model_label: m.model_label,
            input_tokens: m.input_tokens,
            output_tokens: m.output_tokens,
            created_at: m.created_at,
        }
    }

    /// Runs `f` against a scratch copy and commits it only on success.
    fn transaction<T>(
        &self,
        f: impl FnOnce(&mut MemoryState) -> Result<T, DBError>,
    ) -> Result<T, DBError> {
        let mut guard = self.state.lock().unwrap();
        let mut scratch = guard.clone();
        let out = f(&mut scratch)?;
        *guard = scratch;
        Ok(out)
    }
}

impl LedgerTx for MemoryState {
    fn credit(&mut self, user_id: Uuid, amount: &BigDecimal) -> Result<BigDecimal, DBError> {
        let user = InMemoryDb::user_mut(self, user_id)?;
        user.api_balance_cents = &user.api_balance_cents + amount;
        Ok(user.api_balance_cents.clone())
    }

    fn charge_turn(&mut self, user_id: Uuid, amount: &BigDecimal) -> Result<BigDecimal, DBError> {
        let user = InMemoryDb::user_mut(self, user_id)?;
        user.api_balance_cents = &user.api_balance_cents - amount;
        user.message_count += 1;
        Ok(user.api_balance_cents.clone())
    }

    fn add_chat_cost(&mut self, chat_id: Uuid, cost: &BigDecimal) -> Result<BigDecimal, DBError> {
        let chat = self
            .chats
            .get_mut(&chat_id)
            .ok_or(DBError::ChatError(ChatError::NotFound))?;
        chat.total_cost = &chat.total_cost + cost;
        Ok(chat.total_cost.clone())
    }

    fn insert_messages(&mut self, messages: &[NewMessage]) -> Result<(), DBError> {
        if messages
            .iter()
            .any(|m| self.messages.iter().any(|stored| stored.id == m.id))
        {
            return Err(MessageError::DuplicateId.into());
        }
        self.messages
            .extend(messages.iter().cloned().map(InMemoryDb::to_message));
        Ok(())
    }

    fn referral(&mut self, code: &str) -> Result<Referral, DBError> {
        Ok(self
            .referrals
            .get(code)
            .cloned()
            .ok_or(ReferralError::UnknownCode)?)
    }

    fn claim_referral_slot(&mut self, user_id: Uuid, code: &str) -> Result<bool, DBError> {
        let user = InMemoryDb::user_mut(self, user_id)?;
        if user.referral_code_used.is_some() {
            return Ok(false);
        }
        user.referral_code_used = Some(code.to_string());
        Ok(true)
    }

    fn try_increment_referral(&mut self, code: &str) -> Result<bool, DBError> {
        let referral = self
            .referrals
            .get_mut(code)
            .ok_or(ReferralError::UnknownCode)?;
        if referral.times_used >= referral.max_limit {
            return Ok(false);
        }
        referral.times_used += 1;
        Ok(true)
    }

    fn coupon(&mut self, code: &str) -> Result<Coupon, DBError> {
        Ok(self
            .coupons
            .get(code)
            .cloned()
            .ok_or(CouponError::UnknownCode)?)
    }

    fn insert_redemption(&mut self, redemption: &CouponRedemption) -> Result<(), DBError> {
        if !self
            .redemptions
            .insert((redemption.user_id, redemption.code.clone()))
        {
            return Err(CouponError::AlreadyRedeemed.into());
        }
        Ok(())
    }

    fn try_increment_coupon(&mut self, code: &str) -> Result<bool, DBError> {
        let coupon = self.coupons.get_mut(code).ok_or(CouponError::UnknownCode)?;
        if coupon.times_used >= coupon.max_uses {
            return Ok(false);
        }
        coupon.times_used += 1;
        Ok(true)
    }

    fn bkash_payment(&mut self, payment_id: &str) -> Result<Option<BkashPayment>, DBError> {
        Ok(self.bkash_payments.get(payment_id).cloned())
    }

    fn finalize_bkash_payment(
        &mut self,
        payment_id: &str,
        outcome: &PaymentOutcome,
    ) -> Result<bool, DBError> {
        let payment = self
            .bkash_payments
            .get_mut(payment_id)
            .ok_or(BkashRecordError::NotFound)?;
        if payment.status != PaymentStatus::Initiated.as_str() {
            return Ok(false);
        }
        payment.status = outcome.status.as_str().to_string();
        payment.trx_id = outcome.trx_id.clone();
        payment.mobile_number = outcome.mobile_number.clone();
        payment.credited_cents = outcome.credited_cents.clone();
        Ok(true)
    }
}

impl DBConnection for InMemoryDb {
    fn get_user_by_uuid(&self, uuid: Uuid) -> Result<User, DBError> {
        self.state
            .lock()
            .unwrap()
            .users
            .get(&uuid)
            .cloned()
            .ok_or(DBError::UserError(UserError::NotFound))
    }

    fn get_balance(&self, uuid: Uuid) -> Result<BigDecimal, DBError> {
        Ok(self.get_user_by_uuid(uuid)?.api_balance_cents)
    }

    fn credit_balance(&self, uuid: Uuid, amount: &BigDecimal) -> Result<BigDecimal, DBError> {
        self.transaction(|state| {
            let user = Self::user_mut(state, uuid)?;
            user.api_balance_cents = &user.api_balance_cents + amount;
            Ok(user.api_balance_cents.clone())
        })
    }

    fn try_debit_balance(
        &self,
        uuid: Uuid,
        amount: &BigDecimal,
    ) -> Result<Option<BigDecimal>, DBError> {
        self.transaction(|state| {
            let user = Self::user_mut(state, uuid)?;
            if user.api_balance_cents < *amount {
                return Ok(None);
            }
            user.api_balance_cents = &user.api_balance_cents - amount;
            Ok(Some(user.api_balance_cents.clone()))
        })
    }

    fn create_chat(&self, new_chat: NewChat) -> Result<Chat, DBError> {
        let chat = Chat {
            id: new_chat.id,
            user_id: new_chat.user_id,
            title: new_chat.title,
            visibility: new_chat.visibility,
            total_cost: BigDecimal::from(0),
            is_deleted: false,
            created_at: Utc::now(),
        };
        self.state
            .lock()
            .unwrap()
            .chats
            .insert(chat.id, chat.clone());
        Ok(chat)
    }

    fn get_chat_by_id(&self, id: Uuid) -> Result<Option<Chat>, DBError> {
        Ok(self.state.lock().unwrap().chats.get(&id).cloned())
    }

    fn get_not_deleted_chats_by_user_id(&self, user_id: Uuid) -> Result<Vec<Chat>, DBError> {
        let mut chats: Vec<Chat> = self
            .state
            .lock()
            .unwrap()
            .chats
            .values()
            .filter(|c| c.user_id == user_id && !c.is_deleted)
            .cloned()
            .collect();
        chats.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(chats)
    }

    fn soft_delete_chat(&self, id: Uuid, user_id: Uuid) -> Result<(), DBError> {
        let mut state = self.state.lock().unwrap();
        match state.chats.get_mut(&id) {
            Some(chat) if chat.user_id == user_id => {
                chat.is_deleted = true;
                Ok(())
            }
            _ => Err(ChatError::NotFound.into()),
        }
    }

    fn update_chat_title(&self, id: Uuid, title: &str) -> Result<(), DBError> {
        if let Some(chat) = self.state.lock().unwrap().chats.get_mut(&id) {
            chat.title = title.to_string();
        }
        Ok(())
    }

    fn update_chat_visibility(
        &self,
        id: Uuid,
        user_id: Uuid,
        visibility: Visibility,
    ) -> Result<(), DBError> {
        let mut state = self.state.lock().unwrap();
        match state.chats.get_mut(&id) {
            Some(chat) if chat.user_id == user_id => {
                chat.visibility = visibility.as_str().to_string();
                Ok(())
            }
            _ => Err(ChatError::NotFound.into()),
        }
    }

    fn save_messages(&self, messages: Vec<NewMessage>) -> Result<Vec<Message>, DBError> {
        self.transaction(|state| {
            state.insert_messages(&messages)?;
            Ok(messages.into_iter().map(Self::to_message).collect())
        })
    }

    fn get_messages_by_chat_id(&self, chat_id: Uuid) -> Result<Vec<Message>, DBError> {
        let mut messages: Vec<Message> = self
            .state
            .lock()
            .unwrap()
            .messages
            .iter()
            .filter(|m| m.chat_id == chat_id)
            .cloned()
            .collect();
        messages.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(messages)
    }

    fn get_message_by_id(&self, id: Uuid) -> Result<Option<Message>, DBError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .messages
            .iter()
            .find(|m| m.id == id)
            .cloned())
    }

    fn delete_messages_by_chat_id_after_timestamp(
        &self,
        chat_id: Uuid,
        timestamp: DateTime<Utc>,
    ) -> Result<usize, DBError> {
        self.transaction(|state| {
            let doomed: HashSet<Uuid> = state
                .messages
                .iter()
                .filter(|m| m.chat_id == chat_id && m.created_at >= timestamp)
                .map(|m| m.id)
                .collect();
            state.votes.retain(|v| !doomed.contains(&v.message_id));
            state.messages.retain(|m| !doomed.contains(&m.id));
            Ok(doomed.len())
        })
    }

    fn complete_turn(&self, completion: TurnCompletion) -> Result<TurnReceipt, DBError> {
        let fail = std::mem::replace(&mut *self.fail_complete_turn.lock().unwrap(), false);
        self.transaction(|state| {
            let receipt = ledger::complete_turn(state, &completion)?;
            if fail {
                return Err(DBError::ConnectionError);
            }
            Ok(receipt)
        })
    }

    fn vote_message(&self, vote: Vote) -> Result<(), DBError> {
        let mut state = self.state.lock().unwrap();
        state
            .votes
            .retain(|v| !(v.chat_id == vote.chat_id && v.message_id == vote.message_id));
        state.votes.push(vote);
        Ok(())
    }

    fn get_votes_by_chat_id(&self, chat_id: Uuid) -> Result<Vec<Vote>, DBError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .votes
            .iter()
            .filter(|v| v.chat_id == chat_id)
            .cloned()
            .collect())
    }

    fn save_document(&self, document: NewDocument) -> Result<Document, DBError> {
        let doc = Document {
            id: document.id,
            created_at: document.created_at,
            title: document.title,
            content: document.content,
            kind: document.kind,
            user_id: document.user_id,
        };
        self.state.lock().unwrap().documents.push(doc.clone());
        Ok(doc)
    }

    fn get_documents_by_id(&self, id: Uuid) -> Result<Vec<Document>, DBError> {
        let mut docs: Vec<Document> = self
            .state
            .lock()
            .unwrap()
            .documents
            .iter()
            .filter(|d| d.id == id)
            .cloned()
            .collect();
        docs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(docs)
    }

    fn get_document_by_id(&self, id: Uuid) -> Result<Option<Document>, DBError> {
        Ok(self.get_documents_by_id(id)?.pop())
    }

    fn delete_documents_by_id_after_timestamp(
        &self,
        id: Uuid,
        timestamp: DateTime<Utc>,
    ) -> Result<usize, DBError> {
        self.transaction(|state| {
            state
                .suggestions
                .retain(|s| !(s.document_id == id && s.document_created_at > timestamp));
            let before = state.documents.len();
            state
                .documents
                .retain(|d| !(d.id == id && d.created_at > timestamp));
            Ok(before - state.documents.len())
        })
    }

    fn save_suggestions(&self, suggestions: Vec<NewSuggestion>) -> Result<(), DBError> {
        let now = Utc::now();
        self.state
            .lock()
            .unwrap()
            .suggestions
            .extend(suggestions.into_iter().map(|s| Suggestion {
                id: s.id,
                document_id: s.document_id,
                document_created_at: s.document_created_at,
                original_text: s.original_text,
                suggested_text: s.suggested_text,
                description: s.description,
                is_resolved: s.is_resolved,
                user_id: s.user_id,
                created_at: now,
            }));
        Ok(())
    }

    fn get_suggestions_by_document_id(
        &self,
        document_id: Uuid,
    ) -> Result<Vec<Suggestion>, DBError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .suggestions
            .iter()
            .filter(|s| s.document_id == document_id)
            .cloned()
            .collect())
    }

    fn redeem_referral(&self, user_id: Uuid, code: &str) -> Result<BigDecimal, DBError> {
        self.transaction(|state| ledger::redeem_referral(state, user_id, code))
    }

    fn redeem_coupon(
        &self,
        user_id: Uuid,
        code: &str,
        now: DateTime<Utc>,
    ) -> Result<BigDecimal, DBError> {
        self.transaction(|state| ledger::redeem_coupon(state, user_id, code, now))
    }

    fn get_bkash_auth_token(&self, user_id: Uuid) -> Result<Option<BkashAuthToken>, DBError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .bkash_tokens
            .get(&user_id)
            .cloned())
    }

    fn upsert_bkash_auth_token(&self, token: BkashAuthToken) -> Result<(), DBError> {
        self.state
            .lock()
            .unwrap()
            .bkash_tokens
            .insert(token.user_id, token);
        Ok(())
    }

    fn create_bkash_payment(&self, payment: NewBkashPayment) -> Result<BkashPayment, DBError> {
        let now = Utc::now();
        let row = BkashPayment {
            payment_id: payment.payment_id,
            user_id: payment.user_id,
            trx_id: None,
            status: payment.status,
            mobile_number: None,
            amount_bdt: payment.amount_bdt,
            credited_cents: None,
            created_at: now,
            updated_at: now,
        };
        self.state
            .lock()
            .unwrap()
            .bkash_payments
            .insert(row.payment_id.clone(), row.clone());
        Ok(row)
    }

    fn get_bkash_payment(&self, payment_id: &str) -> Result<Option<BkashPayment>, DBError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .bkash_payments
            .get(payment_id)
            .cloned())
    }

    fn settle_bkash_payment(
        &self,
        payment_id: &str,
        outcome: PaymentOutcome,
    ) -> Result<Settlement, DBError> {
        self.transaction(|state| ledger::settle_bkash_payment(state, payment_id, &outcome))
    }

    fn log_ip(&self, entry: NewIpHistory) -> Result<(), DBError> {
        self.transaction(|state| {
            let user = Self::user_mut(state, entry.user_id)?;
            user.last_ip = Some(entry.ip_address.clone());
            state.ip_history.push(entry);
            Ok(())
        })
    }

    fn log_user_interest(&self, entry: NewUserInterestLog) -> Result<(), DBError> {
        self.state.lock().unwrap().interests.push(entry);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::messages::{ContentPart, Role};
    use chrono::Duration;
    use std::str::FromStr;

    fn cents(s: &str) -> BigDecimal {
        BigDecimal::from_str(s).unwrap()
    }

    fn chat_for(db: &InMemoryDb, user: &User) -> Chat {
        db.create_chat(NewChat::new(
            Uuid::new_v4(),
            user.id,
            "Weather in Dhaka".to_string(),
            Visibility::Private,
        ))
        .unwrap()
    }

    #[test]
    fn test_soft_delete_keeps_row_and_hides_chat() {
        let db = InMemoryDb::new();
        let user = db.insert_user("a@example.com", cents("10"));
        let kept = chat_for(&db, &user);
        let deleted = chat_for(&db, &user);

        db.soft_delete_chat(deleted.id, user.id).unwrap();

        let row = db.get_chat_by_id(deleted.id).unwrap().unwrap();
        assert!(row.is_deleted);
        let listed = db.get_not_deleted_chats_by_user_id(user.id).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, kept.id);
    }

    #[test]
    fn test_soft_delete_rejects_foreign_owner() {
        let db = InMemoryDb::new();
        let owner = db.insert_user("owner@example.com", cents("10"));
        let other = db.insert_user("other@example.com", cents("10"));
        let chat = chat_for(&db, &owner);

        assert!(matches!(
            db.soft_delete_chat(chat.id, other.id),
            Err(DBError::ChatError(ChatError::NotFound))
        ));
        assert!(!db.get_chat_by_id(chat.id).unwrap().unwrap().is_deleted);
    }

    #[test]
    fn test_coupon_redeems_once_per_user() {
        let db = InMemoryDb::new();
        let user = db.insert_user("a@example.com", cents("0"));
        db.insert_coupon(Coupon {
            code: "EID50".to_string(),
            amount_cents: cents("50"),
            max_uses: 100,
            times_used: 0,
            is_active: true,
            expires_at: None,
            created_at: Utc::now(),
        });

        let balance = db.redeem_coupon(user.id, "EID50", Utc::now()).unwrap();
        assert_eq!(balance, cents("50"));

        let second = db.redeem_coupon(user.id, "EID50", Utc::now());
        assert!(matches!(
            second,
            Err(DBError::CouponError(CouponError::AlreadyRedeemed))
        ));
        assert_eq!(db.get_balance(user.id).unwrap(), cents("50"));
        assert_eq!(db.snapshot().coupons["EID50"].times_used, 1);
    }

    #[test]
    fn test_coupon_usage_cap_rolls_back_redemption() {
        let db = InMemoryDb::new();
        let first = db.insert_user("a@example.com", cents("0"));
        let second = db.insert_user("b@example.com", cents("0"));
        db.insert_coupon(Coupon {
            code: "ONE".to_string(),
            amount_cents: cents("5"),
            max_uses: 1,
            times_used: 0,
            is_active: true,
            expires_at: Some(Utc::now() + Duration::days(1)),
            created_at: Utc::now(),
        });

        db.redeem_coupon(first.id, "ONE", Utc::now()).unwrap();
        assert!(matches!(
            db.redeem_coupon(second.id, "ONE", Utc::now()),
            Err(DBError::CouponError(CouponError::LimitReached))
        ));
        assert!(!db
            .snapshot()
            .redemptions
            .contains(&(second.id, "ONE".to_string())));
        assert_eq!(db.get_balance(second.id).unwrap(), cents("0"));
    }

    #[test]
    fn test_referral_cap_is_never_exceeded() {
        let db = InMemoryDb::new();
        let owner = db.insert_user("owner@example.com", cents("0"));
        db.insert_referral("FRIENDS", Some(owner.id), cents("25"), 3);

        for i in 0..3 {
            let user = db.insert_user(&format!("u{}@example.com", i), cents("0"));
            assert_eq!(db.redeem_referral(user.id, "FRIENDS").unwrap(), cents("25"));
        }
        let late = db.insert_user("late@example.com", cents("0"));
        assert!(matches!(
            db.redeem_referral(late.id, "FRIENDS"),
            Err(DBError::ReferralError(ReferralError::LimitReached))
        ));

        let state = db.snapshot();
        assert_eq!(state.referrals["FRIENDS"].times_used, 3);
        assert_eq!(state.users[&late.id].referral_code_used, None);
        assert_eq!(state.users[&late.id].api_balance_cents, cents("0"));
    }

    #[test]
    fn test_referral_rejects_own_code_and_second_referral() {
        let db = InMemoryDb::new();
        let owner = db.insert_user("owner@example.com", cents("0"));
        db.insert_referral("MINE", Some(owner.id), cents("10"), 10);
        db.insert_referral("OTHER", None, cents("10"), 10);

        assert!(matches!(
            db.redeem_referral(owner.id, "MINE"),
            Err(DBError::ReferralError(ReferralError::OwnCode))
        ));
        db.redeem_referral(owner.id, "OTHER").unwrap();
        let user = db.insert_user("u@example.com", cents("0"));
        db.redeem_referral(user.id, "MINE").unwrap();
        assert!(matches!(
            db.redeem_referral(user.id, "OTHER"),
            Err(DBError::ReferralError(ReferralError::AlreadyUsedReferral))
        ));
    }

    #[test]
    fn test_complete_turn_is_all_or_nothing() {
        let db = InMemoryDb::new();
        let user = db.insert_user("a@example.com", cents("100"));
        let chat = chat_for(&db, &user);
        let message = NewMessage::unbilled(
            Uuid::new_v4(),
            chat.id,
            Role::Assistant,
            &[ContentPart::text("hello")],
            Some("GPT-4o".to_string()),
            Utc::now(),
        )
        .unwrap();

        db.fail_next_complete_turn();
        let failed = db.complete_turn(TurnCompletion {
            user_id: user.id,
            chat_id: chat.id,
            messages: vec![message.clone()],
            cost: cents("0.525"),
            reserved: cents("0"),
        });
        assert!(failed.is_err());
        let state = db.snapshot();
        assert!(state.messages.is_empty());
        assert_eq!(state.users[&user.id].api_balance_cents, cents("100"));
        assert_eq!(state.users[&user.id].message_count, 0);

        let receipt = db
            .complete_turn(TurnCompletion {
                user_id: user.id,
                chat_id: chat.id,
                messages: vec![message],
                cost: cents("0.525"),
                reserved: cents("0"),
            })
            .unwrap();
        assert_eq!(receipt.balance_cents, cents("99.475"));
        assert_eq!(receipt.chat_total_cost, cents("0.525"));
        assert_eq!(db.snapshot().users[&user.id].message_count, 1);
    }

    #[test]
    fn test_settle_bkash_payment_credits_once() {
        let db = InMemoryDb::new();
        let user = db.insert_user("a@example.com", cents("0"));
        db.create_bkash_payment(NewBkashPayment::initiated(
            "TR0011".to_string(),
            user.id,
            cents("500"),
        ))
        .unwrap();

        let outcome = PaymentOutcome {
            status: PaymentStatus::Successful,
            trx_id: Some("BFK90XYZ".to_string()),
            mobile_number: Some("01770618575".to_string()),
            credited_cents: Some(cents("409.83")),
        };
        assert_eq!(
            db.settle_bkash_payment("TR0011", outcome.clone()).unwrap(),
            Settlement::Credited {
                balance_cents: cents("409.83")
            }
        );
        assert_eq!(
            db.settle_bkash_payment("TR0011", outcome).unwrap(),
            Settlement::AlreadySettled
        );
        assert_eq!(db.get_balance(user.id).unwrap(), cents("409.83"));
    }

    #[test]
    fn test_trailing_delete_removes_votes() {
        let db = InMemoryDb::new();
        let user = db.insert_user("a@example.com", cents("1"));
        let chat = chat_for(&db, &user);
        let t0 = Utc::now();
        let make = |offset: i64| {
            NewMessage::unbilled(
                Uuid::new_v4(),
                chat.id,
                Role::User,
                &[ContentPart::text("msg")],
                None,
                t0 + Duration::seconds(offset),
            )
            .unwrap()
        };
        let saved = db.save_messages(vec![make(0), make(1), make(2)]).unwrap();
        db.vote_message(Vote {
            chat_id: chat.id,
            message_id: saved[2].id,
            is_upvoted: true,
        })
        .unwrap();

        let removed = db
            .delete_messages_by_chat_id_after_timestamp(chat.id, saved[1].created_at)
            .unwrap();
        assert_eq!(removed, 2);
        assert_eq!(db.get_messages_by_chat_id(chat.id).unwrap().len(), 1);
        assert!(db.get_votes_by_chat_id(chat.id).unwrap().is_empty());
    }
}
