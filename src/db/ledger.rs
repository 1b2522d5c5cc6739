//! Balance-moving operations shared by every `DBConnection` backend.
//!
//! Each function runs inside the caller's transaction and only talks to the
//! store through `LedgerTx`, so the order of checks and conditional updates is
//! the same for Postgres and the in-memory store.

use super::{DBError, Settlement, TurnCompletion, TurnReceipt};
use crate::models::bkash::{BkashPayment, BkashRecordError, PaymentOutcome, PaymentStatus};
use crate::models::messages::NewMessage;
use crate::models::referrals::{Coupon, CouponError, CouponRedemption, Referral, ReferralError};
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use tracing::{debug, warn};
use uuid::Uuid;

/// Row-level primitives of one open transaction.
pub trait LedgerTx {
    fn credit(&mut self, user_id: Uuid, amount: &BigDecimal) -> Result<BigDecimal, DBError>;
    /// Subtracts `amount` and counts one message. Returns the new balance.
    fn charge_turn(&mut self, user_id: Uuid, amount: &BigDecimal) -> Result<BigDecimal, DBError>;
    /// Adds `cost` to the chat total. Returns the new total.
    fn add_chat_cost(&mut self, chat_id: Uuid, cost: &BigDecimal) -> Result<BigDecimal, DBError>;
    fn insert_messages(&mut self, messages: &[NewMessage]) -> Result<(), DBError>;

    fn referral(&mut self, code: &str) -> Result<Referral, DBError>;
    /// Sets the user's referral code only if none is set yet.
    fn claim_referral_slot(&mut self, user_id: Uuid, code: &str) -> Result<bool, DBError>;
    /// Increments `times_used` only while it is below `max_limit`.
    fn try_increment_referral(&mut self, code: &str) -> Result<bool, DBError>;

    fn coupon(&mut self, code: &str) -> Result<Coupon, DBError>;
    /// Fails with `CouponError::AlreadyRedeemed` when the pair already exists.
    fn insert_redemption(&mut self, redemption: &CouponRedemption) -> Result<(), DBError>;
    /// Increments `times_used` only while it is below `max_uses`.
    fn try_increment_coupon(&mut self, code: &str) -> Result<bool, DBError>;

    fn bkash_payment(&mut self, payment_id: &str) -> Result<Option<BkashPayment>, DBError>;
    /// Writes `outcome` only if the payment is still `Initiated`.
    fn finalize_bkash_payment(
        &mut self,
        payment_id: &str,
        outcome: &PaymentOutcome,
    ) -> Result<bool, DBError>;
}

pub fn complete_turn<L: LedgerTx + ?Sized>(
    tx: &mut L,
    completion: &TurnCompletion,
) -> Result<TurnReceipt, DBError> {
    if !completion.messages.is_empty() {
        tx.insert_messages(&completion.messages)?;
    }
    let balance_cents = tx.charge_turn(completion.user_id, &completion.outstanding())?;
    let chat_total_cost = tx.add_chat_cost(completion.chat_id, &completion.cost)?;
    Ok(TurnReceipt {
        balance_cents,
        chat_total_cost,
    })
}

pub fn redeem_referral<L: LedgerTx + ?Sized>(
    tx: &mut L,
    user_id: Uuid,
    code: &str,
) -> Result<BigDecimal, DBError> {
    let referral = tx.referral(code)?;
    if referral.is_owned_by(user_id) {
        return Err(ReferralError::OwnCode.into());
    }
    if !tx.claim_referral_slot(user_id, code)? {
        return Err(ReferralError::AlreadyUsedReferral.into());
    }
    if !tx.try_increment_referral(code)? {
        debug!("Referral code {} is at its limit", code);
        return Err(ReferralError::LimitReached.into());
    }
    tx.credit(user_id, &referral.bonus_cents)
}

pub fn redeem_coupon<L: LedgerTx + ?Sized>(
    tx: &mut L,
    user_id: Uuid,
    code: &str,
    now: DateTime<Utc>,
) -> Result<BigDecimal, DBError> {
    let coupon = tx.coupon(code)?;
    coupon.ensure_redeemable(now)?;
    tx.insert_redemption(&CouponRedemption {
        user_id,
        code: coupon.code.clone(),
        redeemed_at: now,
    })?;
    if !tx.try_increment_coupon(code)? {
        return Err(CouponError::LimitReached.into());
    }
    tx.credit(user_id, &coupon.amount_cents)
}

pub fn settle_bkash_payment<L: LedgerTx + ?Sized>(
    tx: &mut L,
    payment_id: &str,
    outcome: &PaymentOutcome,
) -> Result<Settlement, DBError> {
    let payment = tx
        .bkash_payment(payment_id)?
        .ok_or(BkashRecordError::NotFound)?;
    if !tx.finalize_bkash_payment(payment_id, outcome)? {
        return Ok(Settlement::AlreadySettled);
    }
    match (&outcome.status, &outcome.credited_cents) {
        (PaymentStatus::Successful, Some(cents)) => {
            let balance_cents = tx.credit(payment.user_id, cents)?;
            Ok(Settlement::Credited { balance_cents })
        }
        (PaymentStatus::Successful, None) => {
            warn!("bKash payment {} succeeded without a credit amount", payment_id);
            Ok(Settlement::Recorded(PaymentStatus::Successful))
        }
        (status, _) => Ok(Settlement::Recorded(*status)),
    }
}
