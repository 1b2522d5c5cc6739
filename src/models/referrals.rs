use crate::models::schema::{coupon_redemptions, coupons, referrals};
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum ReferralError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] diesel::result::Error),
    #[error("Invalid referral code")]
    UnknownCode,
    #[error("You cannot use your own referral code")]
    OwnCode,
    #[error("You have already used a referral code")]
    AlreadyUsedReferral,
    #[error("Referral code usage limit reached")]
    LimitReached,
}

#[derive(Error, Debug)]
pub enum CouponError {
    #[error("Database error: {0}")]
    DatabaseError(diesel::result::Error),
    #[error("Invalid coupon code")]
    UnknownCode,
    #[error("Coupon is no longer active")]
    Inactive,
    #[error("Coupon has expired")]
    Expired,
    #[error("Coupon already redeemed")]
    AlreadyRedeemed,
    #[error("Coupon usage limit reached")]
    LimitReached,
}

impl From<DieselError> for CouponError {
    fn from(err: DieselError) -> Self {
        match err {
            DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, _) => {
                CouponError::AlreadyRedeemed
            }
            other => CouponError::DatabaseError(other),
        }
    }
}

#[derive(Queryable, Identifiable, Serialize, Deserialize, Clone, Debug)]
#[diesel(table_name = referrals)]
#[diesel(primary_key(code))]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct Referral {
    pub code: String,
    pub owner_user_id: Option<Uuid>,
    pub bonus_cents: BigDecimal,
    pub max_limit: i32,
    pub times_used: i32,
    pub created_at: DateTime<Utc>,
}

impl Referral {
    pub fn is_owned_by(&self, user_id: Uuid) -> bool {
        self.owner_user_id == Some(user_id)
    }

    pub fn get_by_code(conn: &mut PgConnection, code: &str) -> Result<Referral, ReferralError> {
        referrals::table
            .filter(referrals::code.eq(code))
            .first::<Referral>(conn)
            .map_err(|e| match e {
                DieselError::NotFound => ReferralError::UnknownCode,
                _ => ReferralError::DatabaseError(e),
            })
    }

    /// Bumps `times_used` only while it is below the cap. Returns false once the cap is hit.
    pub fn try_increment_usage(conn: &mut PgConnection, code: &str) -> Result<bool, ReferralError> {
        let rows = diesel::update(
            referrals::table
                .filter(referrals::code.eq(code))
                .filter(referrals::times_used.lt(referrals::max_limit)),
        )
        .set(referrals::times_used.eq(referrals::times_used + 1))
        .execute(conn)?;
        Ok(rows == 1)
    }
}

#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = referrals)]
pub struct NewReferral {
    pub code: String,
    pub owner_user_id: Option<Uuid>,
    pub bonus_cents: BigDecimal,
    pub max_limit: i32,
}

impl NewReferral {
    pub fn insert(&self, conn: &mut PgConnection) -> Result<Referral, ReferralError> {
        diesel::insert_into(referrals::table)
            .values(self)
            .get_result::<Referral>(conn)
            .map_err(ReferralError::DatabaseError)
    }
}

#[derive(Queryable, Identifiable, Serialize, Deserialize, Clone, Debug)]
#[diesel(table_name = coupons)]
#[diesel(primary_key(code))]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct Coupon {
    pub code: String,
    pub amount_cents: BigDecimal,
    pub max_uses: i32,
    pub times_used: i32,
    pub is_active: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Coupon {
    /// Checks the flags that do not depend on concurrent usage.
    pub fn ensure_redeemable(&self, now: DateTime<Utc>) -> Result<(), CouponError> {
        if !self.is_active {
            return Err(CouponError::Inactive);
        }
        match self.expires_at {
            Some(expires_at) if expires_at <= now => Err(CouponError::Expired),
            _ => Ok(()),
        }
    }

    pub fn get_by_code(conn: &mut PgConnection, code: &str) -> Result<Coupon, CouponError> {
        coupons::table
            .filter(coupons::code.eq(code))
            .first::<Coupon>(conn)
            .map_err(|e| match e {
                DieselError::NotFound => CouponError::UnknownCode,
                _ => CouponError::DatabaseError(e),
            })
    }

    pub fn try_increment_usage(conn: &mut PgConnection, code: &str) -> Result<bool, CouponError> {
        let rows = diesel::update(
            coupons::table
                .filter(coupons::code.eq(code))
                .filter(coupons::times_used.lt(coupons::max_uses)),
        )
        .set(coupons::times_used.eq(coupons::times_used + 1))
        .execute(conn)
        .map_err(CouponError::DatabaseError)?;
        Ok(rows == 1)
    }
}

#[derive(Queryable, Insertable, Serialize, Deserialize, Clone, Debug)]
#[diesel(table_name = coupon_redemptions)]
pub struct CouponRedemption {
    pub user_id: Uuid,
    pub code: String,
    pub redeemed_at: DateTime<Utc>,
}

impl CouponRedemption {
    /// Fails with `AlreadyRedeemed` when the `(user_id, code)` key already exists.
    pub fn insert(&self, conn: &mut PgConnection) -> Result<(), CouponError> {
        diesel::insert_into(coupon_redemptions::table)
            .values(self)
            .execute(conn)
            .map(|_| ())
            .map_err(CouponError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn coupon(is_active: bool, expires_at: Option<DateTime<Utc>>) -> Coupon {
        Coupon {
            code: "WELCOME".to_string(),
            amount_cents: BigDecimal::from(50),
            max_uses: 10,
            times_used: 0,
            is_active,
            expires_at,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_duplicate_redemption_maps_to_already_redeemed() {
        let err = DieselError::DatabaseError(
            DatabaseErrorKind::UniqueViolation,
            Box::new(String::from("duplicate key value violates unique constraint")),
        );
        assert!(matches!(CouponError::from(err), CouponError::AlreadyRedeemed));
    }

    #[test]
    fn test_coupon_redeemable_checks() {
        let now = Utc::now();
        assert!(coupon(true, None).ensure_redeemable(now).is_ok());
        assert!(coupon(true, Some(now + Duration::days(1)))
            .ensure_redeemable(now)
            .is_ok());
        assert!(matches!(
            coupon(false, None).ensure_redeemable(now),
            Err(CouponError::Inactive)
        ));
        assert!(matches!(
            coupon(true, Some(now - Duration::seconds(1))).ensure_redeemable(now),
            Err(CouponError::Expired)
        ));
    }

    #[test]
    fn test_unique_violation_maps_to_already_redeemed() {
        struct Info;
        impl diesel::result::DatabaseErrorInformation for Info {
            fn message(&self) -> &str {
                "duplicate key value violates unique constraint"
            }
            fn details(&self) -> Option<&str> {
                None
            }
            fn hint(&self) -> Option<&str> {
                None
            }
            fn table_name(&self) -> Option<&str> {
                Some("coupon_redemptions")
            }
            fn column_name(&self) -> Option<&str> {
                None
            }
            fn constraint_name(&self) -> Option<&str> {
                None
            }
            fn statement_position(&self) -> Option<i32> {
                None
            }
        }

        let err = DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, Box::new(Info));
        assert!(matches!(CouponError::from(err), CouponError::AlreadyRedeemed));
        assert!(matches!(
            CouponError::from(DieselError::RollbackTransaction),
            CouponError::DatabaseError(_)
        ));
    }
}
