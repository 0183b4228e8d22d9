//! Claiming and redeeming first-party coupons.
//!
//! Per (user, coupon) pair a claim moves `Obtained → Used`, or lazily
//! `Obtained → Expired` when read after the coupon closed. Checks run in a
//! fixed order and the first failure wins:
//!
//! 1. the coupon exists
//! 2. it is still open
//! 3. the user holds no claim on it yet
//! 4. the user stands within the acquisition radius of its store
//!
//! Check 3 is advisory. The storage layer's unique index on
//! `(user_id, coupon_id)` is what actually guarantees a single claim when
//! two requests race past it.

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::aggregation::validate_location;
use crate::config::EngineConfig;
use crate::discount::{ScheduleMatch, live_rate};
use crate::error::{EngineError, EngineResult};
use crate::geo::{self, Coordinates};
use crate::model::{ClaimStatus, ClaimView, CouponWithStore, OfferSource, UserCouponClaim};
use crate::storage::Storage;

/// A committed claim and the shop it is redeemable at.
#[derive(Debug, Clone)]
pub struct ClaimReceipt {
    pub claim: UserCouponClaim,
    pub shop_name: String,
}

pub struct AcquisitionGate {
    storage: Storage,
    radius_m: f64,
    schedule_match: ScheduleMatch,
}

impl AcquisitionGate {
    pub fn new(storage: Storage, engine: &EngineConfig) -> Self {
        Self {
            storage,
            radius_m: engine.acquisition_radius_m,
            schedule_match: engine.schedule_match,
        }
    }

    /// Claim a coupon for `user_id` standing at `user_location`.
    ///
    /// `coupon_ref` may be the raw coupon id or the `internal_` record id
    /// returned by discover. The live rate at this instant is snapshotted
    /// into `discount_at_obtain`.
    pub async fn claim(
        &self,
        user_id: &str,
        coupon_ref: &str,
        user_location: Coordinates,
        now: DateTime<Utc>,
    ) -> EngineResult<ClaimReceipt> {
        validate_location(user_location, "user_location")?;
        let coupon_id = coupon_id_from_ref(coupon_ref)?;

        let CouponWithStore { coupon, store } = self
            .storage
            .coupon_with_store(coupon_id)
            .await?
            .ok_or_else(|| EngineError::NotFound("coupon".to_string()))?;

        if !coupon.is_open(now) {
            return Err(EngineError::Expired);
        }

        if self.storage.find_claim(user_id, coupon_id).await?.is_some() {
            return Err(EngineError::AlreadyObtained);
        }

        let distance_m = geo::distance(user_location, store.location);
        if distance_m > self.radius_m {
            debug!(coupon_id, distance_m, radius_m = self.radius_m, "Claim rejected: too far");
            return Err(EngineError::TooFar {
                distance_m,
                radius_m: self.radius_m,
            });
        }

        let claim = UserCouponClaim {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            coupon_id: coupon.id.clone(),
            obtained_at: now,
            discount_at_obtain: live_rate(&coupon, now, self.schedule_match),
            status: ClaimStatus::Obtained,
            used_at: None,
        };

        self.storage.insert_claim(&claim).await?;

        info!(
            claim_id = %claim.id,
            coupon_id = %claim.coupon_id,
            discount = claim.discount_at_obtain,
            distance_m,
            "Coupon claimed"
        );

        Ok(ClaimReceipt {
            claim,
            shop_name: store.name,
        })
    }

    /// Redeem the user's claim on a coupon.
    ///
    /// A claim whose coupon has closed is flipped to `expired` first and the
    /// redemption is rejected.
    pub async fn redeem(
        &self,
        user_id: &str,
        coupon_ref: &str,
        now: DateTime<Utc>,
    ) -> EngineResult<UserCouponClaim> {
        let coupon_id = coupon_id_from_ref(coupon_ref)?;

        let claim = self
            .storage
            .find_claim(user_id, coupon_id)
            .await?
            .ok_or_else(|| EngineError::NotFound("claim".to_string()))?;

        match claim.status {
            ClaimStatus::Used => return Err(EngineError::AlreadyUsed),
            ClaimStatus::Expired => return Err(EngineError::Expired),
            ClaimStatus::Obtained => {}
        }

        let coupon = self
            .storage
            .coupon_with_store(coupon_id)
            .await?
            .ok_or_else(|| EngineError::NotFound("coupon".to_string()))?
            .coupon;

        if !coupon.is_open(now) {
            self.storage.expire_claim(&claim.id).await?;
            info!(claim_id = %claim.id, coupon_id, "Claim expired on redemption");
            return Err(EngineError::Expired);
        }

        if !self.storage.mark_claim_used(&claim.id, now).await? {
            // A concurrent request moved the claim out of `obtained`.
            warn!(claim_id = %claim.id, "Claim changed state during redemption");
            return Err(EngineError::AlreadyUsed);
        }

        info!(claim_id = %claim.id, coupon_id, "Coupon redeemed");

        Ok(UserCouponClaim {
            status: ClaimStatus::Used,
            used_at: Some(now),
            ..claim
        })
    }

    /// The user's claims, newest first, with lazy expiry applied and persisted.
    pub async fn user_claims(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> EngineResult<Vec<ClaimView>> {
        let rows = self.storage.claims_for_user(user_id).await?;
        let mut views = Vec::with_capacity(rows.len());

        for (mut claim, CouponWithStore { coupon, store }) in rows {
            if claim.status == ClaimStatus::Obtained && !coupon.is_open(now) {
                if self.storage.expire_claim(&claim.id).await? {
                    debug!(claim_id = %claim.id, "Lazily expired claim");
                }
                claim.status = ClaimStatus::Expired;
            }

            views.push(ClaimView {
                id: claim.id,
                coupon_id: claim.coupon_id,
                shop_name: store.name,
                title: coupon.title,
                description: coupon.description,
                discount: claim.discount_at_obtain,
                status: claim.status,
                obtained_at: claim.obtained_at,
                used_at: claim.used_at,
                expires_at: coupon.end_time,
            });
        }

        Ok(views)
    }
}

/// Accept either a raw coupon id or an `internal_`-prefixed record id.
fn coupon_id_from_ref(coupon_ref: &str) -> EngineResult<&str> {
    let trimmed = coupon_ref.trim();
    let id = trimmed
        .strip_prefix(OfferSource::Internal.id_prefix())
        .and_then(|rest| rest.strip_prefix('_'))
        .unwrap_or(trimmed);

    if id.is_empty() {
        return Err(EngineError::Validation("coupon_id must not be empty".to_string()));
    }
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::tests::{coupon, memory_storage, store};

    const STORE_AT: Coordinates = Coordinates {
        lat: 35.6812,
        lng: 139.7671,
    };

    async fn gate_with_coupon(minutes_left: i64) -> (AcquisitionGate, Storage, DateTime<Utc>) {
        let storage = memory_storage().await;
        let now = Utc::now();
        storage
            .insert_store(&store("s1", STORE_AT.lat, STORE_AT.lng))
            .await
            .unwrap();
        storage
            .insert_coupon(&coupon("c1", "s1", now, minutes_left))
            .await
            .unwrap();

        let gate = AcquisitionGate::new(storage.clone(), &EngineConfig::default());
        (gate, storage, now)
    }

    #[tokio::test]
    async fn test_claim_snapshots_live_rate() {
        let (gate, storage, now) = gate_with_coupon(5).await;

        let receipt = gate.claim("alice", "c1", STORE_AT, now).await.unwrap();
        assert_eq!(receipt.shop_name, "Store s1");
        assert_eq!(receipt.claim.discount_at_obtain, 40);
        assert_eq!(receipt.claim.status, ClaimStatus::Obtained);

        let stored = storage.find_claim("alice", "c1").await.unwrap().unwrap();
        assert_eq!(stored.id, receipt.claim.id);
        assert_eq!(stored.discount_at_obtain, 40);
    }

    #[tokio::test]
    async fn test_claim_accepts_record_id() {
        let (gate, _, now) = gate_with_coupon(90).await;
        let receipt = gate.claim("alice", "internal_c1", STORE_AT, now).await.unwrap();
        assert_eq!(receipt.claim.coupon_id, "c1");
        assert_eq!(receipt.claim.discount_at_obtain, 10);
    }

    #[tokio::test]
    async fn test_unknown_coupon_is_not_found() {
        let (gate, _, now) = gate_with_coupon(90).await;
        let err = gate.claim("alice", "nope", STORE_AT, now).await.unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_closed_coupon_is_expired() {
        let (gate, _, now) = gate_with_coupon(-5).await;
        let err = gate.claim("alice", "c1", STORE_AT, now).await.unwrap_err();
        assert!(matches!(err, EngineError::Expired));
    }

    #[tokio::test]
    async fn test_proximity_boundary() {
        let (gate, _, now) = gate_with_coupon(90).await;

        let outside = geo::offset(STORE_AT, 45.0, 21.0);
        let err = gate.claim("alice", "c1", outside, now).await.unwrap_err();
        match err {
            EngineError::TooFar {
                distance_m,
                radius_m,
            } => {
                assert!((distance_m - 21.0).abs() < 0.01);
                assert_eq!(radius_m, 20.0);
            }
            other => panic!("expected TooFar, got {other:?}"),
        }

        let inside = geo::offset(STORE_AT, 45.0, 19.0);
        assert!(gate.claim("alice", "c1", inside, now).await.is_ok());
    }

    #[tokio::test]
    async fn test_prior_claim_is_checked_before_distance() {
        let (gate, _, now) = gate_with_coupon(90).await;
        gate.claim("alice", "c1", STORE_AT, now).await.unwrap();

        let far_away = geo::offset(STORE_AT, 0.0, 5_000.0);
        let err = gate.claim("alice", "c1", far_away, now).await.unwrap_err();
        assert!(matches!(err, EngineError::AlreadyObtained));
    }

    #[tokio::test]
    async fn test_concurrent_claims_commit_once() {
        let (gate, storage, now) = gate_with_coupon(90).await;

        let (first, second) = tokio::join!(
            gate.claim("alice", "c1", STORE_AT, now),
            gate.claim("alice", "c1", STORE_AT, now)
        );

        let outcomes = [first, second];
        let ok = outcomes.iter().filter(|r| r.is_ok()).count();
        let duplicates = outcomes
            .iter()
            .filter(|r| matches!(r, Err(EngineError::AlreadyObtained)))
            .count();
        assert_eq!(ok, 1);
        assert_eq!(duplicates, 1);
        assert_eq!(storage.count_user_claims("alice").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_different_users_claim_independently() {
        let (gate, _, now) = gate_with_coupon(90).await;
        assert!(gate.claim("alice", "c1", STORE_AT, now).await.is_ok());
        assert!(gate.claim("bob", "c1", STORE_AT, now).await.is_ok());
    }

    #[tokio::test]
    async fn test_redeem_transitions() {
        let (gate, storage, now) = gate_with_coupon(90).await;

        let err = gate.redeem("alice", "c1", now).await.unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));

        gate.claim("alice", "c1", STORE_AT, now).await.unwrap();
        let used = gate.redeem("alice", "internal_c1", now).await.unwrap();
        assert_eq!(used.status, ClaimStatus::Used);
        assert_eq!(used.used_at, Some(now));

        let stored = storage.find_claim("alice", "c1").await.unwrap().unwrap();
        assert_eq!(stored.status, ClaimStatus::Used);
        assert!(stored.used_at.is_some());

        let err = gate.redeem("alice", "c1", now).await.unwrap_err();
        assert!(matches!(err, EngineError::AlreadyUsed));
    }

    #[tokio::test]
    async fn test_redeem_after_close_expires_claim() {
        let (gate, storage, now) = gate_with_coupon(30).await;
        gate.claim("alice", "c1", STORE_AT, now).await.unwrap();

        let later = now + chrono::Duration::hours(1);
        let err = gate.redeem("alice", "c1", later).await.unwrap_err();
        assert!(matches!(err, EngineError::Expired));

        let stored = storage.find_claim("alice", "c1").await.unwrap().unwrap();
        assert_eq!(stored.status, ClaimStatus::Expired);

        let err = gate.redeem("alice", "c1", later).await.unwrap_err();
        assert!(matches!(err, EngineError::Expired));
    }

    #[tokio::test]
    async fn test_user_claims_apply_lazy_expiry() {
        let (gate, storage, now) = gate_with_coupon(30).await;
        storage
            .insert_coupon(&coupon("c2", "s1", now, 600))
            .await
            .unwrap();

        gate.claim("alice", "c1", STORE_AT, now).await.unwrap();
        let later = now + chrono::Duration::hours(1);
        gate.claim("alice", "c2", STORE_AT, later).await.unwrap();

        let views = gate.user_claims("alice", later).await.unwrap();
        assert_eq!(views.len(), 2);
        // newest first
        assert_eq!(views[0].coupon_id, "c2");
        assert_eq!(views[0].status, ClaimStatus::Obtained);
        assert_eq!(views[1].coupon_id, "c1");
        assert_eq!(views[1].status, ClaimStatus::Expired);
        assert_eq!(views[1].shop_name, "Store s1");

        let stored = storage.find_claim("alice", "c1").await.unwrap().unwrap();
        assert_eq!(stored.status, ClaimStatus::Expired);
    }

    #[test]
    fn test_coupon_ref_parsing() {
        assert_eq!(coupon_id_from_ref("abc").unwrap(), "abc");
        assert_eq!(coupon_id_from_ref("internal_abc").unwrap(), "abc");
        assert_eq!(coupon_id_from_ref(" internal_abc ").unwrap(), "abc");
        assert_eq!(coupon_id_from_ref("internalabc").unwrap(), "internalabc");
        assert!(coupon_id_from_ref("internal_").is_err());
        assert!(coupon_id_from_ref("  ").is_err());
    }
}
