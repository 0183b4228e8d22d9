//! Discovery: merging first-party coupons with third-party offers.
//!
//! A discover call runs two independent legs concurrently:
//!
//! 1. First-party: open coupons whose store lies within the radius, each
//!    re-priced through [`crate::discount::live_rate`] (persisting the
//!    cached rate when it moved).
//! 2. External: every [`ProviderAdapter`] at once. Adapters never fail, so
//!    a slow or broken provider only ever shrinks this leg to its fallback.
//!
//! The caller's existing claims are read before either leg starts and are
//! excluded from the merged result, which is then handed to the [`Ranker`].

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use tracing::{debug, info, warn};

use crate::config::{EngineConfig, MAX_SEARCH_RADIUS_M};
use crate::discount::live_rate;
use crate::error::{EngineError, EngineResult};
use crate::geo::{self, Coordinates};
use crate::model::{CouponStats, CouponWithStore, OfferRecord, OfferSource};
use crate::providers::{AreaQuery, ProviderAdapter};
use crate::ranking::Ranker;
use crate::storage::Storage;

/// A validated discover request.
#[derive(Debug, Clone, Copy)]
pub struct DiscoverRequest {
    pub center: Coordinates,
    pub radius_m: f64,
    pub include_external: bool,
}

impl DiscoverRequest {
    /// Validate raw query input. A missing radius takes `default_radius_m`.
    pub fn new(
        center: Coordinates,
        radius_m: Option<f64>,
        include_external: bool,
        default_radius_m: f64,
    ) -> EngineResult<Self> {
        validate_location(center, "location")?;

        let radius_m = radius_m.unwrap_or(default_radius_m);
        if !radius_m.is_finite() || radius_m <= 0.0 || radius_m > MAX_SEARCH_RADIUS_M {
            return Err(EngineError::Validation(format!(
                "radius must be greater than 0 and at most {MAX_SEARCH_RADIUS_M:.0}m"
            )));
        }

        Ok(Self {
            center,
            radius_m,
            include_external,
        })
    }
}

/// Reject non-finite or out-of-range coordinates.
pub fn validate_location(location: Coordinates, field: &str) -> EngineResult<()> {
    if location.is_valid() {
        Ok(())
    } else {
        Err(EngineError::Validation(format!(
            "{field} must have lat in [-90, 90] and lng in [-180, 180]"
        )))
    }
}

pub struct Aggregator {
    storage: Storage,
    providers: Vec<ProviderAdapter>,
    engine: EngineConfig,
    ranker: Ranker,
}

impl Aggregator {
    pub fn new(storage: Storage, providers: Vec<ProviderAdapter>, engine: EngineConfig) -> Self {
        Self {
            ranker: Ranker::new(engine.max_results),
            storage,
            providers,
            engine,
        }
    }

    /// Discover offers around a point.
    ///
    /// Anonymous callers (`user_id = None`) get an empty exclusion set.
    /// Provider trouble never fails the call; only first-party storage
    /// errors do.
    pub async fn discover(
        &self,
        user_id: Option<&str>,
        request: DiscoverRequest,
        now: DateTime<Utc>,
    ) -> EngineResult<Vec<OfferRecord>> {
        // Read before merging so a claim made mid-request cannot reappear.
        let excluded: HashSet<String> = match user_id {
            Some(user_id) => self
                .storage
                .claimed_coupon_ids(user_id)
                .await?
                .iter()
                .map(|coupon_id| OfferSource::Internal.record_id(coupon_id))
                .collect(),
            None => HashSet::new(),
        };

        let query = AreaQuery {
            center: request.center,
            radius_m: request.radius_m,
            now,
        };

        let (first_party, external) = tokio::join!(
            self.first_party_offers(&query),
            self.external_offers(&query, request.include_external)
        );
        let first_party = first_party?;

        let internal_count = first_party.len();
        let external_count = external.len();

        let mut records = first_party;
        records.extend(external);
        records.retain(|record| !excluded.contains(&record.id));

        let ranked = self.ranker.rank(records);

        info!(
            internal = internal_count,
            external = external_count,
            excluded = excluded.len(),
            returned = ranked.len(),
            "Discover complete"
        );

        Ok(ranked)
    }

    async fn first_party_offers(&self, query: &AreaQuery) -> EngineResult<Vec<OfferRecord>> {
        let candidates = self.storage.active_coupons_with_stores(query.now).await?;
        let mut records = Vec::new();

        for CouponWithStore { coupon, store } in candidates {
            let distance = geo::distance(query.center, store.location);
            if distance > query.radius_m {
                continue;
            }

            let rate = live_rate(&coupon, query.now, self.engine.schedule_match);
            if rate != coupon.current_discount {
                match self.storage.update_current_discount(&coupon.id, rate).await {
                    Ok(()) => debug!(
                        coupon_id = %coupon.id,
                        from = coupon.current_discount,
                        to = rate,
                        "Refreshed cached discount"
                    ),
                    // The cache is recomputed on every read; serve the live rate anyway.
                    Err(e) => warn!(
                        coupon_id = %coupon.id,
                        error = %e,
                        "Failed to refresh cached discount"
                    ),
                }
            }

            records.push(OfferRecord {
                id: OfferSource::Internal.record_id(&coupon.id),
                source: OfferSource::Internal,
                title: coupon.title.clone(),
                shop_name: store.name.clone(),
                current_discount: rate,
                location: store.location,
                expires_at: coupon.end_time,
                time_remaining_minutes: coupon.minutes_remaining(query.now),
                distance_meters: distance,
                description: coupon.description.clone(),
                external_url: None,
                category: None,
            });
        }

        Ok(records)
    }

    async fn external_offers(&self, query: &AreaQuery, enabled: bool) -> Vec<OfferRecord> {
        if !enabled || self.providers.is_empty() {
            return Vec::new();
        }

        join_all(self.providers.iter().map(|p| p.fetch_offers(query)))
            .await
            .into_iter()
            .flatten()
            .collect()
    }

    /// Counters for the stats endpoint.
    ///
    /// `total_active` counts every open coupon; `near_user` only those whose
    /// active store is within the configured stats radius of `center`.
    pub async fn stats(
        &self,
        user_id: &str,
        center: Coordinates,
        now: DateTime<Utc>,
    ) -> EngineResult<CouponStats> {
        validate_location(center, "location")?;

        let total_active = self.storage.count_active_coupons(now).await?;
        let near_user = self
            .storage
            .active_coupons_with_stores(now)
            .await?
            .iter()
            .filter(|c| geo::distance(center, c.store.location) <= self.engine.stats_radius_m)
            .count() as i64;
        let user_obtained = self.storage.count_user_claims(user_id).await?;

        Ok(CouponStats {
            total_active,
            near_user,
            user_obtained,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ClaimStatus, UserCouponClaim};
    use crate::providers::{HotPepperProvider, ProviderHttp};
    use crate::storage::tests::{coupon, memory_storage, store};
    use std::time::Duration;

    const CENTER: Coordinates = Coordinates {
        lat: 35.6812,
        lng: 139.7671,
    };

    fn request(radius_m: f64, include_external: bool) -> DiscoverRequest {
        DiscoverRequest::new(CENTER, Some(radius_m), include_external, 1_000.0).unwrap()
    }

    async fn seeded() -> (Storage, DateTime<Utc>) {
        let storage = memory_storage().await;
        let now = Utc::now();

        let near = geo::offset(CENTER, 0.0, 100.0);
        let far = geo::offset(CENTER, 0.0, 5_000.0);
        storage
            .insert_store(&store("near", near.lat, near.lng))
            .await
            .unwrap();
        storage
            .insert_store(&store("far", far.lat, far.lng))
            .await
            .unwrap();
        storage.insert_coupon(&coupon("c-near", "near", now, 5)).await.unwrap();
        storage.insert_coupon(&coupon("c-far", "far", now, 5)).await.unwrap();

        (storage, now)
    }

    fn claim(user: &str, coupon_id: &str, now: DateTime<Utc>) -> UserCouponClaim {
        UserCouponClaim {
            id: format!("{user}-{coupon_id}"),
            user_id: user.to_string(),
            coupon_id: coupon_id.to_string(),
            obtained_at: now,
            discount_at_obtain: 40,
            status: ClaimStatus::Obtained,
            used_at: None,
        }
    }

    #[tokio::test]
    async fn test_first_party_radius_and_live_rate() {
        let (storage, now) = seeded().await;
        let aggregator = Aggregator::new(storage.clone(), vec![], EngineConfig::default());

        let records = aggregator
            .discover(None, request(1_000.0, false), now)
            .await
            .unwrap();

        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.id, "internal_c-near");
        assert_eq!(record.source, OfferSource::Internal);
        assert_eq!(record.shop_name, "Store near");
        // base 10 with under 10 minutes left escalates to 40
        assert_eq!(record.current_discount, 40);
        assert!((record.distance_meters - 100.0).abs() < 0.5);

        let cached = storage.coupon_with_store("c-near").await.unwrap().unwrap();
        assert_eq!(cached.coupon.current_discount, 40);
    }

    #[tokio::test]
    async fn test_cache_write_failure_still_serves_live_rate() {
        let (storage, now) = seeded().await;
        storage
            .execute_raw(
                "CREATE TRIGGER freeze_discount BEFORE UPDATE OF current_discount ON coupons \
                 BEGIN SELECT RAISE(ABORT, 'cache is read-only'); END",
            )
            .await
            .unwrap();
        let aggregator = Aggregator::new(storage.clone(), vec![], EngineConfig::default());

        let records = aggregator
            .discover(None, request(1_000.0, false), now)
            .await
            .unwrap();

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].current_discount, 40);
        let cached = storage.coupon_with_store("c-near").await.unwrap().unwrap();
        assert_eq!(cached.coupon.current_discount, 10);
    }

    #[tokio::test]
    async fn test_claimed_coupons_are_excluded_per_user() {
        let (storage, now) = seeded().await;
        storage.insert_claim(&claim("alice", "c-near", now)).await.unwrap();
        let aggregator = Aggregator::new(storage, vec![], EngineConfig::default());

        let for_alice = aggregator
            .discover(Some("alice"), request(1_000.0, false), now)
            .await
            .unwrap();
        assert!(for_alice.is_empty());

        let for_bob = aggregator
            .discover(Some("bob"), request(1_000.0, false), now)
            .await
            .unwrap();
        assert_eq!(for_bob.len(), 1);
    }

    #[tokio::test]
    async fn test_failing_provider_contributes_fallback() {
        let (storage, now) = seeded().await;
        let http = ProviderHttp::new(Default::default()).unwrap();
        let hotpepper = HotPepperProvider::new(http, None).unwrap();
        let adapters = vec![ProviderAdapter::new(hotpepper, Duration::from_secs(1))];
        let aggregator = Aggregator::new(storage, adapters, EngineConfig::default());

        let records = aggregator
            .discover(None, request(1_000.0, true), now)
            .await
            .unwrap();

        assert!(records.iter().any(|r| r.source == OfferSource::Internal));
        assert!(records.iter().any(|r| r.source == OfferSource::Mock));
        assert!(records.iter().all(|r| r.distance_meters <= 1_000.0));
        assert!(records
            .windows(2)
            .all(|w| w[0].distance_meters <= w[1].distance_meters));
    }

    #[tokio::test]
    async fn test_include_external_false_skips_providers() {
        let (storage, now) = seeded().await;
        let http = ProviderHttp::new(Default::default()).unwrap();
        let hotpepper = HotPepperProvider::new(http, None).unwrap();
        let adapters = vec![ProviderAdapter::new(hotpepper, Duration::from_secs(1))];
        let aggregator = Aggregator::new(storage, adapters, EngineConfig::default());

        let records = aggregator
            .discover(None, request(1_000.0, false), now)
            .await
            .unwrap();
        assert!(records.iter().all(|r| r.source == OfferSource::Internal));
    }

    #[tokio::test]
    async fn test_max_results_truncates() {
        let (storage, now) = seeded().await;
        let config = EngineConfig {
            max_results: 0,
            ..EngineConfig::default()
        };
        let aggregator = Aggregator::new(storage, vec![], config);

        let records = aggregator
            .discover(None, request(10_000.0, false), now)
            .await
            .unwrap();
        assert!(records.is_empty());
    }

    #[test]
    fn test_request_validation() {
        assert!(DiscoverRequest::new(CENTER, None, true, 1_000.0).is_ok());
        assert!(DiscoverRequest::new(CENTER, Some(0.0), true, 1_000.0).is_err());
        assert!(DiscoverRequest::new(CENTER, Some(-5.0), true, 1_000.0).is_err());
        assert!(DiscoverRequest::new(CENTER, Some(100_001.0), true, 1_000.0).is_err());
        assert!(DiscoverRequest::new(CENTER, Some(f64::NAN), true, 1_000.0).is_err());
        assert!(DiscoverRequest::new(Coordinates::new(91.0, 0.0), None, true, 1_000.0).is_err());
        assert!(DiscoverRequest::new(Coordinates::new(0.0, 181.0), None, true, 1_000.0).is_err());

        let defaulted = DiscoverRequest::new(CENTER, None, true, 750.0).unwrap();
        assert_eq!(defaulted.radius_m, 750.0);
    }

    #[tokio::test]
    async fn test_stats() {
        let (storage, now) = seeded().await;
        storage.insert_claim(&claim("alice", "c-far", now)).await.unwrap();
        let aggregator = Aggregator::new(storage, vec![], EngineConfig::default());

        let stats = aggregator.stats("alice", CENTER, now).await.unwrap();
        assert_eq!(
            stats,
            CouponStats {
                total_active: 2,
                near_user: 1,
                user_obtained: 1,
            }
        );

        let stats = aggregator.stats("bob", CENTER, now).await.unwrap();
        assert_eq!(stats.user_obtained, 0);
    }
}
