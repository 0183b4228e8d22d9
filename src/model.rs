//! Data models for Coupon Radar.
//!
//! Three families of types live here:
//!
//! - Persisted first-party state: [`Store`], [`Coupon`], [`UserCouponClaim`]
//! - The provider-agnostic [`OfferRecord`] every discovered offer is normalized into
//! - Request/response bodies for the HTTP surface
//!
//! `OfferRecord`s are built fresh per request and never persisted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::geo::Coordinates;

/// Lifecycle status of a first-party coupon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActiveStatus {
    /// Open for discovery and claims until `end_time`.
    Active,
    /// Reached `end_time`.
    Expired,
    /// Ended early by the store owner ("hard delete").
    Exploded,
}

impl ActiveStatus {
    /// The storage representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            ActiveStatus::Active => "active",
            ActiveStatus::Expired => "expired",
            ActiveStatus::Exploded => "exploded",
        }
    }

    /// Parse the storage representation. Unknown values read as `Expired`
    /// so a corrupted row can never become claimable.
    pub fn parse(value: &str) -> Self {
        match value {
            "active" => ActiveStatus::Active,
            "exploded" => ActiveStatus::Exploded,
            _ => ActiveStatus::Expired,
        }
    }
}

/// One step of a coupon's discount escalation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleBreakpoint {
    /// The breakpoint applies once this many minutes or fewer remain.
    #[serde(alias = "time_remain_min")]
    pub time_remaining_minutes: i64,

    /// Discount percentage applied at this breakpoint.
    pub rate: i32,
}

/// A physical store. A coupon's location is always its store's location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Store {
    pub id: String,
    pub name: String,
    pub location: Coordinates,
    pub address: Option<String>,
    pub is_active: bool,
}

/// A first-party coupon as stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Coupon {
    pub id: String,

    /// Owning store.
    pub store_id: String,

    pub title: String,

    pub description: Option<String>,

    /// Base discount percentage.
    pub discount_rate_initial: i32,

    /// Optional escalation schedule, kept in stored order.
    pub discount_rate_schedule: Option<Vec<ScheduleBreakpoint>>,

    pub start_time: DateTime<Utc>,

    pub end_time: DateTime<Utc>,

    pub active_status: ActiveStatus,

    /// Cached live rate. Always recomputable via
    /// [`crate::discount::live_rate`]; never the source of truth.
    pub current_discount: i32,
}

impl Coupon {
    /// Whether the coupon can still be discovered or claimed at `now`.
    pub fn is_open(&self, now: DateTime<Utc>) -> bool {
        self.active_status == ActiveStatus::Active && now < self.end_time
    }

    /// Whole minutes until `end_time`, floored at zero.
    pub fn minutes_remaining(&self, now: DateTime<Utc>) -> i64 {
        (self.end_time - now).num_minutes().max(0)
    }
}

/// A coupon joined with the store it belongs to.
#[derive(Debug, Clone)]
pub struct CouponWithStore {
    pub coupon: Coupon,
    pub store: Store,
}

/// Where an offer record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OfferSource {
    /// First-party coupon from the local store.
    Internal,
    /// Kumapon deals (provider-A).
    Kumapon,
    /// HotPepper gourmet coupons (provider-B).
    #[serde(rename = "hotpepper")]
    HotPepper,
    /// Yahoo! local search (provider-C).
    Yahoo,
    /// Synthetic filler produced when a provider yields nothing usable.
    Mock,
}

impl OfferSource {
    /// Prefix that makes record ids globally unique across sources.
    pub fn id_prefix(&self) -> &'static str {
        match self {
            OfferSource::Internal => "internal",
            OfferSource::Kumapon => "kumapon",
            OfferSource::HotPepper => "hotpepper",
            OfferSource::Yahoo => "yahoo",
            OfferSource::Mock => "mock",
        }
    }

    /// Build a record id from a source-local id.
    pub fn record_id(&self, local_id: &str) -> String {
        format!("{}_{}", self.id_prefix(), local_id)
    }

    /// Confidence tier used as a ranking tie-break: first-party, then live
    /// external data, then synthetic filler.
    pub fn confidence_tier(&self) -> u8 {
        match self {
            OfferSource::Internal => 0,
            OfferSource::Kumapon | OfferSource::HotPepper | OfferSource::Yahoo => 1,
            OfferSource::Mock => 2,
        }
    }
}

/// The canonical, provider-agnostic offer shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfferRecord {
    /// Globally unique id, prefixed by source (e.g. `internal_<uuid>`, `kumapon_123`).
    pub id: String,

    pub source: OfferSource,

    pub title: String,

    /// Resolved shop name, or [`crate::providers::normalize::UNKNOWN_SHOP_NAME`].
    pub shop_name: String,

    /// Live discount percentage.
    pub current_discount: i32,

    pub location: Coordinates,

    pub expires_at: DateTime<Utc>,

    pub time_remaining_minutes: i64,

    /// Distance from the query point in meters.
    pub distance_meters: f64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}

/// Status of a user's claim on a coupon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClaimStatus {
    Obtained,
    Used,
    Expired,
}

impl ClaimStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClaimStatus::Obtained => "obtained",
            ClaimStatus::Used => "used",
            ClaimStatus::Expired => "expired",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "used" => ClaimStatus::Used,
            "expired" => ClaimStatus::Expired,
            _ => ClaimStatus::Obtained,
        }
    }
}

/// A user's claim on a first-party coupon. At most one exists per
/// (user, coupon) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserCouponClaim {
    pub id: String,
    pub user_id: String,
    pub coupon_id: String,
    pub obtained_at: DateTime<Utc>,

    /// Live rate at the instant of the claim. Never recomputed.
    pub discount_at_obtain: i32,

    pub status: ClaimStatus,
    pub used_at: Option<DateTime<Utc>>,
}

/// A claim joined with the coupon and store details needed for display.
#[derive(Debug, Clone, Serialize)]
pub struct ClaimView {
    pub id: String,
    pub coupon_id: String,
    pub shop_name: String,
    pub title: String,
    pub description: Option<String>,
    pub discount: i32,
    pub status: ClaimStatus,
    pub obtained_at: DateTime<Utc>,
    pub used_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
}

/// Query parameters for GET /coupons.
#[derive(Debug, Deserialize)]
pub struct DiscoverQuery {
    pub lat: f64,
    pub lng: f64,

    /// Search radius in meters; the configured default when absent.
    pub radius: Option<f64>,

    /// Whether third-party providers are consulted (default: true).
    #[serde(default = "default_include_external")]
    pub include_external: bool,
}

fn default_include_external() -> bool {
    true
}

/// Request body for POST /coupons/get.
#[derive(Debug, Clone, Deserialize)]
pub struct ClaimRequest {
    /// Either the raw coupon id or the `internal_`-prefixed record id.
    pub coupon_id: String,
    pub user_location: Coordinates,
}

/// Success body for POST /coupons/get.
#[derive(Debug, Clone, Serialize)]
pub struct ClaimResponse {
    pub message: String,
    pub coupon_id: String,
    pub discount: i32,
    pub shop_name: String,
}

/// Query parameters for GET /coupons/stats.
#[derive(Debug, Deserialize)]
pub struct StatsQuery {
    pub lat: f64,
    pub lng: f64,
}

/// Response for GET /coupons/stats.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CouponStats {
    /// Open first-party coupons anywhere.
    pub total_active: i64,
    /// Open first-party coupons within the stats radius of the caller.
    pub near_user: i64,
    /// Claims the caller holds, in any status.
    pub user_obtained: i64,
}

/// Success body for POST /user/coupons/{coupon_id}/use.
#[derive(Debug, Clone, Serialize)]
pub struct RedeemResponse {
    pub message: String,
    pub coupon_id: String,
    pub used_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn coupon(end_in_minutes: i64, status: ActiveStatus) -> Coupon {
        let now = Utc::now();
        Coupon {
            id: "c1".to_string(),
            store_id: "s1".to_string(),
            title: "Drinks".to_string(),
            description: None,
            discount_rate_initial: 10,
            discount_rate_schedule: None,
            start_time: now - Duration::hours(1),
            end_time: now + Duration::minutes(end_in_minutes),
            active_status: status,
            current_discount: 10,
        }
    }

    #[test]
    fn test_breakpoint_accepts_legacy_field_name() {
        let bp: ScheduleBreakpoint =
            serde_json::from_str(r#"{"time_remain_min": 30, "rate": 25}"#).unwrap();
        assert_eq!(bp.time_remaining_minutes, 30);
        assert_eq!(bp.rate, 25);
    }

    #[test]
    fn test_active_status_round_trip_and_unknown() {
        for status in [
            ActiveStatus::Active,
            ActiveStatus::Expired,
            ActiveStatus::Exploded,
        ] {
            assert_eq!(ActiveStatus::parse(status.as_str()), status);
        }
        assert_eq!(ActiveStatus::parse("garbage"), ActiveStatus::Expired);
    }

    #[test]
    fn test_coupon_is_open() {
        let now = Utc::now();
        assert!(coupon(30, ActiveStatus::Active).is_open(now));
        assert!(!coupon(-1, ActiveStatus::Active).is_open(now));
        assert!(!coupon(30, ActiveStatus::Exploded).is_open(now));
    }

    #[test]
    fn test_record_id_prefix() {
        assert_eq!(OfferSource::Kumapon.record_id("42"), "kumapon_42");
        assert_eq!(OfferSource::Internal.record_id("abc"), "internal_abc");
    }

    #[test]
    fn test_offer_source_serializes_lowercase() {
        let json = serde_json::to_string(&OfferSource::HotPepper).unwrap();
        assert_eq!(json, "\"hotpepper\"");
    }

    #[test]
    fn test_confidence_tiers_order() {
        assert!(OfferSource::Internal.confidence_tier() < OfferSource::Yahoo.confidence_tier());
        assert!(OfferSource::Yahoo.confidence_tier() < OfferSource::Mock.confidence_tier());
    }
}
