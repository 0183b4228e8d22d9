//! HTTP API handlers for Coupon Radar.
//!
//! # Caller identity
//!
//! Authentication happens upstream of this service. The caller's user id
//! arrives in the `x-user-id` header:
//!
//! - **GET /coupons** works anonymously; with an id, coupons the caller
//!   already claimed are excluded.
//! - Every other coupon endpoint requires the header and answers
//!   `401` without it.
//!
//! Errors render as `{"error": "<reason>"}` with the status from
//! [`EngineError::status_code`].

use std::convert::Infallible;
use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    Json, Router,
    extract::{FromRequestParts, Path, Query, State, rejection::JsonRejection, rejection::QueryRejection},
    http::{HeaderMap, StatusCode, request::Parts},
    response::IntoResponse,
    routing::{get, post},
};
use chrono::Utc;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{info, instrument};

use crate::acquisition::AcquisitionGate;
use crate::aggregation::{Aggregator, DiscoverRequest};
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::geo::Coordinates;
use crate::model::{
    ClaimRequest, ClaimResponse, ClaimView, CouponStats, DiscoverQuery, OfferRecord,
    RedeemResponse, StatsQuery,
};
use crate::providers::ProviderAdapter;
use crate::storage::Storage;

/// Header carrying the caller's user id.
pub const USER_ID_HEADER: &str = "x-user-id";

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub aggregator: Arc<Aggregator>,
    pub gate: Arc<AcquisitionGate>,
    pub engine: EngineConfig,
}

impl AppState {
    pub fn new(storage: Storage, providers: Vec<ProviderAdapter>, engine: EngineConfig) -> Self {
        Self {
            aggregator: Arc::new(Aggregator::new(storage.clone(), providers, engine.clone())),
            gate: Arc::new(AcquisitionGate::new(storage, &engine)),
            engine,
        }
    }
}

/// Build the application router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/coupons", get(get_coupons))
        .route("/coupons/get", post(post_claim))
        .route("/coupons/stats", get(get_stats))
        .route("/user/coupons", get(get_user_coupons))
        .route("/user/coupons/:coupon_id/use", post(post_redeem))
        .route("/health", get(health_check))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}

// ============================================================================
// Identity extractors
// ============================================================================

/// The caller's user id, required.
#[derive(Debug, Clone)]
pub struct UserId(pub String);

/// The caller's user id, if any.
#[derive(Debug, Clone)]
pub struct MaybeUserId(pub Option<String>);

fn user_id_from_headers(headers: &HeaderMap) -> Option<String> {
    headers
        .get(USER_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
}

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for UserId {
    type Rejection = EngineError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        user_id_from_headers(&parts.headers)
            .map(UserId)
            .ok_or(EngineError::Unauthenticated)
    }
}

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for MaybeUserId {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(MaybeUserId(user_id_from_headers(&parts.headers)))
    }
}

// ============================================================================
// Coupon handlers
// ============================================================================

/// GET /coupons - Discover offers around a point.
///
/// # Query Parameters
///
/// - `lat`, `lng` (required)
/// - `radius` (optional): meters, defaults to the configured radius
/// - `include_external` (optional): consult third-party providers (default: true)
///
/// # Response
///
/// A JSON array of offer records, nearest first.
#[instrument(skip(state, query))]
pub async fn get_coupons(
    State(state): State<AppState>,
    MaybeUserId(user_id): MaybeUserId,
    query: Result<Query<DiscoverQuery>, QueryRejection>,
) -> EngineResult<Json<Vec<OfferRecord>>> {
    let Query(query) = query.map_err(|e| EngineError::Validation(e.body_text()))?;

    let request = DiscoverRequest::new(
        Coordinates::new(query.lat, query.lng),
        query.radius,
        query.include_external,
        state.engine.default_radius_m,
    )?;

    let records = state
        .aggregator
        .discover(user_id.as_deref(), request, Utc::now())
        .await?;

    Ok(Json(records))
}

/// POST /coupons/get - Claim a first-party coupon.
///
/// # Request Body
///
/// ```json
/// {
///     "coupon_id": "internal_3f2c...",
///     "user_location": { "lat": 35.6812, "lng": 139.7671 }
/// }
/// ```
///
/// # Response
///
/// ```json
/// {
///     "message": "coupon obtained",
///     "coupon_id": "3f2c...",
///     "discount": 30,
///     "shop_name": "Station Coffee Stand"
/// }
/// ```
#[instrument(skip(state, body))]
pub async fn post_claim(
    State(state): State<AppState>,
    UserId(user_id): UserId,
    body: Result<Json<ClaimRequest>, JsonRejection>,
) -> EngineResult<Json<ClaimResponse>> {
    let Json(request) = body.map_err(|e| EngineError::Validation(e.body_text()))?;

    let receipt = state
        .gate
        .claim(&user_id, &request.coupon_id, request.user_location, Utc::now())
        .await?;

    Ok(Json(ClaimResponse {
        message: "coupon obtained".to_string(),
        coupon_id: receipt.claim.coupon_id,
        discount: receipt.claim.discount_at_obtain,
        shop_name: receipt.shop_name,
    }))
}

/// GET /coupons/stats - Coupon counters around a point.
///
/// # Response
///
/// ```json
/// { "total_active": 12, "near_user": 3, "user_obtained": 1 }
/// ```
#[instrument(skip(state, query))]
pub async fn get_stats(
    State(state): State<AppState>,
    UserId(user_id): UserId,
    query: Result<Query<StatsQuery>, QueryRejection>,
) -> EngineResult<Json<CouponStats>> {
    let Query(query) = query.map_err(|e| EngineError::Validation(e.body_text()))?;

    let stats = state
        .aggregator
        .stats(&user_id, Coordinates::new(query.lat, query.lng), Utc::now())
        .await?;

    info!(
        total_active = stats.total_active,
        near_user = stats.near_user,
        "Stats queried"
    );

    Ok(Json(stats))
}

// ============================================================================
// User handlers
// ============================================================================

/// GET /user/coupons - The caller's claims, newest first.
#[instrument(skip(state))]
pub async fn get_user_coupons(
    State(state): State<AppState>,
    UserId(user_id): UserId,
) -> EngineResult<Json<Vec<ClaimView>>> {
    let claims = state.gate.user_claims(&user_id, Utc::now()).await?;
    Ok(Json(claims))
}

/// POST /user/coupons/:coupon_id/use - Redeem a claimed coupon.
#[instrument(skip(state))]
pub async fn post_redeem(
    State(state): State<AppState>,
    UserId(user_id): UserId,
    Path(coupon_id): Path<String>,
) -> EngineResult<Json<RedeemResponse>> {
    let claim = state.gate.redeem(&user_id, &coupon_id, Utc::now()).await?;

    Ok(Json(RedeemResponse {
        message: "coupon used".to_string(),
        coupon_id: claim.coupon_id,
        used_at: claim.used_at,
    }))
}

/// GET /health - Simple health check endpoint.
pub async fn health_check() -> impl IntoResponse {
    StatusCode::OK
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_user_id_header_parsing() {
        let mut headers = HeaderMap::new();
        assert_eq!(user_id_from_headers(&headers), None);

        headers.insert(USER_ID_HEADER, HeaderValue::from_static("   "));
        assert_eq!(user_id_from_headers(&headers), None);

        headers.insert(USER_ID_HEADER, HeaderValue::from_static(" alice "));
        assert_eq!(user_id_from_headers(&headers).as_deref(), Some("alice"));
    }
}
