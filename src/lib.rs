//! Coupon Radar - location-aware coupon discovery and acquisition.
//!
//! # Overview
//!
//! Coupon Radar answers "what deals are near me right now?" by merging
//! first-party time-limited coupons, whose discount escalates as expiry
//! approaches, with offers pulled live from third-party providers. Users
//! can then claim a first-party coupon, but only while physically close to
//! the issuing store, and only once.
//!
//! # API Endpoints
//!
//! - `GET /coupons` - Discover offers around a point
//! - `POST /coupons/get` - Claim a coupon
//! - `GET /coupons/stats` - Coupon counters around a point
//! - `GET /user/coupons` - The caller's claims
//! - `POST /user/coupons/:coupon_id/use` - Redeem a claim
//! - `GET /health` - Health check
//!
//! # Modules
//!
//! - [`geo`]: Haversine distance
//! - [`discount`]: Live discount computation
//! - [`providers`]: Third-party adapters with synthetic fallback
//! - [`aggregation`]: Discovery and stats
//! - [`ranking`]: Final result ordering
//! - [`acquisition`]: Claim and redemption rules
//! - [`storage`]: SQLite storage layer
//! - [`model`]: Data types
//! - [`api`]: HTTP API handlers

pub mod acquisition;
pub mod aggregation;
pub mod api;
pub mod config;
pub mod discount;
pub mod error;
pub mod geo;
pub mod model;
pub mod providers;
pub mod ranking;
pub mod seed;
pub mod storage;
