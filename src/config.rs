//! Runtime configuration loaded from environment variables.
//!
//! Every value has a default so the server starts with no environment at
//! all; providers without credentials simply fall back to synthetic offers.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::discount::ScheduleMatch;

/// Default port if not specified via environment variable.
pub const DEFAULT_PORT: u16 = 3000;

/// Default database path if not specified via environment variable.
pub const DEFAULT_DB_URL: &str = "sqlite:coupon_radar.db?mode=rwc";

/// Default Kumapon API base URL.
pub const DEFAULT_KUMAPON_URL: &str = "https://api.kumapon.jp";

/// Largest search radius accepted from callers, in meters.
pub const MAX_SEARCH_RADIUS_M: f64 = 100_000.0;

/// Top-level configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub database_url: String,
    pub seed_sample_data: bool,
    pub engine: EngineConfig,
    pub providers: ProviderConfig,
}

/// Business rules for discovery and acquisition.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Proximity gate radius for claims, in meters.
    ///
    /// Historical deployments used both 20 m and 300 m; 20 m is the default.
    pub acquisition_radius_m: f64,

    /// Breakpoint match order for custom discount schedules.
    pub schedule_match: ScheduleMatch,

    /// Search radius used when a discover query omits one.
    pub default_radius_m: f64,

    /// Radius used by the `near_user` stats counter.
    pub stats_radius_m: f64,

    /// Upper bound on records returned by discover.
    pub max_results: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            acquisition_radius_m: 20.0,
            schedule_match: ScheduleMatch::Last,
            default_radius_m: 1_000.0,
            stats_radius_m: 1_000.0,
            max_results: 50,
        }
    }
}

/// Third-party provider settings.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// Per-adapter timeout.
    pub timeout: Duration,

    /// Retries on transient HTTP failures.
    pub retries: u32,

    pub kumapon_url: String,

    /// HotPepper API key. Without it the adapter always falls back.
    pub hotpepper_key: Option<String>,

    /// Yahoo! app id. Without it the adapter always falls back.
    pub yahoo_app_id: Option<String>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            retries: 1,
            kumapon_url: DEFAULT_KUMAPON_URL.to_string(),
            hotpepper_key: None,
            yahoo_app_id: None,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            database_url: DEFAULT_DB_URL.to_string(),
            seed_sample_data: false,
            engine: EngineConfig::default(),
            providers: ProviderConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from `COUPON_RADAR_*` environment variables.
    pub fn from_env() -> Self {
        let defaults = Config::default();

        let schedule_match = match env::var("COUPON_RADAR_SCHEDULE_MATCH") {
            Ok(raw) => ScheduleMatch::parse(&raw).unwrap_or_else(|| {
                warn!(value = %raw, "Unrecognized schedule match order, using default");
                defaults.engine.schedule_match
            }),
            Err(_) => defaults.engine.schedule_match,
        };

        Self {
            port: parsed("COUPON_RADAR_PORT", defaults.port),
            database_url: env::var("COUPON_RADAR_DATABASE_URL")
                .unwrap_or(defaults.database_url),
            seed_sample_data: flag("COUPON_RADAR_SEED_SAMPLE"),
            engine: EngineConfig {
                acquisition_radius_m: radius(
                    "COUPON_RADAR_ACQUISITION_RADIUS_M",
                    defaults.engine.acquisition_radius_m,
                    f64::MAX,
                ),
                schedule_match,
                default_radius_m: radius(
                    "COUPON_RADAR_DEFAULT_RADIUS_M",
                    defaults.engine.default_radius_m,
                    MAX_SEARCH_RADIUS_M,
                ),
                stats_radius_m: radius(
                    "COUPON_RADAR_STATS_RADIUS_M",
                    defaults.engine.stats_radius_m,
                    f64::MAX,
                ),
                max_results: parsed("COUPON_RADAR_MAX_RESULTS", defaults.engine.max_results),
            },
            providers: ProviderConfig {
                timeout: Duration::from_secs(parsed(
                    "COUPON_RADAR_PROVIDER_TIMEOUT_SECS",
                    defaults.providers.timeout.as_secs(),
                )),
                retries: parsed("COUPON_RADAR_PROVIDER_RETRIES", defaults.providers.retries),
                kumapon_url: env::var("COUPON_RADAR_KUMAPON_URL")
                    .unwrap_or(defaults.providers.kumapon_url),
                hotpepper_key: non_empty("COUPON_RADAR_HOTPEPPER_KEY"),
                yahoo_app_id: non_empty("COUPON_RADAR_YAHOO_APPID"),
            },
        }
    }
}

fn parsed<T: FromStr + Copy>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!(key, value = %raw, "Unparseable configuration value, using default");
            default
        }),
        Err(_) => default,
    }
}

/// A radius in meters: finite, positive and at most `max`.
fn radius(key: &str, default: f64, max: f64) -> f64 {
    let value = parsed(key, default);
    if value.is_finite() && value > 0.0 && value <= max {
        value
    } else {
        warn!(key, value, "Radius out of range, using default");
        default
    }
}

fn non_empty(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn flag(key: &str) -> bool {
    env::var(key)
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}
