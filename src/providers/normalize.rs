//! Table-driven normalization of raw provider listings into [`OfferRecord`]s.
//!
//! Upstream payloads disagree on field names, nesting and units. Rather
//! than scattering fallbacks through each adapter, every provider declares
//! a static [`NormalizationTable`] listing, in priority order, where each
//! canonical field may be found. A [`Normalizer`] compiles that table once
//! and applies it to `serde_json::Value` listings.
//!
//! Paths are dot-separated; numeric segments index into arrays
//! (`locations.0.lat`).

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, Utc};
use regex::Regex;
use serde_json::Value;
use thiserror::Error;

use super::AreaQuery;
use crate::geo::{self, Coordinates};
use crate::model::{OfferRecord, OfferSource};

/// Shop name used when no rule resolves a meaningful one.
pub const UNKNOWN_SHOP_NAME: &str = "unknown";

/// Names upstreams use to mean "no name". Compared case-insensitively.
const PLACEHOLDER_NAMES: &[&str] = &["店舗名不明", "unknown", "n/a", "none", "-"];

/// Lifetime assumed for listings that carry no usable expiry.
const DEFAULT_LIFETIME_HOURS: i64 = 24;

/// Coordinate field pairs seen across providers, tried in order.
pub const COMMON_COORDINATE_PAIRS: &[(&str, &str)] = &[
    ("latitude", "longitude"),
    ("lat", "lng"),
    ("lat", "lon"),
    ("y", "x"),
];

/// Title patterns wrapping a shop name, e.g. `【Shop】 Lunch set`, paired
/// with the template the captured name is rendered through.
pub const COMMON_SHOP_NAME_PATTERNS: &[(&str, &str)] =
    &[(r"【([^】]+)】", "{name}"), (r"≪([^≫]+)≫", "{name}")];

/// Title patterns carrying a discount, paired with a multiplier
/// (`3割引` means 30%).
pub const COMMON_DISCOUNT_PATTERNS: &[(&str, i32)] = &[
    (r"(?i)(\d{1,3})\s*[%％]\s*(?:off|オフ)", 1),
    (r"(\d{1,2})\s*割\s*(?:引|オフ)", 10),
];

/// Free-text end dates such as `2030年1月2日まで`. Groups are year, month, day.
pub const COMMON_EXPIRY_PATTERNS: &[&str] = &[r"(\d{4})年(\d{1,2})月(\d{1,2})日[^。\n]*まで"];

/// Where to find each canonical field in one provider's listings.
///
/// Every list is in priority order; the first path that yields a usable
/// value wins.
#[derive(Debug)]
pub struct NormalizationTable {
    pub source: OfferSource,
    pub id_paths: &'static [&'static str],
    pub title_paths: &'static [&'static str],
    pub shop_name_paths: &'static [&'static str],
    /// `(regex, template)` applied to the title; the first meaningful
    /// capture group replaces `{name}` in the template.
    pub shop_name_patterns: &'static [(&'static str, &'static str)],
    /// `(keyword, shop name)`: last-resort names derived from title or category.
    pub category_defaults: &'static [(&'static str, &'static str)],
    pub category_paths: &'static [&'static str],
    /// Objects that may hold a coordinate pair; `""` is the listing itself.
    pub coordinate_containers: &'static [&'static str],
    pub coordinate_pairs: &'static [(&'static str, &'static str)],
    /// Strings of the form `"lng,lat"`.
    pub lng_lat_paths: &'static [&'static str],
    /// Boolean fields marking an offer as not tied to a place.
    pub online_flag_paths: &'static [&'static str],
    /// Title keywords marking an offer as not tied to a place.
    pub online_keywords: &'static [&'static str],
    /// `(original price, sale price)` pairs.
    pub price_pairs: &'static [(&'static str, &'static str)],
    pub percent_paths: &'static [&'static str],
    pub discount_patterns: &'static [(&'static str, i32)],
    pub default_discount: i32,
    pub expiry_paths: &'static [&'static str],
    /// Regexes capturing year, month and day, searched in the description
    /// fields when no expiry field parses.
    pub expiry_patterns: &'static [&'static str],
    pub description_paths: &'static [&'static str],
    pub url_paths: &'static [&'static str],
    /// Fallback URL with `{id}` replaced by the source-local id.
    pub url_template: Option<&'static str>,
}

/// Why a listing was dropped during normalization.
#[derive(Debug, Error, PartialEq)]
pub enum SkipReason {
    #[error("listing has no id")]
    MissingId,
    #[error("listing has no title")]
    MissingTitle,
    #[error("listing has no usable location")]
    Unlocatable,
    #[error("listing is {0:.0}m away, outside the search radius")]
    OutOfRadius(f64),
    #[error("listing has already expired")]
    Expired,
}

/// A compiled [`NormalizationTable`].
#[derive(Debug)]
pub struct Normalizer {
    table: &'static NormalizationTable,
    shop_patterns: Vec<(Regex, &'static str)>,
    discount_patterns: Vec<(Regex, i32)>,
    expiry_patterns: Vec<Regex>,
}

impl Normalizer {
    pub fn new(table: &'static NormalizationTable) -> Result<Self, regex::Error> {
        let shop_patterns = table
            .shop_name_patterns
            .iter()
            .map(|(p, template)| Regex::new(p).map(|re| (re, *template)))
            .collect::<Result<Vec<_>, _>>()?;
        let discount_patterns = table
            .discount_patterns
            .iter()
            .map(|(p, multiplier)| Regex::new(p).map(|re| (re, *multiplier)))
            .collect::<Result<Vec<_>, _>>()?;
        let expiry_patterns = table
            .expiry_patterns
            .iter()
            .map(|p| Regex::new(p))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            table,
            shop_patterns,
            discount_patterns,
            expiry_patterns,
        })
    }

    pub fn source(&self) -> OfferSource {
        self.table.source
    }

    /// Normalize one listing against `query`.
    ///
    /// Listings with no place are pinned to the query center when the table
    /// marks them online, and dropped otherwise. Listings outside the query
    /// radius are dropped.
    pub fn normalize(&self, item: &Value, query: &AreaQuery) -> Result<OfferRecord, SkipReason> {
        let local_id = first_text(item, self.table.id_paths).ok_or(SkipReason::MissingId)?;
        let title = first_text(item, self.table.title_paths).ok_or(SkipReason::MissingTitle)?;

        let location = match self.resolve_coordinates(item) {
            Some(location) => location,
            None if self.is_online(item, &title) => query.center,
            None => return Err(SkipReason::Unlocatable),
        };

        let distance = geo::distance(query.center, location);
        if distance > query.radius_m {
            return Err(SkipReason::OutOfRadius(distance));
        }

        let expires_at = self.resolve_expiry(item, query.now);
        if expires_at <= query.now {
            return Err(SkipReason::Expired);
        }

        let category = first_text(item, self.table.category_paths);
        let shop_name = self.resolve_shop_name(item, &title, category.as_deref());
        let external_url = first_text(item, self.table.url_paths).or_else(|| {
            self.table
                .url_template
                .map(|template| template.replace("{id}", &local_id))
        });

        Ok(OfferRecord {
            id: self.table.source.record_id(&local_id),
            source: self.table.source,
            current_discount: self.resolve_discount(item, &title),
            shop_name,
            location,
            expires_at,
            time_remaining_minutes: (expires_at - query.now).num_minutes().max(0),
            distance_meters: distance,
            description: first_text(item, self.table.description_paths),
            external_url,
            category,
            title,
        })
    }

    /// Shop name from explicit fields, then title patterns, then category
    /// defaults, then [`UNKNOWN_SHOP_NAME`].
    pub fn resolve_shop_name(&self, item: &Value, title: &str, category: Option<&str>) -> String {
        self.table
            .shop_name_paths
            .iter()
            .filter_map(|path| text_at(item, path))
            .find(|name| is_meaningful(name))
            .or_else(|| self.shop_name_from_title(title))
            .or_else(|| self.category_default(title, category))
            .unwrap_or_else(|| UNKNOWN_SHOP_NAME.to_string())
    }

    fn shop_name_from_title(&self, title: &str) -> Option<String> {
        self.shop_patterns.iter().find_map(|(re, template)| {
            re.captures(title).and_then(|caps| {
                caps.iter()
                    .skip(1)
                    .flatten()
                    .map(|m| m.as_str().trim())
                    .find(|name| is_meaningful(name))
                    .map(|name| template.replace("{name}", name))
            })
        })
    }

    fn category_default(&self, title: &str, category: Option<&str>) -> Option<String> {
        self.table
            .category_defaults
            .iter()
            .find(|(keyword, _)| {
                title.contains(keyword) || category.is_some_and(|c| c.contains(keyword))
            })
            .map(|(_, name)| name.to_string())
    }

    /// First valid coordinate found in the table's containers and pairs,
    /// then in its `"lng,lat"` strings. `(0, 0)` counts as missing.
    pub fn resolve_coordinates(&self, item: &Value) -> Option<Coordinates> {
        for container in self.table.coordinate_containers {
            for (lat_field, lng_field) in self.table.coordinate_pairs {
                let lat = number_at(item, &join_path(container, lat_field));
                let lng = number_at(item, &join_path(container, lng_field));
                if let (Some(lat), Some(lng)) = (lat, lng) {
                    if let Some(location) = usable(Coordinates::new(lat, lng)) {
                        return Some(location);
                    }
                }
            }
        }

        self.table
            .lng_lat_paths
            .iter()
            .filter_map(|path| text_at(item, path))
            .find_map(|raw| parse_lng_lat(&raw))
    }

    fn is_online(&self, item: &Value, title: &str) -> bool {
        let flagged = self
            .table
            .online_flag_paths
            .iter()
            .any(|path| lookup(item, path).is_some_and(is_truthy));

        flagged || self.table.online_keywords.iter().any(|kw| title.contains(kw))
    }

    /// Discount from a price pair, an explicit percentage, a title pattern,
    /// or the table default, clamped to `0..=100`.
    pub fn resolve_discount(&self, item: &Value, title: &str) -> i32 {
        self.discount_from_prices(item)
            .or_else(|| {
                self.table
                    .percent_paths
                    .iter()
                    .filter_map(|path| number_at(item, path))
                    .find(|pct| *pct > 0.0)
                    .map(|pct| pct as i32)
            })
            .or_else(|| self.discount_from_title(title))
            .unwrap_or(self.table.default_discount)
            .clamp(0, 100)
    }

    fn discount_from_prices(&self, item: &Value) -> Option<i32> {
        self.table.price_pairs.iter().find_map(|(original, sale)| {
            let original = number_at(item, original)?;
            let sale = number_at(item, sale)?;
            if original > 0.0 && sale > 0.0 && sale <= original {
                Some(((original - sale) / original * 100.0) as i32)
            } else {
                None
            }
        })
    }

    fn discount_from_title(&self, title: &str) -> Option<i32> {
        self.discount_patterns.iter().find_map(|(re, multiplier)| {
            let caps = re.captures(title)?;
            let value = caps.get(1)?.as_str().parse::<i32>().ok()? * multiplier;
            (1..=100).contains(&value).then_some(value)
        })
    }

    /// Expiry from the table's fields, then from dates written in the
    /// description text, or `now + 24h`.
    pub fn resolve_expiry(&self, item: &Value, now: DateTime<Utc>) -> DateTime<Utc> {
        self.table
            .expiry_paths
            .iter()
            .filter_map(|path| text_at(item, path))
            .find_map(|raw| parse_timestamp(&raw))
            .or_else(|| self.expiry_from_text(item))
            .unwrap_or_else(|| now + Duration::hours(DEFAULT_LIFETIME_HOURS))
    }

    fn expiry_from_text(&self, item: &Value) -> Option<DateTime<Utc>> {
        self.table
            .description_paths
            .iter()
            .filter_map(|path| text_at(item, path))
            .find_map(|text| {
                self.expiry_patterns.iter().find_map(|re| {
                    let caps = re.captures(&text)?;
                    let year = caps.get(1)?.as_str().parse().ok()?;
                    let month = caps.get(2)?.as_str().parse().ok()?;
                    let day = caps.get(3)?.as_str().parse().ok()?;
                    end_of_day(NaiveDate::from_ymd_opt(year, month, day)?)
                })
            })
    }
}

// ============================================================================
// JSON helpers
// ============================================================================

/// Follow a dotted path through objects and arrays. `""` is the value itself.
pub fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(value);
    }

    path.split('.').try_fold(value, |current, key| match current {
        Value::Object(map) => map.get(key),
        Value::Array(items) => key.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Non-empty trimmed text at `path`. Numbers are rendered as text.
pub fn text_at(value: &Value, path: &str) -> Option<String> {
    match lookup(value, path)? {
        Value::String(s) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Finite number at `path`, accepting numeric strings.
pub fn number_at(value: &Value, path: &str) -> Option<f64> {
    let number = match lookup(value, path)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }?;
    number.is_finite().then_some(number)
}

fn first_text(value: &Value, paths: &[&str]) -> Option<String> {
    paths.iter().find_map(|path| text_at(value, path))
}

fn join_path(container: &str, field: &str) -> String {
    if container.is_empty() {
        field.to_string()
    } else {
        format!("{container}.{field}")
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_i64().is_some_and(|n| n != 0),
        Value::String(s) => matches!(s.trim().to_ascii_lowercase().as_str(), "true" | "1" | "yes"),
        _ => false,
    }
}

fn is_meaningful(name: &str) -> bool {
    let trimmed = name.trim();
    !trimmed.is_empty()
        && !PLACEHOLDER_NAMES
            .iter()
            .any(|placeholder| trimmed.eq_ignore_ascii_case(placeholder))
}

fn usable(location: Coordinates) -> Option<Coordinates> {
    let is_null_island = location.lat == 0.0 && location.lng == 0.0;
    (location.is_valid() && !is_null_island).then_some(location)
}

/// Parse `"lng,lat"` as used by Yahoo! geometry strings.
pub fn parse_lng_lat(raw: &str) -> Option<Coordinates> {
    let (lng, lat) = raw.split_once(',')?;
    let lng = lng.trim().parse::<f64>().ok()?;
    let lat = lat.trim().parse::<f64>().ok()?;
    usable(Coordinates::new(lat, lng))
}

fn end_of_day(date: NaiveDate) -> Option<DateTime<Utc>> {
    date.and_hms_opt(23, 59, 59).map(|naive| naive.and_utc())
}

/// Parse RFC 3339, a naive `YYYY-MM-DD HH:MM:SS` (as UTC), a bare date
/// (end of that day, UTC) or Unix seconds.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();

    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(naive.and_utc());
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return end_of_day(date);
    }
    raw.parse::<i64>()
        .ok()
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
}
