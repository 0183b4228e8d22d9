//! Yahoo! local search adapter.
//!
//! API: <https://developer.yahoo.co.jp/webapi/map/openlocalplatform/v1/localsearch.html>
//!
//! Searches for shops with coupons (`coupon=true`) around a point. The
//! radius is sent in kilometers and coordinates come back as a single
//! `"lng,lat"` string. Requires an app id.

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use super::normalize::{
    COMMON_DISCOUNT_PATTERNS, COMMON_SHOP_NAME_PATTERNS, NormalizationTable, Normalizer, lookup,
    text_at,
};
use super::{AreaQuery, OfferProvider, ProviderError, ProviderHttp};
use crate::model::{OfferRecord, OfferSource};

const YAHOO_BASE_URL: &str = "https://map.yahooapis.jp/search/local/V1/localSearch";

/// Features requested per search.
const RESULT_COUNT: u32 = 20;

static YAHOO_TABLE: NormalizationTable = NormalizationTable {
    source: OfferSource::Yahoo,
    id_paths: &["Id", "Gid", "Property.Uid"],
    title_paths: &["Property.Coupon.0.Name", "Property.CatchCopy", "Name"],
    shop_name_paths: &["Name", "Property.Detail.Name"],
    shop_name_patterns: COMMON_SHOP_NAME_PATTERNS,
    category_defaults: &[],
    category_paths: &["Property.Genre.0.Name"],
    coordinate_containers: &[],
    coordinate_pairs: &[],
    lng_lat_paths: &["Geometry.Coordinates"],
    online_flag_paths: &[],
    online_keywords: &[],
    price_pairs: &[],
    percent_paths: &[],
    discount_patterns: COMMON_DISCOUNT_PATTERNS,
    default_discount: 10,
    expiry_paths: &["Property.Coupon.0.EndDate"],
    expiry_patterns: &[],
    description_paths: &["Property.CatchCopy", "Property.Address"],
    url_paths: &["Property.Coupon.0.SmartPhoneUrl", "Property.Coupon.0.PcUrl"],
    url_template: None,
};

pub struct YahooLocalProvider {
    http: ProviderHttp,
    base_url: String,
    app_id: Option<String>,
    normalizer: Normalizer,
}

impl YahooLocalProvider {
    pub fn new(http: ProviderHttp, app_id: Option<String>) -> Result<Self, ProviderError> {
        Self::with_base_url(http, app_id, YAHOO_BASE_URL)
    }

    /// Use a custom base URL (for testing).
    pub fn with_base_url(
        http: ProviderHttp,
        app_id: Option<String>,
        base_url: &str,
    ) -> Result<Self, ProviderError> {
        Ok(Self {
            http,
            base_url: base_url.to_string(),
            app_id,
            normalizer: Normalizer::new(&YAHOO_TABLE)?,
        })
    }
}

#[async_trait]
impl OfferProvider for YahooLocalProvider {
    fn source(&self) -> OfferSource {
        OfferSource::Yahoo
    }

    async fn fetch_live(&self, query: &AreaQuery) -> Result<Vec<OfferRecord>, ProviderError> {
        let app_id = self
            .app_id
            .as_deref()
            .ok_or(ProviderError::MissingCredentials)?;

        let url = format!(
            "{}?appid={}&lat={}&lon={}&dist={}&output=json&results={}&coupon=true",
            self.base_url,
            urlencoding::encode(app_id),
            query.center.lat,
            query.center.lng,
            radius_km(query.radius_m),
            RESULT_COUNT
        );

        let payload = self.http.get_json(&url).await?;

        if let Some(message) = text_at(&payload, "Error.Message") {
            return Err(ProviderError::Upstream(message));
        }

        let features: &[Value] = match lookup(&payload, "Feature") {
            Some(Value::Array(features)) => features.as_slice(),
            _ => &[],
        };

        let mut records = Vec::with_capacity(features.len());
        for feature in features {
            match self.normalizer.normalize(feature, query) {
                Ok(record) => records.push(record),
                Err(reason) => debug!(%reason, "Skipping Yahoo! feature"),
            }
        }

        Ok(records)
    }
}

/// Radius in kilometers, rounded to whole meters and at least 1 m.
pub fn radius_km(radius_m: f64) -> f64 {
    radius_m.round().max(1.0) / 1_000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::Coordinates;
    use chrono::Utc;
    use serde_json::json;

    #[test]
    fn test_radius_km() {
        assert_eq!(radius_km(1_000.0), 1.0);
        assert_eq!(radius_km(2_500.0), 2.5);
        assert_eq!(radius_km(0.2), 0.001);
    }

    #[test]
    fn test_feature_normalization() {
        let normalizer = Normalizer::new(&YAHOO_TABLE).unwrap();
        let query = AreaQuery {
            center: Coordinates::new(35.6812, 139.7671),
            radius_m: 1_000.0,
            now: Utc::now(),
        };
        let feature = json!({
            "Id": "abc123",
            "Name": "Ramen Kaze",
            "Geometry": {"Type": "point", "Coordinates": "139.7680,35.6820"},
            "Property": {
                "Address": "Chiyoda, Tokyo",
                "Genre": [{"Code": "0101", "Name": "ラーメン"}],
                "Coupon": [{"Name": "Topping 2割引", "PcUrl": "https://example.test/c"}],
            },
        });

        let record = normalizer.normalize(&feature, &query).unwrap();
        assert_eq!(record.id, "yahoo_abc123");
        assert_eq!(record.title, "Topping 2割引");
        assert_eq!(record.shop_name, "Ramen Kaze");
        assert_eq!(record.current_discount, 20);
        assert_eq!(record.category.as_deref(), Some("ラーメン"));
        assert!((record.location.lat - 35.6820).abs() < 1e-9);
        assert_eq!(record.external_url.as_deref(), Some("https://example.test/c"));
    }

    #[test]
    fn test_feature_without_geometry_is_skipped() {
        let normalizer = Normalizer::new(&YAHOO_TABLE).unwrap();
        let query = AreaQuery {
            center: Coordinates::new(35.6812, 139.7671),
            radius_m: 1_000.0,
            now: Utc::now(),
        };
        let feature = json!({"Id": "x", "Name": "Somewhere"});
        assert!(normalizer.normalize(&feature, &query).is_err());
    }
}
