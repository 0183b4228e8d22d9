//! HotPepper gourmet search adapter.
//!
//! API: <https://webservice.recruit.co.jp/doc/hotpepper/reference.html>
//!
//! Shops are searched by coordinate with a coarse range code rather than
//! a radius in meters. Requires an API key.

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use super::normalize::{
    COMMON_COORDINATE_PAIRS, COMMON_DISCOUNT_PATTERNS, COMMON_SHOP_NAME_PATTERNS,
    NormalizationTable, Normalizer, lookup, text_at,
};
use super::{AreaQuery, OfferProvider, ProviderError, ProviderHttp};
use crate::model::{OfferRecord, OfferSource};

const HOTPEPPER_BASE_URL: &str = "https://webservice.recruit.co.jp/hotpepper/gourmet/v1/";

/// Shops requested per search.
const RESULT_COUNT: u32 = 30;

static HOTPEPPER_TABLE: NormalizationTable = NormalizationTable {
    source: OfferSource::HotPepper,
    id_paths: &["id"],
    title_paths: &["catch", "genre.catch", "name"],
    shop_name_paths: &["name", "name_kana"],
    shop_name_patterns: COMMON_SHOP_NAME_PATTERNS,
    category_defaults: &[],
    category_paths: &["genre.name", "sub_genre.name"],
    coordinate_containers: &[""],
    coordinate_pairs: COMMON_COORDINATE_PAIRS,
    lng_lat_paths: &[],
    online_flag_paths: &[],
    online_keywords: &[],
    price_pairs: &[],
    percent_paths: &[],
    discount_patterns: COMMON_DISCOUNT_PATTERNS,
    default_discount: 10,
    expiry_paths: &[],
    expiry_patterns: &[],
    description_paths: &["genre.catch", "access", "address"],
    url_paths: &["coupon_urls.sp", "coupon_urls.pc", "urls.pc"],
    url_template: None,
};

pub struct HotPepperProvider {
    http: ProviderHttp,
    base_url: String,
    api_key: Option<String>,
    normalizer: Normalizer,
}

impl HotPepperProvider {
    pub fn new(http: ProviderHttp, api_key: Option<String>) -> Result<Self, ProviderError> {
        Self::with_base_url(http, api_key, HOTPEPPER_BASE_URL)
    }

    /// Use a custom base URL (for testing).
    pub fn with_base_url(
        http: ProviderHttp,
        api_key: Option<String>,
        base_url: &str,
    ) -> Result<Self, ProviderError> {
        Ok(Self {
            http,
            base_url: base_url.to_string(),
            api_key,
            normalizer: Normalizer::new(&HOTPEPPER_TABLE)?,
        })
    }
}

#[async_trait]
impl OfferProvider for HotPepperProvider {
    fn source(&self) -> OfferSource {
        OfferSource::HotPepper
    }

    async fn fetch_live(&self, query: &AreaQuery) -> Result<Vec<OfferRecord>, ProviderError> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or(ProviderError::MissingCredentials)?;

        let url = format!(
            "{}?key={}&lat={}&lng={}&range={}&format=json&count={}",
            self.base_url,
            urlencoding::encode(api_key),
            query.center.lat,
            query.center.lng,
            range_code(query.radius_m),
            RESULT_COUNT
        );

        let payload = self.http.get_json(&url).await?;

        if let Some(message) = text_at(&payload, "results.error.0.message") {
            return Err(ProviderError::Upstream(message));
        }

        let shops: &[Value] = match lookup(&payload, "results.shop") {
            Some(Value::Array(shops)) => shops.as_slice(),
            _ => &[],
        };

        let records = shops
            .iter()
            .filter_map(|shop| match self.normalizer.normalize(shop, query) {
                Ok(record) => Some(record),
                Err(reason) => {
                    debug!(%reason, "Skipping HotPepper shop");
                    None
                }
            })
            .collect();

        Ok(records)
    }
}

/// Map a radius in meters onto HotPepper's search range code.
pub fn range_code(radius_m: f64) -> u8 {
    match radius_m {
        r if r <= 300.0 => 1,
        r if r <= 500.0 => 2,
        r if r <= 1_000.0 => 3,
        r if r <= 2_000.0 => 4,
        _ => 5,
    }
}
