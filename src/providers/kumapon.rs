//! Kumapon deal adapter.
//!
//! Kumapon publishes deals per area group rather than by coordinate, so a
//! query is first mapped onto area group ids by a coarse bounding-box
//! table. Area listings sometimes embed full deals and sometimes only
//! deal ids, which are then resolved one by one.
//!
//! Endpoints:
//! - `GET {base}/area_groups/{area_id}.json`
//! - `GET {base}/deals/{deal_id}.json`

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

use super::normalize::{
    COMMON_COORDINATE_PAIRS, COMMON_DISCOUNT_PATTERNS, COMMON_EXPIRY_PATTERNS,
    NormalizationTable, Normalizer, lookup,
};
use super::{AreaQuery, OfferProvider, ProviderError, ProviderHttp};
use crate::config::DEFAULT_KUMAPON_URL;
use crate::geo::Coordinates;
use crate::model::{OfferRecord, OfferSource};

/// Deals inspected per area group.
const MAX_DEALS_PER_AREA: usize = 20;

/// Records returned per fetch.
const MAX_RECORDS: usize = 10;

/// A coarse metro bounding box and the area groups covering it.
struct AreaBox {
    lat: (f64, f64),
    lng: (f64, f64),
    areas: &'static [&'static str],
}

const AREA_BOXES: &[AreaBox] = &[
    // Tokyo
    AreaBox {
        lat: (35.5, 35.9),
        lng: (139.3, 139.9),
        areas: &["1", "13", "14"],
    },
    // Osaka
    AreaBox {
        lat: (34.5, 34.8),
        lng: (135.3, 135.7),
        areas: &["2", "27"],
    },
    // Kyoto
    AreaBox {
        lat: (34.9, 35.1),
        lng: (135.6, 135.9),
        areas: &["26"],
    },
    // Nagoya
    AreaBox {
        lat: (35.0, 35.3),
        lng: (136.7, 137.0),
        areas: &["23"],
    },
    // Fukuoka
    AreaBox {
        lat: (33.5, 33.7),
        lng: (130.3, 130.5),
        areas: &["40"],
    },
];

const NATIONWIDE_AREAS: &[&str] = &["1", "2", "13"];

/// Where deal payloads may hold their deal list.
const DEAL_LIST_PATHS: &[&str] = &["deals", "area_group.deals", "data.deals", "data"];

static KUMAPON_TABLE: NormalizationTable = NormalizationTable {
    source: OfferSource::Kumapon,
    id_paths: &["id", "deal_id"],
    title_paths: &["title", "name", "short_title"],
    shop_name_paths: &[
        "merchant.name",
        "merchant.merchant_name",
        "merchant.shop_name",
        "merchant.store_name",
        "merchant.company_name",
        "merchant.business_name",
        "merchant_name",
        "shop_name",
        "store_name",
        "company_name",
        "business_name",
    ],
    shop_name_patterns: &[
        (
            r"(?:送料無料|☆|★)*([^≪≫【】☆★]{4,}?)\s*通信講座",
            "{name} オンラインスクール",
        ),
        (r"【([^】]+)】", "{name}"),
        (r"≪([^≫]+)≫", "{name}"),
    ],
    category_defaults: &[
        ("通信講座", "オンライン通信講座"),
        ("アロマ", "アロマスクール"),
        ("ヨガ", "ヨガスタジオ"),
        ("エステ", "エステサロン"),
        ("ネイル", "ネイルサロン"),
        ("リフォーム", "リフォーム見積サービス"),
        ("太陽光", "太陽光発電見積サービス"),
    ],
    category_paths: &["category.name", "category", "genre"],
    coordinate_containers: &["locations.0", "location", "merchant.address", "address", ""],
    coordinate_pairs: COMMON_COORDINATE_PAIRS,
    lng_lat_paths: &[],
    online_flag_paths: &["is_online", "online", "nationwide"],
    online_keywords: &["通信講座", "オンライン", "全国"],
    price_pairs: &[
        ("original_price", "sale_price"),
        ("original_price", "price"),
        ("price_original", "price_sale"),
        ("list_price", "price"),
    ],
    percent_paths: &["discount_percentage", "discount_rate", "discount"],
    discount_patterns: COMMON_DISCOUNT_PATTERNS,
    default_discount: 30,
    expiry_paths: &["expires_at", "end_date", "expiry_date", "valid_until"],
    expiry_patterns: COMMON_EXPIRY_PATTERNS,
    description_paths: &["description", "summary", "fine_print"],
    url_paths: &["deal_url", "url"],
    url_template: Some("https://kumapon.jp/deals/{id}"),
};

pub struct KumaponProvider {
    http: ProviderHttp,
    base_url: String,
    normalizer: Normalizer,
}

impl KumaponProvider {
    pub fn new(http: ProviderHttp) -> Result<Self, ProviderError> {
        Self::with_base_url(http, DEFAULT_KUMAPON_URL)
    }

    /// Use a custom base URL (for testing).
    pub fn with_base_url(http: ProviderHttp, base_url: &str) -> Result<Self, ProviderError> {
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            normalizer: Normalizer::new(&KUMAPON_TABLE)?,
        })
    }

    /// Resolve a listing entry to a full deal object. Bare ids are fetched.
    async fn resolve_deal(&self, entry: Value) -> Option<Value> {
        let deal_id = match &entry {
            Value::Object(_) => return Some(unwrap_deal(entry)),
            Value::String(id) => id.clone(),
            Value::Number(id) => id.to_string(),
            _ => return None,
        };

        let url = format!(
            "{}/deals/{}.json",
            self.base_url,
            urlencoding::encode(&deal_id)
        );
        match self.http.get_json(&url).await {
            Ok(deal) => Some(unwrap_deal(deal)),
            Err(e) => {
                debug!(deal_id = %deal_id, error = %e, "Skipping unresolvable Kumapon deal");
                None
            }
        }
    }
}

#[async_trait]
impl OfferProvider for KumaponProvider {
    fn source(&self) -> OfferSource {
        OfferSource::Kumapon
    }

    async fn fetch_live(&self, query: &AreaQuery) -> Result<Vec<OfferRecord>, ProviderError> {
        let mut records = Vec::new();
        let mut last_error = None;
        let mut any_area_ok = false;

        'areas: for area in areas_for(query.center) {
            let url = format!("{}/area_groups/{}.json", self.base_url, area);
            let payload = match self.http.get_json(&url).await {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(area, error = %e, "Kumapon area fetch failed");
                    last_error = Some(e);
                    continue;
                }
            };
            any_area_ok = true;

            for entry in extract_deals(payload).into_iter().take(MAX_DEALS_PER_AREA) {
                let Some(deal) = self.resolve_deal(entry).await else {
                    continue;
                };

                match self.normalizer.normalize(&deal, query) {
                    Ok(record) => {
                        if records.iter().any(|r: &OfferRecord| r.id == record.id) {
                            continue;
                        }
                        records.push(record);
                        if records.len() >= MAX_RECORDS {
                            break 'areas;
                        }
                    }
                    Err(reason) => debug!(area, %reason, "Skipping Kumapon deal"),
                }
            }
        }

        match last_error {
            Some(e) if !any_area_ok => Err(e),
            _ => Ok(records),
        }
    }
}

/// Area group ids covering `center`, or a nationwide default.
pub fn areas_for(center: Coordinates) -> &'static [&'static str] {
    AREA_BOXES
        .iter()
        .find(|b| {
            (b.lat.0..=b.lat.1).contains(&center.lat) && (b.lng.0..=b.lng.1).contains(&center.lng)
        })
        .map_or(NATIONWIDE_AREAS, |b| b.areas)
}

/// Pull the deal list out of any of the payload shapes Kumapon has served.
pub fn extract_deals(payload: Value) -> Vec<Value> {
    for path in DEAL_LIST_PATHS {
        if let Some(Value::Array(items)) = lookup(&payload, path) {
            return items.clone();
        }
    }

    match payload {
        Value::Array(items) => items,
        _ => Vec::new(),
    }
}

fn unwrap_deal(value: Value) -> Value {
    match value {
        Value::Object(mut map) if matches!(map.get("deal"), Some(Value::Object(_))) => {
            map.remove("deal").unwrap_or(Value::Null)
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_area_mapping() {
        assert_eq!(areas_for(Coordinates::new(35.6812, 139.7671)), &["1", "13", "14"]);
        assert_eq!(areas_for(Coordinates::new(34.70, 135.50)), &["2", "27"]);
        assert_eq!(areas_for(Coordinates::new(35.01, 135.76)), &["26"]);
        assert_eq!(areas_for(Coordinates::new(35.17, 136.90)), &["23"]);
        assert_eq!(areas_for(Coordinates::new(33.59, 130.40)), &["40"]);
        assert_eq!(areas_for(Coordinates::new(43.06, 141.35)), NATIONWIDE_AREAS);
    }

    #[test]
    fn test_extract_deals_shapes() {
        assert_eq!(extract_deals(json!({"deals": [1, 2]})).len(), 2);
        assert_eq!(extract_deals(json!({"area_group": {"deals": [1]}})).len(), 1);
        assert_eq!(extract_deals(json!({"data": {"deals": [1, 2, 3]}})).len(), 3);
        assert_eq!(extract_deals(json!({"data": [1]})).len(), 1);
        assert_eq!(extract_deals(json!([1, 2])).len(), 2);
        assert!(extract_deals(json!({"unexpected": true})).is_empty());
    }

    #[test]
    fn test_unwrap_deal() {
        let wrapped = json!({"deal": {"id": 5}});
        assert_eq!(unwrap_deal(wrapped), json!({"id": 5}));

        let plain = json!({"id": 5, "deal": "not an object"});
        assert_eq!(unwrap_deal(plain.clone()), plain);
    }

    #[test]
    fn test_kumapon_table_compiles() {
        let normalizer = Normalizer::new(&KUMAPON_TABLE).unwrap();
        assert_eq!(normalizer.source(), OfferSource::Kumapon);
    }

    #[test]
    fn test_course_titles_name_the_school() {
        let normalizer = Normalizer::new(&KUMAPON_TABLE).unwrap();
        let deal = json!({});
        assert_eq!(
            normalizer.resolve_shop_name(&deal, "【52%OFF】アロマテラピー通信講座", None),
            "アロマテラピー オンラインスクール"
        );
        assert_eq!(
            normalizer.resolve_shop_name(&deal, "送料無料☆ハーブ検定 通信講座", None),
            "ハーブ検定 オンラインスクール"
        );
        // Too short to be a course name: the category default applies.
        assert_eq!(
            normalizer.resolve_shop_name(&deal, "★英語 通信講座", None),
            "オンライン通信講座"
        );
    }

    #[test]
    fn test_fine_print_end_date() {
        let normalizer = Normalizer::new(&KUMAPON_TABLE).unwrap();
        let deal = json!({"fine_print": "有効期限：2030年12月31日まで"});
        assert_eq!(
            normalizer.resolve_expiry(&deal, chrono::Utc::now()).to_rfc3339(),
            "2030-12-31T23:59:59+00:00"
        );
    }

    #[test]
    fn test_merchant_fields_resolve_shop_name() {
        let normalizer = Normalizer::new(&KUMAPON_TABLE).unwrap();
        let deal = json!({"merchant": {"name": "店舗名不明", "store_name": "Hair Salon Sora"}});
        assert_eq!(
            normalizer.resolve_shop_name(&deal, "cut + color", None),
            "Hair Salon Sora"
        );
    }
}
