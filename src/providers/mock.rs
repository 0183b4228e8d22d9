//! Deterministic synthetic offers.
//!
//! Used only when a provider fails, times out or yields nothing usable, so
//! discover can still show something near the user. The generator is
//! seeded from the provider name and the query, making the output stable
//! for a repeated query.

use std::hash::{DefaultHasher, Hash, Hasher};

use chrono::Duration;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::AreaQuery;
use crate::geo;
use crate::model::{OfferRecord, OfferSource};

/// Upper bound on synthetic offers per provider per query.
pub const MAX_MOCK_OFFERS: usize = 3;

/// Synthetic offers never sit further out than this, whatever the radius.
const MAX_SPREAD_M: f64 = 2_000.0;

/// `(category, shop name, offer label)`
const MOCK_CATALOG: &[(&str, &str, &str)] = &[
    ("restaurant", "Station Grill", "Lunch set"),
    ("cafe", "Corner Cafe", "Any drink"),
    ("izakaya", "Lantern Izakaya", "First round of drinks"),
    ("bakery", "Morning Bakery", "Evening bread"),
    ("beauty", "Salon Aoi", "Cut and blow"),
    ("fashion", "Street Boutique", "Autumn apparel"),
];

#[derive(Debug, Clone)]
pub struct MockOfferGenerator {
    count: usize,
}

impl Default for MockOfferGenerator {
    fn default() -> Self {
        Self {
            count: MAX_MOCK_OFFERS,
        }
    }
}

impl MockOfferGenerator {
    /// A generator producing `count` offers, capped at [`MAX_MOCK_OFFERS`].
    pub fn with_count(count: usize) -> Self {
        Self {
            count: count.min(MAX_MOCK_OFFERS),
        }
    }

    /// Synthetic offers within the query radius, tagged `source: mock`.
    pub fn generate(&self, provider: &str, query: &AreaQuery) -> Vec<OfferRecord> {
        if query.radius_m <= 0.0 {
            return Vec::new();
        }

        let mut rng = StdRng::seed_from_u64(seed_for(provider, query));
        let spread = query.radius_m.min(MAX_SPREAD_M);

        (0..self.count)
            .filter_map(|n| {
                let (category, shop_name, label) = MOCK_CATALOG[rng.gen_range(0..MOCK_CATALOG.len())];
                let bearing = rng.gen_range(0.0..360.0);
                let meters = rng.gen_range(0.05..=0.9) * spread;
                let discount = rng.gen_range(2..=10) * 5;
                let lifetime = Duration::minutes(rng.gen_range(60..=480));

                let location = geo::offset(query.center, bearing, meters);
                let distance = geo::distance(query.center, location);
                if distance > query.radius_m {
                    return None;
                }

                let expires_at = query.now + lifetime;
                Some(OfferRecord {
                    id: OfferSource::Mock.record_id(&format!("{provider}_{n}")),
                    source: OfferSource::Mock,
                    title: format!("{label} {discount}% OFF"),
                    shop_name: shop_name.to_string(),
                    current_discount: discount,
                    location,
                    expires_at,
                    time_remaining_minutes: lifetime.num_minutes(),
                    distance_meters: distance,
                    description: Some(format!("Sample offer shown while {provider} is unavailable")),
                    external_url: None,
                    category: Some(category.to_string()),
                })
            })
            .collect()
    }
}

fn seed_for(provider: &str, query: &AreaQuery) -> u64 {
    let mut hasher = DefaultHasher::new();
    provider.hash(&mut hasher);
    ((query.center.lat * 1e5).round() as i64).hash(&mut hasher);
    ((query.center.lng * 1e5).round() as i64).hash(&mut hasher);
    (query.radius_m.round() as i64).hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::Coordinates;
    use chrono::Utc;

    fn query(radius_m: f64) -> AreaQuery {
        AreaQuery {
            center: Coordinates::new(35.6812, 139.7671),
            radius_m,
            now: Utc::now(),
        }
    }

    #[test]
    fn test_offers_stay_inside_radius() {
        for radius in [30.0, 500.0, 1_000.0, 50_000.0] {
            let q = query(radius);
            let offers = MockOfferGenerator::default().generate("kumapon", &q);
            assert!(!offers.is_empty());
            for offer in &offers {
                assert!(offer.distance_meters <= radius);
                assert!(offer.distance_meters <= MAX_SPREAD_M * 0.9 + 1.0);
            }
        }
    }

    #[test]
    fn test_offer_shape() {
        let q = query(1_000.0);
        let offers = MockOfferGenerator::default().generate("hotpepper", &q);

        assert_eq!(offers.len(), MAX_MOCK_OFFERS);
        for (n, offer) in offers.iter().enumerate() {
            assert_eq!(offer.id, format!("mock_hotpepper_{n}"));
            assert_eq!(offer.source, OfferSource::Mock);
            assert_eq!(offer.current_discount % 5, 0);
            assert!((10..=50).contains(&offer.current_discount));
            assert!((60..=480).contains(&offer.time_remaining_minutes));
            assert!(offer.expires_at > q.now);
        }
    }

    #[test]
    fn test_deterministic_per_query() {
        let q = query(800.0);
        let generator = MockOfferGenerator::default();

        let first = generator.generate("yahoo", &q);
        let second = generator.generate("yahoo", &q);
        assert_eq!(first, second);

        let other = generator.generate("kumapon", &q);
        let first_locations: Vec<_> = first.iter().map(|o| o.location).collect();
        let other_locations: Vec<_> = other.iter().map(|o| o.location).collect();
        assert_ne!(first_locations, other_locations);
    }

    #[test]
    fn test_count_is_capped() {
        let offers = MockOfferGenerator::with_count(10).generate("kumapon", &query(1_000.0));
        assert_eq!(offers.len(), MAX_MOCK_OFFERS);
        assert!(MockOfferGenerator::with_count(0)
            .generate("kumapon", &query(1_000.0))
            .is_empty());
    }

    #[test]
    fn test_zero_radius_yields_nothing() {
        assert!(MockOfferGenerator::default().generate("kumapon", &query(0.0)).is_empty());
    }
}
