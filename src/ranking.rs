//! Final ordering of discovered offers.

use std::cmp::Ordering;

use crate::model::OfferRecord;

/// Sorts merged offers and trims them to the response size.
#[derive(Debug, Clone, Copy)]
pub struct Ranker {
    max_results: usize,
}

impl Ranker {
    pub fn new(max_results: usize) -> Self {
        Self { max_results }
    }

    /// Nearest first. Ties go to the higher discount, then to the more
    /// trustworthy source, then to the lower id. Distances are rounded to
    /// 0.1 m only after ordering.
    pub fn rank(&self, mut records: Vec<OfferRecord>) -> Vec<OfferRecord> {
        records.sort_by(compare);
        records.truncate(self.max_results);

        for record in &mut records {
            record.distance_meters = (record.distance_meters * 10.0).round() / 10.0;
        }
        records
    }
}

fn compare(a: &OfferRecord, b: &OfferRecord) -> Ordering {
    a.distance_meters
        .total_cmp(&b.distance_meters)
        .then_with(|| b.current_discount.cmp(&a.current_discount))
        .then_with(|| a.source.confidence_tier().cmp(&b.source.confidence_tier()))
        .then_with(|| a.id.cmp(&b.id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::Coordinates;
    use crate::model::OfferSource;
    use chrono::Utc;

    fn offer(id: &str, source: OfferSource, distance: f64, discount: i32) -> OfferRecord {
        OfferRecord {
            id: id.to_string(),
            source,
            title: id.to_string(),
            shop_name: "shop".to_string(),
            current_discount: discount,
            location: Coordinates::new(35.0, 135.0),
            expires_at: Utc::now(),
            time_remaining_minutes: 30,
            distance_meters: distance,
            description: None,
            external_url: None,
            category: None,
        }
    }

    fn ids(records: &[OfferRecord]) -> Vec<&str> {
        records.iter().map(|r| r.id.as_str()).collect()
    }

    #[test]
    fn test_nearest_first() {
        let ranked = Ranker::new(10).rank(vec![
            offer("far", OfferSource::Kumapon, 900.0, 50),
            offer("near", OfferSource::Mock, 10.0, 10),
            offer("mid", OfferSource::Internal, 300.0, 20),
        ]);
        assert_eq!(ids(&ranked), vec!["near", "mid", "far"]);
    }

    #[test]
    fn test_tie_breaks() {
        let ranked = Ranker::new(10).rank(vec![
            offer("mock_b", OfferSource::Mock, 100.0, 30),
            offer("kumapon_a", OfferSource::Kumapon, 100.0, 30),
            offer("internal_z", OfferSource::Internal, 100.0, 30),
            offer("internal_a", OfferSource::Internal, 100.0, 30),
            offer("richer", OfferSource::Mock, 100.0, 45),
        ]);
        assert_eq!(
            ids(&ranked),
            vec!["richer", "internal_a", "internal_z", "kumapon_a", "mock_b"]
        );
    }

    #[test]
    fn test_truncates_after_sorting() {
        let ranked = Ranker::new(2).rank(vec![
            offer("c", OfferSource::Yahoo, 30.0, 10),
            offer("a", OfferSource::Yahoo, 10.0, 10),
            offer("b", OfferSource::Yahoo, 20.0, 10),
        ]);
        assert_eq!(ids(&ranked), vec!["a", "b"]);
    }

    #[test]
    fn test_rounding_happens_after_ordering() {
        // 12.04 and 12.01 both display as 12.0 but keep their true order.
        let ranked = Ranker::new(10).rank(vec![
            offer("second", OfferSource::Yahoo, 12.04, 10),
            offer("first", OfferSource::Yahoo, 12.01, 10),
        ]);
        assert_eq!(ids(&ranked), vec!["first", "second"]);
        assert_eq!(ranked[0].distance_meters, 12.0);
        assert_eq!(ranked[1].distance_meters, 12.0);
    }

    #[test]
    fn test_empty_input() {
        assert!(Ranker::new(5).rank(Vec::new()).is_empty());
    }
}
