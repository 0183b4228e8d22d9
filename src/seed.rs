//! Demo data for a fresh database.

use chrono::{DateTime, Duration, Utc};
use tracing::info;
use uuid::Uuid;

use crate::geo::Coordinates;
use crate::model::{ActiveStatus, Coupon, ScheduleBreakpoint, Store};
use crate::storage::Storage;

struct SampleStore {
    name: &'static str,
    address: &'static str,
    location: Coordinates,
    coupon_title: &'static str,
    coupon_description: &'static str,
    base_rate: i32,
    lifetime_minutes: i64,
    /// `(minutes remaining, rate)`, loosest threshold first.
    schedule: &'static [(i64, i32)],
}

const SAMPLE_STORES: &[SampleStore] = &[
    SampleStore {
        name: "Station Coffee Stand",
        address: "Tokyo Station",
        location: Coordinates {
            lat: 35.6812,
            lng: 139.7671,
        },
        coupon_title: "All drinks",
        coupon_description: "Coffee, tea and juice",
        base_rate: 15,
        lifetime_minutes: 90,
        schedule: &[(60, 20), (30, 30), (10, 40)],
    },
    SampleStore {
        name: "Ginza Dining",
        address: "Ginza",
        location: Coordinates {
            lat: 35.6815,
            lng: 139.7675,
        },
        coupon_title: "Lunch menu",
        coupon_description: "Set meals, rice bowls and noodles",
        base_rate: 20,
        lifetime_minutes: 120,
        schedule: &[(45, 25), (20, 35), (5, 50)],
    },
    SampleStore {
        name: "Corner Bookshop",
        address: "Marunouchi",
        location: Coordinates {
            lat: 35.6810,
            lng: 139.7665,
        },
        coupon_title: "Stationery",
        coupon_description: "Pens, notebooks and planners",
        base_rate: 10,
        lifetime_minutes: 180,
        schedule: &[(60, 15), (30, 25)],
    },
];

/// Insert the sample stores and coupons if the database has no stores.
///
/// Returns whether anything was inserted.
pub async fn load_sample_data(storage: &Storage, now: DateTime<Utc>) -> anyhow::Result<bool> {
    if storage.count_stores().await? > 0 {
        return Ok(false);
    }

    for sample in SAMPLE_STORES {
        let store = Store {
            id: Uuid::new_v4().to_string(),
            name: sample.name.to_string(),
            location: sample.location,
            address: Some(sample.address.to_string()),
            is_active: true,
        };
        storage.insert_store(&store).await?;

        let coupon = Coupon {
            id: Uuid::new_v4().to_string(),
            store_id: store.id.clone(),
            title: sample.coupon_title.to_string(),
            description: Some(sample.coupon_description.to_string()),
            discount_rate_initial: sample.base_rate,
            discount_rate_schedule: Some(
                sample
                    .schedule
                    .iter()
                    .map(|&(time_remaining_minutes, rate)| ScheduleBreakpoint {
                        time_remaining_minutes,
                        rate,
                    })
                    .collect(),
            ),
            start_time: now,
            end_time: now + Duration::minutes(sample.lifetime_minutes),
            active_status: ActiveStatus::Active,
            current_discount: sample.base_rate,
        };
        storage.insert_coupon(&coupon).await?;
    }

    info!(stores = SAMPLE_STORES.len(), "Sample data loaded");
    Ok(true)
}
