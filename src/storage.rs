//! SQLite storage layer for Coupon Radar.
//!
//! Owns three tables:
//!
//! - `stores`: physical locations coupons are bound to
//! - `coupons`: first-party coupons; only `current_discount` is written here
//! - `user_coupons`: claims, with a UNIQUE index on `(user_id, coupon_id)`
//!
//! The unique index is the real guard against duplicate claims. Two
//! concurrent claims can both pass an application-level "no prior claim"
//! check; only one insert survives the index, and the loser is reported as
//! [`EngineError::AlreadyObtained`].
//!
//! Timestamps are stored as Unix milliseconds.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};

use crate::error::{EngineError, EngineResult};
use crate::geo::Coordinates;
use crate::model::{
    ActiveStatus, ClaimStatus, Coupon, CouponWithStore, ScheduleBreakpoint, Store,
    UserCouponClaim,
};

/// Columns selected whenever a coupon is read together with its store.
const COUPON_STORE_COLUMNS: &str = r#"
    c.id AS coupon_id, c.store_id AS coupon_store_id, c.title, c.description,
    c.discount_rate_initial, c.discount_rate_schedule, c.start_time, c.end_time,
    c.active_status, c.current_discount,
    s.id AS store_id, s.name AS store_name, s.latitude, s.longitude, s.address,
    s.is_active AS store_is_active
"#;

const CLAIM_COLUMNS: &str = r#"
    u.id AS claim_id, u.user_id, u.coupon_id AS claim_coupon_id, u.obtained_at,
    u.used_at, u.status AS claim_status, u.discount_at_obtain
"#;

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Storage {
    pool: SqlitePool,
}

impl Storage {
    /// Create a new storage instance and initialize the schema.
    ///
    /// # Arguments
    ///
    /// * `database_url` - SQLite connection string (e.g., "sqlite:coupon_radar.db" or "sqlite::memory:")
    pub async fn new(database_url: &str) -> EngineResult<Self> {
        // Every connection to `:memory:` is a separate database, so an
        // in-memory pool is pinned to one long-lived connection.
        let options = if database_url.contains(":memory:") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };

        let pool = options.connect(database_url).await?;

        let storage = Self { pool };
        storage.initialize_schema().await?;

        Ok(storage)
    }

    /// Create the database schema if it doesn't exist.
    async fn initialize_schema(&self) -> EngineResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS stores (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                latitude REAL NOT NULL,
                longitude REAL NOT NULL,
                address TEXT,
                is_active INTEGER NOT NULL DEFAULT 1
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS coupons (
                id TEXT PRIMARY KEY,
                store_id TEXT NOT NULL REFERENCES stores(id),
                title TEXT NOT NULL,
                description TEXT,
                discount_rate_initial INTEGER NOT NULL,
                discount_rate_schedule TEXT,
                start_time INTEGER NOT NULL,
                end_time INTEGER NOT NULL,
                active_status TEXT NOT NULL DEFAULT 'active',
                current_discount INTEGER NOT NULL,
                CHECK (start_time < end_time)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_coupons_status_end
            ON coupons(active_status, end_time)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS user_coupons (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                coupon_id TEXT NOT NULL REFERENCES coupons(id),
                obtained_at INTEGER NOT NULL,
                used_at INTEGER,
                status TEXT NOT NULL DEFAULT 'obtained',
                discount_at_obtain INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // One claim per (user, coupon), ever.
        sqlx::query(
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_user_coupons_user_coupon
            ON user_coupons(user_id, coupon_id)
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ------------------------------------------------------------------
    // Stores and coupons
    // ------------------------------------------------------------------

    /// Insert a store. Store management is owned by external tooling; this
    /// exists for seeding and tests.
    pub async fn insert_store(&self, store: &Store) -> EngineResult<()> {
        sqlx::query(
            r#"
            INSERT INTO stores (id, name, latitude, longitude, address, is_active)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&store.id)
        .bind(&store.name)
        .bind(store.location.lat)
        .bind(store.location.lng)
        .bind(&store.address)
        .bind(store.is_active)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Insert a coupon. Like [`Storage::insert_store`], for seeding and tests.
    pub async fn insert_coupon(&self, coupon: &Coupon) -> EngineResult<()> {
        let schedule = coupon
            .discount_rate_schedule
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        sqlx::query(
            r#"
            INSERT INTO coupons (
                id, store_id, title, description, discount_rate_initial,
                discount_rate_schedule, start_time, end_time, active_status,
                current_discount
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&coupon.id)
        .bind(&coupon.store_id)
        .bind(&coupon.title)
        .bind(&coupon.description)
        .bind(coupon.discount_rate_initial)
        .bind(schedule)
        .bind(coupon.start_time.timestamp_millis())
        .bind(coupon.end_time.timestamp_millis())
        .bind(coupon.active_status.as_str())
        .bind(coupon.current_discount)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Number of stores on record.
    pub async fn count_stores(&self) -> EngineResult<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS total FROM stores")
            .fetch_one(&self.pool)
            .await?;

        Ok(row.try_get("total")?)
    }

    /// Open coupons (active status, `end_time > now`) whose store is active.
    pub async fn active_coupons_with_stores(
        &self,
        now: DateTime<Utc>,
    ) -> EngineResult<Vec<CouponWithStore>> {
        let sql = format!(
            r#"
            SELECT {COUPON_STORE_COLUMNS}
            FROM coupons c
            JOIN stores s ON s.id = c.store_id
            WHERE c.active_status = 'active' AND c.end_time > ? AND s.is_active = 1
            "#
        );

        let rows = sqlx::query(&sql)
            .bind(now.timestamp_millis())
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(coupon_with_store_from_row).collect()
    }

    /// Count of open coupons, regardless of store or location.
    pub async fn count_active_coupons(&self, now: DateTime<Utc>) -> EngineResult<i64> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS total
            FROM coupons
            WHERE active_status = 'active' AND end_time > ?
            "#,
        )
        .bind(now.timestamp_millis())
        .fetch_one(&self.pool)
        .await?;

        Ok(row.try_get("total")?)
    }

    /// Look up a single coupon and its store, in any status.
    pub async fn coupon_with_store(&self, coupon_id: &str) -> EngineResult<Option<CouponWithStore>> {
        let sql = format!(
            r#"
            SELECT {COUPON_STORE_COLUMNS}
            FROM coupons c
            JOIN stores s ON s.id = c.store_id
            WHERE c.id = ?
            "#
        );

        let row = sqlx::query(&sql)
            .bind(coupon_id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(coupon_with_store_from_row).transpose()
    }

    /// Write the cached live rate. Idempotent; last writer wins.
    pub async fn update_current_discount(&self, coupon_id: &str, rate: i32) -> EngineResult<()> {
        sqlx::query("UPDATE coupons SET current_discount = ? WHERE id = ?")
            .bind(rate)
            .bind(coupon_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    // ------------------------------------------------------------------
    // Claims
    // ------------------------------------------------------------------

    /// The user's claim on a coupon, if any.
    pub async fn find_claim(
        &self,
        user_id: &str,
        coupon_id: &str,
    ) -> EngineResult<Option<UserCouponClaim>> {
        let sql = format!(
            r#"
            SELECT {CLAIM_COLUMNS}
            FROM user_coupons u
            WHERE u.user_id = ? AND u.coupon_id = ?
            "#
        );

        let row = sqlx::query(&sql)
            .bind(user_id)
            .bind(coupon_id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(claim_from_row).transpose()
    }

    /// Coupon ids the user has ever claimed, in any status.
    pub async fn claimed_coupon_ids(&self, user_id: &str) -> EngineResult<HashSet<String>> {
        let rows = sqlx::query("SELECT coupon_id FROM user_coupons WHERE user_id = ?")
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|r| r.try_get::<String, _>("coupon_id").map_err(EngineError::from))
            .collect()
    }

    /// Number of claims the user holds.
    pub async fn count_user_claims(&self, user_id: &str) -> EngineResult<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS total FROM user_coupons WHERE user_id = ?")
            .bind(user_id)
            .fetch_one(&self.pool)
            .await?;

        Ok(row.try_get("total")?)
    }

    /// Commit a claim together with the coupon's refreshed cache, atomically.
    ///
    /// A unique-index violation means another claim for the same
    /// (user, coupon) committed first and is reported as
    /// [`EngineError::AlreadyObtained`].
    pub async fn insert_claim(&self, claim: &UserCouponClaim) -> EngineResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("UPDATE coupons SET current_discount = ? WHERE id = ?")
            .bind(claim.discount_at_obtain)
            .bind(&claim.coupon_id)
            .execute(&mut *tx)
            .await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO user_coupons (
                id, user_id, coupon_id, obtained_at, used_at, status, discount_at_obtain
            )
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&claim.id)
        .bind(&claim.user_id)
        .bind(&claim.coupon_id)
        .bind(claim.obtained_at.timestamp_millis())
        .bind(claim.used_at.map(|t| t.timestamp_millis()))
        .bind(claim.status.as_str())
        .bind(claim.discount_at_obtain)
        .execute(&mut *tx)
        .await;

        match inserted {
            Ok(_) => {}
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                return Err(EngineError::AlreadyObtained);
            }
            Err(e) => return Err(e.into()),
        }

        tx.commit().await?;
        Ok(())
    }

    /// All of a user's claims joined with coupon and store, newest first.
    pub async fn claims_for_user(
        &self,
        user_id: &str,
    ) -> EngineResult<Vec<(UserCouponClaim, CouponWithStore)>> {
        let sql = format!(
            r#"
            SELECT {CLAIM_COLUMNS}, {COUPON_STORE_COLUMNS}
            FROM user_coupons u
            JOIN coupons c ON c.id = u.coupon_id
            JOIN stores s ON s.id = c.store_id
            WHERE u.user_id = ?
            ORDER BY u.obtained_at DESC, u.id
            "#
        );

        let rows = sqlx::query(&sql)
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| Ok((claim_from_row(row)?, coupon_with_store_from_row(row)?)))
            .collect()
    }

    /// Transition an obtained claim to used. Returns false if the claim was
    /// no longer in the obtained state.
    pub async fn mark_claim_used(&self, claim_id: &str, used_at: DateTime<Utc>) -> EngineResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE user_coupons
            SET status = 'used', used_at = ?
            WHERE id = ? AND status = 'obtained'
            "#,
        )
        .bind(used_at.timestamp_millis())
        .bind(claim_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Transition an obtained claim to expired. Returns false if the claim
    /// was no longer in the obtained state.
    pub async fn expire_claim(&self, claim_id: &str) -> EngineResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE user_coupons
            SET status = 'expired'
            WHERE id = ? AND status = 'obtained'
            "#,
        )
        .bind(claim_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}

#[cfg(test)]
impl Storage {
    /// Run arbitrary SQL against the pool.
    pub(crate) async fn execute_raw(&self, sql: &str) -> EngineResult<()> {
        sqlx::query(sql).execute(&self.pool).await?;
        Ok(())
    }
}

fn from_timestamp(ts: i64) -> EngineResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ts)
        .ok_or_else(|| EngineError::Internal(format!("timestamp out of range: {ts}")))
}

fn coupon_with_store_from_row(row: &SqliteRow) -> EngineResult<CouponWithStore> {
    let schedule: Option<String> = row.try_get("discount_rate_schedule")?;
    let schedule = schedule
        .filter(|s| !s.trim().is_empty())
        .map(|s| serde_json::from_str::<Vec<ScheduleBreakpoint>>(&s))
        .transpose()?;

    let active_status: String = row.try_get("active_status")?;

    let coupon = Coupon {
        id: row.try_get("coupon_id")?,
        store_id: row.try_get("coupon_store_id")?,
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        discount_rate_initial: row.try_get("discount_rate_initial")?,
        discount_rate_schedule: schedule,
        start_time: from_timestamp(row.try_get("start_time")?)?,
        end_time: from_timestamp(row.try_get("end_time")?)?,
        active_status: ActiveStatus::parse(&active_status),
        current_discount: row.try_get("current_discount")?,
    };

    let store = Store {
        id: row.try_get("store_id")?,
        name: row.try_get("store_name")?,
        location: Coordinates::new(row.try_get("latitude")?, row.try_get("longitude")?),
        address: row.try_get("address")?,
        is_active: row.try_get::<i64, _>("store_is_active")? != 0,
    };

    Ok(CouponWithStore { coupon, store })
}

fn claim_from_row(row: &SqliteRow) -> EngineResult<UserCouponClaim> {
    let status: String = row.try_get("claim_status")?;
    let used_at: Option<i64> = row.try_get("used_at")?;

    Ok(UserCouponClaim {
        id: row.try_get("claim_id")?,
        user_id: row.try_get("user_id")?,
        coupon_id: row.try_get("claim_coupon_id")?,
        obtained_at: from_timestamp(row.try_get("obtained_at")?)?,
        discount_at_obtain: row.try_get("discount_at_obtain")?,
        status: ClaimStatus::parse(&status),
        used_at: used_at.map(from_timestamp).transpose()?,
    })
}
