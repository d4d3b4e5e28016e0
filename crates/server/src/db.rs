//! SQLite persistence (via sqlx): reservation rows and saved simulator
//! sessions. This is the whole store surface the mediation plane needs;
//! teaching content and user accounts live in other services.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Pool, Row, Sqlite};
use std::str::FromStr;

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

// ---------------------------------------------------------------------------
// Rows
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ReservationStatus {
    Active,
    Completed,
    Expired,
}

impl ReservationStatus {
    fn as_str(self) -> &'static str {
        match self {
            ReservationStatus::Active => "ACTIVE",
            ReservationStatus::Completed => "COMPLETED",
            ReservationStatus::Expired => "EXPIRED",
        }
    }

    fn parse(s: &str) -> Result<Self> {
        match s {
            "ACTIVE" => Ok(ReservationStatus::Active),
            "COMPLETED" => Ok(ReservationStatus::Completed),
            "EXPIRED" => Ok(ReservationStatus::Expired),
            other => anyhow::bail!("unknown reservation status '{other}'"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reservation {
    pub id: String,
    pub user_id: String,
    pub device_id: String,
    pub status: ReservationStatus,
    /// ms since epoch.
    pub start_time: i64,
    /// ms since epoch; always `start_time + duration_minutes * 60000`.
    pub end_time: i64,
    pub duration_minutes: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub purpose: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub released_at: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SimSessionRow {
    pub id: i64,
    pub user_id: String,
    pub started_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<i64>,
    pub condition: String,
    pub settings_json: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

// ---------------------------------------------------------------------------
// Connection + migrations
// ---------------------------------------------------------------------------

impl Db {
    /// db_url examples: "sqlite:ventylab.db?mode=rwc", "sqlite::memory:".
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    /// Runs sqlx migrations from ./migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }

    // ----------------------------
    // Reservations
    // ----------------------------

    pub async fn insert_reservation(&self, r: &Reservation) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO reservations
              (id, user_id, device_id, status, start_ms, end_ms, duration_min, purpose, released_ms)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&r.id)
        .bind(&r.user_id)
        .bind(&r.device_id)
        .bind(r.status.as_str())
        .bind(r.start_time)
        .bind(r.end_time)
        .bind(r.duration_minutes)
        .bind(&r.purpose)
        .bind(r.released_at)
        .execute(&self.pool)
        .await
        .context("insert_reservation failed")?;
        Ok(())
    }

    /// The ACTIVE reservation for a device, if any. Callers are expected to
    /// run `expire_overdue` first so a stale lease can't be returned.
    pub async fn find_active(&self, device_id: &str) -> Result<Option<Reservation>> {
        let row = sqlx::query(
            r#"
            SELECT id, user_id, device_id, status, start_ms, end_ms, duration_min, purpose, released_ms
            FROM reservations
            WHERE device_id = ? AND status = 'ACTIVE'
            "#,
        )
        .bind(device_id)
        .fetch_optional(&self.pool)
        .await
        .context("find_active failed")?;

        row.map(reservation_from_row).transpose()
    }

    /// Flip every ACTIVE reservation whose end time has passed to EXPIRED.
    /// Returns how many rows expired.
    pub async fn expire_overdue(&self, device_id: &str, now_ms: i64) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE reservations
            SET status = 'EXPIRED'
            WHERE device_id = ? AND status = 'ACTIVE' AND end_ms < ?
            "#,
        )
        .bind(device_id)
        .bind(now_ms)
        .execute(&self.pool)
        .await
        .context("expire_overdue failed")?;
        Ok(result.rows_affected())
    }

    /// Mark a reservation COMPLETED with its release timestamp.
    pub async fn complete_reservation(&self, id: &str, released_ms: i64) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE reservations
            SET status = 'COMPLETED', released_ms = ?
            WHERE id = ?
            "#,
        )
        .bind(released_ms)
        .bind(id)
        .execute(&self.pool)
        .await
        .context("complete_reservation failed")?;
        Ok(())
    }

    // ----------------------------
    // Simulator sessions
    // ----------------------------

    pub async fn insert_session(
        &self,
        user_id: &str,
        started_ms: i64,
        ended_ms: Option<i64>,
        condition: &str,
        settings_json: &str,
        notes: Option<&str>,
    ) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO simulator_sessions (user_id, started_ms, ended_ms, condition, settings_json, notes)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(user_id)
        .bind(started_ms)
        .bind(ended_ms)
        .bind(condition)
        .bind(settings_json)
        .bind(notes)
        .execute(&self.pool)
        .await
        .context("insert_session failed")?;
        Ok(result.last_insert_rowid())
    }

    /// A user's saved sessions, most recent first.
    pub async fn list_sessions(&self, user_id: &str, limit: i64) -> Result<Vec<SimSessionRow>> {
        let rows = sqlx::query(
            r#"
            SELECT id, user_id, started_ms, ended_ms, condition, settings_json, notes
            FROM simulator_sessions
            WHERE user_id = ?
            ORDER BY started_ms DESC
            LIMIT ?
            "#,
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("list_sessions failed")?;

        rows.into_iter()
            .map(|row| {
                Ok(SimSessionRow {
                    id: row.try_get("id")?,
                    user_id: row.try_get("user_id")?,
                    started_at: row.try_get("started_ms")?,
                    ended_at: row.try_get("ended_ms")?,
                    condition: row.try_get("condition")?,
                    settings_json: row.try_get("settings_json")?,
                    notes: row.try_get("notes")?,
                })
            })
            .collect()
    }
}

fn reservation_from_row(row: sqlx::sqlite::SqliteRow) -> Result<Reservation> {
    let status: String = row.try_get("status")?;
    Ok(Reservation {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        device_id: row.try_get("device_id")?,
        status: ReservationStatus::parse(&status)?,
        start_time: row.try_get("start_ms")?,
        end_time: row.try_get("end_ms")?,
        duration_minutes: row.try_get("duration_min")?,
        purpose: row.try_get("purpose")?,
        released_at: row.try_get("released_ms")?,
    })
}

// ===========================================================================
// Tests
// ===========================================================================
