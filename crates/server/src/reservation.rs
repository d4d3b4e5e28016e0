//! Single-writer lease over the physical ventilator.
//!
//! At most one user holds the device at a time. Leases expire lazily: every
//! operation first flips overdue ACTIVE rows to EXPIRED, so nobody ever
//! observes a stale lease. Lifecycle events are broadcast to all connected
//! clients so dashboards stay in sync.

use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::db::{Db, Reservation, ReservationStatus};
use crate::gateway::{Gateway, EV_RELEASED, EV_RESERVED};
use crate::state::now_ms;

#[derive(Debug, Error)]
pub enum ReserveError {
    #[error("device reserved by {current_user}")]
    Conflict { current_user: String },
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum ReleaseError {
    #[error("no active reservation for this user")]
    NotFound,
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

pub struct ReservationManager {
    db: Db,
    device_id: String,
    gateway: Arc<Gateway>,
}

impl ReservationManager {
    pub fn new(db: Db, device_id: impl Into<String>, gateway: Arc<Gateway>) -> Self {
        Self {
            db,
            device_id: device_id.into(),
            gateway,
        }
    }

    /// Take (or recover) the device lease.
    ///
    /// A user who already holds the lease gets their existing reservation
    /// back, so a client reconnecting after a crash recovers cleanly instead
    /// of being locked out of its own session.
    pub async fn reserve(
        &self,
        user_id: &str,
        duration_minutes: i64,
        purpose: Option<String>,
    ) -> Result<Reservation, ReserveError> {
        let now = now_ms();
        self.db.expire_overdue(&self.device_id, now).await?;

        if let Some(existing) = self.db.find_active(&self.device_id).await? {
            if existing.user_id == user_id {
                info!(user = %user_id, id = %existing.id, "reservation recovered");
                return Ok(existing);
            }
            warn!(
                user = %user_id,
                holder = %existing.user_id,
                "reservation refused — device already held"
            );
            return Err(ReserveError::Conflict {
                current_user: existing.user_id,
            });
        }

        let reservation = Reservation {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            device_id: self.device_id.clone(),
            status: ReservationStatus::Active,
            start_time: now,
            end_time: now + duration_minutes * 60_000,
            duration_minutes,
            purpose,
            released_at: None,
        };
        self.db.insert_reservation(&reservation).await?;

        info!(
            user = %user_id,
            id = %reservation.id,
            duration_minutes,
            "device reserved"
        );
        if let Ok(data) = serde_json::to_value(&reservation) {
            self.gateway.broadcast(EV_RESERVED, &data).await;
        }
        Ok(reservation)
    }

    /// Give the lease back.
    pub async fn release(&self, user_id: &str) -> Result<Reservation, ReleaseError> {
        let now = now_ms();
        self.db.expire_overdue(&self.device_id, now).await?;

        let active = self
            .db
            .find_active(&self.device_id)
            .await?
            .filter(|r| r.user_id == user_id)
            .ok_or(ReleaseError::NotFound)?;

        self.db.complete_reservation(&active.id, now).await?;

        let mut released = active;
        released.status = ReservationStatus::Completed;
        released.released_at = Some(now);

        info!(user = %user_id, id = %released.id, "device released");
        if let Ok(data) = serde_json::to_value(&released) {
            self.gateway.broadcast(EV_RELEASED, &data).await;
        }
        Ok(released)
    }

    /// Current lease after lazy expiry; feeds the composed status report.
    pub async fn current(&self) -> anyhow::Result<Option<Reservation>> {
        self.db.expire_overdue(&self.device_id, now_ms()).await?;
        self.db.find_active(&self.device_id).await
    }

    /// Command authorization: a command may pass when nobody holds the
    /// device or the sender holds it themselves.
    pub async fn authorize_command(&self, user_id: &str) -> Result<(), ReserveError> {
        match self.current().await? {
            Some(r) if r.user_id != user_id => Err(ReserveError::Conflict {
                current_user: r.user_id,
            }),
            _ => Ok(()),
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
