//! Postgres-backed coordination store.
//!
//! Slot exclusivity lives in partial unique indexes over active appointments,
//! so two concurrent inserts for the same slot cannot both commit. Every
//! conditional write is a single statement carrying its precondition in the
//! `WHERE` clause; unique violations are translated into conflicts.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use uuid::Uuid;

use crate::core::{
    Appointment, AppointmentStatus, AppointmentStore, ClaimOutcome, ClaimStore, ConflictKind,
    DeviceToken, DeviceTokenStore, Message, MessageKind, MessageStore, MuteRule, MuteStore,
    NewAppointment, NewMessage, Party, ScheduleSource, SlotMove, StatusChange, StoreError,
    UpdateOutcome, WorkSchedule,
};
use crate::util::serde::{AppointmentId, MessageId, ResourceId, Slot, UserId};

const UNIQUE_VIOLATION: &str = "23505";

const APPOINTMENT_COLUMNS: &str = "id, resource_id, requester_id, provider_id, slot_date, slot_hour, \
     status, proposed_by, notes, cancellation_reason, created_at, updated_at";

const MESSAGE_COLUMNS: &str =
    "id, sender_id, receiver_id, resource_id, kind, payload, created_at, is_read, is_deleted";

/// Store adapter over a sqlx Postgres pool.
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Wrap an existing pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open a pool of at most `max_connections` to `url`.
    ///
    /// # Errors
    ///
    /// `Unavailable` when the database cannot be reached.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(map_sqlx)?;
        tracing::info!(max_connections, "postgres pool connected");
        Ok(Self { pool })
    }

    /// Apply [`PostgresStore::migrations`] in order.
    ///
    /// # Errors
    ///
    /// Propagates the first failing statement.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        for (step, sql) in Self::migrations().iter().enumerate() {
            sqlx::raw_sql(sql)
                .execute(&self.pool)
                .await
                .map_err(map_sqlx)?;
            tracing::debug!(step, "migration applied");
        }
        Ok(())
    }

    /// Close the pool, waiting for checked-out connections.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Migration statements.
    #[must_use]
    pub fn migrations() -> &'static [&'static str] {
        &[
            r"
CREATE TABLE IF NOT EXISTS sk_appointments (
    id BIGSERIAL PRIMARY KEY,
    resource_id UUID NOT NULL,
    requester_id UUID NOT NULL,
    provider_id UUID NOT NULL,
    slot_date DATE NOT NULL,
    slot_hour SMALLINT NOT NULL CHECK (slot_hour BETWEEN 0 AND 23),
    status TEXT NOT NULL,
    proposed_by TEXT NOT NULL,
    notes TEXT,
    cancellation_reason TEXT,
    created_at TIMESTAMPTZ NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS uq_sk_appointments_provider_slot
    ON sk_appointments (provider_id, slot_date, slot_hour)
    WHERE status IN ('pending', 'confirmed');
CREATE UNIQUE INDEX IF NOT EXISTS uq_sk_appointments_requester_slot
    ON sk_appointments (requester_id, slot_date, slot_hour)
    WHERE status IN ('pending', 'confirmed');
CREATE UNIQUE INDEX IF NOT EXISTS uq_sk_appointments_confirmed_triple
    ON sk_appointments (resource_id, requester_id, provider_id)
    WHERE status = 'confirmed';
CREATE INDEX IF NOT EXISTS idx_sk_appointments_provider_day
    ON sk_appointments (provider_id, slot_date);
",
            r"
CREATE TABLE IF NOT EXISTS sk_work_schedules (
    provider_id UUID PRIMARY KEY,
    start_time TIME NOT NULL,
    end_time TIME NOT NULL,
    CHECK (start_time < end_time)
);
CREATE TABLE IF NOT EXISTS sk_resource_claims (
    resource_id UUID PRIMARY KEY,
    owner_id UUID
);
",
            r"
CREATE TABLE IF NOT EXISTS sk_messages (
    id BIGSERIAL PRIMARY KEY,
    sender_id UUID NOT NULL,
    receiver_id UUID NOT NULL,
    resource_id UUID,
    kind JSONB NOT NULL,
    payload JSONB NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT clock_timestamp(),
    is_read BOOLEAN NOT NULL DEFAULT FALSE,
    is_deleted BOOLEAN NOT NULL DEFAULT FALSE
);
CREATE INDEX IF NOT EXISTS idx_sk_messages_pair
    ON sk_messages (LEAST(sender_id, receiver_id), GREATEST(sender_id, receiver_id), created_at, id);
CREATE TABLE IF NOT EXISTS sk_hidden_conversations (
    user_id UUID NOT NULL,
    other_user_id UUID NOT NULL,
    resource_key UUID NOT NULL,
    PRIMARY KEY (user_id, other_user_id, resource_key)
);
CREATE TABLE IF NOT EXISTS sk_mute_rules (
    user_id UUID NOT NULL,
    other_user_id UUID NOT NULL,
    resource_key UUID NOT NULL,
    is_muted BOOLEAN NOT NULL,
    muted_until TIMESTAMPTZ,
    PRIMARY KEY (user_id, other_user_id, resource_key)
);
CREATE TABLE IF NOT EXISTS sk_device_tokens (
    token TEXT PRIMARY KEY,
    user_id UUID NOT NULL,
    is_active BOOLEAN NOT NULL DEFAULT TRUE
);
",
        ]
    }

    /// Configure a provider's work window.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn set_schedule(&self, provider: UserId, schedule: WorkSchedule) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO sk_work_schedules (provider_id, start_time, end_time) VALUES ($1, $2, $3)
             ON CONFLICT (provider_id) DO UPDATE SET start_time = EXCLUDED.start_time, end_time = EXCLUDED.end_time",
        )
        .bind(provider)
        .bind(schedule.start)
        .bind(schedule.end)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    async fn slot_holder(
        &self,
        provider: UserId,
        requester: UserId,
        slot: Slot,
        except: Option<AppointmentId>,
    ) -> Result<Option<Appointment>, StoreError> {
        let sql = format!(
            "SELECT {APPOINTMENT_COLUMNS} FROM sk_appointments
             WHERE slot_date = $1 AND slot_hour = $2 AND status IN ('pending', 'confirmed')
               AND (provider_id = $3 OR requester_id = $4) AND id IS DISTINCT FROM $5
             ORDER BY (provider_id = $3) DESC LIMIT 1"
        );
        let row = sqlx::query(&sql)
            .bind(slot.date)
            .bind(i16::from(slot.hour))
            .bind(provider)
            .bind(requester)
            .bind(except)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?;
        row.as_ref().map(appointment_from_row).transpose()
    }

    async fn current_status(&self, id: AppointmentId) -> Result<UpdateOutcome, StoreError> {
        let status: Option<String> = sqlx::query_scalar("SELECT status FROM sk_appointments WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?;
        match status {
            Some(s) => Ok(UpdateOutcome::StatusMismatch(parse_status(&s)?)),
            None => Ok(UpdateOutcome::NotFound),
        }
    }
}

fn map_sqlx(err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::Tls(_)
        | sqlx::Error::WorkerCrashed => StoreError::Unavailable(err.to_string()),
        other => StoreError::Backend(other.to_string()),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.code().as_deref() == Some(UNIQUE_VIOLATION))
}

fn parse_status(s: &str) -> Result<AppointmentStatus, StoreError> {
    s.parse().map_err(StoreError::Corrupt)
}

fn resource_key(resource: Option<ResourceId>) -> Uuid {
    resource.unwrap_or_else(Uuid::nil)
}

fn get<'r, T>(row: &'r PgRow, column: &str) -> Result<T, StoreError>
where
    T: sqlx::Decode<'r, sqlx::Postgres> + sqlx::Type<sqlx::Postgres>,
{
    row.try_get(column)
        .map_err(|e| StoreError::Corrupt(format!("{column}: {e}")))
}

fn appointment_from_row(row: &PgRow) -> Result<Appointment, StoreError> {
    let hour: i16 = get(row, "slot_hour")?;
    let status: String = get(row, "status")?;
    let proposed_by: String = get(row, "proposed_by")?;
    let date: NaiveDate = get(row, "slot_date")?;
    Ok(Appointment {
        id: get(row, "id")?,
        resource_id: get(row, "resource_id")?,
        requester_id: get(row, "requester_id")?,
        provider_id: get(row, "provider_id")?,
        slot: Slot::new(
            date,
            u8::try_from(hour).map_err(|e| StoreError::Corrupt(e.to_string()))?,
        ),
        status: parse_status(&status)?,
        proposed_by: proposed_by.parse::<Party>().map_err(StoreError::Corrupt)?,
        notes: get(row, "notes")?,
        cancellation_reason: get(row, "cancellation_reason")?,
        created_at: get(row, "created_at")?,
        updated_at: get(row, "updated_at")?,
    })
}

fn message_from_row(row: &PgRow) -> Result<Message, StoreError> {
    let kind: serde_json::Value = get(row, "kind")?;
    Ok(Message {
        id: get(row, "id")?,
        sender_id: get(row, "sender_id")?,
        receiver_id: get(row, "receiver_id")?,
        resource_id: get(row, "resource_id")?,
        kind: serde_json::from_value::<MessageKind>(kind)
            .map_err(|e| StoreError::Corrupt(e.to_string()))?,
        payload: get(row, "payload")?,
        created_at: get(row, "created_at")?,
        is_read: get(row, "is_read")?,
        is_deleted: get(row, "is_deleted")?,
    })
}

#[async_trait]
impl AppointmentStore for PostgresStore {
    async fn reserve(&self, new: NewAppointment) -> Result<ClaimOutcome<Appointment>, StoreError> {
        let sql = format!(
            "INSERT INTO sk_appointments
                (resource_id, requester_id, provider_id, slot_date, slot_hour, status, proposed_by, notes, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, 'pending', $6, $7, $8, $8)
             ON CONFLICT DO NOTHING
             RETURNING {APPOINTMENT_COLUMNS}"
        );
        // A holder can vanish between the refused insert and the lookup; retry then.
        for _ in 0..3 {
            let inserted = sqlx::query(&sql)
                .bind(new.resource_id)
                .bind(new.requester_id)
                .bind(new.provider_id)
                .bind(new.slot.date)
                .bind(i16::from(new.slot.hour))
                .bind(new.proposed_by.as_str())
                .bind(new.notes.as_deref())
                .bind(new.created_at)
                .fetch_optional(&self.pool)
                .await
                .map_err(map_sqlx)?;
            if let Some(row) = inserted {
                return Ok(ClaimOutcome::Won(appointment_from_row(&row)?));
            }
            if let Some(holder) = self
                .slot_holder(new.provider_id, new.requester_id, new.slot, None)
                .await?
            {
                return Ok(ClaimOutcome::Held(holder));
            }
        }
        Err(StoreError::Backend("slot reservation kept racing".into()))
    }

    async fn get(&self, id: AppointmentId) -> Result<Option<Appointment>, StoreError> {
        let sql = format!("SELECT {APPOINTMENT_COLUMNS} FROM sk_appointments WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?;
        row.as_ref().map(appointment_from_row).transpose()
    }

    async fn change_status(
        &self,
        id: AppointmentId,
        change: StatusChange,
    ) -> Result<UpdateOutcome, StoreError> {
        let sql = format!(
            "UPDATE sk_appointments
             SET status = $2,
                 cancellation_reason = CASE WHEN $2 = 'cancelled' THEN $4 ELSE cancellation_reason END,
                 updated_at = $5
             WHERE id = $1 AND status = $3
             RETURNING {APPOINTMENT_COLUMNS}"
        );
        let result = sqlx::query(&sql)
            .bind(id)
            .bind(change.to.as_str())
            .bind(change.from.as_str())
            .bind(change.cancellation_reason.as_deref())
            .bind(change.at)
            .fetch_optional(&self.pool)
            .await;
        match result {
            Ok(Some(row)) => Ok(UpdateOutcome::Updated(appointment_from_row(&row)?)),
            Ok(None) => self.current_status(id).await,
            Err(err) if is_unique_violation(&err) => {
                let Some(current) = self.get(id).await? else {
                    return Ok(UpdateOutcome::NotFound);
                };
                let existing = self
                    .confirmed_for(current.resource_id, current.requester_id, current.provider_id)
                    .await?;
                Ok(UpdateOutcome::Conflict(ConflictKind::ConfirmedExists {
                    existing: existing.map_or(id, |a| a.id),
                }))
            }
            Err(err) => Err(map_sqlx(err)),
        }
    }

    async fn move_slot(&self, id: AppointmentId, mv: SlotMove) -> Result<UpdateOutcome, StoreError> {
        let sql = format!(
            "UPDATE sk_appointments
             SET slot_date = $3, slot_hour = $4, status = $5, notes = COALESCE($6, notes),
                 proposed_by = $8, updated_at = $7
             WHERE id = $1 AND status = $2
             RETURNING {APPOINTMENT_COLUMNS}"
        );
        let result = sqlx::query(&sql)
            .bind(id)
            .bind(mv.from.as_str())
            .bind(mv.slot.date)
            .bind(i16::from(mv.slot.hour))
            .bind(mv.to.as_str())
            .bind(mv.notes.as_deref())
            .bind(mv.at)
            .bind(mv.proposed_by.as_str())
            .fetch_optional(&self.pool)
            .await;
        match result {
            Ok(Some(row)) => Ok(UpdateOutcome::Updated(appointment_from_row(&row)?)),
            Ok(None) => self.current_status(id).await,
            Err(err) if is_unique_violation(&err) => {
                let Some(current) = self.get(id).await? else {
                    return Ok(UpdateOutcome::NotFound);
                };
                let holder = self
                    .slot_holder(current.provider_id, current.requester_id, mv.slot, Some(id))
                    .await?;
                let kind = match holder {
                    Some(h) if h.provider_id != current.provider_id => {
                        ConflictKind::RequesterBusy { slot: mv.slot }
                    }
                    other => ConflictKind::SlotOccupied {
                        slot: mv.slot,
                        holder: other.map(|h| h.id),
                    },
                };
                Ok(UpdateOutcome::Conflict(kind))
            }
            Err(err) => Err(map_sqlx(err)),
        }
    }

    async fn cancel_pending_for(
        &self,
        resource: ResourceId,
        requester: UserId,
        provider: UserId,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<Vec<AppointmentId>, StoreError> {
        sqlx::query_scalar(
            "UPDATE sk_appointments
             SET status = 'cancelled', cancellation_reason = $4, updated_at = $5
             WHERE resource_id = $1 AND requester_id = $2 AND provider_id = $3 AND status = 'pending'
             RETURNING id",
        )
        .bind(resource)
        .bind(requester)
        .bind(provider)
        .bind(reason)
        .bind(at)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)
    }

    async fn active_for_provider_on(
        &self,
        provider: UserId,
        date: NaiveDate,
    ) -> Result<Vec<Appointment>, StoreError> {
        let sql = format!(
            "SELECT {APPOINTMENT_COLUMNS} FROM sk_appointments
             WHERE provider_id = $1 AND slot_date = $2 AND status IN ('pending', 'confirmed')
             ORDER BY slot_hour"
        );
        let rows = sqlx::query(&sql)
            .bind(provider)
            .bind(date)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)?;
        rows.iter().map(appointment_from_row).collect()
    }

    async fn confirmed_for(
        &self,
        resource: ResourceId,
        requester: UserId,
        provider: UserId,
    ) -> Result<Option<Appointment>, StoreError> {
        let sql = format!(
            "SELECT {APPOINTMENT_COLUMNS} FROM sk_appointments
             WHERE resource_id = $1 AND requester_id = $2 AND provider_id = $3 AND status = 'confirmed'"
        );
        let row = sqlx::query(&sql)
            .bind(resource)
            .bind(requester)
            .bind(provider)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?;
        row.as_ref().map(appointment_from_row).transpose()
    }

    async fn list_for_user(&self, user: UserId) -> Result<Vec<Appointment>, StoreError> {
        let sql = format!(
            "SELECT {APPOINTMENT_COLUMNS} FROM sk_appointments
             WHERE requester_id = $1 OR provider_id = $1
             ORDER BY slot_date DESC, slot_hour DESC, id DESC"
        );
        let rows = sqlx::query(&sql)
            .bind(user)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)?;
        rows.iter().map(appointment_from_row).collect()
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(())
    }
}

#[async_trait]
impl ScheduleSource for PostgresStore {
    async fn work_schedule(&self, provider: UserId) -> Result<Option<WorkSchedule>, StoreError> {
        let row: Option<(NaiveTime, NaiveTime)> = sqlx::query_as(
            "SELECT start_time, end_time FROM sk_work_schedules WHERE provider_id = $1",
        )
        .bind(provider)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)?;
        row.map(|(start, end)| WorkSchedule::new(start, end).map_err(StoreError::Corrupt))
            .transpose()
    }
}

#[async_trait]
impl ClaimStore for PostgresStore {
    async fn try_claim(
        &self,
        resource: ResourceId,
        claimant: UserId,
    ) -> Result<ClaimOutcome<UserId>, StoreError> {
        let won: Option<Uuid> = sqlx::query_scalar(
            "INSERT INTO sk_resource_claims (resource_id, owner_id) VALUES ($1, $2)
             ON CONFLICT (resource_id) DO UPDATE SET owner_id = EXCLUDED.owner_id
             WHERE sk_resource_claims.owner_id IS NULL
             RETURNING owner_id",
        )
        .bind(resource)
        .bind(claimant)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)?;
        if won.is_some() {
            return Ok(ClaimOutcome::Won(claimant));
        }
        match self.owner(resource).await? {
            Some(owner) => Ok(ClaimOutcome::Held(owner)),
            None => Err(StoreError::Backend(format!(
                "claim on {resource} refused without an owner"
            ))),
        }
    }

    async fn owner(&self, resource: ResourceId) -> Result<Option<UserId>, StoreError> {
        let owner: Option<Option<Uuid>> =
            sqlx::query_scalar("SELECT owner_id FROM sk_resource_claims WHERE resource_id = $1")
                .bind(resource)
                .fetch_optional(&self.pool)
                .await
                .map_err(map_sqlx)?;
        Ok(owner.flatten())
    }

    async fn override_owner(
        &self,
        resource: ResourceId,
        owner: Option<UserId>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO sk_resource_claims (resource_id, owner_id) VALUES ($1, $2)
             ON CONFLICT (resource_id) DO UPDATE SET owner_id = EXCLUDED.owner_id",
        )
        .bind(resource)
        .bind(owner)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }
}

#[async_trait]
impl MessageStore for PostgresStore {
    async fn insert(&self, message: NewMessage) -> Result<Message, StoreError> {
        let kind = serde_json::to_value(message.kind).map_err(|e| StoreError::Backend(e.to_string()))?;
        let sql = format!(
            "INSERT INTO sk_messages (sender_id, receiver_id, resource_id, kind, payload)
             VALUES ($1, $2, $3, $4, $5)
             RETURNING {MESSAGE_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(message.sender_id)
            .bind(message.receiver_id)
            .bind(message.resource_id)
            .bind(kind)
            .bind(&message.payload)
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx)?;
        message_from_row(&row)
    }

    async fn conversation(
        &self,
        a: UserId,
        b: UserId,
        resource: Option<ResourceId>,
        include_deleted: bool,
    ) -> Result<Vec<Message>, StoreError> {
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM sk_messages
             WHERE ((sender_id = $1 AND receiver_id = $2) OR (sender_id = $2 AND receiver_id = $1))
               AND resource_id IS NOT DISTINCT FROM $3
               AND ($4 OR NOT is_deleted)
             ORDER BY created_at, id"
        );
        let rows = sqlx::query(&sql)
            .bind(a)
            .bind(b)
            .bind(resource)
            .bind(include_deleted)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)?;
        rows.iter().map(message_from_row).collect()
    }

    async fn mark_read(
        &self,
        reader: UserId,
        other: UserId,
        resource: Option<ResourceId>,
    ) -> Result<u64, StoreError> {
        let done = sqlx::query(
            "UPDATE sk_messages SET is_read = TRUE
             WHERE receiver_id = $1 AND sender_id = $2 AND resource_id IS NOT DISTINCT FROM $3 AND NOT is_read",
        )
        .bind(reader)
        .bind(other)
        .bind(resource)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(done.rows_affected())
    }

    async fn soft_delete(&self, id: MessageId, sender: UserId) -> Result<bool, StoreError> {
        let done = sqlx::query(
            "UPDATE sk_messages SET is_deleted = TRUE WHERE id = $1 AND sender_id = $2 AND NOT is_deleted",
        )
        .bind(id)
        .bind(sender)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(done.rows_affected() > 0)
    }

    async fn hide_conversation(
        &self,
        user: UserId,
        other: UserId,
        resource: Option<ResourceId>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO sk_hidden_conversations (user_id, other_user_id, resource_key)
             VALUES ($1, $2, $3) ON CONFLICT DO NOTHING",
        )
        .bind(user)
        .bind(other)
        .bind(resource_key(resource))
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    async fn unhide_conversation(
        &self,
        user: UserId,
        other: UserId,
        resource: Option<ResourceId>,
    ) -> Result<bool, StoreError> {
        let done = sqlx::query(
            "DELETE FROM sk_hidden_conversations WHERE user_id = $1 AND other_user_id = $2 AND resource_key = $3",
        )
        .bind(user)
        .bind(other)
        .bind(resource_key(resource))
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(done.rows_affected() > 0)
    }
}

#[async_trait]
impl MuteStore for PostgresStore {
    async fn mute_rule(
        &self,
        user: UserId,
        other: UserId,
        resource: Option<ResourceId>,
    ) -> Result<Option<MuteRule>, StoreError> {
        let row: Option<(Uuid, bool, Option<DateTime<Utc>>)> = sqlx::query_as(
            "SELECT resource_key, is_muted, muted_until FROM sk_mute_rules
             WHERE user_id = $1 AND other_user_id = $2 AND resource_key IN ($3, $4)
             ORDER BY (resource_key = $4) ASC LIMIT 1",
        )
        .bind(user)
        .bind(other)
        .bind(resource_key(resource))
        .bind(Uuid::nil())
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(row.map(|(key, is_muted, muted_until)| MuteRule {
            user_id: user,
            other_user_id: other,
            resource_id: (!key.is_nil()).then_some(key),
            is_muted,
            muted_until,
        }))
    }

    async fn set_mute(&self, rule: MuteRule) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO sk_mute_rules (user_id, other_user_id, resource_key, is_muted, muted_until)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (user_id, other_user_id, resource_key)
             DO UPDATE SET is_muted = EXCLUDED.is_muted, muted_until = EXCLUDED.muted_until",
        )
        .bind(rule.user_id)
        .bind(rule.other_user_id)
        .bind(resource_key(rule.resource_id))
        .bind(rule.is_muted)
        .bind(rule.muted_until)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    async fn clear_mute(
        &self,
        user: UserId,
        other: UserId,
        resource: Option<ResourceId>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "DELETE FROM sk_mute_rules WHERE user_id = $1 AND other_user_id = $2 AND resource_key = $3",
        )
        .bind(user)
        .bind(other)
        .bind(resource_key(resource))
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }
}

#[async_trait]
impl DeviceTokenStore for PostgresStore {
    async fn active_tokens(&self, user: UserId) -> Result<Vec<DeviceToken>, StoreError> {
        let tokens: Vec<String> = sqlx::query_scalar(
            "SELECT token FROM sk_device_tokens WHERE user_id = $1 AND is_active ORDER BY token",
        )
        .bind(user)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(tokens
            .into_iter()
            .map(|token| DeviceToken { user_id: user, token })
            .collect())
    }

    async fn register(&self, user: UserId, token: &str) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO sk_device_tokens (token, user_id, is_active) VALUES ($1, $2, TRUE)
             ON CONFLICT (token) DO UPDATE SET user_id = EXCLUDED.user_id, is_active = TRUE",
        )
        .bind(token)
        .bind(user)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    async fn deactivate(&self, token: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE sk_device_tokens SET is_active = FALSE WHERE token = $1")
            .bind(token)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(())
    }
}
