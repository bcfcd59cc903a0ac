//! In-process store for appointments, claims, schedules and messages.
//!
//! One `parking_lot::Mutex` guards all tables, so every conditional write is
//! atomic with respect to every other operation on the same store.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;

use crate::core::{
    Appointment, AppointmentStatus, AppointmentStore, ClaimOutcome, ClaimStore, ConflictKind,
    ConversationKey, DeviceToken, DeviceTokenStore, Message, MessageStore, MuteRule, MuteStore,
    NewAppointment, NewMessage, ScheduleSource, SlotMove, StatusChange, StoreError, UpdateOutcome,
    WorkSchedule,
};
use crate::util::clock::Clock;
use crate::util::serde::{AppointmentId, MessageId, ResourceId, Slot, UserId};

type MuteKey = (UserId, UserId, Option<ResourceId>);

#[derive(Default)]
struct Tables {
    next_appointment_id: AppointmentId,
    appointments: BTreeMap<AppointmentId, Appointment>,
    schedules: HashMap<UserId, WorkSchedule>,
    owners: HashMap<ResourceId, UserId>,
    next_message_id: MessageId,
    messages: Vec<Message>,
    hidden: HashSet<(UserId, ConversationKey)>,
    mutes: HashMap<MuteKey, MuteRule>,
    tokens: HashMap<String, (UserId, bool)>,
}

impl Tables {
    fn slot_holder(
        &self,
        provider: UserId,
        requester: UserId,
        slot: Slot,
        except: Option<AppointmentId>,
    ) -> Option<&Appointment> {
        self.appointments.values().find(|a| {
            Some(a.id) != except
                && a.status.is_active()
                && a.slot == slot
                && (a.provider_id == provider || a.requester_id == requester)
        })
    }

    fn confirmed_of(
        &self,
        resource: ResourceId,
        requester: UserId,
        provider: UserId,
        except: Option<AppointmentId>,
    ) -> Option<&Appointment> {
        self.appointments.values().find(|a| {
            Some(a.id) != except
                && a.status == AppointmentStatus::Confirmed
                && a.resource_id == resource
                && a.requester_id == requester
                && a.provider_id == provider
        })
    }
}

/// In-memory implementation of the coordination stores.
///
/// Flip [`MemoryStore::set_available`] to simulate an outage: every call then
/// fails with [`StoreError::Unavailable`].
pub struct MemoryStore {
    tables: Mutex<Tables>,
    available: AtomicBool,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    /// Create an empty store stamping records with `clock`.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            available: AtomicBool::new(true),
            clock,
        }
    }

    /// Simulate the store going down or coming back.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Configure a provider's work window.
    pub fn set_schedule(&self, provider: UserId, schedule: WorkSchedule) {
        self.tables.lock().schedules.insert(provider, schedule);
    }

    /// Number of stored appointments, any status.
    #[must_use]
    pub fn appointment_count(&self) -> usize {
        self.tables.lock().appointments.len()
    }

    /// Whether `user` currently hides the conversation.
    #[must_use]
    pub fn is_hidden(&self, user: UserId, other: UserId, resource: Option<ResourceId>) -> bool {
        self.tables
            .lock()
            .hidden
            .contains(&(user, ConversationKey::new(user, other, resource)))
    }

    /// Whether `token` is registered and active.
    #[must_use]
    pub fn token_active(&self, token: &str) -> bool {
        self.tables
            .lock()
            .tokens
            .get(token)
            .is_some_and(|(_, active)| *active)
    }

    fn guard(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("memory store offline".into()))
        }
    }
}

#[async_trait]
impl AppointmentStore for MemoryStore {
    async fn reserve(&self, new: NewAppointment) -> Result<ClaimOutcome<Appointment>, StoreError> {
        self.guard()?;
        let mut tables = self.tables.lock();
        if let Some(holder) = tables.slot_holder(new.provider_id, new.requester_id, new.slot, None) {
            return Ok(ClaimOutcome::Held(holder.clone()));
        }
        tables.next_appointment_id += 1;
        let appointment = Appointment {
            id: tables.next_appointment_id,
            resource_id: new.resource_id,
            requester_id: new.requester_id,
            provider_id: new.provider_id,
            slot: new.slot,
            status: AppointmentStatus::Pending,
            proposed_by: new.proposed_by,
            notes: new.notes,
            cancellation_reason: None,
            created_at: new.created_at,
            updated_at: new.created_at,
        };
        tables.appointments.insert(appointment.id, appointment.clone());
        Ok(ClaimOutcome::Won(appointment))
    }

    async fn get(&self, id: AppointmentId) -> Result<Option<Appointment>, StoreError> {
        self.guard()?;
        Ok(self.tables.lock().appointments.get(&id).cloned())
    }

    async fn change_status(
        &self,
        id: AppointmentId,
        change: StatusChange,
    ) -> Result<UpdateOutcome, StoreError> {
        self.guard()?;
        let mut tables = self.tables.lock();
        let Some(current) = tables.appointments.get(&id) else {
            return Ok(UpdateOutcome::NotFound);
        };
        if current.status != change.from {
            return Ok(UpdateOutcome::StatusMismatch(current.status));
        }
        if change.to == AppointmentStatus::Confirmed {
            let (resource, requester, provider) =
                (current.resource_id, current.requester_id, current.provider_id);
            if let Some(existing) = tables.confirmed_of(resource, requester, provider, Some(id)) {
                return Ok(UpdateOutcome::Conflict(ConflictKind::ConfirmedExists {
                    existing: existing.id,
                }));
            }
        }
        let Some(appointment) = tables.appointments.get_mut(&id) else {
            return Ok(UpdateOutcome::NotFound);
        };
        appointment.status = change.to;
        if change.to == AppointmentStatus::Cancelled {
            appointment.cancellation_reason = change.cancellation_reason;
        }
        appointment.updated_at = change.at;
        Ok(UpdateOutcome::Updated(appointment.clone()))
    }

    async fn move_slot(&self, id: AppointmentId, mv: SlotMove) -> Result<UpdateOutcome, StoreError> {
        self.guard()?;
        let mut tables = self.tables.lock();
        let Some(current) = tables.appointments.get(&id) else {
            return Ok(UpdateOutcome::NotFound);
        };
        if current.status != mv.from {
            return Ok(UpdateOutcome::StatusMismatch(current.status));
        }
        let provider = current.provider_id;
        if let Some(holder) = tables.slot_holder(provider, current.requester_id, mv.slot, Some(id)) {
            let kind = if holder.provider_id == provider {
                ConflictKind::SlotOccupied {
                    slot: mv.slot,
                    holder: Some(holder.id),
                }
            } else {
                ConflictKind::RequesterBusy { slot: mv.slot }
            };
            return Ok(UpdateOutcome::Conflict(kind));
        }
        let Some(appointment) = tables.appointments.get_mut(&id) else {
            return Ok(UpdateOutcome::NotFound);
        };
        appointment.slot = mv.slot;
        appointment.status = mv.to;
        appointment.proposed_by = mv.proposed_by;
        if mv.notes.is_some() {
            appointment.notes = mv.notes;
        }
        appointment.updated_at = mv.at;
        Ok(UpdateOutcome::Updated(appointment.clone()))
    }

    async fn cancel_pending_for(
        &self,
        resource: ResourceId,
        requester: UserId,
        provider: UserId,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<Vec<AppointmentId>, StoreError> {
        self.guard()?;
        let mut tables = self.tables.lock();
        let mut cancelled = Vec::new();
        for appointment in tables.appointments.values_mut() {
            if appointment.status == AppointmentStatus::Pending
                && appointment.resource_id == resource
                && appointment.requester_id == requester
                && appointment.provider_id == provider
            {
                appointment.status = AppointmentStatus::Cancelled;
                appointment.cancellation_reason = Some(reason.to_string());
                appointment.updated_at = at;
                cancelled.push(appointment.id);
            }
        }
        Ok(cancelled)
    }

    async fn active_for_provider_on(
        &self,
        provider: UserId,
        date: NaiveDate,
    ) -> Result<Vec<Appointment>, StoreError> {
        self.guard()?;
        Ok(self
            .tables
            .lock()
            .appointments
            .values()
            .filter(|a| a.provider_id == provider && a.slot.date == date && a.status.is_active())
            .cloned()
            .collect())
    }

    async fn confirmed_for(
        &self,
        resource: ResourceId,
        requester: UserId,
        provider: UserId,
    ) -> Result<Option<Appointment>, StoreError> {
        self.guard()?;
        Ok(self
            .tables
            .lock()
            .confirmed_of(resource, requester, provider, None)
            .cloned())
    }

    async fn list_for_user(&self, user: UserId) -> Result<Vec<Appointment>, StoreError> {
        self.guard()?;
        let mut found: Vec<Appointment> = self
            .tables
            .lock()
            .appointments
            .values()
            .filter(|a| a.requester_id == user || a.provider_id == user)
            .cloned()
            .collect();
        found.sort_by(|a, b| b.slot.cmp(&a.slot).then(b.id.cmp(&a.id)));
        Ok(found)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.guard()
    }
}

#[async_trait]
impl ScheduleSource for MemoryStore {
    async fn work_schedule(&self, provider: UserId) -> Result<Option<WorkSchedule>, StoreError> {
        self.guard()?;
        Ok(self.tables.lock().schedules.get(&provider).copied())
    }
}

#[async_trait]
impl ClaimStore for MemoryStore {
    async fn try_claim(
        &self,
        resource: ResourceId,
        claimant: UserId,
    ) -> Result<ClaimOutcome<UserId>, StoreError> {
        self.guard()?;
        let mut tables = self.tables.lock();
        match tables.owners.get(&resource) {
            Some(owner) => Ok(ClaimOutcome::Held(*owner)),
            None => {
                tables.owners.insert(resource, claimant);
                Ok(ClaimOutcome::Won(claimant))
            }
        }
    }

    async fn owner(&self, resource: ResourceId) -> Result<Option<UserId>, StoreError> {
        self.guard()?;
        Ok(self.tables.lock().owners.get(&resource).copied())
    }

    async fn override_owner(
        &self,
        resource: ResourceId,
        owner: Option<UserId>,
    ) -> Result<(), StoreError> {
        self.guard()?;
        let mut tables = self.tables.lock();
        match owner {
            Some(owner) => tables.owners.insert(resource, owner),
            None => tables.owners.remove(&resource),
        };
        Ok(())
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn insert(&self, message: NewMessage) -> Result<Message, StoreError> {
        self.guard()?;
        let now = self.clock.now_utc();
        let mut tables = self.tables.lock();
        // Keep (created_at, id) aligned with insertion order even if the clock steps back.
        let created_at = tables
            .messages
            .last()
            .map_or(now, |last| last.created_at.max(now));
        tables.next_message_id += 1;
        let stored = Message {
            id: tables.next_message_id,
            sender_id: message.sender_id,
            receiver_id: message.receiver_id,
            resource_id: message.resource_id,
            kind: message.kind,
            payload: message.payload,
            created_at,
            is_read: false,
            is_deleted: false,
        };
        tables.messages.push(stored.clone());
        Ok(stored)
    }

    async fn conversation(
        &self,
        a: UserId,
        b: UserId,
        resource: Option<ResourceId>,
        include_deleted: bool,
    ) -> Result<Vec<Message>, StoreError> {
        self.guard()?;
        let key = ConversationKey::new(a, b, resource);
        let mut found: Vec<Message> = self
            .tables
            .lock()
            .messages
            .iter()
            .filter(|m| m.conversation() == key && (include_deleted || !m.is_deleted))
            .cloned()
            .collect();
        found.sort_by_key(Message::ordering_key);
        Ok(found)
    }

    async fn mark_read(
        &self,
        reader: UserId,
        other: UserId,
        resource: Option<ResourceId>,
    ) -> Result<u64, StoreError> {
        self.guard()?;
        let mut marked = 0;
        for message in &mut self.tables.lock().messages {
            if message.receiver_id == reader
                && message.sender_id == other
                && message.resource_id == resource
                && !message.is_read
            {
                message.is_read = true;
                marked += 1;
            }
        }
        Ok(marked)
    }

    async fn soft_delete(&self, id: MessageId, sender: UserId) -> Result<bool, StoreError> {
        self.guard()?;
        let mut tables = self.tables.lock();
        let target = tables
            .messages
            .iter_mut()
            .find(|m| m.id == id && m.sender_id == sender && !m.is_deleted);
        Ok(target.map(|m| m.is_deleted = true).is_some())
    }

    async fn hide_conversation(
        &self,
        user: UserId,
        other: UserId,
        resource: Option<ResourceId>,
    ) -> Result<(), StoreError> {
        self.guard()?;
        self.tables
            .lock()
            .hidden
            .insert((user, ConversationKey::new(user, other, resource)));
        Ok(())
    }

    async fn unhide_conversation(
        &self,
        user: UserId,
        other: UserId,
        resource: Option<ResourceId>,
    ) -> Result<bool, StoreError> {
        self.guard()?;
        Ok(self
            .tables
            .lock()
            .hidden
            .remove(&(user, ConversationKey::new(user, other, resource))))
    }
}

#[async_trait]
impl MuteStore for MemoryStore {
    async fn mute_rule(
        &self,
        user: UserId,
        other: UserId,
        resource: Option<ResourceId>,
    ) -> Result<Option<MuteRule>, StoreError> {
        self.guard()?;
        let tables = self.tables.lock();
        let scoped = resource.and_then(|r| tables.mutes.get(&(user, other, Some(r))));
        Ok(scoped
            .or_else(|| tables.mutes.get(&(user, other, None)))
            .cloned())
    }

    async fn set_mute(&self, rule: MuteRule) -> Result<(), StoreError> {
        self.guard()?;
        self.tables
            .lock()
            .mutes
            .insert((rule.user_id, rule.other_user_id, rule.resource_id), rule);
        Ok(())
    }

    async fn clear_mute(
        &self,
        user: UserId,
        other: UserId,
        resource: Option<ResourceId>,
    ) -> Result<(), StoreError> {
        self.guard()?;
        self.tables.lock().mutes.remove(&(user, other, resource));
        Ok(())
    }
}

#[async_trait]
impl DeviceTokenStore for MemoryStore {
    async fn active_tokens(&self, user: UserId) -> Result<Vec<DeviceToken>, StoreError> {
        self.guard()?;
        let mut tokens: Vec<DeviceToken> = self
            .tables
            .lock()
            .tokens
            .iter()
            .filter(|(_, (owner, active))| *owner == user && *active)
            .map(|(token, (owner, _))| DeviceToken {
                user_id: *owner,
                token: token.clone(),
            })
            .collect();
        tokens.sort_by(|a, b| a.token.cmp(&b.token));
        Ok(tokens)
    }

    async fn register(&self, user: UserId, token: &str) -> Result<(), StoreError> {
        self.guard()?;
        self.tables
            .lock()
            .tokens
            .insert(token.to_string(), (user, true));
        Ok(())
    }

    async fn deactivate(&self, token: &str) -> Result<(), StoreError> {
        self.guard()?;
        if let Some((_, active)) = self.tables.lock().tokens.get_mut(token) {
            *active = false;
        }
        Ok(())
    }
}
