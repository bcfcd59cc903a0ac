//! Conversation message delivery and push notification dispatch.
//!
//! `deliver` persists first and broadcasts second, so no participant can see a
//! message that is not durably stored. Everything after the broadcast (unhiding
//! the thread, push fan-out, dead-token cleanup) is best-effort: failures are
//! logged and never fail the delivery.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::engine::{AppointmentEvent, EventSink};
use crate::core::error::{CoordError, StoreError};
use crate::core::spawn::Spawn;
use crate::util::clock::Clock;
use crate::util::serde::{AppointmentId, MessageId, ResourceId, UserId};

/// Lock table size above which idle conversation locks are pruned.
const LOCK_TABLE_PRUNE_AT: usize = 1024;

/// Record a card message points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "id")]
pub enum CardRef {
    /// An appointment, rendered with its current status.
    Appointment(AppointmentId),
    /// A listing.
    Listing(ResourceId),
}

/// Kind of conversation message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "card")]
pub enum MessageKind {
    /// Plain text.
    Text,
    /// Uploaded file; the payload holds its location.
    File,
    /// Structured card.
    Card(CardRef),
}

/// A message to be stored and delivered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewMessage {
    /// Author.
    pub sender_id: UserId,
    /// Recipient.
    pub receiver_id: UserId,
    /// Listing the conversation is about, if any.
    pub resource_id: Option<ResourceId>,
    /// Kind of message.
    pub kind: MessageKind,
    /// Body: text, file location or card fields.
    pub payload: serde_json::Value,
}

impl NewMessage {
    /// Plain text message.
    pub fn text(
        sender_id: UserId,
        receiver_id: UserId,
        resource_id: Option<ResourceId>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            sender_id,
            receiver_id,
            resource_id,
            kind: MessageKind::Text,
            payload: serde_json::Value::String(body.into()),
        }
    }
}

/// A stored message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Monotonic identifier, the tiebreaker within equal timestamps.
    pub id: MessageId,
    /// Author.
    pub sender_id: UserId,
    /// Recipient.
    pub receiver_id: UserId,
    /// Listing the conversation is about, if any.
    pub resource_id: Option<ResourceId>,
    /// Kind of message.
    pub kind: MessageKind,
    /// Body.
    pub payload: serde_json::Value,
    /// Store timestamp.
    pub created_at: DateTime<Utc>,
    /// Whether the recipient has read it.
    pub is_read: bool,
    /// Soft-delete flag.
    pub is_deleted: bool,
}

impl Message {
    /// Conversation this message belongs to.
    #[must_use]
    pub fn conversation(&self) -> ConversationKey {
        ConversationKey::new(self.sender_id, self.receiver_id, self.resource_id)
    }

    /// Total order of messages within a conversation.
    #[must_use]
    pub const fn ordering_key(&self) -> (DateTime<Utc>, MessageId) {
        (self.created_at, self.id)
    }
}

/// Unordered participant pair plus optional resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversationKey {
    /// Smaller participant id.
    pub low: UserId,
    /// Larger participant id.
    pub high: UserId,
    /// Listing scope.
    pub resource_id: Option<ResourceId>,
}

impl ConversationKey {
    /// Key for the conversation between `a` and `b` about `resource_id`.
    #[must_use]
    pub fn new(a: UserId, b: UserId, resource_id: Option<ResourceId>) -> Self {
        let (low, high) = if a <= b { (a, b) } else { (b, a) };
        Self {
            low,
            high,
            resource_id,
        }
    }
}

/// Push suppression setting of `user_id` towards `other_user_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MuteRule {
    /// User who muted.
    pub user_id: UserId,
    /// Counterpart being muted.
    pub other_user_id: UserId,
    /// Listing scope; `None` mutes the counterpart everywhere.
    pub resource_id: Option<ResourceId>,
    /// Whether the rule is switched on.
    pub is_muted: bool,
    /// End of the mute; `None` means until unmuted.
    pub muted_until: Option<DateTime<Utc>>,
}

impl MuteRule {
    /// Whether the rule suppresses pushes at `now`.
    #[must_use]
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.is_muted && self.muted_until.is_none_or(|until| until > now)
    }
}

/// A push-capable device registration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceToken {
    /// Owner of the device.
    pub user_id: UserId,
    /// Gateway token.
    pub token: String,
}

/// Notification handed to the push gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushNotification {
    /// Title line.
    pub title: String,
    /// Body text.
    pub body: String,
    /// Data the client uses to open the conversation.
    pub data: serde_json::Value,
}

impl PushNotification {
    /// Notification announcing `message`.
    #[must_use]
    pub fn for_message(message: &Message) -> Self {
        let body = match (&message.kind, &message.payload) {
            (MessageKind::Text, serde_json::Value::String(text)) => text.clone(),
            (MessageKind::File, _) => "Sent you a file".to_string(),
            (MessageKind::Card(CardRef::Appointment(_)), payload) => payload
                .get("summary")
                .and_then(serde_json::Value::as_str)
                .unwrap_or("Appointment update")
                .to_string(),
            (MessageKind::Card(CardRef::Listing(_)), _) => "Shared a listing".to_string(),
            (MessageKind::Text, other) => other.to_string(),
        };
        Self {
            title: "New message".to_string(),
            body,
            data: serde_json::json!({
                "message_id": message.id,
                "sender_id": message.sender_id,
                "resource_id": message.resource_id,
            }),
        }
    }
}

/// Per-token delivery status reported by the push gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PushStatus {
    /// Accepted by the gateway.
    Delivered,
    /// Permanently invalid; the token should not be used again.
    InvalidToken,
    /// Transient failure.
    Failed(String),
}

/// What happened to the push side of a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PushDecision {
    /// The receiver muted the sender.
    Muted,
    /// The receiver has no active device.
    NoDevices,
    /// Push fan-out was scheduled to this many tokens.
    Dispatched {
        /// Number of active tokens targeted.
        tokens: usize,
    },
    /// Device lookup failed; no push was sent.
    LookupFailed,
}

/// Outcome of one delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryReport {
    /// The persisted message.
    pub message: Message,
    /// Whether the sender's channel received it.
    pub broadcast_sender: bool,
    /// Whether the receiver's channel received it.
    pub broadcast_receiver: bool,
    /// Whether the receiver's hidden flag was cleared.
    pub unhidden: bool,
    /// Push outcome.
    pub push: PushDecision,
}

/// Durable message storage.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Persist a message, assigning a monotonic id and a timestamp.
    async fn insert(&self, message: NewMessage) -> Result<Message, StoreError>;

    /// Messages between `a` and `b` about `resource`, ordered by `(created_at, id)`.
    async fn conversation(
        &self,
        a: UserId,
        b: UserId,
        resource: Option<ResourceId>,
        include_deleted: bool,
    ) -> Result<Vec<Message>, StoreError>;

    /// Mark everything `other` sent to `reader` in the conversation as read.
    async fn mark_read(
        &self,
        reader: UserId,
        other: UserId,
        resource: Option<ResourceId>,
    ) -> Result<u64, StoreError>;

    /// Soft-delete a message authored by `sender`. Returns whether a row changed.
    async fn soft_delete(&self, id: MessageId, sender: UserId) -> Result<bool, StoreError>;

    /// Hide the conversation from `user`'s list.
    async fn hide_conversation(
        &self,
        user: UserId,
        other: UserId,
        resource: Option<ResourceId>,
    ) -> Result<(), StoreError>;

    /// Clear `user`'s hidden flag. Returns whether the flag was set.
    async fn unhide_conversation(
        &self,
        user: UserId,
        other: UserId,
        resource: Option<ResourceId>,
    ) -> Result<bool, StoreError>;
}

/// Real-time channel keyed by user identity.
#[async_trait]
pub trait Broadcaster: Send + Sync {
    /// Push `message` to every live connection of `user`.
    async fn publish(&self, user: UserId, message: &Message) -> Result<(), StoreError>;
}

/// Mute rule storage.
#[async_trait]
pub trait MuteStore: Send + Sync {
    /// Rule of `user` towards `other`; a resource-scoped rule wins over a
    /// counterpart-wide one.
    async fn mute_rule(
        &self,
        user: UserId,
        other: UserId,
        resource: Option<ResourceId>,
    ) -> Result<Option<MuteRule>, StoreError>;

    /// Insert or replace a rule.
    async fn set_mute(&self, rule: MuteRule) -> Result<(), StoreError>;

    /// Remove a rule.
    async fn clear_mute(
        &self,
        user: UserId,
        other: UserId,
        resource: Option<ResourceId>,
    ) -> Result<(), StoreError>;
}

/// Device token registry.
#[async_trait]
pub trait DeviceTokenStore: Send + Sync {
    /// Active tokens of `user`.
    async fn active_tokens(&self, user: UserId) -> Result<Vec<DeviceToken>, StoreError>;

    /// Register (or reactivate) a token.
    async fn register(&self, user: UserId, token: &str) -> Result<(), StoreError>;

    /// Mark a token inactive.
    async fn deactivate(&self, token: &str) -> Result<(), StoreError>;
}

/// External push gateway.
#[async_trait]
pub trait PushGateway: Send + Sync {
    /// Send to one device.
    async fn send(&self, token: &DeviceToken, notification: &PushNotification) -> PushStatus;
}

/// Collaborators the dispatcher writes to.
#[derive(Clone)]
pub struct FanoutStores {
    /// Durable messages.
    pub messages: Arc<dyn MessageStore>,
    /// Real-time channel.
    pub broadcaster: Arc<dyn Broadcaster>,
    /// Mute rules.
    pub mutes: Arc<dyn MuteStore>,
    /// Device tokens.
    pub tokens: Arc<dyn DeviceTokenStore>,
    /// Push gateway.
    pub push: Arc<dyn PushGateway>,
}

/// Persists, broadcasts and notifies.
pub struct Dispatcher<S> {
    stores: FanoutStores,
    clock: Arc<dyn Clock>,
    spawner: S,
    locks: parking_lot::Mutex<HashMap<ConversationKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl<S> Dispatcher<S>
where
    S: Spawn + Clone + Send + Sync + 'static,
{
    /// Create a dispatcher.
    pub fn new(stores: FanoutStores, clock: Arc<dyn Clock>, spawner: S) -> Self {
        Self {
            stores,
            clock,
            spawner,
            locks: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    /// Persist `message`, broadcast it to both participants, then notify the receiver.
    ///
    /// Messages of one conversation are persisted and broadcast one at a time, so
    /// both participants observe them in creation order.
    ///
    /// # Errors
    ///
    /// `StoreUnavailable` if the message could not be persisted. Nothing is
    /// broadcast in that case.
    pub async fn deliver(&self, message: NewMessage) -> Result<DeliveryReport, CoordError> {
        let key = ConversationKey::new(message.sender_id, message.receiver_id, message.resource_id);
        let lock = self.conversation_lock(key);
        let guard = lock.lock().await;

        let message = self.stores.messages.insert(message).await?;
        let broadcast_sender = self.broadcast(message.sender_id, &message).await;
        let broadcast_receiver = self.broadcast(message.receiver_id, &message).await;
        drop(guard);

        let unhidden = match self
            .stores
            .messages
            .unhide_conversation(message.receiver_id, message.sender_id, message.resource_id)
            .await
        {
            Ok(changed) => changed,
            Err(err) => {
                tracing::warn!(message = message.id, error = %err, "failed to unhide conversation");
                false
            }
        };

        let push = self.notify(&message).await;
        tracing::debug!(
            message = message.id,
            broadcast_sender,
            broadcast_receiver,
            ?push,
            "message delivered"
        );
        Ok(DeliveryReport {
            message,
            broadcast_sender,
            broadcast_receiver,
            unhidden,
            push,
        })
    }

    /// Visible messages of a conversation in delivery order.
    ///
    /// # Errors
    ///
    /// `StoreUnavailable` on store failure.
    pub async fn conversation(
        &self,
        user: UserId,
        other: UserId,
        resource: Option<ResourceId>,
    ) -> Result<Vec<Message>, CoordError> {
        Ok(self
            .stores
            .messages
            .conversation(user, other, resource, false)
            .await?)
    }

    /// Mark what `other` sent to `reader` as read.
    ///
    /// # Errors
    ///
    /// `StoreUnavailable` on store failure.
    pub async fn mark_read(
        &self,
        reader: UserId,
        other: UserId,
        resource: Option<ResourceId>,
    ) -> Result<u64, CoordError> {
        Ok(self.stores.messages.mark_read(reader, other, resource).await?)
    }

    /// Soft-delete a message; only its sender may do so.
    ///
    /// # Errors
    ///
    /// `NotFound` if there is no live message `id` authored by `actor`.
    pub async fn delete_message(&self, id: MessageId, actor: UserId) -> Result<(), CoordError> {
        if self.stores.messages.soft_delete(id, actor).await? {
            Ok(())
        } else {
            Err(CoordError::NotFound(format!("message {id}")))
        }
    }

    /// Hide a conversation until new activity arrives.
    ///
    /// # Errors
    ///
    /// `StoreUnavailable` on store failure.
    pub async fn hide_conversation(
        &self,
        user: UserId,
        other: UserId,
        resource: Option<ResourceId>,
    ) -> Result<(), CoordError> {
        Ok(self
            .stores
            .messages
            .hide_conversation(user, other, resource)
            .await?)
    }

    /// Mute `other` for `user`, optionally scoped and time-limited.
    ///
    /// # Errors
    ///
    /// `StoreUnavailable` on store failure.
    pub async fn mute(
        &self,
        user: UserId,
        other: UserId,
        resource: Option<ResourceId>,
        until: Option<DateTime<Utc>>,
    ) -> Result<(), CoordError> {
        let rule = MuteRule {
            user_id: user,
            other_user_id: other,
            resource_id: resource,
            is_muted: true,
            muted_until: until,
        };
        Ok(self.stores.mutes.set_mute(rule).await?)
    }

    /// Remove a mute rule.
    ///
    /// # Errors
    ///
    /// `StoreUnavailable` on store failure.
    pub async fn unmute(
        &self,
        user: UserId,
        other: UserId,
        resource: Option<ResourceId>,
    ) -> Result<(), CoordError> {
        Ok(self.stores.mutes.clear_mute(user, other, resource).await?)
    }

    /// Register a push token for `user`.
    ///
    /// # Errors
    ///
    /// `StoreUnavailable` on store failure.
    pub async fn register_device(&self, user: UserId, token: &str) -> Result<(), CoordError> {
        Ok(self.stores.tokens.register(user, token).await?)
    }

    fn conversation_lock(&self, key: ConversationKey) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock();
        if locks.len() >= LOCK_TABLE_PRUNE_AT {
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        }
        Arc::clone(locks.entry(key).or_default())
    }

    async fn broadcast(&self, user: UserId, message: &Message) -> bool {
        match self.stores.broadcaster.publish(user, message).await {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(message = message.id, %user, error = %err, "broadcast failed");
                false
            }
        }
    }

    async fn notify(&self, message: &Message) -> PushDecision {
        let receiver = message.receiver_id;
        match self
            .stores
            .mutes
            .mute_rule(receiver, message.sender_id, message.resource_id)
            .await
        {
            Ok(Some(rule)) if rule.is_active(self.clock.now_utc()) => {
                tracing::debug!(message = message.id, %receiver, "push suppressed by mute rule");
                return PushDecision::Muted;
            }
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(message = message.id, error = %err, "mute lookup failed, sending push");
            }
        }

        let tokens = match self.stores.tokens.active_tokens(receiver).await {
            Ok(tokens) if tokens.is_empty() => return PushDecision::NoDevices,
            Ok(tokens) => tokens,
            Err(err) => {
                tracing::warn!(message = message.id, error = %err, "device lookup failed");
                return PushDecision::LookupFailed;
            }
        };

        let count = tokens.len();
        let notification = PushNotification::for_message(message);
        let push = Arc::clone(&self.stores.push);
        let registry = Arc::clone(&self.stores.tokens);
        self.spawner.spawn(async move {
            for token in tokens {
                match push.send(&token, &notification).await {
                    PushStatus::Delivered => {}
                    PushStatus::InvalidToken => {
                        tracing::info!(user = %token.user_id, "deactivating invalid push token");
                        if let Err(err) = registry.deactivate(&token.token).await {
                            tracing::warn!(error = %err, "failed to deactivate push token");
                        }
                    }
                    PushStatus::Failed(reason) => {
                        tracing::warn!(user = %token.user_id, %reason, "push delivery failed");
                    }
                }
            }
        });
        PushDecision::Dispatched { tokens: count }
    }
}

/// Announces appointment transitions as card messages from the actor to the counterpart.
pub struct AppointmentCards<S> {
    dispatcher: Arc<Dispatcher<S>>,
}

impl<S> AppointmentCards<S> {
    /// Wrap a dispatcher.
    pub const fn new(dispatcher: Arc<Dispatcher<S>>) -> Self {
        Self { dispatcher }
    }
}

#[async_trait]
impl<S> EventSink for AppointmentCards<S>
where
    S: Spawn + Clone + Send + Sync + 'static,
{
    async fn publish(&self, event: AppointmentEvent) -> Result<(), CoordError> {
        let appointment = &event.appointment;
        let summary = format!(
            "Appointment {} for {}",
            appointment.status, appointment.slot
        );
        let message = NewMessage {
            sender_id: event.actor,
            receiver_id: appointment.counterpart_of(event.actor),
            resource_id: Some(appointment.resource_id),
            kind: MessageKind::Card(CardRef::Appointment(appointment.id)),
            payload: serde_json::json!({
                "event": event.kind,
                "status": appointment.status,
                "date": appointment.slot.date,
                "hour": appointment.slot.hour,
                "notes": appointment.notes,
                "cancellation_reason": appointment.cancellation_reason,
                "summary": summary,
            }),
        };
        self.dispatcher.deliver(message).await.map(|_| ())
    }
}
