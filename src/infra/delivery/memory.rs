//! In-process real-time hub and a recording push gateway.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::core::{Broadcaster, DeviceToken, Message, PushGateway, PushNotification, PushStatus, StoreError};
use crate::util::serde::UserId;

/// Broadcaster fanning messages out to per-user channels.
///
/// Each [`MemoryHub::subscribe`] call stands for one live connection; closed
/// receivers are dropped on the next publish.
#[derive(Default)]
pub struct MemoryHub {
    subscribers: Mutex<HashMap<UserId, Vec<UnboundedSender<Message>>>>,
    failing: AtomicBool,
}

impl MemoryHub {
    /// Create an empty hub.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a connection for `user`.
    pub fn subscribe(&self, user: UserId) -> UnboundedReceiver<Message> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().entry(user).or_default().push(tx);
        rx
    }

    /// Make every publish fail until switched back.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl Broadcaster for MemoryHub {
    async fn publish(&self, user: UserId, message: &Message) -> Result<(), StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("hub offline".into()));
        }
        let mut subscribers = self.subscribers.lock();
        if let Some(channels) = subscribers.get_mut(&user) {
            channels.retain(|tx| tx.send(message.clone()).is_ok());
        }
        Ok(())
    }
}

/// Push gateway that records what it was asked to send.
#[derive(Default)]
pub struct RecordingPushGateway {
    sent: Mutex<Vec<(DeviceToken, PushNotification)>>,
    invalid: Mutex<HashSet<String>>,
}

impl RecordingPushGateway {
    /// Create a gateway accepting every token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Report `token` as permanently invalid from now on.
    pub fn reject_token(&self, token: impl Into<String>) {
        self.invalid.lock().insert(token.into());
    }

    /// Notifications accepted so far.
    #[must_use]
    pub fn sent(&self) -> Vec<(DeviceToken, PushNotification)> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl PushGateway for RecordingPushGateway {
    async fn send(&self, token: &DeviceToken, notification: &PushNotification) -> PushStatus {
        if self.invalid.lock().contains(&token.token) {
            return PushStatus::InvalidToken;
        }
        self.sent.lock().push((token.clone(), notification.clone()));
        PushStatus::Delivered
    }
}
