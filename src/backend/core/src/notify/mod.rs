//! Side channels: user notifications, queued emails and live broadcast.
//!
//! None of these are coupled to ledger transactions. Jobs call them after a
//! commit through [`Notifier`], which logs and swallows failures so a broken
//! mail relay can never undo a settlement.

pub mod broadcast;
pub mod email;

pub use broadcast::{BroadcastEvent, BroadcastSink, ChannelBroadcaster, LogLevel};
pub use email::RedisEmailQueue;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::Result;

/// Category shown next to a user notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationType {
    System,
    Investment,
    Alert,
    Message,
}

impl NotificationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::Investment => "investment",
            Self::Alert => "alert",
            Self::Message => "message",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NotificationAction {
    pub label: String,
    pub link: String,
    pub primary: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserNotification {
    pub user_id: Uuid,
    pub title: String,
    pub message: String,
    pub kind: NotificationType,
    pub link: Option<String>,
    pub actions: Vec<NotificationAction>,
}

impl UserNotification {
    pub fn new(
        user_id: Uuid,
        kind: NotificationType,
        title: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            user_id,
            title: title.into(),
            message: message.into(),
            kind,
            link: None,
            actions: Vec::new(),
        }
    }

    pub fn with_link(mut self, link: impl Into<String>) -> Self {
        self.link = Some(link.into());
        self
    }

    pub fn with_action(mut self, label: impl Into<String>, link: impl Into<String>) -> Self {
        let primary = self.actions.is_empty();
        self.actions.push(NotificationAction {
            label: label.into(),
            link: link.into(),
            primary,
        });
        self
    }
}

/// A notification addressed to every user holding a permission.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PermissionNotification {
    pub permission: String,
    pub title: String,
    pub message: String,
    pub kind: NotificationType,
    pub link: Option<String>,
}

#[async_trait]
pub trait NotificationDispatcher: Send + Sync {
    async fn notify_user(&self, notification: UserNotification) -> Result<()>;

    async fn notify_users_with_permission(&self, notification: PermissionNotification) -> Result<()>;
}

#[async_trait]
pub trait EmailDispatcher: Send + Sync {
    /// Hand an email off for asynchronous delivery.
    async fn enqueue(&self, email_type: &str, variables: serde_json::Value) -> Result<()>;
}

/// An email recorded by [`InMemoryOutbox`].
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedEmail {
    pub email_type: String,
    pub variables: serde_json::Value,
}

/// Keeps every notification and email in memory. Used by local runs
/// without a database and by tests.
#[derive(Default)]
pub struct InMemoryOutbox {
    user_notifications: Mutex<Vec<UserNotification>>,
    admin_notifications: Mutex<Vec<PermissionNotification>>,
    emails: Mutex<Vec<QueuedEmail>>,
}

impl InMemoryOutbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn user_notifications(&self) -> Vec<UserNotification> {
        self.user_notifications.lock().clone()
    }

    pub fn admin_notifications(&self) -> Vec<PermissionNotification> {
        self.admin_notifications.lock().clone()
    }

    pub fn emails(&self) -> Vec<QueuedEmail> {
        self.emails.lock().clone()
    }
}

#[async_trait]
impl NotificationDispatcher for InMemoryOutbox {
    async fn notify_user(&self, notification: UserNotification) -> Result<()> {
        tracing::debug!(user_id = %notification.user_id, title = %notification.title, "User notification");
        self.user_notifications.lock().push(notification);
        Ok(())
    }

    async fn notify_users_with_permission(&self, notification: PermissionNotification) -> Result<()> {
        tracing::debug!(permission = %notification.permission, title = %notification.title, "Admin notification");
        self.admin_notifications.lock().push(notification);
        Ok(())
    }
}

#[async_trait]
impl EmailDispatcher for InMemoryOutbox {
    async fn enqueue(&self, email_type: &str, variables: serde_json::Value) -> Result<()> {
        self.emails.lock().push(QueuedEmail {
            email_type: email_type.to_string(),
            variables,
        });
        Ok(())
    }
}

/// Bundle of the three side channels with fire-and-forget helpers.
#[derive(Clone)]
pub struct Notifier {
    pub users: Arc<dyn NotificationDispatcher>,
    pub email: Arc<dyn EmailDispatcher>,
    pub broadcast: Arc<dyn BroadcastSink>,
}

impl Notifier {
    pub fn new(
        users: Arc<dyn NotificationDispatcher>,
        email: Arc<dyn EmailDispatcher>,
        broadcast: Arc<dyn BroadcastSink>,
    ) -> Self {
        Self {
            users,
            email,
            broadcast,
        }
    }

    /// Notifier whose sinks all land in one [`InMemoryOutbox`].
    pub fn in_memory(outbox: Arc<InMemoryOutbox>, broadcast: Arc<dyn BroadcastSink>) -> Self {
        Self::new(outbox.clone(), outbox, broadcast)
    }

    pub async fn user(&self, notification: UserNotification) {
        let user_id = notification.user_id;
        if let Err(err) = self.users.notify_user(notification).await {
            tracing::warn!(user_id = %user_id, error = %err, "Failed to send user notification");
        }
    }

    pub async fn admins(
        &self,
        permission: &str,
        kind: NotificationType,
        title: impl Into<String>,
        message: impl Into<String>,
        link: Option<&str>,
    ) {
        let notification = PermissionNotification {
            permission: permission.to_string(),
            title: title.into(),
            message: message.into(),
            kind,
            link: link.map(str::to_string),
        };
        if let Err(err) = self.users.notify_users_with_permission(notification).await {
            tracing::warn!(permission = permission, error = %err, "Failed to notify admins");
        }
    }

    pub async fn email(&self, email_type: &str, variables: serde_json::Value) {
        if let Err(err) = self.email.enqueue(email_type, variables).await {
            tracing::warn!(email_type = email_type, error = %err, "Failed to enqueue email");
        }
    }
}
