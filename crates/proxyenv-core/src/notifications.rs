//! Desktop notifications for proxy changes.
//!
//! The engine calls [`Notifier::notify`] only when notifications are enabled
//! and the detected proxy actually changed. Delivery is fire-and-forget.

use tracing::{debug, warn};

use crate::model::ProxySettings;

/// Application name shown by the notification daemon.
const APP_NAME: &str = "ProxyEnvSync";

/// How long a notification stays on screen.
#[cfg(feature = "notifications")]
const NOTIFICATION_TIMEOUT_MS: u32 = 5000;

/// Receives user-facing change messages.
pub trait Notifier: Send + Sync {
    /// Shows `message` without waiting for the user.
    fn notify(&self, message: &str);
}

/// Result of attempting to show a notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationResult {
    /// Notification was shown.
    Sent,
    /// Notifications are compiled out; the message was only logged.
    Logged,
    /// The notification daemon rejected the message.
    Failed(String),
}

impl NotificationResult {
    /// Returns true if the notification reached the desktop.
    pub fn was_sent(&self) -> bool {
        matches!(self, NotificationResult::Sent)
    }
}

/// Formats the message for a newly detected proxy state.
pub fn change_message(settings: &ProxySettings) -> String {
    match (settings.enabled, settings.host.as_deref(), settings.port) {
        (true, Some(host), Some(port)) => format!("System proxy enabled: {}:{}", host, port),
        _ => "System proxy disabled".to_string(),
    }
}

/// Notifier backed by the desktop notification service.
#[derive(Debug, Clone, Default)]
pub struct DesktopNotifier;

impl DesktopNotifier {
    /// Creates a desktop notifier.
    pub fn new() -> Self {
        Self
    }

    /// Shows `message` and reports the outcome.
    #[cfg(feature = "notifications")]
    pub fn show(&self, message: &str) -> NotificationResult {
        use notify_rust::Notification;

        match Notification::new()
            .summary(APP_NAME)
            .body(message)
            .appname(APP_NAME)
            .timeout(notify_rust::Timeout::Milliseconds(NOTIFICATION_TIMEOUT_MS))
            .show()
        {
            Ok(_) => NotificationResult::Sent,
            Err(e) => NotificationResult::Failed(e.to_string()),
        }
    }

    /// Logs `message` when notifications are compiled out.
    #[cfg(not(feature = "notifications"))]
    pub fn show(&self, message: &str) -> NotificationResult {
        tracing::info!("{}: {}", APP_NAME, message);
        NotificationResult::Logged
    }
}

impl Notifier for DesktopNotifier {
    fn notify(&self, message: &str) {
        match self.show(message) {
            NotificationResult::Failed(e) => warn!("Failed to show notification: {}", e),
            result => debug!("Notification {:?}: {}", result, message),
        }
    }
}

/// Notifier that drops every message.
#[derive(Debug, Clone, Default)]
pub struct NullNotifier;

impl Notifier for NullNotifier {
    fn notify(&self, _message: &str) {}
}
