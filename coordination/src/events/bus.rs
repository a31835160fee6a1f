//! Broadcast bus for run notifications

use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

use super::types::RunNotification;

/// Channel capacity for broadcast
const CHANNEL_CAPACITY: usize = 256;

/// Shared reference to RunNotifier
pub type SharedRunNotifier = Arc<RunNotifier>;

/// Publishes run outcomes to any number of subscribers.
///
/// Publishing never fails: with no subscribers the notification is dropped,
/// and slow subscribers observe `RecvError::Lagged`.
pub struct RunNotifier {
    sender: broadcast::Sender<RunNotification>,
}

impl RunNotifier {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    /// Create a shared reference to this notifier
    pub fn shared(self) -> SharedRunNotifier {
        Arc::new(self)
    }

    pub fn publish(&self, notification: RunNotification) {
        let kind = notification.kind();
        match self.sender.send(notification) {
            Ok(count) => debug!(kind, receivers = count, "Run notification published"),
            Err(_) => debug!(kind, "Run notification published (no receivers)"),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RunNotification> {
        self.sender.subscribe()
    }

    /// Subscribe to notifications matching `filter`.
    pub fn subscribe_filtered(&self, filter: NotificationFilter) -> FilteredReceiver {
        FilteredReceiver::new(self.subscribe(), filter)
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for RunNotifier {
    fn default() -> Self {
        Self::new()
    }
}

/// Notification filter for selective subscription
#[derive(Debug, Clone, Default)]
pub struct NotificationFilter {
    pub job_types: Option<Vec<String>>,
    /// Skip failures that will be retried.
    pub terminal_only: bool,
}

impl NotificationFilter {
    /// Create a new empty filter (matches everything)
    pub fn new() -> Self {
        Self::default()
    }

    pub fn job_types(mut self, job_types: Vec<&str>) -> Self {
        self.job_types = Some(job_types.into_iter().map(String::from).collect());
        self
    }

    pub fn terminal_only(mut self) -> Self {
        self.terminal_only = true;
        self
    }

    pub fn matches(&self, notification: &RunNotification) -> bool {
        if let Some(ref types) = self.job_types {
            if !types.iter().any(|t| t == notification.job_type()) {
                return false;
            }
        }
        if self.terminal_only {
            if let RunNotification::Failed { terminal: false, .. } = notification {
                return false;
            }
        }
        true
    }
}

/// Receiver that only yields matching notifications
pub struct FilteredReceiver {
    receiver: broadcast::Receiver<RunNotification>,
    filter: NotificationFilter,
}

impl FilteredReceiver {
    pub fn new(receiver: broadcast::Receiver<RunNotification>, filter: NotificationFilter) -> Self {
        Self { receiver, filter }
    }

    /// Receive the next matching notification
    pub async fn recv(&mut self) -> Result<RunNotification, broadcast::error::RecvError> {
        loop {
            let notification = self.receiver.recv().await?;
            if self.filter.matches(&notification) {
                return Ok(notification);
            }
        }
    }
}
