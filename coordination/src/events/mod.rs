//! Run notifications for downstream consumers
//!
//! The worker publishes one [`RunNotification`] per job attempt outcome on a
//! tokio broadcast channel. A workflow engine subscribes, optionally with a
//! [`NotificationFilter`] on job type, and reacts to completed or failed
//! runs.
//!
//! ```text
//! ┌──────────────┐     ┌──────────────┐     ┌──────────────┐
//! │    Worker    │────▶│ RunNotifier  │────▶│  Subscribers │
//! │  (publish)   │     │  (broadcast) │     │   (recv)     │
//! └──────────────┘     └──────────────┘     └──────────────┘
//! ```
//!
//! Notifications are not persisted; the run ledger is the durable record.

pub mod bus;
pub mod types;

pub use bus::{FilteredReceiver, NotificationFilter, RunNotifier, SharedRunNotifier};
pub use types::RunNotification;
