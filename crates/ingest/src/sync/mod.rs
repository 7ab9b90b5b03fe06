//! Change-notification sync engine
//!
//! Provides idempotent sync cycles that can be safely retried.

mod notification;
mod synchronizer;

pub use notification::{ChangeNotification, decode_notification, verification_response};
pub use synchronizer::{
    ChangeSynchronizer, CycleOutcome, CycleStats, NotificationOutcome, ProjectCycle,
};
