//! Change-notification seam.
//!
//! The manager publishes enablement changes to a registered handler so
//! product surfaces (text-input clients, settings UI) can react. Calls are
//! dispatched through the event queue, never inline with the mutation, so
//! a slow handler cannot block writers.

use crate::types::{EnabledStatus, UserId};

/// Receives enablement status change events.
pub trait EnabledStatusObserver: Send + Sync {
    /// `old_status` is the status before the update; the new status is
    /// readable through the manager.
    fn on_status_changed(&self, user_id: UserId, bundle_name: &str, old_status: EnabledStatus);
}
