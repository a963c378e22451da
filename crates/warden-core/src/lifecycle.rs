//! User lifecycle event and stage vocabulary.
//!
//! Events arrive from the host's user manager and are forwarded to the worker
//! service. Stages are the subset of events worth remembering between a crash
//! and the next reconnect; Stopping/Stopped erase a user's stage instead of
//! being recorded.

use serde::{Deserialize, Serialize};

/// User identifier. The system user is always id 0.
pub type UserId = i32;

/// The system user, replayed first during lifecycle resynchronization.
pub const SYSTEM_USER: UserId = 0;

/// A user lifecycle transition reported by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleEventType {
    /// The user is starting.
    Starting,
    /// The foreground user is switching to this user.
    Switching,
    /// The user's credential-encrypted storage is being unlocked.
    Unlocking,
    /// The user is fully unlocked.
    Unlocked,
    /// The user is shutting down.
    Stopping,
    /// The user has stopped.
    Stopped,
}

/// Last-known lifecycle stage of a user, in fixed progression order.
///
/// The derived ordering is the replay progression:
/// Starting → Switching → Unlocking → Unlocked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleStage {
    Starting,
    Switching,
    Unlocking,
    Unlocked,
}

impl LifecycleStage {
    /// Map an event to the stage it stamps, or `None` for the events that
    /// erase a user's stage (Stopping/Stopped).
    pub fn from_event(event: LifecycleEventType) -> Option<Self> {
        match event {
            LifecycleEventType::Starting => Some(LifecycleStage::Starting),
            LifecycleEventType::Switching => Some(LifecycleStage::Switching),
            LifecycleEventType::Unlocking => Some(LifecycleStage::Unlocking),
            LifecycleEventType::Unlocked => Some(LifecycleStage::Unlocked),
            LifecycleEventType::Stopping | LifecycleEventType::Stopped => None,
        }
    }

    /// The implied event subsequence that reconstructs this stage from
    /// scratch, never skipping forward stages.
    ///
    /// Switching only exists for the current foreground user; for any other
    /// user the sequence stops before it.
    pub fn replay_events(self, is_current_user: bool) -> Vec<LifecycleEventType> {
        const PROGRESSION: [(LifecycleStage, LifecycleEventType); 4] = [
            (LifecycleStage::Starting, LifecycleEventType::Starting),
            (LifecycleStage::Switching, LifecycleEventType::Switching),
            (LifecycleStage::Unlocking, LifecycleEventType::Unlocking),
            (LifecycleStage::Unlocked, LifecycleEventType::Unlocked),
        ];

        PROGRESSION
            .iter()
            .filter(|(stage, _)| *stage <= self)
            .filter(|(stage, _)| *stage != LifecycleStage::Switching || is_current_user)
            .map(|(_, event)| *event)
            .collect()
    }
}
