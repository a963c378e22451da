//! Pending operations awaiting replay after the next successful handshake.

use crate::lifecycle::UserId;
use crate::worker::ResetCallback;
use std::fmt;

/// A deferred or re-armed operation, with one payload shape per kind.
pub enum PendingOperation {
    /// Idempotent boot-user initialization; duplicate requests collapse.
    InitBootUser,
    /// Ordered user-removal backlog; repeated requests append.
    UsersRemoved(Vec<UserId>),
    /// Factory-reset confirmation. A new request replaces the callback, and
    /// the entry survives being sent: only an explicit acknowledgment from
    /// outside removes it, so the confirmation can be retried from scratch if
    /// the worker crashes first.
    FactoryReset(ResetCallback),
}

impl fmt::Debug for PendingOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PendingOperation::InitBootUser => write!(f, "InitBootUser"),
            PendingOperation::UsersRemoved(users) => {
                f.debug_tuple("UsersRemoved").field(users).finish()
            }
            PendingOperation::FactoryReset(_) => write!(f, "FactoryReset(<callback>)"),
        }
    }
}

/// The pending-operation set. At most one entry exists per kind; merging a
/// new request applies that kind's rule (collapse, append, or replace).
#[derive(Default)]
pub struct PendingSet {
    init_boot_user: bool,
    users_removed: Vec<UserId>,
    factory_reset: Option<ResetCallback>,
}

impl PendingSet {
    /// Merge a request into the set.
    pub fn merge(&mut self, operation: PendingOperation) {
        match operation {
            PendingOperation::InitBootUser => self.init_boot_user = true,
            PendingOperation::UsersRemoved(users) => self.users_removed.extend(users),
            PendingOperation::FactoryReset(callback) => self.factory_reset = Some(callback),
        }
    }

    pub fn is_empty(&self) -> bool {
        !self.init_boot_user && self.users_removed.is_empty() && self.factory_reset.is_none()
    }

    /// Remove the InitBootUser entry after a successful replay.
    pub fn clear_init_boot_user(&mut self) {
        self.init_boot_user = false;
    }

    /// Remove the first queued occurrence of `user_id` after its removal
    /// notification was delivered.
    pub fn remove_user_removed(&mut self, user_id: UserId) {
        if let Some(pos) = self.users_removed.iter().position(|u| *u == user_id) {
            self.users_removed.remove(pos);
        }
    }

    /// The pending factory-reset callback, left in place.
    pub fn factory_reset(&self) -> Option<ResetCallback> {
        self.factory_reset.clone()
    }

    pub fn has_factory_reset(&self) -> bool {
        self.factory_reset.is_some()
    }

    /// Remove the factory-reset entry. Returns whether one was pending.
    pub fn clear_factory_reset(&mut self) -> bool {
        self.factory_reset.take().is_some()
    }

    pub fn users_removed(&self) -> &[UserId] {
        &self.users_removed
    }

    pub fn has_init_boot_user(&self) -> bool {
        self.init_boot_user
    }
}

impl fmt::Debug for PendingSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingSet")
            .field("init_boot_user", &self.init_boot_user)
            .field("users_removed", &self.users_removed)
            .field("factory_reset", &self.factory_reset.is_some())
            .finish()
    }
}
