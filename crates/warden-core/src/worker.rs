//! External collaborator contracts.
//!
//! The supervision core never talks to a transport directly. The embedding
//! process supplies implementations of these traits that do the actual
//! marshalling; the core only decides *when* each call happens.

use crate::error::Result;
use crate::lifecycle::{LifecycleEventType, UserId};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::error;

/// Completion callback for a factory-reset confirmation.
///
/// The worker invokes it with a result code once the user has confirmed or
/// declined the reset. Held as a plain function value so it can be re-sent
/// verbatim if the worker crashes before acknowledging.
pub type ResetCallback = Arc<dyn Fn(i32) + Send + Sync>;

/// Calls the core makes into the worker service once connected.
///
/// Every method may fail in transit; such failures are reported as
/// [`crate::WardenError::Transport`] and treated as a worker crash.
#[async_trait]
pub trait WorkerClient: Send + Sync {
    /// Ask the worker to set up and start the boot user. Idempotent on the
    /// worker side.
    async fn init_boot_user(&self) -> Result<()>;

    /// Tell the worker a user was removed from the host.
    async fn on_user_removed(&self, user_id: UserId) -> Result<()>;

    /// Hand the worker a pending factory-reset confirmation.
    async fn on_factory_reset(&self, callback: ResetCallback) -> Result<()>;

    /// Forward a user lifecycle transition. `from` is only meaningful for
    /// Switching events.
    async fn on_user_lifecycle_event(
        &self,
        event: LifecycleEventType,
        from: Option<UserId>,
        to: UserId,
    ) -> Result<()>;
}

/// A raw connection to the worker process, delivered by the external
/// connection source.
///
/// The handshake exchanges proxy surfaces with the worker and resolves on the
/// worker's acknowledgment, yielding the typed [`WorkerClient`] used for all
/// subsequent calls. A [`crate::WardenError::Protocol`] handshake failure is
/// treated as a protocol violation and escalated fatally; a transport failure
/// is handled like an ordinary crash.
#[async_trait]
pub trait WorkerConnection: Send + Sync {
    /// Stable identity of this connection. Used to drop duplicate
    /// notifications and stale handshake acknowledgments after the handle has
    /// been replaced.
    fn id(&self) -> u64;

    /// Perform the proxy-surface exchange with the worker.
    async fn handshake(&self) -> Result<Arc<dyn WorkerClient>>;
}

/// The external source that produces worker connections.
///
/// `bind` only issues the request; the resulting connection arrives later via
/// [`crate::ConnectionSupervisor::notify_connected`].
#[async_trait]
pub trait ConnectionSource: Send + Sync {
    /// Issue an asynchronous bind request toward the worker service.
    async fn bind(&self) -> Result<()>;
}

/// Last-resort recovery once the worker is beyond reconnection.
pub trait FatalRecovery: Send + Sync {
    /// Terminate supervision. Production implementations do not return.
    fn escalate(&self, reason: &str);
}

/// Production recovery: terminate the host process with a distinct exit
/// status so the external restarter brings the whole stack back up.
///
/// This is a deliberate stop, not a retry; supervision resumes only after the
/// process is restarted from outside.
pub struct ProcessExit {
    exit_status: i32,
}

impl ProcessExit {
    pub fn new(exit_status: i32) -> Self {
        Self { exit_status }
    }
}

impl FatalRecovery for ProcessExit {
    fn escalate(&self, reason: &str) {
        error!("*** killing host process: {}", reason);
        error!("*** goodbye!");
        std::process::exit(self.exit_status);
    }
}
