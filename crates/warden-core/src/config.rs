//! Centralized configuration for the supervision core.

use std::time::Duration;

/// Supervision timing and recovery policy.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// How long a fresh connection may go without a handshake acknowledgment
    /// before the worker is declared unresponsive.
    pub handshake_timeout: Duration,
    /// Escalate to fatal recovery on an ordinary worker crash instead of
    /// waiting for the next reconnect.
    pub restart_on_crash: bool,
    /// Exit status used by deliberate fatal recovery. Distinct from normal
    /// termination so the external restarter can tell them apart.
    pub recovery_exit_status: i32,
}

impl SupervisorConfig {
    pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);
    pub const DEFAULT_RECOVERY_EXIT_STATUS: i32 = 10;
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Self::DEFAULT_HANDSHAKE_TIMEOUT,
            restart_on_crash: false,
            recovery_exit_status: Self::DEFAULT_RECOVERY_EXIT_STATUS,
        }
    }
}
