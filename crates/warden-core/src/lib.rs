//! Warden Core - Connection supervision and operation replay for a
//! crash-prone worker service.
//!
//! This crate sits between a long-lived host process and a separate worker
//! process reached only through asynchronous inter-process calls. It accepts
//! operation requests and user lifecycle notifications at any time, including
//! while the worker is down, queues or merges them, detects disconnection and
//! unresponsiveness, and replays the minimal correct call sequence once the
//! worker reconnects.
//!
//! The embedding process supplies the transport by implementing the traits in
//! [`worker`]; this crate only decides *when* each call happens.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use warden_core::{ConnectionSupervisor, OperationProxy, SupervisorConfig};
//!
//! #[tokio::main]
//! async fn main() -> warden_core::Result<()> {
//!     let proxy = Arc::new(OperationProxy::new());
//!     let supervisor = ConnectionSupervisor::spawn(
//!         SupervisorConfig::default(),
//!         my_connection_source(),
//!         proxy.clone(),
//!         my_fatal_recovery(),
//!     );
//!     supervisor.start().await?;
//!
//!     // Requests are accepted whether or not the worker is up.
//!     proxy.request_init_boot_user().await;
//!     proxy.request_user_removed(10).await;
//!
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod lifecycle;
pub mod metrics;
pub mod proxy;
pub mod supervisor;
pub mod worker;

// Re-export commonly used types
pub use config::SupervisorConfig;
pub use error::{Result, WardenError};
pub use lifecycle::{LifecycleEventType, LifecycleStage, UserId, SYSTEM_USER};
pub use metrics::UserLifecycleTracker;
pub use proxy::{OperationProxy, PendingOperation, ProxyStatus};
pub use supervisor::{ConnectionState, ConnectionSupervisor, SupervisorHandle, SupervisorStatus};
pub use worker::{
    ConnectionSource, FatalRecovery, ProcessExit, ResetCallback, WorkerClient, WorkerConnection,
};
