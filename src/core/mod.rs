//! Core broker logic.
//!
//! This module contains:
//! - Lifecycle: protocol handlers with idempotency and conflict rules
//! - Engine: asynchronous execution of provisioning workflows
//! - Broker: composition of the API server and the engine
//! - FatalSignal: escalation of unrecoverable persistence failures

pub mod broker;
pub mod engine;
pub mod lifecycle;

use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

pub use broker::{ApiServer, Broker, BrokerError};
pub use engine::{AsyncEngine, EngineError, LocalEngine, Task, TaskEvent, TaskOutcome};
pub use lifecycle::{Lifecycle, LifecycleError, Outcome};

/// Trip-wire for failures that leave persisted state unknown.
///
/// Library code never exits the process. Instead it trips this signal and the
/// broker shuts everything down and reports the first recorded reason.
#[derive(Debug, Clone, Default)]
pub struct FatalSignal {
    token: CancellationToken,
    reason: Arc<Mutex<Option<String>>>,
}

impl FatalSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `reason` and fire the signal. Only the first reason is kept.
    pub fn trip(&self, reason: impl Into<String>) {
        let reason = reason.into();
        {
            let mut slot = self.reason.lock();
            if slot.is_none() {
                tracing::error!(reason = %reason, "Fatal error, shutting down");
                *slot = Some(reason);
            }
        }
        self.token.cancel();
    }

    pub fn is_tripped(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn reason(&self) -> Option<String> {
        self.reason.lock().clone()
    }

    /// Resolves once the signal has been tripped
    pub async fn tripped(&self) {
        self.token.cancelled().await
    }
}
