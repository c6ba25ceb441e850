//! Composition of the API server and the async engine.
//!
//! Both run as independent tokio tasks. Whichever stops first, for whatever
//! reason, brings the other down, and the broker reports which side it was.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::engine::{AsyncEngine, EngineError};
use super::FatalSignal;
use crate::storage::{Store, StoreError};

/// Serves the broker protocol until cancelled
#[async_trait]
pub trait ApiServer: Send + Sync {
    async fn run(&self, cancel: CancellationToken) -> anyhow::Result<()>;
}

fn describe<E: std::fmt::Display>(err: &Option<E>) -> String {
    match err {
        Some(e) => format!(": {:#}", e),
        None => String::new(),
    }
}

/// Why the broker stopped
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("api server stopped{}", describe(.0))]
    ApiServerStopped(Option<anyhow::Error>),

    #[error("async engine stopped{}", describe(.0))]
    AsyncEngineStopped(Option<EngineError>),

    #[error("broker cancelled")]
    Cancelled,

    #[error("fatal: {0}")]
    Fatal(String),
}

/// Owns the lifetimes of the API server and the async engine
pub struct Broker {
    api: Arc<dyn ApiServer>,
    engine: Arc<dyn AsyncEngine>,
    fatal: FatalSignal,
    shutdown_timeout: Duration,
}

impl Broker {
    /// Build a broker after checking that the store is reachable
    pub async fn new(
        api: Arc<dyn ApiServer>,
        engine: Arc<dyn AsyncEngine>,
        store: Arc<dyn Store>,
        fatal: FatalSignal,
        shutdown_timeout: Duration,
    ) -> Result<Self, StoreError> {
        store.test_connection().await?;
        Ok(Self {
            api,
            engine,
            fatal,
            shutdown_timeout,
        })
    }

    /// Run both subsystems until one stops, `cancel` fires or the fatal
    /// signal trips. Always returns the reason for stopping.
    pub async fn run(&self, cancel: CancellationToken) -> BrokerError {
        let api_cancel = cancel.child_token();
        let engine_cancel = cancel.child_token();

        let mut api_task = {
            let api = self.api.clone();
            let token = api_cancel.clone();
            tokio::spawn(async move { api.run(token).await })
        };
        let mut engine_task = {
            let engine = self.engine.clone();
            let token = engine_cancel.clone();
            tokio::spawn(async move { engine.run(token).await })
        };

        info!("Broker started");

        let mut api_done = false;
        let mut engine_done = false;
        let stopped = tokio::select! {
            joined = &mut api_task => {
                api_done = true;
                BrokerError::ApiServerStopped(api_failure(joined))
            }
            joined = &mut engine_task => {
                engine_done = true;
                BrokerError::AsyncEngineStopped(engine_failure(joined))
            }
            _ = self.fatal.tripped() => {
                BrokerError::Fatal(self.fatal.reason().unwrap_or_default())
            }
            _ = cancel.cancelled() => BrokerError::Cancelled,
        };

        info!(reason = %stopped, "Broker stopping");
        api_cancel.cancel();
        engine_cancel.cancel();

        if !api_done {
            self.await_stop("api server", api_task).await;
        }
        if !engine_done {
            self.await_stop("async engine", engine_task).await;
        }

        // A fatal trip during shutdown outranks an orderly stop
        if self.fatal.is_tripped() && !matches!(stopped, BrokerError::Fatal(_)) {
            return BrokerError::Fatal(self.fatal.reason().unwrap_or_default());
        }
        stopped
    }

    async fn await_stop<T>(&self, name: &str, mut handle: JoinHandle<T>) {
        if tokio::time::timeout(self.shutdown_timeout, &mut handle)
            .await
            .is_err()
        {
            warn!(subsystem = name, "Did not stop in time, aborting");
            handle.abort();
        }
    }
}

fn api_failure(joined: Result<anyhow::Result<()>, JoinError>) -> Option<anyhow::Error> {
    match joined {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(e),
        Err(e) => Some(anyhow::Error::new(e)),
    }
}

fn engine_failure(joined: Result<Result<(), EngineError>, JoinError>) -> Option<EngineError> {
    match joined {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(e),
        Err(e) => Some(EngineError::Panicked(e.to_string())),
    }
}
