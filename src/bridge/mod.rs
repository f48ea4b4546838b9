//! Object bridge between a host and an embedded CPython runtime.
//!
//! A [`Bridge`] owns one set of process tables (live handles, live contexts
//! and the identity map deduplicating both) plus a bounded worker pool for
//! asynchronous calls. The embedded runtime itself is process-wide: the first
//! bridge to initialize starts it and [`Bridge::shutdown`] finalizes it for
//! good.
//!
//! Operations are split by component:
//! - [`host_value`]: the host value model
//! - [`conversion`]: marshaling between host values and embedded objects
//! - [`registry`]: foreign handles and the process tables
//! - [`context`]: isolated sub-interpreter contexts
//! - [`lock`]: the execution lock protocol
//! - [`pipeline`]: the call/exec operations

pub mod config;
pub mod context;
pub(crate) mod conversion;
pub mod error;
pub mod host_value;
pub(crate) mod interpreter;
pub(crate) mod lock;
pub mod pipeline;
pub mod registry;
pub mod session;
pub(crate) mod worker;

use registry::BridgeState;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};
use worker::WorkerPool;

pub use config::BridgeConfig;
pub use context::{ContextHandle, ContextTag};
pub use error::BridgeError;
pub use host_value::{HostArray, HostObject, HostValue, OpaqueValue};
pub use interpreter::is_running;
pub use pipeline::{ForeignTarget, Member, SourceMode};
pub use registry::ForeignHandle;
pub use session::Session;
pub use worker::PendingCall;

/// Entry point for every bridge operation.
pub struct Bridge {
    pub(crate) config: BridgeConfig,
    pub(crate) state: Arc<BridgeState>,
    pub(crate) workers: WorkerPool,
    closed: AtomicBool,
    main_prepared: AtomicBool,
}

impl Bridge {
    /// Create a bridge with fresh tables. The embedded runtime is started lazily
    /// by the first operation, or explicitly by [`Bridge::initialize`].
    pub fn new(config: BridgeConfig) -> Result<Self, BridgeError> {
        config.validate()?;
        let workers = WorkerPool::new(config.worker_threads)?;
        Ok(Self {
            config,
            state: Arc::new(BridgeState::new()),
            workers,
            closed: AtomicBool::new(false),
            main_prepared: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Start the embedded runtime if needed. Idempotent.
    ///
    /// If another bridge already started the runtime, this bridge's search paths
    /// are still added to the main context's `sys.path`. Its bootstrap script is
    /// not run there (the main namespace is shared); it only runs in contexts
    /// this bridge creates.
    pub fn initialize(&self) -> Result<bool, BridgeError> {
        self.ensure_initialized()?;
        Ok(true)
    }

    pub(crate) fn ensure_initialized(&self) -> Result<(), BridgeError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BridgeError::Lifecycle("bridge has been shut down".to_string()));
        }
        let started = interpreter::initialize(&self.config)?;
        if started {
            self.main_prepared.store(true, Ordering::Release);
        } else if !self.main_prepared.load(Ordering::Acquire) {
            self.prepare_main()?;
            self.main_prepared.store(true, Ordering::Release);
        }
        Ok(())
    }

    /// Apply this bridge's settings to a main context bootstrapped by someone else.
    fn prepare_main(&self) -> Result<(), BridgeError> {
        if self.config.bootstrap_script.is_some() {
            warn!("main context was bootstrapped by another bridge; bootstrap script not run there");
        }
        if self.config.search_paths.is_empty() {
            return Ok(());
        }
        lock::with_context(&lock::ExecutionTarget::Main, |py| {
            interpreter::extend_search_path(py, &self.config.search_paths)
        })
    }

    pub fn is_initialized(&self) -> bool {
        !self.closed.load(Ordering::Acquire) && interpreter::is_running()
    }

    /// Tear down every context and handle of this bridge, then finalize the
    /// embedded runtime.
    ///
    /// Returns false if the runtime was already shut down. Never finalizes twice;
    /// finalization errors are reported as `Lifecycle`.
    pub fn shutdown(&self) -> Result<bool, BridgeError> {
        self.closed.store(true, Ordering::Release);
        self.workers.shutdown();
        self.teardown();
        let finalized = interpreter::shutdown()?;
        debug!(finalized, "bridge shut down");
        Ok(finalized)
    }

    /// Number of live foreign handles in this bridge's reference table.
    pub fn live_handles(&self) -> usize {
        self.state.handle_count()
    }

    /// Number of live isolated contexts created by this bridge.
    pub fn live_contexts(&self) -> usize {
        self.state.context_count()
    }

    /// Destroy every remaining context and release main-context handles.
    fn teardown(&self) {
        if !interpreter::is_running() {
            return;
        }
        for context in self.state.contexts() {
            if let Err(err) = self.destroy_context(&context) {
                warn!(context = %context.tag(), error = %err, "context teardown failed");
            }
        }
        if let Err(err) = self.clear(None) {
            warn!(error = %err, "releasing main context handles failed");
        }
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.workers.shutdown();
        self.teardown();
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Start the shared embedded runtime. Unit tests never finalize it.
    pub(crate) fn start_runtime() {
        interpreter::initialize(&BridgeConfig::default()).expect("embedded runtime");
    }

    pub(crate) fn test_bridge() -> Bridge {
        start_runtime();
        Bridge::new(BridgeConfig::default().with_worker_threads(2)).expect("bridge")
    }
}
