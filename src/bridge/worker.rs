//! Bounded worker pool for asynchronous operations.
//!
//! Jobs run on tokio's blocking pool (each job holds the execution lock for
//! its whole duration) and hand their single result back through a oneshot
//! channel wrapped in [`PendingCall`].

use super::error::BridgeError;
use super::host_value::HostValue;
use parking_lot::{Condvar, Mutex};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::runtime::Runtime;
use tokio::sync::oneshot;
use tracing::debug;

const WORKER_LOST: &str = "worker terminated before completing the call";

#[derive(Default)]
struct InFlight {
    count: Mutex<usize>,
    idle: Condvar,
}

/// Counts one submitted job until it has delivered its result.
struct Ticket(Arc<InFlight>);

impl Ticket {
    fn issue(in_flight: &Arc<InFlight>) -> Self {
        *in_flight.count.lock() += 1;
        Ticket(Arc::clone(in_flight))
    }
}

impl Drop for Ticket {
    fn drop(&mut self) {
        let mut count = self.0.count.lock();
        *count -= 1;
        if *count == 0 {
            self.0.idle.notify_all();
        }
    }
}

pub(crate) struct WorkerPool {
    runtime: Mutex<Option<Runtime>>,
    in_flight: Arc<InFlight>,
}

impl WorkerPool {
    pub(crate) fn new(threads: usize) -> Result<Self, BridgeError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(threads)
            .thread_name("pybridge-worker")
            .build()
            .map_err(|err| BridgeError::Lifecycle(format!("failed to start worker pool: {err}")))?;
        Ok(Self {
            runtime: Mutex::new(Some(runtime)),
            in_flight: Arc::new(InFlight::default()),
        })
    }

    /// Queue `job`; its return value completes the returned call.
    pub(crate) fn submit<F>(&self, job: F) -> PendingCall
    where
        F: FnOnce() -> HostValue + Send + 'static,
    {
        let runtime = self.runtime.lock();
        let Some(runtime) = runtime.as_ref() else {
            return PendingCall::ready(HostValue::failure("worker pool has been shut down"));
        };

        let (tx, rx) = oneshot::channel();
        let ticket = Ticket::issue(&self.in_flight);
        runtime.spawn_blocking(move || {
            let value = job();
            // The receiver may be gone; the result is then simply discarded.
            let _ = tx.send(value);
            drop(ticket);
        });
        PendingCall::waiting(rx)
    }

    /// Block until every submitted job has delivered its result.
    pub(crate) fn drain(&self) {
        let mut count = self.in_flight.count.lock();
        while *count > 0 {
            self.in_flight.idle.wait(&mut count);
        }
    }

    /// Stop accepting jobs, wait for in-flight ones and release the threads.
    pub(crate) fn shutdown(&self) {
        let runtime = self.runtime.lock().take();
        self.drain();
        if let Some(runtime) = runtime {
            runtime.shutdown_background();
            debug!("worker pool stopped");
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.get_mut().take() {
            runtime.shutdown_background();
        }
    }
}

enum Pending {
    Ready(Option<HostValue>),
    Waiting(oneshot::Receiver<HostValue>),
}

/// Single-shot completion of an asynchronous bridge operation.
///
/// Resolves exactly once. Failures arrive as [`HostValue::Error`] rather than
/// through a separate channel.
#[must_use = "the result of an asynchronous call is only observable through its PendingCall"]
pub struct PendingCall {
    state: Pending,
}

impl PendingCall {
    pub(crate) fn ready(value: HostValue) -> Self {
        Self {
            state: Pending::Ready(Some(value)),
        }
    }

    fn waiting(rx: oneshot::Receiver<HostValue>) -> Self {
        Self {
            state: Pending::Waiting(rx),
        }
    }

    /// Block the calling thread until the call completes.
    ///
    /// Must not be called from inside an async runtime; await the call there.
    pub fn wait(self) -> HostValue {
        match self.state {
            Pending::Ready(value) => value.unwrap_or_else(|| HostValue::failure(WORKER_LOST)),
            Pending::Waiting(rx) => rx
                .blocking_recv()
                .unwrap_or_else(|_| HostValue::failure(WORKER_LOST)),
        }
    }
}

impl Future for PendingCall {
    type Output = HostValue;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<HostValue> {
        let this = self.get_mut();
        match &mut this.state {
            Pending::Ready(value) => Poll::Ready(
                value
                    .take()
                    .unwrap_or_else(|| HostValue::failure("pending call polled after completion")),
            ),
            Pending::Waiting(rx) => Pin::new(rx)
                .poll(cx)
                .map(|received| received.unwrap_or_else(|_| HostValue::failure(WORKER_LOST))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_submit_and_wait() {
        let pool = WorkerPool::new(2).expect("pool");
        let call = pool.submit(|| HostValue::Number(7.0));
        assert_eq!(call.wait(), HostValue::Number(7.0));
    }

    #[tokio::test]
    async fn test_submit_and_await() {
        let pool = WorkerPool::new(2).expect("pool");
        let first = pool.submit(|| HostValue::from("one"));
        let second = pool.submit(|| HostValue::failure("two"));
        assert_eq!(first.await, HostValue::from("one"));
        assert_eq!(second.await.into_outcome(), Err("two".to_string()));
    }

    #[test]
    fn test_panicking_job_reports_failure() {
        let pool = WorkerPool::new(1).expect("pool");
        let call = pool.submit(|| panic!("job exploded"));
        assert_eq!(call.wait(), HostValue::failure(WORKER_LOST));
        pool.drain();
    }

    #[test]
    fn test_submit_after_shutdown() {
        let pool = WorkerPool::new(1).expect("pool");
        pool.shutdown();
        let call = pool.submit(|| HostValue::Null);
        assert!(call.wait().is_failure());
    }

    #[test]
    fn test_shutdown_waits_for_in_flight_jobs() {
        let pool = WorkerPool::new(1).expect("pool");
        let call = pool.submit(|| {
            std::thread::sleep(std::time::Duration::from_millis(50));
            HostValue::Bool(true)
        });
        pool.shutdown();
        assert_eq!(call.wait(), HostValue::Bool(true));
    }
}
