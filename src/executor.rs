use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc;
use std::thread::{self, ThreadId};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::session::SessionLock;
use crate::types::{ToolError, ToolErrorCode};

type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecutorError {
    #[error("operation did not complete on the viewer thread within {0:?}")]
    Timeout(Duration),
    #[error("viewer thread is no longer running")]
    Closed,
    #[error("operation panicked on the viewer thread: {0}")]
    Panicked(String),
}

impl From<ExecutorError> for ToolError {
    fn from(err: ExecutorError) -> Self {
        let code = match err {
            ExecutorError::Timeout(_) => ToolErrorCode::Timeout,
            ExecutorError::Closed => ToolErrorCode::Unavailable,
            ExecutorError::Panicked(_) => ToolErrorCode::Internal,
        };
        ToolError::new(code, err.to_string())
    }
}

/// Runs closures on the single thread allowed to touch the viewer.
///
/// Jobs submitted from other threads are delivered over an ordered channel
/// and executed one at a time in submission order. The async entry points
/// also hold the [`SessionLock`] for the duration of the job, so lock order
/// and execution order are the same.
pub struct MainContextExecutor {
    jobs: mpsc::Sender<Job>,
    designated: ThreadId,
    lock: SessionLock,
    call_timeout: Duration,
}

impl MainContextExecutor {
    pub fn spawn(thread_name: &str, call_timeout: Duration) -> Result<Self> {
        let (jobs, queue) = mpsc::channel::<Job>();
        let worker = thread::Builder::new()
            .name(thread_name.to_owned())
            .spawn(move || {
                while let Ok(job) = queue.recv() {
                    job();
                }
                debug!("viewer thread job queue closed");
            })
            .with_context(|| format!("failed spawning {thread_name} thread"))?;
        let designated = worker.thread().id();
        Ok(Self {
            jobs,
            designated,
            lock: SessionLock::default(),
            call_timeout,
        })
    }

    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    pub fn is_designated(&self) -> bool {
        thread::current().id() == self.designated
    }

    /// Serialized execution with the default call timeout.
    pub async fn run<T, F>(&self, op: F) -> Result<T, ExecutorError>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        self.run_with_timeout(self.call_timeout, op).await
    }

    pub async fn run_with_timeout<T, F>(&self, timeout: Duration, op: F) -> Result<T, ExecutorError>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        if self.is_designated() {
            return invoke(op);
        }
        let _guard = self.lock.acquire().await;
        let (reply, answer) = oneshot::channel();
        self.submit(Box::new(move || {
            let _ = reply.send(invoke(op));
        }))?;
        match tokio::time::timeout(timeout, answer).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(ExecutorError::Closed),
            Err(_) => {
                warn!("viewer thread call exceeded {timeout:?}; the job may still run later");
                Err(ExecutorError::Timeout(timeout))
            }
        }
    }

    fn submit(&self, job: Job) -> Result<(), ExecutorError> {
        self.jobs.send(job).map_err(|_| ExecutorError::Closed)
    }
}

fn invoke<T, F>(op: F) -> Result<T, ExecutorError>
where
    F: FnOnce() -> T,
{
    panic::catch_unwind(AssertUnwindSafe(op)).map_err(|payload| {
        let message = panic_message(payload.as_ref());
        warn!("viewer thread job panicked: {message}");
        ExecutorError::Panicked(message)
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_owned()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "unknown panic payload".to_owned()
    }
}
