use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::executor::{ExecutorError, MainContextExecutor};
use crate::session::{PumpTick, SessionContext};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpStart {
    Started,
    AlreadyRunning,
}

/// Background task that keeps the viewer's event loop turning between tool
/// calls. Each pass goes through the executor, so it never overlaps a call.
pub struct EventPump {
    interval: Duration,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl EventPump {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            task: Mutex::new(None),
        }
    }

    pub fn start(&self, session: Arc<SessionContext>, executor: Arc<MainContextExecutor>) -> PumpStart {
        let Ok(mut slot) = self.task.lock() else {
            warn!("event pump state lock poisoned");
            return PumpStart::AlreadyRunning;
        };
        if slot.as_ref().is_some_and(|task| !task.is_finished()) {
            return PumpStart::AlreadyRunning;
        }
        let interval = self.interval;
        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let session = session.clone();
                match executor.run(move || session.pump()).await {
                    Ok(Ok(PumpTick::Alive)) => {}
                    Ok(Ok(PumpTick::Idle)) => {
                        debug!("event pump idle; stopping");
                        break;
                    }
                    Ok(Ok(PumpTick::Destroyed)) => {
                        debug!("viewer window gone; event pump stopping");
                        break;
                    }
                    Ok(Err(err)) => {
                        warn!("event pump pass failed: {err}");
                        break;
                    }
                    Err(ExecutorError::Timeout(elapsed)) => {
                        debug!("event pump pass exceeded {elapsed:?}; retrying");
                    }
                    Err(err) => {
                        warn!("event pump stopping: {err}");
                        break;
                    }
                }
            }
        }));
        debug!("event pump started ({interval:?} interval)");
        PumpStart::Started
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .map(|slot| slot.as_ref().is_some_and(|task| !task.is_finished()))
            .unwrap_or(false)
    }

    pub async fn stop(&self) {
        let task = match self.task.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };
        if let Some(task) = task {
            task.abort();
            let _ = task.await;
            debug!("event pump stopped");
        }
    }
}
