use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

use crate::error::DeliveryError;

/// Handle to a periodic background task.
///
/// The task stops on [`shutdown`](Self::shutdown) or when the handle is dropped.
pub struct SweepHandle {
    name: &'static str,
    shutdown_tx: mpsc::Sender<()>,
    task: Option<JoinHandle<()>>,
}

impl SweepHandle {
    /// Run `tick` every `period` on the current tokio runtime.
    ///
    /// The first run happens one full period after spawning.
    pub fn spawn<F>(name: &'static str, period: Duration, mut tick: F) -> Result<Self, DeliveryError>
    where
        F: FnMut() + Send + 'static,
    {
        if period.is_zero() {
            return Err(DeliveryError::Validation(format!(
                "sweeper {name} needs a non-zero period"
            )));
        }
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| DeliveryError::NoRuntime)?;
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

        let task = runtime.spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick of `interval` completes immediately.
            ticker.tick().await;
            debug!(sweeper = name, period_ms = period.as_millis() as u64, "Sweeper started");

            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = ticker.tick() => tick(),
                }
            }

            debug!(sweeper = name, "Sweeper stopped");
        });

        Ok(Self {
            name,
            shutdown_tx,
            task: Some(task),
        })
    }

    /// Stop the task and wait for it to finish.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown_tx.send(()).await;
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    tracing::error!(sweeper = self.name, error = ?e, "Sweeper task panicked");
                }
            }
        }
        info!(sweeper = self.name, "Sweeper shut down");
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }
}

impl Drop for SweepHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
