use super::Dispatcher;
use crate::core::{ProxyError, Result};
use log::{debug, error, info};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Background task running [`Dispatcher::sweep_idle`] on a fixed period.
///
/// The task holds only a weak reference, so it ends by itself once the
/// dispatcher is gone. An unexpected sweep error stops the task and
/// nothing else.
pub struct IdleReclaimer {
    stop_tx: Option<oneshot::Sender<()>>,
    join_handle: Option<JoinHandle<()>>,
}

impl IdleReclaimer {
    /// Starts the sweep with the configured period, or returns `None` when
    /// reclamation is disabled.
    pub fn spawn(dispatcher: &Arc<Dispatcher>) -> Option<Self> {
        let period = dispatcher.config().reclaim_period()?;
        Some(Self::with_period(dispatcher, period))
    }

    pub fn with_period(dispatcher: &Arc<Dispatcher>, period: Duration) -> Self {
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let dispatcher: Weak<Dispatcher> = Arc::downgrade(dispatcher);
        info!("Idle reclamation every {}ms", period.as_millis());

        let join_handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = &mut stop_rx => {
                        break;
                    }
                    _ = ticker.tick() => {
                        let Some(dispatcher) = dispatcher.upgrade() else {
                            break;
                        };
                        match dispatcher.sweep_idle().await {
                            Ok(report) => debug!("Idle sweep: {:?}", report),
                            Err(err) => {
                                error!("Idle reclamation stopped: {}", err);
                                break;
                            }
                        }
                    }
                }
            }
        });

        Self {
            stop_tx: Some(stop_tx),
            join_handle: Some(join_handle),
        }
    }

    pub fn is_running(&self) -> bool {
        self.join_handle
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    /// Signals the task to stop and waits for it to finish.
    pub async fn stop(mut self) -> Result<()> {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }

        if let Some(join_handle) = self.join_handle.take() {
            join_handle
                .await
                .map_err(|err| ProxyError::Reclamation(format!("reclaimer join: {}", err)))?;
        }
        Ok(())
    }
}

impl Drop for IdleReclaimer {
    fn drop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(join_handle) = self.join_handle.take() {
            join_handle.abort();
        }
    }
}
