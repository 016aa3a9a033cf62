use super::{SessionHandle, expect_unit};
use crate::command::Command;
use crate::core::ErrorKind;
use log::{debug, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Periodic ping keeping a quiet session from being reclaimed as idle.
///
/// Stops on [`KeepAlive::stop`], on drop, or once the server no longer
/// knows the session.
pub struct KeepAlive {
    stop_tx: Option<oneshot::Sender<()>>,
    join_handle: Option<JoinHandle<()>>,
}

impl KeepAlive {
    pub(crate) fn spawn(session: Arc<SessionHandle>, interval: Duration) -> Self {
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();

        let join_handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut stop_rx => {
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {
                        match session.send(None, Command::Ping).await.and_then(expect_unit) {
                            Ok(()) => debug!("Keep-alive ping for {}", session.session_id),
                            Err(e) if e.kind() == ErrorKind::Protocol => {
                                warn!("Keep-alive for {} stopped: {}", session.session_id, e);
                                break;
                            }
                            Err(e) => warn!("Keep-alive ping for {} failed: {}", session.session_id, e),
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

    pub async fn stop(mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(join_handle) = self.join_handle.take() {
            let _ = join_handle.await;
        }
    }
}

impl Drop for KeepAlive {
    fn drop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(join_handle) = self.join_handle.take() {
            join_handle.abort();
        }
    }
}
