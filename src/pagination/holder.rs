use super::{PaginationSettings, RowPacket, RowSource};
use crate::core::{ColumnMeta, ProxyError, Result};
use crate::driver::DriverResultSet;
use crate::worker::WorkerPool;
use log::{debug, warn};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HolderPhase {
    /// A background task is filling the next packet.
    Populating,
    /// The next packet (or the error that replaced it) is waiting.
    Ready,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HolderStats {
    pub packets_delivered: u64,
    pub rows_delivered: u64,
}

/// What the holder has for the next `next_packet` call. A ready slot
/// always carries its packet or error.
enum Slot {
    Populating,
    Ready(Result<RowPacket>),
    Closed,
}

struct HolderState {
    slot: Slot,
    stats: HolderStats,
}

struct HolderInner {
    state: Mutex<HolderState>,
    ready: Notify,
    source: tokio::sync::Mutex<RowSource>,
    packet_size: usize,
    wait_timeout: Duration,
    workers: WorkerPool,
}

enum Step {
    Deliver { packet: RowPacket, more: bool },
    Fail(ProxyError),
    Wait,
}

/// Server-side owner of the part of a query result not yet sent.
///
/// While the client consumes one packet the holder is already filling the
/// next one on the worker pool, so a `next_packet` call usually finds it
/// ready.
pub struct CursorHolder {
    inner: Arc<HolderInner>,
    columns: Vec<ColumnMeta>,
}

impl CursorHolder {
    /// Reads the first packet inline. A holder is only created when more
    /// rows remain after it.
    pub async fn open(
        result_set: Box<dyn DriverResultSet>,
        settings: &PaginationSettings,
        workers: WorkerPool,
    ) -> Result<(Vec<ColumnMeta>, RowPacket, Option<CursorHolder>)> {
        let mut source = RowSource::new(result_set);
        let columns = source.columns().to_vec();

        let first = match source.next_packet(settings.packet_size).await {
            Ok(packet) => packet,
            Err(e) => {
                source.close().await;
                return Err(e);
            }
        };
        if first.last_part() {
            return Ok((columns, first, None));
        }

        let inner = Arc::new(HolderInner {
            state: Mutex::new(HolderState {
                slot: Slot::Populating,
                stats: HolderStats {
                    packets_delivered: 1,
                    rows_delivered: first.row_count() as u64,
                },
            }),
            ready: Notify::new(),
            source: tokio::sync::Mutex::new(source),
            packet_size: settings.packet_size.max(1),
            wait_timeout: settings.wait_timeout,
            workers,
        });
        HolderInner::start_population(&inner).await;

        let holder = CursorHolder {
            inner,
            columns: columns.clone(),
        };
        Ok((columns, first, Some(holder)))
    }

    pub fn columns(&self) -> &[ColumnMeta] {
        &self.columns
    }

    pub fn phase(&self) -> HolderPhase {
        match self.inner.state.lock().slot {
            Slot::Populating => HolderPhase::Populating,
            Slot::Ready(_) => HolderPhase::Ready,
            Slot::Closed => HolderPhase::Closed,
        }
    }

    pub fn stats(&self) -> HolderStats {
        self.inner.state.lock().stats
    }

    /// Hands over the next packet, waiting at most the configured timeout
    /// for the background population to finish. An error raised while
    /// populating is returned here and closes the holder.
    pub async fn next_packet(&self) -> Result<RowPacket> {
        let deadline = tokio::time::Instant::now() + self.inner.wait_timeout;

        loop {
            let notified = self.inner.ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let step = {
                let mut state = self.inner.state.lock();
                match std::mem::replace(&mut state.slot, Slot::Closed) {
                    Slot::Closed => Step::Fail(ProxyError::Cursor("cursor is closed".to_string())),
                    Slot::Populating => {
                        state.slot = Slot::Populating;
                        Step::Wait
                    }
                    Slot::Ready(Err(error)) => Step::Fail(error),
                    Slot::Ready(Ok(packet)) => {
                        state.stats.packets_delivered += 1;
                        state.stats.rows_delivered += packet.row_count() as u64;
                        let more = !packet.last_part();
                        if more {
                            state.slot = Slot::Populating;
                        }
                        Step::Deliver { packet, more }
                    }
                }
            };

            match step {
                Step::Deliver { packet, more } => {
                    if more {
                        HolderInner::start_population(&self.inner).await;
                    }
                    return Ok(packet);
                }
                Step::Fail(error) => {
                    self.inner.source.lock().await.close().await;
                    return Err(error);
                }
                Step::Wait => {
                    if tokio::time::timeout_at(deadline, notified.as_mut()).await.is_err() {
                        return Err(ProxyError::Timeout(format!(
                            "next packet not ready within {:?}",
                            self.inner.wait_timeout
                        )));
                    }
                }
            }
        }
    }

    /// Discards the remainder. A population still in flight notices the
    /// closed state once it lets go of the source and releases it itself.
    pub async fn close(&self) {
        self.inner.state.lock().slot = Slot::Closed;
        self.inner.ready.notify_waiters();

        if let Ok(mut source) = self.inner.source.try_lock() {
            source.close().await;
        }
    }
}

impl HolderInner {
    async fn start_population(inner: &Arc<HolderInner>) {
        let task = inner.clone();
        inner.workers.submit(async move { task.populate().await }).await;
    }

    /// The source lock is released before the outcome is published, so a
    /// concurrent `close` either finds the source free or is seen here.
    async fn populate(&self) {
        let result = {
            let mut source = self.source.lock().await;
            if source.is_exhausted() {
                Ok(RowPacket::empty(source.columns(), true))
            } else {
                source.next_packet(self.packet_size).await
            }
        };

        let closed = {
            let mut state = self.state.lock();
            if matches!(state.slot, Slot::Closed) {
                true
            } else {
                if let Err(error) = &result {
                    warn!("Cursor population failed: {}", error);
                }
                state.slot = Slot::Ready(result);
                false
            }
        };

        if closed {
            debug!("Cursor closed while populating, releasing source");
            self.source.lock().await.close().await;
            return;
        }
        self.ready.notify_waiters();
    }
}
