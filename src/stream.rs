//! Per-camera acquisition worker.
//!
//! A `StreamSource` owns one thread that keeps one camera connected:
//!
//! ```text
//! loop {
//!     open ── Err ──> report Unreachable, backoff ──┐
//!      │                                            │
//!      └─ Ok ──> read ── Some ──> FrameStore::put, trigger
//!                 │ ─── None ──> (read timeout) read again
//!                 └─── Err ───> release, report ReadFailure, backoff
//! }
//! ```
//!
//! Stop is signalled by dropping the stop sender: the worker sees a
//! disconnected channel between reads and during backoff, so `stop()` returns
//! within one read timeout.

use anyhow::{anyhow, Context, Result};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::config::StreamConfig;
use crate::frame::{Frame, FrameStore};
use crate::ingest::Connector;
use crate::pipeline::Trigger;
use crate::{CameraId, ErrorEvent, ErrorKind};

pub struct StreamSource {
    store: Arc<FrameStore>,
    trigger: Trigger,
    errors: Sender<ErrorEvent>,
    connector: Arc<dyn Connector>,
    backoff: Duration,
    worker: Option<Worker>,
}

struct Worker {
    config: StreamConfig,
    stop: Sender<()>,
    join: JoinHandle<()>,
}

impl StreamSource {
    pub fn new(
        store: Arc<FrameStore>,
        trigger: Trigger,
        errors: Sender<ErrorEvent>,
        connector: Arc<dyn Connector>,
        backoff: Duration,
    ) -> Self {
        Self {
            store,
            trigger,
            errors,
            connector,
            backoff,
            worker: None,
        }
    }

    /// Spawn the worker for `config` and return immediately.
    ///
    /// Fails only for a malformed or disabled config, a camera the store cannot
    /// hold, or a source that is already running.
    pub fn start(&mut self, config: StreamConfig) -> Result<()> {
        if let Some(worker) = &self.worker {
            return Err(anyhow!(
                "{} stream is already running",
                worker.config.camera_id
            ));
        }
        config.validate()?;
        if !config.enabled {
            return Err(anyhow!(
                "{} is disabled and cannot be started",
                config.camera_id
            ));
        }
        if config.camera_id.get() as usize > self.store.capacity() {
            return Err(anyhow!(
                "{} exceeds frame store capacity {}",
                config.camera_id,
                self.store.capacity()
            ));
        }

        let (stop_tx, stop_rx) = bounded::<()>(1);
        let context = WorkerContext {
            config: config.clone(),
            store: Arc::clone(&self.store),
            trigger: self.trigger.clone(),
            errors: self.errors.clone(),
            connector: Arc::clone(&self.connector),
            backoff: self.backoff,
            stop: stop_rx,
        };
        let join = thread::Builder::new()
            .name(format!("stream-{}", config.camera_id.get()))
            .spawn(move || context.run())
            .with_context(|| format!("spawn stream worker for {}", config.camera_id))?;

        self.worker = Some(Worker {
            config,
            stop: stop_tx,
            join,
        });
        Ok(())
    }

    /// Stop the worker and wait until it has exited and released its connection.
    ///
    /// Idempotent. Safe to call when `start` never succeeded.
    pub fn stop(&mut self) -> Result<()> {
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };
        let camera_id = worker.config.camera_id;
        drop(worker.stop);
        worker
            .join
            .join()
            .map_err(|_| anyhow!("stream worker thread for {} panicked", camera_id))?;
        log::info!("{}: stream stopped", camera_id);
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.worker
            .as_ref()
            .is_some_and(|worker| !worker.join.is_finished())
    }

    pub fn camera_id(&self) -> Option<CameraId> {
        self.worker.as_ref().map(|worker| worker.config.camera_id)
    }

    /// The config the running worker was started with.
    pub fn config(&self) -> Option<&StreamConfig> {
        self.worker.as_ref().map(|worker| &worker.config)
    }
}

impl Drop for StreamSource {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            log::error!("{:#}", err);
        }
    }
}

// ----------------------------------------------------------------------------
// Worker loop
// ----------------------------------------------------------------------------

struct WorkerContext {
    config: StreamConfig,
    store: Arc<FrameStore>,
    trigger: Trigger,
    errors: Sender<ErrorEvent>,
    connector: Arc<dyn Connector>,
    backoff: Duration,
    stop: Receiver<()>,
}

impl WorkerContext {
    fn run(self) {
        let camera_id = self.config.camera_id;
        let url = self.config.redacted_url();
        let mut sequence = 0u64;

        while !self.stop_requested() {
            log::info!("{}: connecting to {}", camera_id, url);
            let mut source = match self.connector.open(&self.config) {
                Ok(source) => source,
                Err(err) => {
                    log::warn!("{}: cannot open {}: {:#}", camera_id, url, err);
                    self.report(
                        ErrorKind::Unreachable,
                        format!("cannot open {}: {:#}", url, err),
                    );
                    if self.wait_backoff() {
                        break;
                    }
                    continue;
                }
            };
            log::info!("{}: streaming from {}", camera_id, url);

            let failure = loop {
                if self.stop_requested() {
                    return;
                }
                match source.next_frame() {
                    Ok(Some(image)) => {
                        sequence += 1;
                        let delivered = Frame::new(camera_id, sequence, image)
                            .and_then(|frame| self.store.put(frame));
                        if let Err(err) = delivered {
                            break err;
                        }
                        self.trigger.notify();
                    }
                    Ok(None) => continue,
                    Err(err) => break err,
                }
            };

            drop(source);
            log::warn!("{}: read from {} failed: {:#}", camera_id, url, failure);
            self.report(
                ErrorKind::ReadFailure,
                format!("read from {} failed: {:#}", url, failure),
            );
            if self.wait_backoff() {
                break;
            }
        }
    }

    fn stop_requested(&self) -> bool {
        !matches!(self.stop.try_recv(), Err(TryRecvError::Empty))
    }

    /// Sleep for the backoff interval. Returns true if stop was requested meanwhile.
    fn wait_backoff(&self) -> bool {
        log::debug!(
            "{}: retrying in {:?}",
            self.config.camera_id,
            self.backoff
        );
        !matches!(
            self.stop.recv_timeout(self.backoff),
            Err(RecvTimeoutError::Timeout)
        )
    }

    fn report(&self, kind: ErrorKind, message: String) {
        // The pipeline may already be gone during shutdown.
        let _ = self
            .errors
            .send(ErrorEvent::new(self.config.camera_id, kind, message));
    }
}
