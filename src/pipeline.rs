//! The display control loop.
//!
//! `DisplayPipeline` owns the frame store, the per-camera `StreamSource`s and
//! one composite worker thread. The worker waits on three channels:
//!
//! - trigger: bounded(1), `try_send` from producers. Any number of new frames or
//!   config changes arriving during a pass collapse into one more pass, which
//!   reads the latest state.
//! - errors: unbounded, FIFO per source. Forwarded to the render surface as-is.
//! - shutdown: never sent on; dropping the sender ends the loop.
//!
//! Display config, label style and the slot list are written only through the
//! pipeline's setters and cloned by the worker at the start of each pass. The
//! compositor itself belongs to the worker: a new detection hook is sent over a
//! channel and swapped in before the next pass, so the control path never waits
//! on a running pass.

use anyhow::{anyhow, Context, Result};
use crossbeam_channel::{bounded, select, unbounded, Receiver, Sender};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::compositor::{Compositor, Slot};
use crate::config::{validate_stream_configs, DisplayConfig, StreamConfig};
use crate::detect::DetectionHook;
use crate::frame::{Canvas, FrameStore};
use crate::ingest::Connector;
use crate::overlay::LabelStyle;
use crate::stream::StreamSource;
use crate::{CameraId, ErrorEvent};

/// Receives composited canvases and error events.
///
/// Called from the composite worker thread; implementations should hand work
/// off quickly since a slow surface delays the next pass.
pub trait RenderSurface: Send + Sync {
    fn present(&self, canvas: &Canvas);
    fn report(&self, event: &ErrorEvent);
}

/// Coalescing "recompose" signal.
#[derive(Clone, Debug)]
pub struct Trigger {
    tx: Sender<()>,
}

impl Trigger {
    /// A trigger and the receiving end the composite worker waits on.
    pub fn channel() -> (Self, Receiver<()>) {
        let (tx, rx) = bounded(1);
        (Self { tx }, rx)
    }

    /// Request a pass. A no-op when one is already pending.
    pub fn notify(&self) {
        let _ = self.tx.try_send(());
    }
}

#[derive(Clone, Debug)]
pub struct PipelineOptions {
    /// Pause between reconnect attempts of every stream.
    pub backoff: Duration,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            backoff: Duration::from_secs(2),
        }
    }
}

/// State shared between the control path and the composite worker.
struct Shared {
    display: RwLock<DisplayConfig>,
    style: RwLock<LabelStyle>,
    slots: RwLock<Vec<Slot>>,
}

type HookUpdate = Option<Box<dyn DetectionHook>>;

struct CompositeWorker {
    shutdown: Sender<()>,
    join: JoinHandle<()>,
}

pub struct DisplayPipeline {
    store: Arc<FrameStore>,
    shared: Arc<Shared>,
    connector: Arc<dyn Connector>,
    options: PipelineOptions,
    configs: Vec<StreamConfig>,
    sources: BTreeMap<CameraId, StreamSource>,
    trigger: Trigger,
    errors: Sender<ErrorEvent>,
    hooks: Sender<HookUpdate>,
    worker: Option<CompositeWorker>,
}

impl DisplayPipeline {
    /// Validate `configs` and start the composite worker.
    ///
    /// Streams are not opened until `start_streams`. An initial pass is
    /// requested so the surface gets a placeholder canvas right away.
    pub fn new(
        configs: Vec<StreamConfig>,
        display: DisplayConfig,
        style: LabelStyle,
        surface: Arc<dyn RenderSurface>,
        connector: Arc<dyn Connector>,
        options: PipelineOptions,
    ) -> Result<Self> {
        validate_stream_configs(&configs)?;
        if options.backoff.is_zero() {
            return Err(anyhow!("reconnect backoff must be non-zero"));
        }

        let store = Arc::new(FrameStore::new());
        let shared = Arc::new(Shared {
            display: RwLock::new(display),
            style: RwLock::new(style),
            slots: RwLock::new(configs.iter().map(Slot::from).collect()),
        });
        let (trigger, trigger_rx) = Trigger::channel();
        let (errors, errors_rx) = unbounded();
        let (hooks, hooks_rx) = unbounded();
        let (shutdown, shutdown_rx) = bounded::<()>(1);

        let loop_state = CompositeLoop {
            store: Arc::clone(&store),
            shared: Arc::clone(&shared),
            compositor: Compositor::new(),
            surface,
            pass: 0,
            overlay_failures: HashSet::new(),
        };
        let join = thread::Builder::new()
            .name("composite".to_string())
            .spawn(move || loop_state.run(trigger_rx, errors_rx, hooks_rx, shutdown_rx))
            .context("spawn composite worker")?;

        trigger.notify();
        Ok(Self {
            store,
            shared,
            connector,
            options,
            configs,
            sources: BTreeMap::new(),
            trigger,
            errors,
            hooks,
            worker: Some(CompositeWorker { shutdown, join }),
        })
    }

    pub fn store(&self) -> &Arc<FrameStore> {
        &self.store
    }

    pub fn stream_configs(&self) -> &[StreamConfig] {
        &self.configs
    }

    pub fn display_config(&self) -> DisplayConfig {
        *self.shared.display.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn label_style(&self) -> LabelStyle {
        self.shared
            .style
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Cameras with a live acquisition worker.
    pub fn running_streams(&self) -> Vec<CameraId> {
        self.sources
            .iter()
            .filter(|(_, source)| source.is_running())
            .map(|(id, _)| *id)
            .collect()
    }

    // -------------------- Streams --------------------

    /// Start every enabled camera that is not already running.
    pub fn start_streams(&mut self) -> Result<()> {
        for config in self.configs.iter().filter(|config| config.enabled) {
            if self.sources.contains_key(&config.camera_id) {
                continue;
            }
            let mut source = StreamSource::new(
                Arc::clone(&self.store),
                self.trigger.clone(),
                self.errors.clone(),
                Arc::clone(&self.connector),
                self.options.backoff,
            );
            source.start(config.clone())?;
            self.sources.insert(config.camera_id, source);
        }
        log::info!("started {} stream(s)", self.sources.len());
        self.trigger.notify();
        Ok(())
    }

    /// Stop every stream and wait for all of them. Configuration and the last
    /// frames are kept.
    pub fn stop_streams(&mut self) -> Result<()> {
        let mut first_err = None;
        for (_, mut source) in std::mem::take(&mut self.sources) {
            if let Err(err) = source.stop() {
                log::error!("{:#}", err);
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Replace the stream set: stop all, swap configuration, start all enabled.
    ///
    /// The new set is validated before anything is stopped, so an invalid set
    /// leaves the pipeline untouched. Frames survive only for cameras whose
    /// configuration is unchanged and still enabled.
    pub fn reconfigure_streams(&mut self, configs: Vec<StreamConfig>) -> Result<()> {
        validate_stream_configs(&configs)?;

        let stopped = self.stop_streams();
        let previous = std::mem::replace(&mut self.configs, configs);
        let unchanged: HashSet<CameraId> = self
            .configs
            .iter()
            .filter(|config| config.enabled && previous.contains(config))
            .map(|config| config.camera_id)
            .collect();
        self.store.retain(|id| unchanged.contains(&id));
        *self.shared.slots.write().unwrap_or_else(PoisonError::into_inner) =
            self.configs.iter().map(Slot::from).collect();
        log::info!(
            "stream configuration applied ({} camera(s), {} enabled)",
            self.configs.len(),
            self.configs.iter().filter(|config| config.enabled).count()
        );

        let started = self.start_streams();
        self.trigger.notify();
        stopped.and(started)
    }

    /// Setter for the configuration collaborator. Same as `reconfigure_streams`.
    pub fn apply_stream_config(&mut self, configs: Vec<StreamConfig>) -> Result<()> {
        self.reconfigure_streams(configs)
    }

    // -------------------- Display --------------------

    pub fn apply_display_config(&self, display: DisplayConfig) {
        *self.shared.display.write().unwrap_or_else(PoisonError::into_inner) = display;
        log::info!(
            "display config applied: {:?} {:?} rotate={}",
            display.resolution,
            display.aspect_mode,
            display.rotate
        );
        self.trigger.notify();
    }

    pub fn apply_label_style(&self, style: LabelStyle) {
        *self.shared.style.write().unwrap_or_else(PoisonError::into_inner) = style;
        self.trigger.notify();
    }

    /// Install (or with `None`, remove) the per-tile detection hook.
    ///
    /// The hook is warmed up here and takes effect from the next pass; a pass
    /// already running finishes with the previous hook.
    pub fn set_detection_hook(&self, hook: Option<Box<dyn DetectionHook>>) -> Result<()> {
        let mut hook = hook;
        if let Some(hook) = hook.as_mut() {
            hook.warm_up()
                .with_context(|| format!("warm up detector {}", hook.name()))?;
        }
        let name = hook.as_ref().map(|hook| hook.name());
        self.hooks
            .send(hook)
            .map_err(|_| anyhow!("composite worker is not running"))?;
        match name {
            Some(name) => log::info!("detector {} installed", name),
            None => log::info!("detector removed"),
        }
        self.trigger.notify();
        Ok(())
    }

    /// Force one composite pass with the current state.
    pub fn request_composite(&self) {
        self.trigger.notify();
    }

    /// Stop all streams and the composite worker. Idempotent.
    pub fn shutdown(&mut self) -> Result<()> {
        let stopped = self.stop_streams();
        if let Some(worker) = self.worker.take() {
            drop(worker.shutdown);
            worker
                .join
                .join()
                .map_err(|_| anyhow!("composite worker thread panicked"))?;
            log::info!("display pipeline shut down");
        }
        stopped
    }
}

impl Drop for DisplayPipeline {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            log::error!("{:#}", err);
        }
    }
}

// ----------------------------------------------------------------------------
// Composite worker
// ----------------------------------------------------------------------------

struct CompositeLoop {
    store: Arc<FrameStore>,
    shared: Arc<Shared>,
    compositor: Compositor,
    surface: Arc<dyn RenderSurface>,
    pass: u64,
    /// Overlay failures reported by the previous pass, suppressed while they repeat.
    overlay_failures: HashSet<(CameraId, String)>,
}

impl CompositeLoop {
    fn run(
        mut self,
        trigger: Receiver<()>,
        errors: Receiver<ErrorEvent>,
        hooks: Receiver<HookUpdate>,
        shutdown: Receiver<()>,
    ) {
        loop {
            select! {
                recv(trigger) -> msg => {
                    if msg.is_err() {
                        break;
                    }
                    for hook in hooks.try_iter() {
                        self.compositor.set_detection_hook(hook);
                    }
                    self.composite();
                }
                recv(errors) -> msg => {
                    if let Ok(event) = msg {
                        self.surface.report(&event);
                    }
                }
                recv(shutdown) -> _ => break,
            }
        }
        for event in errors.try_iter() {
            self.surface.report(&event);
        }
    }

    fn composite(&mut self) {
        let started = Instant::now();
        let snapshot = self.store.snapshot();
        let slots = self
            .shared
            .slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let display = *self
            .shared
            .display
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let style = self
            .shared
            .style
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        self.pass += 1;
        let mut failures = Vec::new();
        let canvas = self.compositor.compose(
            &slots,
            &snapshot,
            &display,
            &style,
            self.pass,
            &mut |event| failures.push(event),
        );

        self.report_overlay_failures(failures);
        self.surface.present(&canvas);
        log::debug!(
            "composite pass {}: {} live frame(s), {}x{} in {:?}",
            self.pass,
            snapshot.len(),
            canvas.width(),
            canvas.height(),
            started.elapsed()
        );
    }

    fn report_overlay_failures(&mut self, failures: Vec<ErrorEvent>) {
        let mut current = HashSet::with_capacity(failures.len());
        for event in failures {
            let key = (event.camera_id, event.message.clone());
            if !self.overlay_failures.contains(&key) {
                log::warn!("{}", event);
                self.surface.report(&event);
            }
            current.insert(key);
        }
        self.overlay_failures = current;
    }
}
