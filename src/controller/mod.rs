//! Controller tree
//!
//! Commands enter at the root manager, are routed by [`FunctionGroup`] down
//! to one leaf controller and are executed there. `execute` never blocks:
//! each leaf hands commands to its own dispatcher thread, which runs them
//! in arrival order and schedules long-lived tasks on the leaf's pool.
//!
//! ```text
//! Main
//! └── Audio
//!     ├── Playback
//!     ├── Record
//!     └── VoIP
//! ```

pub mod broadcast;
pub mod handoff;
pub mod manager;
pub mod playback;
pub mod pool;
pub mod record;
pub mod task;
pub mod voip;

pub use broadcast::{StateChange, StateListener, Subscription};
pub use manager::ManagerController;

use crate::audio::wav::{MediaPlayer, PassthroughTranscoder, Transcoder, WavLoopPlayer};
use crate::audio::SharedDevice;
use crate::config::EngineConfig;
use crate::function::{Ack, Command, CommandIdGenerator, FunctionGroup, SharedListener, WorkerFunction};
use anyhow::{bail, Context, Result};
use broadcast::Broadcaster;
use crossbeam_channel::{bounded, unbounded, Sender};
use std::fs;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;
use task::{StopRequest, StopToken};

pub const MAIN: &str = "Main";
pub const AUDIO: &str = "Audio";
/// Controllers that own a data directory
pub const LEAVES: [&str; 3] = [playback::NAME, record::NAME, voip::NAME];

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Inactive,
    Active,
    Destroyed,
}

pub trait Controller: Send + Sync {
    fn name(&self) -> &str;

    fn lifecycle(&self) -> Lifecycle;

    /// Inactive to active; fails once destroyed
    fn activate(&self) -> Result<()>;

    /// Stop everything and release threads; terminal
    fn destroy(&self);

    /// Returns immediately; results arrive through `listener`
    fn execute(&self, function: WorkerFunction, listener: SharedListener);

    fn subscribe(&self, listener: Arc<dyn StateListener>) -> Subscription;

    /// Labels of the tasks currently running below this controller
    fn running(&self) -> Vec<String>;

    fn children(&self) -> Vec<Arc<dyn Controller>> {
        Vec::new()
    }

    /// Depth-first search below this controller
    fn find(&self, name: &str) -> Option<Arc<dyn Controller>> {
        for child in self.children() {
            if child.name() == name {
                return Some(child);
            }
            if let Some(found) = child.find(name) {
                return Some(found);
            }
        }
        None
    }
}

/// Shared runtime every leaf controller is built from
#[derive(Clone)]
pub struct ControllerEnv {
    pub device: SharedDevice,
    pub engine: EngineConfig,
    /// Each controller keeps its files in `<data_root>/<name>`
    pub data_root: PathBuf,
    pub ids: Arc<CommandIdGenerator>,
    pub transcoder: Arc<dyn Transcoder>,
    pub player: Arc<dyn MediaPlayer>,
}

impl ControllerEnv {
    pub fn new(device: SharedDevice, engine: EngineConfig, data_root: PathBuf) -> Self {
        let ids = Arc::new(CommandIdGenerator::new(engine.serial()));
        Self {
            device,
            engine,
            data_root,
            ids,
            transcoder: Arc::new(PassthroughTranscoder),
            player: Arc::new(WavLoopPlayer),
        }
    }

    pub fn with_transcoder(mut self, transcoder: Arc<dyn Transcoder>) -> Self {
        self.transcoder = transcoder;
        self
    }

    pub fn with_player(mut self, player: Arc<dyn MediaPlayer>) -> Self {
        self.player = player;
        self
    }

    pub fn data_dir(&self, controller: &str) -> PathBuf {
        self.data_root.join(controller)
    }
}

/// Lifecycle and state broadcasting common to every controller
pub struct ControllerCore {
    name: String,
    lifecycle: Mutex<Lifecycle>,
    broadcaster: Broadcaster,
}

impl ControllerCore {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            lifecycle: Mutex::new(Lifecycle::Inactive),
            broadcaster: Broadcaster::start(name),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn lifecycle(&self) -> Lifecycle {
        *self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns true on the inactive to active transition
    pub fn activate(&self) -> Result<bool> {
        let mut lifecycle = self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner);
        match *lifecycle {
            Lifecycle::Inactive => {
                *lifecycle = Lifecycle::Active;
                log::info!("✓ {} controller activated", self.name);
                Ok(true)
            }
            Lifecycle::Active => Ok(false),
            Lifecycle::Destroyed => bail!("{} controller is destroyed", self.name),
        }
    }

    /// Returns false if already destroyed
    pub fn begin_destroy(&self) -> bool {
        let mut lifecycle = self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner);
        if *lifecycle == Lifecycle::Destroyed {
            return false;
        }
        *lifecycle = Lifecycle::Destroyed;
        log::info!("Stopping {} controller...", self.name);
        true
    }

    pub fn finish_destroy(&self) {
        self.broadcaster.stop();
        log::info!("✓ {} controller stopped", self.name);
    }

    /// Ack -1 and return false unless active
    pub fn admit(&self, function: &WorkerFunction, listener: &SharedListener) -> bool {
        if self.lifecycle() == Lifecycle::Active {
            return true;
        }
        log::warn!("{}: {} while not active", self.name, function.kind());
        listener.on_ack(Ack::to_function(function).with_description("controller is not active"));
        false
    }

    pub fn broadcaster(&self) -> &Broadcaster {
        &self.broadcaster
    }

    pub fn subscribe(&self, listener: Arc<dyn StateListener>) -> Subscription {
        self.broadcaster.subscribe(listener)
    }
}

/// Work done on a leaf controller's dispatcher thread
pub(crate) trait CommandHandler: Send + Sync + 'static {
    fn handle(&self, function: WorkerFunction, listener: SharedListener);

    /// Stop all tasks; runs after every command queued before destroy
    fn shutdown(&self);
}

enum Envelope {
    Execute(WorkerFunction, SharedListener),
    Shutdown(Sender<()>),
}

/// Serialises one controller's commands onto a dedicated thread
pub(crate) struct Dispatcher {
    name: String,
    tx: Mutex<Option<Sender<Envelope>>>,
}

impl Dispatcher {
    pub fn start<H: CommandHandler>(name: &str, handler: Arc<H>) -> Self {
        let (tx, rx) = unbounded::<Envelope>();
        let label = name.to_string();

        // NOT tokio::spawn - std::thread to avoid Send issues
        let spawned = thread::Builder::new()
            .name(format!("{}-dispatch", name))
            .spawn(move || {
                for envelope in rx.iter() {
                    match envelope {
                        Envelope::Execute(function, listener) => {
                            let kind = function.kind();
                            let run = AssertUnwindSafe(|| handler.handle(function, listener));
                            if catch_unwind(run).is_err() {
                                log::error!("{}: handler panicked on {}", label, kind);
                            }
                        }
                        Envelope::Shutdown(done) => {
                            handler.shutdown();
                            let _ = done.send(());
                            break;
                        }
                    }
                }
                log::debug!("✓ {} dispatcher stopped", label);
            });

        let tx = match spawned {
            Ok(_) => Some(tx),
            Err(e) => {
                log::error!("{}: failed to start dispatcher: {}", name, e);
                None
            }
        };
        Self {
            name: name.to_string(),
            tx: Mutex::new(tx),
        }
    }

    /// False once shut down
    pub fn dispatch(&self, function: WorkerFunction, listener: SharedListener) -> bool {
        let tx = self.tx.lock().unwrap_or_else(PoisonError::into_inner);
        match tx.as_ref() {
            Some(tx) => tx.send(Envelope::Execute(function, listener)).is_ok(),
            None => false,
        }
    }

    /// Run the handler's shutdown after pending commands, then stop the thread
    pub fn shutdown(&self) {
        let Some(tx) = self.tx.lock().unwrap_or_else(PoisonError::into_inner).take() else {
            return;
        };
        let (done_tx, done_rx) = bounded::<()>(1);
        if tx.send(Envelope::Shutdown(done_tx)).is_err() {
            return;
        }
        if done_rx.recv_timeout(SHUTDOWN_TIMEOUT).is_err() {
            log::warn!("{}: dispatcher did not finish within {:?}", self.name, SHUTDOWN_TIMEOUT);
        }
    }
}

/// Validate and convert; acks -1 "invalid argument" on failure
pub(crate) fn parse_command(function: &WorkerFunction, listener: &SharedListener) -> Option<Command> {
    let parsed = function.validate().and_then(|_| Command::try_from(function));
    match parsed {
        Ok(command) => Some(command),
        Err(e) => {
            log::debug!("Rejected {}: {}", function.kind(), e);
            listener.on_ack(Ack::to_function(function).with_description("invalid argument"));
            None
        }
    }
}

/// Closing Ack of a task
///
/// An explicit or preempting stop acks the stop command (target defaults to
/// the start id); anything else reports the start as failed.
pub(crate) fn finish_ack(
    start: &WorkerFunction,
    stop: Option<StopRequest>,
    listener: &SharedListener,
    failure: &str,
) {
    match stop {
        Some(StopRequest {
            function: Some(stop_function),
            listener: stop_listener,
        }) => {
            let target = stop_function
                .command_id()
                .or(start.command_id())
                .unwrap_or(crate::function::ack::NO_TARGET);
            let ack = Ack::for_target(target)
                .with_code(0)
                .with_description("stop command received");
            stop_listener.as_ref().unwrap_or(listener).on_ack(ack);
        }
        Some(StopRequest {
            function: None,
            listener: stop_listener,
        }) => {
            let ack = Ack::to_function(start).with_description(failure);
            stop_listener.as_ref().unwrap_or(listener).on_ack(ack);
        }
        None => listener.on_ack(Ack::to_function(start).with_description(failure)),
    }
}

/// Closing Acks of a task that failed before it started
///
/// A stop accepted while the task was still opening is answered too, so the
/// stop command's listener is never left without an Ack.
pub(crate) fn fail_unstarted(
    start: &WorkerFunction,
    token: &StopToken,
    listener: &SharedListener,
    failure: &str,
) {
    listener.on_ack(Ack::to_function(start).with_description(failure));
    if let Some(StopRequest {
        function: Some(stop_function),
        listener: Some(stop_listener),
    }) = token.poll()
    {
        stop_listener.on_ack(Ack::to_function(&stop_function).with_description(failure));
    }
}

/// Write an info file: one fresh id line, then `body`
pub(crate) fn write_info_file(path: &Path, id: &str, body: &str) -> Result<()> {
    let mut content = format!("{}\n", id);
    content.push_str(body);
    fs::write(path, content).with_context(|| format!("Failed to write {}", path.display()))?;
    log::debug!("Info written to {}", path.display());
    Ok(())
}

/// `[r1,r2,...]` line used by Record and VoIP info files
pub(crate) fn join_returns(returns: &[serde_json::Value]) -> String {
    if returns.is_empty() {
        return String::new();
    }
    let items: Vec<String> = returns
        .iter()
        .map(|v| match v {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .collect();
    format!("[{}]\n", items.join(","))
}

pub(crate) fn ensure_data_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;
    log::info!("Data folder: {}", dir.display());
    Ok(())
}

/// Build the standard tree (not yet activated)
pub fn build_tree(env: &ControllerEnv) -> Result<Arc<ManagerController>> {
    let playback: Arc<dyn Controller> = Arc::new(playback::PlaybackController::new(env.clone()));
    let record: Arc<dyn Controller> = Arc::new(record::RecordController::new(env.clone()));
    let voip: Arc<dyn Controller> = voip::VoipController::new(env.clone());

    let audio = ManagerController::builder(AUDIO)
        .route(FunctionGroup::Playback, playback)
        .route(FunctionGroup::Record, record)
        .route(FunctionGroup::Voip, voip)
        .build()?;

    let audio: Arc<dyn Controller> = audio;
    ManagerController::builder(MAIN)
        .route_all(
            &[FunctionGroup::Playback, FunctionGroup::Record, FunctionGroup::Voip],
            audio,
        )
        .build()
}
