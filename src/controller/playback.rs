//! Tone playback controller
//!
//! Tasks are keyed by (playback type, playback id); each key holds at most
//! one live task. Non-offload tasks synthesise the tone frame by frame and
//! pick up live signal changes. Offload tasks render a tone file first and
//! loop it through the media player seam.

use super::broadcast::{Broadcaster, StateChange, StateListener, Subscription};
use super::pool::TaskPool;
use super::task::{stop_pair, StopHandle, StopRequest, StopToken, TaskHooks};
use super::{
    ensure_data_dir, fail_unstarted, finish_ack, parse_command, write_info_file, CommandHandler,
    Controller, ControllerCore, ControllerEnv, Dispatcher, Lifecycle,
};
use crate::audio::sine::SineGenerator;
use crate::audio::wav;
use crate::function::command::{PlaybackStart, PlaybackStop, PlaybackType};
use crate::function::{Ack, Command, SharedListener, WorkerFunction};
use crate::validation::resolve_data_path;
use anyhow::Result;
use serde_json::{Map, Value};
use std::cell::RefCell;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

pub const NAME: &str = "Playback";

const PREEMPT_TIMEOUT: Duration = Duration::from_secs(5);

/// Live tone parameters of a streamed task
#[derive(Debug, Clone, PartialEq)]
pub struct Signal {
    pub freqs: Vec<f64>,
    pub amplitude: f64,
}

pub type SharedSignal = Arc<Mutex<Signal>>;

/// Everything a tone task needs on its worker thread
pub(crate) struct ToneTask {
    pub start: PlaybackStart,
    pub function: WorkerFunction,
    pub listener: SharedListener,
    pub token: StopToken,
    pub signal: SharedSignal,
}

impl ToneTask {
    pub fn new(start: PlaybackStart, function: WorkerFunction, listener: SharedListener, token: StopToken) -> Self {
        let signal = Arc::new(Mutex::new(Signal {
            freqs: start.target_freqs.clone(),
            amplitude: start.amplitude,
        }));
        Self {
            start,
            function,
            listener,
            token,
            signal,
        }
    }

    fn label(&self) -> String {
        slot_label(self.start.playback_type, self.start.playback_id)
    }

    fn ack_started(&self) {
        self.listener.on_ack(
            Ack::to_function(&self.function)
                .with_code(0)
                .with_description("playback start"),
        );
    }
}

fn slot_label(playback_type: PlaybackType, playback_id: u32) -> String {
    format!("{}:{}", playback_type, playback_id)
}

/// Run a tone task to completion; the closing Ack is sent before returning
pub(crate) fn run_tone_task(task: ToneTask, env: &ControllerEnv, data_dir: &Path, hooks: TaskHooks) {
    log::debug!("Playback {} running ({})", task.label(), task.start.format);
    match task.start.playback_type {
        PlaybackType::NonOffload => run_streamed(task, env, hooks),
        PlaybackType::Offload => run_offload(task, env, data_dir, hooks),
    }
}

fn run_streamed(task: ToneTask, env: &ControllerEnv, hooks: TaskHooks) {
    let frame_ms = env.engine.frame_ms;
    let format = task.start.format;

    let mut output = match env.device.open_output(format, frame_ms) {
        Ok(output) => output,
        Err(e) => {
            log::error!("Playback {}: cannot open output: {:#}", task.label(), e);
            (hooks.on_finished)();
            fail_unstarted(&task.function, &task.token, &task.listener, "unexpected stop");
            return;
        }
    };

    let initial = lock(&task.signal).clone();
    let mut sine = SineGenerator::new(&initial.freqs, initial.amplitude, format);
    let mut frame = vec![0.0f32; format.frame_len(frame_ms).max(format.channels as usize)];

    task.ack_started();
    (hooks.on_started)();

    let stop = loop {
        if let Some(request) = task.token.poll() {
            break Some(request);
        }
        {
            let signal = lock(&task.signal);
            if signal.freqs.as_slice() != sine.frequencies() {
                sine.set_frequencies(&signal.freqs);
            }
            if signal.amplitude != sine.amplitude() {
                sine.set_amplitude(signal.amplitude);
            }
        }
        sine.fill(&mut frame);
        if let Err(e) = output.write_frame(&frame) {
            log::error!("Playback {}: write failed: {:#}", task.label(), e);
            break None;
        }
    };
    drop(output);

    log::debug!("Playback {} terminated", task.label());
    (hooks.on_finished)();
    finish_ack(&task.function, stop, &task.listener, "unexpected stop");
}

fn render_tone_file(task: &ToneTask, env: &ControllerEnv, path: &Path) -> bool {
    let limit = env.engine.offload_retry_limit.max(1);
    for attempt in 1..=limit {
        match wav::write_tone_file(
            path,
            task.start.format,
            &task.start.target_freqs,
            task.start.amplitude,
            env.engine.tone_file_secs,
        ) {
            Ok(()) => return true,
            Err(e) => log::warn!(
                "Playback {}: tone file attempt {}/{} failed: {:#}",
                task.label(),
                attempt,
                limit,
                e
            ),
        }
    }
    false
}

fn run_offload(task: ToneTask, env: &ControllerEnv, data_dir: &Path, hooks: TaskHooks) {
    let wav_path = data_dir.join(format!(
        "tmp-{}-{}.wav",
        task.start.playback_id,
        task.token.task_id()
    ));

    if !render_tone_file(&task, env, &wav_path) {
        log::error!("Playback {}: giving up on tone file generation", task.label());
        let _ = fs::remove_file(&wav_path);
        (hooks.on_finished)();
        fail_unstarted(
            &task.function,
            &task.token,
            &task.listener,
            "unexpected stop: tone file generation failed",
        );
        return;
    }

    let playable = env.transcoder.transcode(&wav_path).unwrap_or_else(|e| {
        log::warn!("Playback {}: transcode failed, playing wav: {:#}", task.label(), e);
        wav_path.clone()
    });

    task.ack_started();
    (hooks.on_started)();

    let pending: RefCell<Option<StopRequest>> = RefCell::new(None);
    let should_stop = || {
        if pending.borrow().is_some() {
            return true;
        }
        match task.token.poll() {
            Some(request) => {
                *pending.borrow_mut() = Some(request);
                true
            }
            None => false,
        }
    };
    if let Err(e) =
        env.player
            .play_looped(&playable, env.device.as_ref(), env.engine.frame_ms, &should_stop)
    {
        log::error!("Playback {}: player failed: {:#}", task.label(), e);
    }

    for path in [&playable, &wav_path] {
        if path.exists() {
            if let Err(e) = fs::remove_file(path) {
                log::warn!("Failed to remove {}: {}", path.display(), e);
            }
        }
    }

    log::debug!("Playback {} terminated", task.label());
    (hooks.on_finished)();
    finish_ack(&task.function, pending.into_inner(), &task.listener, "unexpected stop");
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct RunningPlayback {
    function: WorkerFunction,
    stop: StopHandle,
}

type SlotKey = (PlaybackType, u32);

struct PlaybackInner {
    env: ControllerEnv,
    data_dir: PathBuf,
    pool: TaskPool,
    tasks: Mutex<HashMap<SlotKey, RunningPlayback>>,
    broadcaster: Broadcaster,
}

impl PlaybackInner {
    fn running_labels(&self) -> Vec<String> {
        let mut labels: Vec<String> = lock(&self.tasks)
            .iter()
            .filter(|(_, t)| !t.stop.is_finished())
            .map(|((ty, id), _)| slot_label(*ty, *id))
            .collect();
        labels.sort();
        labels
    }

    fn publish(&self) {
        self.broadcaster.publish(StateChange {
            controller: NAME.to_string(),
            running: self.running_labels(),
        });
    }

    fn start(self: &Arc<Self>, function: WorkerFunction, start: PlaybackStart, listener: SharedListener) {
        let key = (start.playback_type, start.playback_id);

        let previous = lock(&self.tasks).remove(&key);
        if let Some(previous) = previous {
            log::info!(
                "Playback {} preempted by {}",
                slot_label(key.0, key.1),
                function.command_id().unwrap_or("-")
            );
            let stop = PlaybackStop {
                playback_type: key.0,
                playback_id: key.1,
            }
            .to_function(function.command_id());
            previous.stop.request_stop(StopRequest::new(stop, None));
            if !previous.stop.wait_finished(PREEMPT_TIMEOUT) {
                log::warn!(
                    "Playback {}: previous task still running after {:?}",
                    slot_label(key.0, key.1),
                    PREEMPT_TIMEOUT
                );
            }
        }

        let (handle, token) = stop_pair();
        let task_id = handle.task_id();
        lock(&self.tasks).insert(
            key,
            RunningPlayback {
                function: function.clone(),
                stop: handle,
            },
        );

        let task = ToneTask::new(start, function, listener.clone(), token);
        let inner = self.clone();
        let submitted = self.pool.submit(move || {
            let on_started = {
                let inner = inner.clone();
                Box::new(move || inner.publish()) as Box<dyn FnOnce() + Send>
            };
            let on_finished = {
                let inner = inner.clone();
                Box::new(move || {
                    inner.release(key, task_id);
                    inner.publish();
                }) as Box<dyn FnOnce() + Send>
            };
            run_tone_task(
                task,
                &inner.env,
                &inner.data_dir,
                TaskHooks {
                    on_started,
                    on_finished,
                },
            );
        });

        if let Err(e) = submitted {
            log::error!("Playback {}: {:#}", slot_label(key.0, key.1), e);
            self.release(key, task_id);
        }
    }

    /// Drop the slot entry if it still belongs to `task_id`
    fn release(&self, key: SlotKey, task_id: u64) {
        let mut tasks = lock(&self.tasks);
        if tasks.get(&key).map(|t| t.stop.task_id()) == Some(task_id) {
            tasks.remove(&key);
        }
    }

    fn stop(&self, function: WorkerFunction, stop: PlaybackStop, listener: SharedListener) {
        let key = (stop.playback_type, stop.playback_id);
        let running = lock(&self.tasks).remove(&key);

        let missing = || {
            Ack::to_function(&function).with_description(format!(
                "invalid argument: the task[{}: {}] does not exist",
                stop.playback_type, stop.playback_id
            ))
        };

        match running {
            Some(running) if !running.stop.is_finished() => {
                log::debug!("Stopping playback {}", slot_label(key.0, key.1));
                let ack_if_gone = missing();
                if !running
                    .stop
                    .request_stop(StopRequest::new(function, Some(listener.clone())))
                {
                    listener.on_ack(ack_if_gone);
                }
            }
            _ => listener.on_ack(missing()),
        }
    }

    fn info_string(&self) -> String {
        let mut grouped: Map<String, Value> = Map::new();
        for ((ty, id), task) in lock(&self.tasks).iter() {
            if task.stop.is_finished() {
                continue;
            }
            let group = grouped
                .entry(ty.as_str().to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if let Value::Object(group) = group {
                group.insert(id.to_string(), task.function.to_json());
            }
        }
        Value::Object(grouped).to_string()
    }

    fn info(&self, function: WorkerFunction, filename: Option<String>, listener: SharedListener) {
        let info = self.info_string();
        if let Some(name) = filename {
            let written = resolve_data_path(&name, &self.data_dir)
                .map_err(anyhow::Error::from)
                .and_then(|path| {
                    write_info_file(&path, &self.env.ids.next_id(), &format!("{}\n", info))
                });
            if let Err(e) = written {
                log::warn!("Playback info not written: {:#}", e);
            }
        }
        listener.on_ack(
            Ack::to_function(&function)
                .with_code(0)
                .with_description("info returned")
                .with_return(info),
        );
    }

    fn stop_all(&self) {
        let drained: Vec<RunningPlayback> = lock(&self.tasks).drain().map(|(_, t)| t).collect();
        for task in &drained {
            task.stop.request_stop(StopRequest::default());
        }
        if !drained.is_empty() {
            log::info!("Stopped {} playback tasks", drained.len());
        }
    }
}

struct PlaybackHandler(Arc<PlaybackInner>);

impl CommandHandler for PlaybackHandler {
    fn handle(&self, function: WorkerFunction, listener: SharedListener) {
        let Some(command) = parse_command(&function, &listener) else {
            return;
        };
        match command {
            Command::PlaybackStart(start) => self.0.start(function, start, listener),
            Command::PlaybackStop(stop) => self.0.stop(function, stop, listener),
            Command::PlaybackInfo { filename } => self.0.info(function, filename, listener),
            _ => {
                log::error!("{} is not a playback function", function.kind());
                listener.on_ack(Ack::to_function(&function).with_description("invalid argument"));
            }
        }
    }

    fn shutdown(&self) {
        self.0.stop_all();
        self.0.pool.shutdown();
    }
}

pub struct PlaybackController {
    core: ControllerCore,
    inner: Arc<PlaybackInner>,
    dispatcher: Dispatcher,
}

impl PlaybackController {
    pub fn new(env: ControllerEnv) -> Self {
        let core = ControllerCore::new(NAME);
        let inner = Arc::new(PlaybackInner {
            data_dir: env.data_dir(NAME),
            pool: TaskPool::new(NAME, env.engine.worker_threads, env.engine.keep_alive()),
            tasks: Mutex::new(HashMap::new()),
            broadcaster: core.broadcaster().clone(),
            env,
        });
        let dispatcher = Dispatcher::start(NAME, Arc::new(PlaybackHandler(inner.clone())));
        Self {
            core,
            inner,
            dispatcher,
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.inner.data_dir
    }
}

impl Controller for PlaybackController {
    fn name(&self) -> &str {
        self.core.name()
    }

    fn lifecycle(&self) -> Lifecycle {
        self.core.lifecycle()
    }

    fn activate(&self) -> Result<()> {
        if self.core.activate()? {
            ensure_data_dir(&self.inner.data_dir)?;
        }
        Ok(())
    }

    fn destroy(&self) {
        if !self.core.begin_destroy() {
            return;
        }
        self.dispatcher.shutdown();
        self.core.finish_destroy();
    }

    fn execute(&self, function: WorkerFunction, listener: SharedListener) {
        if !self.core.admit(&function, &listener) {
            return;
        }
        if !self.dispatcher.dispatch(function.clone(), listener.clone()) {
            listener.on_ack(Ack::to_function(&function).with_description("controller is not active"));
        }
    }

    fn subscribe(&self, listener: Arc<dyn StateListener>) -> Subscription {
        self.core.subscribe(listener)
    }

    fn running(&self) -> Vec<String> {
        self.inner.running_labels()
    }
}
