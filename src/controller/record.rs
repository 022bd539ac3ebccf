//! Recording controller
//!
//! One global slot. A recording is a master task that paces consumption and
//! owns the Ack stream, fed by a slave task that pulls frames from the
//! device through a latest-frame [`handoff`](super::handoff). When the
//! slave misses a deadline the master consumes a silent frame instead.
//! Consumed frames go to the dump ring and to the registered detectors.

use super::broadcast::{Broadcaster, StateChange, StateListener, Subscription};
use super::handoff::{handoff, FrameProducer, HandoffError};
use super::pool::TaskPool;
use super::task::{stop_pair, StopHandle, StopRequest, StopToken, TaskHooks};
use super::{
    ensure_data_dir, fail_unstarted, finish_ack, join_returns, parse_command, write_info_file,
    CommandHandler, Controller, ControllerCore, ControllerEnv, Dispatcher, Lifecycle,
};
use crate::audio::{wav, AudioDevice, PcmFormat};
use crate::detector::{self, DetectorError, DetectorRegistry, PendingEvent};
use crate::function::command::{DetectOp, DetectorEvent, RecordStart};
use crate::function::{Ack, Command, CommandIdGenerator, FunctionKind, SharedListener, WorkerFunction};
use crate::validation::resolve_data_path;
use anyhow::Result;
use crossbeam_channel::{bounded, Sender};
use serde_json::Value;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

pub const NAME: &str = "Record";

pub(crate) const NOT_RUNNING: &str = "no recording process running";

const OPEN_TIMEOUT: Duration = Duration::from_secs(5);
const PREEMPT_TIMEOUT: Duration = Duration::from_secs(5);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Ring holding the most recent consumed samples
pub(crate) struct DumpBuffer {
    format: PcmFormat,
    capacity: usize,
    samples: VecDeque<f32>,
}

impl DumpBuffer {
    /// `None` when `ms` is zero; the ring grows on demand up to its capacity
    pub fn new(format: PcmFormat, ms: u32) -> Option<Self> {
        let capacity = format.samples_for_ms(ms);
        if capacity == 0 {
            return None;
        }
        Some(Self {
            format,
            capacity,
            samples: VecDeque::new(),
        })
    }

    pub fn push(&mut self, frame: &[f32]) {
        self.samples.extend(frame.iter().copied());
        let overflow = self.samples.len().saturating_sub(self.capacity);
        self.samples.drain(..overflow);
    }

    fn snapshot(&self) -> (PcmFormat, Vec<f32>) {
        (self.format, self.samples.iter().copied().collect())
    }
}

pub(crate) type SharedDetectors = Arc<Mutex<DetectorRegistry>>;
pub(crate) type SharedDump = Arc<Mutex<Option<DumpBuffer>>>;

/// Everything a capture master needs on its worker thread
pub(crate) struct CaptureTask {
    pub start: RecordStart,
    pub function: WorkerFunction,
    pub listener: SharedListener,
    pub token: StopToken,
    pub detectors: SharedDetectors,
    pub dump: SharedDump,
    /// RecordEvent or VoipEvent
    pub event_kind: FunctionKind,
    pub started_desc: &'static str,
}

/// Wrap detector changes into event functions; call without holding locks
pub(crate) fn deliver_events(events: Vec<PendingEvent>, kind: FunctionKind, ids: &CommandIdGenerator) {
    for pending in events {
        let mut event = WorkerFunction::with_id(kind, ids.next_id());
        event.set_parameter("class-handle", pending.class_handle.as_str());
        event.set_parameter("event", pending.payload.to_string());
        log::debug!("Event from {}: {}", pending.class_handle, pending.payload);
        pending.listener.on_event(event);
    }
}

fn capture_loop(
    device: &dyn AudioDevice,
    format: PcmFormat,
    frame_ms: u32,
    producer: FrameProducer,
    token: StopToken,
    opened: Sender<Result<(), String>>,
) {
    let mut input = match device.open_input(format, frame_ms) {
        Ok(input) => {
            let _ = opened.send(Ok(()));
            input
        }
        Err(e) => {
            let _ = opened.send(Err(format!("{:#}", e)));
            return;
        }
    };

    let frame_len = format.frame_len(frame_ms).max(format.channels as usize);
    let mut frame = vec![0.0f32; frame_len];
    while token.poll().is_none() {
        if let Err(e) = input.read_frame(&mut frame) {
            log::error!("Capture read failed: {:#}", e);
            break;
        }
        if !producer.publish(frame.clone()) {
            break;
        }
    }
    log::debug!("Capture task {} ended", token.task_id());
}

/// Run a capture master to completion; the closing Ack is sent before returning
pub(crate) fn run_capture_task(task: CaptureTask, env: &ControllerEnv, pool: &TaskPool, hooks: TaskHooks) {
    let format = task.start.format;
    let frame_ms = env.engine.frame_ms;
    let deadline = Duration::from_secs_f64(
        frame_ms as f64 / 1000.0 * env.engine.record_timeout_multiplier.max(1.0),
    );

    let (producer, consumer) = handoff();
    let (slave, slave_token) = stop_pair();
    let (opened_tx, opened_rx) = bounded::<Result<(), String>>(1);
    let device = env.device.clone();
    let submitted = pool.submit(move || {
        capture_loop(device.as_ref(), format, frame_ms, producer, slave_token, opened_tx)
    });

    let opened = submitted
        .map_err(|e| format!("{:#}", e))
        .and_then(|_| {
            opened_rx
                .recv_timeout(OPEN_TIMEOUT)
                .unwrap_or_else(|_| Err("capture task did not start".to_string()))
        });
    if let Err(e) = opened {
        log::error!("Record {}: cannot open input: {}", format, e);
        slave.request_stop(StopRequest::default());
        lock(&task.detectors).clear();
        (hooks.on_finished)();
        fail_unstarted(&task.function, &task.token, &task.listener, "unexpected stop");
        return;
    }

    task.listener.on_ack(
        Ack::to_function(&task.function)
            .with_code(0)
            .with_description(task.started_desc),
    );
    (hooks.on_started)();

    let silence = vec![0.0f32; format.frame_len(frame_ms).max(format.channels as usize)];
    let mut missed = 0u64;
    let stop = loop {
        if let Some(request) = task.token.poll() {
            break Some(request);
        }
        let frame = match consumer.fetch(deadline) {
            Ok(frame) => frame,
            Err(HandoffError::MissedDeadline) => {
                missed += 1;
                silence.clone()
            }
            Err(HandoffError::Disconnected) => {
                log::error!("Record {}: capture task ended unexpectedly", format);
                break None;
            }
        };

        if let Some(ring) = lock(&task.dump).as_mut() {
            ring.push(&frame);
        }
        let events = lock(&task.detectors).feed(&frame, format);
        deliver_events(events, task.event_kind, &env.ids);
    };

    slave.request_stop(StopRequest::default());
    drop(consumer);
    lock(&task.detectors).clear();
    if missed > 0 {
        log::debug!("Record {}: {} frames substituted with silence", format, missed);
    }

    (hooks.on_finished)();
    finish_ack(&task.function, stop, &task.listener, "unexpected stop");
}

/// Register, unregister or reconfigure a detector on a running capture
pub(crate) fn handle_detect(
    function: &WorkerFunction,
    op: DetectOp,
    detectors: Option<&SharedDetectors>,
    listener: &SharedListener,
) {
    let ack = Ack::to_function(function);
    let not_running = || Ack::to_function(function).with_description(NOT_RUNNING);

    let reply = match op {
        DetectOp::Register { class, .. } if !detector::is_known_class(&class) => {
            ack.with_description(DetectorError::UnknownClass(class).to_string())
        }
        DetectOp::Register { class, params } => match detectors {
            None => not_running(),
            Some(detectors) => {
                let registered =
                    lock(detectors).register(&class, params.as_deref(), listener.clone());
                match registered {
                    Ok(handle) => ack
                        .with_code(0)
                        .with_description("detector has been registered")
                        .with_return(handle),
                    Err(e) => ack.with_description(e.to_string()),
                }
            }
        },
        DetectOp::Unregister { handle } => match detectors {
            None => not_running(),
            Some(detectors) => match lock(detectors).unregister(&handle) {
                Ok(()) => ack
                    .with_code(0)
                    .with_description("detector has been unregistered"),
                Err(e) => ack.with_description(e.to_string()),
            },
        },
        DetectOp::SetParams { handle, params } => match detectors {
            None => not_running(),
            Some(detectors) => match lock(detectors).set_params(&handle, params.as_deref()) {
                Ok(()) => ack
                    .with_code(0)
                    .with_description("set parameters successfully"),
                Err(DetectorError::InvalidParams(reason)) => {
                    log::warn!("{}: {}", handle, reason);
                    ack.with_description("set parameters failed")
                }
                Err(e) => ack.with_description(e.to_string()),
            },
        },
    };
    listener.on_ack(reply);
}

/// Write the dump ring of a running capture to `filename`
pub(crate) fn handle_dump(
    function: &WorkerFunction,
    filename: &str,
    dump: Option<&SharedDump>,
    data_dir: &Path,
    listener: &SharedListener,
) {
    let ack = Ack::to_function(function);
    let Some(dump) = dump else {
        listener.on_ack(ack.with_description(NOT_RUNNING));
        return;
    };

    // copy out so the capture thread is not held up by file I/O
    let snapshot = lock(dump).as_ref().map(DumpBuffer::snapshot);
    let Some((format, samples)) = snapshot else {
        listener.on_ack(ack.with_description("Record dump failed: dump buffer disabled"));
        return;
    };

    let written = resolve_data_path(filename, data_dir)
        .map_err(anyhow::Error::from)
        .and_then(|path| wav::write_samples(&path, format, &samples).map(|_| path));
    let reply = match written {
        Ok(path) => {
            log::info!("Dumped {} samples to {}", samples.len(), path.display());
            ack.with_code(0)
                .with_description("Record dump successfully")
                .with_return(path.display().to_string())
        }
        Err(e) => {
            log::error!("Dump to {} failed: {:#}", filename, e);
            ack.with_description("Record dump failed: IO Exception")
                .with_return(format!("{:#}", e))
        }
    };
    listener.on_ack(reply);
}

/// Events arriving as commands are acknowledged and echoed
pub(crate) fn handle_event(function: &WorkerFunction, event: DetectorEvent, listener: &SharedListener) {
    log::info!("Event from {}", event.class_handle);
    listener.on_ack(
        Ack::to_function(function)
            .with_code(0)
            .with_description("event received")
            .with_return(Value::Object(event.event).to_string()),
    );
}

struct RunningRecord {
    function: WorkerFunction,
    stop: StopHandle,
    detectors: SharedDetectors,
    dump: SharedDump,
}

struct RecordInner {
    env: ControllerEnv,
    data_dir: PathBuf,
    pool: TaskPool,
    slot: Mutex<Option<RunningRecord>>,
    broadcaster: Broadcaster,
}

impl RecordInner {
    fn is_running(&self) -> bool {
        lock(&self.slot)
            .as_ref()
            .is_some_and(|r| !r.stop.is_finished())
    }

    fn publish(&self) {
        self.broadcaster.publish(StateChange {
            controller: NAME.to_string(),
            running: self.running_labels(),
        });
    }

    fn running_labels(&self) -> Vec<String> {
        if self.is_running() {
            vec!["record".to_string()]
        } else {
            Vec::new()
        }
    }

    fn release(&self, task_id: u64) {
        let mut slot = lock(&self.slot);
        if slot.as_ref().map(|r| r.stop.task_id()) == Some(task_id) {
            *slot = None;
        }
    }

    fn start(self: &Arc<Self>, function: WorkerFunction, start: RecordStart, listener: SharedListener) {
        let previous = lock(&self.slot).take();
        if let Some(previous) = previous {
            log::info!(
                "Record preempted by {}",
                function.command_id().unwrap_or("-")
            );
            let mut stop = WorkerFunction::new(FunctionKind::RecordStop);
            stop.set_command_id(function.command_id().map(str::to_string));
            if previous.stop.request_stop(StopRequest::new(stop, None))
                && !previous.stop.wait_finished(PREEMPT_TIMEOUT)
            {
                log::warn!("Record: previous capture still running after {:?}", PREEMPT_TIMEOUT);
            }
        }

        let (handle, token) = stop_pair();
        let task_id = handle.task_id();
        let detectors = Arc::new(Mutex::new(DetectorRegistry::new(self.data_dir.clone())));
        let dump = Arc::new(Mutex::new(DumpBuffer::new(start.format, start.dump_buffer_ms)));
        *lock(&self.slot) = Some(RunningRecord {
            function: function.clone(),
            stop: handle,
            detectors: detectors.clone(),
            dump: dump.clone(),
        });

        let task = CaptureTask {
            start,
            function,
            listener,
            token,
            detectors,
            dump,
            event_kind: FunctionKind::RecordEvent,
            started_desc: "record start",
        };
        let inner = self.clone();
        let submitted = self.pool.submit(move || {
            let on_started = {
                let inner = inner.clone();
                Box::new(move || inner.publish()) as Box<dyn FnOnce() + Send>
            };
            let on_finished = {
                let inner = inner.clone();
                Box::new(move || {
                    inner.release(task_id);
                    inner.publish();
                }) as Box<dyn FnOnce() + Send>
            };
            run_capture_task(
                task,
                &inner.env,
                &inner.pool,
                TaskHooks {
                    on_started,
                    on_finished,
                },
            );
        });
        if let Err(e) = submitted {
            log::error!("Record: {:#}", e);
            self.release(task_id);
        }
    }

    fn stop(&self, function: WorkerFunction, listener: SharedListener) {
        let running = lock(&self.slot).take();
        match running {
            Some(running) if !running.stop.is_finished() => {
                log::debug!("Stopping record");
                let reply = Ack::to_function(&function).with_description(NOT_RUNNING);
                if !running
                    .stop
                    .request_stop(StopRequest::new(function, Some(listener.clone())))
                {
                    listener.on_ack(reply);
                }
            }
            _ => listener.on_ack(Ack::to_function(&function).with_description(NOT_RUNNING)),
        }
    }

    fn info_returns(&self) -> Vec<Value> {
        match lock(&self.slot).as_ref() {
            Some(running) if !running.stop.is_finished() => vec![
                Value::String(running.function.to_json().to_string()),
                Value::String(lock(&running.detectors).to_json().to_string()),
            ],
            _ => Vec::new(),
        }
    }

    fn info(&self, function: WorkerFunction, filename: Option<String>, listener: SharedListener) {
        let returns = self.info_returns();
        if let Some(name) = filename {
            let written = resolve_data_path(&name, &self.data_dir)
                .map_err(anyhow::Error::from)
                .and_then(|path| write_info_file(&path, &self.env.ids.next_id(), &join_returns(&returns)));
            if let Err(e) = written {
                log::warn!("Record info not written: {:#}", e);
            }
        }
        listener.on_ack(
            Ack::to_function(&function)
                .with_code(0)
                .with_description("info returned")
                .with_returns(returns),
        );
    }

    /// Detectors and dump ring of the live capture, if any
    fn live(&self) -> Option<(SharedDetectors, SharedDump)> {
        lock(&self.slot)
            .as_ref()
            .filter(|r| !r.stop.is_finished())
            .map(|r| (r.detectors.clone(), r.dump.clone()))
    }
}

struct RecordHandler(Arc<RecordInner>);

impl CommandHandler for RecordHandler {
    fn handle(&self, function: WorkerFunction, listener: SharedListener) {
        let Some(command) = parse_command(&function, &listener) else {
            return;
        };
        let inner = &self.0;
        match command {
            Command::RecordStart(start) => inner.start(function, start, listener),
            Command::RecordStop => inner.stop(function, listener),
            Command::RecordInfo { filename } => inner.info(function, filename, listener),
            Command::RecordDetect(op) => {
                let live = inner.live();
                handle_detect(&function, op, live.as_ref().map(|(d, _)| d), &listener);
            }
            Command::RecordDump { filename } => {
                let live = inner.live();
                handle_dump(
                    &function,
                    &filename,
                    live.as_ref().map(|(_, d)| d),
                    &inner.data_dir,
                    &listener,
                );
            }
            Command::RecordEvent(event) => handle_event(&function, event, &listener),
            _ => {
                log::error!("{} is not a record function", function.kind());
                listener.on_ack(Ack::to_function(&function).with_description("invalid argument"));
            }
        }
    }

    fn shutdown(&self) {
        if let Some(running) = lock(&self.0.slot).take() {
            running.stop.request_stop(StopRequest::default());
        }
        self.0.pool.shutdown();
    }
}

pub struct RecordController {
    core: ControllerCore,
    inner: Arc<RecordInner>,
    dispatcher: Dispatcher,
}

impl RecordController {
    pub fn new(env: ControllerEnv) -> Self {
        let core = ControllerCore::new(NAME);
        let inner = Arc::new(RecordInner {
            data_dir: env.data_dir(NAME),
            pool: TaskPool::new(NAME, env.engine.worker_threads, env.engine.keep_alive()),
            slot: Mutex::new(None),
            broadcaster: core.broadcaster().clone(),
            env,
        });
        let dispatcher = Dispatcher::start(NAME, Arc::new(RecordHandler(inner.clone())));
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

impl Controller for RecordController {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::sine::SineGenerator;
    use crate::controller::testing::*;
    use serde_json::json;
    use std::fs;

    fn start_fn(id: &str, dump_ms: i64) -> WorkerFunction {
        function(
            FunctionKind::RecordStart,
            id,
            &[
                ("sampling-freq", json!(8000)),
                ("num-channels", json!(1)),
                ("pcm-bit-width", json!(16)),
                ("dump-buffer-ms", json!(dump_ms)),
            ],
        )
    }

    fn detect_fn(id: &str, params: &[(&str, Value)]) -> WorkerFunction {
        function(FunctionKind::RecordDetect, id, params)
    }

    fn controller(env: ControllerEnv) -> RecordController {
        let c = RecordController::new(env);
        c.activate().unwrap();
        c
    }

    #[test]
    fn test_dump_buffer_keeps_latest() {
        let fmt = PcmFormat::new(8000, 1, 16);
        assert!(DumpBuffer::new(fmt, 0).is_none());
        let mut ring = DumpBuffer::new(fmt, 1).unwrap();
        ring.push(&[0.1; 5]);
        ring.push(&[0.2; 5]);
        let (_, samples) = ring.snapshot();
        assert_eq!(samples.len(), 8);
        assert_eq!(&samples[..3], &[0.1; 3]);
        assert_eq!(&samples[3..], &[0.2; 5]);
    }

    #[test]
    fn test_start_stop() {
        let dir = tempfile::tempdir().unwrap();
        let c = controller(null_env(dir.path()));
        let (listener, acks, _) = collector();

        c.execute(start_fn("r::1", 0), listener.clone());
        let ack = next_ack(&acks);
        assert_eq!((ack.return_code, ack.description.as_str()), (0, "record start"));
        assert_eq!(c.running(), vec!["record".to_string()]);

        c.execute(WorkerFunction::with_id(FunctionKind::RecordStop, "r::2"), listener);
        let ack = next_ack(&acks);
        assert_eq!(ack.target, "r::2");
        assert_eq!(ack.description, "stop command received");
        assert!(c.running().is_empty());
        c.destroy();
    }

    #[test]
    fn test_stop_without_recording() {
        let dir = tempfile::tempdir().unwrap();
        let c = controller(null_env(dir.path()));
        let (listener, acks, _) = collector();
        c.execute(WorkerFunction::with_id(FunctionKind::RecordStop, "r::3"), listener);
        let ack = next_ack(&acks);
        assert_eq!(ack.return_code, -1);
        assert_eq!(ack.description, NOT_RUNNING);
        c.destroy();
    }

    #[test]
    fn test_info_without_recording() {
        let dir = tempfile::tempdir().unwrap();
        let c = controller(null_env(dir.path()));
        let (listener, acks, _) = collector();
        c.execute(WorkerFunction::with_id(FunctionKind::RecordInfo, "r::4"), listener);
        let ack = next_ack(&acks);
        assert_eq!(ack.return_code, 0);
        assert_eq!(ack.description, "info returned");
        assert!(ack.returns.is_empty());
        c.destroy();
    }

    #[test]
    fn test_info_while_recording_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let c = controller(null_env(dir.path()));
        let (listener, acks, _) = collector();
        c.execute(start_fn("r::5", 0), listener.clone());
        assert_eq!(next_ack(&acks).return_code, 0);

        let info = function(FunctionKind::RecordInfo, "r::6", &[("filename", json!("rec.txt"))]);
        c.execute(info, listener);
        let ack = next_ack(&acks);
        assert_eq!(ack.returns.len(), 2);
        let start: Value = serde_json::from_str(ack.returns[0].as_str().unwrap()).unwrap();
        assert_eq!(start["command-id"], "r::5");
        assert_eq!(ack.returns[1], json!("{}"));

        let text = fs::read_to_string(c.data_dir().join("rec.txt")).unwrap();
        let body = text.lines().nth(1).unwrap();
        assert!(body.starts_with("[{"));
        assert!(body.ends_with(",{}]"));
        c.destroy();
    }

    #[test]
    fn test_unknown_detector_class() {
        let dir = tempfile::tempdir().unwrap();
        let c = controller(null_env(dir.path()));
        let (listener, acks, _) = collector();
        let f = detect_fn("r::7", &[("type", json!("register")), ("class", json!("Unknown"))]);
        c.execute(f, listener);
        let ack = next_ack(&acks);
        assert_eq!(ack.return_code, -1);
        assert_eq!(ack.description, "invalid detector class name");
        c.destroy();
    }

    #[test]
    fn test_detect_without_recording() {
        let dir = tempfile::tempdir().unwrap();
        let c = controller(null_env(dir.path()));
        let (listener, acks, _) = collector();
        let f = detect_fn("r::8", &[("type", json!("register")), ("class", json!("ToneDetector"))]);
        c.execute(f, listener);
        assert_eq!(next_ack(&acks).description, NOT_RUNNING);
        c.destroy();
    }

    #[test]
    fn test_detector_lifecycle_and_events() {
        let dir = tempfile::tempdir().unwrap();
        let (env, device) = loopback_env(dir.path());
        let c = controller(env);
        let (listener, acks, events) = collector();

        c.execute(start_fn("r::10", 0), listener.clone());
        assert_eq!(next_ack(&acks).description, "record start");

        let register = detect_fn(
            "r::11",
            &[
                ("type", json!("register")),
                ("class", json!("ToneDetector")),
                ("params", json!(r#"{"target-freq":1000}"#)),
            ],
        );
        c.execute(register, listener.clone());
        let ack = next_ack(&acks);
        assert_eq!(ack.description, "detector has been registered");
        let handle = ack.returns[0].as_str().unwrap().to_string();
        assert!(handle.starts_with("ToneDetector@"));

        let fmt = PcmFormat::new(8000, 1, 16);
        device.inject(&SineGenerator::new(&[1000.0], 0.8, fmt).render(8000), 8000);
        let event = events.recv_timeout(WAIT).unwrap();
        assert_eq!(event.kind(), FunctionKind::RecordEvent);
        assert_eq!(event.str("class-handle"), Some(handle.as_str()));
        let payload: Value = serde_json::from_str(event.str("event").unwrap()).unwrap();
        assert_eq!(payload["targets"][0]["target-freq"], 1000.0);

        let setparams = detect_fn(
            "r::12",
            &[
                ("type", json!("setparams")),
                ("class-handle", json!(handle)),
                ("params", json!(r#"{"tolerance-semitone":-1}"#)),
            ],
        );
        c.execute(setparams, listener.clone());
        assert_eq!(next_ack(&acks).description, "set parameters failed");

        let unregister = detect_fn(
            "r::13",
            &[("type", json!("unregister")), ("class-handle", json!(handle))],
        );
        c.execute(unregister.clone(), listener.clone());
        assert_eq!(next_ack(&acks).description, "detector has been unregistered");
        c.execute(unregister, listener);
        assert_eq!(next_ack(&acks).description, "invalid class handle");
        c.destroy();
    }

    #[test]
    fn test_dump_writes_wav() {
        let dir = tempfile::tempdir().unwrap();
        let c = controller(null_env(dir.path()));
        let (listener, acks, _) = collector();
        c.execute(start_fn("r::20", 200), listener.clone());
        assert_eq!(next_ack(&acks).return_code, 0);
        std::thread::sleep(Duration::from_millis(100));

        let dump = function(FunctionKind::RecordDump, "r::21", &[("filename", json!("dump.wav"))]);
        c.execute(dump, listener);
        let ack = next_ack(&acks);
        assert_eq!(ack.description, "Record dump successfully");
        let path = PathBuf::from(ack.returns[0].as_str().unwrap());
        assert_eq!(path, c.data_dir().join("dump.wav"));
        let (format, samples) = wav::read_samples(&path).unwrap();
        assert_eq!(format, PcmFormat::new(8000, 1, 16));
        assert!(!samples.is_empty() && samples.len() <= 1600);
        c.destroy();
    }

    #[test]
    fn test_dump_disabled_and_missing() {
        let dir = tempfile::tempdir().unwrap();
        let c = controller(null_env(dir.path()));
        let (listener, acks, _) = collector();
        let dump = function(FunctionKind::RecordDump, "r::30", &[("filename", json!("d.wav"))]);

        c.execute(dump.clone(), listener.clone());
        assert_eq!(next_ack(&acks).description, NOT_RUNNING);

        c.execute(start_fn("r::31", 0), listener.clone());
        assert_eq!(next_ack(&acks).return_code, 0);
        c.execute(dump, listener);
        let ack = next_ack(&acks);
        assert_eq!(ack.return_code, -1);
        assert_eq!(ack.description, "Record dump failed: dump buffer disabled");
        c.destroy();
    }

    #[test]
    fn test_oversized_dump_buffer_is_refused() {
        let mut start = start_fn("r::35", 0);
        assert!(!start.set_parameter("dump-buffer-ms", 4_000_000_000i64));
        assert_eq!(start.int("dump-buffer-ms"), Some(0));
        assert!(start.set_parameter("dump-buffer-ms", 60_000));
        assert!(!start.set_parameter("dump-buffer-ms", 60_001));
        assert!(start.is_valid());

        let wire = r#"{"command-id":"r::36","class":"RecordStartFunction","params":{"dump-buffer-ms":4000000000}}"#;
        let parsed = WorkerFunction::from_wire(wire).unwrap();
        assert_eq!(parsed.int("dump-buffer-ms"), Some(0));

        let dir = tempfile::tempdir().unwrap();
        let c = controller(null_env(dir.path()));
        let (listener, acks, _) = collector();
        c.execute(parsed, listener.clone());
        assert_eq!(next_ack(&acks).description, "record start");
        c.execute(
            function(FunctionKind::RecordDump, "r::37", &[("filename", json!("d.wav"))]),
            listener,
        );
        assert_eq!(next_ack(&acks).description, "Record dump failed: dump buffer disabled");
        c.destroy();
    }

    #[test]
    fn test_stop_during_failed_open_is_answered() {
        let dir = tempfile::tempdir().unwrap();
        let c = controller(slow_failing_env(dir.path(), Duration::from_millis(300)));
        let (starter, start_acks, _) = collector();
        let (stopper, stop_acks, _) = collector();

        c.execute(start_fn("r::38", 0), starter);
        std::thread::sleep(Duration::from_millis(50));
        c.execute(WorkerFunction::with_id(FunctionKind::RecordStop, "r::39"), stopper);

        let start_ack = next_ack(&start_acks);
        assert_eq!(start_ack.target, "r::38");
        assert_eq!((start_ack.return_code, start_ack.description.as_str()), (-1, "unexpected stop"));
        let stop_ack = next_ack(&stop_acks);
        assert_eq!(stop_ack.target, "r::39");
        assert_eq!((stop_ack.return_code, stop_ack.description.as_str()), (-1, "unexpected stop"));
        assert!(c.running().is_empty());
        c.destroy();
    }

    #[test]
    fn test_preemption_waits_and_tags_new_id() {
        let dir = tempfile::tempdir().unwrap();
        let c = controller(null_env(dir.path()));
        let (first, first_acks, _) = collector();
        let (second, second_acks, _) = collector();

        c.execute(start_fn("r::40", 0), first);
        assert_eq!(next_ack(&first_acks).description, "record start");
        c.execute(start_fn("r::41", 0), second);

        let last = next_ack(&first_acks);
        assert_eq!(last.target, "r::41");
        assert_eq!(last.description, "stop command received");
        assert_eq!(next_ack(&second_acks).description, "record start");
        assert_eq!(c.running(), vec!["record".to_string()]);
        c.destroy();
    }

    #[test]
    fn test_event_command_is_echoed() {
        let dir = tempfile::tempdir().unwrap();
        let c = controller(null_env(dir.path()));
        let (listener, acks, _) = collector();
        let event = function(
            FunctionKind::RecordEvent,
            "r::50",
            &[
                ("event", json!(r#"{"targets":[]}"#)),
                ("class-handle", json!("ToneDetector@1")),
            ],
        );
        c.execute(event, listener);
        let ack = next_ack(&acks);
        assert_eq!(ack.description, "event received");
        assert_eq!(ack.returns, vec![json!(r#"{"targets":[]}"#)]);
        c.destroy();
    }
}
