//! VoIP session controller
//!
//! A session pairs an Rx tone (non-offload playback id 0) with a Tx capture.
//! Both run on this controller's pool and report to a [`ProxyListener`],
//! which folds the two Ack streams into one "VoIP starts" and one
//! termination Ack for the issuer, whatever order the channels report in.

use super::broadcast::{Broadcaster, StateChange, StateListener, Subscription};
use super::playback::{run_tone_task, SharedSignal, ToneTask};
use super::pool::TaskPool;
use super::record::{
    handle_detect, handle_dump, handle_event, run_capture_task, CaptureTask, DumpBuffer,
    SharedDetectors, SharedDump,
};
use super::task::{stop_pair, StopHandle, StopRequest, TaskHooks};
use super::{
    ensure_data_dir, join_returns, parse_command, write_info_file, CommandHandler, Controller,
    ControllerCore, ControllerEnv, Dispatcher, Lifecycle,
};
use crate::detector::DetectorRegistry;
use crate::function::ack::NO_TARGET;
use crate::function::command::{
    PlaybackStart, PlaybackStop, PlaybackType, RecordStart, VoipConfig, VoipStart,
};
use crate::function::{Ack, AckListener, Command, FunctionKind, SharedListener, WorkerFunction};
use crate::validation::resolve_data_path;
use anyhow::Result;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

pub const NAME: &str = "VoIP";

const PREEMPT_TIMEOUT: Duration = Duration::from_secs(5);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Rx,
    Tx,
}

impl Channel {
    fn start_suffix(self) -> &'static str {
        match self {
            Channel::Rx => "p-start",
            Channel::Tx => "c-start",
        }
    }

    fn stop_suffix(self) -> &'static str {
        match self {
            Channel::Rx => "p-stop",
            Channel::Tx => "c-stop",
        }
    }

    fn other(self) -> Channel {
        match self {
            Channel::Rx => Channel::Tx,
            Channel::Tx => Channel::Rx,
        }
    }

    /// Split a sub-channel target into (channel, parent id, is start)
    fn classify(target: &str) -> Option<(Channel, &str, bool)> {
        for channel in [Channel::Rx, Channel::Tx] {
            if let Some(base) = target.strip_suffix(channel.start_suffix()) {
                return Some((channel, base, true));
            }
            if let Some(base) = target.strip_suffix(channel.stop_suffix()) {
                return Some((channel, base, false));
            }
        }
        None
    }

    fn label(self) -> &'static str {
        match self {
            Channel::Rx => "voip-rx",
            Channel::Tx => "voip-tx",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChannelState {
    Pending,
    Running,
    Ended,
}

struct ProxyState {
    rx: ChannelState,
    tx: ChannelState,
    worst: i32,
    started_sent: bool,
    ended_sent: bool,
    survivor_stopped: bool,
}

impl ProxyState {
    fn channel(&mut self, channel: Channel) -> &mut ChannelState {
        match channel {
            Channel::Rx => &mut self.rx,
            Channel::Tx => &mut self.tx,
        }
    }
}

/// Aggregates the Rx and Tx Ack streams of one session
pub struct ProxyListener {
    listener: SharedListener,
    state: Mutex<ProxyState>,
    controller: Weak<VoipInner>,
    rx_task: u64,
    tx_task: u64,
}

impl ProxyListener {
    fn with_state(
        listener: SharedListener,
        controller: Weak<VoipInner>,
        tasks: (u64, u64),
        initial: ChannelState,
    ) -> Self {
        Self {
            listener,
            state: Mutex::new(ProxyState {
                rx: initial,
                tx: initial,
                worst: 0,
                started_sent: initial == ChannelState::Running,
                ended_sent: false,
                survivor_stopped: false,
            }),
            controller,
            rx_task: tasks.0,
            tx_task: tasks.1,
        }
    }

    /// Listener for a session being started
    fn starting(listener: SharedListener, controller: Weak<VoipInner>, tasks: (u64, u64)) -> Self {
        Self::with_state(listener, controller, tasks, ChannelState::Pending)
    }

    /// Listener for the stop acks of a running session
    fn stopping(listener: SharedListener, controller: Weak<VoipInner>, tasks: (u64, u64)) -> Self {
        Self::with_state(listener, controller, tasks, ChannelState::Running)
    }

    fn task_of(&self, channel: Channel) -> u64 {
        match channel {
            Channel::Rx => self.rx_task,
            Channel::Tx => self.tx_task,
        }
    }

    /// Record that `channel` ended without an Ack reaching this proxy
    fn mark_ended(&self, channel: Channel, base: &str) {
        self.update(channel, base, false, 0);
    }

    fn update(&self, channel: Channel, base: &str, is_start: bool, code: i32) {
        let mut out = Vec::new();
        let mut stop_survivor = None;
        {
            let mut state = lock(&self.state);
            if state.ended_sent {
                log::debug!("VoIP {}: late ack for {:?}", base, channel);
                return;
            }
            let running = is_start && code >= 0;
            *state.channel(channel) = if running {
                ChannelState::Running
            } else {
                ChannelState::Ended
            };
            if !running {
                state.worst = state.worst.min(code);
            }

            if state.rx == ChannelState::Running
                && state.tx == ChannelState::Running
                && !state.started_sent
            {
                state.started_sent = true;
                out.push(
                    Ack::for_target(base)
                        .with_code(0)
                        .with_description("VoIP starts"),
                );
            }

            let other = channel.other();
            if !running
                && code < 0
                && *state.channel(other) != ChannelState::Ended
                && !state.survivor_stopped
            {
                state.survivor_stopped = true;
                stop_survivor = Some(other);
            }

            if state.rx == ChannelState::Ended && state.tx == ChannelState::Ended {
                state.ended_sent = true;
                let worst = state.worst;
                out.push(
                    Ack::for_target(base)
                        .with_code(worst)
                        .with_description(if worst >= 0 {
                            "VoIP terminated"
                        } else {
                            "VoIP unexpected failed"
                        }),
                );
            }
        }

        if let Some(survivor) = stop_survivor {
            log::warn!("VoIP {}: {:?} failed, stopping {:?}", base, channel, survivor);
            if let Some(controller) = self.controller.upgrade() {
                controller.stop_channel(survivor, self.task_of(survivor), base);
            }
        }
        for ack in out {
            self.listener.on_ack(ack);
        }
    }
}

impl AckListener for ProxyListener {
    fn on_ack(&self, ack: Ack) {
        match Channel::classify(&ack.target) {
            Some((channel, base, is_start)) => {
                log::debug!("VoIP {:?} ack: {} {}", channel, ack.return_code, ack.description);
                self.update(channel, base, is_start, ack.return_code);
            }
            None => self.listener.on_ack(ack),
        }
    }

    fn on_event(&self, event: WorkerFunction) {
        self.listener.on_event(event);
    }
}

fn stop_function(channel: Channel, base: &str) -> WorkerFunction {
    let id = format!("{}{}", base, channel.stop_suffix());
    match channel {
        Channel::Rx => PlaybackStop {
            playback_type: PlaybackType::NonOffload,
            playback_id: 0,
        }
        .to_function(Some(&id)),
        Channel::Tx => WorkerFunction::with_id(FunctionKind::RecordStop, id),
    }
}

struct Session {
    rx_function: WorkerFunction,
    tx_function: WorkerFunction,
    rx: Option<StopHandle>,
    tx: Option<StopHandle>,
    signal: SharedSignal,
    detectors: SharedDetectors,
    dump: SharedDump,
}

impl Session {
    fn handle(&self, channel: Channel) -> Option<&StopHandle> {
        match channel {
            Channel::Rx => self.rx.as_ref(),
            Channel::Tx => self.tx.as_ref(),
        }
    }

    fn alive(&self, channel: Channel) -> bool {
        self.handle(channel).is_some_and(|h| !h.is_finished())
    }

    fn task_ids(&self) -> (u64, u64) {
        (
            self.rx.as_ref().map_or(0, StopHandle::task_id),
            self.tx.as_ref().map_or(0, StopHandle::task_id),
        )
    }
}

pub(crate) struct VoipInner {
    env: ControllerEnv,
    data_dir: PathBuf,
    pool: TaskPool,
    session: Mutex<Option<Session>>,
    broadcaster: Broadcaster,
}

impl VoipInner {
    fn running_labels(&self) -> Vec<String> {
        let session = lock(&self.session);
        let Some(session) = session.as_ref() else {
            return Vec::new();
        };
        [Channel::Rx, Channel::Tx]
            .into_iter()
            .filter(|c| session.alive(*c))
            .map(|c| c.label().to_string())
            .collect()
    }

    fn publish(&self) {
        self.broadcaster.publish(StateChange {
            controller: NAME.to_string(),
            running: self.running_labels(),
        });
    }

    fn release(&self, channel: Channel, task_id: u64) {
        let mut session = lock(&self.session);
        if let Some(s) = session.as_mut() {
            let slot = match channel {
                Channel::Rx => &mut s.rx,
                Channel::Tx => &mut s.tx,
            };
            if slot.as_ref().map(StopHandle::task_id) == Some(task_id) {
                *slot = None;
            }
            if s.rx.is_none() && s.tx.is_none() {
                *session = None;
            }
        }
    }

    /// Stop one channel of the current session if it is still `task_id`
    fn stop_channel(&self, channel: Channel, task_id: u64, base: &str) {
        let session = lock(&self.session);
        if let Some(handle) = session.as_ref().and_then(|s| s.handle(channel)) {
            if handle.task_id() == task_id {
                handle.request_stop(StopRequest::new(stop_function(channel, base), None));
            }
        }
    }

    /// Take the current session if either channel is still alive
    fn take_live(&self) -> Option<Session> {
        let mut session = lock(&self.session);
        if session
            .as_ref()
            .is_some_and(|s| s.alive(Channel::Rx) || s.alive(Channel::Tx))
        {
            session.take()
        } else {
            None
        }
    }

    fn hooks(self: &Arc<Self>, channel: Channel, task_id: u64) -> TaskHooks {
        let started = self.clone();
        let finished = self.clone();
        TaskHooks {
            on_started: Box::new(move || started.publish()),
            on_finished: Box::new(move || {
                finished.release(channel, task_id);
                finished.publish();
            }),
        }
    }

    fn start(self: &Arc<Self>, function: WorkerFunction, start: VoipStart, listener: SharedListener) {
        let base = function.command_id().unwrap_or(NO_TARGET).to_string();

        if let Some(previous) = self.take_live() {
            log::info!("VoIP session preempted by {}", base);
            for channel in [Channel::Rx, Channel::Tx] {
                if let Some(handle) = previous.handle(channel) {
                    handle.request_stop(StopRequest::new(stop_function(channel, &base), None));
                }
            }
            for handle in [previous.tx.as_ref(), previous.rx.as_ref()].into_iter().flatten() {
                if !handle.wait_finished(PREEMPT_TIMEOUT) {
                    log::warn!("VoIP: previous task {} still running", handle.task_id());
                }
            }
        }

        let rx_start = PlaybackStart {
            playback_type: PlaybackType::NonOffload,
            target_freqs: vec![start.rx_target_freq],
            playback_id: 0,
            low_latency: false,
            amplitude: start.rx_amplitude,
            format: start.rx_format,
            file: None,
        };
        let tx_start = RecordStart {
            format: start.tx_format,
            dump_buffer_ms: start.tx_dump_buffer_ms,
            btsco_on: false,
        };
        let rx_function = rx_start.to_function(format!("{}{}", base, Channel::Rx.start_suffix()));
        let tx_function = tx_start.to_function(format!("{}{}", base, Channel::Tx.start_suffix()));

        let (rx_handle, rx_token) = stop_pair();
        let (tx_handle, tx_token) = stop_pair();
        let (rx_id, tx_id) = (rx_handle.task_id(), tx_handle.task_id());
        let proxy: SharedListener = Arc::new(ProxyListener::starting(
            listener,
            Arc::downgrade(self),
            (rx_id, tx_id),
        ));

        let tone = ToneTask::new(rx_start, rx_function.clone(), proxy.clone(), rx_token);
        let detectors = Arc::new(Mutex::new(DetectorRegistry::new(self.data_dir.clone())));
        let dump = Arc::new(Mutex::new(DumpBuffer::new(tx_start.format, tx_start.dump_buffer_ms)));
        let capture = CaptureTask {
            start: tx_start,
            function: tx_function.clone(),
            listener: proxy,
            token: tx_token,
            detectors: detectors.clone(),
            dump: dump.clone(),
            event_kind: FunctionKind::VoipEvent,
            started_desc: "record start",
        };

        *lock(&self.session) = Some(Session {
            rx_function,
            tx_function,
            rx: Some(rx_handle),
            tx: Some(tx_handle),
            signal: tone.signal.clone(),
            detectors,
            dump,
        });
        log::info!("VoIP session {} starting", base);

        let inner = self.clone();
        let hooks = self.hooks(Channel::Rx, rx_id);
        if let Err(e) = self
            .pool
            .submit(move || run_tone_task(tone, &inner.env, &inner.data_dir, hooks))
        {
            log::error!("VoIP Rx: {:#}", e);
            self.release(Channel::Rx, rx_id);
        }

        let inner = self.clone();
        let hooks = self.hooks(Channel::Tx, tx_id);
        if let Err(e) = self
            .pool
            .submit(move || run_capture_task(capture, &inner.env, &inner.pool, hooks))
        {
            log::error!("VoIP Tx: {:#}", e);
            self.release(Channel::Tx, tx_id);
        }
    }

    fn stop(self: &Arc<Self>, function: WorkerFunction, listener: SharedListener) {
        let Some(session) = self.take_live() else {
            listener.on_ack(Ack::to_function(&function).with_description("no VoIP process running"));
            return;
        };
        let base = function.command_id().unwrap_or(NO_TARGET).to_string();
        log::info!("Stopping VoIP session ({})", base);

        let proxy = Arc::new(ProxyListener::stopping(
            listener,
            Arc::downgrade(self),
            session.task_ids(),
        ));
        for channel in [Channel::Rx, Channel::Tx] {
            let request = StopRequest::new(
                stop_function(channel, &base),
                Some(proxy.clone() as SharedListener),
            );
            let sent = session
                .handle(channel)
                .is_some_and(|h| h.request_stop(request));
            if !sent {
                proxy.mark_ended(channel, &base);
            }
        }
        lock(&session.detectors).clear();
    }

    fn config(&self, function: WorkerFunction, config: VoipConfig, listener: SharedListener) {
        let updated = {
            let mut session = lock(&self.session);
            session
                .as_mut()
                .filter(|s| s.alive(Channel::Rx))
                .map(|session| {
                    let mut signal = lock(&session.signal);
                    if let Some(freq) = config.rx_target_freq {
                        signal.freqs = vec![freq];
                        session.rx_function.set_parameter("target-freqs", freq.to_string());
                    }
                    if let Some(amplitude) = config.rx_amplitude {
                        signal.amplitude = amplitude;
                        session.rx_function.set_parameter("amplitude", amplitude);
                    }
                    session.rx_function.to_json().to_string()
                })
        };
        let Some(updated) = updated else {
            listener.on_ack(Ack::to_function(&function).with_description("VoIP is not running"));
            return;
        };

        log::info!("VoIP Rx reconfigured: {:?}", config);
        listener.on_ack(
            Ack::to_function(&function)
                .with_code(0)
                .with_description("VoIP config sent")
                .with_return(updated),
        );
    }

    fn info_returns(&self) -> Vec<Value> {
        let session = lock(&self.session);
        match session.as_ref() {
            Some(s) if s.alive(Channel::Rx) || s.alive(Channel::Tx) => {
                let rx_type = PlaybackType::NonOffload.as_str();
                let rx_info = json!({ rx_type: { "0": s.rx_function.to_json() } });
                vec![
                    Value::String(rx_info.to_string()),
                    Value::String(s.tx_function.to_json().to_string()),
                    Value::String(lock(&s.detectors).to_json().to_string()),
                ]
            }
            _ => Vec::new(),
        }
    }

    fn info(&self, function: WorkerFunction, filename: Option<String>, listener: SharedListener) {
        let returns = self.info_returns();
        if let Some(name) = filename {
            let written = resolve_data_path(&name, &self.data_dir)
                .map_err(anyhow::Error::from)
                .and_then(|path| {
                    write_info_file(&path, &self.env.ids.next_id(), &join_returns(&returns))
                });
            if let Err(e) = written {
                log::warn!("VoIP info not written: {:#}", e);
            }
        }
        listener.on_ack(
            Ack::to_function(&function)
                .with_code(0)
                .with_description("info returned")
                .with_returns(returns),
        );
    }

    /// Detectors and dump ring of the live Tx channel
    fn live_tx(&self) -> Option<(SharedDetectors, SharedDump)> {
        lock(&self.session)
            .as_ref()
            .filter(|s| s.alive(Channel::Tx))
            .map(|s| (s.detectors.clone(), s.dump.clone()))
    }

    fn stop_all(&self) {
        if let Some(session) = lock(&self.session).take() {
            for handle in [session.rx.as_ref(), session.tx.as_ref()].into_iter().flatten() {
                handle.request_stop(StopRequest::default());
            }
            log::info!("VoIP session stopped");
        }
    }
}

struct VoipHandler(Arc<VoipInner>);

impl CommandHandler for VoipHandler {
    fn handle(&self, function: WorkerFunction, listener: SharedListener) {
        let Some(command) = parse_command(&function, &listener) else {
            return;
        };
        let inner = &self.0;
        match command {
            Command::VoipStart(start) => inner.start(function, start, listener),
            Command::VoipStop => inner.stop(function, listener),
            Command::VoipConfig(config) => inner.config(function, config, listener),
            Command::VoipInfo { filename } => inner.info(function, filename, listener),
            Command::VoipDetect(op) => {
                let live = inner.live_tx();
                handle_detect(&function, op, live.as_ref().map(|(d, _)| d), &listener);
            }
            Command::VoipTxDump { filename } => {
                let live = inner.live_tx();
                handle_dump(
                    &function,
                    &filename,
                    live.as_ref().map(|(_, d)| d),
                    &inner.data_dir,
                    &listener,
                );
            }
            Command::VoipEvent(event) => handle_event(&function, event, &listener),
            _ => {
                log::error!("{} is not a VoIP function", function.kind());
                listener.on_ack(Ack::to_function(&function).with_description("invalid argument"));
            }
        }
    }

    fn shutdown(&self) {
        self.0.stop_all();
        self.0.pool.shutdown();
    }
}

pub struct VoipController {
    core: ControllerCore,
    inner: Arc<VoipInner>,
    dispatcher: Dispatcher,
}

impl VoipController {
    pub fn new(env: ControllerEnv) -> Arc<Self> {
        let core = ControllerCore::new(NAME);
        let inner = Arc::new(VoipInner {
            data_dir: env.data_dir(NAME),
            pool: TaskPool::new(NAME, env.engine.worker_threads, env.engine.keep_alive()),
            session: Mutex::new(None),
            broadcaster: core.broadcaster().clone(),
            env,
        });
        let dispatcher = Dispatcher::start(NAME, Arc::new(VoipHandler(inner.clone())));
        Arc::new(Self {
            core,
            inner,
            dispatcher,
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.inner.data_dir
    }
}

impl Controller for VoipController {
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
    use crate::controller::testing::*;
    use crossbeam_channel::Receiver;

    fn start_fn(id: &str, freq: f64) -> WorkerFunction {
        function(
            FunctionKind::VoipStart,
            id,
            &[
                ("rx-target-freq", json!(freq)),
                ("rx-sampling-freq", json!(8000)),
                ("tx-sampling-freq", json!(8000)),
            ],
        )
    }

    fn controller(env: ControllerEnv) -> Arc<VoipController> {
        let c = VoipController::new(env);
        c.activate().unwrap();
        c
    }

    fn assert_quiet(acks: &Receiver<Ack>) {
        assert!(acks.recv_timeout(Duration::from_millis(100)).is_err());
    }

    fn ack(target: &str, code: i32) -> Ack {
        Ack::for_target(target).with_code(code)
    }

    #[test]
    fn test_classify_targets() {
        assert_eq!(Channel::classify("d::1p-start"), Some((Channel::Rx, "d::1", true)));
        assert_eq!(Channel::classify("d::1c-stop"), Some((Channel::Tx, "d::1", false)));
        assert_eq!(Channel::classify("d::1"), None);
    }

    #[test]
    fn test_proxy_start_order_independent() {
        for order in [[Channel::Rx, Channel::Tx], [Channel::Tx, Channel::Rx]] {
            let (listener, acks, _) = collector();
            let proxy = ProxyListener::starting(listener, Weak::new(), (1, 2));
            for channel in order {
                proxy.on_ack(ack(&format!("v::1{}", channel.start_suffix()), 0));
            }
            let started = next_ack(&acks);
            assert_eq!(started.target, "v::1");
            assert_eq!((started.return_code, started.description.as_str()), (0, "VoIP starts"));
            assert_quiet(&acks);

            for channel in order {
                proxy.on_ack(ack(&format!("v::2{}", channel.stop_suffix()), 0));
            }
            let ended = next_ack(&acks);
            assert_eq!(ended.target, "v::2");
            assert_eq!(ended.description, "VoIP terminated");
            assert_quiet(&acks);
        }
    }

    #[test]
    fn test_proxy_partial_failure_reports_worst_code() {
        let (listener, acks, _) = collector();
        let proxy = ProxyListener::starting(listener, Weak::new(), (1, 2));
        proxy.on_ack(ack("v::3p-start", 0));
        proxy.on_ack(ack("v::3c-start", -1));
        proxy.on_ack(ack("v::3p-stop", 0));

        let ended = next_ack(&acks);
        assert_eq!(ended.target, "v::3");
        assert_eq!(ended.return_code, -1);
        assert_eq!(ended.description, "VoIP unexpected failed");
        // late acks are swallowed
        proxy.on_ack(ack("v::3p-stop", 0));
        assert_quiet(&acks);
    }

    #[test]
    fn test_proxy_forwards_unrelated_acks() {
        let (listener, acks, _) = collector();
        let proxy = ProxyListener::starting(listener, Weak::new(), (1, 2));
        proxy.on_ack(ack("other", 0));
        assert_eq!(next_ack(&acks).target, "other");
    }

    #[test]
    fn test_start_and_stop_session() {
        let dir = tempfile::tempdir().unwrap();
        let c = controller(null_env(dir.path()));
        let (listener, acks, _) = collector();

        c.execute(start_fn("v::10", 300.0), listener);
        let started = next_ack(&acks);
        assert_eq!(started.target, "v::10");
        assert_eq!((started.return_code, started.description.as_str()), (0, "VoIP starts"));
        assert_quiet(&acks);
        let mut running = c.running();
        running.sort();
        assert_eq!(running, vec!["voip-rx", "voip-tx"]);

        let (stopper, stop_acks, _) = collector();
        c.execute(WorkerFunction::with_id(FunctionKind::VoipStop, "v::11"), stopper);
        let ended = next_ack(&stop_acks);
        assert_eq!(ended.target, "v::11");
        assert_eq!((ended.return_code, ended.description.as_str()), (0, "VoIP terminated"));
        assert_quiet(&stop_acks);
        assert!(c.running().is_empty());
        c.destroy();
    }

    #[test]
    fn test_stop_without_session() {
        let dir = tempfile::tempdir().unwrap();
        let c = controller(null_env(dir.path()));
        let (listener, acks, _) = collector();
        c.execute(WorkerFunction::with_id(FunctionKind::VoipStop, "v::20"), listener);
        let ack = next_ack(&acks);
        assert_eq!((ack.return_code, ack.description.as_str()), (-1, "no VoIP process running"));
        c.destroy();
    }

    #[test]
    fn test_preemption_terminates_previous_session() {
        let dir = tempfile::tempdir().unwrap();
        let c = controller(null_env(dir.path()));
        let (first, first_acks, _) = collector();
        let (second, second_acks, _) = collector();

        c.execute(start_fn("v::30", 300.0), first);
        assert_eq!(next_ack(&first_acks).description, "VoIP starts");
        c.execute(start_fn("v::31", 400.0), second);

        let ended = next_ack(&first_acks);
        assert_eq!(ended.target, "v::31");
        assert_eq!(ended.description, "VoIP terminated");
        assert_eq!(next_ack(&second_acks).description, "VoIP starts");
        c.destroy();
    }

    #[test]
    fn test_config_and_info() {
        let dir = tempfile::tempdir().unwrap();
        let c = controller(null_env(dir.path()));
        let (listener, acks, _) = collector();
        let config = function(FunctionKind::VoipConfig, "v::40", &[("rx-amplitude", json!(0.3))]);

        c.execute(config.clone(), listener.clone());
        assert_eq!(next_ack(&acks).description, "VoIP is not running");

        c.execute(start_fn("v::41", 300.0), listener.clone());
        assert_eq!(next_ack(&acks).description, "VoIP starts");

        c.execute(config, listener.clone());
        let ack = next_ack(&acks);
        assert_eq!((ack.return_code, ack.description.as_str()), (0, "VoIP config sent"));
        let rx: Value = serde_json::from_str(ack.returns[0].as_str().unwrap()).unwrap();
        assert_eq!(rx["params"]["amplitude"], 0.3);
        assert_eq!(rx["command-id"], "v::41p-start");

        let info = function(FunctionKind::VoipInfo, "v::42", &[("filename", json!("voip.txt"))]);
        c.execute(info, listener);
        let ack = next_ack(&acks);
        assert_eq!(ack.description, "info returned");
        assert_eq!(ack.returns.len(), 3);
        let rx_info: Value = serde_json::from_str(ack.returns[0].as_str().unwrap()).unwrap();
        assert_eq!(rx_info["non-offload"]["0"]["params"]["amplitude"], 0.3);
        let tx: Value = serde_json::from_str(ack.returns[1].as_str().unwrap()).unwrap();
        assert_eq!(tx["command-id"], "v::41c-start");
        assert!(c.data_dir().join("voip.txt").is_file());
        c.destroy();
    }

    #[test]
    fn test_detect_and_dump_without_tx() {
        let dir = tempfile::tempdir().unwrap();
        let c = controller(null_env(dir.path()));
        let (listener, acks, _) = collector();
        let detect = function(
            FunctionKind::VoipDetect,
            "v::50",
            &[("type", json!("register")), ("class", json!("ToneDetector"))],
        );
        c.execute(detect, listener.clone());
        assert_eq!(next_ack(&acks).description, "no recording process running");

        let dump = function(FunctionKind::VoipTxDump, "v::51", &[("filename", json!("tx.wav"))]);
        c.execute(dump, listener);
        assert_eq!(next_ack(&acks).description, "no recording process running");
        c.destroy();
    }

    #[test]
    fn test_rx_tone_detected_on_tx() {
        let dir = tempfile::tempdir().unwrap();
        let (env, _device) = loopback_env(dir.path());
        let c = controller(env);
        let (listener, acks, events) = collector();

        c.execute(start_fn("v::60", 1000.0), listener.clone());
        assert_eq!(next_ack(&acks).description, "VoIP starts");

        let detect = function(
            FunctionKind::VoipDetect,
            "v::61",
            &[
                ("type", json!("register")),
                ("class", json!("ToneDetector")),
                ("params", json!(r#"{"target-freq":1000}"#)),
            ],
        );
        c.execute(detect, listener);
        assert_eq!(next_ack(&acks).description, "detector has been registered");

        let event = events.recv_timeout(WAIT).unwrap();
        assert_eq!(event.kind(), FunctionKind::VoipEvent);
        let payload: Value = serde_json::from_str(event.str("event").unwrap()).unwrap();
        assert_eq!(payload["targets"][0]["target-freq"], 1000.0);
        c.destroy();
    }
}
