//! Glue between a transport and the controller tree
//!
//! Incoming functions are executed on the root controller and their Acks
//! and events are sent back to the peer that issued them. Incoming Acks are
//! matched by target against requests this node issued with
//! [`WorkerNode::submit`].
//!
//! A request is tracked until it is answered. Most kinds are answered by
//! their first Ack. A start stays tracked while its task runs, so detector
//! events keep reaching its listener; it is dropped on a failure Ack or once
//! a stop for the same task is answered.

use super::{MessageHandler, Transport};
use crate::controller::Controller;
use crate::function::wire::WireMessage;
use crate::function::{Ack, AckListener, CommandIdGenerator, FunctionKind, SharedListener, WorkerFunction};
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Sends everything a command produces back to its issuer
struct PeerListener {
    peer: String,
    transport: Arc<dyn Transport>,
}

impl PeerListener {
    fn send(&self, text: String) {
        if let Err(e) = self.transport.send(&self.peer, &text) {
            log::warn!("Reply to {} lost: {:#}", self.peer, e);
        }
    }
}

impl AckListener for PeerListener {
    fn on_ack(&self, ack: Ack) {
        self.send(ack.to_wire());
    }

    fn on_event(&self, event: WorkerFunction) {
        self.send(event.to_wire());
    }
}

struct PendingRequest {
    peer: String,
    function: WorkerFunction,
    listener: SharedListener,
}

impl PendingRequest {
    fn answered_by(&self, ack: &Ack) -> bool {
        !self.function.kind().is_start() || ack.return_code != 0
    }

    /// Whether `stop` ends the task this start launched
    fn stopped_by(&self, peer: &str, stop: &WorkerFunction) -> bool {
        let start = &self.function;
        if self.peer != peer || !start.kind().is_start() || start.group() != stop.group() {
            return false;
        }
        match start.kind() {
            FunctionKind::PlaybackStart => {
                start.str("type") == stop.str("type") && start.int("playback-id") == stop.int("playback-id")
            }
            _ => true,
        }
    }
}

pub struct WorkerNode {
    root: Arc<dyn Controller>,
    ids: Arc<CommandIdGenerator>,
    transport: Mutex<Option<Arc<dyn Transport>>>,
    pending: Mutex<HashMap<String, PendingRequest>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl WorkerNode {
    pub fn new(root: Arc<dyn Controller>, ids: Arc<CommandIdGenerator>) -> Arc<Self> {
        Arc::new(Self {
            root,
            ids,
            transport: Mutex::new(None),
            pending: Mutex::new(HashMap::new()),
        })
    }

    pub fn attach(&self, transport: Arc<dyn Transport>) {
        *lock(&self.transport) = Some(transport);
    }

    /// Drop the transport; breaks the node/transport reference cycle
    pub fn detach(&self) {
        lock(&self.transport).take();
    }

    pub fn root(&self) -> &Arc<dyn Controller> {
        &self.root
    }

    fn transport(&self) -> Result<Arc<dyn Transport>> {
        lock(&self.transport)
            .clone()
            .context("Node has no transport attached")
    }

    /// Send `function` to `peer`; its Acks go to `listener`. Returns the command id.
    ///
    /// The request is dropped from tracking once answered. A start the peer
    /// never stops stays tracked until [`forget`](Self::forget).
    pub fn submit(&self, peer: &str, function: WorkerFunction, listener: SharedListener) -> Result<String> {
        let mut function = function;
        let id = match function.command_id() {
            Some(id) => id.to_string(),
            None => {
                let id = self.ids.next_id();
                function.set_command_id(Some(id.clone()));
                id
            }
        };
        let transport = self.transport()?;
        let wire = function.to_wire();

        lock(&self.pending).insert(
            id.clone(),
            PendingRequest {
                peer: peer.to_string(),
                function,
                listener,
            },
        );
        if let Err(e) = transport.send(peer, &wire) {
            lock(&self.pending).remove(&id);
            return Err(e).with_context(|| format!("Failed to submit {} to {}", id, peer));
        }
        log::debug!("Submitted {} to {}", id, peer);
        Ok(id)
    }

    /// Acks received so far for a request still being tracked
    pub fn acks_for(&self, id: &str) -> Vec<Ack> {
        lock(&self.pending)
            .get(id)
            .map(|p| p.function.acks().to_vec())
            .unwrap_or_default()
    }

    /// Stop tracking a request; returns it with its Acks
    pub fn forget(&self, id: &str) -> Option<WorkerFunction> {
        lock(&self.pending).remove(id).map(|p| p.function)
    }

    fn on_function(&self, peer: &str, function: WorkerFunction) {
        log::debug!("{} from {}: {}", function.kind(), peer, function.command_id().unwrap_or("-"));
        let transport = match self.transport() {
            Ok(transport) => transport,
            Err(e) => {
                log::error!("Cannot serve {}: {:#}", peer, e);
                return;
            }
        };

        if function.kind().is_event() {
            let listeners: Vec<SharedListener> = lock(&self.pending)
                .values()
                .filter(|p| p.peer == peer && p.function.group() == function.group())
                .map(|p| p.listener.clone())
                .collect();
            for listener in listeners {
                listener.on_event(function.clone());
            }
        }

        let listener: SharedListener = Arc::new(PeerListener {
            peer: peer.to_string(),
            transport,
        });
        self.root.execute(function, listener);
    }

    fn on_ack(&self, peer: &str, ack: Ack) {
        let listener = {
            let mut pending = lock(&self.pending);
            let Some(request) = pending.get_mut(&ack.target) else {
                log::debug!("Unmatched ack from {} for {}", peer, ack.target);
                return;
            };
            request.function.push_ack(ack.clone());
            let listener = request.listener.clone();

            if request.answered_by(&ack) {
                if let Some(done) = pending.remove(&ack.target) {
                    if done.function.kind().is_stop() {
                        pending.retain(|_, p| !p.stopped_by(peer, &done.function));
                    }
                }
            }
            listener
        };
        listener.on_ack(ack);
    }

    fn reject(&self, peer: &str, id: &str) {
        let ack = Ack::for_target(id).with_description("invalid argument");
        match self.transport() {
            Ok(transport) => {
                if let Err(e) = transport.send(peer, &ack.to_wire()) {
                    log::warn!("Reply to {} lost: {:#}", peer, e);
                }
            }
            Err(e) => log::error!("{:#}", e),
        }
    }
}

impl MessageHandler for WorkerNode {
    fn on_received(&self, peer: &str, message: &str) {
        match WireMessage::parse(message) {
            Ok(WireMessage::Function(function)) => self.on_function(peer, function),
            Ok(WireMessage::Ack(ack)) => self.on_ack(peer, ack),
            Ok(WireMessage::Hello(name)) => log::debug!("Late hello from {} ({})", peer, name),
            Err(e) => match e.command_id() {
                Some(id) => {
                    log::warn!("Rejected message {} from {}: {}", id, peer, e);
                    self.reject(peer, id);
                }
                None => log::warn!("Dropped message from {}: {}", peer, e),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::testing::*;
    use crate::controller::build_tree;
    use crate::function::FunctionKind;
    use crate::transport::local::{LocalEndpoint, LocalHub};
    use crossbeam_channel::Receiver;
    use serde_json::json;
    use std::path::Path;

    struct Inbox(crossbeam_channel::Sender<String>);

    impl MessageHandler for Inbox {
        fn on_received(&self, _peer: &str, message: &str) {
            let _ = self.0.send(message.to_string());
        }
    }

    fn node(hub: &Arc<LocalHub>, name: &str, dir: &Path) -> (Arc<WorkerNode>, LocalEndpoint) {
        let env = null_env(dir);
        let root = build_tree(&env).unwrap();
        root.activate().unwrap();
        let node = WorkerNode::new(root, env.ids.clone());
        let endpoint = hub.register(name, node.clone()).unwrap();
        (node, endpoint)
    }

    fn bystander(hub: &Arc<LocalHub>) -> (LocalEndpoint, Receiver<String>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        (hub.register("bystander", Arc::new(Inbox(tx))).unwrap(), rx)
    }

    #[test]
    fn test_request_reply_between_nodes() {
        let dir = tempfile::tempdir().unwrap();
        let hub = LocalHub::new();
        let (bench, bench_ep) = node(&hub, "bench", &dir.path().join("bench"));
        let (dut, dut_ep) = node(&hub, "dut", &dir.path().join("dut"));
        bench.attach(Arc::new(bench_ep));
        dut.attach(Arc::new(dut_ep));

        let (listener, acks, _) = collector();
        let id = bench
            .submit("dut", WorkerFunction::new(FunctionKind::RecordInfo), listener)
            .unwrap();
        let ack = next_ack(&acks);
        assert_eq!(ack.target, id);
        assert_eq!(ack.description, "info returned");
        assert!(bench.acks_for(&id).is_empty());
        assert!(bench.forget(&id).is_none());

        bench.root().destroy();
        dut.root().destroy();
        bench.detach();
        dut.detach();
    }

    #[test]
    fn test_start_tracked_until_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let hub = LocalHub::new();
        let (bench, bench_ep) = node(&hub, "bench", &dir.path().join("bench"));
        let (dut, dut_ep) = node(&hub, "dut", &dir.path().join("dut"));
        bench.attach(Arc::new(bench_ep));
        dut.attach(Arc::new(dut_ep));

        let (listener, acks, _) = collector();
        let start = bench
            .submit("dut", WorkerFunction::new(FunctionKind::RecordStart), listener.clone())
            .unwrap();
        assert_eq!(next_ack(&acks).description, "record start");
        assert_eq!(bench.acks_for(&start).len(), 1);

        let stop = bench
            .submit("dut", WorkerFunction::new(FunctionKind::RecordStop), listener)
            .unwrap();
        let ack = next_ack(&acks);
        assert_eq!(ack.target, stop);
        assert_eq!(ack.description, "stop command received");
        assert!(bench.forget(&start).is_none());
        assert!(bench.forget(&stop).is_none());

        bench.root().destroy();
        dut.root().destroy();
        bench.detach();
        dut.detach();
    }

    #[test]
    fn test_unparsable_function_with_id_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let hub = LocalHub::new();
        let (dut, dut_ep) = node(&hub, "dut", dir.path());
        dut.attach(Arc::new(dut_ep));
        let (other, replies) = bystander(&hub);

        other
            .send("dut", r#"{"command-id":"p::1","class":"SelfDestructFunction"}"#)
            .unwrap();
        let reply = WireMessage::parse(&replies.recv_timeout(WAIT).unwrap()).unwrap();
        match reply {
            WireMessage::Ack(ack) => {
                assert_eq!(ack.target, "p::1");
                assert_eq!((ack.return_code, ack.description.as_str()), (-1, "invalid argument"));
            }
            other => panic!("expected ack, got {:?}", other),
        }

        // garbage without an id is dropped silently
        other.send("dut", "not json").unwrap();
        assert!(replies.recv_timeout(std::time::Duration::from_millis(100)).is_err());

        dut.root().destroy();
        dut.detach();
    }

    #[test]
    fn test_events_reach_issuer_and_are_acknowledged() {
        let dir = tempfile::tempdir().unwrap();
        let hub = LocalHub::new();
        let (bench, bench_ep) = node(&hub, "bench", dir.path());
        bench.attach(Arc::new(bench_ep));
        let (other, replies) = bystander(&hub);

        let (listener, _acks, events) = collector();
        bench
            .submit("bystander", WorkerFunction::new(FunctionKind::RecordStart), listener)
            .unwrap();
        assert!(replies.recv_timeout(WAIT).unwrap().contains("RecordStartFunction"));

        let event = function(
            FunctionKind::RecordEvent,
            "bystander::9",
            &[
                ("event", json!(r#"{"targets":[]}"#)),
                ("class-handle", json!("ToneDetector@1")),
            ],
        );
        other.send("bench", &event.to_wire()).unwrap();

        let forwarded = events.recv_timeout(WAIT).unwrap();
        assert_eq!(forwarded.command_id(), Some("bystander::9"));
        let reply = WireMessage::parse(&replies.recv_timeout(WAIT).unwrap()).unwrap();
        assert!(matches!(reply, WireMessage::Ack(ack) if ack.description == "event received"));

        bench.root().destroy();
        bench.detach();
    }
}
