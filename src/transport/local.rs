//! In-process transport
//!
//! Every endpoint owns a dispatcher thread, so a handler never runs on the
//! sender's stack and a node may reply from inside its own handler.

use super::{MessageHandler, Transport, TransportError};
use anyhow::Result;
use crossbeam_channel::{unbounded, Sender};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

type Inbox = Sender<(String, String)>;

#[derive(Default)]
pub struct LocalHub {
    endpoints: Mutex<HashMap<String, Inbox>>,
}

impl LocalHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register `name`; messages for it are handed to `handler` on its own thread
    pub fn register(
        self: &Arc<Self>,
        name: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<LocalEndpoint> {
        let mut endpoints = self.endpoints.lock().unwrap_or_else(PoisonError::into_inner);
        if endpoints.contains_key(name) {
            return Err(TransportError::NameTaken(name.to_string()).into());
        }

        let (tx, rx) = unbounded::<(String, String)>();
        let label = name.to_string();
        // NOT tokio::spawn - std::thread to avoid Send issues
        thread::Builder::new()
            .name(format!("hub-{}", name))
            .spawn(move || {
                for (from, message) in rx.iter() {
                    handler.on_received(&from, &message);
                }
                log::debug!("✓ Endpoint {} stopped", label);
            })?;

        endpoints.insert(name.to_string(), tx);
        log::debug!("Endpoint {} registered", name);
        Ok(LocalEndpoint {
            name: name.to_string(),
            hub: self.clone(),
        })
    }

    fn deliver(&self, from: &str, to: &str, message: &str) -> Result<()> {
        let endpoints = self.endpoints.lock().unwrap_or_else(PoisonError::into_inner);
        let inbox = endpoints
            .get(to)
            .ok_or_else(|| TransportError::UnknownPeer(to.to_string()))?;
        inbox
            .send((from.to_string(), message.to_string()))
            .map_err(|_| TransportError::Closed(to.to_string()))?;
        Ok(())
    }
}

/// One named participant of a [`LocalHub`]; dropping it unregisters
pub struct LocalEndpoint {
    name: String,
    hub: Arc<LocalHub>,
}

impl LocalEndpoint {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Transport for LocalEndpoint {
    fn send(&self, peer: &str, message: &str) -> Result<()> {
        self.hub.deliver(&self.name, peer, message)
    }
}

impl Drop for LocalEndpoint {
    fn drop(&mut self) {
        self.hub
            .endpoints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct Echo(crossbeam_channel::Sender<(String, String)>);

    impl MessageHandler for Echo {
        fn on_received(&self, peer: &str, message: &str) {
            let _ = self.0.send((peer.to_string(), message.to_string()));
        }
    }

    #[test]
    fn test_delivery_names_sender() {
        let hub = LocalHub::new();
        let (tx, rx) = crossbeam_channel::unbounded();
        let _b = hub.register("b", Arc::new(Echo(tx))).unwrap();
        let a = hub.register("a", Arc::new(Echo(crossbeam_channel::unbounded().0))).unwrap();

        a.send("b", "ping").unwrap();
        let (from, message) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!((from.as_str(), message.as_str()), ("a", "ping"));
    }

    #[test]
    fn test_unknown_peer_and_duplicate_name() {
        let hub = LocalHub::new();
        let a = hub.register("a", Arc::new(Echo(crossbeam_channel::unbounded().0))).unwrap();
        let err = a.send("nobody", "x").unwrap_err();
        assert_eq!(
            err.downcast_ref::<TransportError>(),
            Some(&TransportError::UnknownPeer("nobody".into()))
        );
        assert!(hub
            .register("a", Arc::new(Echo(crossbeam_channel::unbounded().0)))
            .is_err());
    }

    #[test]
    fn test_drop_unregisters() {
        let hub = LocalHub::new();
        let a = hub.register("a", Arc::new(Echo(crossbeam_channel::unbounded().0))).unwrap();
        drop(hub.register("b", Arc::new(Echo(crossbeam_channel::unbounded().0))).unwrap());
        assert!(a.send("b", "x").is_err());
        assert!(hub.register("b", Arc::new(Echo(crossbeam_channel::unbounded().0))).is_ok());
    }
}
