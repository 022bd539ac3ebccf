//! Asynchronous state-change delivery
//!
//! Each controller owns a [`Broadcaster`] with its own delivery thread, so a
//! slow or reentrant subscriber never stalls a task thread or the caller.
//! Subscribing returns a [`Subscription`]; dropping it unsubscribes.

use crossbeam_channel::{unbounded, Sender};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::thread;

/// Running tasks of one controller after a change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateChange {
    pub controller: String,
    pub running: Vec<String>,
}

pub trait StateListener: Send + Sync {
    fn on_state_changed(&self, change: &StateChange);
}

impl<F> StateListener for F
where
    F: Fn(&StateChange) + Send + Sync,
{
    fn on_state_changed(&self, change: &StateChange) {
        self(change)
    }
}

type SubscriberList = Mutex<Vec<(u64, Arc<dyn StateListener>)>>;

static NEXT_SUBSCRIPTION: AtomicU64 = AtomicU64::new(1);

#[derive(Clone)]
pub struct Broadcaster {
    name: Arc<str>,
    subscribers: Arc<SubscriberList>,
    tx: Arc<Mutex<Option<Sender<StateChange>>>>,
}

impl Broadcaster {
    pub fn start(name: &str) -> Self {
        let (tx, rx) = unbounded::<StateChange>();
        let subscribers: Arc<SubscriberList> = Arc::new(Mutex::new(Vec::new()));

        let thread_subscribers = Arc::downgrade(&subscribers);
        let label = name.to_string();
        // NOT tokio::spawn - std::thread to avoid Send issues
        let spawned = thread::Builder::new()
            .name(format!("{}-state", name))
            .spawn(move || {
                for change in rx.iter() {
                    let Some(list) = thread_subscribers.upgrade() else {
                        break;
                    };
                    // deliver from a snapshot so subscribers may (un)subscribe
                    let snapshot: Vec<Arc<dyn StateListener>> = list
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .iter()
                        .map(|(_, l)| l.clone())
                        .collect();
                    drop(list);
                    for listener in snapshot {
                        listener.on_state_changed(&change);
                    }
                }
                log::debug!("✓ {} state broadcaster stopped", label);
            });

        let tx = match spawned {
            Ok(_) => Some(tx),
            Err(e) => {
                log::error!("{}: failed to start state broadcaster: {}", name, e);
                None
            }
        };

        Self {
            name: name.into(),
            subscribers,
            tx: Arc::new(Mutex::new(tx)),
        }
    }

    pub fn subscribe(&self, listener: Arc<dyn StateListener>) -> Subscription {
        let id = NEXT_SUBSCRIPTION.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, listener));
        Subscription {
            id,
            subscribers: Arc::downgrade(&self.subscribers),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Queue a change for delivery; never blocks
    pub fn publish(&self, change: StateChange) {
        let tx = self.tx.lock().unwrap_or_else(PoisonError::into_inner);
        match tx.as_ref() {
            Some(tx) => {
                if tx.send(change).is_err() {
                    log::debug!("{}: state broadcaster gone", self.name);
                }
            }
            None => log::trace!("{}: state change after stop dropped", self.name),
        }
    }

    /// Deliver what is queued, then end the delivery thread
    pub fn stop(&self) {
        self.tx.lock().unwrap_or_else(PoisonError::into_inner).take();
    }
}

/// Live registration; dropping or cancelling it unsubscribes
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    id: u64,
    subscribers: Weak<SubscriberList>,
}

impl Subscription {
    pub fn cancel(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(list) = self.subscribers.upgrade() {
            list.lock()
                .unwrap_or_else(PoisonError::into_inner)
                .retain(|(id, _)| *id != self.id);
        }
    }
}
