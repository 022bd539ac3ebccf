//! Composite controller that routes commands to named children
//!
//! The routing table maps each [`FunctionGroup`] to exactly one child and is
//! fixed when the manager is built. Child state changes are re-published to
//! the manager's own subscribers.

use super::broadcast::{StateChange, StateListener, Subscription};
use super::{Controller, ControllerCore, Lifecycle};
use crate::function::{Ack, FunctionGroup, SharedListener, WorkerFunction};
use anyhow::{bail, Result};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};

pub struct ManagerController {
    core: ControllerCore,
    children: Vec<Arc<dyn Controller>>,
    routes: HashMap<FunctionGroup, usize>,
    /// Keeps the re-publishing subscriptions on children alive
    child_subscriptions: Mutex<Vec<Subscription>>,
}

pub struct ManagerBuilder {
    name: String,
    children: Vec<Arc<dyn Controller>>,
    routes: Vec<(FunctionGroup, usize)>,
}

impl ManagerBuilder {
    /// Route one group to `child`
    pub fn route(self, group: FunctionGroup, child: Arc<dyn Controller>) -> Self {
        self.route_all(&[group], child)
    }

    /// Route several groups to the same child
    pub fn route_all(mut self, groups: &[FunctionGroup], child: Arc<dyn Controller>) -> Self {
        let index = match self.children.iter().position(|c| Arc::ptr_eq(c, &child)) {
            Some(index) => index,
            None => {
                self.children.push(child);
                self.children.len() - 1
            }
        };
        self.routes.extend(groups.iter().map(|g| (*g, index)));
        self
    }

    pub fn build(self) -> Result<Arc<ManagerController>> {
        let mut seen = HashSet::new();
        for child in &self.children {
            if !seen.insert(child.name()) {
                bail!("{}: duplicate child controller '{}'", self.name, child.name());
            }
        }

        let mut routes = HashMap::new();
        for (group, index) in self.routes {
            if routes.insert(group, index).is_some() {
                bail!("{}: {:?} routed twice", self.name, group);
            }
        }

        let core = ControllerCore::new(&self.name);
        let subscriptions = self
            .children
            .iter()
            .map(|child| {
                let parent = core.broadcaster().clone();
                let forward: Arc<dyn StateListener> =
                    Arc::new(move |change: &StateChange| parent.publish(change.clone()));
                child.subscribe(forward)
            })
            .collect();

        log::debug!(
            "{} routes {:?}",
            self.name,
            routes
                .iter()
                .map(|(g, i)| format!("{:?}->{}", g, self.children[*i].name()))
                .collect::<Vec<_>>()
        );

        Ok(Arc::new(ManagerController {
            core,
            children: self.children,
            routes,
            child_subscriptions: Mutex::new(subscriptions),
        }))
    }
}

impl ManagerController {
    pub fn builder(name: &str) -> ManagerBuilder {
        ManagerBuilder {
            name: name.to_string(),
            children: Vec::new(),
            routes: Vec::new(),
        }
    }

    fn route(&self, group: FunctionGroup) -> Option<&Arc<dyn Controller>> {
        self.routes.get(&group).map(|i| &self.children[*i])
    }
}

impl Controller for ManagerController {
    fn name(&self) -> &str {
        self.core.name()
    }

    fn lifecycle(&self) -> Lifecycle {
        self.core.lifecycle()
    }

    fn activate(&self) -> Result<()> {
        self.core.activate()?;
        for child in &self.children {
            child.activate()?;
        }
        Ok(())
    }

    fn destroy(&self) {
        if !self.core.begin_destroy() {
            return;
        }
        for child in &self.children {
            child.destroy();
        }
        self.child_subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.core.finish_destroy();
    }

    fn execute(&self, function: WorkerFunction, listener: SharedListener) {
        if !self.core.admit(&function, &listener) {
            return;
        }
        match self.route(function.group()) {
            Some(child) => {
                log::debug!("{} -> {}: {}", self.name(), child.name(), function.kind());
                child.execute(function, listener);
            }
            None => {
                log::warn!("{}: no route for {}", self.name(), function.kind());
                listener.on_ack(Ack::to_function(&function).with_description("unsupported command"));
            }
        }
    }

    fn subscribe(&self, listener: Arc<dyn StateListener>) -> Subscription {
        self.core.subscribe(listener)
    }

    fn running(&self) -> Vec<String> {
        self.children.iter().flat_map(|c| c.running()).collect()
    }

    fn children(&self) -> Vec<Arc<dyn Controller>> {
        self.children.clone()
    }
}
