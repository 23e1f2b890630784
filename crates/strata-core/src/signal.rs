// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Change notification.
//!
//! Subscribers live in a registry owned by whoever owns the state (the engine
//! or a mirror), keyed by the entity they watch. Views borrow the owner, so a
//! subscription outlives any particular view object.
use std::fmt;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::ident::{Btt, EdgeIndex, GraphName, Key, NodeName, RulebookName, Value};

/// Something that can change.
#[derive(Clone, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub enum Entity {
    /// A graph's own attributes and rulebook.
    Graph(GraphName),
    /// A node.
    Node(GraphName, NodeName),
    /// One indexed edge.
    Edge(GraphName, NodeName, NodeName, EdgeIndex),
}

/// What changed about an [`Entity`].
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub enum Change {
    /// Attribute set (`Some`) or deleted (`None`).
    Attr {
        /// Attribute key.
        key: Key,
        /// New value.
        value: Option<Value>,
    },
    /// Entity created or removed.
    Exists(bool),
    /// Rulebook assignment changed.
    Rulebook(Option<RulebookName>),
    /// A node of some graph became (or stopped being) this graph's avatar.
    Avatar {
        /// Graph holding the node.
        graph: GraphName,
        /// The node.
        node: NodeName,
        /// New state.
        is_avatar: bool,
    },
}

/// One notification.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Coordinate the change was recorded at.
    pub btt: Btt,
    /// Changed entity.
    pub entity: Entity,
    /// The change.
    pub change: Change,
}

/// Handle returned by the `subscribe` family.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct SubscriptionId(u64);

/// Change callback.
pub type Callback = Box<dyn FnMut(&ChangeEvent) + Send>;

/// Time-travel callback receiving `(from, to)`.
pub type TimeCallback = Box<dyn FnMut(&Btt, &Btt) + Send>;

/// Registry of change and time listeners.
#[derive(Default)]
pub struct Subscribers {
    next: u64,
    by_entity: FxHashMap<Entity, Vec<(SubscriptionId, Callback)>>,
    all: Vec<(SubscriptionId, Callback)>,
    time: Vec<(SubscriptionId, TimeCallback)>,
}

impl fmt::Debug for Subscribers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscribers")
            .field("entities", &self.by_entity.len())
            .field("all", &self.all.len())
            .field("time", &self.time.len())
            .finish()
    }
}

impl Subscribers {
    fn issue(&mut self) -> SubscriptionId {
        self.next += 1;
        SubscriptionId(self.next)
    }

    /// Calls `callback` for every change to `entity`.
    pub fn subscribe(&mut self, entity: Entity, callback: Callback) -> SubscriptionId {
        let id = self.issue();
        self.by_entity.entry(entity).or_default().push((id, callback));
        id
    }

    /// Calls `callback` for every change.
    pub fn subscribe_all(&mut self, callback: Callback) -> SubscriptionId {
        let id = self.issue();
        self.all.push((id, callback));
        id
    }

    /// Calls `callback` whenever the current coordinate moves.
    pub fn on_time(&mut self, callback: TimeCallback) -> SubscriptionId {
        let id = self.issue();
        self.time.push((id, callback));
        id
    }

    /// Removes a subscription. Returns `false` if `id` was unknown.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.len();
        for subs in self.by_entity.values_mut() {
            subs.retain(|(i, _)| *i != id);
        }
        self.by_entity.retain(|_, subs| !subs.is_empty());
        self.all.retain(|(i, _)| *i != id);
        self.time.retain(|(i, _)| *i != id);
        self.len() != before
    }

    /// Number of live subscriptions.
    pub fn len(&self) -> usize {
        self.by_entity.values().map(Vec::len).sum::<usize>() + self.all.len() + self.time.len()
    }

    /// Whether there are no subscriptions.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Delivers `event` to entity watchers, then to catch-all watchers.
    pub fn notify(&mut self, event: &ChangeEvent) {
        if let Some(subs) = self.by_entity.get_mut(&event.entity) {
            for (_, cb) in subs.iter_mut() {
                cb(event);
            }
        }
        for (_, cb) in &mut self.all {
            cb(event);
        }
    }

    /// Delivers a time move.
    pub fn notify_time(&mut self, from: &Btt, to: &Btt) {
        for (_, cb) in &mut self.time {
            cb(from, to);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    #[test]
    fn entity_subscribers_only_see_their_entity() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut subs = Subscribers::default();
        let sink = Arc::clone(&seen);
        let id = subs.subscribe(
            Entity::Node("g".into(), "a".into()),
            Box::new(move |ev| sink.lock().unwrap().push(ev.change.clone())),
        );
        let ev = |node: &str| ChangeEvent {
            btt: Btt::new("trunk", 0, 1),
            entity: Entity::Node("g".into(), node.into()),
            change: Change::Exists(true),
        };
        subs.notify(&ev("a"));
        subs.notify(&ev("b"));
        assert_eq!(seen.lock().unwrap().len(), 1);
        assert!(subs.unsubscribe(id));
        assert!(!subs.unsubscribe(id));
        subs.notify(&ev("a"));
        assert_eq!(seen.lock().unwrap().len(), 1);
        assert!(subs.is_empty());
    }
}
