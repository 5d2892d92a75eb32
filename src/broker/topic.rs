//! Topic management
//!
//! A `Topic` holds the set of connections subscribed under one literal
//! subscription string. `SubscriptionIndex` maps subscription strings to
//! topics and answers "who should get a message published on T".
//!
//! Two subscription forms exist. A literal topic matches only itself. A topic
//! ending in `/#` is a wildcard whose base (the string with `/#` removed) is
//! tested against published topics according to [`WildcardMode`].
//!
//! Concurrency note: the index has no interior locking. Callers hold the
//! broker lock (line transport) or run on the frame event loop.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::client::ConnectionId;

pub const WILDCARD_SUFFIX: &str = "/#";

/// How a `P/#` subscription is compared against a published topic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WildcardMode {
    /// Raw string prefix: `a/#` matches `a/b`, `a` and also `ab/c`.
    /// This is what deployed clients expect.
    #[default]
    Prefix,
    /// Segment boundary: `a/#` matches `a` and `a/...`, never `ab/c`.
    Segment,
}

impl WildcardMode {
    /// Does the subscription `filter` select the `published` topic?
    pub fn matches(self, filter: &str, published: &str) -> bool {
        let Some(base) = filter.strip_suffix(WILDCARD_SUFFIX) else {
            return filter == published;
        };
        match self {
            WildcardMode::Prefix => published.starts_with(base),
            WildcardMode::Segment => match published.strip_prefix(base) {
                Some(rest) => rest.is_empty() || rest.starts_with('/'),
                None => false,
            },
        }
    }
}

/// Whether `topic` is a `P/#` subscription.
pub fn is_wildcard(topic: &str) -> bool {
    topic.ends_with(WILDCARD_SUFFIX)
}

#[derive(Debug, Default)]
pub struct Topic {
    pub name: String,
    pub subscribers: HashSet<ConnectionId>,
}

impl Topic {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            subscribers: HashSet::new(),
        }
    }

    /// Returns `false` if `id` was already subscribed.
    pub fn subscribe(&mut self, id: ConnectionId) -> bool {
        self.subscribers.insert(id)
    }

    pub fn unsubscribe(&mut self, id: &ConnectionId) -> bool {
        self.subscribers.remove(id)
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }
}

/// Subscription string -> subscribed connections.
///
/// Invariant: no `Topic` in `topics` is ever empty.
#[derive(Debug, Default)]
pub struct SubscriptionIndex {
    topics: HashMap<String, Topic>,
    mode: WildcardMode,
}

impl SubscriptionIndex {
    /// Empty index matching wildcards according to `mode`.
    pub fn new(mode: WildcardMode) -> Self {
        Self {
            topics: HashMap::new(),
            mode,
        }
    }

    /// The wildcard rule this index applies.
    pub fn mode(&self) -> WildcardMode {
        self.mode
    }

    /// Idempotent. Returns `true` when the pair was newly added.
    pub fn subscribe(&mut self, topic: &str, id: ConnectionId) -> bool {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| Topic::new(topic))
            .subscribe(id)
    }

    /// No-op if the pair is absent. Drops the topic once its last subscriber
    /// leaves.
    pub fn unsubscribe(&mut self, topic: &str, id: &ConnectionId) -> bool {
        let Some(entry) = self.topics.get_mut(topic) else {
            return false;
        };
        let removed = entry.unsubscribe(id);
        if entry.is_empty() {
            self.topics.remove(topic);
        }
        removed
    }

    /// Exact subscribers of `published` plus subscribers of every wildcard
    /// whose base matches it. A connection appears once even if several
    /// subscriptions select it.
    pub fn matching(&self, published: &str) -> HashSet<ConnectionId> {
        let mut targets = HashSet::new();
        if let Some(exact) = self.topics.get(published) {
            targets.extend(exact.subscribers.iter().copied());
        }
        for (filter, topic) in &self.topics {
            if is_wildcard(filter) && self.mode.matches(filter, published) {
                targets.extend(topic.subscribers.iter().copied());
            }
        }
        targets
    }

    /// Removes `id` from every topic. Returns the subscriptions it held.
    pub fn remove_connection(&mut self, id: &ConnectionId) -> Vec<String> {
        let mut held = Vec::new();
        self.topics.retain(|name, topic| {
            if topic.unsubscribe(id) {
                held.push(name.clone());
            }
            !topic.is_empty()
        });
        held
    }

    /// Subscriptions currently held by `id`, sorted.
    pub fn topics_for(&self, id: &ConnectionId) -> Vec<String> {
        let mut held: Vec<String> = self
            .topics
            .values()
            .filter(|t| t.subscribers.contains(id))
            .map(|t| t.name.clone())
            .collect();
        held.sort();
        held
    }

    /// Whether `topic` currently has at least one subscriber.
    pub fn contains_topic(&self, topic: &str) -> bool {
        self.topics.contains_key(topic)
    }

    /// Whether `id` holds exactly the subscription `topic`.
    pub fn is_subscribed(&self, topic: &str, id: &ConnectionId) -> bool {
        self.topics
            .get(topic)
            .is_some_and(|t| t.subscribers.contains(id))
    }

    /// Number of distinct subscription strings with subscribers.
    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }

    /// Drops every subscription.
    pub fn clear(&mut self) {
        self.topics.clear();
    }
}
