use std::collections::HashMap;

use tokio::sync::broadcast;

/// Emitted whenever cached data under `topic` goes stale.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invalidation {
    pub topic: String,
    pub generation: u64,
}

/// Cache invalidation keyed by topic. A topic's generation only ever grows;
/// cached values tagged with an older generation must be refetched.
pub trait QueryBus: Send + Sync {
    fn subscribe(&self, topic: &str) -> broadcast::Receiver<Invalidation>;
    fn invalidate(&self, topic: &str) -> u64;
    fn generation(&self, topic: &str) -> u64;
}

struct TopicState {
    sender: broadcast::Sender<Invalidation>,
    generation: u64,
}

impl TopicState {
    fn new() -> Self {
        Self {
            sender: broadcast::channel(64).0,
            generation: 0,
        }
    }
}

/// In-process bus; the only implementation the relay needs.
#[derive(Default)]
pub struct LocalQueryBus {
    topics: parking_lot::RwLock<HashMap<String, TopicState>>,
}

impl LocalQueryBus {
    pub fn new() -> Self {
        Self::default()
    }
}

impl std::fmt::Debug for LocalQueryBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let topics = self.topics.read();
        let mut map = f.debug_map();
        for (topic, state) in topics.iter() {
            map.entry(topic, &state.generation);
        }
        map.finish()
    }
}

impl QueryBus for LocalQueryBus {
    fn subscribe(&self, topic: &str) -> broadcast::Receiver<Invalidation> {
        let mut guard = self.topics.write();
        guard
            .entry(topic.to_string())
            .or_insert_with(TopicState::new)
            .sender
            .subscribe()
    }

    fn invalidate(&self, topic: &str) -> u64 {
        let mut guard = self.topics.write();
        let state = guard
            .entry(topic.to_string())
            .or_insert_with(TopicState::new);
        state.generation += 1;
        // No subscribers is fine: the generation bump alone marks caches stale.
        let _ = state.sender.send(Invalidation {
            topic: topic.to_string(),
            generation: state.generation,
        });
        state.generation
    }

    fn generation(&self, topic: &str) -> u64 {
        self.topics
            .read()
            .get(topic)
            .map(|state| state.generation)
            .unwrap_or(0)
    }
}
