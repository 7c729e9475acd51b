//! Connection state per topic
//!
//! A target may hold several sockets at once (phone + tablet, reconnect
//! before the old socket times out). Sessions are reference counted so the
//! target stays reachable until its last socket goes away.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

#[derive(Debug, Default)]
pub struct SessionRegistry {
    /// topic key -> open connection count
    sessions: DashMap<String, usize>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection; returns true for the first one
    pub fn connect(&self, topic_key: &str) -> bool {
        let mut count = self.sessions.entry(topic_key.to_string()).or_insert(0);
        *count += 1;
        *count == 1
    }

    /// Drop a connection; returns true when the last one closed
    pub fn disconnect(&self, topic_key: &str) -> bool {
        match self.sessions.entry(topic_key.to_string()) {
            Entry::Occupied(mut entry) => {
                if *entry.get() <= 1 {
                    entry.remove();
                    true
                } else {
                    *entry.get_mut() -= 1;
                    false
                }
            }
            Entry::Vacant(_) => {
                tracing::debug!(topic = %topic_key, "Disconnect without session");
                false
            }
        }
    }

    pub fn is_reachable(&self, topic_key: &str) -> bool {
        self.sessions.contains_key(topic_key)
    }

    pub fn connection_count(&self, topic_key: &str) -> usize {
        self.sessions.get(topic_key).map(|c| *c).unwrap_or(0)
    }
}
