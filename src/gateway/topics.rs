//! Topic name → subscribed sessions.
//!
//! Owned by the hub control loop; nothing else holds a reference, so the
//! registry itself needs no locking.

use std::collections::{HashMap, HashSet};

#[derive(Debug, Default)]
pub struct TopicRegistry {
    topics: HashMap<String, HashSet<String>>,
}

impl TopicRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `session_id` to `topic`, creating the topic on first use.
    /// Returns `false` if it was already subscribed.
    pub fn subscribe(&mut self, topic: &str, session_id: &str) -> bool {
        match self.topics.get_mut(topic) {
            Some(subscribers) => subscribers.insert(session_id.to_string()),
            None => {
                let subscribers = HashSet::from([session_id.to_string()]);
                self.topics.insert(topic.to_string(), subscribers);
                true
            }
        }
    }

    /// Remove `session_id` from `topic`, dropping the topic once empty.
    /// Returns `false` if it was not subscribed.
    pub fn unsubscribe(&mut self, topic: &str, session_id: &str) -> bool {
        let Some(subscribers) = self.topics.get_mut(topic) else {
            return false;
        };
        let removed = subscribers.remove(session_id);
        if subscribers.is_empty() {
            self.topics.remove(topic);
        }
        removed
    }

    /// Remove a session from each of the given topics.
    pub fn remove_session<'a>(
        &mut self,
        session_id: &str,
        topics: impl IntoIterator<Item = &'a String>,
    ) {
        for topic in topics {
            self.unsubscribe(topic, session_id);
        }
    }

    pub fn subscribers(&self, topic: &str) -> Option<&HashSet<String>> {
        self.topics.get(topic)
    }

    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }

    /// Topic names with their subscriber counts, sorted by name.
    pub fn summary(&self) -> Vec<(String, usize)> {
        let mut out: Vec<_> = self
            .topics
            .iter()
            .map(|(name, subs)| (name.clone(), subs.len()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    impl TopicRegistry {
        fn subscriber_count(&self, topic: &str) -> usize {
            self.subscribers(topic).map_or(0, HashSet::len)
        }

        fn contains(&self, topic: &str) -> bool {
            self.topics.contains_key(topic)
        }
    }

    #[test]
    fn test_subscribe_creates_topic() {
        let mut reg = TopicRegistry::new();
        assert!(reg.subscribe("cve-alerts", "s1"));
        assert!(reg.contains("cve-alerts"));
        assert_eq!(reg.subscriber_count("cve-alerts"), 1);
    }

    #[test]
    fn test_subscribe_is_idempotent() {
        let mut reg = TopicRegistry::new();
        assert!(reg.subscribe("cve-alerts", "s1"));
        assert!(!reg.subscribe("cve-alerts", "s1"));
        assert_eq!(reg.subscriber_count("cve-alerts"), 1);
    }

    #[test]
    fn test_last_unsubscribe_removes_topic() {
        let mut reg = TopicRegistry::new();
        reg.subscribe("t", "s1");
        reg.subscribe("t", "s2");
        assert!(reg.unsubscribe("t", "s1"));
        assert!(reg.contains("t"));
        assert!(reg.unsubscribe("t", "s2"));
        assert!(!reg.contains("t"));
        assert_eq!(reg.topic_count(), 0);
    }

    #[test]
    fn test_unsubscribe_unknown_is_noop() {
        let mut reg = TopicRegistry::new();
        assert!(!reg.unsubscribe("nothing", "s1"));
        reg.subscribe("t", "s1");
        assert!(!reg.unsubscribe("t", "s2"));
        assert_eq!(reg.subscriber_count("t"), 1);
    }

    #[test]
    fn test_remove_session_from_all_topics() {
        let mut reg = TopicRegistry::new();
        reg.subscribe("a", "s1");
        reg.subscribe("b", "s1");
        reg.subscribe("b", "s2");
        let topics = vec!["a".to_string(), "b".to_string()];
        reg.remove_session("s1", &topics);
        assert!(!reg.contains("a"));
        assert_eq!(reg.subscriber_count("b"), 1);
        assert!(reg.subscribers("b").unwrap().contains("s2"));
    }

    #[test]
    fn test_summary_sorted() {
        let mut reg = TopicRegistry::new();
        reg.subscribe("zeta", "s1");
        reg.subscribe("alpha", "s1");
        reg.subscribe("alpha", "s2");
        assert_eq!(
            reg.summary(),
            vec![("alpha".to_string(), 2), ("zeta".to_string(), 1)]
        );
    }
}
