//! Topic registry and publish fan-out

use crate::connection::{ConnId, Mode};
use crate::engine::Engine;
use crate::websocket::{Opcode, SendStatus};
use std::collections::{HashMap, HashSet};
use tracing::trace;

/// Topic name to subscribed sessions
///
/// A session appears under a topic at most once; empty topics are removed.
#[derive(Debug, Default)]
pub(crate) struct TopicRegistry {
    topics: HashMap<String, HashSet<ConnId>>,
}

impl TopicRegistry {
    /// Returns true if the session was not subscribed before
    pub(crate) fn subscribe(&mut self, topic: &str, id: ConnId) -> bool {
        self.topics.entry(topic.to_string()).or_default().insert(id)
    }

    /// Returns true if the session was subscribed
    pub(crate) fn unsubscribe(&mut self, topic: &str, id: ConnId) -> bool {
        let Some(subscribers) = self.topics.get_mut(topic) else {
            return false;
        };
        let removed = subscribers.remove(&id);
        if subscribers.is_empty() {
            self.topics.remove(topic);
        }
        removed
    }

    pub(crate) fn is_subscribed(&self, topic: &str, id: ConnId) -> bool {
        self.topics.get(topic).is_some_and(|s| s.contains(&id))
    }

    pub(crate) fn count(&self, topic: &str) -> usize {
        self.topics.get(topic).map_or(0, HashSet::len)
    }

    /// Snapshot of the subscribers, in handle order
    pub(crate) fn subscribers(&self, topic: &str) -> Vec<ConnId> {
        let mut ids: Vec<ConnId> = self
            .topics
            .get(topic)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default();
        ids.sort_unstable();
        ids
    }

    pub(crate) fn topic_count(&self) -> usize {
        self.topics.len()
    }
}

impl Engine {
    /// Deliver `message` to every current subscriber of `topic`
    ///
    /// Subscribers are snapshotted first and re-checked right before each
    /// send, so a session that unsubscribed (or closed) during the fan-out
    /// is skipped. Returns true if at least one send was not dropped.
    pub(crate) fn publish(
        &mut self,
        topic: &str,
        message: &[u8],
        opcode: Opcode,
        compress: bool,
        except: Option<ConnId>,
    ) -> bool {
        let mut delivered = false;
        for id in self.topics.subscribers(topic) {
            if Some(id) == except || !self.topics.is_subscribed(topic, id) {
                continue;
            }
            match self.ws_send(id, message, opcode, compress, true) {
                Ok(SendStatus::Dropped) => trace!(conn = %id, topic, "publish dropped"),
                Ok(_) => delivered = true,
                Err(_) => {}
            }
        }
        delivered
    }

    /// Subscribe a session; fires the `subscription` callback on change
    pub(crate) fn subscribe(&mut self, id: ConnId, topic: &str) -> bool {
        if !self.session_open(id) {
            return false;
        }
        let old = self.topics.count(topic);
        if !self.topics.subscribe(topic, id) {
            return true;
        }
        if let Some(Mode::WebSocket(session)) = self.conns.get_mut(id).map(|c| &mut c.mode) {
            session.topics.insert(topic.to_string());
        }
        self.notify_subscription(id, topic, old + 1, old);
        true
    }

    /// Unsubscribe a session; returns false if it was not subscribed
    pub(crate) fn unsubscribe(&mut self, id: ConnId, topic: &str) -> bool {
        let old = self.topics.count(topic);
        if !self.topics.unsubscribe(topic, id) {
            return false;
        }
        if let Some(Mode::WebSocket(session)) = self.conns.get_mut(id).map(|c| &mut c.mode) {
            session.topics.remove(topic);
        }
        self.notify_subscription(id, topic, old - 1, old);
        true
    }

    fn notify_subscription(&mut self, id: ConnId, topic: &str, new_count: usize, old_count: usize) {
        let handler = match self.conns.get(id).map(|c| &c.mode) {
            Some(Mode::WebSocket(session)) => session.handler.clone(),
            _ => return,
        };
        handler.subscription(self, id, topic, new_count as i32, old_count as i32);
    }
}
