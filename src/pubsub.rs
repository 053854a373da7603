//! Pub/Sub registry (spec.md §4.G, component G).
//!
//! The fan-out-under-one-lock shape is grounded on the teacher's
//! `event_sink::SinkRegistry`: a name-keyed map of destinations, a
//! `send_to_all`-style loop, and per-destination bookkeeping — except here
//! the "sinks" are live client sockets rather than HTTP/Hook0 endpoints,
//! and delivery is abstracted behind `ClientSink` so the registry doesn't
//! care whether the client is served by a thread or the reactor.

use std::collections::HashMap;
use std::sync::Arc;

use crate::resp;

pub type ClientId = u64;

/// Anything that can have RESP bytes pushed to it asynchronously, from a
/// thread other than the one that owns the connection.
pub trait ClientSink: Send + Sync {
    fn push(&self, bytes: &[u8]);
}

struct Subscriber {
    id: ClientId,
    sink: Arc<dyn ClientSink>,
}

#[derive(Default)]
pub struct PubSub {
    channels: HashMap<String, Vec<Subscriber>>,
}

impl PubSub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes `client` to each of `names`, sending one confirmation per
    /// name with `i` the 1-based index of that name *within this call*
    /// (spec.md §4.G).
    pub fn subscribe(&mut self, client: ClientId, sink: Arc<dyn ClientSink>, names: &[String]) {
        for (idx, name) in names.iter().enumerate() {
            let channel = self.channels.entry(name.clone()).or_default();
            if !channel.iter().any(|s| s.id == client) {
                channel.push(Subscriber {
                    id: client,
                    sink: sink.clone(),
                });
            }
            let mut msg = resp::array_header(3);
            msg.extend(resp::bulk_string(b"subscribe"));
            msg.extend(resp::bulk_string(name.as_bytes()));
            msg.extend(resp::integer((idx + 1) as i64));
            sink.push(&msg);
        }
    }

    /// Unsubscribes `client` from each of `names`. An empty `names` means
    /// "every channel this client is in"; if that set is empty, a single
    /// confirmation with a null-bulk channel name is sent instead.
    pub fn unsubscribe(&mut self, client: ClientId, sink: &Arc<dyn ClientSink>, names: &[String]) {
        let targets: Vec<String> = if names.is_empty() {
            self.channels
                .iter()
                .filter(|(_, subs)| subs.iter().any(|s| s.id == client))
                .map(|(name, _)| name.clone())
                .collect()
        } else {
            names.to_vec()
        };

        if targets.is_empty() {
            let mut msg = resp::array_header(3);
            msg.extend(resp::bulk_string(b"unsubscribe"));
            msg.extend(resp::null_bulk());
            msg.extend(resp::integer(0));
            sink.push(&msg);
            return;
        }

        for name in &targets {
            if let Some(subs) = self.channels.get_mut(name) {
                subs.retain(|s| s.id != client);
                if subs.is_empty() {
                    self.channels.remove(name);
                }
            }
            let mut msg = resp::array_header(3);
            msg.extend(resp::bulk_string(b"unsubscribe"));
            msg.extend(resp::bulk_string(name.as_bytes()));
            msg.extend(resp::integer(0));
            sink.push(&msg);
        }
    }

    /// Writes one message copy per subscriber; returns the count delivered.
    pub fn publish(&self, channel: &str, message: &[u8]) -> usize {
        let Some(subs) = self.channels.get(channel) else {
            return 0;
        };
        let mut msg = resp::array_header(3);
        msg.extend(resp::bulk_string(b"message"));
        msg.extend(resp::bulk_string(channel.as_bytes()));
        msg.extend(resp::bulk_string(message));
        for sub in subs {
            sub.sink.push(&msg);
        }
        subs.len()
    }

    /// Removes `client` from every channel it was in — called on disconnect.
    pub fn remove_client(&mut self, client: ClientId) {
        self.channels.retain(|_, subs| {
            subs.retain(|s| s.id != client);
            !subs.is_empty()
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct RecordingSink(Mutex<Vec<u8>>);
    impl ClientSink for RecordingSink {
        fn push(&self, bytes: &[u8]) {
            self.0.lock().unwrap().extend_from_slice(bytes);
        }
    }

    #[test]
    fn publish_fans_out_to_all_subscribers() {
        let mut pubsub = PubSub::new();
        let a: Arc<dyn ClientSink> = Arc::new(RecordingSink(Mutex::new(Vec::new())));
        let b: Arc<dyn ClientSink> = Arc::new(RecordingSink(Mutex::new(Vec::new())));
        pubsub.subscribe(1, a.clone(), &["news".to_string()]);
        pubsub.subscribe(2, b.clone(), &["news".to_string()]);

        let delivered = pubsub.publish("news", b"hello");
        assert_eq!(delivered, 2);
    }

    #[test]
    fn remove_client_strips_every_channel() {
        let mut pubsub = PubSub::new();
        let a: Arc<dyn ClientSink> = Arc::new(RecordingSink(Mutex::new(Vec::new())));
        pubsub.subscribe(1, a.clone(), &["x".to_string(), "y".to_string()]);
        pubsub.remove_client(1);
        assert_eq!(pubsub.publish("x", b"m"), 0);
        assert_eq!(pubsub.publish("y", b"m"), 0);
    }

    #[test]
    fn zero_name_unsubscribe_with_no_subs_sends_null_channel() {
        let mut pubsub = PubSub::new();
        let recording = Arc::new(RecordingSink(Mutex::new(Vec::new())));
        let sink: Arc<dyn ClientSink> = recording.clone();
        pubsub.unsubscribe(1, &sink, &[]);

        let mut expected = resp::array_header(3);
        expected.extend(resp::bulk_string(b"unsubscribe"));
        expected.extend(resp::null_bulk());
        expected.extend(resp::integer(0));
        assert_eq!(*recording.0.lock().unwrap(), expected);
    }
}
