use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;

use tokio::time;
use tracing::{debug, warn};

use crate::connector::BrokerSession;
use crate::types::{now_rfc3339, PublisherObservation, TopicObservations};

/// Filters subscribed once a session is connected: everything, plus the
/// broker introspection subtrees listing clients and subscriptions.
pub const LISTEN_FILTERS: &[&str] = &["#", "$SYS/broker/clients/#", "$SYS/broker/subscriptions/#"];

const SYS_PREFIX: &str = "$SYS";
const PAYLOAD_PREVIEW_CHARS: usize = 256;
const CLIENT_METRIC_NAMES: &[&str] = &[
    "connected",
    "disconnected",
    "total",
    "maximum",
    "active",
    "inactive",
    "expired",
    "count",
];

/// Per-attempt sink for messages delivered during the listening window.
///
/// Publisher entries are keyed by (topic, qos, retained): a repeated
/// signature bumps the count, a different payload size on the same key
/// updates the entry in place.
#[derive(Debug, Default)]
pub struct TopicAccumulator {
    own_client_id: String,
    publishers: Vec<PublisherObservation>,
    index: HashMap<(String, u8, bool), usize>,
    subscribers: BTreeSet<String>,
    sys_topics: BTreeMap<String, String>,
}

impl TopicAccumulator {
    pub fn new(own_client_id: &str) -> Self {
        Self {
            own_client_id: own_client_id.to_string(),
            ..Self::default()
        }
    }

    pub fn record(&mut self, topic: &str, payload: &[u8], qos: u8, retained: bool) {
        if topic.starts_with(SYS_PREFIX) {
            self.sys_topics
                .insert(topic.to_string(), payload_preview(payload));
            if let Some(id) = subscriber_from_sys(topic, payload) {
                if id != self.own_client_id {
                    self.subscribers.insert(id);
                }
            }
            return;
        }

        let key = (topic.to_string(), qos, retained);
        match self.index.get(&key) {
            Some(&i) => {
                let entry = &mut self.publishers[i];
                entry.message_count += 1;
                entry.payload_size = payload.len();
                entry.last_payload = payload_preview(payload);
            }
            None => {
                self.index.insert(key, self.publishers.len());
                self.publishers.push(PublisherObservation {
                    topic: topic.to_string(),
                    payload_size: payload.len(),
                    qos,
                    retained,
                    last_payload: payload_preview(payload),
                    message_count: 1,
                    first_seen: now_rfc3339(),
                });
            }
        }
    }

    pub fn into_observations(self) -> TopicObservations {
        TopicObservations {
            publishers: self.publishers,
            subscribers: self.subscribers.into_iter().collect(),
            sys_topics: self.sys_topics,
        }
    }
}

/// Subscribe to [`LISTEN_FILTERS`], wait out the full window, then close the
/// session and hand back what was seen.
pub async fn listen(session: BrokerSession, window: Duration) -> TopicObservations {
    debug!(client_id = session.client_id(), ?window, "listening");
    for filter in LISTEN_FILTERS {
        if let Err(e) = session.subscribe(filter).await {
            warn!(filter, error = %e, "subscribe request failed");
        }
    }

    time::sleep(window).await;

    let observations = session.close().await.into_observations();
    debug!(
        publishers = observations.publishers.len(),
        subscribers = observations.subscribers.len(),
        sys_topics = observations.sys_topics.len(),
        "listening window closed"
    );
    observations
}

/// Pull a client id out of a `$SYS` message naming a connected client.
///
/// A JSON payload carrying `clientid`/`client_id` wins; otherwise the topic
/// segment following `clients` is used unless it is a counter name.
fn subscriber_from_sys(topic: &str, payload: &[u8]) -> Option<String> {
    let segments: Vec<&str> = topic.split('/').collect();
    let pos = segments.iter().position(|s| *s == "clients")?;

    if let Ok(serde_json::Value::Object(map)) = serde_json::from_slice::<serde_json::Value>(payload)
    {
        for field in ["clientid", "client_id"] {
            if let Some(serde_json::Value::String(id)) = map.get(field) {
                if !id.is_empty() {
                    return Some(id.clone());
                }
            }
        }
    }

    let candidate = segments.get(pos + 1)?;
    if candidate.is_empty() || CLIENT_METRIC_NAMES.contains(candidate) {
        None
    } else {
        Some(candidate.to_string())
    }
}

fn payload_preview(payload: &[u8]) -> String {
    String::from_utf8_lossy(payload)
        .chars()
        .take(PAYLOAD_PREVIEW_CHARS)
        .collect()
}
