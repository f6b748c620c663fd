//! Sync configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use rowsync_core::Topology;

/// Configuration for sync behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SyncConfig {
    /// How replicas are connected. Decides site id masking and which
    /// change shape goes on the wire.
    pub topology: Topology,
    /// Log entries read per page when answering a pull.
    pub pull_page_size: usize,
    /// Log entries read per streamed batch.
    pub stream_batch_size: usize,
    /// Streamed batches that may be unacknowledged before the sender waits.
    pub max_unacked_batches: usize,
    /// Debounce between a commit notification and stream delivery.
    #[serde(rename = "notifyLatencyInMs", with = "millis")]
    pub notify_latency: Duration,
    /// How long a stream sender waits for an ack when its window is full.
    #[serde(rename = "ackTimeoutInMs", with = "millis")]
    pub ack_timeout: Duration,
    /// Timeout for waiting for peer messages.
    #[serde(rename = "messageTimeoutInMs", with = "millis")]
    pub message_timeout: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            topology: Topology::ClientServer,
            pull_page_size: 500,
            stream_batch_size: 100,
            max_unacked_batches: 16,
            notify_latency: Duration::from_millis(50),
            ack_timeout: Duration::from_secs(10),
            message_timeout: Duration::from_secs(30),
        }
    }
}

impl SyncConfig {
    pub fn with_topology(mut self, topology: Topology) -> Self {
        self.topology = topology;
        self
    }

    pub fn with_pull_page_size(mut self, size: usize) -> Self {
        self.pull_page_size = size.max(1);
        self
    }

    pub fn with_stream_batch_size(mut self, size: usize) -> Self {
        self.stream_batch_size = size.max(1);
        self
    }

    pub fn with_max_unacked_batches(mut self, batches: usize) -> Self {
        self.max_unacked_batches = batches.max(1);
        self
    }

    pub fn with_notify_latency(mut self, latency: Duration) -> Self {
        self.notify_latency = latency;
        self
    }

    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    pub fn with_message_timeout(mut self, timeout: Duration) -> Self {
        self.message_timeout = timeout;
        self
    }
}

/// Durations as integer milliseconds.
mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_uses_millis() {
        let config = SyncConfig::default().with_notify_latency(Duration::from_millis(5));
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["notifyLatencyInMs"], 5);
        assert_eq!(json["topology"], "client_server");
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config: SyncConfig =
            serde_json::from_str(r#"{"topology":"peer_to_peer","ackTimeoutInMs":250}"#).unwrap();
        assert_eq!(config.topology, Topology::PeerToPeer);
        assert_eq!(config.ack_timeout, Duration::from_millis(250));
        assert_eq!(config.pull_page_size, SyncConfig::default().pull_page_size);
    }

    #[test]
    fn test_sizes_never_zero() {
        let config = SyncConfig::default().with_stream_batch_size(0).with_pull_page_size(0);
        assert_eq!(config.stream_batch_size, 1);
        assert_eq!(config.pull_page_size, 1);
    }
}
