//! TOML configuration for the mailsift daemon.
//!
//! Every section and field is optional; missing values fall back to the
//! defaults of [`QueueSettings`] and [`StoreSettings`].

use std::path::Path;

use mailsift_types::{AckPolicy, ConnectMode, NodeId, QueueSettings, StoreSettings, WorkerConfig};
use serde::Deserialize;

/// Top-level configuration, parsed from TOML.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// Work queue.
    pub queue: QueueSection,
    /// Store tier.
    pub store: StoreSection,
    /// Logging configuration.
    pub log: LogSection,
}

/// `[queue]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct QueueSection {
    /// AMQP URI of the broker.
    pub url: String,
    /// Durable work queue name.
    pub name: String,
    /// Maximum unacknowledged jobs held by the worker. Zero is raised to one.
    pub prefetch: u16,
    /// Delay between broker connection attempts, in milliseconds.
    pub reconnect_delay_ms: u64,
    /// Consumer tag announced to the broker.
    pub consumer_tag: String,
    /// `"always"` or `"dead-letter"`.
    pub ack_policy: AckPolicy,
    /// Exchange receiving dead-lettered jobs.
    pub dead_letter_exchange: String,
}

impl Default for QueueSection {
    fn default() -> Self {
        let defaults = QueueSettings::default();
        Self {
            url: defaults.url,
            name: defaults.queue,
            prefetch: defaults.prefetch,
            reconnect_delay_ms: defaults.reconnect_delay_ms,
            consumer_tag: defaults.consumer_tag,
            ack_policy: defaults.ack_policy,
            dead_letter_exchange: defaults.dead_letter_exchange,
        }
    }
}

/// Store backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Remote redis nodes; node ids are redis URLs.
    #[default]
    Redis,
    /// In-process sets, one per node id.
    Memory,
}

/// `[store]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    /// Backend type: `"redis"` (default) or `"memory"`.
    pub backend: StoreBackend,
    /// Store node ids, in order.
    pub nodes: Vec<String>,
    /// Ring positions per node.
    pub replicas: usize,
    /// Per-lookup timeout in milliseconds.
    pub lookup_timeout_ms: u64,
    /// `"lazy"` (default) or `"eager"`.
    pub connect: ConnectMode,
    /// Key of the bounced set.
    pub bounced_set: String,
    /// Key of the subscribed set.
    pub subscribed_set: String,
    /// Bounced addresses preloaded into the memory backend.
    pub seed_bounced: Vec<String>,
    /// Subscribed addresses preloaded into the memory backend.
    pub seed_subscribed: Vec<String>,
}

impl Default for StoreSection {
    fn default() -> Self {
        let defaults = StoreSettings::default();
        Self {
            backend: StoreBackend::default(),
            nodes: Vec::new(),
            replicas: defaults.replicas,
            lookup_timeout_ms: defaults.lookup_timeout_ms,
            connect: defaults.connect,
            bounced_set: defaults.bounced_set,
            subscribed_set: defaults.subscribed_set,
            seed_bounced: Vec::new(),
            seed_subscribed: Vec::new(),
        }
    }
}

/// `[log]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LogSection {
    /// Log level filter (e.g. `"info"`, `"debug"`, `"warn"`).
    pub level: String,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl CliConfig {
    /// Load config from a TOML file, or use defaults if no path given.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(p) => {
                let content = std::fs::read_to_string(p)?;
                let config: CliConfig = toml::from_str(&content)?;
                Ok(config)
            }
            None => Ok(Self::default()),
        }
    }

    /// Parse config from a TOML string (used in tests).
    #[cfg(test)]
    pub fn from_toml(s: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(s)?)
    }

    /// Replace the node list with a comma-separated one.
    pub fn set_nodes(&mut self, list: &str) {
        self.store.nodes = parse_node_list(list);
    }

    /// Store node ids, in configuration order.
    pub fn node_ids(&self) -> Vec<NodeId> {
        self.store.nodes.iter().map(NodeId::new).collect()
    }

    /// Queue settings for the worker.
    pub fn queue_settings(&self) -> QueueSettings {
        let q = &self.queue;
        QueueSettings {
            url: q.url.clone(),
            queue: q.name.clone(),
            prefetch: q.prefetch.max(1),
            consumer_tag: q.consumer_tag.clone(),
            reconnect_delay_ms: q.reconnect_delay_ms,
            ack_policy: q.ack_policy,
            dead_letter_exchange: q.dead_letter_exchange.clone(),
        }
    }

    /// Store settings for the worker.
    pub fn store_settings(&self) -> StoreSettings {
        let s = &self.store;
        StoreSettings {
            replicas: s.replicas,
            lookup_timeout_ms: s.lookup_timeout_ms,
            connect: s.connect,
            bounced_set: s.bounced_set.clone(),
            subscribed_set: s.subscribed_set.clone(),
        }
    }

    /// Everything the worker is built from.
    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            queue: self.queue_settings(),
            store: self.store_settings(),
            nodes: self.node_ids(),
        }
    }
}

/// Split a comma-separated node list, dropping blanks and surrounding
/// whitespace.
pub fn parse_node_list(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
