//! Node configuration
//!
//! Loaded from a TOML file; every section and field has a default, so an
//! empty file is a valid configuration.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{path::Path, time::Duration};
use trade_engine::{ConsumerConfig, ProducerConfig, SensorConfig, WindowConfig};
use trade_types::{BrokerSearchQuery, Location, ProductId, ProductSearchQuery, DEFAULT_QUEUE_CAPACITY};

/// Node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub relay: RelaySection,
    pub sensors: Vec<SensorSection>,
    pub window: WindowConfig,
    pub search: SearchSection,
    pub consumer: ConsumerSection,
    pub producer: ProducerSection,
    pub logging: LoggingSection,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            relay: RelaySection::default(),
            sensors: vec![SensorSection::default()],
            window: WindowConfig::default(),
            search: SearchSection::default(),
            consumer: ConsumerSection::default(),
            producer: ProducerSection::default(),
            logging: LoggingSection::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelaySection {
    /// WebSocket bind address
    pub listen_addr: String,
    pub queue_capacity: usize,
    pub name: String,
    pub location: Location,
    /// Broker account on the ledger
    pub account: String,
    pub passphrase: String,
}

impl Default for RelaySection {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:9400".to_string(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            name: "relay-1".to_string(),
            location: Location::Euw,
            account: "broker".to_string(),
            passphrase: "broker".to_string(),
        }
    }
}

/// One sensor and the product it backs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorSection {
    pub id: u64,
    pub name: String,
    pub data_type: String,
    pub cost: u64,
    pub min: i64,
    pub max: i64,
    pub frequency_ms: u64,
    /// 0 waits for every subscriber
    pub timeout_ms: u64,
}

impl Default for SensorSection {
    fn default() -> Self {
        Self {
            id: 1,
            name: "temperature".to_string(),
            data_type: "temperature".to_string(),
            cost: 10,
            min: -20,
            max: 40,
            frequency_ms: 1000,
            timeout_ms: 500,
        }
    }
}

impl SensorSection {
    pub fn sensor_config(&self) -> SensorConfig {
        SensorConfig {
            id: ProductId(self.id),
            min: self.min,
            max: self.max,
            frequency: Duration::from_millis(self.frequency_ms),
            timeout: Duration::from_millis(self.timeout_ms),
        }
    }

    /// Measurements per minute
    pub fn per_minute(&self) -> u64 {
        60_000 / self.frequency_ms.max(1)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchSection {
    /// Empty matches brokers anywhere
    pub broker_locations: Vec<Location>,
    #[serde(flatten)]
    pub product: ProductSearchQuery,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerSection {
    pub account: String,
    pub passphrase: String,
    /// Defaults to the trade cost
    pub deposit: Option<u64>,
    pub pull_retry_ms: u64,
}

impl Default for ConsumerSection {
    fn default() -> Self {
        Self {
            account: "consumer".to_string(),
            passphrase: "consumer".to_string(),
            deposit: None,
            pull_retry_ms: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProducerSection {
    pub account: String,
    pub passphrase: String,
    /// Unset waits for the deposit indefinitely
    pub deposit_timeout_ms: Option<u64>,
}

impl Default for ProducerSection {
    fn default() -> Self {
        Self {
            account: "producer".to_string(),
            passphrase: "producer".to_string(),
            deposit_timeout_ms: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    pub level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl NodeConfig {
    /// Load a configuration file
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("parsing config {}", path.display()))
    }

    pub fn consumer_config(&self) -> ConsumerConfig {
        ConsumerConfig {
            broker_query: BrokerSearchQuery {
                locations: self.search.broker_locations.clone(),
            },
            product_query: self.search.product.clone(),
            window: self.window,
            deposit: self.consumer.deposit,
            pull_retry: Duration::from_millis(self.consumer.pull_retry_ms),
        }
    }

    pub fn producer_config(&self) -> ProducerConfig {
        ProducerConfig {
            deposit_timeout: self.producer.deposit_timeout_ms.map(Duration::from_millis),
        }
    }
}
