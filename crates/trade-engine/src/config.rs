//! Coordinator configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;
use trade_types::{BrokerSearchQuery, ProductSearchQuery, TradeWindow};

/// How far ahead a requested window starts and how long it lasts
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub lead_time_secs: u64,
    pub duration_secs: u64,
}

impl WindowConfig {
    /// Window starting `lead_time_secs` from now
    pub fn next_window(&self) -> TradeWindow {
        TradeWindow::starting_in(
            Duration::from_secs(self.lead_time_secs),
            Duration::from_secs(self.duration_secs),
        )
    }
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            lead_time_secs: 30,
            duration_secs: 60,
        }
    }
}

/// Consumer coordinator configuration
#[derive(Clone, Debug)]
pub struct ConsumerConfig {
    pub broker_query: BrokerSearchQuery,
    pub product_query: ProductSearchQuery,
    pub window: WindowConfig,
    /// Deposit once accepted; `None` deposits the trade cost
    pub deposit: Option<u64>,
    /// Pause after a failed pull
    pub pull_retry: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            broker_query: BrokerSearchQuery::default(),
            product_query: ProductSearchQuery::default(),
            window: WindowConfig::default(),
            deposit: None,
            pull_retry: Duration::from_millis(100),
        }
    }
}

/// Producer coordinator configuration
#[derive(Clone, Debug, Default)]
pub struct ProducerConfig {
    /// Give up on a trade whose deposit does not arrive in time; `None` waits
    pub deposit_timeout: Option<Duration>,
}
