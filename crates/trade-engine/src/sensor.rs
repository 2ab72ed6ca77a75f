//! Sensor source - periodic measurements fanned out to subscribers
//!
//! One source per product. Every tick draws a uniform value in `[min, max]`
//! and offers it to each attached channel concurrently. With a timeout a slow
//! subscriber misses the tick; it never holds up the others.

use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::{
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};
use thiserror::Error;
use tokio::sync::mpsc;
use trade_types::ProductId;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SensorError {
    #[error("subscriber not attached")]
    NotFound,

    #[error("invalid range: min {min} > max {max}")]
    InvalidRange { min: i64, max: i64 },

    #[error("frequency must be non-zero")]
    ZeroFrequency,
}

/// Sensor source configuration
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SensorConfig {
    /// Product served by this sensor
    pub id: ProductId,
    pub min: i64,
    pub max: i64,
    /// Time between measurements
    pub frequency: Duration,
    /// Per-subscriber delivery timeout; zero waits for every subscriber
    pub timeout: Duration,
}

/// Random measurement generator with a dynamic subscriber set
pub struct SensorSource {
    config: SensorConfig,
    subscribers: RwLock<Vec<mpsc::Sender<i64>>>,
    rng: Mutex<StdRng>,
    running: AtomicBool,
    stopped: AtomicBool,
}

impl SensorSource {
    /// Create a new sensor source
    pub fn new(config: SensorConfig) -> Result<Self, SensorError> {
        if config.min > config.max {
            return Err(SensorError::InvalidRange {
                min: config.min,
                max: config.max,
            });
        }
        if config.frequency.is_zero() {
            return Err(SensorError::ZeroFrequency);
        }

        Ok(Self {
            config,
            subscribers: RwLock::new(Vec::new()),
            rng: Mutex::new(StdRng::from_entropy()),
            running: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> ProductId {
        self.config.id
    }

    pub fn config(&self) -> &SensorConfig {
        &self.config
    }

    /// Start delivering measurements to `subscriber`
    pub fn attach(&self, subscriber: mpsc::Sender<i64>) {
        self.subscribers.write().push(subscriber);
        tracing::debug!(product = %self.config.id, "Subscriber attached");
    }

    /// Stop delivering to the channel `subscriber` belongs to
    pub fn detach(&self, subscriber: &mpsc::Sender<i64>) -> Result<(), SensorError> {
        let mut subscribers = self.subscribers.write();
        let index = subscribers
            .iter()
            .position(|s| s.same_channel(subscriber))
            .ok_or(SensorError::NotFound)?;
        subscribers.swap_remove(index);
        tracing::debug!(product = %self.config.id, "Subscriber detached");
        Ok(())
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Draw one measurement
    pub fn sample(&self) -> i64 {
        self.rng.lock().gen_range(self.config.min..=self.config.max)
    }

    /// Offer `value` to every attached subscriber
    pub async fn notify(&self, value: i64) {
        let subscribers = self.subscribers.read().clone();
        let timeout = (!self.config.timeout.is_zero()).then_some(self.config.timeout);

        let deliveries = subscribers.iter().map(|subscriber| async move {
            let delivered = match timeout {
                Some(timeout) => matches!(
                    tokio::time::timeout(timeout, subscriber.send(value)).await,
                    Ok(Ok(()))
                ),
                None => subscriber.send(value).await.is_ok(),
            };
            if !delivered {
                tracing::trace!(product = %self.config.id, "Subscriber missed measurement");
            }
        });
        join_all(deliveries).await;
    }

    /// Produce measurements until `stop` is called
    ///
    /// Stops at the next tick boundary; a delivery in progress completes first.
    /// A source that was stopped before `run` returns immediately.
    pub async fn run(&self) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        self.running.store(true, Ordering::SeqCst);

        let mut interval = tokio::time::interval(self.config.frequency);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        tracing::info!(
            "Sensor {} started ({}ms ticks, range {}..={})",
            self.config.id,
            self.config.frequency.as_millis(),
            self.config.min,
            self.config.max
        );

        loop {
            interval.tick().await;
            if self.stopped.load(Ordering::SeqCst) {
                break;
            }
            let value = self.sample();
            self.notify(value).await;
        }

        self.running.store(false, Ordering::SeqCst);
        tracing::info!("Sensor {} stopped", self.config.id);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stop the sensor for good
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}
