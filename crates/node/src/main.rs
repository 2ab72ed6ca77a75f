//! Trade Node
//!
//! Entry point for running a message relay, or a complete trade session in
//! one process (in-memory ledger, relay over WebSocket, producer, consumer and
//! dispute reconciler).

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use ledger_gateway::{InMemoryLedger, Keystore, LedgerGateway, SettlementStatus};
use serde::Serialize;
use std::{path::PathBuf, sync::Arc, time::Duration};
use tokio::net::TcpListener;
use trade_engine::{
    generate_keypair, ConsumerCoordinator, EncryptedTransport, ProducerCoordinator, SensorSource,
};
use trade_relay::{DisputeReconciler, MessageRelay, RelayServer, WsTransport};
use trade_types::{Address, Broker, CallContext, Device, Product, ProductId};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod config;

use config::NodeConfig;

/// How long the devnet waits for the ledger to settle after the consumer is done
const SETTLEMENT_WAIT: Duration = Duration::from_secs(30);

/// Node mode
#[derive(Debug, Clone, Copy, ValueEnum)]
enum Mode {
    /// Relay mode - serve per-trade message queues over WebSocket; disputes
    /// are not reconciled in this mode (use devnet for settlement)
    Relay,
    /// Devnet mode - run one complete trade session in this process
    Devnet,
}

/// Trade session node
#[derive(Parser, Debug)]
#[command(name = "trade-node")]
#[command(about = "Encrypted data-trade relay and session runner", long_about = None)]
struct Args {
    /// Node mode (relay or devnet)
    #[arg(long, value_enum, default_value = "devnet")]
    mode: Mode,

    /// Configuration file (TOML)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Relay WebSocket bind address
    #[arg(long)]
    listen_addr: Option<String>,

    /// Seconds until a requested window starts
    #[arg(long)]
    lead_secs: Option<u64>,

    /// Length of a requested window in seconds
    #[arg(long)]
    duration_secs: Option<u64>,

    /// Print the devnet result as JSON
    #[arg(long)]
    json: bool,
}

impl Args {
    /// Load the config file (or defaults) and apply command line overrides
    fn node_config(&self) -> Result<NodeConfig> {
        let mut config = match &self.config {
            Some(path) => NodeConfig::load(path)?,
            None => NodeConfig::default(),
        };
        if let Some(level) = &self.log_level {
            config.logging.level = level.clone();
        }
        if let Some(addr) = &self.listen_addr {
            config.relay.listen_addr = addr.clone();
        }
        if let Some(lead) = self.lead_secs {
            config.window.lead_time_secs = lead;
        }
        if let Some(duration) = self.duration_secs {
            config.window.duration_secs = duration;
        }
        Ok(config)
    }
}

/// Devnet result
#[derive(Debug, Serialize)]
struct SessionReport {
    trade_id: u64,
    settlement: String,
    delivered: u64,
    settled_counter: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = args.node_config()?;

    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    match args.mode {
        Mode::Relay => run_relay(config).await,
        Mode::Devnet => run_devnet(config, args.json).await,
    }
}

/// Run in relay mode - serve queues until interrupted
async fn run_relay(config: NodeConfig) -> Result<()> {
    tracing::info!("Starting trade relay");
    tracing::warn!("Relay mode has no ledger; disputes are not reconciled");
    tracing::info!("  Listen address: {}", config.relay.listen_addr);
    tracing::info!("  Queue capacity: {}", config.relay.queue_capacity);

    let relay = Arc::new(MessageRelay::new(config.relay.queue_capacity));
    let cx = CallContext::new();
    let server = RelayServer::new(relay.clone());
    let mut server_task = {
        let addr = config.relay.listen_addr.clone();
        let cx = cx.clone();
        tokio::spawn(async move { server.run(&addr, cx).await })
    };

    tokio::select! {
        result = &mut server_task => return Ok(result??),
        signal = tokio::signal::ctrl_c() => signal?,
    }
    tracing::info!("Shutting down ({} active trades)", relay.active_trades());
    cx.cancel();
    server_task.await??;
    Ok(())
}

/// Run in devnet mode - one full trade session against an in-memory ledger
async fn run_devnet(config: NodeConfig, json: bool) -> Result<()> {
    tracing::info!("Starting trade devnet");
    tracing::info!(
        "  Window: starts in {}s, lasts {}s",
        config.window.lead_time_secs,
        config.window.duration_secs
    );

    let cx = CallContext::new();
    let ledger = Arc::new(InMemoryLedger::new());
    let relay = Arc::new(MessageRelay::new(config.relay.queue_capacity));

    // Relay server
    let listener = TcpListener::bind(&config.relay.listen_addr)
        .await
        .with_context(|| format!("binding relay on {}", config.relay.listen_addr))?;
    let endpoint = listener.local_addr()?.to_string();
    tokio::spawn(RelayServer::new(relay.clone()).serve(listener, cx.child()));

    let broker = Address::new(config.relay.account.as_str());
    ledger.register_broker(Broker {
        address: broker.clone(),
        name: config.relay.name.clone(),
        endpoint: endpoint.clone(),
        location: config.relay.location,
    });

    // Devices and products
    let (producer_key, producer_public) = generate_keypair();
    let (consumer_key, consumer_public) = generate_keypair();
    let producer_account = Address::new(config.producer.account.as_str());
    let consumer_account = Address::new(config.consumer.account.as_str());
    ledger.register_device(Device {
        address: producer_account.clone(),
        name: "producer".to_string(),
        public_key: producer_public.to_sec1_bytes(),
    });
    ledger.register_device(Device {
        address: consumer_account.clone(),
        name: "consumer".to_string(),
        public_key: consumer_public.to_sec1_bytes(),
    });

    let mut sensors = Vec::new();
    for section in &config.sensors {
        ledger.register_product(Product {
            id: ProductId(section.id),
            device: producer_account.clone(),
            name: section.name.clone(),
            description: format!("{} sensor {}", section.data_type, section.id),
            data_type: section.data_type.clone(),
            frequency: section.per_minute(),
            cost: section.cost,
        })?;
        let sensor = Arc::new(SensorSource::new(section.sensor_config())?);
        let runner = sensor.clone();
        tokio::spawn(async move { runner.run().await });
        sensors.push(sensor);
    }

    let transport = Arc::new(WsTransport::new());

    // Dispute reconciler
    let reconciler = DisputeReconciler::new(
        ledger.clone(),
        relay.clone(),
        Arc::new(Keystore::new(broker, &config.relay.passphrase)),
        config.relay.passphrase.as_str(),
    );
    let created = reconciler.subscribe().await?;
    {
        let cx = cx.child();
        tokio::spawn(async move {
            if let Err(e) = reconciler.serve(&cx, created).await {
                tracing::warn!("Dispute reconciler stopped: {}", e);
            }
        });
    }

    // Producer
    let producer = ProducerCoordinator::new(
        ledger.clone(),
        EncryptedTransport::new(transport.clone(), Arc::new(producer_key)),
        Arc::new(Keystore::new(producer_account, &config.producer.passphrase)),
        &config.producer.passphrase,
        sensors.clone(),
        config.producer_config(),
    );
    let requests = producer.subscribe().await?;
    {
        let cx = cx.child();
        tokio::spawn(async move {
            if let Err(e) = producer.serve(&cx, requests).await {
                tracing::warn!("Producer stopped: {}", e);
            }
        });
    }

    // Consumer
    let consumer = ConsumerCoordinator::new(
        ledger.clone(),
        EncryptedTransport::new(transport, Arc::new(consumer_key)),
        Arc::new(Keystore::new(consumer_account, &config.consumer.passphrase)),
        config.consumer.passphrase.as_str(),
        config.consumer_config(),
    );

    let outcome = tokio::select! {
        outcome = consumer.run(&cx) => outcome?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted");
            cx.cancel();
            return Ok(());
        }
    };

    let trade = ledger.find_trade(outcome.trade_id).await?;
    let mut settled = ledger.watch_settled(&trade.settlement).await?;
    let settled_counter = match ledger.settlement(&trade.settlement).map(|s| s.status) {
        Some(SettlementStatus::Settled { counter }) => Some(counter),
        _ => settled
            .next_in(&cx.with_timeout(SETTLEMENT_WAIT))
            .await
            .map(|event| event.counter)
            .ok(),
    };

    for sensor in &sensors {
        sensor.stop();
    }
    cx.cancel();

    let report = SessionReport {
        trade_id: outcome.trade_id.0,
        settlement: trade.settlement.to_string(),
        delivered: outcome.delivered,
        settled_counter,
    };
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        match report.settled_counter {
            Some(counter) => tracing::info!(
                trade_id = %outcome.trade_id,
                "Trade settled: {} received, {} paid",
                report.delivered,
                counter
            ),
            None => tracing::warn!(trade_id = %outcome.trade_id, "Trade not settled in time"),
        }
    }

    Ok(())
}
