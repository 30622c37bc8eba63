use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use bytes::Bytes;
use clap::Parser;
use clap_derive::Parser;
use gbn_transport::config::{NetworkConfig, TransportConfig};
use gbn_transport::link::connect_pair;
use gbn_transport::transport::{Application, TransportState};
use tracing::{info, Level};

#[derive(Parser)]
struct Args {
    /// number of messages to send from A to B
    #[clap(short, long, default_value_t = 50)]
    messages: usize,

    #[clap(long, default_value_t = 4)]
    window_size: u32,

    #[clap(long, default_value_t = 400)]
    timeout_millis: u64,

    #[clap(long, default_value_t = 0.1)]
    drop_chance: f64,
    #[clap(long, default_value_t = 0.1)]
    corrupt_chance: f64,
    #[clap(long, default_value_t = 0.1)]
    delay_chance: f64,
    #[clap(long, default_value_t = 1000)]
    delay_millis: u64,

    /// give up after this many retransmission rounds without progress
    #[clap(long)]
    max_rounds: Option<u32>,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,

    #[clap(long, default_value_t = false)]
    very_verbose: bool,
}

struct CountingApplication {
    name: &'static str,
    count: AtomicUsize,
}

#[async_trait]
impl Application for CountingApplication {
    async fn receive_from_transport(&self, payload: Bytes) {
        let n = self.count.fetch_add(1, Ordering::Relaxed) + 1;
        info!("{} received {:?} ({} so far)", self.name, String::from_utf8_lossy(&payload), n);
    }
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match (args.verbose, args.very_verbose) {
        (_, true) => Level::TRACE,
        (true, _) => Level::DEBUG,
        (false, false) => Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .try_init()
        .ok();

    let transport_config = Arc::new(TransportConfig {
        window_size: args.window_size,
        retransmission_timeout: Duration::from_millis(args.timeout_millis),
        max_retransmission_rounds: args.max_rounds,
        ..TransportConfig::new()
    });
    let network_config = Arc::new(NetworkConfig {
        drop_chance: args.drop_chance,
        corrupt_chance: args.corrupt_chance,
        delay_chance: args.delay_chance,
        delay_amount: Duration::from_millis(args.delay_millis),
        ..NetworkConfig::new()
    });

    let receiver = Arc::new(CountingApplication { name: "B", count: AtomicUsize::new(0) });
    let (a, b) = connect_pair(
        transport_config,
        network_config,
        Arc::new(CountingApplication { name: "A", count: AtomicUsize::new(0) }),
        receiver.clone(),
    )?;

    for i in 0..args.messages {
        let sequence_number = a.transport.submit_waiting(format!("message {}", i)).await?;
        info!("submitted message {} as #{}", i, sequence_number);
    }

    let outcome = a.transport.wait_until_idle().await;

    let stats = a.transport.stats().await;
    info!("sender:   {:?}", stats);
    info!("network:  {:?}", a.network.stats());
    info!("receiver: {:?}", b.transport.stats().await);
    info!("{} payloads handed to the receiving application", receiver.count.load(Ordering::Relaxed));

    match outcome {
        TransportState::Failed => Err(anyhow!("transfer failed after {} timeouts", stats.timeouts)),
        _ => Ok(()),
    }
}
