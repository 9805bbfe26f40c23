use std::time::Duration;

use clap::Parser;
use pvcache::{PvCache, SubscriberRecvError, protocol::LoopbackClient};

use tracing::{info, level_filters::LevelFilter, warn};
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt};

#[derive(Parser)]
struct Options {
    /// PV name to monitor
    #[clap(required = true, id = "PV_NAME")]
    name: String,
    /// Milliseconds between changes to the served value
    #[clap(long, default_value_t = 500)]
    period: u64,
    /// Stop after this many updates
    #[clap(long)]
    count: Option<usize>,
    /// Show debug output
    #[clap(short, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main(flavor = "multi_thread", worker_threads = 1)]
async fn main() {
    // Make sure panics from threads cause the whole process to terminate
    let default_panic = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        default_panic(info);
        std::process::exit(1);
    }));
    let opts = Options::parse();

    let filter = EnvFilter::default()
        .add_directive(
            match opts.verbose {
                0 => LevelFilter::INFO,
                1 => LevelFilter::DEBUG,
                2.. => LevelFilter::TRACE,
            }
            .into(),
        )
        .add_directive("tokio=off".parse().unwrap());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_level(true)
        .with_filter(filter);
    let subscriber = tracing_subscriber::registry().with(fmt_layer);
    tracing::subscriber::set_global_default(subscriber).expect("Failed to set global subscriber");

    // Serve a counter under the monitored name
    let client = LoopbackClient::new();
    let pv = client.add_pv(&opts.name, 0.0f64).unwrap();
    let period = Duration::from_millis(opts.period);
    tokio::spawn(async move {
        let mut counter = 0.0;
        loop {
            tokio::time::sleep(period).await;
            counter += 1.0;
            if let Err(e) = pv.store(counter) {
                warn!("Could not update {}: {e}", pv.name());
            }
        }
    });

    let cache = PvCache::builder().polling(false).start(client).unwrap();
    let mut monitor = cache.subscribe(&opts.name).unwrap();
    let mut seen = 0;
    loop {
        match monitor.recv().await {
            Ok(snapshot) if snapshot.has_value => {
                println!(
                    "{} {} {} {}",
                    snapshot.name,
                    snapshot.timestamp_text,
                    snapshot.strings.join(" "),
                    snapshot.severity_text
                );
                seen += 1;
                if opts.count.is_some_and(|count| seen >= count) {
                    break;
                }
            }
            Ok(snapshot) => println!("{} *** {}", snapshot.name, snapshot.error.message),
            Err(SubscriberRecvError::Lagged(n)) => warn!("Missed {n} updates"),
            Err(SubscriberRecvError::Closed) => break,
        }
    }
    drop(monitor);
    cache.shutdown();
    info!("Disconnected.");
}
