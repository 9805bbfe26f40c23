use std::time::Duration;

use clap::Parser;
use pvcache::{PvCache, protocol::LoopbackClient};

use tracing::level_filters::LevelFilter;

#[derive(Parser)]
struct Options {
    /// PV names to read
    #[clap(required = true, id = "PV_NAME")]
    names: Vec<String>,
    /// Serve a PV from this process, as NAME=VALUE
    #[clap(long = "serve", value_parser = parse_served)]
    served: Vec<(String, String)>,
    /// Fields to read alongside each PV
    #[clap(long, short)]
    field: Vec<String>,
    /// Seconds to wait for new PVs
    #[clap(long, default_value_t = 2.0)]
    timeout: f64,
    /// Drop every channel after reading
    #[clap(long)]
    polling: bool,
    /// Show debug output
    #[clap(short, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn parse_served(arg: &str) -> Result<(String, String), String> {
    arg.split_once('=')
        .map(|(name, value)| (name.to_owned(), value.to_owned()))
        .ok_or_else(|| format!("Expected NAME=VALUE, got '{arg}'"))
}

fn main() {
    let opts = Options::parse();

    tracing_subscriber::fmt()
        .with_max_level(match opts.verbose {
            0 => LevelFilter::INFO,
            1 => LevelFilter::DEBUG,
            2.. => LevelFilter::TRACE,
        })
        .init();

    let client = LoopbackClient::new();
    for (name, value) in &opts.served {
        let added = match value.parse::<f64>() {
            Ok(number) => client.add_pv(name, number),
            Err(_) => client.add_pv(name, value.as_str()),
        };
        if added.is_err() {
            eprintln!("PV {name} given twice");
            std::process::exit(1);
        }
    }

    let cache = PvCache::builder()
        .polling(opts.polling)
        .start(client)
        .unwrap();
    let result = match cache.read_with_fields(
        &opts.names,
        &opts.field,
        Duration::from_secs_f64(opts.timeout),
    ) {
        Ok(result) => result,
        Err(e) => {
            eprintln!("Read failed: {e}");
            std::process::exit(1);
        }
    };

    for snapshot in &result.snapshots {
        if snapshot.has_value {
            println!(
                "{} {} {} {} {}",
                snapshot.name,
                snapshot.timestamp_text,
                snapshot.strings.join(" "),
                snapshot.status_text,
                snapshot.severity_text,
            );
        } else {
            println!("{} *** {}", snapshot.name, snapshot.error.message);
        }
        for (field, value) in snapshot.field_names.iter().zip(&snapshot.field_values) {
            println!("    .{field} {value}");
        }
    }
}
