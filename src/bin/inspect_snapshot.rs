//! Loads a persisted candle snapshot directory and prints a freshness
//! report per (exchange, symbol, timeframe). A small standalone tool
//! built against the same library crate as the server, for operators
//! inspecting on-disk state without spinning up the server.

use clap::Parser;
use momentum_aggregator::diagnostics::verify_data_spacing;
use momentum_aggregator::model::ExchangeKind;
use momentum_aggregator::persistence::snapshot::CandleSnapshotStore;
use momentum_aggregator::store::CandleStore;

#[derive(Parser, Debug)]
#[command(about = "Inspect a persisted candle snapshot directory")]
struct Args {
    /// Directory containing the `snapshots/` subdirectory (same as
    /// `DATA_DIR` the server was run with).
    #[arg(long, default_value = "./data")]
    data_dir: String,

    /// Only report on this exchange; omit to report on all six.
    #[arg(long)]
    exchange: Option<String>,
}

fn parse_exchange(tag: &str) -> Option<ExchangeKind> {
    ExchangeKind::ALL.into_iter().find(|e| e.tag().eq_ignore_ascii_case(tag))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();
    let args = Args::parse();

    let store = CandleStore::new();
    let snapshot_store = CandleSnapshotStore::new(&args.data_dir);

    let exchanges: Vec<ExchangeKind> = match &args.exchange {
        Some(tag) => match parse_exchange(tag) {
            Some(kind) => vec![kind],
            None => {
                eprintln!("unknown exchange tag: {tag}");
                std::process::exit(1);
            }
        },
        None => ExchangeKind::ALL.to_vec(),
    };

    for exchange in &exchanges {
        match snapshot_store.load(&store, *exchange).await {
            Ok(n) => println!("{exchange}: restored {n} series"),
            Err(e) => println!("{exchange}: failed to load snapshot: {e}"),
        }
    }

    let now = chrono::Utc::now().timestamp_millis();
    for exchange in &exchanges {
        for key in store.all_keys() {
            if key.exchange != *exchange {
                continue;
            }
            let view = store.view(&key);
            let freshness = store.freshness(&key, now);
            let spacing = verify_data_spacing(&view, key.tf);
            println!(
                "{} {} {}m: {} candles, freshness={:?}, spacing_issues={}",
                key.exchange,
                key.symbol,
                key.tf.minutes(),
                view.len(),
                freshness.state,
                spacing.issues.len()
            );
        }
    }

    Ok(())
}
