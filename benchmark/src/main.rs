use anyhow::{Context, Result};
use benchmark::config::{Cli, Command};
use benchmark::metrics::LatencyRegistry;
use benchmark::ops::ChargingOps;
use benchmark::workload::{delete, kv, load, transactional};
use clap::error::ErrorKind;
use clap::Parser;
use common::{init_tracing, set_default_rust_log};
use std::process;
use std::sync::Arc;
use store::config::StoreConfig;
use tracing::{error, info};

const USAGE: &str = "Usage: charglt [--config <yaml>] \
    load hosts userCount tpMs maxInitialCredit | \
    delete hosts userCount tpMs | \
    kv hosts userCount tpMs durationSeconds queryFreqSeconds | \
    transactions hosts userCount tpMs durationSeconds queryFreqSeconds";

#[tokio::main(flavor = "current_thread")]
async fn main() {
    set_default_rust_log("info");
    init_tracing();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            e.exit()
        }
        Err(e) => {
            error!("{}", e);
            info!("{}", USAGE);
            process::exit(1);
        }
    };

    if let Err(e) = cli.command.validate() {
        error!("{:#}", e);
        info!("{}", USAGE);
        process::exit(1);
    }

    match run(cli).await {
        Ok(code) => process::exit(code),
        Err(e) => {
            error!("{:#}", e);
            process::exit(1);
        }
    }
}

async fn run(cli: Cli) -> Result<i32> {
    info!("Parameters: {:?}", cli);

    let mut config = match &cli.config {
        Some(path) => StoreConfig::from_yaml_file(path)?,
        None => StoreConfig::default(),
    };
    config.override_hosts(cli.command.hosts())?;

    let store = store::connect(&config)
        .await
        .context("Failed to connect to the store")?;
    let registry = Arc::new(LatencyRegistry::new());
    let ops = Arc::new(
        ChargingOps::new(store.clone(), registry, config.collection.clone())
            .with_txn_options(config.txn_options()),
    );

    let outcome = match &cli.command {
        Command::Load(args) => load::run(ops, args.params(cli.extra_ms)).await.map(|_| 0),
        Command::Delete(args) => delete::run(ops, args.user_count, args.tp_ms, cli.extra_ms)
            .await
            .map(|_| 0),
        Command::Kv(args) => kv::run(ops, args.params(cli.extra_ms))
            .await
            .map(|summary| exit_code(summary.meets_target())),
        Command::Transactions(args) => transactional::run(ops, args.params(cli.extra_ms))
            .await
            .map(|summary| exit_code(summary.meets_target())),
    };

    store.close().await?;
    outcome
}

fn exit_code(met_target: bool) -> i32 {
    if met_target {
        0
    } else {
        error!("UNABLE_TO_MEET_REQUESTED_TPS");
        1
    }
}
