use anyhow::{ensure, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::workload::load::LoadParams;
use crate::workload::BenchmarkParams;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "charglt",
    version,
    about = "Charging workload generator for a document store"
)]
pub struct Cli {
    #[arg(long, global = true, help = "YAML file overriding the store defaults")]
    pub config: Option<PathBuf>,

    #[arg(
        long,
        global = true,
        env = "EXTRA_MS",
        default_value = "0",
        help = "Extra milliseconds to sleep whenever the per-ms budget is spent"
    )]
    pub extra_ms: u64,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    #[command(name = "load", about = "Create users 0..userCount")]
    Load(LoadArgs),

    #[command(name = "delete", about = "Delete users 0..userCount")]
    Delete(DeleteArgs),

    #[command(name = "kv", about = "Lock and rewrite user payloads")]
    Kv(RunArgs),

    #[command(name = "transactions", about = "Report usage and add credit")]
    Transactions(RunArgs),
}

impl Command {
    pub fn hosts(&self) -> &str {
        match self {
            Command::Load(args) => &args.hosts,
            Command::Delete(args) => &args.hosts,
            Command::Kv(args) | Command::Transactions(args) => &args.hosts,
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            Command::Load(args) => args.validate(),
            Command::Delete(args) => args.validate(),
            Command::Kv(args) | Command::Transactions(args) => args.validate(),
        }
    }
}

fn validate_common(user_count: usize, tp_ms: u64) -> Result<()> {
    ensure!(user_count > 0, "userCount must be greater than 0");
    ensure!(tp_ms > 0, "tpMs must be greater than 0");
    Ok(())
}

#[derive(Args, Debug, Clone)]
pub struct LoadArgs {
    #[arg(help = "Comma separated hosts, a mongodb:// URI, local or local:<dir>")]
    pub hosts: String,

    #[arg(help = "Number of users")]
    pub user_count: usize,

    #[arg(help = "Operations per millisecond")]
    pub tp_ms: u64,

    #[arg(help = "Initial credit is drawn from 0..maxInitialCredit")]
    pub max_initial_credit: i64,
}

impl LoadArgs {
    pub fn validate(&self) -> Result<()> {
        validate_common(self.user_count, self.tp_ms)?;
        ensure!(
            self.max_initial_credit > 0,
            "maxInitialCredit must be greater than 0"
        );
        Ok(())
    }

    pub fn params(&self, extra_ms: u64) -> LoadParams {
        LoadParams {
            user_count: self.user_count,
            tp_ms: self.tp_ms,
            max_initial_credit: self.max_initial_credit,
            extra_ms,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct DeleteArgs {
    #[arg(help = "Comma separated hosts, a mongodb:// URI, local or local:<dir>")]
    pub hosts: String,

    #[arg(help = "Number of users")]
    pub user_count: usize,

    #[arg(help = "Operations per millisecond")]
    pub tp_ms: u64,
}

impl DeleteArgs {
    pub fn validate(&self) -> Result<()> {
        validate_common(self.user_count, self.tp_ms)
    }
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    #[arg(help = "Comma separated hosts, a mongodb:// URI, local or local:<dir>")]
    pub hosts: String,

    #[arg(help = "Number of users")]
    pub user_count: usize,

    #[arg(help = "Operations per millisecond")]
    pub tp_ms: u64,

    #[arg(help = "How long to run")]
    pub duration_seconds: u64,

    #[arg(help = "Seconds between queries of a well-known user, 0 to disable")]
    pub query_freq_seconds: u64,
}

impl RunArgs {
    pub fn validate(&self) -> Result<()> {
        validate_common(self.user_count, self.tp_ms)?;
        ensure!(
            self.duration_seconds > 0,
            "durationSeconds must be greater than 0"
        );
        Ok(())
    }

    pub fn params(&self, extra_ms: u64) -> BenchmarkParams {
        BenchmarkParams {
            user_count: self.user_count,
            tp_ms: self.tp_ms,
            duration_seconds: self.duration_seconds,
            query_freq_seconds: self.query_freq_seconds,
            extra_ms,
        }
    }
}
