//! Adaptive strategy - main entry point
//!
//! This binary provides three subcommands:
//! - backtest: Run the strategy over a CSV bar file
//! - optimize: Grid-search strategy parameters
//! - live: Paper-replay a CSV through the live trader

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod commands;

#[derive(Parser, Debug)]
#[command(name = "adaptive-strategy")]
#[command(about = "Adaptive multi-regime strategy with backtesting, optimization, and a live adapter", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run strategy backtest
    Backtest {
        /// Path to configuration file
        #[arg(short, long, default_value = "configs/default.json")]
        config: String,

        /// Bar CSV (overrides config file)
        #[arg(short, long)]
        data: Option<String>,

        /// Directory for equity_curve.csv and trades.csv (overrides config file)
        #[arg(short, long)]
        output: Option<String>,

        /// Initial balance
        #[arg(long)]
        balance: Option<f64>,

        /// Start date (YYYY-MM-DD)
        #[arg(long)]
        start: Option<String>,

        /// End date (YYYY-MM-DD)
        #[arg(long)]
        end: Option<String>,
    },

    /// Optimize strategy parameters over the config's grid
    Optimize {
        /// Path to configuration file with a `grid` section
        #[arg(short, long, default_value = "configs/default.json")]
        config: String,

        /// Bar CSV (overrides config file)
        #[arg(short, long)]
        data: Option<String>,

        /// Sort results by metric (sharpe, sortino, calmar, return, win_rate, profit_factor, expectancy)
        #[arg(long, default_value = "sharpe")]
        sort_by: String,

        /// Number of top results to show
        #[arg(short, long, default_value = "10")]
        top: usize,

        /// Run sequentially instead of parallel
        #[arg(long)]
        sequential: bool,
    },

    /// Replay a bar CSV through the live trader with a paper broker
    Live {
        /// Path to configuration file
        #[arg(short, long, default_value = "configs/default.json")]
        config: String,

        /// Bar CSV to replay (overrides config file)
        #[arg(short, long)]
        data: Option<String>,

        /// Trade database path
        #[arg(long, default_value = "state.db")]
        state_db: String,
    },
}

fn setup_logging(verbose: bool, command_name: &str, file_only: bool) -> Result<()> {
    std::fs::create_dir_all("logs")?;

    let log_filename = format!(
        "{}_{}.log",
        command_name,
        chrono::Local::now().format("%Y-%m-%d_%H-%M-%S")
    );
    let log_path = PathBuf::from("logs").join(&log_filename);

    let level = if verbose { "debug" } else { "info" };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let file_appender = tracing_appender::rolling::never("logs", &log_filename);
    fn make_file_layer<S>(
        file_appender: tracing_appender::rolling::RollingFileAppender,
    ) -> impl tracing_subscriber::Layer<S> + Send + Sync + 'static
    where
        S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
    {
        tracing_subscriber::fmt::layer()
            .with_writer(file_appender)
            .with_target(true)
            .with_line_number(true)
            .with_file(true)
            .with_ansi(false)
    }

    if file_only {
        // Console stays clean for the progress bar
        tracing_subscriber::registry()
            .with(env_filter)
            .with(make_file_layer(file_appender))
            .init();
    } else {
        let console_layer = tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_thread_ids(false)
            .with_thread_names(false)
            .with_line_number(true)
            .with_file(true)
            .with_ansi(true);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .with(make_file_layer(file_appender))
            .init();

        info!("Logging initialized");
        info!("Log file: {}", log_path.display());
    }

    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let (command_name, file_only) = match &cli.command {
        Commands::Backtest { .. } => ("backtest", false),
        Commands::Optimize { .. } => ("optimize", true),
        Commands::Live { .. } => ("live", false),
    };

    setup_logging(cli.verbose, command_name, file_only)?;

    match cli.command {
        Commands::Backtest {
            config,
            data,
            output,
            balance,
            start,
            end,
        } => commands::backtest::run(config, data, output, balance, start, end),

        Commands::Optimize {
            config,
            data,
            sort_by,
            top,
            sequential,
        } => commands::optimize::run(config, data, sort_by, top, sequential),

        Commands::Live {
            config,
            data,
            state_db,
        } => commands::live::run(config, data, state_db),
    }
}
