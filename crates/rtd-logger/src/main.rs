// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! RTD Logger CLI
//!
//! Samples an RTD temperature from an S7 controller and appends it to
//! Amazon Timestream.
//!
//! # Usage
//!
//! ```bash
//! # Defaults, overridden from the environment
//! PLC_IP=10.0.0.5 DATABASE_NAME=Plant TABLE_NAME=Line1 rtd-logger
//!
//! # Using configuration file
//! rtd-logger --config rtd-logger.toml
//!
//! # Bench run without cloud credentials
//! rtd-logger --address 127.0.0.1 --sink stdout --interval 1
//!
//! # Generate / check a configuration file
//! rtd-logger gen-config --output rtd-logger.toml
//! rtd-logger validate --config rtd-logger.toml
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use rtd_logger::config::SinkKind;
use rtd_logger::shutdown::spawn_signal_listener;
use rtd_logger::{
    ConfigOverrides, Driver, DriverSettings, LoggerConfig, Publisher, S7Client, Sampler,
    SinkBackend, StopHandle,
};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "rtd-logger")]
#[command(author = "naskel.com")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Log an RTD temperature from an S7 controller to Amazon Timestream")]
struct Cli {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Controller address (IPv4 or hostname)
    #[arg(long, env = "PLC_IP")]
    address: Option<String>,

    /// Controller ISO-on-TCP port
    #[arg(long, env = "PLC_PORT")]
    port: Option<u16>,

    /// Controller rack
    #[arg(long, env = "PLC_RACK")]
    rack: Option<u16>,

    /// Controller slot
    #[arg(long, env = "PLC_SLOT")]
    slot: Option<u16>,

    /// Data block holding the temperature REAL
    #[arg(long)]
    db_number: Option<u16>,

    /// Byte offset of the REAL inside the data block
    #[arg(long)]
    offset: Option<u32>,

    /// Initial connect attempts before giving up
    #[arg(long)]
    connect_attempts: Option<u32>,

    /// Sink receiving the records
    #[arg(long, value_enum)]
    sink: Option<SinkArg>,

    /// AWS region of the Timestream database
    #[arg(long, env = "AWS_REGION")]
    region: Option<String>,

    /// Timestream database name
    #[arg(long, env = "DATABASE_NAME")]
    database: Option<String>,

    /// Timestream table name
    #[arg(long, env = "TABLE_NAME")]
    table: Option<String>,

    /// `sensor_type` dimension value
    #[arg(long)]
    sensor_type: Option<String>,

    /// `location` dimension value
    #[arg(long)]
    location: Option<String>,

    /// Seconds between samples
    #[arg(short, long, env = "LOGGING_INTERVAL")]
    interval: Option<u64>,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate example configuration file
    GenConfig {
        /// Output file path
        #[arg(short, long, default_value = "rtd-logger.toml")]
        output: PathBuf,
    },

    /// Validate a configuration file
    Validate {
        /// Configuration file path
        #[arg(short, long)]
        config: PathBuf,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum SinkArg {
    Timestream,
    Stdout,
}

impl From<SinkArg> for SinkKind {
    fn from(arg: SinkArg) -> Self {
        match arg {
            SinkArg::Timestream => SinkKind::Timestream,
            SinkArg::Stdout => SinkKind::Stdout,
        }
    }
}

impl Cli {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            address: self.address.clone(),
            port: self.port,
            rack: self.rack,
            slot: self.slot,
            db_number: self.db_number,
            offset: self.offset,
            connect_attempts: self.connect_attempts,
            sink_kind: self.sink.map(SinkKind::from),
            region: self.region.clone(),
            database: self.database.clone(),
            table: self.table.clone(),
            sensor_type: self.sensor_type.clone(),
            location: self.location.clone(),
            interval_secs: self.interval,
            log_level: self.log_level.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Some(cmd) = cli.command {
        let result = match cmd {
            Commands::GenConfig { output } => cmd_gen_config(output),
            Commands::Validate { config } => cmd_validate(config),
        };
        return match result {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                eprintln!("Error: {e:#}");
                ExitCode::FAILURE
            }
        };
    }

    let config = match LoggerConfig::load(cli.config.as_deref(), cli.overrides()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Configuration invalid: {e}");
            return ExitCode::from(2);
        }
    };

    init_tracing(&config.log_level);

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "RTD logger exited with an error");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(config: LoggerConfig) -> Result<()> {
    tracing::info!(
        address = %config.controller.address,
        rack = config.controller.rack,
        slot = config.controller.slot,
        db = config.controller.db_number,
        database = %config.sink.database,
        table = %config.sink.table,
        interval_secs = config.interval_secs,
        "Starting RTD logger v{}",
        env!("CARGO_PKG_VERSION")
    );

    let stop = StopHandle::new();
    let signals = spawn_signal_listener(stop.clone());

    // The controller connects first inside the driver; the sink stays lazy.
    let sampler = Sampler::from_config(S7Client::new(), &config);
    let sink = SinkBackend::from_config(&config.sink).await;
    tracing::info!(sink = sink.name(), "Sink configured");

    let publisher = Publisher::new(sink, config.destination());
    let mut driver = Driver::new(
        sampler,
        publisher,
        DriverSettings::from_config(&config),
        stop,
    );

    let outcome = driver.run().await;
    signals.abort();
    outcome.context("Sampling could not start")?;
    Ok(())
}

fn cmd_gen_config(output: PathBuf) -> Result<()> {
    let toml_str =
        toml::to_string_pretty(&LoggerConfig::default()).context("Failed to render config")?;

    let content = format!(
        r#"# RTD Logger Configuration
# Generated by rtd-logger gen-config
#
# Environment variables (PLC_IP, PLC_PORT, PLC_RACK, PLC_SLOT, AWS_REGION,
# DATABASE_NAME, TABLE_NAME, LOGGING_INTERVAL) and flags override this file.
# sink.kind: "timestream" or "stdout"

{}
"#,
        toml_str
    );

    std::fs::write(&output, content)
        .with_context(|| format!("Failed to write {}", output.display()))?;
    println!("Generated configuration file: {}", output.display());
    Ok(())
}

fn cmd_validate(config_path: PathBuf) -> Result<()> {
    let config = LoggerConfig::from_file(&config_path)
        .with_context(|| format!("Configuration invalid: {}", config_path.display()))?;

    println!("Configuration valid!");
    println!();
    println!(
        "Controller: {}:{} rack {} slot {} (DB{}.DBD{})",
        config.controller.address,
        config.controller.port,
        config.controller.rack,
        config.controller.slot,
        config.controller.db_number,
        config.controller.offset
    );
    println!(
        "Sink:       {:?} {}/{} ({})",
        config.sink.kind, config.sink.database, config.sink.table, config.sink.region
    );
    println!("Interval:   {}s", config.interval_secs);
    Ok(())
}
