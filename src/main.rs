//! CLI Entry Point for tlu-daq
//!
//! Provides command-line interface for:
//! - Validating a configuration and showing the register values it compiles to
//! - Running a complete acquisition against the simulated board
//!
//! # Usage
//!
//! Check a configuration:
//! ```bash
//! tlu-daq check-config config/tlu.example.toml
//! ```
//!
//! Simulate a run, writing events as JSON lines:
//! ```bash
//! tlu-daq simulate --config config/tlu.example.toml --output events.jsonl
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::AsyncWriteExt;
use tracing::{info, info_span, warn};

use tlu_daq::acquisition::{ChannelEventSink, LogTelemetry, RunController, StartOutcome};
use tlu_daq::bus::{MockI2cDevice, MockRegisterBus, SharedBus};
use tlu_daq::clock::MonotonicClock;
use tlu_daq::config::TluConfig;
use tlu_daq::i2c::I2cDevice;
use tlu_daq::logging;
use tlu_daq::tlu::Tlu;
use tlu_daq::trigger::{interval_to_frequency, unpack_pulse_vector};

#[derive(Parser)]
#[command(name = "tlu-daq")]
#[command(about = "Trigger Logic Unit configuration and readout", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a configuration file and print the compiled register values
    CheckConfig {
        /// Path to the TOML configuration
        config: PathBuf,
    },

    /// Run an acquisition against the simulated TLU
    Simulate {
        /// Path to the TOML configuration
        #[arg(long)]
        config: PathBuf,

        /// Write decoded events here as JSON lines
        #[arg(long)]
        output: Option<PathBuf>,

        /// Frames the simulator generates per FIFO poll
        #[arg(long, default_value = "1")]
        frames_per_poll: u32,

        /// Stop after this long unless a stop condition fires first (e.g. "10s")
        #[arg(long, value_parser = humantime::parse_duration)]
        duration: Option<Duration>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::CheckConfig { config } => check_config(config),
        Commands::Simulate {
            config,
            output,
            frames_per_poll,
            duration,
        } => simulate(config, output, frames_per_poll, duration).await,
    }
}

fn load(path: &Path) -> Result<TluConfig> {
    TluConfig::load_from(path)
        .with_context(|| format!("failed to load configuration from {}", path.display()))
}

fn check_config(path: PathBuf) -> Result<()> {
    let config = load(&path)?;
    let compiled = config.compile().context("configuration rejected")?;

    println!("✅ {} is valid", path.display());
    println!("   Rule:              {}", compiled.rule);
    println!(
        "   Trigger pattern:   high {:#010x}  low {:#010x}",
        compiled.trigger_mask.high, compiled.trigger_mask.low
    );
    println!(
        "   Pulse stretch:     {:#010x} {:?}",
        compiled.pulse_stretch,
        unpack_pulse_vector(compiled.pulse_stretch)
    );
    println!(
        "   Pulse delay:       {:#010x} {:?}",
        compiled.pulse_delay,
        unpack_pulse_vector(compiled.pulse_delay)
    );
    println!("   Threshold codes:   {:?}", compiled.threshold_codes);
    println!(
        "   Internal trigger:  interval {} ({:.1} Hz)",
        compiled.internal_trigger_interval,
        interval_to_frequency(compiled.internal_trigger_interval)
    );
    println!(
        "   DUT mask {:#x}, modes {:#04x}, modifier {:#x}, ignore busy {:#x}",
        compiled.dut_mask,
        compiled.dut_interface_mode,
        compiled.dut_mode_modifier,
        compiled.ignore_dut_busy
    );
    Ok(())
}

fn simulated_board(frames_per_poll: u32) -> MockRegisterBus {
    let bus = MockRegisterBus::new();
    let handle = bus.handle();
    for device in I2cDevice::ALL {
        handle.attach_i2c_device(device.address(), MockI2cDevice::new());
    }
    handle.enable_trigger_generator(frames_per_poll);
    bus
}

async fn simulate(
    path: PathBuf,
    output: Option<PathBuf>,
    frames_per_poll: u32,
    duration: Option<Duration>,
) -> Result<()> {
    let mut config = load(&path)?;
    if let Some(duration) = duration {
        config.run.timeout = Some(duration);
    }
    logging::init_from_config(&config).map_err(anyhow::Error::msg)?;
    let compiled = config.compile().context("configuration rejected")?;

    let root = info_span!("tlu-daq", name = %config.application.name);
    let tlu = Tlu::new(
        SharedBus::new(simulated_board(frames_per_poll)),
        config.hardware.i2c,
        &root,
    );
    let hardware = tlu.init_hardware().context("hardware initialisation failed")?;
    info!(
        devices = hardware.i2c_devices.len(),
        board_id = ?hardware.board_id,
        "Simulated board ready"
    );

    let controller = RunController::new(
        tlu,
        Arc::new(MonotonicClock::new()),
        Arc::new(LogTelemetry),
        &root,
    );
    controller.configure(compiled)?;

    let (sink, mut events) = ChannelEventSink::new();
    let writer = tokio::spawn(async move {
        let mut file = match output {
            Some(path) => Some(
                tokio::fs::File::create(&path)
                    .await
                    .with_context(|| format!("cannot create {}", path.display()))?,
            ),
            None => None,
        };
        let mut count = 0u64;
        while let Some(record) = events.recv().await {
            count += 1;
            if let Some(file) = file.as_mut() {
                let mut line = serde_json::to_vec(&record)?;
                line.push(b'\n');
                file.write_all(&line).await?;
            }
        }
        if let Some(file) = file.as_mut() {
            file.flush().await?;
        }
        anyhow::Ok(count)
    });

    let run = match controller.start(Box::new(sink)).await? {
        StartOutcome::Started(run) => run,
        StartOutcome::AlreadyRunning => bail!("a run is already active"),
    };

    let stop = run.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping run");
            stop.request_stop();
        }
    });

    let summary = run.wait().await?;
    let written = writer.await??;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    if written != summary.records {
        warn!(written, records = summary.records, "Event writer count differs from run summary");
    }
    Ok(())
}
