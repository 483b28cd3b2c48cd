//! CLI Entry Point for korad-daq
//!
//! ```bash
//! korad-daq identify
//! korad-daq status
//! korad-daq discharge --cell-id 17
//! ```
//!
//! Settings come from `config/korad_daq.toml` (see `--config`) and `KORAD_DAQ_*`
//! environment variables. Ctrl-C during a discharge test stops it at the next cycle
//! boundary with the output switched off.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use korad_daq::config::{Settings, DEFAULT_CONFIG_PATH};
use korad_daq::discharge::{DischargeTest, InterruptFlag};
use korad_daq::export::CsvExporter;
use korad_daq::instrument::Kel103;
use korad_daq::logging;
use korad_daq::transport::UdpTransport;
use std::path::PathBuf;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "korad-daq")]
#[command(about = "KORAD KEL103 electronic load controller", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Instrument address, overrides the configuration
    #[arg(long, global = true)]
    device: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the instrument identity
    Identify,

    /// Print output state, mode, setpoints and live measurements
    Status,

    /// Run a battery discharge test and export the samples
    Discharge {
        /// Cell identifier, overrides the configuration
        #[arg(long)]
        cell_id: Option<String>,

        /// Export directory, overrides the configuration
        #[arg(long)]
        output_dir: Option<PathBuf>,

        /// Export file name without extension (default: DATE-cell-ID)
        #[arg(long)]
        name: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings = Settings::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    if let Some(device) = cli.device {
        settings.network.device_address = device;
    }
    if let Commands::Discharge {
        cell_id,
        output_dir,
        ..
    } = &cli.command
    {
        if let Some(cell_id) = cell_id {
            settings.discharge.cell_id = cell_id.clone();
        }
        if let Some(dir) = output_dir {
            settings.storage.output_dir = dir.clone();
        }
    }
    settings.validate().context("invalid configuration")?;
    logging::init_from_config(&settings)?;

    let mut load = Kel103::connect(
        settings.local_addr()?,
        settings.device_addr()?,
        settings.query_policy(),
    )
    .await
    .context("binding local UDP endpoint")?;

    match cli.command {
        Commands::Identify => {
            let identity = load.identify().await?;
            println!("{identity}");
            load.shutdown().await?;
        }
        Commands::Status => {
            let result = print_status(&mut load).await;
            load.shutdown().await?;
            result?;
        }
        Commands::Discharge { name, .. } => run_discharge(load, &settings, name).await?,
    }
    Ok(())
}

async fn print_status(load: &mut Kel103<UdpTransport>) -> Result<()> {
    let identity = load.identify().await?;
    let output = load.output_enabled().await?;
    let mode = load.function_mode().await?;
    let sense = load.remote_sense_enabled().await?;
    let current = load.current_setpoint().await?;
    let voltage = load.voltage_setpoint().await?;
    let power = load.power_setpoint().await?;
    let m = load.measure_all().await?;

    println!("Instrument:    {identity}");
    println!("Output:        {}", if output { "ON" } else { "OFF" });
    println!("Mode:          {mode}");
    println!("Remote sense:  {}", if sense { "ON" } else { "OFF" });
    println!("Setpoints:     {current:.3} A  {voltage:.3} V  {power:.3} W");
    println!(
        "Measured:      {:.3} V  {:.3} A  {:.3} W",
        m.voltage, m.current, m.power
    );
    Ok(())
}

async fn run_discharge(
    load: Kel103<UdpTransport>,
    settings: &Settings,
    name: Option<String>,
) -> Result<()> {
    let interrupt = InterruptFlag::new();
    let on_signal = interrupt.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping at next cycle");
            on_signal.trigger();
        }
    });

    let mut test = DischargeTest::new(load, settings.discharge_config(), interrupt);

    let result = async {
        test.setup().await.context("configuring instrument")?;
        let outcome = test.run().await.context("discharge test failed")?;
        info!(?outcome, "discharge test finished");
        Ok::<_, anyhow::Error>(outcome)
    }
    .await;

    let exporter = CsvExporter::new(&settings.storage.output_dir);
    let exported = match name.as_deref() {
        Some(name) => test.export_to(&exporter, name).await,
        None => test.export(&exporter).await,
    };
    match &exported {
        Ok(path) => println!("Samples written to {}", path.display()),
        Err(err) => error!(error = %err, "export failed"),
    }

    let mut load = test.into_load();
    load.shutdown().await.context("shutting down instrument")?;

    let outcome = result?;
    println!(
        "{}: {} after {} cycles, {} samples",
        settings.discharge.cell_id, outcome.reason, outcome.cycles, outcome.samples
    );
    Ok(())
}
