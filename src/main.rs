//! CLI Entry Point for itc-daq
//!
//! Provides command-line access to an ITC503:
//! - Identify the controller and print its status
//! - Change the setpoint
//! - Sample channels in the background for a fixed duration, streaming CSV or JSON lines
//!
//! # Usage
//!
//! ```bash
//! itc-daq --simulate sample --duration 5 --format csv
//! ITC_DAQ_LINK__TRANSPORT=serial ITC_DAQ_LINK__PORT=/dev/ttyUSB0 itc-daq status
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use itc_daq::config::{ItcDaqConfig, Transport, DEFAULT_CONFIG_PATH};
use itc_daq::instrument::ItcClient;
use itc_daq::logging;
use itc_daq::measurement::{Sample, SampleQueue, SamplingWorker};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Parser)]
#[command(name = "itc-daq")]
#[command(about = "Sample an Oxford ITC503 temperature controller", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Use the in-memory simulator regardless of the configured transport
    #[arg(long, global = true)]
    simulate: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the controller's identification string
    Identify,

    /// Print control status, setpoint, heater output and temperatures
    Status,

    /// Sample the configured channels in the background
    Sample {
        /// How long to sample, in seconds
        #[arg(long, default_value_t = 10.0)]
        duration: f64,

        /// Output format
        #[arg(long, value_enum, default_value_t = OutputFormat::Csv)]
        format: OutputFormat,

        /// Override the configured channels (comma separated)
        #[arg(long, value_delimiter = ',')]
        channels: Option<Vec<String>>,
    },

    /// Change the temperature setpoint (kelvin)
    SetSetpoint {
        /// New setpoint in kelvin
        kelvin: f64,
    },

    /// Print the effective configuration
    Config,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OutputFormat {
    Csv,
    Json,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = ItcDaqConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    if cli.simulate {
        config.link.transport = Transport::Simulated;
    }
    if let Commands::Sample {
        channels: Some(channels),
        ..
    } = &cli.command
    {
        config.sampling.channels = channels.clone();
    }
    config.validate()?;
    logging::init_from_config(&config)?;

    match cli.command {
        Commands::Config => {
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
        Commands::Identify => {
            let client = connect(&config).await?;
            println!("{}", client.identify().await?);
            Ok(())
        }
        Commands::Status => {
            let client = connect(&config).await?;
            print_status(&client).await
        }
        Commands::SetSetpoint { kelvin } => {
            let client = connect(&config).await?;
            client.set_setpoint(kelvin).await?;
            let readback = client.get_setpoint().await?;
            println!("{} = {} K", readback.name(), readback.value);
            Ok(())
        }
        Commands::Sample {
            duration, format, ..
        } => {
            let duration = Duration::try_from_secs_f64(duration)
                .context("--duration must be a non-negative number of seconds")?;
            run_sampling(&config, duration, format).await
        }
    }
}

async fn connect(config: &ItcDaqConfig) -> Result<Arc<ItcClient>> {
    let link = itc_daq::link::open(&config.link).await?;
    let client = ItcClient::from_shared(link);
    client.initialize().await?;
    Ok(Arc::new(client))
}

async fn print_status(client: &ItcClient) -> Result<()> {
    let status = client.get_status().await?;
    println!("Identity:       {}", client.identify().await?);
    println!("Control mode:   {:?}", status.control_mode);
    println!("Heater sensor:  {}", status.heater_sensor);
    println!("AutoHeat:       {}", status.auto_heat());
    println!("AutoPID:        {}", status.auto_pid);
    println!("Setpoint:       {} K", client.get_setpoint().await?.value);
    println!("Heater output:  {} %", client.get_heater_output().await?.value);

    let snapshot = client.get_all_temperatures().await?;
    println!("Temperatures at {}", snapshot.timestamp.to_rfc3339());
    for reading in [snapshot.tsorp, snapshot.the3, snapshot.t1k] {
        println!("  {:<6} {} K", reading.name(), reading.value);
    }
    Ok(())
}

async fn run_sampling(config: &ItcDaqConfig, duration: Duration, format: OutputFormat) -> Result<()> {
    let client = connect(config).await?;
    let worker = SamplingWorker::new(client, &config.sampling.channels, config.sampling.options())?;

    if let OutputFormat::Csv = format {
        let names: Vec<&str> = worker.channels().iter().map(|c| c.as_str()).collect();
        println!("timestamp,{}", names.join(","));
    }

    let printer = tokio::spawn(print_samples(worker.queue(), format));

    worker.start()?;
    tokio::select! {
        _ = tokio::time::sleep(duration) => {}
        _ = tokio::signal::ctrl_c() => info!("Interrupted"),
    }
    worker.stop();
    worker.join().await?;
    printer.await??;

    let stats = worker.stats();
    if let Some(failure) = worker.last_error() {
        eprintln!(
            "Last failed tick #{} at {}: {}",
            failure.sequence,
            failure.timestamp.to_rfc3339(),
            failure.error
        );
    }
    eprintln!(
        "{} samples from {} ticks ({} failed)",
        stats.samples, stats.ticks, stats.failed_ticks
    );
    Ok(())
}

async fn print_samples(queue: SampleQueue, format: OutputFormat) -> Result<()> {
    while let Some(sample) = queue.pop().await {
        println!("{}", render(&sample, format)?);
    }
    Ok(())
}

fn render(sample: &Sample, format: OutputFormat) -> Result<String> {
    Ok(match format {
        OutputFormat::Csv => sample.to_csv_row(),
        OutputFormat::Json => serde_json::to_string(sample)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_status_command() {
        let cli = Cli::try_parse_from(["itc-daq", "--simulate", "status"]).unwrap();
        assert!(cli.simulate);
        assert!(matches!(cli.command, Commands::Status));
    }

    #[tokio::test]
    async fn test_status_against_simulator() {
        let config = ItcDaqConfig::default();
        assert_eq!(config.link.transport, Transport::Simulated);

        let client = connect(&config).await.unwrap();
        print_status(&client).await.unwrap();
    }
}
