//! Command-line front end for the RF console.
//!
//! Each invocation loads the configuration, adopts the backend's current
//! connection state and performs one operator action.
//!
//! ```bash
//! rf_console matrix connect --host 192.168.2.11
//! rf_console matrix path-switch 12 74
//! rf_console vna connect --device rohde-zna26
//! rf_console vna measure --param S11 --param S21 --count 10 --export run.zip
//! ```

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use rf_console::config::{ConsoleConfig, DEFAULT_CONFIG_PATH};
use rf_console::gateway::ConnectParams;
use rf_console::measurement::{MeasurementMode, ParameterId, RunState};
use rf_console::protocol::{target_port_domain, MixerConfig, ResponseReport, VnaDevice};
use rf_console::{logging, Console};
use std::path::PathBuf;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "rf_console", about = "RF switch matrix and VNA operator console", version)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show both instruments' connection state
    Status,
    /// Switch-matrix operations
    #[command(subcommand)]
    Matrix(MatrixCommand),
    /// Network-analyzer operations
    #[command(subcommand)]
    Vna(VnaCommand),
    /// Print the effective configuration as TOML
    Config,
}

#[derive(Subcommand)]
enum MatrixCommand {
    /// Connect over the network, or over a serial line with --serial
    Connect {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
        #[arg(long, conflicts_with_all = ["host", "port"])]
        serial: Option<String>,
        #[arg(long, requires = "serial")]
        baud: Option<u32>,
    },
    Disconnect,
    /// List serial ports on the backend host
    Ports,
    /// Show valid CHANGETO target ports, for one switch or all of them
    Targets { switch_index: Option<u32> },
    /// Route COM1 (1-72) to COM2 (73-76)
    PathSwitch { com1: u32, com2: u32 },
    /// Set one switch to a target port
    ChangeTo { switch_index: u32, target_port: u32 },
    /// Send a raw command, e.g. `ROUTE:PATHSWITCH?`
    Raw {
        #[arg(required = true, num_args = 1..)]
        command: Vec<String>,
    },
}

#[derive(Subcommand)]
enum VnaCommand {
    /// List supported analyzer models
    Devices,
    Connect {
        #[arg(long)]
        device: Option<VnaDevice>,
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
    },
    Disconnect,
    /// Show, edit or reset the mixer configuration
    Mixer {
        /// Restore factory defaults before applying edits
        #[arg(long)]
        reset: bool,
        #[command(flatten)]
        edits: MixerEdits,
        /// Send the result to the backend
        #[arg(long)]
        save: bool,
    },
    /// Run a measurement and follow its progress. Ctrl-C stops the run.
    Measure {
        #[arg(long, value_enum, default_value_t = ModeArg::Basic)]
        mode: ModeArg,
        /// Parameter to measure; repeat for several. Defaults to the whole mode.
        #[arg(long = "param")]
        params: Vec<ParameterId>,
        /// Repeats per parameter (1-100)
        #[arg(long)]
        count: Option<u32>,
        #[arg(long)]
        points: Option<u32>,
        #[arg(long)]
        start_mhz: Option<f64>,
        #[arg(long)]
        stop_mhz: Option<f64>,
        /// Write a zip of the result files here once the run completes
        #[arg(long, value_name = "PATH")]
        export: Option<PathBuf>,
    },
}

#[derive(Args)]
struct MixerEdits {
    /// RF/input, IF/output and LO ports
    #[arg(long, num_args = 3, value_names = ["RF", "IF", "LO"])]
    ports: Option<Vec<u8>>,
    #[arg(long)]
    lo_frequency_mhz: Option<f64>,
    #[arg(long)]
    lo_power_dbm: Option<f64>,
    /// Input sweep start (Siyi only)
    #[arg(long)]
    input_start_mhz: Option<f64>,
    /// Input sweep stop (Siyi only)
    #[arg(long)]
    input_stop_mhz: Option<f64>,
    /// Input drive power (Siyi only)
    #[arg(long)]
    input_power_dbm: Option<f64>,
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    Basic,
    Mixer,
    Power,
}

impl From<ModeArg> for MeasurementMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Basic => MeasurementMode::Basic,
            ModeArg::Mixer => MeasurementMode::Mixer,
            ModeArg::Power => MeasurementMode::Power,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = ConsoleConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    if cli.json_logs {
        logging::init(&config.application.log_level, true);
    } else {
        logging::init_from_config(&config);
    }
    info!(backend = %config.backend.base_url, "{} starting", config.application.name);

    if let Command::Config = cli.cmd {
        print!("{}", config.to_toml()?);
        return Ok(());
    }

    let mut console = Console::connect_http(config)?;
    console.matrix().reconcile().await;
    console.vna().reconcile().await;

    match cli.cmd {
        Command::Status => print_status(&console),
        Command::Matrix(cmd) => run_matrix(&mut console, cmd).await?,
        Command::Vna(cmd) => run_vna(&mut console, cmd).await?,
        Command::Config => {}
    }
    Ok(())
}

fn print_status(console: &Console) {
    for conn in [console.matrix().snapshot(), console.vna().snapshot()] {
        let address = conn.address.as_deref().unwrap_or("-");
        println!("{:<7} {:<13} {}", conn.instrument_class, conn.status, address);
    }
}

fn print_report(report: &ResponseReport) {
    println!("{} {}", report.status, report.message);
}

async fn run_matrix(console: &mut Console, cmd: MatrixCommand) -> Result<()> {
    let defaults = console.config().matrix.clone();
    match cmd {
        MatrixCommand::Connect {
            host,
            port,
            serial,
            baud,
        } => {
            let params = match serial {
                Some(name) => {
                    ConnectParams::serial(name, baud.unwrap_or(defaults.default_baud_rate))
                }
                None => ConnectParams::network(
                    host.unwrap_or(defaults.default_host),
                    port.unwrap_or(defaults.default_port),
                ),
            };
            console.connect_matrix(params).await?;
            print_status(console);
        }
        MatrixCommand::Disconnect => {
            console.disconnect_matrix().await?;
            print_status(console);
        }
        MatrixCommand::Ports => {
            for port in console.serial_ports().await? {
                println!("{port}");
            }
        }
        MatrixCommand::Targets { switch_index } => {
            let indices = match switch_index {
                Some(index) => vec![index],
                None => vec![1, 72, 73, 81, 82, 83],
            };
            for index in indices {
                match target_port_domain(index) {
                    Some(domain) => {
                        println!("switch {index:>2}: {}..={}", domain.start(), domain.end())
                    }
                    None => bail!("switch index {index} is not addressable (1..=83)"),
                }
            }
        }
        MatrixCommand::PathSwitch { com1, com2 } => {
            print_report(&console.path_switch(com1, com2).await?);
        }
        MatrixCommand::ChangeTo {
            switch_index,
            target_port,
        } => {
            print_report(&console.change_to(switch_index, target_port).await?);
        }
        MatrixCommand::Raw { command } => {
            let report = console.send_raw_command(&command.join(" ")).await?;
            print_report(&report);
        }
    }
    Ok(())
}

async fn run_vna(console: &mut Console, cmd: VnaCommand) -> Result<()> {
    match cmd {
        VnaCommand::Devices => {
            for device in VnaDevice::ALL {
                let (low, high) = device.frequency_range_hz();
                let mixer = device
                    .mixer_variant()
                    .map_or("no mixer", |variant| variant.name());
                println!(
                    "{:<16} {:<24} {:.0}-{:.0} MHz, {}",
                    device.id(),
                    device.display_name(),
                    low / 1e6,
                    high / 1e6,
                    mixer
                );
            }
        }
        VnaCommand::Connect { device, host, port } => {
            let defaults = console.config().vna.clone();
            let device = match device {
                Some(device) => device,
                None => match defaults.device()? {
                    Some(device) => device,
                    None => bail!("no --device given and no vna.default_device configured"),
                },
            };
            let params = ConnectParams::vna(
                device,
                host.unwrap_or(defaults.default_host),
                port.unwrap_or(defaults.default_port),
            );
            console.connect_vna(params).await?;
            print_status(console);
        }
        VnaCommand::Disconnect => {
            console.disconnect_vna().await?;
            print_status(console);
        }
        VnaCommand::Mixer { reset, edits, save } => {
            let current = if reset {
                console.reset_mixer_config()?.clone()
            } else {
                let stored = console.load_mixer_config().await?.cloned();
                match stored {
                    Some(config) => config,
                    None => console.reset_mixer_config()?.clone(),
                }
            };
            let edited = apply_mixer_edits(current, &edits);
            println!("{edited:#?}");
            console.edit_mixer_config(edited);
            if save {
                console.save_mixer_config().await?;
                println!("mixer configuration saved");
            }
        }
        VnaCommand::Measure {
            mode,
            params,
            count,
            points,
            start_mhz,
            stop_mhz,
            export,
        } => {
            console.set_mode(mode.into());
            if params.is_empty() {
                console.toggle_all();
            }
            for param in params {
                console.toggle_parameter(param)?;
            }

            let mut config = console.config().measurement.clone();
            if let Some(count) = count {
                config.measurement_count = count;
            }
            if let Some(points) = points {
                config.frequency_points = points;
            }
            if let Some(start) = start_mhz {
                config.start_frequency_mhz = start;
            }
            if let Some(stop) = stop_mhz {
                config.stop_frequency_mhz = stop;
            }

            console.start_measurement_with(config).await?;
            follow_measurement(console).await?;

            if let Some(path) = export {
                let archive = console.export_results().await?;
                tokio::fs::write(&path, &archive)
                    .await
                    .with_context(|| format!("failed to write {}", path.display()))?;
                println!("results exported to {} ({} bytes)", path.display(), archive.len());
            }
        }
    }
    Ok(())
}

fn apply_mixer_edits(mut config: MixerConfig, edits: &MixerEdits) -> MixerConfig {
    let ports = edits.ports.as_deref();
    match &mut config {
        MixerConfig::Rohde(c) => {
            if let Some([rf, if_port, lo]) = ports {
                (c.rf_port, c.if_port, c.lo_port) = (*rf, *if_port, *lo);
            }
            c.lo_frequency_mhz = edits.lo_frequency_mhz.unwrap_or(c.lo_frequency_mhz);
            c.lo_power_dbm = edits.lo_power_dbm.unwrap_or(c.lo_power_dbm);
        }
        MixerConfig::Siyi(c) => {
            if let Some([input, output, lo]) = ports {
                (c.input_port, c.output_port, c.lo_port) = (*input, *output, *lo);
            }
            c.lo_freq_mhz = edits.lo_frequency_mhz.unwrap_or(c.lo_freq_mhz);
            c.lo_power_dbm = edits.lo_power_dbm.unwrap_or(c.lo_power_dbm);
            c.input_start_mhz = edits.input_start_mhz.unwrap_or(c.input_start_mhz);
            c.input_stop_mhz = edits.input_stop_mhz.unwrap_or(c.input_stop_mhz);
            c.input_power_dbm = edits.input_power_dbm.unwrap_or(c.input_power_dbm);
        }
    }
    config
}

async fn follow_measurement(console: &Console) -> Result<()> {
    let mut updates = console.orchestrator().subscribe();
    loop {
        let run = updates.borrow_and_update().clone();
        println!(
            "{:>5.1}%  {}/{}  {} result(s)",
            run.progress_percent,
            run.current_index,
            run.total_count,
            run.results.len()
        );
        match &run.state {
            RunState::Completed => {
                for result in &run.results {
                    println!(
                        "{:<8} {:>5}  {}",
                        result.parameter, result.measurements_taken, result.artifact_path
                    );
                }
                return Ok(());
            }
            RunState::Failed(reason) => bail!("measurement failed: {reason}"),
            _ => {}
        }

        tokio::select! {
            changed = updates.changed() => {
                if changed.is_err() {
                    bail!("measurement updates closed");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                warn!("interrupted, stopping measurement");
                console.stop_measurement().await?;
            }
        }
    }
}
