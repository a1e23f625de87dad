//! SAILTRACKD: live GPS/IMU fusion over MQTT and offline replay of sensor logs.
//!
//! - `run`: subscribe to the GPS and IMU topics, fuse the samples with the Kalman filter and
//!   publish the navigation solution on the output topic at a fixed rate.
//! - `replay`: run the same preprocessing and filter over a CSV log and write the preprocessed
//!   inputs and the estimates next to each other.
//! - `config`: write a configuration template (TOML/JSON/YAML by extension).
//!
//! Settings come from the configuration file given with `--config` (defaults otherwise);
//! command line flags override the file.

mod common;
mod mqtt;

use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use clap::{Args, Parser, Subcommand};
use log::{error, info};
use rumqttc::Client;

use common::{init_logger, load_config, validate_input_csv};
use sailtrack::FusionConfig;
use sailtrack::config::{CourseUnits, Representation, SpeedUnits};
use sailtrack::kalman::CovarianceUpdate;
use sailtrack::replay::run_replay;
use sailtrack::runtime::FusionRuntime;

/// Command line arguments
#[derive(Parser)]
#[command(author, version, about = "Real-time GPS/IMU fusion for sailing boats.")]
struct Cli {
    /// Configuration file (TOML/JSON/YAML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,

    /// Log level (off, error, warn, info, debug, trace)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Log file path (if not specified, logs to stderr)
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,
}

#[derive(Subcommand, Clone)]
enum Command {
    /// Fuse live MQTT sensor streams and publish the estimate
    Run(RunArgs),
    /// Replay a CSV sensor log through the filter
    Replay(ReplayArgs),
    /// Write a configuration template
    Config(ConfigArgs),
}

/// Filter settings shared by `run` and `replay`.
#[derive(Args, Clone, Debug, Default)]
struct FilterArgs {
    /// Filter period and model sample time (ms)
    #[arg(long)]
    sample_time_ms: Option<u64>,
    /// Acceleration noise standard deviation (m/s²)
    #[arg(long)]
    process_noise_std: Option<f64>,
    /// Use the Joseph form for the covariance update
    #[arg(long)]
    joseph: bool,
    /// Use runtime-sized matrices
    #[arg(long)]
    dynamic: bool,
    /// Minimum accepted GPS fix type
    #[arg(long)]
    min_fix_type: Option<i32>,
}

#[derive(Args, Clone, Debug)]
struct RunArgs {
    #[command(flatten)]
    filter: FilterArgs,
    /// Broker host
    #[arg(long)]
    host: Option<String>,
    /// Broker port
    #[arg(long)]
    port: Option<u16>,
    /// Output topic
    #[arg(long)]
    output_topic: Option<String>,
    /// Publish period (ms)
    #[arg(long)]
    publish_interval_ms: Option<u64>,
    /// Publish speed over ground in knots
    #[arg(long)]
    knots: bool,
    /// Publish course over ground in degrees
    #[arg(long)]
    degrees: bool,
    /// Stop after this many seconds (runs until killed otherwise)
    #[arg(long)]
    duration_s: Option<u64>,
}

#[derive(Args, Clone, Debug)]
struct ReplayArgs {
    #[command(flatten)]
    filter: FilterArgs,
    /// CSV sensor log
    #[arg(short, long)]
    input: PathBuf,
    /// Output directory
    #[arg(short, long)]
    output: PathBuf,
}

#[derive(Args, Clone, Debug)]
struct ConfigArgs {
    /// Destination file; the extension selects the format
    #[arg(short, long, default_value = "sailtrack.toml")]
    output: PathBuf,
}

fn apply_filter_args(config: &mut FusionConfig, args: &FilterArgs) {
    let filter = &mut config.filter;
    if let Some(sample_time_ms) = args.sample_time_ms {
        filter.sample_time_ms = sample_time_ms;
    }
    if let Some(process_noise_std) = args.process_noise_std {
        filter.process_noise_std = process_noise_std;
    }
    if args.joseph {
        filter.covariance_update = CovarianceUpdate::Joseph;
    }
    if args.dynamic {
        filter.representation = Representation::Dynamic;
    }
    if let Some(min_fix_type) = args.min_fix_type {
        filter.min_fix_type = min_fix_type;
    }
}

fn apply_run_args(config: &mut FusionConfig, args: &RunArgs) {
    apply_filter_args(config, &args.filter);
    if let Some(host) = &args.host {
        config.mqtt.host = host.clone();
    }
    if let Some(port) = args.port {
        config.mqtt.port = port;
    }
    if let Some(topic) = &args.output_topic {
        config.mqtt.output_topic = topic.clone();
    }
    if let Some(interval_ms) = args.publish_interval_ms {
        config.publish.interval_ms = interval_ms;
    }
    if args.knots {
        config.publish.speed_units = SpeedUnits::Knots;
    }
    if args.degrees {
        config.publish.course_units = CourseUnits::Degrees;
    }
}

fn run_live(mut config: FusionConfig, args: &RunArgs) -> Result<(), Box<dyn Error>> {
    apply_run_args(&mut config, args);
    config.validate()?;

    let (client, connection) = Client::new(mqtt::mqtt_options(&config.mqtt), 10);
    let sink = mqtt::MqttSink::new(client.clone(), config.mqtt.output_topic.clone());
    let runtime = FusionRuntime::start(&config, sink)?;
    let context = Arc::clone(runtime.context());

    if let Some(seconds) = args.duration_s {
        let shutdown = runtime.shutdown_signal();
        let client = client.clone();
        thread::Builder::new()
            .name("sailtrack-timer".into())
            .spawn(move || {
                shutdown.sleep_until(Instant::now() + Duration::from_secs(seconds));
                info!("run duration elapsed, shutting down");
                shutdown.trigger();
                if let Err(e) = client.disconnect() {
                    error!("failed to disconnect: {e}");
                }
            })?;
    }

    mqtt::run_ingestion(connection, &client, &context, &config.mqtt);
    let (filter_ticks, publish_ticks) = runtime.shutdown();
    info!("stopped after {filter_ticks} filter ticks and {publish_ticks} publish ticks");
    Ok(())
}

fn run_replay_cli(mut config: FusionConfig, args: &ReplayArgs) -> Result<(), Box<dyn Error>> {
    apply_filter_args(&mut config, &args.filter);
    config.validate()?;
    validate_input_csv(&args.input)?;
    let summary = run_replay(&args.input, &args.output, &config.filter)?;
    for path in &summary.outputs {
        info!("wrote {}", path.display());
    }
    println!(
        "{} rows, {} IMU samples, {} GPS samples, {} corrections",
        summary.rows, summary.imu_samples, summary.gps_samples, summary.corrections
    );
    Ok(())
}

fn write_config(config: &FusionConfig, args: &ConfigArgs) -> Result<(), Box<dyn Error>> {
    config.to_file(&args.output)?;
    println!("Configuration written to {}", args.output.display());
    Ok(())
}

fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    init_logger(&cli.log_level, cli.log_file.as_ref())?;
    let config = load_config(cli.config.as_deref())?;

    match &cli.command {
        Command::Run(args) => run_live(config, args),
        Command::Replay(args) => run_replay_cli(config, args),
        Command::Config(args) => write_config(&config, args),
    }
}
