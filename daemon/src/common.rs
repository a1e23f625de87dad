//! Helpers shared by the `sailtrackd` subcommands.
use std::error::Error;
use std::path::{Path, PathBuf};

use sailtrack::FusionConfig;

/// Parse a `--log-level` value. Unlike `RUST_LOG`, a typo here is a hard error.
pub fn parse_level(log_level: &str) -> Result<log::LevelFilter, Box<dyn Error>> {
    log_level
        .parse::<log::LevelFilter>()
        .map_err(|_| format!("unknown log level '{log_level}'").into())
}

/// Open `path` for appending log lines, creating missing parent directories.
fn log_file_target(path: &Path) -> std::io::Result<env_logger::Target> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
    Ok(env_logger::Target::Pipe(Box::new(file)))
}

/// Install the global logger for the daemon.
///
/// Lines look like `2024-05-01T10:00:00.123Z INFO  sailtrack-filter sailtrack::fusion: ...`
/// (UTC time, level, thread, module). `RUST_LOG` directives, when set, refine `log_level`
/// per module. With `log_file` the lines are appended there instead of stderr.
pub fn init_logger(log_level: &str, log_file: Option<&PathBuf>) -> Result<(), Box<dyn Error>> {
    use std::io::Write;

    let mut builder = env_logger::Builder::new();
    builder.filter_level(parse_level(log_level)?);
    if let Ok(directives) = std::env::var("RUST_LOG") {
        builder.parse_filters(&directives);
    }
    builder.format(|buf, record| {
        writeln!(
            buf,
            "{} {:<5} {} {}: {}",
            chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ"),
            record.level(),
            std::thread::current().name().unwrap_or("main"),
            record.target(),
            record.args()
        )
    });
    if let Some(path) = log_file {
        builder.target(log_file_target(path)?);
    }
    builder.try_init()?;
    Ok(())
}

/// Load the configuration file if one was given, otherwise the defaults.
pub fn load_config(path: Option<&Path>) -> Result<FusionConfig, Box<dyn Error>> {
    match path {
        Some(path) => {
            let config = FusionConfig::from_file(path)?;
            log::info!("loaded configuration from {}", path.display());
            Ok(config)
        }
        None => Ok(FusionConfig::default()),
    }
}

/// Validate that a replay input exists and is a CSV file.
pub fn validate_input_csv(input: &Path) -> Result<(), Box<dyn Error>> {
    if !input.is_file() {
        return Err(format!("Input path '{}' is not an existing file.", input.display()).into());
    }
    if input.extension().and_then(|s| s.to_str()) != Some("csv") {
        return Err(format!("Input file '{}' is not a CSV file.", input.display()).into());
    }
    Ok(())
}
