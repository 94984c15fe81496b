use anyhow::{anyhow, Result};
use log::{info, LevelFilter};
use std::env;

const ENV_PREFIX: &str = "FFPIPE_";

/// Level for the `-v`/`-q` balance: positive is more verbose.
pub fn level_for(verbosity: i8) -> LevelFilter {
    match verbosity {
        i8::MIN..=-3 => LevelFilter::Off,
        -2 => LevelFilter::Error,
        -1 => LevelFilter::Warn,
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

/// Installs the global logger: `env_logger` on stderr, or the local syslog daemon.
/// `RUST_LOG` applies when `verbosity` is zero and defaults to `info`.
pub fn init_logging(verbosity: i8, use_syslog: bool) -> Result<()> {
    if use_syslog {
        return init_syslog(level_for(verbosity));
    }
    if env::var_os("RUST_LOG").is_none() {
        env::set_var("RUST_LOG", "info");
    }
    let mut builder = env_logger::Builder::from_default_env();
    builder
        .format_timestamp(None)
        .target(env_logger::Target::Stderr);
    if verbosity != 0 {
        builder.filter_level(level_for(verbosity));
    }
    let _ = builder.try_init();
    Ok(())
}

#[cfg(unix)]
fn init_syslog(level: LevelFilter) -> Result<()> {
    let formatter = syslog::Formatter3164 {
        facility: syslog::Facility::LOG_USER,
        hostname: None,
        process: env!("CARGO_PKG_NAME").into(),
        pid: std::process::id(),
    };
    let logger =
        syslog::unix(formatter).map_err(|e| anyhow!("Unable to connect to syslog: {}", e))?;
    log::set_boxed_logger(Box::new(syslog::BasicLogger::new(logger)))
        .map_err(|e| anyhow!("Unable to install the syslog logger: {}", e))?;
    log::set_max_level(level);
    Ok(())
}

#[cfg(not(unix))]
fn init_syslog(_level: LevelFilter) -> Result<()> {
    Err(anyhow!("--syslog is only supported on unix platforms"))
}

fn relevant_env() -> Vec<(String, String)> {
    let mut entries: Vec<(String, String)> = env::vars()
        .filter(|(key, _)| key.starts_with(ENV_PREFIX) || key == "RUST_LOG")
        .collect();
    entries.sort_by(|a, b| a.0.cmp(&b.0));
    entries
}

pub fn log_relevant_env() {
    let entries = relevant_env();
    if entries.is_empty() {
        return;
    }
    info!("Environment snapshot ({} entries):", entries.len());
    for (key, value) in entries {
        let display_value = if value.chars().count() > 200 {
            format!("{}…", value.chars().take(200).collect::<String>())
        } else {
            value
        };
        info!("  {} = {}", key, display_value);
    }
}
