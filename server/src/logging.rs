//! `env_logger` setup driven by the relay configuration.

use std::fs::OpenOptions;
use std::path::Path;

use env_logger::{Builder, Target};
use log::LevelFilter;

/// Maps the configured debug level to a log filter.
pub fn level_for(debug_level: u8) -> LevelFilter {
    match debug_level {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

/// Installs the global logger. `RUST_LOG` still overrides per-module
/// filters. Returns a warning when the log file could not be opened and
/// output fell back to stderr.
pub fn init(debug_level: u8, log_file: Option<&Path>) -> Option<String> {
    let mut builder = Builder::new();
    builder.filter_level(level_for(debug_level)).parse_default_env();

    let mut warning = None;
    if let Some(path) = log_file {
        match OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => {
                builder.target(Target::Pipe(Box::new(file)));
            }
            Err(e) => {
                warning = Some(format!(
                    "Could not open log file {}: {}; logging to stderr",
                    path.display(),
                    e
                ));
            }
        }
    }

    if builder.try_init().is_err() {
        eprintln!("Logger already initialised");
    }
    warning
}
