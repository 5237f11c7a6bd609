//! Logging init, grounded on `antegen-cli`'s `commands/run.rs`: `RUST_LOG`
//! with an `info` default, overridable, plus `spec.md §6`'s `LOG_DIR` env var
//! routing output to a file instead of stderr when set.

use std::fs::OpenOptions;
use std::path::Path;

use log::LevelFilter;

pub fn init(debug_mode: bool, log_dir: Option<&Path>) {
    let mut builder = env_logger::Builder::new();

    if debug_mode {
        builder.filter_level(LevelFilter::Debug);
    } else {
        builder.parse_env(env_logger::Env::default().default_filter_or("info"));
    }

    if let Some(dir) = log_dir {
        if let Err(err) = std::fs::create_dir_all(dir) {
            eprintln!("logging: could not create LOG_DIR {}: {err}, falling back to stderr", dir.display());
        } else {
            let path = dir.join(format!("subcycle-{}.log", chrono::Local::now().format("%Y-%m-%d")));
            match OpenOptions::new().create(true).append(true).open(&path) {
                Ok(file) => {
                    builder.target(env_logger::Target::Pipe(Box::new(file)));
                }
                Err(err) => {
                    eprintln!("logging: could not open {}: {err}, falling back to stderr", path.display());
                }
            }
        }
    }

    builder.format_timestamp_millis().init();
}
