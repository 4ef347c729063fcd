//! Logger setup
//!
//! `RUST_LOG` wins over `[logging] level`. With `output = "file"` every record
//! is written to stderr and to `<app_dir>/logs/setu-<unix-seconds>.log`.

use crate::config::LoggingConfig;
use crate::error::{Error, Result};
use env_logger::{Builder, Env, Target};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// Install the global logger. Returns the log file path when logging to file.
pub fn init(config: &LoggingConfig, app_dir: &Path) -> Result<Option<PathBuf>> {
    let mut builder = Builder::from_env(Env::default().default_filter_or(&config.level));
    builder.format_timestamp_millis();

    let log_file = match config.output.as_str() {
        "stdout" => {
            builder.target(Target::Stdout);
            None
        }
        "stderr" => {
            builder.target(Target::Stderr);
            None
        }
        "file" => {
            let (file, path) = open_log_file(&app_dir.join("logs"))?;
            builder.target(Target::Pipe(Box::new(Tee { file })));
            Some(path)
        }
        other => {
            return Err(Error::Config(format!("unknown log output {:?}", other)));
        }
    };

    builder
        .try_init()
        .map_err(|e| Error::Other(format!("Failed to initialise logger: {}", e)))?;
    Ok(log_file)
}

fn open_log_file(dir: &Path) -> Result<(File, PathBuf)> {
    fs::create_dir_all(dir)?;
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();
    let path = dir.join(format!("setu-{}.log", secs));
    let file = File::options().create(true).append(true).open(&path)?;
    Ok((file, path))
}

/// Copies every record to stderr and a file
struct Tee {
    file: File,
}

impl Write for Tee {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        // A closed stderr must not stop file logging
        let _ = io::stderr().write_all(buf);
        self.file.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let _ = io::stderr().flush();
        self.file.flush()
    }
}
