use color_eyre::Result;
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Directory daily log files are written to.
pub fn log_dir() -> Option<PathBuf> {
  dirs::data_dir().map(|d| d.join("rosterkit").join("logs"))
}

/// Install the global subscriber: a compact stderr layer plus a daily
/// rolling file under `dir` when one is given.
///
/// `RUST_LOG` overrides the default `info` filter. The returned guard must be
/// held for the life of the process or buffered file output is lost.
pub fn init(dir: Option<&Path>) -> Result<Option<WorkerGuard>> {
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
  let stderr = fmt::layer()
    .with_writer(std::io::stderr)
    .with_target(false)
    .compact();

  let Some(dir) = dir else {
    tracing_subscriber::registry()
      .with(filter)
      .with(stderr)
      .try_init()?;
    return Ok(None);
  };

  std::fs::create_dir_all(dir)?;
  let appender = tracing_appender::rolling::daily(dir, "rosterkit.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);

  tracing_subscriber::registry()
    .with(filter)
    .with(stderr)
    .with(fmt::layer().with_writer(writer).with_ansi(false))
    .try_init()?;

  Ok(Some(guard))
}
