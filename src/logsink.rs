//! A line-oriented, timestamp-prefixing log sink, bridged to the [`log`]
//! facade so every module reaches it through the ordinary logging macros
//! (§4.3, §10).

use std::fs::{File, OpenOptions};
use std::io::{self, Stderr, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Local;
use log::{Log, Metadata, Record};

/// Where flushed lines ultimately go.
enum Target {
    Stderr(Stderr),
    File { path: PathBuf, file: File },
}

impl Target {
    fn open(path: Option<&Path>) -> io::Result<Target> {
        match path {
            None => Ok(Target::Stderr(io::stderr())),
            Some(path) => {
                let file = OpenOptions::new().create(true).append(true).open(path)?;
                Ok(Target::File {
                    path: path.to_path_buf(),
                    file,
                })
            }
        }
    }

    fn reopen(&mut self) -> io::Result<()> {
        if let Target::File { path, file } = self {
            *file = OpenOptions::new().create(true).append(true).open(&path)?;
        }
        Ok(())
    }
}

impl Write for Target {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Target::Stderr(s) => s.write(buf),
            Target::File { file, .. } => file.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Target::Stderr(s) => s.flush(),
            Target::File { file, .. } => file.flush(),
        }
    }
}

/// Timestamps and writes log lines; safe to share across the process because
/// every write goes through the inner mutex.
pub struct TimestampSink {
    target: Mutex<Target>,
    level: log::LevelFilter,
}

impl TimestampSink {
    pub fn new(path: Option<&Path>, level: log::LevelFilter) -> io::Result<TimestampSink> {
        Ok(TimestampSink {
            target: Mutex::new(Target::open(path)?),
            level,
        })
    }

    /// Close and reopen the underlying file in append mode. A no-op when
    /// logging to stderr. Used by the SIGHUP lifecycle hook (§6).
    pub fn reopen(&self) -> io::Result<()> {
        self.target.lock().unwrap().reopen()
    }

    fn write_line(&self, line: &str) {
        let now = Local::now();
        let stamp = now.format("%Y-%m-%dT%H:%M:%S%.6f%z");
        let mut target = self.target.lock().unwrap();
        let _ = writeln!(target, "{stamp} {line}");
        let _ = target.flush();
    }

    /// Install a sink as the global `log` logger, returning a shared handle
    /// the caller can keep around to trigger [`TimestampSink::reopen`] (the
    /// SIGHUP hook) without going through `log`'s global state.
    pub fn install(
        path: Option<&Path>,
        level: log::LevelFilter,
    ) -> io::Result<std::sync::Arc<TimestampSink>> {
        let sink = std::sync::Arc::new(TimestampSink::new(path, level)?);
        log::set_max_level(level);
        log::set_boxed_logger(Box::new(SharedSink(sink.clone())))
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        Ok(sink)
    }
}

/// Delegates `log::Log` to a shared [`TimestampSink`], so the sink can be
/// both the registered global logger and a handle the engine holds for
/// `reopen()`.
struct SharedSink(std::sync::Arc<TimestampSink>);

impl Log for SharedSink {
    fn enabled(&self, metadata: &Metadata) -> bool {
        self.0.enabled(metadata)
    }

    fn log(&self, record: &Record) {
        self.0.log(record)
    }

    fn flush(&self) {
        self.0.flush()
    }
}

impl Log for TimestampSink {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        self.write_line(&format!("{} {}", record.level(), record.args()));
    }

    fn flush(&self) {
        let _ = self.target.lock().unwrap().flush();
    }
}
