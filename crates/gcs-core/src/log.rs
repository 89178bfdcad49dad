//! Injectable logging sink.
//!
//! The library logs through `tracing`. A [`Logger`] is a ready-made
//! `tracing_subscriber::fmt` subscriber that writes one line per event to
//! stderr, a file or an application callback. It can be installed process
//! wide with [`Logger::install_global`] or handed to a single connection
//! through [`crate::ConnConfig::logger`], in which case it is scoped to that
//! connection's calls and delivery thread.
//!
//! Debug output and timestamps can be switched on and off while the logger is
//! in use; the change applies to every connection sharing it.

use std::{
    fmt,
    fs::{File, OpenOptions},
    io::{self, Write},
    path::Path,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
};

use tracing::{Dispatch, Level, Metadata};
use tracing_subscriber::{
    EnvFilter, Registry,
    fmt::{
        MakeWriter,
        format::Writer,
        time::{FormatTime, SystemTime},
    },
    layer::SubscriberExt,
    reload,
};

use crate::error::GcsError;

/// Severity passed to callback sinks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    /// Failure
    Error,
    /// Anomaly that was handled
    Warn,
    /// Lifecycle events
    Info,
    /// Diagnostics, only with [`LogConfig::debug`]
    Debug,
}

impl From<Level> for Severity {
    fn from(level: Level) -> Self {
        match level {
            Level::ERROR => Self::Error,
            Level::WARN => Self::Warn,
            Level::INFO => Self::Info,
            _ => Self::Debug,
        }
    }
}

/// Application log callback.
pub type LogCallback = Arc<dyn Fn(Severity, &str) + Send + Sync>;

/// Where formatted lines go.
#[derive(Clone, Default)]
pub enum LogSink {
    /// Standard error
    #[default]
    Stderr,
    /// Append to an open file
    File(Arc<Mutex<File>>),
    /// Hand each line (without trailing newline) to the application
    Callback(LogCallback),
}

impl LogSink {
    /// Append to the file at `path`, creating it if absent.
    pub fn file(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self::File(Arc::new(Mutex::new(file))))
    }

    /// Deliver lines to `f`.
    pub fn callback(f: impl Fn(Severity, &str) + Send + Sync + 'static) -> Self {
        Self::Callback(Arc::new(f))
    }

    fn emit(&self, severity: Severity, line: &[u8]) -> io::Result<()> {
        match self {
            Self::Stderr => io::stderr().lock().write_all(line),
            Self::File(file) => file.lock().unwrap_or_else(PoisonError::into_inner).write_all(line),
            Self::Callback(f) => {
                let text = String::from_utf8_lossy(line);
                f(severity, text.trim());
                Ok(())
            },
        }
    }
}

impl fmt::Debug for LogSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stderr => f.write_str("Stderr"),
            Self::File(_) => f.write_str("File"),
            Self::Callback(_) => f.write_str("Callback"),
        }
    }
}

/// Logger settings.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Destination
    pub sink: LogSink,
    /// Prefix lines with a timestamp. See [`Logger::set_timestamps`].
    pub timestamps: bool,
    /// Emit debug events. See [`Logger::set_debug`].
    pub debug: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self { sink: LogSink::Stderr, timestamps: true, debug: false }
    }
}

/// A configured `tracing` subscriber.
#[derive(Clone)]
pub struct Logger {
    dispatch: Dispatch,
    filter: reload::Handle<EnvFilter, Registry>,
    timestamps: Arc<AtomicBool>,
}

impl Logger {
    /// Build a subscriber from `config`.
    pub fn new(config: LogConfig) -> Self {
        let (filter, handle) = reload::Layer::new(level_filter(config.debug));
        let timestamps = Arc::new(AtomicBool::new(config.timestamps));

        let lines = tracing_subscriber::fmt::layer()
            .with_writer(SinkWriter { sink: Arc::new(config.sink) })
            .with_ansi(false)
            .with_target(false)
            .with_timer(Timestamps { on: Arc::clone(&timestamps) });
        let subscriber = tracing_subscriber::registry().with(filter).with(lines);

        Self { dispatch: Dispatch::new(subscriber), filter: handle, timestamps }
    }

    /// Switch debug events on or off.
    pub fn set_debug(&self, on: bool) -> Result<(), GcsError> {
        self.filter
            .reload(level_filter(on))
            .map_err(|e| GcsError::Other(format!("could not change log level: {e}")))
    }

    /// Switch line timestamps on or off.
    pub fn set_timestamps(&self, on: bool) {
        self.timestamps.store(on, Ordering::Relaxed);
    }

    /// Make this the process-wide subscriber. Fails if one is already set.
    pub fn install_global(&self) -> Result<(), GcsError> {
        tracing::dispatcher::set_global_default(self.dispatch.clone())
            .map_err(|e| GcsError::Other(e.to_string()))
    }

    /// Run `f` with this logger as the current subscriber.
    pub fn in_scope<T>(&self, f: impl FnOnce() -> T) -> T {
        tracing::dispatcher::with_default(&self.dispatch, f)
    }

    pub(crate) fn dispatch(&self) -> &Dispatch {
        &self.dispatch
    }
}

impl Default for Logger {
    fn default() -> Self {
        Self::new(LogConfig::default())
    }
}

impl fmt::Debug for Logger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Logger").finish_non_exhaustive()
    }
}

fn level_filter(debug: bool) -> EnvFilter {
    EnvFilter::new(if debug { "debug" } else { "info" })
}

/// System time, or nothing while switched off.
struct Timestamps {
    on: Arc<AtomicBool>,
}

impl FormatTime for Timestamps {
    fn format_time(&self, w: &mut Writer<'_>) -> fmt::Result {
        if self.on.load(Ordering::Relaxed) {
            SystemTime.format_time(w)
        } else {
            Ok(())
        }
    }
}

struct SinkWriter {
    sink: Arc<LogSink>,
}

impl<'a> MakeWriter<'a> for SinkWriter {
    type Writer = LineWriter<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        LineWriter { sink: &self.sink, severity: Severity::Info, buf: Vec::new() }
    }

    fn make_writer_for(&'a self, meta: &Metadata<'_>) -> Self::Writer {
        LineWriter { sink: &self.sink, severity: Severity::from(*meta.level()), buf: Vec::new() }
    }
}

/// Buffers one formatted event and emits it on drop.
struct LineWriter<'a> {
    sink: &'a LogSink,
    severity: Severity,
    buf: Vec<u8>,
}

impl Write for LineWriter<'_> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for LineWriter<'_> {
    fn drop(&mut self) {
        if !self.buf.is_empty() {
            let _ = self.sink.emit(self.severity, &self.buf);
        }
    }
}
