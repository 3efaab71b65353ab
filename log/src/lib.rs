//! Simple async logging crate inspired by OpenBSD's `log.c`

use derive_more::{Display, From, Into};
use libc::openlog;
use serde_derive::{Deserialize, Serialize};
use slog::{Drain, Level, OwnedKVList, Record, KV};
use slog_envlogger::{EnvLogger, LogBuilder};
use slog_scope::GlobalLoggerGuard;
use std::{
    env,
    ffi::{CStr, CString},
    fmt,
    io::{self, Write},
    pin::Pin,
    sync::{Mutex, Once},
    thread,
    time::Duration,
};
use tokio::{runtime::Runtime, sync::mpsc, time};

/// Re-export the scoped logging macros.
pub use slog_scope::{crit, debug, error, info, trace, warn};

static LOG_BRIDGE: Once = Once::new();

/// Configuration for the logging crate.
#[derive(Debug, Default, Clone, Copy, Deserialize, Serialize)]
pub struct Config {
    /// Log to the foreground or to syslog (default: syslog).
    pub foreground: bool,
    /// Lower the default filter from `info` to `debug`.
    pub verbose: bool,
}

impl Config {
    fn default_filter(&self) -> &'static str {
        if self.verbose {
            "debug"
        } else {
            "info"
        }
    }
}

impl From<bool> for Config {
    fn from(foreground: bool) -> Self {
        Self {
            foreground,
            verbose: false,
        }
    }
}

/// Logging errors.
#[derive(Debug, Display, From)]
pub enum Error {
    #[display(fmt = "{}", "_0")]
    NulError(std::ffi::NulError),
    #[display(fmt = "{}", "_0")]
    IoError(io::Error),
    #[display(fmt = "{}", "_0")]
    SendError(mpsc::error::SendError<Message>),
}

impl std::error::Error for Error {}

fn init(
    drain: Box<dyn Drain<Err = slog::Never, Ok = ()> + Send>,
    config: Config,
) -> GlobalLoggerGuard {
    let kv = slog::o!();

    let rust_log = env::var("RUST_LOG").ok();
    let drain = env_filter(drain, config.default_filter(), rust_log.as_deref());

    // This is required to make the drain `UnwindSafe`.
    let drain = Mutex::new(drain.fuse());

    let logger = slog::Logger::root(drain.fuse(), kv).into_erased();

    let guard = slog_scope::set_global_logger(logger);
    LOG_BRIDGE.call_once(|| {
        let _ = slog_stdlog::init();
    });

    guard
}

/// Filter with the `RUST_LOG` directives, or with `default` if unset.
fn env_filter<T>(drain: T, default: &str, directives: Option<&str>) -> EnvLogger<T>
where
    T: Drain<Ok = ()>,
{
    let directives = match directives.map(str::trim) {
        Some(directives) if !directives.is_empty() => directives,
        _ => default,
    };
    LogBuilder::new(drain).parse(directives).build()
}

/// Return a new global async logger.
pub async fn async_logger<C: Into<Config>>(
    name: &str,
    config: C,
) -> Result<GlobalLoggerGuard, Error> {
    let config = config.into();

    let drain = if config.foreground {
        Async::new(Box::new(Stderr::new(name)?)).await
    } else {
        Async::new(Box::new(Syslog::new(name)?)).await
    };

    Ok(init(Box::new(drain.fuse()), config))
}

/// Return a new global sync logger.
pub fn sync_logger<C: Into<Config>>(name: &str, config: C) -> Result<GlobalLoggerGuard, Error> {
    let config = config.into();

    let guard = if config.foreground {
        init(Box::new(Stderr::new(name)?.fuse()), config)
    } else {
        init(Box::new(Syslog::new(name)?.fuse()), config)
    };

    Ok(guard)
}

/// Local trait that can be used by the async logger.
pub trait Target: Send + Sync {
    fn new(name: &str) -> Result<Self, Error>
    where
        Self: Sized;
    fn log_str(&self, level: Level, message: &str) -> Result<(), Error>;
}

/// Foreground logger that logs to stderr.
pub struct Stderr {
    name: String,
}

impl Target for Stderr {
    /// Create a new foreground logger.
    fn new(name: &str) -> Result<Self, Error> {
        Ok(Self {
            name: name.to_string(),
        })
    }

    /// Log the pre-formatted string.
    fn log_str(&self, level: Level, message: &str) -> Result<(), Error> {
        let message = format!("{}: {}: {}\n", self.name, level.as_short_str(), message);
        io::stderr()
            .write_all(message.as_bytes())
            .map_err(Into::into)
    }
}

impl Drain for Stderr {
    type Ok = ();
    type Err = Error;

    fn log(&self, record: &Record<'_>, values: &OwnedKVList) -> Result<Self::Ok, Self::Err> {
        let message = format_log(record, values);
        self.log_str(record.level(), &message)
    }
}

/// Background logger to log to syslog.
pub struct Syslog {
    /// We need to keep a reference to the const char * around.
    _name: Pin<CString>,
}

impl Target for Syslog {
    /// Create a new background logger.
    ///
    /// The syslog socket is connected immediately (`LOG_NDELAY`) so
    /// that logging keeps working after the process is sandboxed.
    fn new(name: &str) -> Result<Self, Error> {
        let _name = CString::new(&name[..name.find('(').unwrap_or(name.len())])?;
        let c_str: &CStr = _name.as_c_str();

        unsafe {
            openlog(
                c_str.as_ptr(),
                libc::LOG_PID | libc::LOG_NDELAY,
                libc::LOG_DAEMON,
            )
        };

        Ok(Self {
            _name: Pin::new(_name),
        })
    }

    /// Convert the log string into a syslog message.
    fn log_str(&self, level: Level, message: &str) -> Result<(), Error> {
        let c_string: CString = CString::new(message.as_bytes())?;
        let c_message: &CStr = c_string.as_c_str();

        let priority = match level {
            Level::Critical => libc::LOG_CRIT,
            Level::Error => libc::LOG_ERR,
            Level::Warning => libc::LOG_WARNING,
            Level::Info => libc::LOG_INFO,
            Level::Debug | Level::Trace => libc::LOG_DEBUG,
        };

        unsafe {
            libc::syslog(priority, b"%s\0".as_ptr().cast(), c_message.as_ptr());
        }

        Ok(())
    }
}

impl Drop for Syslog {
    /// Close syslog on shutdown.
    fn drop(&mut self) {
        unsafe {
            libc::closelog();
        }
    }
}

impl Drain for Syslog {
    type Ok = ();
    type Err = Error;

    fn log(&self, record: &Record<'_>, values: &OwnedKVList) -> Result<Self::Ok, Self::Err> {
        let message = format_log(record, values);
        self.log_str(record.level(), &message)
    }
}

/// Async channel that sends log messages to a background task.
pub struct Async {
    sender: mpsc::UnboundedSender<Message>,
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl Async {
    /// Create new async logger that holds one of the supported target loggers.
    pub async fn new(target: Box<dyn Target>) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel::<Message>();

        let handle = tokio::spawn(async move {
            let mut logger = AsyncLogger::new(receiver, target);
            logger.listen().await;
        });

        Self {
            sender,
            handle: Some(handle),
        }
    }
}

impl Drain for Async {
    type Ok = ();
    type Err = Error;

    fn log(&self, record: &Record<'_>, values: &OwnedKVList) -> Result<Self::Ok, Self::Err> {
        let message = format_log(record, values);
        self.sender
            .send(Message::Entry(record.level(), message))
            .map_err(Into::into)
    }
}

impl Drop for Async {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            if self.sender.send(Message::Close).is_err() {
                return;
            }

            // Give the background task a moment to flush pending entries.
            let waiter = thread::spawn(|| {
                if let Ok(runtime) = Runtime::new() {
                    runtime.block_on(async move {
                        let _ = time::timeout(Duration::from_secs(1), handle).await;
                    });
                }
            });
            let _ = waiter.join();
        }
    }
}

#[derive(Debug, Clone)]
pub enum Message {
    Entry(Level, String),
    Close,
}

pub struct AsyncLogger {
    receiver: mpsc::UnboundedReceiver<Message>,
    target: Box<dyn Target>,
}

impl AsyncLogger {
    pub fn new(receiver: mpsc::UnboundedReceiver<Message>, target: Box<dyn Target>) -> Self {
        Self { receiver, target }
    }

    pub async fn listen(&mut self) {
        while let Some(Message::Entry(level, message)) = self.receiver.recv().await {
            // There is nowhere left to report a failing log target.
            let _ = self.target.log_str(level, &message);
        }
    }
}

/// Format the log message to a string.
#[inline]
fn format_log(record: &Record<'_>, values: &OwnedKVList) -> String {
    let mut formatter = Formatter::new(record);
    let _ = record.kv().serialize(record, &mut formatter);
    let _ = values.serialize(record, &mut formatter);
    formatter.into()
}

/// Formatter to create a log message from a record.
///
/// Fields are appended as `key=value`; values that contain whitespace
/// or quotes are quoted.
#[derive(Into)]
struct Formatter {
    #[into]
    buf: String,
}

impl Formatter {
    /// Return a new formatter.
    fn new(record: &Record<'_>) -> Self {
        let mut buf = record.msg().to_string();

        if record.level() >= Level::Debug {
            buf.push_str(&format!(" [{}:{}]", record.file(), record.line()));
        };

        Self { buf }
    }
}

/// Serializer for key-value fields.
impl slog::Serializer for Formatter {
    fn emit_arguments(&mut self, key: &str, val: &fmt::Arguments<'_>) -> slog::Result {
        let value = val.to_string();
        if value.is_empty() || value.contains(|c: char| c.is_whitespace() || c == '"') {
            self.buf.push_str(&format!(" {}={:?}", key, value));
        } else {
            self.buf.push_str(&format!(" {}={}", key, value));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::{async_logger, debug, env_filter, info, Config};
    use slog::{Drain, Never, OwnedKVList, Record};
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    /// Counts the records that pass the filter.
    #[derive(Clone, Default)]
    struct Counter(Arc<AtomicUsize>);

    impl Drain for Counter {
        type Ok = ();
        type Err = Never;

        fn log(&self, _: &Record<'_>, _: &OwnedKVList) -> Result<(), Never> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    impl Counter {
        fn count(&self) -> usize {
            self.0.load(Ordering::SeqCst)
        }
    }

    fn log_levels(default: &str, directives: Option<&str>) -> usize {
        let counter = Counter::default();
        let drain = env_filter(counter.clone(), default, directives).fuse();
        let logger = slog::Logger::root(drain, slog::o!());
        slog::error!(logger, "error");
        slog::info!(logger, "info");
        slog::debug!(logger, "debug");
        counter.count()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_log_stderr() {
        let config = Config {
            foreground: true,
            verbose: true,
        };
        let _guard = async_logger("test(store)", config).await.unwrap();

        for i in 1..=100 {
            info!("item created"; "count" => i);
            debug!("item fetched {}", i);
        }
    }

    #[test]
    fn test_default_filter() {
        assert_eq!(Config::from(true).default_filter(), "info");
        let verbose = Config {
            foreground: false,
            verbose: true,
        };
        assert_eq!(verbose.default_filter(), "debug");
    }

    #[test]
    fn test_env_filter() {
        assert_eq!(log_levels("info", None), 2);
        assert_eq!(log_levels("debug", None), 3);
        assert_eq!(log_levels("info", Some("  ")), 2);
        // RUST_LOG replaces the default.
        assert_eq!(log_levels("debug", Some("error")), 1);
        assert_eq!(log_levels("error", Some("privpaste_log=debug")), 3);
    }
}
