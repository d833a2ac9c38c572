// Copyright Braid Project Contributors - SPDX Identifier: Apache-2.0

use once_cell::sync::OnceCell;
use std::{
    path::{Path, PathBuf},
    str::FromStr,
    sync::RwLock,
};
use tracing::event;
use tracing_appender::rolling::{RollingFileAppender, RollingWriter, Rotation};
use tracing_subscriber::{
    Registry,
    filter::{self, Filtered, LevelFilter},
    fmt::{
        self,
        format::{DefaultFields, Format},
        writer::MakeWriter,
    },
    layer::Layered,
    prelude::*,
    reload::{self, Handle},
};

const LOG_FILE_DIRECTORY: &str = "braid-logs";
const ENV_BRAID_LOG_DIR: &str = "BRAID_LOG_DIR";
const DEFAULT_LOG_FILE: &str = "output.log";

/// Severity threshold accepted by [init].
#[derive(Debug)]
pub enum Level {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
    Trace = 4,
    Off = 5,
}

impl Level {
    fn to_filter(&self) -> LevelFilter {
        match self {
            Level::Trace => LevelFilter::TRACE,
            Level::Debug => LevelFilter::DEBUG,
            Level::Info => LevelFilter::INFO,
            Level::Warn => LevelFilter::WARN,
            Level::Error => LevelFilter::ERROR,
            Level::Off => LevelFilter::OFF,
        }
    }
}

/// Resolves the directory log files are written to. `BRAID_LOG_DIR` wins when
/// it is set, non-empty, and creatable; otherwise the fixed default is used.
pub fn log_directory() -> String {
    let Ok(dir) = std::env::var(ENV_BRAID_LOG_DIR) else {
        return LOG_FILE_DIRECTORY.to_string();
    };
    if dir.trim().is_empty() || std::fs::create_dir_all(&dir).is_err() {
        return LOG_FILE_DIRECTORY.to_string();
    }
    dir
}

/// Opens the rolling appender (and with it the log directory) only when the
/// first line is actually written. Console-only use must work on read-only
/// filesystems, and the appender creates its directory in the constructor.
struct DeferredAppender {
    prefix: PathBuf,
    appender: OnceCell<RollingFileAppender>,
}

impl DeferredAppender {
    fn new(prefix: impl AsRef<Path>) -> DeferredAppender {
        DeferredAppender {
            prefix: prefix.as_ref().to_path_buf(),
            appender: OnceCell::new(),
        }
    }
}

impl<'a> MakeWriter<'a> for DeferredAppender {
    type Writer = RollingWriter<'a>;
    fn make_writer(&'a self) -> Self::Writer {
        self.appender
            .get_or_init(|| {
                RollingFileAppender::new(Rotation::HOURLY, log_directory(), &self.prefix)
            })
            .make_writer()
    }
}

// The console layer sits directly on the registry; the file layer sits on the
// stack the console layer produced. Both are behind reload handles so [init]
// can re-route output after the subscriber is installed.
type ConsoleLayer = Filtered<fmt::Layer<Registry>, LevelFilter, Registry>;
type ConsoleStack = Layered<reload::Layer<ConsoleLayer, Registry>, Registry>;
type FileLayer = Filtered<
    fmt::Layer<ConsoleStack, DefaultFields, Format, DeferredAppender>,
    LevelFilter,
    ConsoleStack,
>;

struct Router {
    console: RwLock<Handle<ConsoleLayer, Registry>>,
    file: RwLock<Handle<FileLayer, ConsoleStack>>,
}

static ROUTER: OnceCell<Router> = OnceCell::new();

fn target_filter() -> filter::Targets {
    // RUST_LOG can narrow verbosity further; unparsable values mean "everything".
    let level = match std::env::var("RUST_LOG") {
        Ok(var) => {
            LevelFilter::from(tracing::Level::from_str(&var).unwrap_or(tracing::Level::TRACE))
        }
        Err(_) => LevelFilter::TRACE,
    };
    filter::Targets::new()
        .with_target("braid_core", level)
        .with_target("logger_core", level)
        .with_target(std::env!("CARGO_PKG_NAME"), level)
}

impl Router {
    /// Installs the global subscriber with both layers muted; [Router::route]
    /// opens the one that should carry output.
    fn install(default_prefix: &str) -> Router {
        let (console_layer, console) =
            reload::Layer::new(fmt::layer().with_ansi(true).with_filter(LevelFilter::OFF));
        let (file_layer, file) = reload::Layer::new(
            fmt::layer()
                .with_writer(DeferredAppender::new(default_prefix))
                .with_filter(LevelFilter::OFF),
        );

        tracing_subscriber::registry()
            .with(console_layer)
            .with(file_layer)
            .with(target_filter())
            .init();

        Router {
            console: RwLock::new(console),
            file: RwLock::new(file),
        }
    }

    /// Points output at the file when a prefix is given, at the console
    /// otherwise, muting whichever side is not selected.
    fn route(&self, filter: LevelFilter, file_prefix: Option<&str>) {
        let console_filter = if file_prefix.is_none() {
            filter
        } else {
            LevelFilter::OFF
        };
        let _ = self
            .console
            .write()
            .expect("logger console handle poisoned")
            .modify(|layer| *layer.filter_mut() = console_filter);
        let _ = self
            .file
            .write()
            .expect("logger file handle poisoned")
            .modify(|layer| match file_prefix {
                Some(prefix) => {
                    *layer.filter_mut() = filter;
                    *layer.inner_mut().writer_mut() = DeferredAppender::new(prefix);
                }
                None => *layer.filter_mut() = LevelFilter::OFF,
            });
    }
}

/// Initializes the global logger on the first call; on this and every later
/// call, re-points the output at either the console (`file_name = None`) or a
/// rolling file with the given prefix, and applies the requested level. The
/// returned value is the level that is now in effect.
pub fn init(minimal_level: Option<Level>, file_name: Option<&str>) -> Level {
    let level = minimal_level.unwrap_or(Level::Warn);
    let router = ROUTER.get_or_init(|| Router::install(file_name.unwrap_or(DEFAULT_LOG_FILE)));
    router.route(level.to_filter(), file_name);
    level
}

/// Emits one log line at the given level. The identifier gives the line its
/// subsystem context, e.g. `"compression"`. Logging before [init] installs a
/// console logger at the default level.
pub fn log<Message: AsRef<str>, Identifier: AsRef<str>>(
    log_level: Level,
    log_identifier: Identifier,
    message: Message,
) {
    if ROUTER.get().is_none() {
        init(Some(Level::Warn), None);
    }
    let identifier = log_identifier.as_ref();
    let message = message.as_ref();
    match log_level {
        Level::Error => event!(tracing::Level::ERROR, "{identifier} - {message}"),
        Level::Warn => event!(tracing::Level::WARN, "{identifier} - {message}"),
        Level::Info => event!(tracing::Level::INFO, "{identifier} - {message}"),
        Level::Debug => event!(tracing::Level::DEBUG, "{identifier} - {message}"),
        Level::Trace => event!(tracing::Level::TRACE, "{identifier} - {message}"),
        Level::Off => (),
    }
}

pub fn log_error<Message: AsRef<str>, Identifier: AsRef<str>>(
    log_identifier: Identifier,
    message: Message,
) {
    log(Level::Error, log_identifier, message)
}

pub fn log_warn<Message: AsRef<str>, Identifier: AsRef<str>>(
    log_identifier: Identifier,
    message: Message,
) {
    log(Level::Warn, log_identifier, message)
}

pub fn log_info<Message: AsRef<str>, Identifier: AsRef<str>>(
    log_identifier: Identifier,
    message: Message,
) {
    log(Level::Info, log_identifier, message)
}

pub fn log_debug<Message: AsRef<str>, Identifier: AsRef<str>>(
    log_identifier: Identifier,
    message: Message,
) {
    log(Level::Debug, log_identifier, message)
}

pub fn log_trace<Message: AsRef<str>, Identifier: AsRef<str>>(
    log_identifier: Identifier,
    message: Message,
) {
    log(Level::Trace, log_identifier, message)
}
