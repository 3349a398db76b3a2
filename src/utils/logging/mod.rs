use std::fmt;
use std::io;
use std::str::FromStr;

use tracing::field::{Field, Visit};
use tracing::subscriber::Interest;
use tracing::{Level, Metadata};
use tracing_appender::non_blocking::{NonBlocking, NonBlockingBuilder, WorkerGuard};
use tracing_subscriber::field::{MakeVisitor, VisitFmt, VisitOutput};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::time::FormatTime;
use tracing_subscriber::fmt::Layer as FmtLayer;
use tracing_subscriber::layer::{Context, Layered};
use tracing_subscriber::{prelude::*, registry::Registry, reload, Layer};

use super::color::{colorize, no_color_env, BOLD, RED};
use super::error::{Fatal, Result};

pub mod prelude {
    pub use tracing::{debug, error, info, trace, warn};
    pub use tracing::{debug_span, error_span, info_span, trace_span, warn_span};
    pub use tracing::{event, field::Empty, instrument, span};
}

type FilteredRegistry = Layered<reload::Layer<SeverityFilter, Registry>, Registry>;
type OutputLayer = Box<dyn Layer<FilteredRegistry> + Send + Sync>;

/// The subscriber a [`LoggingContext`] controls
pub type Subscriber = Layered<reload::Layer<OutputLayer, FilteredRegistry>, FilteredRegistry>;

/// Severity levels accepted by `--loglevel`, least severe first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
    Panic,
}

impl LogLevel {
    pub const ALL: [LogLevel; 6] = [
        LogLevel::Debug,
        LogLevel::Info,
        LogLevel::Warn,
        LogLevel::Error,
        LogLevel::Fatal,
        LogLevel::Panic,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
            LogLevel::Fatal => "fatal",
            LogLevel::Panic => "panic",
        }
    }

    /// Coarsest `tracing` filter admitting this level. `tracing` stops at ERROR, so the
    /// two most severe levels share it; [`SeverityFilter`] tells them apart.
    pub fn to_filter(self) -> LevelFilter {
        match self {
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Error | LogLevel::Fatal | LogLevel::Panic => LevelFilter::ERROR,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = Fatal;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        LogLevel::ALL
            .iter()
            .copied()
            .find(|level| level.as_str() == s)
            .ok_or_else(|| Fatal::InvalidLogLevel(s.to_owned()))
    }
}

/// Marker field of events logged at `fatal` severity, see [`report_fatal`]
pub const FATAL_FIELD: &str = "fatal";
/// Marker field of events logged at `panic` severity
pub const PANIC_FIELD: &str = "panic";

/// Log `err` at `fatal` severity: an ERROR event carrying the `fatal` marker.
pub fn report_fatal(err: &dyn fmt::Display) {
    tracing::error!(fatal = true, "{}", err);
}

/// Admits events at or above a [`LogLevel`].
///
/// Up to `error` this is a plain level comparison. `fatal` and `panic` only
/// admit ERROR events carrying their marker field (or a more severe one).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeverityFilter(LogLevel);

impl SeverityFilter {
    pub fn new(level: LogLevel) -> Self {
        SeverityFilter(level)
    }

    pub fn admits(&self, metadata: &Metadata<'_>) -> bool {
        if self.0.to_filter() < *metadata.level() {
            return false;
        }
        let has = |name: &str| metadata.fields().field(name).is_some();
        match self.0 {
            LogLevel::Fatal => {
                *metadata.level() == Level::ERROR && (has(FATAL_FIELD) || has(PANIC_FIELD))
            }
            LogLevel::Panic => *metadata.level() == Level::ERROR && has(PANIC_FIELD),
            _ => true,
        }
    }
}

impl<S: tracing::Subscriber> Layer<S> for SeverityFilter {
    fn register_callsite(&self, metadata: &'static Metadata<'static>) -> Interest {
        if self.admits(metadata) {
            Interest::always()
        } else {
            Interest::never()
        }
    }

    fn enabled(&self, metadata: &Metadata<'_>, _ctx: Context<'_, S>) -> bool {
        self.admits(metadata)
    }

    fn max_level_hint(&self) -> Option<LevelFilter> {
        Some(self.0.to_filter())
    }
}

/// Pick the active level. `debug` wins before `name` is even looked at.
pub fn resolve_level(debug: bool, name: &str) -> Result<LogLevel> {
    if debug {
        return Ok(LogLevel::Debug);
    }
    Ok(name.parse()?)
}

/// Flatten escaped tabs and newlines so an error stays on one line.
pub fn format_error_value(value: &str) -> String {
    value
        .replace("\\t", " ")
        .replace("\\n", " | ")
        .replace("|  |", "|")
}

/// Cleaned error text, bold then red.
pub fn render_error_field(value: &str, color: bool) -> String {
    let cleaned = format_error_value(value);
    colorize(colorize(cleaned, BOLD, !color), RED, !color)
}

/// Owns the reload handles of the process subscriber and the log writer.
///
/// Dropping it flushes pending log lines, so it needs to be held in main.
pub struct LoggingContext {
    writer: NonBlocking,
    _guard: WorkerGuard,
    filter_handle: reload::Handle<SeverityFilter, Registry>,
    output_handle: reload::Handle<OutputLayer, FilteredRegistry>,
    level: LogLevel,
}

impl LoggingContext {
    /// Install a subscriber writing to stderr as the global default
    pub fn install() -> Result<Self> {
        let (subscriber, ctx) = Self::new(io::stderr());
        subscriber.try_init()?;
        Ok(ctx)
    }

    /// A subscriber writing to `out`, not yet installed anywhere
    pub fn new<W>(out: W) -> (Subscriber, Self)
    where
        W: io::Write + Send + Sync + 'static,
    {
        let (writer, guard) = NonBlockingBuilder::default().lossy(false).finish(out);

        let level = LogLevel::Info;
        let (filter, filter_handle) = reload::Layer::new(SeverityFilter::new(level));
        let (output, output_handle) = reload::Layer::new(output_layer(writer.clone(), true));
        let subscriber = Registry::default().with(filter).with(output);

        let ctx = LoggingContext {
            writer,
            _guard: guard,
            filter_handle,
            output_handle,
            level,
        };
        (subscriber, ctx)
    }

    /// Swap in a new level and console writer. Calling it again replaces the previous setup.
    pub fn configure(&mut self, debug: bool, level: &str, color: bool) -> Result<LogLevel> {
        let level = resolve_level(debug, level)?;

        self.filter_handle.reload(SeverityFilter::new(level))?;
        self.output_handle
            .reload(output_layer(self.writer.clone(), color))?;
        self.level = level;

        Ok(level)
    }

    pub fn level(&self) -> LogLevel {
        self.level
    }
}

fn output_layer(writer: NonBlocking, color: bool) -> OutputLayer {
    FmtLayer::default()
        .with_ansi(color && !no_color_env())
        .with_target(false)
        .with_timer(ISOTimeFormat)
        .fmt_fields(ConsoleFields { color })
        .with_writer(writer)
        .boxed()
}

struct ISOTimeFormat;

impl FormatTime for ISOTimeFormat {
    fn format_time(&self, w: &mut Writer<'_>) -> fmt::Result {
        write!(w, "{}", chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"))
    }
}

// ====== Field formatting ======

fn is_error_field(field: &Field) -> bool {
    matches!(field.name(), "error" | "err")
}

/// Field formatter that routes `error`/`err` fields through [`render_error_field`]
struct ConsoleFields {
    color: bool,
}

impl<'a> MakeVisitor<Writer<'a>> for ConsoleFields {
    type Visitor = ConsoleVisitor<'a>;

    fn make_visitor(&self, target: Writer<'a>) -> Self::Visitor {
        ConsoleVisitor {
            writer: target,
            color: self.color,
            is_empty: true,
            result: Ok(()),
        }
    }
}

struct ConsoleVisitor<'a> {
    writer: Writer<'a>,
    color: bool,
    is_empty: bool,
    result: fmt::Result,
}

impl ConsoleVisitor<'_> {
    fn write_field(&mut self, field: &Field, value: fmt::Arguments<'_>) {
        if self.result.is_err() {
            return;
        }
        let delim = if self.is_empty { "" } else { " " };
        self.is_empty = false;
        self.result = if field.name() == "message" {
            write!(self.writer, "{}{}", delim, value)
        } else {
            write!(self.writer, "{}{}={}", delim, field.name(), value)
        };
    }

    fn write_error(&mut self, field: &Field, rendered: &str) {
        let value = render_error_field(rendered, self.color);
        self.write_field(field, format_args!("{}", value));
    }
}

impl Visit for ConsoleVisitor<'_> {
    fn record_str(&mut self, field: &Field, value: &str) {
        if is_error_field(field) {
            self.write_error(field, value);
        } else if field.name() == "message" {
            self.write_field(field, format_args!("{}", value));
        } else {
            self.write_field(field, format_args!("{:?}", value));
        }
    }

    fn record_error(&mut self, field: &Field, value: &(dyn std::error::Error + 'static)) {
        self.write_error(field, &value.to_string());
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if is_error_field(field) {
            self.write_error(field, &format!("{:?}", value));
        } else {
            self.write_field(field, format_args!("{:?}", value));
        }
    }
}

impl VisitOutput<fmt::Result> for ConsoleVisitor<'_> {
    fn finish(self) -> fmt::Result {
        self.result
    }
}

impl VisitFmt for ConsoleVisitor<'_> {
    fn writer(&mut self) -> &mut dyn fmt::Write {
        &mut self.writer
    }
}
