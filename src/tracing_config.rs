//! Tracing configuration for structured logging
//!
//! The library only emits events and spans. Applications install a subscriber,
//! which the CLI does through [`TracingConfig::init`].

#[cfg(feature = "cli")]
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

/// Configuration for tracing output format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TracingFormat {
    /// Human-readable console output with colors (default for CLI)
    Console,
    /// Compact console output for CI environments
    Compact,
    /// JSON structured logging
    #[cfg(feature = "tracing-json")]
    Json,
}

/// Configuration for tracing output destination
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TracingOutput {
    /// Output to stderr (default)
    Console,
    /// Output to a file
    #[cfg(feature = "tracing-files")]
    File(std::path::PathBuf),
    /// Output to both console and file
    #[cfg(feature = "tracing-files")]
    Both(std::path::PathBuf),
}

/// Keeps buffered log writers alive; drop it only after the run has finished
#[derive(Debug, Default)]
#[must_use = "dropping the guard stops buffered file logging"]
pub struct TracingGuard {
    #[cfg(feature = "tracing-files")]
    _file: Option<tracing_appender::non_blocking::WorkerGuard>,
}

/// Tracing configuration builder
#[derive(Debug)]
pub struct TracingConfig {
    /// Verbosity level (maps to log levels)
    pub verbosity: u8,
    pub format: TracingFormat,
    pub output: TracingOutput,
    /// Environment filter string (overrides verbosity if set)
    pub env_filter: Option<String>,
    /// Identifier attached to the run's first event
    pub session_id: Option<String>,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            verbosity: 0,
            format: TracingFormat::Console,
            output: TracingOutput::Console,
            env_filter: None,
            session_id: None,
        }
    }
}

impl TracingConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set verbosity level (0-2+)
    #[must_use]
    pub fn with_verbosity(mut self, verbosity: u8) -> Self {
        self.verbosity = verbosity;
        self
    }

    #[must_use]
    pub fn with_format(mut self, format: TracingFormat) -> Self {
        self.format = format;
        self
    }

    #[must_use]
    pub fn with_output(mut self, output: TracingOutput) -> Self {
        self.output = output;
        self
    }

    /// Set custom environment filter
    #[must_use]
    pub fn with_env_filter<S: Into<String>>(mut self, filter: S) -> Self {
        self.env_filter = Some(filter.into());
        self
    }

    #[must_use]
    pub fn with_session_id<S: Into<String>>(mut self, session_id: S) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Convert verbosity level to tracing filter string
    #[must_use]
    pub fn verbosity_to_filter(&self) -> &'static str {
        match self.verbosity {
            0 => "warn,removebg_batch=info",
            1 => "info,removebg_batch=debug",
            _ => "debug,removebg_batch=trace",
        }
    }

    /// Install the global subscriber
    ///
    /// `log` records from backends are forwarded through the subscriber's log bridge.
    ///
    /// # Errors
    /// - Invalid filter directives
    /// - A global subscriber is already installed
    #[cfg(feature = "cli")]
    pub fn init(self) -> anyhow::Result<TracingGuard> {
        use tracing_subscriber::fmt;

        let filter = match &self.env_filter {
            Some(directives) => EnvFilter::try_new(directives)?,
            None => EnvFilter::try_from_default_env()
                .or_else(|_| EnvFilter::try_new(self.verbosity_to_filter()))?,
        };
        let registry = Registry::default().with(filter);
        #[allow(unused_mut)]
        let mut guard = TracingGuard::default();

        match (&self.format, &self.output) {
            (TracingFormat::Console, TracingOutput::Console) => {
                let fmt_layer = fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_ansi(true)
                    .with_target(false)
                    .with_level(true)
                    .compact();
                registry.with(fmt_layer).try_init()?;
            },

            (TracingFormat::Compact, TracingOutput::Console) => {
                let fmt_layer = fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_ansi(false)
                    .with_target(false)
                    .compact();
                registry.with(fmt_layer).try_init()?;
            },

            #[cfg(feature = "tracing-json")]
            (TracingFormat::Json, TracingOutput::Console) => {
                let fmt_layer = fmt::layer()
                    .json()
                    .with_writer(std::io::stderr)
                    .with_current_span(true)
                    .with_span_list(true);
                registry.with(fmt_layer).try_init()?;
            },

            #[cfg(feature = "tracing-files")]
            (format, TracingOutput::File(path)) => {
                let (file_writer, file_guard) = file_writer(path);
                guard._file = Some(file_guard);

                match format {
                    TracingFormat::Console | TracingFormat::Compact => {
                        let fmt_layer = fmt::layer()
                            .with_ansi(false)
                            .with_writer(file_writer)
                            .compact();
                        registry.with(fmt_layer).try_init()?;
                    },
                    #[cfg(feature = "tracing-json")]
                    TracingFormat::Json => {
                        let fmt_layer = fmt::layer()
                            .json()
                            .with_writer(file_writer)
                            .with_current_span(true)
                            .with_span_list(true);
                        registry.with(fmt_layer).try_init()?;
                    },
                }
            },

            #[cfg(feature = "tracing-files")]
            (_, TracingOutput::Both(path)) => {
                let (file_writer, file_guard) = file_writer(path);
                guard._file = Some(file_guard);

                let console_layer = fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(false)
                    .compact();
                let file_layer = fmt::layer()
                    .with_ansi(false)
                    .with_writer(file_writer)
                    .compact();
                registry.with(console_layer).with(file_layer).try_init()?;
            },
        }

        if let Some(session_id) = &self.session_id {
            tracing::debug!(session_id = %session_id, "Tracing initialized");
        }

        Ok(guard)
    }
}

#[cfg(feature = "tracing-files")]
fn file_writer(
    path: &std::path::Path,
) -> (
    tracing_appender::non_blocking::NonBlocking,
    tracing_appender::non_blocking::WorkerGuard,
) {
    let appender = tracing_appender::rolling::never(
        path.parent().unwrap_or_else(|| std::path::Path::new(".")),
        path.file_name()
            .unwrap_or_else(|| std::ffi::OsStr::new("removebg-batch.log")),
    );
    tracing_appender::non_blocking(appender)
}

/// Install CLI defaults: console output at the given verbosity with a fresh session id
///
/// # Errors
/// - See [`TracingConfig::init`]
#[cfg(feature = "cli")]
pub fn init_cli_tracing(verbosity: u8, json: bool) -> anyhow::Result<TracingGuard> {
    let session_id = uuid::Uuid::new_v4().to_string();
    let mut config = TracingConfig::new()
        .with_verbosity(verbosity)
        .with_session_id(session_id);

    if json {
        #[cfg(feature = "tracing-json")]
        {
            config = config.with_format(TracingFormat::Json);
        }
        #[cfg(not(feature = "tracing-json"))]
        {
            config = config.with_format(TracingFormat::Compact);
        }
    }

    config.init()
}

/// Span constructors used by the pipeline
pub mod spans {
    use std::path::Path;
    use tracing::{Level, Span};

    /// Whole batch run
    pub fn run(input: &Path, output: &Path, workers: usize) -> Span {
        tracing::span!(
            Level::INFO,
            "run",
            input = %input.display(),
            output = %output.display(),
            workers
        )
    }

    /// One worker loop
    pub fn worker(index: usize) -> Span {
        tracing::span!(Level::DEBUG, "worker", index)
    }

    /// One image, identified by its path below the input root
    pub fn task(relative: &Path) -> Span {
        tracing::span!(Level::INFO, "task", path = %relative.display())
    }

    /// One processing stage of a task
    pub fn stage(name: &'static str) -> Span {
        tracing::span!(Level::DEBUG, "stage", stage = name)
    }
}
