use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Misconfiguration that must terminate the process
    #[error(transparent)]
    ConfigurationFatal(#[from] Fatal),
    #[error(transparent)]
    InvalidConfig(#[from] config::ConfigError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Others(#[from] anyhow::Error),
}

/// Fail-fast conditions raised by the bootstrap hooks.
#[derive(Error, Debug)]
pub enum Fatal {
    #[error("invalid log level: {0}")]
    InvalidLogLevel(String),
    #[error("could not create CPU profile: {0}")]
    CpuProfileCreate(#[source] std::io::Error),
    #[error("could not create CPU profile: {0}")]
    CpuProfileStart(#[source] pprof::Error),
    #[error("could not write CPU profile: {0}")]
    CpuProfileWrite(#[source] anyhow::Error),
    #[error("could not write memory profile: {0}")]
    HeapProfileCreate(#[source] std::io::Error),
    #[error("could not write memory profile: {0}")]
    HeapProfileWrite(#[source] std::io::Error),
}

impl Error {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::ConfigurationFatal(_))
    }
}

/// A type alias that forces the usage of the custom error type.
pub type Result<T> = std::result::Result<T, Error>;

impl From<tracing_subscriber::util::TryInitError> for Error {
    fn from(err: tracing_subscriber::util::TryInitError) -> Self {
        Self::Others(anyhow::Error::from(err))
    }
}

impl From<tracing_subscriber::reload::Error> for Error {
    fn from(err: tracing_subscriber::reload::Error) -> Self {
        Self::Others(anyhow::Error::from(err))
    }
}
