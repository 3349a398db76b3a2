use std::path::{Path, PathBuf};

use structopt::StructOpt;

/// Default options that are available to all commands.
#[derive(Debug, Clone, StructOpt)]
pub struct RootOptions {
    /// Log additional information about what the tool is doing. Overrides --loglevel
    #[structopt(long, global = true)]
    pub debug: bool,

    /// Set log level: debug, info, warn, error, fatal or panic
    #[structopt(short = "L", long = "loglevel", default_value = "info", global = true)]
    pub log_level: String,

    /// Enable colorized output. Set to false to disable
    #[structopt(long, default_value = "true", parse(try_from_str), global = true)]
    pub color: bool,

    /// Directory to write pprof profile data to. Only captured if set
    #[structopt(
        long = "profiledir",
        default_value = "",
        parse(from_os_str),
        global = true
    )]
    pub profile_dir: PathBuf,
}

impl Default for RootOptions {
    fn default() -> Self {
        RootOptions::from_iter(std::iter::once(env!("CARGO_PKG_NAME")))
    }
}

impl RootOptions {
    /// The profiling output directory, `None` when profiling is off
    pub fn profile_dir(&self) -> Option<&Path> {
        Some(self.profile_dir.as_path()).filter(|dir| !dir.as_os_str().is_empty())
    }
}
