//! The init/finalize pipeline wrapped around every subcommand.
//!
//! [`Bootstrap::standard`] registers, in order:
//!
//! 1. [`ConfigureLogger`], applying `--debug`, `--loglevel` and `--color`
//! 2. [`DiscoverConfig`], loading the config file and environment overrides
//! 3. [`Profiling`], starting the CPU profiler
//!
//! Only [`Profiling`] has work to do after the subcommand returns.

use std::path::PathBuf;

use crate::options::RootOptions;
use crate::profiling::Profiling;
use crate::utils::app_config::AppConfig;
use crate::utils::logging::LoggingContext;
use crate::utils::prelude::*;

/// What hooks and subcommands get to see during one invocation
pub struct Session<'a> {
    pub options: &'a RootOptions,
    pub logging: &'a mut LoggingContext,
    pub config: AppConfig,
}

impl<'a> Session<'a> {
    pub fn new(options: &'a RootOptions, logging: &'a mut LoggingContext) -> Self {
        Self {
            options,
            logging,
            config: AppConfig::new(),
        }
    }
}

/// A step of the pipeline
pub trait Hook {
    fn name(&self) -> &'static str;

    /// Runs before the subcommand body
    fn before(&mut self, _session: &mut Session<'_>) -> Result<()> {
        Ok(())
    }

    /// Runs after the subcommand body, whether it failed or not
    fn after(&mut self, _session: &mut Session<'_>) -> Result<()> {
        Ok(())
    }
}

/// Applies the logging flags
pub struct ConfigureLogger;

impl Hook for ConfigureLogger {
    fn name(&self) -> &'static str {
        "logger"
    }

    fn before(&mut self, session: &mut Session<'_>) -> Result<()> {
        let opts = session.options;
        let level = session
            .logging
            .configure(opts.debug, &opts.log_level, opts.color)?;
        debug!(%level, "Logger configured");
        Ok(())
    }
}

/// Loads `config.{toml,yaml,yml}` and `CMDKIT_*` variables into the session
pub struct DiscoverConfig {
    dirs: Vec<PathBuf>,
}

impl DiscoverConfig {
    pub fn new(dirs: Vec<PathBuf>) -> Self {
        Self { dirs }
    }
}

impl Default for DiscoverConfig {
    fn default() -> Self {
        Self::new(AppConfig::search_paths())
    }
}

impl Hook for DiscoverConfig {
    fn name(&self) -> &'static str {
        "config"
    }

    fn before(&mut self, session: &mut Session<'_>) -> Result<()> {
        session.config = AppConfig::discover(&self.dirs);
        Ok(())
    }
}

/// How an invocation ended
#[derive(Debug)]
pub enum Outcome {
    Success,
    /// The subcommand returned an error
    Failed(Error),
    /// A hook failed; the process must not carry on
    Fatal(Error),
}

impl Outcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            Outcome::Success => 0,
            Outcome::Failed(_) => -1,
            Outcome::Fatal(_) => 1,
        }
    }
}

/// Ordered hooks around a subcommand body
#[derive(Default)]
pub struct Bootstrap {
    hooks: Vec<Box<dyn Hook>>,
}

impl Bootstrap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Logger, then config discovery, then profiling
    pub fn standard(options: &RootOptions) -> Self {
        Self::new()
            .with_hook(ConfigureLogger)
            .with_hook(DiscoverConfig::default())
            .with_hook(Profiling::new(options.profile_dir().map(ToOwned::to_owned)))
    }

    pub fn with_hook<H: Hook + 'static>(mut self, hook: H) -> Self {
        self.hooks.push(Box::new(hook));
        self
    }

    pub fn hook_names(&self) -> Vec<&'static str> {
        self.hooks.iter().map(|hook| hook.name()).collect()
    }

    /// Run every `before`, the body, then every `after`.
    ///
    /// A failing `before` skips the body and the remaining `before`s; only the hooks that
    /// already started get their `after`. `after`s run even when the body fails.
    /// A hook error always wins over a body error.
    pub fn run<F>(&mut self, session: &mut Session<'_>, body: F) -> Outcome
    where
        F: FnOnce(&mut Session<'_>) -> Result<()>,
    {
        for idx in 0..self.hooks.len() {
            let hook = &mut self.hooks[idx];
            trace!(hook = hook.name(), "init");
            if let Err(err) = hook.before(session) {
                // the init error is the one reported
                if let Err(after_err) = self.finalize(idx, session) {
                    warn!(error = %after_err, "finalize failed after init error");
                }
                return Outcome::Fatal(err);
            }
        }

        let result = body(session);

        if let Err(err) = self.finalize(self.hooks.len(), session) {
            return Outcome::Fatal(err);
        }

        match result {
            Ok(()) => Outcome::Success,
            Err(err) => Outcome::Failed(err),
        }
    }

    /// `after` of the first `started` hooks, in order, stopping at the first error
    fn finalize(&mut self, started: usize, session: &mut Session<'_>) -> Result<()> {
        for hook in self.hooks.iter_mut().take(started) {
            trace!(hook = hook.name(), "finalize");
            hook.after(session)?;
        }
        Ok(())
    }
}
