//! Bootstrap for command-line tools: persistent flags, logger setup, config
//! discovery and opt-in CPU/heap profiling, run as an ordered pipeline of hooks
//! around each subcommand.

pub mod bootstrap;
pub mod heap;
pub mod options;
pub mod profiling;
pub mod utils;

pub use bootstrap::{Bootstrap, Hook, Outcome, Session};
pub use options::RootOptions;
pub use utils::prelude::{Error, Fatal, Result};
