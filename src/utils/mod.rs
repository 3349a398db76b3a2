pub mod app_config;
pub mod color;
pub mod error;
pub mod logging;
pub mod panic;

pub mod prelude {
    pub use super::error::{Error, Fatal, Result};
    pub use super::logging::prelude::*;
}
