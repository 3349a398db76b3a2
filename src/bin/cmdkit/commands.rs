use anyhow::anyhow;
use structopt::StructOpt;

use cmdkit::utils::prelude::*;
use cmdkit::Session;

/// Should be implemented by individual subcommand
pub trait Cmd {
    fn run(self, session: &mut Session<'_>) -> Result<()>;
}

/// Show the configuration
#[derive(StructOpt)]
pub struct Config {
    /// Print a single key (dotted path) instead of the whole configuration
    #[structopt(long, value_name = "KEY")]
    get: Option<String>,
}

impl Cmd for Config {
    fn run(self, session: &mut Session<'_>) -> Result<()> {
        let config = &session.config;
        match config.source() {
            Some(path) => debug!(path = %path.display(), "Showing configuration"),
            None => debug!("No config file found, showing environment overrides only"),
        }

        let out = match self.get {
            Some(key) => {
                let value: serde_yaml::Value = config
                    .get(&key)
                    .map_err(|_| anyhow!("configuration key not found: {}", key))?;
                serde_yaml::to_string(&value).map_err(anyhow::Error::from)?
            }
            None => serde_yaml::to_string(&config.values()?).map_err(anyhow::Error::from)?,
        };
        print!("{}", out);

        Ok(())
    }
}
