use structopt::clap::AppSettings;
use structopt::StructOpt;

use cmdkit::utils::logging::{report_fatal, LoggingContext};
use cmdkit::utils::prelude::*;
use cmdkit::{Bootstrap, Outcome, RootOptions, Session};

use crate::commands::{self, Cmd};

#[derive(StructOpt)]
#[structopt(
    name = "cmdkit",
    author,
    about,
    global_settings = &[AppSettings::ColoredHelp, AppSettings::VersionlessSubcommands],
    setting = AppSettings::SubcommandRequiredElseHelp
)]
struct Cli {
    #[structopt(flatten)]
    root: RootOptions,

    #[structopt(subcommand)]
    command: Command,
}

#[derive(StructOpt)]
enum Command {
    Config(commands::Config),
}

impl Cmd for Command {
    fn run(self, session: &mut Session<'_>) -> Result<()> {
        match self {
            Command::Config(cmd) => cmd.run(session),
        }
    }
}

/// Parse flags, run the subcommand inside the bootstrap pipeline and return the exit code
pub fn execute(mut logging: LoggingContext) -> i32 {
    let Cli { root, command } = Cli::from_args();

    let outcome = {
        let mut session = Session::new(&root, &mut logging);
        let mut bootstrap = Bootstrap::standard(&root);
        trace!(hooks = ?bootstrap.hook_names(), "Start cli execution");

        bootstrap.run(&mut session, |session| command.run(session))
    };

    match &outcome {
        Outcome::Success => {}
        Outcome::Failed(err) => eprintln!("{}", err),
        Outcome::Fatal(err) => report_fatal(err),
    }

    // flush pending log lines before the process exits
    drop(logging);
    outcome.exit_code()
}
