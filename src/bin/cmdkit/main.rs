use cmdkit::heap::TrackingAllocator;
use cmdkit::utils;
use cmdkit::utils::logging::LoggingContext;

mod cli;
mod commands;

#[global_allocator]
static GLOBAL: TrackingAllocator = TrackingAllocator::new();

fn main() {
    // panic setup should be done early
    utils::panic::setup();

    // basic logging setup, reconfigured from flags once they are parsed
    let logging = match LoggingContext::install() {
        Ok(logging) => logging,
        Err(err) => {
            eprintln!("{}", err);
            std::process::exit(1);
        }
    };

    // the logging context is gone by now, so nothing is left unflushed
    std::process::exit(cli::execute(logging));
}
