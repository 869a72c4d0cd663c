//! easy-proxies — entrypoint.
//!
//! Load config, initialise tracing, hand off to the bootstrap supervisor.
//! Exit code 0 on clean shutdown, 1 on config error or start failure.

mod bootstrap;
mod cli;
mod logging;

use clap::Parser;

#[tokio::main]
async fn main() {
    let args = cli::Args::parse();

    // pre-initialise with defaults so config load errors are visible
    logging::init("info");

    let cfg = match ep_config::Config::load(&args.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::error!(config = %args.config.display(), error = %e, "load config");
            std::process::exit(1);
        }
    };
    logging::set_level(&cfg.log_level);

    if let Err(e) = bootstrap::run(args, cfg).await {
        eprintln!("easy-proxies exited with error: {e:#}");
        std::process::exit(1);
    }
}
