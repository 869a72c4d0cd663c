use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    name = "easy-proxies",
    version,
    about = "Multi-mode upstream HTTP proxy aggregator"
)]
pub struct Args {
    /// Path to the YAML config file
    #[arg(short = 'c', long = "config", default_value = "config.yaml")]
    pub config: PathBuf,

    /// Validate the configuration and exit without side effects
    #[arg(long, default_value_t = false)]
    pub check: bool,

    /// Suppress the startup summary
    #[arg(long, default_value_t = false)]
    pub no_banner: bool,
}
