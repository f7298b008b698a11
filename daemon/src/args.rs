use clap::Parser;

/// The command line args to pass to the daemon
#[derive(Parser, Debug, Clone)]
#[clap(version, author)]
pub struct Args {
    /// The path to load the config file from
    #[clap(short, long, default_value = "warden.yml")]
    pub config: String,
    /// Force one full endpoint cache refresh and exit
    #[clap(long, default_value_t)]
    pub debug_refresh: bool,
}
