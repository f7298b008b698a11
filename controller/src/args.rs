use clap::Parser;

/// How the controllers reach a dataplane
#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// Program this node's dataplane in process
    #[default]
    Direct,
    /// Stream goal state deltas to remote node daemons
    Remote,
}

impl std::fmt::Display for Mode {
    /// Allow the mode to be displayed for clap defaults
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Mode::Direct => write!(f, "direct"),
            Mode::Remote => write!(f, "remote"),
        }
    }
}

/// The command line args to pass to the controller
#[derive(Parser, Debug, Clone)]
#[clap(version, author)]
pub struct Args {
    /// The path to load the config file from
    #[clap(short, long, default_value = "warden.yml")]
    pub config: String,
    /// Whether to program the local dataplane or remote daemons
    #[clap(short, long, value_enum, default_value_t, ignore_case = true)]
    pub mode: Mode,
}
