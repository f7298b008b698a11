//! The shared config for Warden

use schemars::JsonSchema;

use crate::Error;

/// Helps serde default the iptables path
fn default_iptables() -> String {
    "iptables".to_owned()
}

/// Helps serde default the iptables-restore path
fn default_iptables_restore() -> String {
    "iptables-restore".to_owned()
}

/// Helps serde default the ipset path
fn default_ipset() -> String {
    "ipset".to_owned()
}

/// Helps serde default the xtables lock timeout to 60 seconds
fn default_lock_timeout() -> u64 {
    60
}

/// Helps serde default how many times a restore file is retried
fn default_max_try_count() -> usize {
    3
}

/// The Linux side of the dataplane config
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, JsonSchema)]
pub struct LinuxConf {
    /// The path to the iptables binary
    #[serde(default = "default_iptables")]
    pub iptables: String,
    /// The path to the iptables-restore binary
    #[serde(default = "default_iptables_restore")]
    pub iptables_restore: String,
    /// The path to the ipset binary
    #[serde(default = "default_ipset")]
    pub ipset: String,
    /// How many seconds to wait on the xtables lock
    #[serde(default = "default_lock_timeout")]
    pub lock_timeout: u64,
    /// How many times to retry a restore file before giving up
    #[serde(default = "default_max_try_count")]
    pub max_try_count: usize,
}

impl Default for LinuxConf {
    /// Create a default Linux dataplane config
    fn default() -> Self {
        LinuxConf {
            iptables: default_iptables(),
            iptables_restore: default_iptables_restore(),
            ipset: default_ipset(),
            lock_timeout: default_lock_timeout(),
            max_try_count: default_max_try_count(),
        }
    }
}

/// Helps serde default the HNS network name
fn default_network_name() -> String {
    "azure".to_owned()
}

/// Helps serde default how long to keep stale pod keys to 10 minutes
fn default_stale_pod_key_minutes() -> i64 {
    10
}

/// Helps serde default how long to wait for the HNS network to 20 minutes
fn default_network_wait_secs() -> u64 {
    1200
}

/// The policy modes HNS can run SetPolicies in
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, JsonSchema)]
pub enum PolicyMode {
    /// Match traffic by IP set membership
    IpSet,
    /// Match traffic by vfp port ranges (not supported)
    PortRange,
}

impl Default for PolicyMode {
    /// Default the policy mode to IP sets
    fn default() -> Self {
        PolicyMode::IpSet
    }
}

/// The Windows side of the dataplane config
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, JsonSchema)]
pub struct WindowsConf {
    /// The name of the HNS network to program
    #[serde(default = "default_network_name")]
    pub network_name: String,
    /// The SetPolicy mode to require from HNS
    #[serde(default)]
    pub policy_mode: PolicyMode,
    /// How many minutes to keep a stale pod key on an endpoint
    #[serde(default = "default_stale_pod_key_minutes")]
    pub stale_pod_key_minutes: i64,
    /// How many seconds to wait for the HNS network to appear at bootup
    #[serde(default = "default_network_wait_secs")]
    pub network_wait: u64,
}

impl Default for WindowsConf {
    /// Create a default Windows dataplane config
    fn default() -> Self {
        WindowsConf {
            network_name: default_network_name(),
            policy_mode: PolicyMode::default(),
            stale_pod_key_minutes: default_stale_pod_key_minutes(),
            network_wait: default_network_wait_secs(),
        }
    }
}

/// Helps serde default the base requeue delay to 500ms
fn default_requeue_base_ms() -> u64 {
    500
}

/// Helps serde default the max requeue delay to 5 minutes
fn default_requeue_max_secs() -> u64 {
    300
}

/// Helps serde default the reconcile tick to 5 minutes
fn default_reconcile_secs() -> u64 {
    300
}

/// The controller side config
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, JsonSchema)]
pub struct ControllerConf {
    /// The base delay in milliseconds for rate limited requeues
    #[serde(default = "default_requeue_base_ms")]
    pub requeue_base_ms: u64,
    /// The max delay in seconds for rate limited requeues
    #[serde(default = "default_requeue_max_secs")]
    pub requeue_max_secs: u64,
    /// How many seconds between background reconcile ticks
    #[serde(default = "default_reconcile_secs")]
    pub reconcile: u64,
}

impl Default for ControllerConf {
    /// Create a default controller config
    fn default() -> Self {
        ControllerConf {
            requeue_base_ms: default_requeue_base_ms(),
            requeue_max_secs: default_requeue_max_secs(),
            reconcile: default_reconcile_secs(),
        }
    }
}

/// Helps serde default the goal state listen address
fn default_listen() -> String {
    "0.0.0.0:10091".to_owned()
}

/// Helps serde default the goal state connect address
fn default_connect() -> String {
    "127.0.0.1:10091".to_owned()
}

/// Helps serde default the retry channel depth
fn default_retry_depth() -> usize {
    256
}

/// Where the goal state channel listens and dials
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, JsonSchema)]
pub struct GoalStateConf {
    /// The address the controller listens for daemons on
    #[serde(default = "default_listen")]
    pub listen: String,
    /// The address daemons dial the controller at
    #[serde(default = "default_connect")]
    pub connect: String,
    /// How many failed events the daemon retry channel can hold
    #[serde(default = "default_retry_depth")]
    pub retry_depth: usize,
}

impl Default for GoalStateConf {
    /// Create a default goal state channel config
    fn default() -> Self {
        GoalStateConf {
            listen: default_listen(),
            connect: default_connect(),
            retry_depth: default_retry_depth(),
        }
    }
}

/// The log levels Warden can log at
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, JsonSchema)]
pub enum LogLevel {
    /// Do not log any info
    Off,
    /// Log at the error level
    Error,
    /// Log at the warning level
    Warn,
    /// Log at the info level
    Info,
    /// Log at the debug level
    Debug,
    /// Log at the tracing level
    Trace,
}

/// Default the log level to Info
impl Default for LogLevel {
    /// Set the default log level to info
    fn default() -> Self {
        LogLevel::Info
    }
}

impl LogLevel {
    /// Cast this log level to a tracing filter
    #[must_use]
    pub fn to_filter(&self) -> tracing::metadata::LevelFilter {
        match self {
            LogLevel::Off => tracing_subscriber::filter::LevelFilter::OFF,
            LogLevel::Error => tracing_subscriber::filter::LevelFilter::ERROR,
            LogLevel::Warn => tracing_subscriber::filter::LevelFilter::WARN,
            LogLevel::Info => tracing_subscriber::filter::LevelFilter::INFO,
            LogLevel::Debug => tracing_subscriber::filter::LevelFilter::DEBUG,
            LogLevel::Trace => tracing_subscriber::filter::LevelFilter::TRACE,
        }
    }
}

impl std::fmt::Display for LogLevel {
    /// Allow the log level to be displayed
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            LogLevel::Off => write!(f, "Off"),
            LogLevel::Error => write!(f, "Error"),
            LogLevel::Warn => write!(f, "Warn"),
            LogLevel::Info => write!(f, "Info"),
            LogLevel::Debug => write!(f, "Debug"),
            LogLevel::Trace => write!(f, "Trace"),
        }
    }
}

/// The local tracing settings
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, JsonSchema)]
pub struct Tracing {
    /// The level to log to stdout at
    #[serde(default)]
    pub level: LogLevel,
}

/// The platform whose firewall this node programs
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, JsonSchema)]
pub enum Platform {
    /// Program ipset and iptables on Linux
    Linux,
    /// Program SetPolicies and endpoint ACLs through HNS on Windows
    Windows,
}

impl Default for Platform {
    /// Default the platform to whatever this binary was built for
    fn default() -> Self {
        cfg_if::cfg_if! {
            if #[cfg(windows)] {
                Platform::Windows
            } else {
                Platform::Linux
            }
        }
    }
}

impl std::fmt::Display for Platform {
    /// Allow the platform to be displayed
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Platform::Linux => write!(f, "Linux"),
            Platform::Windows => write!(f, "Windows"),
        }
    }
}

/// Helps serde default the node name from the environment
fn default_node_name() -> String {
    std::env::var("NODE_NAME").unwrap_or_default()
}

/// The Warden config
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, JsonSchema)]
pub struct Conf {
    /// The name of the node this process runs on
    #[serde(default = "default_node_name")]
    pub node_name: String,
    /// The platform to program
    #[serde(default)]
    pub platform: Platform,
    /// The Linux dataplane settings
    #[serde(default)]
    pub linux: LinuxConf,
    /// The Windows dataplane settings
    #[serde(default)]
    pub windows: WindowsConf,
    /// The controller settings
    #[serde(default)]
    pub controller: ControllerConf,
    /// The goal state channel settings
    #[serde(default)]
    pub goal_state: GoalStateConf,
    /// The tracing settings
    #[serde(default)]
    pub tracing: Tracing,
}

impl Conf {
    /// Load a config from a YAML file, letting the environment override it
    ///
    /// # Arguments
    ///
    /// * `path` - The path to load the config file from
    pub fn new(path: &str) -> Result<Self, Error> {
        // build our config sources
        let conf = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(config::Environment::with_prefix("WARDEN").separator("__"))
            .build()?;
        // deserialize the assembled config
        let conf = conf.try_deserialize()?;
        Ok(conf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        // an empty config should come out with usable defaults
        let conf: Conf = serde_yaml::from_str("{}").unwrap();
        assert_eq!(conf.linux.lock_timeout, 60);
        assert_eq!(conf.windows.stale_pod_key_minutes, 10);
        assert_eq!(conf.windows.network_name, "azure");
        assert_eq!(conf.windows.policy_mode, PolicyMode::IpSet);
        assert_eq!(conf.controller.requeue_base_ms, 500);
        assert_eq!(conf.tracing.level, LogLevel::Info);
    }
}
