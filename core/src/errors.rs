//! An error from Warden

/// An error from Warden
#[derive(Debug)]
pub enum Error {
    /// A generic error with a message
    Generic(String),
    /// A transient error that is worth retrying
    Transient(String),
    /// A validation error that must not be retried
    Validation(String),
    /// A feature in a policy that the target platform cannot enforce
    Unsupported(String),
    /// A retrier ran out of attempts
    MaxAttempts(usize),
    /// A retrier was canceled by its stop channel
    Canceled,
    /// A restore file failed even after omitting bad lines
    RestoreFailed {
        /// How many times the file was tried
        tries: usize,
        /// The final stderr from the restore command
        stderr: String,
    },
    /// An endpoint is already claimed by a different pod
    EndpointMismatch {
        /// The IP of the contested endpoint
        ip: String,
        /// The pod key the endpoint is currently bound to
        bound: String,
        /// The pod key that tried to claim the endpoint
        claim: String,
    },
    /// An IO Error
    IO(std::io::Error),
    /// An error from converting a value with serde
    Serde(serde_json::Error),
    /// An error from converting a value with serde to YAML
    SerdeYaml(serde_yaml::Error),
    /// An error from loading a config
    Config(config::ConfigError),
    /// An error from using a regex
    Regex(regex::Error),
    /// An error from parsing an IP CIDR
    CidrParse(cidr::errors::NetworkParseError),
    /// An error from parsing an IP address
    AddrParse(std::net::AddrParseError),
    /// An error from parsing an int
    ParseInt(std::num::ParseIntError),
    /// An error from joining a tokio task
    JoinError(tokio::task::JoinError),
    /// An error from sending on a closed channel
    ChannelSend(String),
    /// An error from the k8s client
    #[cfg(feature = "k8s")]
    K8s(kube::Error),
    /// An error from getting a k8s config
    #[cfg(feature = "k8s")]
    K8sConfig(kube::config::KubeconfigError),
    /// An error from a k8s watch stream
    #[cfg(feature = "k8s")]
    K8sWatch(kube::runtime::watcher::Error),
}

impl Error {
    /// Create a new generic error
    ///
    /// # Arguments
    ///
    /// * `msg` - The error message to set
    pub fn new<T: Into<String>>(msg: T) -> Self {
        Error::Generic(msg.into())
    }

    /// Create a new transient error that the retrier will retry
    ///
    /// # Arguments
    ///
    /// * `msg` - The error message to set
    pub fn transient<T: Into<String>>(msg: T) -> Self {
        Error::Transient(msg.into())
    }

    /// Create a new validation error that must not be retried
    ///
    /// # Arguments
    ///
    /// * `msg` - The error message to set
    pub fn validation<T: Into<String>>(msg: T) -> Self {
        Error::Validation(msg.into())
    }

    /// Create a new error for a policy feature the platform cannot enforce
    ///
    /// # Arguments
    ///
    /// * `msg` - The error message to set
    pub fn unsupported<T: Into<String>>(msg: T) -> Self {
        Error::Unsupported(msg.into())
    }

    /// Whether this error is worth retrying
    ///
    /// Transient IO problems (iptables lock contention, a busy platform API, a
    /// dropped watch) are retried under a cooldown. Everything else is
    /// returned to the caller immediately.
    pub fn is_temporary(&self) -> bool {
        match self {
            Error::Transient(_) => true,
            Error::IO(_) => true,
            #[cfg(feature = "k8s")]
            Error::K8s(err) => matches!(err, kube::Error::HyperError(_) | kube::Error::Service(_)),
            #[cfg(feature = "k8s")]
            Error::K8sWatch(_) => true,
            _ => false,
        }
    }

    /// Whether this error is permanent and should be forgotten instead of requeued
    pub fn is_permanent(&self) -> bool {
        matches!(self, Error::Validation(_) | Error::Unsupported(_))
    }

    /// Get the error message for this error if one exists
    pub fn msg(&self) -> Option<String> {
        // get the msg from any error types that support it
        match self {
            Error::Generic(msg) => Some(msg.clone()),
            Error::Transient(msg) => Some(msg.clone()),
            Error::Validation(msg) => Some(msg.clone()),
            Error::Unsupported(msg) => Some(msg.clone()),
            Error::MaxAttempts(attempts) => Some(format!("gave up after {attempts} attempts")),
            Error::Canceled => Some("canceled by stop channel".to_owned()),
            Error::RestoreFailed { tries, stderr } => {
                Some(format!("restore file failed after {tries} tries: {stderr}"))
            }
            Error::EndpointMismatch { ip, bound, claim } => Some(format!(
                "endpoint at {ip} is bound to pod {bound} but {claim} tried to claim it"
            )),
            Error::IO(err) => Some(err.to_string()),
            Error::Serde(err) => Some(err.to_string()),
            Error::SerdeYaml(err) => Some(err.to_string()),
            Error::Config(err) => Some(err.to_string()),
            Error::Regex(err) => Some(err.to_string()),
            Error::CidrParse(err) => Some(err.to_string()),
            Error::AddrParse(err) => Some(err.to_string()),
            Error::ParseInt(err) => Some(err.to_string()),
            Error::JoinError(err) => Some(err.to_string()),
            Error::ChannelSend(msg) => Some(msg.clone()),
            #[cfg(feature = "k8s")]
            Error::K8s(err) => Some(err.to_string()),
            #[cfg(feature = "k8s")]
            Error::K8sConfig(err) => Some(err.to_string()),
            #[cfg(feature = "k8s")]
            Error::K8sWatch(err) => Some(err.to_string()),
        }
    }

    /// get the kind of error as a str
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Generic(_) => "Generic",
            Error::Transient(_) => "Transient",
            Error::Validation(_) => "Validation",
            Error::Unsupported(_) => "Unsupported",
            Error::MaxAttempts(_) => "MaxAttempts",
            Error::Canceled => "Canceled",
            Error::RestoreFailed { .. } => "RestoreFailed",
            Error::EndpointMismatch { .. } => "EndpointMismatch",
            Error::IO(_) => "IO",
            Error::Serde(_) => "Serde",
            Error::SerdeYaml(_) => "SerdeYaml",
            Error::Config(_) => "Config",
            Error::Regex(_) => "Regex",
            Error::CidrParse(_) => "CidrParse",
            Error::AddrParse(_) => "AddrParse",
            Error::ParseInt(_) => "ParseInt",
            Error::JoinError(_) => "JoinError",
            Error::ChannelSend(_) => "ChannelSend",
            #[cfg(feature = "k8s")]
            Error::K8s(_) => "K8s",
            #[cfg(feature = "k8s")]
            Error::K8sConfig(_) => "K8sConf",
            #[cfg(feature = "k8s")]
            Error::K8sWatch(_) => "K8sWatch",
        }
    }
}

impl std::fmt::Display for Error {
    /// display this error in a easy readable format
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self.msg() {
            Some(msg) => write!(f, "{}: {}", self.kind(), msg),
            None => write!(f, "Kind: {}", self.kind()),
        }
    }
}

// mark that this is an error struct
impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        Error::IO(error)
    }
}

impl From<serde_json::Error> for Error {
    fn from(error: serde_json::Error) -> Self {
        Error::Serde(error)
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(error: serde_yaml::Error) -> Self {
        Error::SerdeYaml(error)
    }
}

impl From<config::ConfigError> for Error {
    fn from(error: config::ConfigError) -> Self {
        Error::Config(error)
    }
}

impl From<regex::Error> for Error {
    fn from(error: regex::Error) -> Self {
        Error::Regex(error)
    }
}

impl From<cidr::errors::NetworkParseError> for Error {
    fn from(error: cidr::errors::NetworkParseError) -> Self {
        Error::CidrParse(error)
    }
}

impl From<std::net::AddrParseError> for Error {
    fn from(error: std::net::AddrParseError) -> Self {
        Error::AddrParse(error)
    }
}

impl From<std::num::ParseIntError> for Error {
    fn from(error: std::num::ParseIntError) -> Self {
        Error::ParseInt(error)
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(error: tokio::task::JoinError) -> Self {
        Error::JoinError(error)
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
    fn from(error: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Error::ChannelSend(error.to_string())
    }
}

#[cfg(feature = "k8s")]
impl From<kube::Error> for Error {
    fn from(error: kube::Error) -> Self {
        Error::K8s(error)
    }
}

#[cfg(feature = "k8s")]
impl From<kube::config::KubeconfigError> for Error {
    fn from(error: kube::config::KubeconfigError) -> Self {
        Error::K8sConfig(error)
    }
}

#[cfg(feature = "k8s")]
impl From<kube::runtime::watcher::Error> for Error {
    fn from(error: kube::runtime::watcher::Error) -> Self {
        Error::K8sWatch(error)
    }
}
