//! Sets up tracing for Warden on stdout/stderr

use tracing_subscriber::prelude::*;

use crate::conf::Tracing;

/// Setup our local tracer
///
/// # Arguments
///
/// * `name` - The name of the service to trace
/// * `conf` - The tracing settings from the Warden config
pub fn setup(name: &str, conf: &Tracing) {
    // build our local tracing layer
    let local = tracing_subscriber::fmt::layer().with_filter(conf.level.to_filter());
    // init our tracing registry
    // tests may race to install a subscriber so ignore double inits
    if tracing_subscriber::registry().with(local).try_init().is_ok() {
        tracing::event!(
            tracing::Level::INFO,
            service = name,
            level = %conf.level,
            "tracing to stdout"
        );
    }
}
