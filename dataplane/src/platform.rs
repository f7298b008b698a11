//! Builds the platform backend a process should program

use warden::Error;
use warden::conf::{Conf, Platform};

use crate::dataplane::Backend;
use crate::restore::ExecRunner;

/// Build the backend for this process's configured platform
///
/// On Windows this waits for the configured HNS network to appear, retrying
/// for up to the configured bootup window before giving up; the caller treats
/// that as fatal.
///
/// # Arguments
///
/// * `conf` - The Warden config
pub async fn backend_from_conf(conf: &Conf) -> Result<Backend, Error> {
    match conf.platform {
        Platform::Linux => Ok(Backend::linux(Box::new(ExecRunner), conf.linux.clone())),
        Platform::Windows => {
            cfg_if::cfg_if! {
                if #[cfg(windows)] {
                    use std::time::Duration;
                    use tokio::sync::watch;
                    use warden::utils::{self, CooldownFactory};
                    use crate::hns::{Hns, HcnClient};

                    let hns = HcnClient::new();
                    // poll for the network until the bootup window runs out
                    let attempts = (conf.windows.network_wait / 5).max(1) as usize;
                    let factory = CooldownFactory::max(
                        attempts,
                        CooldownFactory::Fixed(Duration::from_secs(5)),
                    );
                    let (_keep, mut stop) = watch::channel(false);
                    let network = utils::retry(&mut stop, &factory, || {
                        hns.get_network_by_name(&conf.windows.network_name)
                    })
                    .await?;
                    Ok(Backend::windows(Box::new(hns), network, conf.windows.clone()))
                } else {
                    Err(Error::new(format!(
                        "platform {} requires a Windows build",
                        conf.platform
                    )))
                }
            }
        }
    }
}
