use clap::Parser;

use warden_daemon::{Args, Daemon};

/// The Warden node daemon
#[tokio::main]
async fn main() {
    // get command line args
    let args = Args::parse();
    // try to load a config file
    let conf = warden::Conf::new(&args.config).expect("Failed to load config");
    // setup our tracer
    warden::utils::trace::setup("WardenDaemon", &conf.tracing);
    // a forced endpoint refresh is a one shot debug run
    if args.debug_refresh {
        Daemon::debug_refresh(conf)
            .await
            .expect("Endpoint refresh failed");
        return;
    }
    // boot the dataplane; an unusable platform is fatal here
    let daemon = Daemon::new(conf).await.expect("Daemon failed to boot");
    // start replaying goal state
    daemon.start().await.expect("Daemon crashed");
}
