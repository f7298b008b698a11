use clap::Parser;

use warden_controller::{Args, Supervisor};

/// The Warden controller
#[tokio::main]
async fn main() {
    // install a crypto provider for rustls
    // Rustls will complain if this is not run but we can ignore any errors
    let _ = rustls::crypto::ring::default_provider().install_default();
    // get command line args
    let args = Args::parse();
    // try to load a config file
    let conf = warden::Conf::new(&args.config).expect("Failed to load config");
    // setup our tracer
    warden::utils::trace::setup("WardenController", &conf.tracing);
    // setup the supervisor
    let supervisor = Supervisor::new(args, conf)
        .await
        .expect("Controller failed to initialize");
    // start the controllers
    supervisor.start().await.expect("Controller crashed");
}
