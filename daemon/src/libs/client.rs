//! Dials the controller and feeds its event frames to the processor
//!
//! Frames are a little endian u32 length followed by a JSON encoded
//! [`Events`] message. Every reconnect lands on a fresh registration, so the
//! controller hydrates us before any delta arrives.

use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tracing::{Level, event};

use warden::Error;
use warden::models::Events;
use warden::utils::{CooldownFactory, retry};

/// The largest frame we will accept from the controller
const MAX_FRAME: usize = 64 * 1024 * 1024;

/// Keep the daemon connected to the controller until stopped
///
/// # Arguments
///
/// * `connect` - The controller address to dial
/// * `inbound` - The processor's inbound channel
/// * `stop` - The channel the caller shuts us down through
pub async fn run(
    connect: String,
    inbound: mpsc::Sender<Events>,
    mut stop: watch::Receiver<bool>,
) -> Result<(), Error> {
    let factory = CooldownFactory::exponential(Duration::from_millis(500), 2);
    loop {
        if *stop.borrow() {
            return Ok(());
        }
        // dial under backoff; each loop gets a fresh cooldown sequence
        let socket = match retry(&mut stop, &factory, || async {
            TcpStream::connect(&connect).await.map_err(Error::from)
        })
        .await
        {
            Ok(socket) => socket,
            Err(Error::Canceled) => return Ok(()),
            Err(error) => return Err(error),
        };
        event!(Level::INFO, controller = %connect, "connected to the controller");
        if let Err(error) = read_frames(socket, &inbound, &mut stop).await {
            if matches!(error, Error::Canceled) {
                return Ok(());
            }
            event!(Level::WARN, error = %error, "lost the controller connection");
        }
    }
}

/// Read frames off one connection until it drops
///
/// # Arguments
///
/// * `socket` - The connection to the controller
/// * `inbound` - The processor's inbound channel
/// * `stop` - The channel the caller shuts us down through
async fn read_frames(
    mut socket: TcpStream,
    inbound: &mpsc::Sender<Events>,
    stop: &mut watch::Receiver<bool>,
) -> Result<(), Error> {
    loop {
        let mut len_buf = [0u8; 4];
        tokio::select! {
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    return Err(Error::Canceled);
                }
            }
            read = socket.read_exact(&mut len_buf) => {
                read?;
                let len = u32::from_le_bytes(len_buf) as usize;
                // refuse empty and absurd frames outright
                if len == 0 || len > MAX_FRAME {
                    return Err(Error::validation(format!("bad frame length {len}")));
                }
                let mut frame = vec![0u8; len];
                socket.read_exact(&mut frame).await?;
                let events: Events = serde_json::from_slice(&frame)?;
                inbound.send(events).await?;
            }
        }
    }
}
