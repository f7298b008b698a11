//! The goal state listener daemons dial into
//!
//! Each accepted daemon gets its own outbound channel on the shim; the shim
//! hydrates the channel on registration and every apply fans deltas out to
//! all of them. Frames on the wire are a little endian u32 length followed by
//! the JSON encoded [`Events`] message.

use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{Level, event};

use warden::Error;
use warden::models::Events;

use super::shim::DpShim;

/// How many events one daemon's channel may buffer
const CLIENT_DEPTH: usize = 64;

/// The goal state listener
pub struct GoalServer {
    /// The shim whose deltas get fanned out
    shim: Arc<DpShim>,
    /// The address to listen on
    listen: String,
}

impl GoalServer {
    /// Create a new goal state listener
    ///
    /// # Arguments
    ///
    /// * `shim` - The shim whose deltas get fanned out
    /// * `listen` - The address to listen on
    pub fn new(shim: Arc<DpShim>, listen: String) -> Self {
        GoalServer { shim, listen }
    }

    /// Accept daemons until the stop channel flips
    ///
    /// # Arguments
    ///
    /// * `stop` - The channel the caller shuts us down through
    pub async fn serve(self, mut stop: watch::Receiver<bool>) -> Result<(), Error> {
        let listener = TcpListener::bind(&self.listen).await?;
        event!(Level::INFO, listen = %self.listen, "goal state server listening");
        loop {
            tokio::select! {
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        return Ok(());
                    }
                }
                accepted = listener.accept() => {
                    let (socket, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(error) => {
                            // accept hiccups must not take the listener down
                            event!(Level::WARN, error = %error, "failed to accept a daemon");
                            continue;
                        }
                    };
                    event!(Level::INFO, peer = %peer, "daemon connected");
                    let (tx, rx) = mpsc::channel(CLIENT_DEPTH);
                    // registration hydrates the fresh daemon before any delta
                    if let Err(error) = self.shim.register_client(tx).await {
                        event!(Level::ERROR, peer = %peer, error = %error, "failed to hydrate daemon");
                        continue;
                    }
                    tokio::spawn(forward(socket, rx));
                }
            }
        }
    }
}

/// Forward a daemon's event channel onto its socket
///
/// # Arguments
///
/// * `socket` - The daemon's socket
/// * `rx` - The daemon's event channel
async fn forward(mut socket: TcpStream, mut rx: mpsc::Receiver<Events>) {
    while let Some(events) = rx.recv().await {
        let frame = match serde_json::to_vec(&events) {
            Ok(frame) => frame,
            Err(error) => {
                event!(Level::ERROR, error = %error, "failed to encode an event frame");
                continue;
            }
        };
        let len = frame.len() as u32;
        if socket.write_all(&len.to_le_bytes()).await.is_err()
            || socket.write_all(&frame).await.is_err()
        {
            // the daemon will reconnect and get rehydrated
            event!(Level::INFO, "daemon disconnected");
            return;
        }
    }
}
