use crate::types::message::SignalingMessage;
use log::{debug, warn};
use std::time::Duration;
use tokio::sync::{mpsc, watch};

/// Sends a HEARTBEAT every `interval` until the connection shuts down.
/// Frames go through the connection's outbound queue so they never interleave
/// with a partially written message.
pub(crate) async fn heartbeat_loop(
    outbound: mpsc::UnboundedSender<String>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let frame = match SignalingMessage::Heartbeat.to_json() {
        Ok(frame) => frame,
        Err(e) => {
            warn!(target: "Signaling/Heartbeat", "Cannot encode heartbeat: {e}");
            return;
        }
    };

    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                if outbound.send(frame.clone()).is_err() {
                    debug!(target: "Signaling/Heartbeat", "Outbound queue closed, exiting heartbeat loop.");
                    return;
                }
                debug!(target: "Signaling/Heartbeat", "Sent heartbeat");
            }
            _ = shutdown.changed() => {
                debug!(target: "Signaling/Heartbeat", "Shutdown signaled, exiting heartbeat loop.");
                return;
            }
        }
    }
}
