//! Client side of the session channel: receive tagged payloads over the
//! WebSocket and hand them to the channel controller.

use futures_util::StreamExt;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info};

use crate::controller::ChannelController;
use crate::error::SessionError;
use crate::protocol::StreamMessage;

/// Connect to `url` and route payloads until the server goes away.
///
/// Returns `Ok(())` on a clean close. Messages for unknown channels and
/// payloads that fail to decode are dropped; audio is lossy anyway.
pub async fn run_session(url: &str, controller: &ChannelController) -> Result<(), SessionError> {
    let (mut ws, _resp) = tokio_tungstenite::connect_async(url).await?;
    info!("session connected to {url}");

    while let Some(msg) = ws.next().await {
        match msg? {
            Message::Text(text) => {
                route_text(&text, controller);
            }
            Message::Close(frame) => {
                info!("session closed by server: {frame:?}");
                return Ok(());
            }
            // Pings are answered by tungstenite; nothing else is expected.
            _ => {}
        }
    }

    Err(SessionError::Closed)
}

/// Decode one text frame and feed the controller. Returns whether it was used.
pub fn route_text(text: &str, controller: &ChannelController) -> bool {
    let msg: StreamMessage = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            debug!("ignoring non-stream message: {e}");
            return false;
        }
    };

    let Some(channel) = msg.channel().filter(|c| *c < controller.channels()) else {
        debug!("ignoring event {:?}", msg.event);
        return false;
    };

    match msg.decode_samples() {
        Ok(samples) => {
            controller.on_payload(channel, &samples);
            true
        }
        Err(e) => {
            debug!("channel {}: undecodable payload dropped: {e}", channel + 1);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::ControllerSettings;
    use crate::playout::PlayoutEngine;
    use std::sync::Arc;

    #[tokio::test]
    async fn routes_payload_to_channel_ring() {
        let ctl = ChannelController::new(Arc::new(PlayoutEngine::new(10, 64)), ControllerSettings::default());
        ctl.turn_on(2);

        let msg = StreamMessage::for_payload(2, &[0x00, 0x40, 0x00, 0xC0]);
        assert!(route_text(&serde_json::to_string(&msg).unwrap(), &ctl));
        let ring = ctl.engine().strip(2).unwrap().ring();
        assert_eq!(ring.read(2), vec![0.5, -0.5]);
    }

    #[tokio::test]
    async fn drops_unknown_and_garbage() {
        let ctl = ChannelController::new(Arc::new(PlayoutEngine::new(10, 64)), ControllerSettings::default());
        assert!(!route_text("hello", &ctl));
        assert!(!route_text(r#"{"event":"audio-stream-11","data":"AAA="}"#, &ctl));
        assert!(!route_text(r#"{"event":"chat","data":""}"#, &ctl));
        assert!(!route_text(r#"{"event":"audio-stream-1","data":"%%%"}"#, &ctl));
        assert!(!ctl.has_traffic(0));
    }
}
