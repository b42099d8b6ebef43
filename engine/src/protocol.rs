//! Session wire format.
//!
//! Every payload travels as one WebSocket text frame:
//!
//! ```text
//! {"event":"audio-stream-3","data":"<base64 s16le mono PCM>"}
//! ```
//!
//! The event name carries the channel (1-based, matching what operators see).

use serde::{Deserialize, Serialize};

use crate::config::{channel_from_event, event_name};
use crate::pcm;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamMessage {
    pub event: String,
    pub data: String,
}

impl StreamMessage {
    pub fn for_payload(channel: usize, payload: &[u8]) -> Self {
        Self {
            event: event_name(channel),
            data: pcm::payload_to_base64(payload),
        }
    }

    /// 0-based channel index, if the event is an audio stream event.
    pub fn channel(&self) -> Option<usize> {
        channel_from_event(&self.event)
    }

    pub fn decode_samples(&self) -> Result<Vec<f32>, base64::DecodeError> {
        Ok(pcm::decode_pcm16le(&pcm::payload_from_base64(&self.data)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_shape() {
        let msg = StreamMessage::for_payload(2, &[0x00, 0x40]);
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(json, r#"{"event":"audio-stream-3","data":"AEA="}"#);

        let back: StreamMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back.channel(), Some(2));
        assert_eq!(back.decode_samples().unwrap(), vec![0.5]);
    }
}
