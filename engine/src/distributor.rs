use bytes::Bytes;
use tokio::sync::broadcast;

// --- Distributor -------------------------------------------------------------
//
// Fan-out of ingest payloads to every connected session.
//
// This is a thin wrapper around a broadcast channel, the same shape the
// engine has always used for PCM fan-out:
//   - publishing never waits on any session
//   - each session owns its receiver; the distributor holds no per-session
//     state and never keeps a session alive
//   - a session that falls behind loses its oldest payloads (Lagged) instead
//     of applying backpressure to everyone else
//   - payloads of one channel stay in ingest order (single sender per channel,
//     FIFO channel)

/// One datagram's payload, header already stripped.
#[derive(Debug, Clone)]
pub struct ChannelPayload {
    pub channel: usize,
    pub payload: Bytes,
}

#[derive(Clone)]
pub struct Distributor {
    tx: broadcast::Sender<ChannelPayload>,
}

impl Distributor {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Send to every subscribed session. Returns how many sessions will see
    /// it; zero when nobody is listening, which is not an error.
    pub fn publish(&self, channel: usize, payload: Bytes) -> usize {
        self.tx
            .send(ChannelPayload { channel, payload })
            .unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChannelPayload> {
        self.tx.subscribe()
    }

    pub fn session_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast::error::{RecvError, TryRecvError};

    #[test]
    fn publish_without_sessions_is_fine() {
        let d = Distributor::new(4);
        assert_eq!(d.publish(0, Bytes::from_static(b"x")), 0);
        assert_eq!(d.session_count(), 0);
    }

    #[tokio::test]
    async fn every_session_gets_every_payload_in_order() {
        let d = Distributor::new(16);
        let mut a = d.subscribe();
        let mut b = d.subscribe();
        assert_eq!(d.session_count(), 2);

        for i in 0..3u8 {
            assert_eq!(d.publish(4, Bytes::from(vec![i])), 2);
        }

        for rx in [&mut a, &mut b] {
            for i in 0..3u8 {
                let p = rx.recv().await.unwrap();
                assert_eq!(p.channel, 4);
                assert_eq!(&p.payload[..], &[i]);
            }
        }
    }

    #[tokio::test]
    async fn slow_session_drops_oldest_without_blocking_others() {
        let d = Distributor::new(2);
        let mut slow = d.subscribe();
        let mut fast = d.subscribe();

        for i in 0..5u8 {
            d.publish(0, Bytes::from(vec![i]));
            let p = fast.recv().await.unwrap();
            assert_eq!(&p.payload[..], &[i]);
        }

        match slow.recv().await {
            Err(RecvError::Lagged(n)) => assert_eq!(n, 3),
            other => panic!("expected lag, got {other:?}"),
        }
        assert_eq!(&slow.recv().await.unwrap().payload[..], &[3]);
        assert_eq!(&slow.recv().await.unwrap().payload[..], &[4]);
        assert!(matches!(slow.try_recv(), Err(TryRecvError::Empty)));
    }

    #[test]
    fn dropped_session_is_forgotten() {
        let d = Distributor::new(4);
        let rx = d.subscribe();
        assert_eq!(d.session_count(), 1);
        drop(rx);
        assert_eq!(d.session_count(), 0);
    }
}
