//! Outbound side of a client's signaling socket

use p2ptv_core::{Error, Result};
use p2ptv_proto::SignalMessage;
use tokio::sync::mpsc;

/// Queue of control messages for one client
///
/// A socket writer task drains the receiving end. Sending never waits: when
/// the client is too slow the message is dropped.
#[derive(Debug, Clone)]
pub struct ControlSender {
    sender: mpsc::Sender<SignalMessage>,
}

impl ControlSender {
    #[must_use]
    pub const fn new(sender: mpsc::Sender<SignalMessage>) -> Self {
        Self { sender }
    }

    /// Create a sender together with the receiver its writer task drains
    #[must_use]
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<SignalMessage>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(tx), rx)
    }

    pub fn send(&self, message: SignalMessage) -> Result<()> {
        // never waits; a client too slow to drain its queue loses the message
        self.sender.try_send(message).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => Error::ControlChannel(
                "Channel full: client too slow to consume messages".to_string(),
            ),
            mpsc::error::TrySendError::Closed(_) => {
                Error::ControlChannel("Channel closed: client disconnected".to_string())
            }
        })
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_and_receive() {
        let (control, mut rx) = ControlSender::channel(4);
        control
            .send(SignalMessage::Handle {
                id: "abcdefABCDEF".to_string(),
            })
            .unwrap();
        assert!(matches!(rx.recv().await, Some(SignalMessage::Handle { .. })));
    }

    #[tokio::test]
    async fn test_full_and_closed() {
        let (control, rx) = ControlSender::channel(1);
        control.send(SignalMessage::Unknown).unwrap();
        assert!(matches!(
            control.send(SignalMessage::Unknown),
            Err(Error::ControlChannel(msg)) if msg.contains("full")
        ));

        drop(rx);
        assert!(control.is_closed());
        assert!(matches!(
            control.send(SignalMessage::Unknown),
            Err(Error::ControlChannel(msg)) if msg.contains("closed")
        ));
    }
}
