use std::cell::Cell;
use std::rc::Rc;
use std::sync::mpsc::{Receiver, SyncSender, TrySendError, sync_channel};

use tracing::{debug, warn};

use crate::param::{ParamId, ParamValue};
use crate::protocol::ClientMessage;

/// Fire-and-forget queue of client messages. The session loop drains the
/// receiving end and writes each message to the socket.
#[derive(Debug, Clone)]
pub struct Outbound {
    tx: SyncSender<ClientMessage>,
    closed: Rc<Cell<bool>>,
    dropped: Rc<Cell<u64>>,
    capacity: usize,
}

impl Outbound {
    pub fn channel(capacity: usize) -> (Self, Receiver<ClientMessage>) {
        let capacity = capacity.max(1);
        let (tx, rx) = sync_channel(capacity);
        let outbound = Self {
            tx,
            closed: Rc::new(Cell::new(false)),
            dropped: Rc::new(Cell::new(0)),
            capacity,
        };
        (outbound, rx)
    }

    pub fn choose_node(&self, endpoint: &str) {
        self.send(ClientMessage::ChooseNode {
            chosen_node: endpoint.to_string(),
        });
    }

    pub fn param_changed(&self, id: ParamId, value: ParamValue) {
        self.send(ClientMessage::ParamChanged(id, value));
    }

    /// Stop accepting messages. Anything sent afterwards is dropped.
    pub fn close(&self) {
        self.closed.set(true);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.get()
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.get()
    }

    fn send(&self, message: ClientMessage) {
        if self.is_closed() {
            debug!(?message, "connection closed; not sending");
            return;
        }

        match self.tx.try_send(message) {
            Ok(()) => {}
            Err(TrySendError::Full(message)) => {
                let dropped = self.dropped.get() + 1;
                self.dropped.set(dropped);
                if dropped == 1 || dropped.is_power_of_two() {
                    warn!(
                        capacity = self.capacity,
                        dropped,
                        ?message,
                        "outbound queue full; dropping message"
                    );
                }
            }
            Err(TrySendError::Disconnected(message)) => {
                warn!(?message, "outbound queue disconnected");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queues_messages_in_order() {
        let (outbound, rx) = Outbound::channel(4);
        outbound.choose_node("a:1");
        outbound.param_changed(3, ParamValue::Number(1.5));

        assert_eq!(
            rx.try_recv().expect("first"),
            ClientMessage::ChooseNode {
                chosen_node: "a:1".into()
            }
        );
        assert_eq!(
            rx.try_recv().expect("second"),
            ClientMessage::ParamChanged(3, ParamValue::Number(1.5))
        );
    }

    #[test]
    fn drops_when_queue_is_full() {
        let (outbound, rx) = Outbound::channel(1);
        outbound.choose_node("a:1");
        outbound.choose_node("b:2");

        assert_eq!(outbound.dropped_count(), 1);
        assert_eq!(
            rx.try_recv().expect("seeded"),
            ClientMessage::ChooseNode {
                chosen_node: "a:1".into()
            }
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn clones_share_the_drop_counter() {
        let (outbound, _rx) = Outbound::channel(1);
        let clone = outbound.clone();
        outbound.choose_node("a:1");
        clone.choose_node("b:2");
        clone.choose_node("c:3");

        assert_eq!(outbound.dropped_count(), 2);
        assert_eq!(clone.dropped_count(), 2);
    }

    #[test]
    fn closed_encoder_sends_nothing() {
        let (outbound, rx) = Outbound::channel(4);
        let clone = outbound.clone();
        outbound.close();
        clone.param_changed(1, ParamValue::Bool(true));

        assert!(clone.is_closed());
        assert!(rx.try_recv().is_err());
        assert_eq!(outbound.dropped_count(), 0);
    }
}
