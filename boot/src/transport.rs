//! Host links.
//!
//! A transport delivers whole packets.  Framing, checksums on the link and
//! retries belong to the transport, not to the engine.

use crate::protocol::Packet;

pub trait Transport {
    /// Largest packet the link can carry in one go.
    fn max_packet_size(&self) -> usize;

    /// A packet, if one has arrived.  Never blocks.
    fn poll(&mut self) -> Option<Packet>;

    fn send(&mut self, bytes: &[u8]);
}

impl<T: Transport + ?Sized> Transport for &mut T {
    fn max_packet_size(&self) -> usize {
        (**self).max_packet_size()
    }
    fn poll(&mut self) -> Option<Packet> {
        (**self).poll()
    }
    fn send(&mut self, bytes: &[u8]) {
        (**self).send(bytes)
    }
}

#[cfg(feature = "std")]
pub use queue::QueueTransport;

#[cfg(feature = "std")]
mod queue {
    use std::collections::VecDeque;

    use super::Transport;
    use crate::protocol::{Packet, MAX_PACKET};

    /// In-memory link for running the updater on a host.
    #[derive(Debug)]
    pub struct QueueTransport {
        max: usize,
        rx: VecDeque<Packet>,
        tx: Vec<Vec<u8>>,
    }

    impl Default for QueueTransport {
        fn default() -> Self {
            QueueTransport::new(MAX_PACKET)
        }
    }

    impl QueueTransport {
        pub fn new(max: usize) -> QueueTransport {
            QueueTransport {
                max: max.min(MAX_PACKET),
                rx: VecDeque::new(),
                tx: Vec::new(),
            }
        }

        /// Queue a packet as if the host sent it.  Packets the link could not
        /// carry are dropped, the way a real link would.
        pub fn push(&mut self, bytes: &[u8]) {
            if bytes.len() > self.max {
                return;
            }
            if let Ok(p) = Packet::from_slice(bytes) {
                self.rx.push_back(p);
            }
        }

        pub fn pending(&self) -> usize {
            self.rx.len()
        }

        /// Everything sent so far, oldest first.
        pub fn take_sent(&mut self) -> Vec<Vec<u8>> {
            std::mem::take(&mut self.tx)
        }
    }

    impl Transport for QueueTransport {
        fn max_packet_size(&self) -> usize {
            self.max
        }

        fn poll(&mut self) -> Option<Packet> {
            self.rx.pop_front()
        }

        fn send(&mut self, bytes: &[u8]) {
            self.tx.push(bytes.to_vec());
        }
    }

}
