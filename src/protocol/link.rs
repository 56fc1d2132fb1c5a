// Serial link channel
//
// Sends frames on one transport and polls for the response with an explicit
// retry budget, so no exchange can block forever. `LinkGroup` pins each
// destination to one link and fans broadcasts out to all of them.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, trace, warn};

use super::packet::{ChecksumRecovery, Packet, RxBuffer};
use crate::hal::Transport;

/// Shared stop flag checked by every polling loop
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Error types for link exchanges
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("IO error on link {link}: {source}")]
    Io {
        link: String,
        #[source]
        source: std::io::Error,
    },

    #[error("No response on link {link} after {polls} polls")]
    Timeout { link: String, polls: u32 },

    #[error("Polling on link {link} cancelled")]
    Cancelled { link: String },
}

pub type Result<T> = std::result::Result<T, LinkError>;

/// One physical serial link
pub struct LinkChannel {
    name: String,
    transport: Box<dyn Transport>,
    rx: RxBuffer,
    retry_budget: u32,
    suppress_echo: bool,
    pending_echo: usize,
    cancel: CancelToken,
}

impl LinkChannel {
    pub fn new(name: impl Into<String>, transport: Box<dyn Transport>, retry_budget: u32) -> Self {
        Self {
            name: name.into(),
            transport,
            rx: RxBuffer::default(),
            retry_budget,
            suppress_echo: false,
            pending_echo: 0,
            cancel: CancelToken::new(),
        }
    }

    /// Discard our own transmitted bytes when they are reflected back
    /// (half-duplex single-wire buses)
    pub fn with_echo_suppression(mut self, enabled: bool) -> Self {
        self.suppress_echo = enabled;
        self
    }

    pub fn with_checksum_recovery(mut self, recovery: ChecksumRecovery) -> Self {
        self.rx.set_recovery(recovery);
        self
    }

    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn retry_budget(&self) -> u32 {
        self.retry_budget
    }

    /// Write one frame without waiting for anything
    pub fn write(&mut self, packet: &Packet) -> Result<()> {
        let frame = packet.encode();
        trace!(link = %self.name, ?frame, "TX");

        self.transport.write_all(&frame).map_err(|source| LinkError::Io {
            link: self.name.clone(),
            source,
        })?;

        if self.suppress_echo {
            self.pending_echo += frame.len();
        }
        Ok(())
    }

    /// Write one frame and poll for the first complete response frame
    pub fn transact(&mut self, packet: &Packet) -> Result<Packet> {
        self.transact_matching(packet, None)
    }

    /// Write one frame and poll for a response carrying `responder` in its id byte
    ///
    /// Frames from any other id are stale replies and are dropped; they still
    /// count against the retry budget.
    pub fn transact_from(&mut self, packet: &Packet, responder: u8) -> Result<Packet> {
        self.transact_matching(packet, Some(responder))
    }

    fn transact_matching(&mut self, packet: &Packet, responder: Option<u8>) -> Result<Packet> {
        self.write(packet)?;

        for _ in 0..self.retry_budget {
            if self.cancel.is_cancelled() {
                return Err(LinkError::Cancelled {
                    link: self.name.clone(),
                });
            }
            if let Some(response) = self.poll()? {
                match responder {
                    Some(id) if response.destination != id => {
                        debug!(link = %self.name, expected = id, got = response.destination, "Dropping stale frame");
                    }
                    _ => {
                        trace!(link = %self.name, ?response, "RX");
                        return Ok(response);
                    }
                }
            }
        }

        Err(LinkError::Timeout {
            link: self.name.clone(),
            polls: self.retry_budget,
        })
    }

    /// Send a packet, optionally waiting for a response
    ///
    /// Returns the response, or None when none was requested or none arrived
    /// within the retry budget.
    pub fn send(&mut self, packet: &Packet, expect_response: bool) -> Option<Packet> {
        self.send_matching(packet, expect_response, None)
    }

    /// Like `send`, but only a frame from `responder` counts as the response
    pub fn request_from(&mut self, packet: &Packet, responder: u8) -> Option<Packet> {
        self.send_matching(packet, true, Some(responder))
    }

    fn send_matching(&mut self, packet: &Packet, expect_response: bool, responder: Option<u8>) -> Option<Packet> {
        if !expect_response {
            if let Err(e) = self.write(packet) {
                warn!("{}", e);
            }
            return None;
        }

        match self.transact_matching(packet, responder) {
            Ok(response) => Some(response),
            Err(e @ (LinkError::Timeout { .. } | LinkError::Cancelled { .. })) => {
                debug!(destination = packet.destination, "{}", e);
                None
            }
            Err(e) => {
                warn!("{}", e);
                None
            }
        }
    }

    /// Single non-blocking poll for an unsolicited frame
    pub fn receive(&mut self) -> Option<Packet> {
        match self.poll() {
            Ok(packet) => packet,
            Err(e) => {
                warn!("{}", e);
                None
            }
        }
    }

    fn poll(&mut self) -> Result<Option<Packet>> {
        self.fill()?;
        match self.rx.try_parse() {
            Ok(packet) => Ok(packet),
            Err(e) => {
                warn!(link = %self.name, "{}", e);
                Ok(None)
            }
        }
    }

    /// Move waiting bytes from the transport into the receive buffer.
    /// Bytes that do not fit stay in the transport for the next poll.
    fn fill(&mut self) -> Result<()> {
        let available = self.transport.available().map_err(|source| LinkError::Io {
            link: self.name.clone(),
            source,
        })?;

        let mut remaining = available;
        while remaining > 0 && self.rx.room() > 0 {
            let byte = self.transport.read_byte().map_err(|source| LinkError::Io {
                link: self.name.clone(),
                source,
            })?;
            remaining -= 1;

            if self.pending_echo > 0 {
                self.pending_echo -= 1;
                continue;
            }
            self.rx.push(byte);
        }
        Ok(())
    }
}

/// Set of links with a static destination routing table
pub struct LinkGroup {
    links: Vec<LinkChannel>,
    routes: HashMap<u8, usize>,
    broadcast_id: u8,
}

impl LinkGroup {
    pub fn new(broadcast_id: u8) -> Self {
        Self {
            links: Vec::new(),
            routes: HashMap::new(),
            broadcast_id,
        }
    }

    /// Add a link serving the given destinations
    pub fn add_link(&mut self, link: LinkChannel, destinations: impl IntoIterator<Item = u8>) {
        let index = self.links.len();
        for destination in destinations {
            self.routes.insert(destination, index);
        }
        self.links.push(link);
    }

    /// Link serving `destination`, if any
    pub fn link_for(&mut self, destination: u8) -> Option<&mut LinkChannel> {
        let index = *self.routes.get(&destination)?;
        self.links.get_mut(index)
    }

    pub fn links_mut(&mut self) -> impl Iterator<Item = &mut LinkChannel> {
        self.links.iter_mut()
    }

    /// Route a packet by its destination
    ///
    /// Broadcasts go out on every link and never wait for a response.
    pub fn send(&mut self, packet: &Packet, expect_response: bool) -> Option<Packet> {
        if packet.destination == self.broadcast_id {
            for link in &mut self.links {
                if let Err(e) = link.write(packet) {
                    warn!("{}", e);
                }
            }
            return None;
        }

        match self.link_for(packet.destination) {
            Some(link) => link.send(packet, expect_response),
            None => {
                warn!(destination = packet.destination, "No link routes this destination");
                None
            }
        }
    }

    /// Route a packet by its destination and wait for a reply from that same id
    ///
    /// Broadcasts behave as in `send`.
    pub fn request(&mut self, packet: &Packet) -> Option<Packet> {
        if packet.destination == self.broadcast_id {
            return self.send(packet, false);
        }

        match self.link_for(packet.destination) {
            Some(link) => link.request_from(packet, packet.destination),
            None => {
                warn!(destination = packet.destination, "No link routes this destination");
                None
            }
        }
    }

    /// Poll every link once, returning the first frame found
    pub fn receive(&mut self) -> Option<Packet> {
        self.links.iter_mut().find_map(|link| link.receive())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::MemoryTransport;

    fn ack_for(frame: &[u8]) -> Option<Vec<u8>> {
        // Reply to the sender id found in the frame
        Some(Packet::new(frame[2], 0x06, &[]).encode())
    }

    #[test]
    fn test_send_without_response_does_not_poll() {
        let (transport, handle) = MemoryTransport::with_responder(ack_for);
        let mut link = LinkChannel::new("com1", Box::new(transport), 10);
        let packet = Packet::new(1, 2, &[]);

        assert_eq!(link.send(&packet, false), None);
        assert_eq!(handle.take_written(), packet.encode());
        assert_eq!(handle.polls(), 0);
    }

    #[test]
    fn test_transact_returns_response() {
        let (transport, _handle) = MemoryTransport::with_responder(ack_for);
        let mut link = LinkChannel::new("com1", Box::new(transport), 10);

        let response = link.send(&Packet::new(3, 1, &[1]), true).unwrap();
        assert_eq!(response.destination, 3);
        assert_eq!(response.instruction, 0x06);
    }

    #[test]
    fn test_timeout_uses_whole_budget() {
        let (transport, handle) = MemoryTransport::new();
        let mut link = LinkChannel::new("com3", Box::new(transport), 25);

        let err = link.transact(&Packet::new(3, 1, &[1])).unwrap_err();
        assert!(matches!(err, LinkError::Timeout { polls: 25, .. }));
        assert_eq!(handle.polls(), 25);
        assert_eq!(link.send(&Packet::new(3, 1, &[1]), true), None);
    }

    #[test]
    fn test_cancelled_link_stops_polling() {
        let (transport, handle) = MemoryTransport::new();
        let cancel = CancelToken::new();
        let mut link = LinkChannel::new("com3", Box::new(transport), 1000).with_cancel_token(cancel.clone());

        cancel.cancel();
        let err = link.transact(&Packet::new(3, 1, &[1])).unwrap_err();
        assert!(matches!(err, LinkError::Cancelled { .. }));
        assert_eq!(handle.polls(), 0);
    }

    #[test]
    fn test_echo_is_parsed_as_response_without_suppression() {
        let (transport, _handle) = MemoryTransport::with_responder(|_| Some(Packet::new(5, 0, &[]).encode()));
        let mut link = LinkChannel::new("servo", Box::new(transport.echoing()), 10);

        let sent = Packet::new(5, 0x03, &[0x19, 1]);
        assert_eq!(link.send(&sent, true), Some(sent));
    }

    #[test]
    fn test_echo_suppression_skips_own_frame() {
        let (transport, _handle) = MemoryTransport::with_responder(|_| Some(Packet::new(5, 0, &[]).encode()));
        let mut link =
            LinkChannel::new("servo", Box::new(transport.echoing()), 10).with_echo_suppression(true);

        let response = link.send(&Packet::new(5, 0x03, &[0x19, 1]), true).unwrap();
        assert_eq!(response, Packet::new(5, 0, &[]));
    }

    #[test]
    fn test_echo_suppression_swallows_reply_on_quiet_bus() {
        // Separate TX and RX lines: nothing echoes, so the reply is eaten instead
        let (transport, _handle) = MemoryTransport::with_responder(|_| Some(Packet::new(5, 0, &[]).encode()));
        let mut link = LinkChannel::new("servo", Box::new(transport), 10).with_echo_suppression(true);

        assert_eq!(link.send(&Packet::new(5, 0x03, &[0x19, 1]), true), None);
    }

    #[test]
    fn test_transact_from_drops_other_ids() {
        let (transport, handle) = MemoryTransport::with_responder(ack_for);
        let mut link = LinkChannel::new("servo", Box::new(transport), 10);

        handle.inject(&Packet::new(4, 0, &[]).encode());
        let response = link.transact_from(&Packet::new(3, 1, &[1]), 3).unwrap();
        assert_eq!(response.destination, 3);

        handle.inject(&Packet::new(4, 0, &[]).encode());
        let err = link.transact_from(&Packet::new(9, 1, &[1]), 8).unwrap_err();
        assert!(matches!(err, LinkError::Timeout { polls: 10, .. }));
    }

    #[test]
    fn test_receive_unsolicited_frame() {
        let (transport, handle) = MemoryTransport::new();
        let mut link = LinkChannel::new("com3", Box::new(transport), 10);

        assert_eq!(link.receive(), None);
        handle.inject(&Packet::new(2, 1, &[1]).encode());
        assert_eq!(link.receive(), Some(Packet::new(2, 1, &[1])));
    }

    #[test]
    fn test_group_routes_and_broadcasts() {
        let (a, handle_a) = MemoryTransport::with_responder(ack_for);
        let (b, handle_b) = MemoryTransport::with_responder(ack_for);
        let mut group = LinkGroup::new(0xFE);
        group.add_link(LinkChannel::new("com1", Box::new(a), 10), [1]);
        group.add_link(LinkChannel::new("com3", Box::new(b), 10), [3]);

        assert!(group.send(&Packet::new(3, 1, &[1]), true).is_some());
        assert!(handle_a.take_written().is_empty());
        assert!(!handle_b.take_written().is_empty());

        let broadcast = Packet::new(0xFE, 2, &[]);
        assert_eq!(group.send(&broadcast, true), None);
        assert_eq!(handle_a.take_written(), broadcast.encode());
        assert_eq!(handle_b.take_written(), broadcast.encode());

        assert_eq!(group.send(&Packet::new(9, 1, &[1]), true), None);
    }

    #[test]
    fn test_group_request_waits_for_destination() {
        let (a, handle_a) = MemoryTransport::with_responder(ack_for);
        let mut group = LinkGroup::new(0xFE);
        group.add_link(LinkChannel::new("servo-r", Box::new(a), 10), [1, 2]);

        handle_a.inject(&Packet::new(1, 0, &[]).encode());
        assert_eq!(group.request(&Packet::new(2, 1, &[])), Some(Packet::new(2, 0x06, &[])));
        assert_eq!(group.request(&Packet::new(0xFE, 2, &[])), None);
    }
}
