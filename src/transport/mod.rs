use crate::types::TaggedBytesMut;
use log::trace;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::sync::mpsc;

const FIRST_EPHEMERAL_PORT: u16 = 49152;

#[derive(Default)]
struct Switch {
    next_port: u16,
    sockets: HashMap<SocketAddr, mpsc::UnboundedSender<TaggedBytesMut>>,
}

/// LoopbackNetwork is an in-process datagram switch standing in for UDP
/// sockets. Every bound address owns a mailbox; datagrams to addresses nobody
/// bound are dropped, like UDP would.
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    switch: Arc<Mutex<Switch>>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// bind allocates a port on `ip` whose datagrams are delivered to `inbox`
    pub fn bind(&self, ip: IpAddr, inbox: mpsc::UnboundedSender<TaggedBytesMut>) -> SocketAddr {
        let mut switch = self.switch.lock();
        loop {
            let port = if switch.next_port < FIRST_EPHEMERAL_PORT {
                FIRST_EPHEMERAL_PORT
            } else {
                switch.next_port
            };
            switch.next_port = port.checked_add(1).unwrap_or(FIRST_EPHEMERAL_PORT);

            let addr = SocketAddr::new(ip, port);
            if !switch.sockets.contains_key(&addr) {
                trace!("loopback bound {}", addr);
                switch.sockets.insert(addr, inbox);
                return addr;
            }
        }
    }

    pub fn unbind(&self, addr: &SocketAddr) {
        trace!("loopback unbound {}", addr);
        self.switch.lock().sockets.remove(addr);
    }

    /// send delivers `transmit` to its peer address, readdressed from the
    /// receiver's point of view; returns false when it was dropped
    pub fn send(&self, transmit: TaggedBytesMut) -> bool {
        let destination = transmit.transport.peer_addr;
        let inbox = self.switch.lock().sockets.get(&destination).cloned();
        let Some(inbox) = inbox else {
            trace!(
                "loopback drops {} bytes from {} to unbound {}",
                transmit.message.len(),
                transmit.transport.local_addr,
                destination
            );
            return false;
        };

        inbox
            .send(TaggedBytesMut {
                now: transmit.now,
                transport: transmit.transport.reversed(),
                message: transmit.message,
            })
            .is_ok()
    }
}
