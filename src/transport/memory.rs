//! In-process transport fabric
//!
//! Wires nodes together through channels so mesh behavior (relay,
//! handshakes, gossip) can be exercised end-to-end without a radio. Used
//! by the integration tests and the loopback demos.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use super::{LinkId, LinkRole, Transport, TransportEvent, TransportEventSender};
use crate::error::{Error, Result};

struct RemoteEnd {
    sender: TransportEventSender,
    remote_link: LinkId,
}

/// Allocates link IDs and creates transports that can be wired together
pub struct MemoryFabric {
    next_link: Arc<AtomicU64>,
}

impl MemoryFabric {
    pub fn new() -> Self {
        Self {
            next_link: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Create a node transport that reports events into `events`
    pub fn transport(&self, events: TransportEventSender) -> Arc<MemoryTransport> {
        Arc::new(MemoryTransport {
            next_link: self.next_link.clone(),
            events,
            links: DashMap::new(),
            active: AtomicBool::new(true),
        })
    }

    /// Connect two transports with a bidirectional link pair. `a` plays
    /// the central role, `b` the peripheral; `b` sees the CCCD
    /// subscription immediately.
    pub fn connect(a: &Arc<MemoryTransport>, b: &Arc<MemoryTransport>) -> (LinkId, LinkId) {
        let link_at_a = a.next_link.fetch_add(1, Ordering::Relaxed);
        let link_at_b = a.next_link.fetch_add(1, Ordering::Relaxed);

        a.links.insert(
            link_at_a,
            RemoteEnd {
                sender: b.events.clone(),
                remote_link: link_at_b,
            },
        );
        b.links.insert(
            link_at_b,
            RemoteEnd {
                sender: a.events.clone(),
                remote_link: link_at_a,
            },
        );

        let _ = a.events.send(TransportEvent::LinkEstablished {
            link: link_at_a,
            role: LinkRole::Central,
        });
        let _ = b.events.send(TransportEvent::LinkEstablished {
            link: link_at_b,
            role: LinkRole::Peripheral,
        });
        let _ = b.events.send(TransportEvent::Subscribed { link: link_at_b });

        (link_at_a, link_at_b)
    }

    /// Tear down one side's link; both ends observe the closure
    pub fn disconnect(transport: &Arc<MemoryTransport>, link: LinkId) {
        if let Some((_, remote)) = transport.links.remove(&link) {
            let _ = remote.sender.send(TransportEvent::LinkClosed {
                link: remote.remote_link,
                reason: "remote disconnected".into(),
            });
            let _ = transport.events.send(TransportEvent::LinkClosed {
                link,
                reason: "disconnected".into(),
            });
        }
    }
}

impl Default for MemoryFabric {
    fn default() -> Self {
        Self::new()
    }
}

/// One node's endpoint in the fabric
pub struct MemoryTransport {
    next_link: Arc<AtomicU64>,
    events: TransportEventSender,
    links: DashMap<LinkId, RemoteEnd>,
    active: AtomicBool,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn start(&self) -> Result<()> {
        self.active.store(true, Ordering::Release);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.active.store(false, Ordering::Release);
        self.links.clear();
        Ok(())
    }

    async fn send_frame(&self, link: LinkId, frame: &[u8]) -> Result<()> {
        if !self.active.load(Ordering::Acquire) {
            return Err(Error::RadioUnavailable("transport stopped".into()));
        }
        let remote = self
            .links
            .get(&link)
            .ok_or_else(|| Error::LinkFailure(format!("link {} gone", link)))?;
        remote
            .sender
            .send(TransportEvent::FrameReceived {
                link: remote.remote_link,
                frame: frame.to_vec(),
            })
            .map_err(|_| Error::LinkFailure("remote endpoint dropped".into()))
    }

    async fn set_scanning(&self, _on: bool) -> Result<()> {
        Ok(())
    }

    async fn set_advertising(&self, _on: bool) -> Result<()> {
        Ok(())
    }
}
