//! Serialized outbound transmitter
//!
//! A single-consumer actor owns every write to every link: requests queue
//! into an unbounded mailbox and are processed strictly in arrival order,
//! so at most one write is outstanding per link and fragments of one
//! transfer never interleave. Closing the mailbox drains it FIFO.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{ConnectionTracker, LinkId, Transport};
use crate::error::Result;
use crate::protocol::fragmentation::fragment_packet;
use crate::protocol::{binary, BitchatPacket, PeerId, PROTOCOL_VERSION_2};

/// Identifier of a multi-fragment transfer
pub type TransferId = Uuid;

/// Minimum spacing between fragments of one transfer
const INTER_FRAGMENT_PACING: Duration = Duration::from_millis(20);

/// Grace period before a failed link is dropped from the tracker
const DEAD_LINK_REMOVAL_DELAY: Duration = Duration::from_millis(100);

/// Where a request should go
#[derive(Debug, Clone)]
pub enum BroadcastTarget {
    /// Every writable link, minus the ingress link and the sender's link
    Fanout {
        skip_link: Option<LinkId>,
        skip_peer: Option<PeerId>,
    },
    /// Exactly one link
    Link(LinkId),
    /// The direct neighbor mapped to this peer, falling back to fanout
    /// with the same exclusions
    Peer {
        peer: PeerId,
        skip_link: Option<LinkId>,
        skip_peer: Option<PeerId>,
    },
}

/// One unit of outbound work
#[derive(Debug)]
pub struct BroadcastRequest {
    pub packet: BitchatPacket,
    pub target: BroadcastTarget,
    pub transfer_id: Option<TransferId>,
}

/// Progress of a tracked transfer
#[derive(Debug, Clone)]
pub enum TransferEvent {
    Started {
        transfer_id: TransferId,
        fragments: usize,
    },
    Progress {
        transfer_id: TransferId,
        sent: usize,
        total: usize,
    },
    Completed {
        transfer_id: TransferId,
    },
    Cancelled {
        transfer_id: TransferId,
    },
}

/// Handle to the broadcaster actor
pub struct Broadcaster {
    tx: Mutex<Option<mpsc::UnboundedSender<BroadcastRequest>>>,
    cancelled: Arc<Mutex<HashSet<TransferId>>>,
    events: broadcast::Sender<TransferEvent>,
}

impl Broadcaster {
    /// Spawn the consumer task and return the handle
    pub fn spawn(transport: Arc<dyn Transport>, tracker: Arc<ConnectionTracker>) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(256);
        let cancelled = Arc::new(Mutex::new(HashSet::new()));

        let broadcaster = Arc::new(Self {
            tx: Mutex::new(Some(tx)),
            cancelled: cancelled.clone(),
            events: events.clone(),
        });

        tokio::spawn(run_consumer(rx, transport, tracker, cancelled, events));
        broadcaster
    }

    /// Enqueue without blocking; ordering follows arrival
    pub fn enqueue(&self, request: BroadcastRequest) {
        if let Some(tx) = self.tx.lock().as_ref() {
            let _ = tx.send(request);
        }
    }

    pub fn fanout(
        &self,
        packet: BitchatPacket,
        skip_link: Option<LinkId>,
        skip_peer: Option<PeerId>,
    ) {
        self.enqueue(BroadcastRequest {
            packet,
            target: BroadcastTarget::Fanout {
                skip_link,
                skip_peer,
            },
            transfer_id: None,
        });
    }

    pub fn send_to_link(&self, packet: BitchatPacket, link: LinkId) {
        self.enqueue(BroadcastRequest {
            packet,
            target: BroadcastTarget::Link(link),
            transfer_id: None,
        });
    }

    pub fn send_to_peer(&self, packet: BitchatPacket, peer: PeerId) {
        self.enqueue(BroadcastRequest {
            packet,
            target: BroadcastTarget::Peer {
                peer,
                skip_link: None,
                skip_peer: None,
            },
            transfer_id: None,
        });
    }

    /// Suppress the remaining fragments of a transfer. Frames already
    /// below the radio driver are not recalled.
    pub fn cancel(&self, transfer_id: TransferId) {
        self.cancelled.lock().insert(transfer_id);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransferEvent> {
        self.events.subscribe()
    }

    /// Close the mailbox; queued requests drain in FIFO order, then the
    /// consumer exits.
    pub fn close(&self) {
        self.tx.lock().take();
    }
}

async fn run_consumer(
    mut rx: mpsc::UnboundedReceiver<BroadcastRequest>,
    transport: Arc<dyn Transport>,
    tracker: Arc<ConnectionTracker>,
    cancelled: Arc<Mutex<HashSet<TransferId>>>,
    events: broadcast::Sender<TransferEvent>,
) {
    while let Some(request) = rx.recv().await {
        process_request(request, &transport, &tracker, &cancelled, &events).await;
    }
    debug!("broadcaster mailbox closed");
}

async fn process_request(
    request: BroadcastRequest,
    transport: &Arc<dyn Transport>,
    tracker: &Arc<ConnectionTracker>,
    cancelled: &Arc<Mutex<HashSet<TransferId>>>,
    events: &broadcast::Sender<TransferEvent>,
) {
    let links = resolve_links(&request.target, tracker);
    if links.is_empty() {
        return;
    }

    let fragments = match fragment_packet(&request.packet) {
        Ok(fragments) => fragments,
        Err(e) => {
            warn!(error = %e, "dropping unencodable packet");
            return;
        }
    };

    match fragments {
        None => {
            let mut dead = HashSet::new();
            write_to_links(&request.packet, &links, transport, tracker, &mut dead).await;
            if let Some(transfer_id) = request.transfer_id {
                let _ = events.send(TransferEvent::Started {
                    transfer_id,
                    fragments: 1,
                });
                let _ = events.send(TransferEvent::Completed { transfer_id });
            }
        }
        Some(fragments) => {
            let total = fragments.len();
            if let Some(transfer_id) = request.transfer_id {
                let _ = events.send(TransferEvent::Started {
                    transfer_id,
                    fragments: total,
                });
            }

            let mut dead = HashSet::new();
            let mut completed = true;
            for (index, fragment) in fragments.iter().enumerate() {
                if let Some(transfer_id) = request.transfer_id {
                    if cancelled.lock().remove(&transfer_id) {
                        let _ = events.send(TransferEvent::Cancelled { transfer_id });
                        completed = false;
                        break;
                    }
                }

                write_to_links(fragment, &links, transport, tracker, &mut dead).await;

                if let Some(transfer_id) = request.transfer_id {
                    let _ = events.send(TransferEvent::Progress {
                        transfer_id,
                        sent: index + 1,
                        total,
                    });
                }
                if index + 1 < total {
                    tokio::time::sleep(INTER_FRAGMENT_PACING).await;
                }
            }

            if completed {
                if let Some(transfer_id) = request.transfer_id {
                    let _ = events.send(TransferEvent::Completed { transfer_id });
                }
            }
        }
    }

    if let Some(transfer_id) = request.transfer_id {
        cancelled.lock().remove(&transfer_id);
    }
}

fn resolve_links(target: &BroadcastTarget, tracker: &ConnectionTracker) -> Vec<LinkId> {
    match target {
        BroadcastTarget::Link(link) => vec![*link],
        BroadcastTarget::Peer {
            peer,
            skip_link,
            skip_peer,
        } => match tracker.link_for_peer(peer) {
            // Direct-unicast shortcut
            Some(link) => vec![link],
            None => resolve_links(
                &BroadcastTarget::Fanout {
                    skip_link: *skip_link,
                    skip_peer: *skip_peer,
                },
                tracker,
            ),
        },
        BroadcastTarget::Fanout {
            skip_link,
            skip_peer,
        } => tracker
            .writable_links()
            .into_iter()
            .filter(|info| Some(info.link) != *skip_link)
            .filter(|info| match (info.peer_id, skip_peer) {
                (Some(mapped), Some(skip)) => mapped != *skip,
                _ => true,
            })
            .map(|info| info.link)
            .collect(),
    }
}

/// Write one packet to each link, mirroring the neighbor's wire version.
/// A failed write marks the link dead for the rest of the request and
/// schedules its removal.
async fn write_to_links(
    packet: &BitchatPacket,
    links: &[LinkId],
    transport: &Arc<dyn Transport>,
    tracker: &Arc<ConnectionTracker>,
    dead: &mut HashSet<LinkId>,
) {
    let mut encoded: HashMap<u8, Vec<u8>> = HashMap::new();

    for &link in links {
        if dead.contains(&link) {
            continue;
        }
        let version = tracker.wire_version(link);
        let frame = match encoded.entry(version) {
            std::collections::hash_map::Entry::Occupied(entry) => entry.into_mut(),
            std::collections::hash_map::Entry::Vacant(entry) => {
                match encode_for_version(packet, version) {
                    Ok(frame) => entry.insert(frame),
                    Err(e) => {
                        warn!(error = %e, "frame encode failed");
                        return;
                    }
                }
            }
        };

        if let Err(e) = transport.send_frame(link, frame).await {
            warn!(link, error = %e, "link write failed, scheduling removal");
            dead.insert(link);
            let tracker = tracker.clone();
            tokio::spawn(async move {
                tokio::time::sleep(DEAD_LINK_REMOVAL_DELAY).await;
                tracker.remove_link(link);
            });
        }
    }
}

fn encode_for_version(packet: &BitchatPacket, version: u8) -> Result<Vec<u8>> {
    let mut framed = packet.clone();
    framed.version = version;
    match binary::encode(&framed) {
        Ok(frame) => Ok(frame),
        Err(_) if version != PROTOCOL_VERSION_2 => {
            // Payload region too wide for v1; fall back to v2 framing
            framed.version = PROTOCOL_VERSION_2;
            binary::encode(&framed)
        }
        Err(e) => Err(e),
    }
}
