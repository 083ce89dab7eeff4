//! Bluetooth LE transport
//!
//! Central role rides on btleplug: scan for the mesh service, connect,
//! subscribe to the characteristic and stream frames. Peripheral role
//! (advertising + GATT server) is platform-specific and plugs in through
//! the `PeripheralRole` trait, since btleplug lacks peripheral mode on
//! most platforms.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::stream::StreamExt;
use parking_lot::Mutex;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use super::assembler::StreamAssembler;
use super::scan::{ReconnectBackoff, CHARACTERISTIC_UUID, SERVICE_UUID};
use super::{LinkId, LinkRole, Transport, TransportEvent, TransportEventSender};
use crate::error::{Error, Result};

/// Platform GATT server backend for the peripheral role
#[async_trait]
pub trait PeripheralRole: Send + Sync {
    /// Start advertising the mesh service
    async fn start_advertising(&self) -> Result<()>;
    async fn stop_advertising(&self) -> Result<()>;
    /// Notify one subscribed central with a frame
    async fn notify(&self, link: LinkId, frame: &[u8]) -> Result<()>;
}

struct CentralLink {
    peripheral: Peripheral,
    assembler: StreamAssembler,
}

/// BLE transport: btleplug central plus an optional peripheral backend
pub struct BleTransport {
    adapter: Adapter,
    events: TransportEventSender,
    peripheral_role: Option<Arc<dyn PeripheralRole>>,
    next_link: AtomicU64,
    links: Arc<RwLock<HashMap<LinkId, CentralLink>>>,
    by_device: Arc<RwLock<HashMap<PeripheralId, LinkId>>>,
    backoffs: Arc<Mutex<HashMap<PeripheralId, ReconnectBackoff>>>,
}

impl BleTransport {
    /// Open the first adapter and start the event pump
    pub async fn new(
        events: TransportEventSender,
        peripheral_role: Option<Arc<dyn PeripheralRole>>,
    ) -> Result<Arc<Self>> {
        let manager = Manager::new().await.map_err(radio_err)?;
        let adapter = manager
            .adapters()
            .await
            .map_err(radio_err)?
            .into_iter()
            .next()
            .ok_or_else(|| Error::RadioUnavailable("no bluetooth adapter".into()))?;

        let transport = Arc::new(Self {
            adapter,
            events,
            peripheral_role,
            next_link: AtomicU64::new(1),
            links: Arc::new(RwLock::new(HashMap::new())),
            by_device: Arc::new(RwLock::new(HashMap::new())),
            backoffs: Arc::new(Mutex::new(HashMap::new())),
        });
        tokio::spawn(transport.clone().run_event_pump());
        Ok(transport)
    }

    /// Pump adapter events: discoveries trigger connections, disconnects
    /// tear links down. Runs until the adapter stream ends.
    async fn run_event_pump(self: Arc<Self>) {
        let mut stream = match self.adapter.events().await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(error = %e, "adapter event stream unavailable");
                return;
            }
        };

        while let Some(event) = stream.next().await {
            match event {
                CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                    if self.by_device.read().await.contains_key(&id) {
                        continue;
                    }
                    let transport = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = transport.try_connect(id.clone()).await {
                            debug!(device = ?id, error = %e, "connection attempt failed");
                        }
                    });
                }
                CentralEvent::DeviceDisconnected(id) => {
                    self.handle_disconnect(&id).await;
                }
                _ => {}
            }
        }
    }

    async fn try_connect(self: &Arc<Self>, id: PeripheralId) -> Result<()> {
        let delay = self
            .backoffs
            .lock()
            .entry(id.clone())
            .or_insert_with(ReconnectBackoff::new)
            .next_delay();
        // First attempt goes out immediately; retries back off
        if delay > std::time::Duration::from_secs(1) {
            tokio::time::sleep(delay).await;
        }

        let peripheral = self
            .adapter
            .peripheral(&id)
            .await
            .map_err(|e| Error::LinkFailure(e.to_string()))?;

        // Only talk to devices advertising the mesh service
        let properties = peripheral
            .properties()
            .await
            .map_err(|e| Error::LinkFailure(e.to_string()))?;
        let advertises_service = properties
            .as_ref()
            .map(|p| p.services.contains(&SERVICE_UUID))
            .unwrap_or(false);
        if !advertises_service {
            return Ok(());
        }
        let rssi = properties.and_then(|p| p.rssi);

        peripheral
            .connect()
            .await
            .map_err(|e| Error::LinkFailure(e.to_string()))?;
        peripheral
            .discover_services()
            .await
            .map_err(|e| Error::LinkFailure(e.to_string()))?;

        let characteristic = peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == CHARACTERISTIC_UUID)
            .ok_or_else(|| Error::LinkFailure("mesh characteristic missing".into()))?;
        peripheral
            .subscribe(&characteristic)
            .await
            .map_err(|e| Error::LinkFailure(e.to_string()))?;

        let link = self.next_link.fetch_add(1, Ordering::Relaxed);
        self.links.write().await.insert(
            link,
            CentralLink {
                peripheral: peripheral.clone(),
                assembler: StreamAssembler::new(),
            },
        );
        self.by_device.write().await.insert(id.clone(), link);
        self.backoffs.lock().remove(&id);

        let _ = self.events.send(TransportEvent::LinkEstablished {
            link,
            role: LinkRole::Central,
        });
        if let Some(rssi) = rssi {
            let _ = self.events.send(TransportEvent::RssiUpdated { link, rssi });
        }

        // Notification pump for this link
        let transport = self.clone();
        let mut notifications = peripheral
            .notifications()
            .await
            .map_err(|e| Error::LinkFailure(e.to_string()))?;
        tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                if notification.uuid != CHARACTERISTIC_UUID {
                    continue;
                }
                let frames = {
                    let mut links = transport.links.write().await;
                    match links.get_mut(&link) {
                        Some(entry) => entry.assembler.push(&notification.value),
                        None => break,
                    }
                };
                for frame in frames {
                    let _ = transport
                        .events
                        .send(TransportEvent::FrameReceived { link, frame });
                }
            }
        });

        debug!(link, "central link up");
        Ok(())
    }

    async fn handle_disconnect(&self, id: &PeripheralId) {
        let link = self.by_device.write().await.remove(id);
        if let Some(link) = link {
            self.links.write().await.remove(&link);
            let _ = self.events.send(TransportEvent::LinkClosed {
                link,
                reason: "ble disconnect".into(),
            });
        }
    }
}

fn radio_err(e: btleplug::Error) -> Error {
    match e {
        btleplug::Error::PermissionDenied => Error::PermissionMissing(e.to_string()),
        other => Error::RadioUnavailable(other.to_string()),
    }
}

#[async_trait]
impl Transport for BleTransport {
    async fn start(&self) -> Result<()> {
        // The event pump spins up with the transport; scanning and
        // advertising are driven by the duty-cycle controller
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let _ = self.adapter.stop_scan().await;
        let links: Vec<Peripheral> = self
            .links
            .write()
            .await
            .drain()
            .map(|(_, entry)| entry.peripheral)
            .collect();
        for peripheral in links {
            let _ = peripheral.disconnect().await;
        }
        self.by_device.write().await.clear();
        Ok(())
    }

    async fn send_frame(&self, link: LinkId, frame: &[u8]) -> Result<()> {
        let links = self.links.read().await;
        if let Some(entry) = links.get(&link) {
            let characteristic = entry
                .peripheral
                .characteristics()
                .into_iter()
                .find(|c| c.uuid == CHARACTERISTIC_UUID)
                .ok_or_else(|| Error::LinkFailure("mesh characteristic missing".into()))?;
            return entry
                .peripheral
                .write(&characteristic, frame, WriteType::WithoutResponse)
                .await
                .map_err(|e| Error::LinkFailure(e.to_string()));
        }
        drop(links);

        // Not a central link; a peripheral backend may own it
        match &self.peripheral_role {
            Some(backend) => backend.notify(link, frame).await,
            None => Err(Error::LinkFailure(format!("unknown link {}", link))),
        }
    }

    async fn set_scanning(&self, on: bool) -> Result<()> {
        if on {
            self.adapter
                .start_scan(ScanFilter {
                    services: vec![SERVICE_UUID],
                })
                .await
                .map_err(radio_err)
        } else {
            self.adapter.stop_scan().await.map_err(radio_err)
        }
    }

    async fn set_advertising(&self, on: bool) -> Result<()> {
        match &self.peripheral_role {
            Some(backend) => {
                if on {
                    backend.start_advertising().await
                } else {
                    backend.stop_advertising().await
                }
            }
            // Central-only operation is still a functioning mesh member
            None => Ok(()),
        }
    }
}
