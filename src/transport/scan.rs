//! Scan/advertise duty cycling and the GATT service shape

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use super::Transport;
use crate::error::Result;

/// Primary mesh service
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0xF47B5E2D_4A9E_4C5A_9B3F_8E1D2C3A4B5C);

/// The single read/write/write-no-response/notify characteristic
pub const CHARACTERISTIC_UUID: Uuid = Uuid::from_u128(0xA1B2C3D4_E5F6_4A5B_8C9D_0E1F2A3B4C5D);

/// Client characteristic configuration descriptor
pub const CCCD_UUID: Uuid = Uuid::from_u128(0x00002902_0000_1000_8000_00805F9B34FB);

/// Battery class governing the radio duty cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerMode {
    Normal,
    PowerSave,
    UltraLow,
}

/// One row of the duty-cycle table
#[derive(Debug, Clone, Copy)]
pub struct DutyCycle {
    pub scan_on: Duration,
    pub scan_off: Duration,
    pub max_connections: usize,
}

impl PowerMode {
    pub fn duty_cycle(self) -> DutyCycle {
        match self {
            PowerMode::Normal => DutyCycle {
                scan_on: Duration::from_secs(3),
                scan_off: Duration::from_secs(2),
                max_connections: 8,
            },
            PowerMode::PowerSave => DutyCycle {
                scan_on: Duration::from_secs(2),
                scan_off: Duration::from_secs(8),
                max_connections: 4,
            },
            PowerMode::UltraLow => DutyCycle {
                scan_on: Duration::from_secs(1),
                scan_off: Duration::from_secs(29),
                max_connections: 2,
            },
        }
    }
}

/// Exponential reconnect backoff: 1 s doubling to a 5 min cap
#[derive(Debug, Default)]
pub struct ReconnectBackoff {
    attempt: u32,
}

impl ReconnectBackoff {
    const BASE: Duration = Duration::from_secs(1);
    const CAP: Duration = Duration::from_secs(300);

    pub fn new() -> Self {
        Self { attempt: 0 }
    }

    pub fn next_delay(&mut self) -> Duration {
        let exponent = self.attempt.min(16);
        self.attempt = self.attempt.saturating_add(1);
        Self::BASE
            .saturating_mul(1u32 << exponent)
            .min(Self::CAP)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Drives the transport's scan windows and advertising according to the
/// selected power mode.
pub struct ScanAdvertiseController {
    transport: Arc<dyn Transport>,
    mode: Arc<RwLock<PowerMode>>,
    task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl ScanAdvertiseController {
    pub fn new(transport: Arc<dyn Transport>, mode: PowerMode) -> Self {
        Self {
            transport,
            mode: Arc::new(RwLock::new(mode)),
            task: parking_lot::Mutex::new(None),
        }
    }

    pub async fn power_mode(&self) -> PowerMode {
        *self.mode.read().await
    }

    pub async fn set_power_mode(&self, mode: PowerMode) {
        *self.mode.write().await = mode;
        debug!(?mode, "power mode changed");
    }

    /// Start advertising and begin the scan duty cycle
    pub async fn start(&self) -> Result<()> {
        self.transport.set_advertising(true).await?;

        let transport = self.transport.clone();
        let mode = self.mode.clone();
        let handle = tokio::spawn(async move {
            loop {
                let cycle = mode.read().await.duty_cycle();
                if let Err(e) = transport.set_scanning(true).await {
                    warn!(error = %e, "scan-on failed");
                }
                tokio::time::sleep(cycle.scan_on).await;
                if let Err(e) = transport.set_scanning(false).await {
                    warn!(error = %e, "scan-off failed");
                }
                tokio::time::sleep(cycle.scan_off).await;
            }
        });
        *self.task.lock() = Some(handle);
        Ok(())
    }

    /// Stop the duty cycle, scanning and advertising. Idempotent.
    pub async fn stop(&self) -> Result<()> {
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
        self.transport.set_scanning(false).await?;
        self.transport.set_advertising(false).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duty_cycle_table_tightens_with_power_mode() {
        let normal = PowerMode::Normal.duty_cycle();
        let save = PowerMode::PowerSave.duty_cycle();
        let ultra = PowerMode::UltraLow.duty_cycle();
        assert!(normal.scan_on > save.scan_on || normal.scan_off < save.scan_off);
        assert!(save.max_connections > ultra.max_connections);
        assert!(normal.max_connections >= save.max_connections);
    }

    #[test]
    fn backoff_doubles_to_cap() {
        let mut backoff = ReconnectBackoff::new();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
        assert_eq!(backoff.next_delay(), Duration::from_secs(2));
        assert_eq!(backoff.next_delay(), Duration::from_secs(4));
        for _ in 0..20 {
            let delay = backoff.next_delay();
            assert!(delay <= Duration::from_secs(300));
        }
        assert_eq!(backoff.next_delay(), Duration::from_secs(300));
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn canonical_uuids() {
        assert_eq!(
            SERVICE_UUID.to_string().to_uppercase(),
            "F47B5E2D-4A9E-4C5A-9B3F-8E1D2C3A4B5C"
        );
        assert_eq!(
            CHARACTERISTIC_UUID.to_string().to_uppercase(),
            "A1B2C3D4-E5F6-4A5B-8C9D-0E1F2A3B4C5D"
        );
        assert_eq!(
            CCCD_UUID.to_string(),
            "00002902-0000-1000-8000-00805f9b34fb"
        );
    }
}
