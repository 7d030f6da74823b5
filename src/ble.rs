//! Bluetooth LE transport for Daly BMS devices using the `bluest` crate.
//!
//! The BMS exposes a vendor service with a write characteristic (`0xFFF2`) for requests
//! and a notify characteristic (`0xFFF1`) delivering the response frames, often split
//! over several notifications.
//!
//! # Example
//!
//! ```no_run
//! use dalyble_lib::ble::BleTransport;
//! use dalyble_lib::session::{acquire, SessionConfig};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), dalyble_lib::session::TransportError> {
//!     let transport = Arc::new(BleTransport::new().await?);
//!     let devices = vec!["41:19:06:01:65:82".to_string()];
//!     for event in acquire(transport, &devices, &SessionConfig::default()).await {
//!         println!("{event:?}");
//!     }
//!     Ok(())
//! }
//! ```

use crate::session::{Connection, Notifications, Transport, TransportError};
use async_trait::async_trait;
use bluest::{Adapter, AdvertisingDevice, Characteristic, Device, Uuid};
use futures_util::StreamExt;
use std::time::Duration;

/// Characteristic delivering the response frames.
pub const NOTIFY_CHARACTERISTIC: Uuid = Uuid::from_u128(0x0000fff1_0000_1000_8000_00805f9b34fb);
/// Characteristic accepting request frames.
pub const WRITE_CHARACTERISTIC: Uuid = Uuid::from_u128(0x0000fff2_0000_1000_8000_00805f9b34fb);

pub const DEFAULT_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(30);

/// Opens BLE connections through the default adapter.
#[derive(Debug, Clone)]
pub struct BleTransport {
    adapter: Adapter,
    discovery_timeout: Duration,
}

impl BleTransport {
    /// Waits for the default Bluetooth adapter to become available.
    pub async fn new() -> Result<Self, TransportError> {
        let adapter = Adapter::default()
            .await
            .ok_or_else(|| TransportError::Unavailable("Bluetooth adapter".into()))?;
        adapter.wait_available().await?;
        Ok(Self {
            adapter,
            discovery_timeout: DEFAULT_DISCOVERY_TIMEOUT,
        })
    }

    /// Sets how long a scan may take to find a device.
    pub fn set_discovery_timeout(&mut self, timeout: Duration) {
        log::trace!("set discovery timeout to {timeout:?}");
        self.discovery_timeout = timeout;
    }

    async fn discover(&self, address: &str) -> Result<Device, TransportError> {
        let mut scan = self.adapter.scan(&[]).await?;
        while let Some(found) = scan.next().await {
            if matches_address(&found, address) {
                log::debug!("found device {:?} for '{address}'", found.device.id());
                return Ok(found.device);
            }
        }
        Err(TransportError::NotFound(address.to_string()))
    }
}

/// Matches on the advertised name or on the platform device id.
///
/// Device ids are platform specific and only expose the address through `Debug`.
fn matches_address(found: &AdvertisingDevice, address: &str) -> bool {
    let by_name = found
        .adv_data
        .local_name
        .as_deref()
        .is_some_and(|name| name.eq_ignore_ascii_case(address));
    by_name
        || format!("{:?}", found.device.id())
            .to_ascii_lowercase()
            .contains(&address.to_ascii_lowercase())
}

async fn find_characteristic(device: &Device, uuid: Uuid) -> Result<Characteristic, TransportError> {
    for service in device.discover_services().await? {
        let characteristic = service
            .discover_characteristics_with_uuid(uuid)
            .await?
            .into_iter()
            .next();
        if let Some(characteristic) = characteristic {
            return Ok(characteristic);
        }
    }
    Err(TransportError::Unavailable(format!("characteristic {uuid}")))
}

#[async_trait]
impl Transport for BleTransport {
    async fn connect(&self, address: &str) -> Result<Box<dyn Connection>, TransportError> {
        let device = tokio::time::timeout(self.discovery_timeout, self.discover(address))
            .await
            .map_err(|_| TransportError::NotFound(address.to_string()))??;

        self.adapter.connect_device(&device).await?;

        let notify = find_characteristic(&device, NOTIFY_CHARACTERISTIC).await?;
        let write = find_characteristic(&device, WRITE_CHARACTERISTIC).await?;

        Ok(Box::new(BleConnection {
            adapter: self.adapter.clone(),
            device,
            notify,
            write,
        }))
    }
}

struct BleConnection {
    adapter: Adapter,
    device: Device,
    notify: Characteristic,
    write: Characteristic,
}

#[async_trait]
impl Connection for BleConnection {
    async fn subscribe(&self) -> Result<Notifications<'_>, TransportError> {
        let notifications = self.notify.notify().await?;
        Ok(notifications
            .map(|notification| notification.map_err(TransportError::from))
            .boxed())
    }

    async fn write(&self, bytes: &[u8]) -> Result<(), TransportError> {
        self.write.write(bytes).await?;
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.adapter.disconnect_device(&self.device).await?;
        Ok(())
    }
}
