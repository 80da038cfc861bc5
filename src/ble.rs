use async_trait::async_trait;
use btleplug::{
    api::{
        AddressType as BleAddressType, Central, Characteristic, Manager as _, Peripheral as _,
        ScanFilter, WriteType,
    },
    platform::{Adapter, Manager, Peripheral},
};
use bytes::Bytes;
use futures::stream::StreamExt;
use std::time::Duration;
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{timeout, Instant},
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    error::{Result, Sem6000Error},
    transport::{FragmentReceiver, Transport, FRAGMENT_QUEUE_DEPTH},
    types::{AddressType, ConnectionParams, DeviceInfo},
    CONTROL_CHAR_UUID, NAME_CHAR_UUID, SEM6000_SERVICE_UUID,
};

/// Interval between peripheral lookups while scanning for a known address
const SCAN_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// [`Transport`] over the host Bluetooth stack
pub struct BleTransport {
    manager: Manager,
    link: Option<BleLink>,
}

/// Established connection to one plug
struct BleLink {
    peripheral: Peripheral,
    control_char: Characteristic,
    name_char: Option<Characteristic>,
    forwarder: JoinHandle<()>,
}

impl BleTransport {
    /// Create a new BLE transport
    ///
    /// # Errors
    ///
    /// Returns [`Sem6000Error::Ble`] if the Bluetooth manager cannot be initialized.
    pub async fn new() -> Result<Self> {
        let manager = Manager::new().await?;

        Ok(Self {
            manager,
            link: None,
        })
    }

    /// Scan for plugs advertising the SEM6000 service
    ///
    /// Scans for `params.scan_timeout_ms` on the adapter selected by
    /// `params.interface`.
    ///
    /// # Errors
    ///
    /// Returns [`Sem6000Error::DeviceNotFound`] if no matching adapter exists,
    /// or [`Sem6000Error::Ble`] for other Bluetooth-related errors.
    pub async fn discover(&self, params: &ConnectionParams) -> Result<Vec<DeviceInfo>> {
        info!("Starting scan for SEM6000 devices...");

        let central = self.adapter(params).await?;
        central.start_scan(service_filter()?).await?;

        tokio::time::sleep(Duration::from_millis(params.scan_timeout_ms)).await;

        central.stop_scan().await?;

        let service = parse_uuid(SEM6000_SERVICE_UUID, "service")?;
        let mut devices = Vec::new();
        for peripheral in central.peripherals().await? {
            if !is_sem6000_device(&peripheral, service).await {
                debug!("Skipping {}: no SEM6000 service advertised", peripheral.address());
                continue;
            }

            let device_info = extract_device_info(&peripheral).await;
            info!(
                "Found SEM6000 device: {} ({})",
                device_info.address,
                device_info.name.as_deref().unwrap_or("unnamed")
            );
            devices.push(device_info);
        }

        info!("Scan completed. Found {} SEM6000 device(s)", devices.len());
        Ok(devices)
    }

    async fn adapter(&self, params: &ConnectionParams) -> Result<Adapter> {
        let adapters = self.manager.adapters().await?;

        let Some(interface) = params.interface.as_deref() else {
            return adapters
                .into_iter()
                .next()
                .ok_or_else(|| Sem6000Error::DeviceNotFound("no Bluetooth adapter".to_string()));
        };

        for adapter in adapters {
            if adapter.adapter_info().await?.starts_with(interface) {
                return Ok(adapter);
            }
        }

        Err(Sem6000Error::DeviceNotFound(format!(
            "no Bluetooth adapter named {interface}"
        )))
    }

    async fn find_peripheral(
        &self,
        central: &Adapter,
        params: &ConnectionParams,
    ) -> Result<Peripheral> {
        central.start_scan(service_filter()?).await?;

        let deadline = Instant::now() + Duration::from_millis(params.scan_timeout_ms);
        let found = loop {
            let peripherals = central.peripherals().await?;
            if let Some(peripheral) = peripherals.into_iter().find(|p| {
                p.address()
                    .to_string()
                    .eq_ignore_ascii_case(&params.address)
            }) {
                break Some(peripheral);
            }

            if Instant::now() >= deadline {
                break None;
            }
            tokio::time::sleep(SCAN_POLL_INTERVAL).await;
        };

        central.stop_scan().await?;

        found.ok_or_else(|| Sem6000Error::DeviceNotFound(params.address.clone()))
    }

    fn link(&self) -> Result<&BleLink> {
        self.link.as_ref().ok_or(Sem6000Error::NotConnected)
    }
}

#[async_trait]
impl Transport for BleTransport {
    async fn open(&mut self, params: &ConnectionParams) -> Result<FragmentReceiver> {
        info!("Connecting to device: {}", params.address);

        self.close().await?;

        let central = self.adapter(params).await?;
        let peripheral = self.find_peripheral(&central, params).await?;

        if let Ok(Some(properties)) = peripheral.properties().await {
            let advertised = properties.address_type.map(|t| match t {
                BleAddressType::Public => AddressType::Public,
                BleAddressType::Random => AddressType::Random,
            });
            if advertised.is_some_and(|t| t != params.address_type) {
                warn!(
                    "Device {} advertises address type {:?}, configured {:?}",
                    params.address, advertised, params.address_type
                );
            }
        }

        timeout(
            Duration::from_millis(params.timeout_ms),
            peripheral.connect(),
        )
        .await
        .map_err(|_| {
            Sem6000Error::ConnectionFailed(format!(
                "timed out after {}ms",
                params.timeout_ms
            ))
        })?
        .map_err(|e| Sem6000Error::ConnectionFailed(e.to_string()))?;

        peripheral.discover_services().await?;

        let control_uuid = parse_uuid(CONTROL_CHAR_UUID, "control characteristic")?;
        let name_uuid = parse_uuid(NAME_CHAR_UUID, "name characteristic")?;

        let characteristics = peripheral.characteristics();
        let control_char = characteristics
            .iter()
            .find(|c| c.uuid == control_uuid)
            .ok_or_else(|| Sem6000Error::Transport("control characteristic not found".to_string()))?
            .clone();
        let name_char = characteristics.iter().find(|c| c.uuid == name_uuid).cloned();

        peripheral.subscribe(&control_char).await?;

        let (sender, receiver) = mpsc::channel(FRAGMENT_QUEUE_DEPTH);
        let notifications = peripheral.notifications().await?;
        let forwarder = tokio::spawn(forward_notifications(
            notifications,
            control_char.uuid,
            sender,
        ));

        info!("Successfully connected to {}", params.address);

        self.link = Some(BleLink {
            peripheral,
            control_char,
            name_char,
            forwarder,
        });

        Ok(receiver)
    }

    async fn send_bytes(&mut self, data: &[u8]) -> Result<()> {
        let link = self.link()?;
        debug!("Writing frame: {:02X?}", data);

        link.peripheral
            .write(&link.control_char, data, WriteType::WithResponse)
            .await
            .map_err(|e| Sem6000Error::Transport(format!("Failed to write frame: {e}")))
    }

    async fn is_link_up(&self) -> bool {
        match &self.link {
            Some(link) => link.peripheral.is_connected().await.unwrap_or(false),
            None => false,
        }
    }

    async fn close(&mut self) -> Result<()> {
        let Some(link) = self.link.take() else {
            return Ok(());
        };

        link.forwarder.abort();

        if link.peripheral.is_connected().await.unwrap_or(false) {
            link.peripheral.disconnect().await?;
        }

        info!("Disconnected from {}", link.peripheral.address());
        Ok(())
    }

    async fn read_device_name(&mut self) -> Result<String> {
        let link = self.link()?;
        let name_char = link
            .name_char
            .as_ref()
            .ok_or_else(|| Sem6000Error::Transport("name characteristic not found".to_string()))?;

        let value = link.peripheral.read(name_char).await?;
        Ok(String::from_utf8_lossy(&value).trim_end_matches('\0').to_string())
    }
}

impl Drop for BleTransport {
    fn drop(&mut self) {
        if let Some(link) = &self.link {
            link.forwarder.abort();
        }
    }
}

/// Push every value received on the control characteristic into the fragment queue
async fn forward_notifications(
    mut notifications: impl futures::Stream<Item = btleplug::api::ValueNotification> + Unpin,
    control_uuid: Uuid,
    sender: mpsc::Sender<Bytes>,
) {
    while let Some(data) = notifications.next().await {
        if data.uuid != control_uuid {
            continue;
        }

        debug!("Received fragment: {:02X?}", data.value);
        if sender.send(Bytes::from(data.value)).await.is_err() {
            break;
        }
    }

    debug!("Notification stream ended");
}

fn parse_uuid(uuid: &str, what: &str) -> Result<Uuid> {
    Uuid::parse_str(uuid).map_err(|e| Sem6000Error::Transport(format!("Invalid {what} UUID: {e}")))
}

fn service_filter() -> Result<ScanFilter> {
    Ok(ScanFilter {
        services: vec![parse_uuid(SEM6000_SERVICE_UUID, "service")?],
    })
}

/// Check whether a peripheral advertises the SEM6000 service
///
/// The adapter also reports cached devices that did not match the scan filter.
async fn is_sem6000_device(peripheral: &Peripheral, service: Uuid) -> bool {
    match peripheral.properties().await {
        Ok(Some(properties)) => advertises_service(&properties.services, service),
        _ => false,
    }
}

fn advertises_service(services: &[Uuid], service: Uuid) -> bool {
    services.contains(&service)
}

/// Extract device information from BLE properties
async fn extract_device_info(peripheral: &Peripheral) -> DeviceInfo {
    let address = peripheral.address().to_string();

    match peripheral.properties().await {
        Ok(Some(properties)) => DeviceInfo {
            address,
            name: properties.local_name,
            rssi: properties.rssi,
        },
        _ => DeviceInfo {
            address,
            name: None,
            rssi: None,
        },
    }
}
