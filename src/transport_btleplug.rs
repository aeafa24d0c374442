//! btleplug-backed GATT transport.
// TODO: more efficient linux-only transport based on `bluer`

use std::time::{Duration, SystemTime};

use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::stream::StreamExt;
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::error::DfuError;
use crate::protocol::{DFU_CTRL_POINT_UUID, DFU_PACKET_UUID};
use crate::transport::{GattClient, GattSession, Notification};

/// How long a single scan pass may run before the target counts as absent.
const SCAN_TIMEOUT: Duration = Duration::from_secs(5);

pub struct BtleplugClient {
    central: Adapter,
}

impl BtleplugClient {
    pub async fn new() -> Result<Self, DfuError> {
        let manager = Manager::new()
            .await
            .map_err(|_| DfuError::BluetoothDisabled)?;
        let adapters = manager
            .adapters()
            .await
            .map_err(|_| DfuError::BluetoothDisabled)?;
        let central = adapters
            .into_iter()
            .next()
            .ok_or(DfuError::BluetoothDisabled)?;
        Ok(BtleplugClient { central })
    }

    async fn scan(&self, name: &str) -> Result<Option<Peripheral>, DfuError> {
        let mut events = self
            .central
            .events()
            .await
            .map_err(|_| DfuError::FailedToConnect)?;
        self.central
            .start_scan(ScanFilter::default())
            .await
            .map_err(|_| DfuError::FailedToConnect)?;

        let mut found = None;
        while let Ok(Some(event)) = timeout(SCAN_TIMEOUT, events.next()).await {
            let CentralEvent::DeviceDiscovered(id) = event else {
                continue;
            };
            let Ok(peripheral) = self.central.peripheral(&id).await else {
                continue;
            };
            let local_name = peripheral
                .properties()
                .await
                .ok()
                .flatten()
                .and_then(|props| props.local_name);
            if let Some(n) = local_name {
                log::debug!("discovered [{n}] at [{id}]");
                if n == name {
                    found = Some(peripheral);
                    break;
                }
            }
        }
        let _ = self.central.stop_scan().await;
        Ok(found)
    }
}

impl GattClient for BtleplugClient {
    type Target = Peripheral;
    type Session = BtleplugSession;

    async fn find_by_name(&self, name: &str) -> Result<Option<Peripheral>, DfuError> {
        self.scan(name).await
    }

    async fn connect(&self, target: &Peripheral) -> Result<BtleplugSession, DfuError> {
        let peripheral = target.clone();
        peripheral
            .connect()
            .await
            .map_err(|_| DfuError::FailedToConnect)?;
        peripheral
            .discover_services()
            .await
            .map_err(|_| DfuError::ServiceDiscoveryFailed)?;

        let control_point = find_characteristic(&peripheral, DFU_CTRL_POINT_UUID)?;
        let packet = find_characteristic(&peripheral, DFU_PACKET_UUID)?;
        Ok(BtleplugSession {
            peripheral,
            control_point,
            packet,
        })
    }
}

fn find_characteristic(
    peripheral: &Peripheral,
    uuid: uuid::Uuid,
) -> Result<Characteristic, DfuError> {
    peripheral
        .characteristics()
        .into_iter()
        .find(|c| c.uuid == uuid)
        .ok_or(DfuError::DeviceNotSupported)
}

pub struct BtleplugSession {
    peripheral: Peripheral,
    control_point: Characteristic,
    packet: Characteristic,
}

impl GattSession for BtleplugSession {
    async fn write_control_point(&self, bytes: &[u8], with_ack: bool) -> Result<(), DfuError> {
        let write_type = if with_ack {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };
        self.peripheral
            .write(&self.control_point, bytes, write_type)
            .await
            .map_err(|_| DfuError::WritingCharacteristicFailed)
    }

    async fn write_packet(&self, bytes: &[u8]) -> Result<(), DfuError> {
        self.peripheral
            .write(&self.packet, bytes, WriteType::WithoutResponse)
            .await
            .map_err(|_| DfuError::WritingCharacteristicFailed)
    }

    async fn subscribe_control_point(
        &self,
        queue: mpsc::Sender<Notification>,
    ) -> Result<(), DfuError> {
        let mut notifications = self
            .peripheral
            .notifications()
            .await
            .map_err(|_| DfuError::EnablingControlPointFailed)?;
        self.peripheral
            .subscribe(&self.control_point)
            .await
            .map_err(|_| DfuError::EnablingControlPointFailed)?;

        let ctrl_uuid = self.control_point.uuid;
        tokio::spawn(async move {
            while let Some(ntf) = notifications.next().await {
                if ntf.uuid != ctrl_uuid {
                    continue;
                }
                let notification = Notification {
                    sender: ntf.uuid,
                    received: SystemTime::now(),
                    data: ntf.value,
                };
                if queue.send(notification).await.is_err() {
                    break;
                }
            }
        });
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.peripheral.is_connected().await.unwrap_or(false)
    }

    async fn disconnect(&self) -> Result<(), DfuError> {
        self.peripheral
            .disconnect()
            .await
            .map_err(|_| DfuError::DeviceDisconnected)
    }
}
