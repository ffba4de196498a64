use crate::config::DEFAULT_MTU;
use crate::error::TransportError;
use crate::transport::dfu_uuids::CTRL_PT;
use crate::transport::{
    Advertisement, BleCentral, DfuCharacteristic, DfuLink, DiscoveryFilter, FrameStream, PeripheralHandle, WriteMode,
};

use async_trait::async_trait;
use btleplug::api::{Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType};
use btleplug::platform::{Adapter, Peripheral, PeripheralId};
use futures::stream::StreamExt;
use log::{debug, info};
use std::collections::HashSet;
use std::time::Duration;

const WRITE_TIMEOUT: Duration = Duration::from_millis(500);

fn find_characteristic_by_uuid(peripheral: &Peripheral, uuid: uuid::Uuid) -> Result<Characteristic, TransportError> {
    peripheral
        .characteristics()
        .into_iter()
        .find(|c| c.uuid == uuid)
        .ok_or(TransportError::MissingCharacteristic(uuid))
}

async fn handle_for(peripheral: &Peripheral) -> Result<Option<Advertisement>, btleplug::Error> {
    Ok(peripheral.properties().await?.map(|props| Advertisement {
        peripheral: PeripheralHandle::new(props.address, props.local_name, props.services),
        rssi: props.rssi,
    }))
}

/// Central backed by a host Bluetooth adapter.
pub struct BtleplugCentral {
    adapter: Adapter,
    mtu: usize,
}

impl BtleplugCentral {
    /// Open adapter number `index`. `mtu` is what links report, since the
    /// platform cannot tell us.
    pub async fn new(index: usize, mtu: Option<usize>) -> Result<Self, TransportError> {
        let manager = btleplug::platform::Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .nth(index)
            .ok_or_else(|| TransportError::Scan(format!("no bluetooth adapter #{}", index)))?;
        info!("Using adapter: {}", adapter.adapter_info().await.unwrap_or_default());
        Ok(Self {
            adapter,
            // TODO query the negotiated MTU once btleplug exposes it
            mtu: mtu.unwrap_or(DEFAULT_MTU),
        })
    }

    async fn peripheral_at(&self, target: &PeripheralHandle) -> Result<Peripheral, TransportError> {
        for p in self.adapter.peripherals().await? {
            if p.address() == target.address() {
                return Ok(p);
            }
        }
        Err(TransportError::Connect(format!("{} is not known to the adapter", target)))
    }
}

#[async_trait]
impl BleCentral for BtleplugCentral {
    type Link = BtleplugLink;

    async fn scan(&self, window: Duration, filter: &DiscoveryFilter) -> Result<Vec<Advertisement>, TransportError> {
        debug!("scanning {:?} for {:?}", window, filter);
        let mut events = self.adapter.events().await?;
        self.adapter
            .start_scan(ScanFilter {
                services: filter.services.clone(),
            })
            .await
            .map_err(|e| TransportError::Scan(e.to_string()))?;

        let deadline = tokio::time::Instant::now() + window;
        let mut ids: Vec<PeripheralId> = Vec::new();
        let mut seen_ids = HashSet::new();
        while let Ok(Some(event)) = tokio::time::timeout_at(deadline, events.next()).await {
            if let CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) = event {
                if seen_ids.insert(id.clone()) {
                    ids.push(id);
                }
            }
        }
        self.adapter
            .stop_scan()
            .await
            .map_err(|e| TransportError::Scan(e.to_string()))?;

        let mut found = Vec::new();
        for id in ids {
            let peripheral = self.adapter.peripheral(&id).await?;
            match handle_for(&peripheral).await? {
                Some(adv) if filter.matches(&adv.peripheral) => {
                    debug!("seen {} rssi {:?}", adv.peripheral, adv.rssi);
                    found.push(adv);
                }
                _ => {}
            }
        }
        Ok(found)
    }

    async fn connect(&self, target: &PeripheralHandle) -> Result<BtleplugLink, TransportError> {
        let peripheral = self.peripheral_at(target).await?;
        peripheral
            .connect()
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        peripheral.discover_services().await?;

        let control_point = find_characteristic_by_uuid(&peripheral, DfuCharacteristic::ControlPoint.uuid())?;
        let data_point = find_characteristic_by_uuid(&peripheral, DfuCharacteristic::Packet.uuid())?;
        Ok(BtleplugLink {
            adapter: self.adapter.clone(),
            peripheral,
            control_point,
            data_point,
            mtu: self.mtu,
        })
    }
}

/// Connected DFU service on a btleplug peripheral.
pub struct BtleplugLink {
    adapter: Adapter,
    peripheral: Peripheral,
    control_point: Characteristic,
    data_point: Characteristic,
    mtu: usize,
}

#[async_trait]
impl DfuLink for BtleplugLink {
    fn mtu(&self) -> usize {
        self.mtu
    }

    async fn write(&self, chr: DfuCharacteristic, bytes: &[u8], mode: WriteMode) -> Result<(), TransportError> {
        let characteristic = match chr {
            DfuCharacteristic::ControlPoint => &self.control_point,
            DfuCharacteristic::Packet => &self.data_point,
        };
        let write_type = match mode {
            WriteMode::WithResponse => WriteType::WithResponse,
            WriteMode::WithoutResponse => WriteType::WithoutResponse,
        };
        match tokio::time::timeout(WRITE_TIMEOUT, self.peripheral.write(characteristic, bytes, write_type)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(TransportError::Write(e.to_string())),
            Err(_) => Err(TransportError::Write(format!("no completion within {:?}", WRITE_TIMEOUT))),
        }
    }

    /// Control point notifications, ending when the peripheral disconnects.
    async fn subscribe(&self) -> Result<FrameStream, TransportError> {
        self.peripheral
            .subscribe(&self.control_point)
            .await
            .map_err(|e| TransportError::Subscribe(e.to_string()))?;
        let notifications = self.peripheral.notifications().await?;
        let mut events = self.adapter.events().await?;

        let id = self.peripheral.id();
        let gone = async move {
            while let Some(event) = events.next().await {
                if matches!(event, CentralEvent::DeviceDisconnected(ref d) if *d == id) {
                    debug!("adapter reports disconnect");
                    return;
                }
            }
        };
        let frames = notifications
            .filter_map(|n| futures::future::ready((n.uuid == CTRL_PT).then_some(n.value)))
            .take_until(gone);
        Ok(Box::pin(frames))
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        if self.peripheral.is_connected().await? {
            self.peripheral.disconnect().await?;
        }
        Ok(())
    }
}
