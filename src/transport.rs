use std::fmt;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::BDAddr;
use futures::Stream;
use uuid::Uuid;

use crate::error::TransportError;

/// Nordic legacy DFU service & characteristic UUIDs
///
/// from [Legacy DFU BLE Service](https://infocenter.nordicsemi.com/topic/sdk_nrf5_v11.0.0/bledfu_transport_bleservice.html)
pub mod dfu_uuids {
    /// Legacy DFU Service
    pub const SERVICE: uuid::Uuid = uuid::Uuid::from_u128(0x00001530_1212_EFDE_1523_785FEABCD123);
    /// Control Point Characteristic
    pub const CTRL_PT: uuid::Uuid = uuid::Uuid::from_u128(0x00001531_1212_EFDE_1523_785FEABCD123);
    /// Packet Characteristic
    pub const DATA_PT: uuid::Uuid = uuid::Uuid::from_u128(0x00001532_1212_EFDE_1523_785FEABCD123);
}

/// The two characteristics of the DFU service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DfuCharacteristic {
    ControlPoint,
    Packet,
}

impl DfuCharacteristic {
    pub fn uuid(self) -> Uuid {
        match self {
            DfuCharacteristic::ControlPoint => dfu_uuids::CTRL_PT,
            DfuCharacteristic::Packet => dfu_uuids::DATA_PT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    WithResponse,
    WithoutResponse,
}

/// Advertised identity of a peripheral. Only discovery creates these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeripheralHandle {
    address: BDAddr,
    name: Option<String>,
    service_uuids: Vec<Uuid>,
}

impl PeripheralHandle {
    pub(crate) fn new(address: BDAddr, name: Option<String>, service_uuids: Vec<Uuid>) -> Self {
        Self {
            address,
            name,
            service_uuids,
        }
    }

    pub fn address(&self) -> BDAddr {
        self.address
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn advertises(&self, service: &Uuid) -> bool {
        self.service_uuids.contains(service)
    }
}

impl fmt::Display for PeripheralHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{} ({})", name, self.address),
            None => write!(f, "{}", self.address),
        }
    }
}

/// One scan result.
#[derive(Debug, Clone)]
pub struct Advertisement {
    pub peripheral: PeripheralHandle,
    pub rssi: Option<i16>,
}

/// Narrows a scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveryFilter {
    pub address: Option<BDAddr>,
    pub services: Vec<Uuid>,
}

impl DiscoveryFilter {
    pub fn address(address: BDAddr) -> Self {
        Self {
            address: Some(address),
            services: Vec::new(),
        }
    }

    pub fn matches(&self, peripheral: &PeripheralHandle) -> bool {
        if let Some(addr) = self.address {
            if addr != peripheral.address() {
                return false;
            }
        }
        self.services.is_empty() || self.services.iter().any(|s| peripheral.advertises(s))
    }
}

/// Control-point notifications; the stream ends when the link goes down.
pub type FrameStream = Pin<Box<dyn Stream<Item = Vec<u8>> + Send>>;

/// A connected DFU-capable peripheral.
#[async_trait]
pub trait DfuLink: Send + Sync {
    /// MTU of the BLE link
    fn mtu(&self) -> usize;
    /// Write to one of the DFU characteristics
    async fn write(&self, chr: DfuCharacteristic, bytes: &[u8], mode: WriteMode) -> Result<(), TransportError>;
    /// Subscribe to control point notifications
    async fn subscribe(&self) -> Result<FrameStream, TransportError>;
    async fn disconnect(&self) -> Result<(), TransportError>;
}

/// Scanning and connecting side of the BLE stack.
#[async_trait]
pub trait BleCentral: Send + Sync {
    type Link: DfuLink;

    async fn scan(&self, window: Duration, filter: &DiscoveryFilter) -> Result<Vec<Advertisement>, TransportError>;
    async fn connect(&self, peripheral: &PeripheralHandle) -> Result<Self::Link, TransportError>;
}
