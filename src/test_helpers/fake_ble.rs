//! Scriptable in-memory BLE central and DFU bootloader.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::BDAddr;
use futures::channel::mpsc::{self, UnboundedReceiver, UnboundedSender};
use uuid::Uuid;

use crate::error::TransportError;
use crate::transport::{
    Advertisement, BleCentral, DfuCharacteristic, DfuLink, DiscoveryFilter, FrameStream, PeripheralHandle, WriteMode,
};

/// How the fake bootloader behaves on one connection.
#[derive(Debug, Clone)]
pub struct FakeScript {
    pub mtu: usize,
    pub refuse_connect: bool,
    /// `connect` never completes.
    pub hang_connect: bool,
    pub refuse_subscribe: bool,
    /// `subscribe` never completes.
    pub hang_subscribe: bool,
    /// Send a receipt every `prn` image packets once PRN is configured.
    pub prn_receipts: bool,
    /// Status byte per request opcode, success when absent.
    pub statuses: HashMap<u8, u8>,
    /// Opcodes that never get a response.
    pub silent: Vec<u8>,
    /// Echo this opcode instead of the real one in every response.
    pub echo: Option<u8>,
    /// Drop the link when this control opcode is written.
    pub drop_on: Option<u8>,
    /// Fail the ACTIVATE write itself, as a rebooting device often does.
    pub activate_write_fails: bool,
    /// Drop the link on the image packet after this many went through.
    pub drop_after_packets: Option<usize>,
}

impl Default for FakeScript {
    fn default() -> Self {
        Self {
            mtu: 247,
            refuse_connect: false,
            hang_connect: false,
            refuse_subscribe: false,
            hang_subscribe: false,
            prn_receipts: false,
            statuses: HashMap::new(),
            silent: Vec::new(),
            echo: None,
            drop_on: None,
            activate_write_fails: false,
            drop_after_packets: None,
        }
    }
}

impl FakeScript {
    pub fn healthy() -> Self {
        Self {
            prn_receipts: true,
            ..Self::default()
        }
    }

    pub fn status(mut self, opcode: u8, status: u8) -> Self {
        self.statuses.insert(opcode, status);
        self
    }
}

/// Everything written to a link, in order.
#[derive(Debug, Clone, Default)]
pub struct LinkLog {
    pub writes: Vec<(DfuCharacteristic, Vec<u8>, WriteMode)>,
    pub disconnects: usize,
    image_from: Option<usize>,
}

impl LinkLog {
    pub fn packet_writes(&self) -> Vec<Vec<u8>> {
        self.writes
            .iter()
            .filter(|(c, _, _)| *c == DfuCharacteristic::Packet)
            .map(|(_, b, _)| b.clone())
            .collect()
    }

    pub fn control_writes(&self) -> Vec<Vec<u8>> {
        self.writes
            .iter()
            .filter(|(c, _, _)| *c == DfuCharacteristic::ControlPoint)
            .map(|(_, b, _)| b.clone())
            .collect()
    }

    /// Packet writes after the RECEIVE trigger.
    pub fn image_writes(&self) -> Vec<Vec<u8>> {
        let from = self.image_from.unwrap_or(usize::MAX);
        self.writes
            .iter()
            .skip(from)
            .filter(|(c, _, _)| *c == DfuCharacteristic::Packet)
            .map(|(_, b, _)| b.clone())
            .collect()
    }
}

struct LinkState {
    log: LinkLog,
    tx: Option<UnboundedSender<Vec<u8>>>,
    rx: Option<UnboundedReceiver<Vec<u8>>>,
    awaiting_size: bool,
    image_len: Option<usize>,
    receiving: bool,
    received: usize,
    image_packets: usize,
    since_receipt: u16,
    prn: u16,
}

#[derive(Clone)]
pub struct FakeLink {
    script: Arc<FakeScript>,
    state: Arc<Mutex<LinkState>>,
}

impl FakeLink {
    pub fn new(script: FakeScript) -> Self {
        let (tx, rx) = mpsc::unbounded();
        Self {
            script: Arc::new(script),
            state: Arc::new(Mutex::new(LinkState {
                log: LinkLog::default(),
                tx: Some(tx),
                rx: Some(rx),
                awaiting_size: false,
                image_len: None,
                receiving: false,
                received: 0,
                image_packets: 0,
                since_receipt: 0,
                prn: 0,
            })),
        }
    }

    /// Link that treats every packet write as image data.
    pub fn streaming(script: FakeScript) -> Self {
        let link = Self::new(script);
        {
            let mut st = link.state.lock().unwrap();
            st.receiving = true;
            st.log.image_from = Some(0);
        }
        link
    }

    pub fn set_prn(&self, prn: u16) {
        self.state.lock().unwrap().prn = prn;
    }

    pub fn log(&self) -> LinkLog {
        self.state.lock().unwrap().log.clone()
    }

    /// Simulate the radio link going away.
    pub fn drop_link(&self) {
        self.state.lock().unwrap().tx = None;
    }

    fn respond(&self, st: &LinkState, opcode: u8) {
        if self.script.silent.contains(&opcode) {
            return;
        }
        let status = self.script.statuses.get(&opcode).copied().unwrap_or(0x01);
        let echoed = self.script.echo.unwrap_or(opcode);
        if let Some(tx) = &st.tx {
            let _ = tx.unbounded_send(vec![0x10, echoed, status]);
        }
    }

    fn on_control(&self, st: &mut LinkState, bytes: &[u8]) -> Result<(), TransportError> {
        let opcode = bytes.first().copied().unwrap_or_default();
        if self.script.drop_on == Some(opcode) {
            st.tx = None;
            return Err(TransportError::Disconnected);
        }
        match opcode {
            0x01 => st.awaiting_size = true,
            0x02 if bytes.get(1) == Some(&0x01) => self.respond(st, 0x02),
            0x03 => {
                st.receiving = true;
                st.received = 0;
                st.image_packets = 0;
                st.since_receipt = 0;
                st.log.image_from = Some(st.log.writes.len());
            }
            0x04 => self.respond(st, 0x04),
            0x05 => {
                st.tx = None;
                if self.script.activate_write_fails {
                    return Err(TransportError::Disconnected);
                }
            }
            0x08 => st.prn = u16::from_le_bytes([bytes[1], bytes[2]]),
            _ => {}
        }
        Ok(())
    }

    fn on_packet(&self, st: &mut LinkState, bytes: &[u8]) -> Result<(), TransportError> {
        if st.awaiting_size && bytes.len() == 12 {
            st.awaiting_size = false;
            st.image_len = Some(u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]) as usize);
            self.respond(st, 0x01);
            return Ok(());
        }
        if !st.receiving {
            return Ok(());
        }
        if self.script.drop_after_packets == Some(st.image_packets) {
            st.tx = None;
            return Err(TransportError::Disconnected);
        }
        st.image_packets += 1;
        st.received += bytes.len();
        st.since_receipt += 1;
        if self.script.prn_receipts && st.prn > 0 && st.since_receipt >= st.prn {
            st.since_receipt = 0;
            let mut frame = vec![0x11];
            frame.extend_from_slice(&(st.received as u32).to_le_bytes());
            if let Some(tx) = &st.tx {
                let _ = tx.unbounded_send(frame);
            }
        }
        if Some(st.received) == st.image_len {
            st.receiving = false;
            self.respond(st, 0x03);
        }
        Ok(())
    }
}

#[async_trait]
impl DfuLink for FakeLink {
    fn mtu(&self) -> usize {
        self.script.mtu
    }

    async fn write(&self, chr: DfuCharacteristic, bytes: &[u8], mode: WriteMode) -> Result<(), TransportError> {
        let mut st = self.state.lock().unwrap();
        if st.tx.is_none() {
            return Err(TransportError::Disconnected);
        }
        st.log.writes.push((chr, bytes.to_vec(), mode));
        match chr {
            DfuCharacteristic::ControlPoint => self.on_control(&mut st, bytes),
            DfuCharacteristic::Packet => self.on_packet(&mut st, bytes),
        }
    }

    async fn subscribe(&self) -> Result<FrameStream, TransportError> {
        if self.script.hang_subscribe {
            futures::future::pending::<()>().await;
        }
        if self.script.refuse_subscribe {
            return Err(TransportError::Subscribe("notifications not permitted".to_string()));
        }
        let rx = self.state.lock().unwrap().rx.take();
        match rx {
            Some(rx) => Ok(Box::pin(rx)),
            None => Err(TransportError::Subscribe("already subscribed".to_string())),
        }
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let mut st = self.state.lock().unwrap();
        st.tx = None;
        st.log.disconnects += 1;
        Ok(())
    }
}

pub fn addr(s: &str) -> BDAddr {
    BDAddr::from_str_delim(s).unwrap()
}

pub fn advertisement(address: &str, name: Option<&str>, services: &[Uuid]) -> Advertisement {
    Advertisement {
        peripheral: PeripheralHandle::new(addr(address), name.map(str::to_owned), services.to_vec()),
        rssi: Some(-60),
    }
}

/// Central whose n-th connection follows the n-th script (the last one repeats).
pub struct FakeCentral {
    scripts: Vec<FakeScript>,
    advertisements: Vec<Advertisement>,
    connects: AtomicUsize,
    links: Mutex<Vec<FakeLink>>,
    scans: Mutex<Vec<DiscoveryFilter>>,
}

impl FakeCentral {
    pub fn new(scripts: Vec<FakeScript>) -> Self {
        assert!(!scripts.is_empty());
        Self {
            scripts,
            advertisements: Vec::new(),
            connects: AtomicUsize::new(0),
            links: Mutex::new(Vec::new()),
            scans: Mutex::new(Vec::new()),
        }
    }

    pub fn with_advertisements(mut self, advertisements: Vec<Advertisement>) -> Self {
        self.advertisements = advertisements;
        self
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn links(&self) -> Vec<FakeLink> {
        self.links.lock().unwrap().clone()
    }

    pub fn scans(&self) -> Vec<DiscoveryFilter> {
        self.scans.lock().unwrap().clone()
    }
}

#[async_trait]
impl BleCentral for FakeCentral {
    type Link = FakeLink;

    async fn scan(&self, window: Duration, filter: &DiscoveryFilter) -> Result<Vec<Advertisement>, TransportError> {
        self.scans.lock().unwrap().push(filter.clone());
        tokio::time::sleep(window).await;
        Ok(self
            .advertisements
            .iter()
            .filter(|a| filter.matches(&a.peripheral))
            .cloned()
            .collect())
    }

    async fn connect(&self, _peripheral: &PeripheralHandle) -> Result<FakeLink, TransportError> {
        let n = self.connects.fetch_add(1, Ordering::SeqCst);
        let script = self.scripts[n.min(self.scripts.len() - 1)].clone();
        if script.hang_connect {
            futures::future::pending::<()>().await;
        }
        if script.refuse_connect {
            return Err(TransportError::Connect("peripheral not reachable".to_string()));
        }
        let link = FakeLink::new(script);
        self.links.lock().unwrap().push(link.clone());
        Ok(link)
    }
}
