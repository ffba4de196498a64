use std::fmt;

use log::{debug, error, info, warn};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use tokio::task::JoinHandle;

use crate::config::{chunk_size_for_mtu, image_received_timeout, DfuConfig, COMMAND_TIMEOUT, START_TIMEOUT};
use crate::correlator::ResponseCorrelator;
use crate::error::{AttemptError, ProtocolError, SessionError, TransportError};
use crate::flow::{FlowController, TransferStats};
use crate::observer::DfuObserver;
use crate::package::FirmwarePackage;
use crate::transport::{BleCentral, DfuCharacteristic, DfuLink, FrameStream, PeripheralHandle, WriteMode};

// As defined for the nRF5 SDK 11 legacy bootloader, dfu_transport_ble.c

/// Control point request opcodes
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum OpCode {
    StartDfu = 0x01,
    InitDfuParams = 0x02,
    ReceiveFirmwareImage = 0x03,
    Validate = 0x04,
    ActivateAndReset = 0x05,
    Reset = 0x06,
    PacketReceiptNotifReq = 0x08,
}

/// Sent to an application-mode device, shares its value with START_DFU.
pub const ENTER_BOOTLOADER: u8 = 0x01;

/// Response notification opcode
pub const NOTIF_RESPONSE: u8 = 0x10;
/// Packet receipt notification opcode
pub const NOTIF_PACKET_RECEIPT: u8 = 0x11;

/// Image types of START_DFU
#[allow(dead_code)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, IntoPrimitive)]
#[repr(u8)]
pub enum UpdateMode {
    SoftDevice = 0x01,
    Bootloader = 0x02,
    SoftDeviceBootloader = 0x03,
    Application = 0x04,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, IntoPrimitive)]
#[repr(u8)]
pub enum InitPhase {
    Begin = 0x00,
    Complete = 0x01,
}

/// Legacy DFU response codes
#[allow(dead_code)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive)]
#[repr(u8)]
pub enum ResponseStatus {
    Success = 0x01,
    InvalidState = 0x02,
    NotSupported = 0x03,
    DataSizeExceedsLimit = 0x04,
    CrcError = 0x05,
    OperationFailed = 0x06,
}

/// Outbound control point frames.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Command {
    Start(UpdateMode),
    InitParams(InitPhase),
    ReceiveImage,
    Validate,
    ActivateAndReset,
    Reset,
    PrnRequest(u16),
}

impl Command {
    pub fn opcode(self) -> OpCode {
        match self {
            Command::Start(_) => OpCode::StartDfu,
            Command::InitParams(_) => OpCode::InitDfuParams,
            Command::ReceiveImage => OpCode::ReceiveFirmwareImage,
            Command::Validate => OpCode::Validate,
            Command::ActivateAndReset => OpCode::ActivateAndReset,
            Command::Reset => OpCode::Reset,
            Command::PrnRequest(_) => OpCode::PacketReceiptNotifReq,
        }
    }

    /// Whether the command stays outstanding until a response arrives.
    pub fn awaits_response(self) -> bool {
        matches!(
            self,
            Command::Start(_) | Command::InitParams(_) | Command::ReceiveImage | Command::Validate
        )
    }

    pub fn encode(self) -> Vec<u8> {
        let mut frame = vec![self.opcode().into()];
        match self {
            Command::Start(mode) => frame.push(mode.into()),
            Command::InitParams(phase) => frame.push(phase.into()),
            Command::PrnRequest(interval) => frame.extend_from_slice(&interval.to_le_bytes()),
            _ => {}
        }
        frame
    }
}

/// `[softdevice][bootloader][application]`, each u32 little-endian.
pub fn size_record(softdevice: u32, bootloader: u32, application: u32) -> [u8; 12] {
    let mut record = [0u8; 12];
    record[0..4].copy_from_slice(&softdevice.to_le_bytes());
    record[4..8].copy_from_slice(&bootloader.to_le_bytes());
    record[8..12].copy_from_slice(&application.to_le_bytes());
    record
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum DfuState {
    Idle,
    Started,
    SizeSent,
    InitSent,
    PrnConfigured,
    Streaming,
    Validated,
    Activated,
    Complete,
    Failed,
}

impl fmt::Display for DfuState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// The one control point command allowed to be outstanding.
///
/// Legacy DFU responses carry no request id, so a second command written
/// before the first is answered would make responses ambiguous.
#[derive(Debug, Default)]
pub struct PendingCommand(Option<OpCode>);

impl PendingCommand {
    /// Admit a write of `opcode`. Further frames of the outstanding command pass.
    pub fn admit(&mut self, opcode: OpCode, claim: bool) -> Result<(), ProtocolError> {
        match self.0 {
            Some(pending) if pending != opcode => Err(ProtocolError::CommandOverlap {
                pending,
                requested: opcode,
            }),
            _ => {
                if claim {
                    self.0 = Some(opcode);
                }
                Ok(())
            }
        }
    }

    pub fn release(&mut self) -> Option<OpCode> {
        self.0.take()
    }

    pub fn outstanding(&self) -> Option<OpCode> {
        self.0
    }
}

/// One update attempt over one connection.
pub struct DfuSession<'a, L: DfuLink> {
    link: L,
    correlator: ResponseCorrelator,
    pump: JoinHandle<()>,
    package: &'a FirmwarePackage,
    config: &'a DfuConfig,
    observer: &'a dyn DfuObserver,
    state: DfuState,
    chunk_size: usize,
    bytes_sent: usize,
    pending: PendingCommand,
    reset_in_progress: bool,
    transfer: Option<TransferStats>,
}

impl<'a, L: DfuLink> DfuSession<'a, L> {
    /// Session over `link`, fed by the control point notifications in `frames`.
    pub fn new(
        link: L,
        frames: FrameStream,
        package: &'a FirmwarePackage,
        config: &'a DfuConfig,
        observer: &'a dyn DfuObserver,
    ) -> Self {
        let (correlator, pump) = ResponseCorrelator::spawn(frames);
        let chunk_size = chunk_size_for_mtu(link.mtu());
        info!("MTU {}, chunk size {}", link.mtu(), chunk_size);
        DfuSession {
            link,
            correlator,
            pump,
            package,
            config,
            observer,
            state: DfuState::Idle,
            chunk_size,
            bytes_sent: 0,
            pending: PendingCommand::default(),
            reset_in_progress: false,
            transfer: None,
        }
    }

    pub fn state(&self) -> DfuState {
        self.state
    }

    pub fn reset_in_progress(&self) -> bool {
        self.reset_in_progress
    }

    pub fn bytes_sent(&self) -> usize {
        self.bytes_sent
    }

    pub fn transfer(&self) -> Option<TransferStats> {
        self.transfer
    }

    /// Drive START → INIT → STREAM → VALIDATE → ACTIVATE.
    pub async fn run(&mut self) -> Result<(), SessionError> {
        match self.steps().await {
            Ok(()) => {
                self.state = DfuState::Complete;
                self.observer.status("DFU complete");
                Ok(())
            }
            Err(source) => {
                if let Some(op) = self.pending.outstanding() {
                    debug!("{:?} was still outstanding", op);
                }
                let state = self.state;
                self.state = DfuState::Failed;
                Err(SessionError { state, source })
            }
        }
    }

    /// Drop the connection, ignoring a link that is already gone.
    pub async fn close(&self) {
        if let Err(e) = self.link.disconnect().await {
            debug!("disconnect: {}", e);
        }
    }

    async fn steps(&mut self) -> Result<(), AttemptError> {
        let package = self.package;
        let image = package.application_image();

        self.observer.status("Starting DFU");
        self.send(Command::Start(UpdateMode::Application)).await?;
        self.state = DfuState::Started;
        if !self.config.start_delay.is_zero() {
            tokio::time::sleep(self.config.start_delay).await;
        }

        info!("Sending size: {} bytes", package.image_size());
        self.write_packet(&size_record(0, 0, package.image_size())).await?;
        self.state = DfuState::SizeSent;
        if let Err(e) = self.await_response(OpCode::StartDfu, START_TIMEOUT).await {
            if let AttemptError::Protocol(_) = e {
                if let Err(reset_err) = self.send(Command::Reset).await {
                    warn!("RESET after failed start: {}", reset_err);
                }
            }
            return Err(e);
        }

        self.observer.status("Sending init packet");
        self.send(Command::InitParams(InitPhase::Begin)).await?;
        for part in package.init_data().chunks(self.chunk_size) {
            self.write_packet(part).await?;
        }
        self.send(Command::InitParams(InitPhase::Complete)).await?;
        self.await_response(OpCode::InitDfuParams, COMMAND_TIMEOUT).await?;
        self.state = DfuState::InitSent;

        if self.config.prn > 0 {
            info!("Configuring PRN: {}", self.config.prn);
            self.send(Command::PrnRequest(self.config.prn)).await?;
        }
        self.state = DfuState::PrnConfigured;

        self.observer.status("Uploading firmware");
        self.send(Command::ReceiveImage).await?;
        self.state = DfuState::Streaming;
        let mut flow = FlowController::new(self.chunk_size, self.config.prn);
        let streamed = flow
            .stream(&self.link, self.correlator.receipts(), image, self.observer)
            .await;
        self.bytes_sent = flow.stats().bytes_sent;
        self.transfer = Some(flow.stats());
        streamed?;

        self.observer.status("Verifying upload");
        self.await_response(OpCode::ReceiveFirmwareImage, image_received_timeout(image.len()))
            .await?;

        self.observer.status("Validating");
        self.send(Command::Validate).await?;
        self.await_response(OpCode::Validate, COMMAND_TIMEOUT).await?;
        self.state = DfuState::Validated;

        // the device reboots right away, losing the link is the expected outcome from here
        self.observer.status("Activating & resetting");
        self.reset_in_progress = true;
        self.send(Command::ActivateAndReset).await?;
        self.state = DfuState::Activated;
        Ok(())
    }

    async fn send(&mut self, command: Command) -> Result<(), AttemptError> {
        self.pending.admit(command.opcode(), command.awaits_response())?;
        let frame = command.encode();
        debug!(">> TX {:?}: {:02x?}", command, frame);
        self.link
            .write(DfuCharacteristic::ControlPoint, &frame, WriteMode::WithResponse)
            .await?;
        Ok(())
    }

    async fn write_packet(&self, bytes: &[u8]) -> Result<(), AttemptError> {
        self.link
            .write(DfuCharacteristic::Packet, bytes, WriteMode::WithoutResponse)
            .await?;
        Ok(())
    }

    async fn await_response(&mut self, opcode: OpCode, timeout: std::time::Duration) -> Result<(), AttemptError> {
        let result = self.correlator.await_response(opcode, timeout).await;
        self.pending.release();
        if let Err(e) = &result {
            error!("<< RX error for {:?}: {}", opcode, e);
        }
        result
    }
}

impl<L: DfuLink> Drop for DfuSession<'_, L> {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

/// Ask an application-mode device to reboot into its bootloader.
///
/// The device usually resets before acknowledging, so a failed write is
/// not an error.
pub async fn enter_bootloader<C: BleCentral>(central: &C, device: &PeripheralHandle) -> Result<(), TransportError> {
    info!("Connecting to {} for bootloader jump", device);
    let link = central.connect(device).await?;
    // the jump is never answered, the subscription is only held until disconnect
    let _frames = match link.subscribe().await {
        Ok(frames) => Some(frames),
        Err(e) => {
            warn!("subscribe before jump: {}", e);
            None
        }
    };
    let frame = [ENTER_BOOTLOADER, UpdateMode::Application.into()];
    debug!(">> TX jump: {:02x?}", frame);
    match link
        .write(DfuCharacteristic::ControlPoint, &frame, WriteMode::WithResponse)
        .await
    {
        Ok(()) => info!("Jump command sent"),
        Err(e) => info!("Jump write ended with: {}", e),
    }
    if let Err(e) = link.disconnect().await {
        debug!("disconnect after jump: {}", e);
    }
    Ok(())
}
