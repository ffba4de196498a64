//! Tunables and timing constants for legacy DFU.

use std::time::Duration;

// ============================================================================
// Link
// ============================================================================

/// Largest chunk ever written to the packet characteristic.
pub const MAX_CHUNK_SIZE: usize = 244;

/// ATT header bytes taken out of every write.
pub const ATT_OVERHEAD: usize = 3;

/// MTU assumed when the platform cannot report one.
pub const DEFAULT_MTU: usize = MAX_CHUNK_SIZE + ATT_OVERHEAD;

/// Payload bytes per packet write for a given MTU.
pub fn chunk_size_for_mtu(mtu: usize) -> usize {
    mtu.saturating_sub(ATT_OVERHEAD).clamp(1, MAX_CHUNK_SIZE)
}

// ============================================================================
// Response timeouts
// ============================================================================

/// START_DFU response, which covers the flash erase.
pub const START_TIMEOUT: Duration = Duration::from_secs(60);

/// INIT_DFU_PARAMS and VALIDATE responses.
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

/// Floor for the image-received response.
pub const MIN_IMAGE_TIMEOUT: Duration = Duration::from_secs(60);

/// Flash write rate assumed when scaling the image-received timeout.
pub const FLASH_BYTES_PER_SEC: u64 = 50_000;

/// Timeout for the image-received response, scaled to image size.
pub fn image_received_timeout(image_len: usize) -> Duration {
    MIN_IMAGE_TIMEOUT.max(Duration::from_secs(image_len as u64 / FLASH_BYTES_PER_SEC))
}

// ============================================================================
// Packet receipt notifications
// ============================================================================

/// PRN interval used when none is given.
pub const DEFAULT_PRN: u16 = 8;

const MIN_RECEIPT_TIMEOUT: Duration = Duration::from_millis(500);
const RECEIPT_TIMEOUT_PER_PACKET: Duration = Duration::from_millis(50);

/// How long to wait for a receipt after `prn` packets.
pub fn receipt_timeout(prn: u16) -> Duration {
    MIN_RECEIPT_TIMEOUT.max(RECEIPT_TIMEOUT_PER_PACKET * u32::from(prn))
}

// ============================================================================
// Retry and discovery
// ============================================================================

pub const DEFAULT_MAX_RETRIES: u32 = 3;

pub const RETRY_BACKOFF: Duration = Duration::from_secs(3);

/// Pause between writing START and the size record.
pub const DEFAULT_START_DELAY: Duration = Duration::from_millis(400);

/// Time given to the target to reboot into its bootloader.
pub const SETTLE_DELAY: Duration = Duration::from_secs(5);

pub const SCAN_WINDOW: Duration = Duration::from_secs(5);

/// Name the Nordic legacy bootloader advertises by default.
pub const DEFAULT_BOOTLOADER_NAME: &str = "DfuTarg";

/// Settings for one update run.
#[derive(Debug, Clone)]
pub struct DfuConfig {
    /// Packets between receipt notifications, 0 disables them.
    pub prn: u16,
    pub max_retries: u32,
    pub retry_backoff: Duration,
    pub start_delay: Duration,
    pub settle_delay: Duration,
    pub scan_window: Duration,
    pub bootloader_name: String,
}

impl Default for DfuConfig {
    fn default() -> Self {
        Self {
            prn: DEFAULT_PRN,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_backoff: RETRY_BACKOFF,
            start_delay: DEFAULT_START_DELAY,
            settle_delay: SETTLE_DELAY,
            scan_window: SCAN_WINDOW,
            bootloader_name: DEFAULT_BOOTLOADER_NAME.to_string(),
        }
    }
}
