//! Image streaming paced by packet receipt notifications.
//!
//! Legacy DFU has no credit based flow control. The receipt requested every
//! `prn` packets only tells us the peripheral is keeping up, so a missing
//! receipt is logged and the transfer carries on.

use log::{debug, info, warn};

use crate::config::receipt_timeout;
use crate::correlator::ReceiptSignal;
use crate::error::TransportError;
use crate::observer::DfuObserver;
use crate::transport::{DfuCharacteristic, DfuLink, WriteMode};

/// Counters from one image transfer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferStats {
    pub chunks: usize,
    pub bytes_sent: usize,
    pub receipt_waits: usize,
    pub receipt_timeouts: usize,
}

pub struct FlowController {
    chunk_size: usize,
    prn: u16,
    stats: TransferStats,
}

impl FlowController {
    pub fn new(chunk_size: usize, prn: u16) -> Self {
        assert!(chunk_size > 0, "chunk size must be non-zero");
        Self {
            chunk_size,
            prn,
            stats: TransferStats::default(),
        }
    }

    /// Counters so far, including a transfer that failed part way.
    pub fn stats(&self) -> TransferStats {
        self.stats
    }

    pub async fn stream<L: DfuLink + ?Sized>(
        &mut self,
        link: &L,
        receipts: &ReceiptSignal,
        image: &[u8],
        observer: &dyn DfuObserver,
    ) -> Result<TransferStats, TransportError> {
        info!("Uploading {} bytes in chunks of {}", image.len(), self.chunk_size);
        self.stats = TransferStats::default();
        let mut progress = Progress::new(image.len());
        let mut since_receipt: u16 = 0;

        for chunk in image.chunks(self.chunk_size) {
            link.write(DfuCharacteristic::Packet, chunk, WriteMode::WithoutResponse)
                .await?;
            self.stats.chunks += 1;
            self.stats.bytes_sent += chunk.len();
            since_receipt += 1;
            progress.update(self.stats.bytes_sent, observer);

            if self.prn > 0 && since_receipt >= self.prn {
                receipts.clear();
                self.stats.receipt_waits += 1;
                if !receipts.wait(receipt_timeout(self.prn)).await {
                    warn!("PRN timeout at {} bytes, continuing", self.stats.bytes_sent);
                    self.stats.receipt_timeouts += 1;
                }
                since_receipt = 0;
            }
        }

        progress.finish(observer);
        debug!("transfer done: {:?}", self.stats);
        Ok(self.stats)
    }
}

/// Emits a percentage only when it changes.
struct Progress {
    total: usize,
    last: Option<u8>,
}

impl Progress {
    fn new(total: usize) -> Self {
        Self { total, last: None }
    }

    fn update(&mut self, sent: usize, observer: &dyn DfuObserver) {
        let pct = if self.total == 0 {
            100
        } else {
            (sent.min(self.total) * 100 / self.total) as u8
        };
        if self.last != Some(pct) {
            self.last = Some(pct);
            observer.progress(pct);
        }
    }

    fn finish(&mut self, observer: &dyn DfuObserver) {
        if self.last != Some(100) {
            self.last = Some(100);
            observer.progress(100);
        }
    }
}
