//! Splits control-point notifications into responses and packet receipts.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use log::debug;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

use crate::error::{AttemptError, ProtocolError, TransportError};
use crate::protocol::{OpCode, ResponseStatus, NOTIF_PACKET_RECEIPT, NOTIF_RESPONSE};
use crate::transport::FrameStream;

/// Response frame as received: echoed request opcode and status byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Response {
    pub request: u8,
    pub status: u8,
}

/// Level-triggered flag set by packet receipts and reset by the waiter.
#[derive(Default)]
pub struct ReceiptSignal {
    raised: AtomicBool,
    notify: Notify,
}

impl ReceiptSignal {
    pub fn set(&self) {
        self.raised.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    pub fn clear(&self) {
        self.raised.store(false, Ordering::Release);
    }

    /// Wait for the flag and reset it. `false` on timeout.
    pub async fn wait(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, async {
            loop {
                let notified = self.notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.raised.swap(false, Ordering::AcqRel) {
                    return;
                }
                notified.await;
            }
        })
        .await
        .is_ok()
    }
}

/// Write half: fed with raw frames, never blocks.
#[derive(Clone)]
pub struct FrameDispatcher {
    responses: mpsc::UnboundedSender<Response>,
    receipts: Arc<ReceiptSignal>,
}

impl FrameDispatcher {
    pub fn dispatch(&self, frame: &[u8]) {
        match frame {
            [NOTIF_RESPONSE, request, status, ..] => {
                debug!("<< RX resp: op={:#04x} status={}", request, status);
                let _ = self.responses.send(Response {
                    request: *request,
                    status: *status,
                });
            }
            [NOTIF_PACKET_RECEIPT, rest @ ..] => {
                if let Some(bytes) = rest.get(..4) {
                    let received = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
                    debug!("<< RX PRN: {} bytes", received);
                }
                self.receipts.set();
            }
            _ => debug!("<< RX ignored: {:02x?}", frame),
        }
    }
}

/// Read half: awaited by the session and the flow controller.
pub struct ResponseCorrelator {
    responses: mpsc::UnboundedReceiver<Response>,
    receipts: Arc<ReceiptSignal>,
}

impl ResponseCorrelator {
    pub fn channel() -> (Self, FrameDispatcher) {
        let (tx, rx) = mpsc::unbounded_channel();
        let receipts = Arc::new(ReceiptSignal::default());
        let correlator = ResponseCorrelator {
            responses: rx,
            receipts: receipts.clone(),
        };
        let dispatcher = FrameDispatcher {
            responses: tx,
            receipts,
        };
        (correlator, dispatcher)
    }

    /// Correlator fed by a background task draining `frames`.
    /// The response queue closes when the stream ends.
    pub fn spawn(mut frames: FrameStream) -> (Self, JoinHandle<()>) {
        let (correlator, dispatcher) = Self::channel();
        let pump = tokio::spawn(async move {
            while let Some(frame) = frames.next().await {
                dispatcher.dispatch(&frame);
            }
            debug!("notification stream closed");
        });
        (correlator, pump)
    }

    pub fn receipts(&self) -> &ReceiptSignal {
        &self.receipts
    }

    /// Wait for the next response and check it answers `expected`.
    pub async fn await_response(&mut self, expected: OpCode, timeout: Duration) -> Result<(), AttemptError> {
        let response = match tokio::time::timeout(timeout, self.responses.recv()).await {
            Err(_) => {
                return Err(ProtocolError::Timeout {
                    opcode: expected,
                    timeout,
                }
                .into())
            }
            Ok(None) => return Err(TransportError::Disconnected.into()),
            Ok(Some(response)) => response,
        };
        if response.request != u8::from(expected) {
            return Err(ProtocolError::WrongOpcode {
                expected,
                actual: response.request,
            }
            .into());
        }
        let status = ResponseStatus::try_from(response.status);
        if !matches!(status, Ok(ResponseStatus::Success)) {
            debug!("{:?} rejected: {:?}", expected, status.ok());
            return Err(ProtocolError::NonSuccessStatus {
                opcode: expected,
                status: response.status,
            }
            .into());
        }
        Ok(())
    }
}
