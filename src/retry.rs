//! Bounded retries of whole DFU sessions.

use log::{debug, error, info};
use tokio::sync::watch;

use crate::config::DfuConfig;
use crate::error::{DfuError, SessionError};
use crate::flow::TransferStats;
use crate::observer::DfuObserver;
use crate::package::FirmwarePackage;
use crate::protocol::{DfuSession, DfuState};
use crate::transport::{BleCentral, DfuLink, PeripheralHandle};

/// Fires a [`CancelToken`].
pub struct CancelHandle(watch::Sender<bool>);

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.0.send(true);
    }
}

#[derive(Clone)]
pub struct CancelToken(watch::Receiver<bool>);

impl CancelToken {
    /// Token that never fires.
    #[cfg(test)]
    pub fn never() -> Self {
        let (_, rx) = watch::channel(false);
        CancelToken(rx)
    }

    pub fn is_cancelled(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once cancelled, never if the handle is gone.
    pub async fn cancelled(&mut self) {
        loop {
            if *self.0.borrow_and_update() {
                return;
            }
            if self.0.changed().await.is_err() {
                futures::future::pending::<()>().await;
            }
        }
    }
}

pub fn cancellation() -> (CancelHandle, CancelToken) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle(tx), CancelToken(rx))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Every step went through, ACTIVATE included.
    Completed,
    /// Link dropped after ACTIVATE was issued: the device rebooted.
    ResetDisconnect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryState {
    pub attempt: u32,
    pub reset_in_progress: bool,
}

#[derive(Debug, Clone)]
pub struct UpdateReport {
    pub attempt: u32,
    pub outcome: Outcome,
    pub transfer: Option<TransferStats>,
}

enum AttemptEnd {
    Done(UpdateReport),
    Failed(SessionError),
    Cancelled(DfuState),
}

pub struct RetryOrchestrator<'a> {
    config: &'a DfuConfig,
    observer: &'a dyn DfuObserver,
}

impl<'a> RetryOrchestrator<'a> {
    pub fn new(config: &'a DfuConfig, observer: &'a dyn DfuObserver) -> Self {
        Self { config, observer }
    }

    pub async fn perform_update<C: BleCentral>(
        &self,
        central: &C,
        bootloader: &PeripheralHandle,
        package: &FirmwarePackage,
        cancel: &CancelToken,
    ) -> Result<UpdateReport, DfuError> {
        let max_retries = self.config.max_retries.max(1);
        let mut cancel = cancel.clone();
        info!("Target bootloader: {}", bootloader);

        let mut attempt = 1;
        loop {
            if cancel.is_cancelled() {
                return Err(DfuError::Cancelled { state: DfuState::Idle });
            }
            self.observer
                .status(&format!("DFU connection attempt {}/{}...", attempt, max_retries));
            match self.attempt(central, bootloader, package, attempt, &mut cancel).await {
                AttemptEnd::Done(report) => return Ok(report),
                AttemptEnd::Cancelled(state) => return Err(DfuError::Cancelled { state }),
                AttemptEnd::Failed(err) => {
                    error!("Attempt {} failed: {}", attempt, err);
                    self.observer.status(&format!("Attempt {} failed: {}", attempt, err));
                    if attempt >= max_retries {
                        return Err(DfuError::RetriesExhausted {
                            attempts: attempt,
                            source: err,
                        });
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.retry_backoff) => {}
                        _ = cancel.cancelled() => return Err(DfuError::Cancelled { state: err.state }),
                    }
                    attempt += 1;
                }
            }
        }
    }

    async fn attempt<C: BleCentral>(
        &self,
        central: &C,
        bootloader: &PeripheralHandle,
        package: &FirmwarePackage,
        attempt: u32,
        cancel: &mut CancelToken,
    ) -> AttemptEnd {
        let connected = tokio::select! {
            r = central.connect(bootloader) => r,
            _ = cancel.cancelled() => return AttemptEnd::Cancelled(DfuState::Idle),
        };
        let link = match connected {
            Ok(link) => link,
            Err(e) => return failed_before_start(e),
        };
        let subscribed = tokio::select! {
            r = link.subscribe() => Some(r),
            _ = cancel.cancelled() => None,
        };
        let frames = match subscribed {
            Some(Ok(frames)) => frames,
            Some(Err(e)) => {
                close_link(&link).await;
                return failed_before_start(e);
            }
            None => {
                close_link(&link).await;
                return AttemptEnd::Cancelled(DfuState::Idle);
            }
        };
        let mut session = DfuSession::new(link, frames, package, self.config, self.observer);

        let run = tokio::select! {
            r = session.run() => Some(r),
            _ = cancel.cancelled() => None,
        };
        let retry = RetryState {
            attempt,
            reset_in_progress: session.reset_in_progress(),
        };
        let end = match run {
            None => {
                info!("Cancelled in state {}", session.state());
                AttemptEnd::Cancelled(session.state())
            }
            Some(Ok(())) => AttemptEnd::Done(UpdateReport {
                attempt: retry.attempt,
                outcome: Outcome::Completed,
                transfer: session.transfer(),
            }),
            Some(Err(e)) if retry.reset_in_progress && e.is_transport() => {
                info!("Device disconnected during reset ({}), update successful", e);
                self.observer.status("Device disconnected during reset. Update successful.");
                AttemptEnd::Done(UpdateReport {
                    attempt: retry.attempt,
                    outcome: Outcome::ResetDisconnect,
                    transfer: session.transfer(),
                })
            }
            Some(Err(e)) => {
                debug!("attempt {} ended after {} image bytes", retry.attempt, session.bytes_sent());
                AttemptEnd::Failed(e)
            }
        };
        session.close().await;
        end
    }
}

async fn close_link<L: DfuLink>(link: &L) {
    if let Err(e) = link.disconnect().await {
        debug!("disconnect: {}", e);
    }
}

fn failed_before_start(e: crate::error::TransportError) -> AttemptEnd {
    AttemptEnd::Failed(SessionError {
        state: DfuState::Idle,
        source: e.into(),
    })
}
