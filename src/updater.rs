//! Whole update of an application-mode device.

use log::{info, warn};

use crate::config::DfuConfig;
use crate::error::DfuError;
use crate::locator::BootloaderLocator;
use crate::observer::DfuObserver;
use crate::package::FirmwarePackage;
use crate::protocol::{enter_bootloader, DfuState};
use crate::retry::{CancelToken, RetryOrchestrator, UpdateReport};
use crate::transport::{dfu_uuids, BleCentral, PeripheralHandle};

pub struct Updater<'a, C: BleCentral> {
    central: &'a C,
    config: &'a DfuConfig,
    observer: &'a dyn DfuObserver,
}

impl<'a, C: BleCentral> Updater<'a, C> {
    pub fn new(central: &'a C, config: &'a DfuConfig, observer: &'a dyn DfuObserver) -> Self {
        Self {
            central,
            config,
            observer,
        }
    }

    /// Jump to bootloader, wait for the reboot, find the bootloader and flash it.
    pub async fn run(
        &self,
        target: &PeripheralHandle,
        package: &FirmwarePackage,
        cancel: &CancelToken,
    ) -> Result<UpdateReport, DfuError> {
        let mut cancel_wait = cancel.clone();

        self.observer.status(&format!("Requesting bootloader on {}", target));
        let jumped = tokio::select! {
            r = enter_bootloader(self.central, target) => r,
            _ = cancel_wait.cancelled() => return Err(DfuError::Cancelled { state: DfuState::Idle }),
        };
        if let Err(e) = jumped {
            warn!("bootloader jump failed: {}, looking for a bootloader anyway", e);
        }

        self.observer
            .status(&format!("Waiting for reboot ({}s)...", self.config.settle_delay.as_secs()));
        tokio::select! {
            _ = tokio::time::sleep(self.config.settle_delay) => {}
            _ = cancel_wait.cancelled() => return Err(DfuError::Cancelled { state: DfuState::Idle }),
        }

        self.observer.status("Scanning for bootloader...");
        let locator = BootloaderLocator::new(self.central, self.config.scan_window);
        let bootloader = tokio::select! {
            found = locator.locate(
                target.address(),
                Some(self.config.bootloader_name.as_str()),
                Some(dfu_uuids::SERVICE),
            ) => found?,
            _ = cancel_wait.cancelled() => return Err(DfuError::Cancelled { state: DfuState::Idle }),
        };
        info!("Bootloader: {}", bootloader);

        RetryOrchestrator::new(self.config, self.observer)
            .perform_update(self.central, &bootloader, package, cancel)
            .await
    }
}
