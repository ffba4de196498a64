//! Finding devices again after they reboot.

use std::time::Duration;

use btleplug::api::BDAddr;
use log::{info, warn};
use uuid::Uuid;

use crate::error::NotFoundError;
use crate::transport::{Advertisement, BleCentral, DiscoveryFilter, PeripheralHandle};

/// Address legacy bootloaders usually advertise on: application address
/// with the low byte incremented, no carry.
pub fn bootloader_address_hint(app: BDAddr) -> BDAddr {
    let mut bytes = app.into_inner();
    bytes[5] = bytes[5].wrapping_add(1);
    BDAddr::from(bytes)
}

pub struct BootloaderLocator<'a, C: BleCentral> {
    central: &'a C,
    window: Duration,
}

impl<'a, C: BleCentral> BootloaderLocator<'a, C> {
    pub fn new(central: &'a C, window: Duration) -> Self {
        Self { central, window }
    }

    /// Find the bootloader of a device that was just told to reboot.
    pub async fn locate(
        &self,
        original: BDAddr,
        name_hint: Option<&str>,
        service_hint: Option<Uuid>,
    ) -> Result<PeripheralHandle, NotFoundError> {
        info!("Scanning for bootloader ({:?}, {:?})...", name_hint, service_hint);
        let seen = self.scan(&DiscoveryFilter::default()).await;
        if let Some(found) = best_match(&seen, original, name_hint, service_hint) {
            info!("Found bootloader {}", found);
            return Ok(found.clone());
        }

        // not every vendor follows the +1 convention, a miss here is common
        let hint = bootloader_address_hint(original);
        info!("Scanning for bootloader (hint: {})...", hint);
        let seen = self.scan(&DiscoveryFilter::address(hint)).await;
        match seen.iter().map(|a| &a.peripheral).find(|p| p.address() == hint) {
            Some(found) => {
                info!("Found bootloader {}", found);
                Ok(found.clone())
            }
            None => Err(NotFoundError::new("DFU bootloader")),
        }
    }

    /// Single scan for the first device matching any identifier, given as
    /// an address or an advertised name.
    pub async fn find_target(&self, identifiers: &[String]) -> Result<PeripheralHandle, NotFoundError> {
        let seen = self.scan(&DiscoveryFilter::default()).await;
        for id in identifiers {
            let hit = seen.iter().map(|a| &a.peripheral).find(|p| {
                p.address().to_string().eq_ignore_ascii_case(id) || p.name() == Some(id.as_str())
            });
            if let Some(found) = hit {
                return Ok(found.clone());
            }
        }
        Err(NotFoundError::new(format!("any of {:?}", identifiers)))
    }

    async fn scan(&self, filter: &DiscoveryFilter) -> Vec<Advertisement> {
        match self.central.scan(self.window, filter).await {
            Ok(seen) => seen,
            Err(e) => {
                warn!("scan failed: {}", e);
                Vec::new()
            }
        }
    }
}

/// Address beats name beats service.
fn best_match<'s>(
    seen: &'s [Advertisement],
    address: BDAddr,
    name: Option<&str>,
    service: Option<Uuid>,
) -> Option<&'s PeripheralHandle> {
    let mut peripherals = seen.iter().map(|a| &a.peripheral);
    peripherals
        .clone()
        .find(|p| p.address() == address)
        .or_else(|| name.and_then(|n| peripherals.clone().find(|p| p.name() == Some(n))))
        .or_else(|| service.and_then(|s| peripherals.find(|p| p.advertises(&s))))
}
