mod config;
mod correlator;
mod error;
mod flow;
mod locator;
mod observer;
mod package;
mod protocol;
mod retry;
mod transport;
mod transport_btleplug;
mod updater;

#[cfg(test)]
mod test_helpers;

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use log::{error, info, warn, LevelFilter};

use crate::config::DfuConfig;
use crate::locator::BootloaderLocator;
use crate::observer::{BarObserver, DfuObserver, LogObserver};
use crate::package::FirmwarePackage;
use crate::transport_btleplug::BtleplugCentral;
use crate::updater::Updater;

const RESCAN_INTERVAL: Duration = Duration::from_secs(2);

/// Update firmware on nRF legacy DFU targets over BLE
#[derive(clap::Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Firmware update package path
    pkg: PathBuf,

    /// BLE address or advertised name of the device, first one found is updated
    #[arg(required = true)]
    device: Vec<String>,

    /// Packets between receipt notifications, 0 disables them
    #[arg(long, default_value_t = config::DEFAULT_PRN)]
    prn: u16,

    /// Seconds between START and the size record
    #[arg(long, default_value_t = 0.4)]
    delay: f64,

    /// DFU attempts before giving up
    #[arg(long, default_value_t = config::DEFAULT_MAX_RETRIES)]
    retries: u32,

    /// Keep scanning until a device appears
    #[arg(short, long)]
    wait: bool,

    /// Bluetooth adapter index
    #[arg(long, default_value_t = 0)]
    adapter: usize,

    /// ATT MTU of the bootloader link
    #[arg(long)]
    mtu: Option<usize>,

    /// Name the bootloader advertises
    #[arg(long, default_value = config::DEFAULT_BOOTLOADER_NAME)]
    bootloader_name: String,

    #[arg(short, long)]
    verbose: bool,

    /// Log progress instead of drawing a bar
    #[arg(long)]
    no_progress: bool,
}

impl Args {
    fn dfu_config(&self) -> Result<DfuConfig, Box<dyn std::error::Error>> {
        let start_delay =
            Duration::try_from_secs_f64(self.delay).map_err(|e| format!("invalid --delay {}: {}", self.delay, e))?;
        Ok(DfuConfig {
            prn: self.prn,
            max_retries: self.retries,
            start_delay,
            bootloader_name: self.bootloader_name.clone(),
            ..DfuConfig::default()
        })
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    env_logger::Builder::new()
        .filter_level(if args.verbose { LevelFilter::Debug } else { LevelFilter::Info })
        .parse_default_env()
        .init();

    let config = args.dfu_config()?;
    let package = FirmwarePackage::from_path(&args.pkg)?;
    info!(
        "Package {}: {} byte image, {} byte init packet ({:?})",
        args.pkg.display(),
        package.application_image().len(),
        package.init_data().len(),
        package.layout()
    );

    let central = BtleplugCentral::new(args.adapter, args.mtu).await?;
    let locator = BootloaderLocator::new(&central, config.scan_window);
    let target = loop {
        match locator.find_target(&args.device).await {
            Ok(target) => break target,
            Err(e) if args.wait => {
                info!("{}, scanning again", e);
                tokio::time::sleep(RESCAN_INTERVAL).await;
            }
            Err(e) => return Err(e.into()),
        }
    };
    info!("Found {}", target);

    let (cancel, token) = retry::cancellation();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling update");
            cancel.cancel();
        }
    });

    let bar = (!args.no_progress).then(BarObserver::new);
    let observer: &dyn DfuObserver = match &bar {
        Some(bar) => bar,
        None => &LogObserver,
    };

    match Updater::new(&central, &config, observer).run(&target, &package, &token).await {
        Ok(report) => {
            if let Some(bar) = &bar {
                bar.finish();
            }
            info!("Update finished on attempt {} ({:?})", report.attempt, report.outcome);
            if let Some(t) = report.transfer {
                info!(
                    "{} bytes in {} packets, {} of {} receipt waits timed out",
                    t.bytes_sent, t.chunks, t.receipt_timeouts, t.receipt_waits
                );
            }
            Ok(())
        }
        Err(e) => {
            error!("[{}] {}", e.error_code(), e);
            if let Some(state) = e.state() {
                info!("Failed in state {}", state);
            }
            Err(e.into())
        }
    }
}
