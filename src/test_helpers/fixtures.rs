use std::io::{Cursor, Write};
use std::sync::Mutex;

use zip::write::FileOptions;
use zip::ZipWriter;

use crate::observer::DfuObserver;
use crate::package::FirmwarePackage;

pub const APP_MANIFEST: &str = r#"{
    "manifest": {
        "application": {
            "bin_file": "app.bin",
            "dat_file": "app.dat",
            "init_packet_data": {
                "application_version": 4294967295,
                "device_revision": 65535,
                "device_type": 65535,
                "firmware_crc16": 18974,
                "softdevice_req": [65534]
            }
        },
        "dfu_version": 0.5
    }
}"#;

/// Build an in-memory zip from `(name, contents)` pairs.
pub fn zip_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
    let options = FileOptions::default().compression_method(zip::CompressionMethod::Stored);
    for (name, contents) in entries {
        zip.start_file(*name, options).unwrap();
        zip.write_all(contents).unwrap();
    }
    zip.finish().unwrap().into_inner()
}

/// Package with a patterned image of `image_len` bytes.
pub fn package(image_len: usize) -> FirmwarePackage {
    let image: Vec<u8> = (0..image_len).map(|i| (i % 251) as u8).collect();
    let init = [0x5A; 14];
    FirmwarePackage::parse(&zip_bytes(&[
        ("manifest.json", APP_MANIFEST.as_bytes()),
        ("app.bin", &image),
        ("app.dat", &init),
    ]))
    .unwrap()
}

/// Observer that keeps everything it is told.
#[derive(Default)]
pub struct RecordingObserver {
    pub progress: Mutex<Vec<u8>>,
    pub status: Mutex<Vec<String>>,
}

impl RecordingObserver {
    pub fn percentages(&self) -> Vec<u8> {
        self.progress.lock().unwrap().clone()
    }

    pub fn saw_status(&self, needle: &str) -> bool {
        self.status.lock().unwrap().iter().any(|s| s.contains(needle))
    }
}

impl DfuObserver for RecordingObserver {
    fn progress(&self, percent: u8) {
        self.progress.lock().unwrap().push(percent);
    }

    fn status(&self, line: &str) {
        self.status.lock().unwrap().push(line.to_string());
    }
}
