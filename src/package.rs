use std::io::prelude::*;
use std::io::Cursor;
use std::path::Path;

use log::{debug, warn};

use crate::error::PackageError;

const MANIFEST: &str = "manifest.json";
const IMAGE_EXT: &str = ".bin";
const INIT_EXT: &str = ".dat";
const APP_MARKER: &str = "application";

/// Where the entry names came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    Manifest,
    Heuristic,
}

/// Application image and init packet pulled out of a DFU zip.
#[derive(Debug)]
pub struct FirmwarePackage {
    application_image: Vec<u8>,
    init_data: Vec<u8>,
    image_size: u32,
    layout: Layout,
}

impl FirmwarePackage {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, PackageError> {
        let bytes = std::fs::read(path)?;
        Self::parse(&bytes)
    }

    pub fn parse(archive_bytes: &[u8]) -> Result<Self, PackageError> {
        let mut zip = zip::ZipArchive::new(Cursor::new(archive_bytes))?;

        let has_manifest = zip.file_names().any(|n| n == MANIFEST);
        let (bin_name, dat_name, layout) = if has_manifest {
            let (bin, dat) = names_from_manifest(&mut zip)?;
            (bin, dat, Layout::Manifest)
        } else {
            debug!("no {}, guessing entry names", MANIFEST);
            let names: Vec<String> = zip.file_names().map(str::to_owned).collect();
            let bin = single_candidate(&names, IMAGE_EXT)?;
            let dat = single_candidate(&names, INIT_EXT)?;
            (bin, dat, Layout::Heuristic)
        };

        let application_image = read_entry(&mut zip, &bin_name)?;
        let image_size = image_size(application_image.len())?;
        let init_data = read_entry(&mut zip, &dat_name)?;
        debug!(
            "package: {} ({} bytes), {} ({} bytes)",
            bin_name,
            application_image.len(),
            dat_name,
            init_data.len()
        );

        Ok(FirmwarePackage {
            application_image,
            init_data,
            image_size,
            layout,
        })
    }

    pub fn application_image(&self) -> &[u8] {
        &self.application_image
    }

    pub fn init_data(&self) -> &[u8] {
        &self.init_data
    }

    /// Image length as sent in the size record.
    pub fn image_size(&self) -> u32 {
        self.image_size
    }

    pub fn layout(&self) -> Layout {
        self.layout
    }
}

fn names_from_manifest<R: Read + Seek>(
    zip: &mut zip::ZipArchive<R>,
) -> Result<(String, String), PackageError> {
    let manifest_raw = zip.by_name(MANIFEST)?;
    let manifest: serde_json::Value = serde_json::from_reader(manifest_raw)
        .map_err(|e| PackageError::MalformedManifest(e.to_string()))?;

    for extra in ["softdevice", "bootloader", "softdevice_bootloader"] {
        if manifest["manifest"][extra].is_object() {
            warn!("manifest carries a {} image, only the application is flashed", extra);
        }
    }

    let app = &manifest["manifest"]["application"];
    if !app.is_object() {
        return Err(PackageError::MalformedManifest(
            "no manifest.application object".to_string(),
        ));
    }
    let field = |key: &str| {
        app[key]
            .as_str()
            .map(str::to_owned)
            .ok_or_else(|| PackageError::MalformedManifest(format!("application.{} missing", key)))
    };
    Ok((field("bin_file")?, field("dat_file")?))
}

fn single_candidate(names: &[String], ext: &str) -> Result<String, PackageError> {
    let mut found = names.iter().filter(|n| {
        let lower = n.to_lowercase();
        lower.ends_with(ext) && lower.contains(APP_MARKER)
    });
    match (found.next(), found.next()) {
        (Some(name), None) => Ok(name.clone()),
        (None, _) => Err(PackageError::UnrecognizedLayout(format!(
            "no application{} entry",
            ext
        ))),
        (Some(_), Some(_)) => Err(PackageError::UnrecognizedLayout(format!(
            "several application{} entries",
            ext
        ))),
    }
}

fn image_size(len: usize) -> Result<u32, PackageError> {
    u32::try_from(len).map_err(|_| PackageError::ImageTooLarge(len))
}

fn read_entry<R: Read + Seek>(zip: &mut zip::ZipArchive<R>, name: &str) -> Result<Vec<u8>, PackageError> {
    let mut entry = match zip.by_name(name) {
        Ok(entry) => entry,
        Err(zip::result::ZipError::FileNotFound) => return Err(PackageError::MissingEntry(name.to_string())),
        Err(e) => return Err(e.into()),
    };
    let mut data = Vec::with_capacity(entry.size() as usize);
    entry.read_to_end(&mut data)?;
    if data.is_empty() {
        return Err(PackageError::EmptyEntry(name.to_string()));
    }
    Ok(data)
}
