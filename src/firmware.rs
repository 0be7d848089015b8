//! Firmware images and the bundles that group them
//!
//! A bundle is either a single binary (offset inferred from the filename)
//! or the three canonical artifacts of an ESP32-C3 build directory:
//! `bootloader.bin` at 0x0, `partitions.bin` at 0x8000 and `firmware.bin`
//! at 0x10000.

use std::fs;
use std::path::{Path, PathBuf};

use miette::Diagnostic;
use thiserror::Error;

/// First byte of every valid ESP32 image
pub const ESP_MAGIC: u8 = 0xE9;

/// Canonical flash offset of the second-stage bootloader
pub const BOOTLOADER_OFFSET: u32 = 0x0000;
/// Canonical flash offset of the partition table
pub const PARTITION_TABLE_OFFSET: u32 = 0x8000;
/// Canonical flash offset of the application
pub const APPLICATION_OFFSET: u32 = 0x1_0000;

/// Filename fragments that mark a single binary as a merged full-flash
/// image to be written at offset zero
const MERGED_IMAGE_MARKERS: [&str; 4] = ["merged", "factory", "combined", "full"];

#[derive(Debug, Error, Diagnostic)]
pub enum FirmwareError {
    #[error("no firmware files found in directory")]
    #[diagnostic(code(c3flash::no_files_found))]
    NoFilesFound,

    #[error("missing firmware.bin")]
    #[diagnostic(
        code(c3flash::missing_firmware),
        help("A build directory must contain at least firmware.bin")
    )]
    MissingFirmware,

    #[error("cannot read firmware file '{path}'")]
    #[diagnostic(code(c3flash::invalid_file))]
    InvalidFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("'{name}' is not a valid ESP32 image")]
    #[diagnostic(
        code(c3flash::invalid_image),
        help("ESP32 images are at least 8 bytes long and start with the 0xE9 magic byte")
    )]
    InvalidImage { name: String },
}

/// One opaque payload and the flash offset it belongs at
#[derive(Debug, Clone)]
pub struct FirmwareImage {
    pub path: PathBuf,
    pub data: Vec<u8>,
    pub offset: u32,
}

impl FirmwareImage {
    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.to_string_lossy().into_owned())
    }

    /// Whether the payload looks like ESP32 firmware
    pub fn is_valid(&self) -> bool {
        self.data.len() >= 8 && self.data[0] == ESP_MAGIC
    }
}

/// An ordered set of firmware images, sorted by flash offset
#[derive(Debug, Clone, Default)]
pub struct FirmwareBundle {
    images: Vec<FirmwareImage>,
}

impl FirmwareBundle {
    /// Bundle a single binary, inferring its offset from the filename
    pub fn from_single(path: impl Into<PathBuf>, data: Vec<u8>) -> Self {
        let path = path.into();
        let offset = infer_offset(&path);

        FirmwareBundle {
            images: vec![FirmwareImage { path, data, offset }],
        }
    }

    /// Bundle a set of images, sorting them by offset
    pub fn from_images(mut images: Vec<FirmwareImage>) -> Self {
        images.sort_by_key(|image| image.offset);
        FirmwareBundle { images }
    }

    /// Load a bundle from a file or a build directory
    pub fn load(path: impl AsRef<Path>) -> Result<Self, FirmwareError> {
        let path = path.as_ref();
        if path.is_dir() {
            return Self::from_build_dir(path);
        }

        let data = fs::read(path).map_err(|source| FirmwareError::InvalidFile {
            path: path.to_path_buf(),
            source,
        })?;

        Ok(Self::from_single(path, data))
    }

    /// Scan a build directory for the canonical artifacts
    ///
    /// `firmware.bin` is mandatory; bootloader and partition table are
    /// picked up when present.
    pub fn from_build_dir(dir: impl AsRef<Path>) -> Result<Self, FirmwareError> {
        const CANONICAL_FILES: [(&str, u32); 3] = [
            ("bootloader.bin", BOOTLOADER_OFFSET),
            ("partitions.bin", PARTITION_TABLE_OFFSET),
            ("firmware.bin", APPLICATION_OFFSET),
        ];

        let dir = dir.as_ref();
        let mut images = Vec::new();

        for (name, offset) in CANONICAL_FILES {
            let path = dir.join(name);
            if !path.exists() {
                continue;
            }

            let data = fs::read(&path).map_err(|source| FirmwareError::InvalidFile {
                path: path.clone(),
                source,
            })?;
            images.push(FirmwareImage { path, data, offset });
        }

        if images.is_empty() {
            return Err(FirmwareError::NoFilesFound);
        }
        if !images.iter().any(|image| image.offset == APPLICATION_OFFSET) {
            return Err(FirmwareError::MissingFirmware);
        }

        Ok(Self::from_images(images))
    }

    pub fn images(&self) -> &[FirmwareImage] {
        &self.images
    }

    pub fn total_size(&self) -> usize {
        self.images.iter().map(FirmwareImage::size).sum()
    }

    /// Every image passes the magic check
    pub fn is_valid(&self) -> bool {
        !self.images.is_empty() && self.images.iter().all(FirmwareImage::is_valid)
    }

    /// All three canonical offsets are populated
    pub fn is_complete(&self) -> bool {
        let has = |offset| self.images.iter().any(|image| image.offset == offset);
        has(BOOTLOADER_OFFSET) && has(PARTITION_TABLE_OFFSET) && has(APPLICATION_OFFSET)
    }

    /// Reject bundles the loader would choke on
    pub fn validate(&self) -> Result<(), FirmwareError> {
        match self.images.iter().find(|image| !image.is_valid()) {
            None if self.images.is_empty() => Err(FirmwareError::NoFilesFound),
            None => Ok(()),
            Some(image) => Err(FirmwareError::InvalidImage {
                name: image.file_name(),
            }),
        }
    }

    /// Short summary of the bundle's contents
    pub fn file_name(&self) -> String {
        match self.images.as_slice() {
            [] => "No firmware".to_string(),
            [single] => single.file_name(),
            many => format!("{} files", many.len()),
        }
    }

    pub fn size_description(&self) -> String {
        format_size(self.total_size())
    }

    /// One line describing what will be written where
    pub fn flash_description(&self) -> String {
        let parts: Vec<String> = self
            .images
            .iter()
            .map(|image| {
                let name = match image.offset {
                    BOOTLOADER_OFFSET => "bootloader".to_string(),
                    PARTITION_TABLE_OFFSET => "partitions".to_string(),
                    APPLICATION_OFFSET => "app".to_string(),
                    _ => image.file_name(),
                };
                format!("{} @ 0x{:x} ({})", name, image.offset, format_size(image.size()))
            })
            .collect();

        parts.join(", ")
    }
}

fn format_size(bytes: usize) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.2} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}

/// Guess the flash offset of a standalone binary from its filename
///
/// Merged/factory images start at the very beginning of flash; anything
/// else is assumed to be an app-only build.
fn infer_offset(path: &Path) -> u32 {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_lowercase())
        .unwrap_or_default();

    if MERGED_IMAGE_MARKERS
        .iter()
        .any(|marker| name.contains(marker))
    {
        BOOTLOADER_OFFSET
    } else {
        APPLICATION_OFFSET
    }
}
