//! OS image fingerprints and payloads.
//!
//! A VM node runs the target inside a guest OS image. [`ImageInfo`] is the
//! compact fingerprint (name, size, SHA-256) both sides compare to decide
//! whether a node needs re-imaging; [`OsImage`] is the gzip-compressed
//! payload shipped when it does.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Errors from image fingerprinting and packaging.
#[derive(Debug, Error)]
pub enum ImageError {
    /// The configured image file does not exist.
    #[error("image file missing: {}", path.display())]
    FileMissing {
        /// The missing path.
        path: PathBuf,
    },

    /// Reading or compressing the image failed.
    #[error("image i/o error at {}: {source}", path.display())]
    Io {
        /// The file involved.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// Compact fingerprint of an OS image.
///
/// An empty `file_name` means "no image": a node reporting it always
/// fails validation and gets re-imaged.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ImageInfo {
    /// Base name of the image file.
    pub file_name: String,
    /// Size of the uncompressed image in bytes.
    pub size: u64,
    /// Hex-encoded SHA-256 of the image contents.
    pub hash: String,
}

impl ImageInfo {
    /// Fingerprint the image at `path`.
    ///
    /// # Errors
    ///
    /// [`ImageError::FileMissing`] if the path does not exist,
    /// [`ImageError::Io`] on read failure.
    pub fn from_file(path: &Path) -> Result<Self, ImageError> {
        if !path.exists() {
            return Err(ImageError::FileMissing {
                path: path.to_path_buf(),
            });
        }
        let mut file = File::open(path).map_err(|source| ImageError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let mut hasher = Sha256::new();
        let mut size = 0u64;
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = file.read(&mut buf).map_err(|source| ImageError::Io {
                path: path.to_path_buf(),
                source,
            })?;
            if n == 0 {
                break;
            }
            size += n as u64;
            hasher.update(&buf[..n]);
        }

        Ok(Self {
            file_name: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            size,
            hash: hex::encode(hasher.finalize()),
        })
    }

    /// Whether the fingerprint denotes an absent image.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.file_name.is_empty()
    }
}

/// Gzip-compressed OS image payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OsImage {
    /// Base name of the image file.
    pub file_name: String,
    /// Gzip-compressed image bytes.
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
}

impl OsImage {
    /// Package the image at `path` for transmission.
    ///
    /// # Errors
    ///
    /// [`ImageError::FileMissing`] if the path does not exist,
    /// [`ImageError::Io`] on read or compression failure.
    pub fn from_image_file(path: &Path) -> Result<Self, ImageError> {
        if !path.exists() {
            return Err(ImageError::FileMissing {
                path: path.to_path_buf(),
            });
        }
        let io_err = |source| ImageError::Io {
            path: path.to_path_buf(),
            source,
        };

        let mut file = File::open(path).map_err(io_err)?;
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        std::io::copy(&mut file, &mut encoder).map_err(io_err)?;
        let data = encoder.finish().map_err(io_err)?;

        Ok(Self {
            file_name: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            data,
        })
    }

    /// Decompress the payload back to raw image bytes.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error on corrupt gzip data.
    pub fn decompress(&self) -> std::io::Result<Vec<u8>> {
        let mut decoder = GzDecoder::new(&self.data[..]);
        let mut out = Vec::new();
        decoder.read_to_end(&mut out)?;
        Ok(out)
    }
}
