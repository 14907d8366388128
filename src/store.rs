//! Persisted capacity record.
//!
//! The last displayed capacity survives reboots so the first value shown
//! after power-on does not regress behind what the user last saw. Two
//! on-disk layouts exist: the legacy flat record (a raw little-endian
//! 32-bit integer) and the marked record (magic-validated, with a reserved
//! tail matching the flash-partition layout of older firmware).

use crate::error::StoreError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Magic marking a valid `Marked` record.
const RECORD_MAGIC: u32 = 12_345_678;

/// Reserved tail length of the marked record.
const RECORD_RESERVE: usize = 512;

/// On-disk layout of the capacity record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreFormat {
    /// Raw little-endian 4-byte integer.
    #[default]
    Flat,
    /// Magic + capacity + reserved padding.
    Marked,
}

/// File-backed store for the last displayed capacity.
pub struct CapacityStore {
    path: PathBuf,
    format: StoreFormat,
}

impl CapacityStore {
    pub fn new(path: impl Into<PathBuf>, format: StoreFormat) -> Self {
        Self {
            path: path.into(),
            format,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the persisted capacity, validating format and range.
    pub fn load(&self) -> Result<u8, StoreError> {
        let bytes = fs::read(&self.path)?;
        let value = match self.format {
            StoreFormat::Flat => {
                if bytes.len() < 4 {
                    return Err(StoreError::Truncated(bytes.len()));
                }
                i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
            }
            StoreFormat::Marked => {
                if bytes.len() < 8 {
                    return Err(StoreError::Truncated(bytes.len()));
                }
                let magic = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
                if magic != RECORD_MAGIC {
                    return Err(StoreError::BadMagic(magic));
                }
                i32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]])
            }
        };

        if !(0..=100).contains(&value) {
            return Err(StoreError::OutOfRange(value));
        }
        Ok(value as u8)
    }

    /// Persist a capacity value using an atomic tmp-and-rename write.
    pub fn save(&self, percent: u8) -> Result<(), StoreError> {
        let mut bytes = Vec::with_capacity(8 + RECORD_RESERVE);
        match self.format {
            StoreFormat::Flat => {
                bytes.extend_from_slice(&(percent as i32).to_le_bytes());
            }
            StoreFormat::Marked => {
                bytes.extend_from_slice(&RECORD_MAGIC.to_le_bytes());
                bytes.extend_from_slice(&(percent as u32).to_le_bytes());
                bytes.extend_from_slice(&[0u8; RECORD_RESERVE]);
            }
        }

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let temp_path = self.path.with_extension("tmp");
        {
            let mut file = fs::File::create(&temp_path)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        fs::rename(&temp_path, &self.path)?;

        Ok(())
    }

    /// Save, logging instead of propagating: persistence failures never
    /// bring down the monitor.
    pub fn save_lossy(&self, percent: u8) {
        if let Err(e) = self.save(percent) {
            warn!("failed to persist capacity {}: {}", percent, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tempfile::tempdir;

    #[test]
    fn test_load_missing_file() {
        let dir = tempdir().unwrap();
        let store = CapacityStore::new(dir.path().join("cap.dat"), StoreFormat::Flat);
        assert!(store.load().is_err());
    }

    #[test]
    fn test_marked_magic_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cap.dat");
        std::fs::write(&path, [0u8; 520]).unwrap();
        let store = CapacityStore::new(&path, StoreFormat::Marked);
        assert!(matches!(store.load(), Err(StoreError::BadMagic(0))));
    }

    #[test]
    fn test_truncated_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cap.dat");
        std::fs::write(&path, [42u8, 0]).unwrap();
        let store = CapacityStore::new(&path, StoreFormat::Flat);
        assert!(matches!(store.load(), Err(StoreError::Truncated(2))));
    }

    #[test]
    fn test_out_of_range_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cap.dat");
        std::fs::write(&path, 120i32.to_le_bytes()).unwrap();
        let store = CapacityStore::new(&path, StoreFormat::Flat);
        assert!(matches!(store.load(), Err(StoreError::OutOfRange(120))));

        std::fs::write(&path, (-1i32).to_le_bytes()).unwrap();
        assert!(matches!(store.load(), Err(StoreError::OutOfRange(-1))));
    }

    #[test]
    fn test_marked_record_layout() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cap.dat");
        let store = CapacityStore::new(&path, StoreFormat::Marked);
        store.save(73).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(bytes.len(), 8 + 512);
        assert_eq!(
            u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            12_345_678
        );
        assert_eq!(
            u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
            73
        );
    }

    proptest! {
        #[test]
        fn prop_round_trip_flat(percent in 0u8..=100) {
            let dir = tempdir().unwrap();
            let store = CapacityStore::new(dir.path().join("cap.dat"), StoreFormat::Flat);
            store.save(percent).unwrap();
            prop_assert_eq!(store.load().unwrap(), percent);
        }

        #[test]
        fn prop_round_trip_marked(percent in 0u8..=100) {
            let dir = tempdir().unwrap();
            let store = CapacityStore::new(dir.path().join("cap.dat"), StoreFormat::Marked);
            store.save(percent).unwrap();
            prop_assert_eq!(store.load().unwrap(), percent);
        }
    }
}
