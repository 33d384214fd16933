//! Firmware images.
//!
//! A [`FlashImage`] is a raw binary loaded in full, paired with the flash
//! address of its first byte.

use {
    crate::{
        error::{Error, Result},
        protocol::BLOCK_SIZE,
    },
    log::debug,
    std::path::Path,
};

/// Default flash base address of STM32 parts.
pub const DEFAULT_BASE_ADDRESS: u32 = 0x0800_0000;

/// Immutable firmware image with its load address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashImage {
    data: Vec<u8>,
    base_address: u32,
}

/// One write-memory block of an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block<'a> {
    /// Flash address of the first byte.
    pub address: u32,
    /// Between 1 and 256 bytes.
    pub data: &'a [u8],
}

impl FlashImage {
    /// Wrap raw bytes.
    ///
    /// Fails when `data` is empty or the image would run past the end of the
    /// 32-bit address space.
    pub fn from_bytes(data: Vec<u8>, base_address: u32) -> Result<Self> {
        if data.is_empty() {
            return Err(Error::InvalidImage("image is empty".into()));
        }
        let end = u64::from(base_address) + data.len() as u64;
        if end > u64::from(u32::MAX) + 1 {
            return Err(Error::InvalidImage(format!(
                "{} bytes at 0x{base_address:08X} exceed the 32-bit address space",
                data.len()
            )));
        }
        Ok(Self { data, base_address })
    }

    /// Read a binary file in full.
    pub fn from_file(path: impl AsRef<Path>, base_address: u32) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read(path)?;
        debug!("Loaded {} ({} bytes)", path.display(), data.len());
        Self::from_bytes(data, base_address)
    }

    /// Image contents.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Address of the first byte.
    pub fn base_address(&self) -> u32 {
        self.base_address
    }

    /// Image size in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Always false; empty images are rejected at construction.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Number of write-memory blocks.
    pub fn block_count(&self) -> usize {
        self.data.len().div_ceil(BLOCK_SIZE)
    }

    /// Iterate over consecutive 256-byte blocks; only the last may be shorter.
    pub fn blocks(&self) -> impl Iterator<Item = Block<'_>> {
        let base = self.base_address;
        self.data
            .chunks(BLOCK_SIZE)
            .enumerate()
            .map(move |(i, data)| {
                // Fits: construction checked base + len <= 2^32
                #[allow(clippy::cast_possible_truncation)]
                let offset = (i * BLOCK_SIZE) as u32;
                Block {
                    address: base.wrapping_add(offset),
                    data,
                }
            })
    }
}
