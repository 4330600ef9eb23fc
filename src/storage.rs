//! Persistent storage collaborator.
//!
//! Storage is addressed by sequential sector address. The pipeline reads one group of
//! blocks per address.
use std::collections::BTreeMap;
use std::io::{Read, Seek, SeekFrom, Write};

use tracing::trace;

use crate::{Error, Result};

/// Byte-level access to the medium holding raw sample blocks.
pub trait Storage {
    /// Read `len` bytes starting at sector `address`.
    ///
    /// # Errors
    /// [Error::NotEnoughData] if fewer than `len` bytes are stored there, or any
    /// error from the medium.
    fn read(&mut self, address: u32, len: usize) -> Result<Vec<u8>>;

    /// Write `data` starting at sector `address`.
    ///
    /// # Errors
    /// Any error from the medium.
    fn write(&mut self, address: u32, data: &[u8]) -> Result<()>;
}

impl<S: Storage + ?Sized> Storage for &mut S {
    fn read(&mut self, address: u32, len: usize) -> Result<Vec<u8>> {
        (**self).read(address, len)
    }

    fn write(&mut self, address: u32, data: &[u8]) -> Result<()> {
        (**self).write(address, data)
    }
}

/// Storage held in memory, one buffer per written address.
#[derive(Debug, Default, Clone)]
pub struct MemStorage {
    sectors: BTreeMap<u32, Vec<u8>>,
}

impl MemStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of addresses written.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sectors.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sectors.is_empty()
    }
}

impl Storage for MemStorage {
    fn read(&mut self, address: u32, len: usize) -> Result<Vec<u8>> {
        let sector = self.sectors.get(&address).map_or(&[][..], Vec::as_slice);
        if sector.len() < len {
            return Err(Error::NotEnoughData {
                actual: sector.len(),
                minimum: len,
            });
        }
        Ok(sector[..len].to_vec())
    }

    fn write(&mut self, address: u32, data: &[u8]) -> Result<()> {
        self.sectors.insert(address, data.to_vec());
        Ok(())
    }
}

/// Storage over a seekable byte medium, e.g., a file or an image of a card.
///
/// Address `n` starts at byte offset `n * sector_size`. Writes longer than a sector
/// spill into the following sectors.
pub struct FileStorage<F>
where
    F: Read + Write + Seek,
{
    inner: F,
    sector_size: usize,
}

impl<F> FileStorage<F>
where
    F: Read + Write + Seek,
{
    pub fn new(inner: F, sector_size: usize) -> Self {
        FileStorage { inner, sector_size }
    }

    #[must_use]
    pub fn sector_size(&self) -> usize {
        self.sector_size
    }

    pub fn into_inner(self) -> F {
        self.inner
    }

    fn seek(&mut self, address: u32) -> Result<()> {
        let offset = address as u64 * self.sector_size as u64;
        self.inner.seek(SeekFrom::Start(offset))?;
        Ok(())
    }
}

impl<F> Storage for FileStorage<F>
where
    F: Read + Write + Seek,
{
    fn read(&mut self, address: u32, len: usize) -> Result<Vec<u8>> {
        self.seek(address)?;
        let mut buf = vec![0u8; len];
        let mut got = 0;
        while got < len {
            let n = self.inner.read(&mut buf[got..])?;
            if n == 0 {
                return Err(Error::NotEnoughData {
                    actual: got,
                    minimum: len,
                });
            }
            got += n;
        }
        trace!(address, len, "storage read");
        Ok(buf)
    }

    fn write(&mut self, address: u32, data: &[u8]) -> Result<()> {
        self.seek(address)?;
        self.inner.write_all(data)?;
        self.inner.flush()?;
        trace!(address, len = data.len(), "storage write");
        Ok(())
    }
}
