use log::{debug, trace};

use super::{ERASED, Flash, Result, StorageError};

const REGION_MAGIC: u32 = 0xcf42_9c69;

/// Bytes taken by the `{magic, size}` header ahead of the region data.
pub const REGION_HEADER_SIZE: usize = 8;

/// Every write must start at a multiple of this.
pub const ALIGNMENT: usize = 8;

/// A `(base, size)` allocation inside the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    base: usize,
    size: usize,
}

impl Region {
    /// Returns the medium address of the first data byte.
    pub fn base(&self) -> usize {
        self.base
    }

    /// Returns the amount of data bytes in the region.
    pub fn size(&self) -> usize {
        self.size
    }
}

/// Enforces the alignment and bounds contract on top of a flash medium.
///
/// Regions are laid out back to back from the start of the medium, each
/// behind its own `{magic, size}` header and padded to `ALIGNMENT`. Writes
/// are only atomic per call, a region is never written as a whole in a
/// single transaction.
pub struct AppendStore {
    flash: Box<dyn Flash>,
}

impl AppendStore {
    /// Creates a new `AppendStore`.
    ///
    /// # Arguments
    /// * `flash` - The underlying medium.
    pub fn new(flash: Box<dyn Flash>) -> Self {
        Self { flash }
    }

    /// Returns the total amount of bytes in the medium.
    pub fn capacity(&self) -> usize {
        self.flash.capacity()
    }

    /// Returns the largest region an erased store can hold.
    pub fn available(&self) -> usize {
        self.capacity().saturating_sub(REGION_HEADER_SIZE)
    }

    /// Returns the largest region that can be appended right now.
    pub fn remaining(&self) -> Result<usize> {
        let (next, _) = self.scan()?;
        Ok(self.room_at(next))
    }

    /// Erases every page of the medium, dropping every region.
    ///
    /// # Returns
    /// A `WriteFailure` if the medium fails to erase a page.
    pub fn erase(&mut self) -> Result<()> {
        let end = self.capacity();
        let mut addr = 0;

        while addr < end {
            trace!(addr = addr; "erasing page");
            self.flash
                .erase_page(addr)
                .map_err(StorageError::WriteFailure)?;
            addr += self.flash.page_size(addr).max(1);
        }

        debug!(bytes = end; "store erased");
        Ok(())
    }

    /// Appends a region of `size` bytes after the last one by writing its header.
    ///
    /// # Arguments
    /// * `size` - The amount of data bytes.
    ///
    /// # Returns
    /// The new region, `StorageFull` if `size` exceeds the remaining space.
    pub fn allocate(&mut self, size: usize) -> Result<Region> {
        let (next, _) = self.scan()?;
        let remaining = self.room_at(next);

        let full = StorageError::StorageFull {
            requested: size,
            available: remaining,
        };

        if size > remaining || next + REGION_HEADER_SIZE > self.capacity() {
            return Err(full);
        }

        let Ok(len) = u32::try_from(size) else {
            return Err(full);
        };

        let mut header = [0; REGION_HEADER_SIZE];
        header[..4].copy_from_slice(&REGION_MAGIC.to_le_bytes());
        header[4..].copy_from_slice(&len.to_le_bytes());
        self.flash
            .write_bytes(next, &header)
            .map_err(StorageError::WriteFailure)?;

        debug!(addr = next, size = size; "region allocated");
        Ok(Region {
            base: next + REGION_HEADER_SIZE,
            size,
        })
    }

    /// Lists the regions recorded in the store, in allocation order.
    pub fn regions(&self) -> Result<Vec<Region>> {
        let (_, regions) = self.scan()?;
        Ok(regions)
    }

    /// Looks up the first region of the store.
    ///
    /// # Returns
    /// The region if its header is valid, `None` if the store holds none.
    pub fn region(&self) -> Result<Option<Region>> {
        Ok(self.regions()?.into_iter().next())
    }

    /// Walks the region headers from the start of the medium.
    ///
    /// # Returns
    /// The address the next header goes to and the regions found on the way.
    /// A slot that is neither a region nor erased leaves no room after it.
    fn scan(&self) -> Result<(usize, Vec<Region>)> {
        let end = self.capacity();
        let mut addr = 0;
        let mut regions = Vec::new();

        while addr + REGION_HEADER_SIZE <= end {
            let mut header = [0; REGION_HEADER_SIZE];
            self.flash
                .read_bytes(addr, &mut header)
                .map_err(StorageError::ReadFailure)?;

            let Some(size) = Self::parse_header(&header) else {
                if header.iter().any(|&b| b != ERASED) {
                    trace!(addr = addr; "garbage after last region");
                    return Ok((end, regions));
                }
                break;
            };

            let base = addr + REGION_HEADER_SIZE;
            if size > end - base {
                trace!(addr = addr; "region header runs past the medium");
                return Ok((end, regions));
            }

            regions.push(Region { base, size });
            addr = base + size.next_multiple_of(ALIGNMENT);
        }

        Ok((addr.min(end), regions))
    }

    fn parse_header(header: &[u8; REGION_HEADER_SIZE]) -> Option<usize> {
        let (magic, size) = header.split_at(4);
        let magic = u32::from_le_bytes([magic[0], magic[1], magic[2], magic[3]]);
        let size = u32::from_le_bytes([size[0], size[1], size[2], size[3]]);

        (magic == REGION_MAGIC).then_some(size as usize)
    }

    fn room_at(&self, addr: usize) -> usize {
        self.capacity()
            .saturating_sub(addr)
            .saturating_sub(REGION_HEADER_SIZE)
    }

    /// Programs `bytes` at `offset` inside `region`.
    ///
    /// # Arguments
    /// * `region` - The target region, must be recorded in the store.
    /// * `offset` - Offset from the region start, a multiple of `ALIGNMENT`.
    /// * `bytes` - The data to write, the target range must be erased.
    ///
    /// # Returns
    /// `NotFormatted`, `Unaligned`, `OutOfRange`, `NotErased` or `WriteFailure`.
    pub fn write_at(&mut self, region: &Region, offset: usize, bytes: &[u8]) -> Result<()> {
        if !self.regions()?.contains(region) {
            return Err(StorageError::NotFormatted);
        }

        if offset % ALIGNMENT != 0 {
            return Err(StorageError::Unaligned { offset });
        }

        let out_of_range = StorageError::OutOfRange {
            offset,
            len: bytes.len(),
            size: region.size,
        };

        match offset.checked_add(bytes.len()) {
            Some(end) if end <= region.size => {}
            _ => return Err(out_of_range),
        }

        let addr = region.base + offset;
        let mut current = vec![0; bytes.len()];
        self.flash
            .read_bytes(addr, &mut current)
            .map_err(StorageError::ReadFailure)?;

        if let Some(pos) = current.iter().position(|&b| b != ERASED) {
            return Err(StorageError::NotErased {
                offset: offset + pos,
            });
        }

        self.flash
            .write_bytes(addr, bytes)
            .map_err(StorageError::WriteFailure)?;

        trace!(offset = offset, len = bytes.len(); "region write");
        Ok(())
    }

    /// Reads `out.len()` bytes at `offset` inside `region`.
    pub fn read_at(&self, region: &Region, offset: usize, out: &mut [u8]) -> Result<()> {
        match offset.checked_add(out.len()) {
            Some(end) if end <= region.size => {}
            _ => {
                return Err(StorageError::OutOfRange {
                    offset,
                    len: out.len(),
                    size: region.size,
                });
            }
        }

        self.flash
            .read_bytes(region.base + offset, out)
            .map_err(StorageError::ReadFailure)
    }

    /// Reads the whole region.
    pub fn read_all(&self, region: &Region) -> Result<Vec<u8>> {
        let mut out = vec![0; region.size];
        self.read_at(region, 0, &mut out)?;
        Ok(out)
    }
}
