//! Flash-like media backing the append store.
//!
//! Both media follow NOR flash rules: an erased byte reads `0xFF` and
//! programming can only clear bits, so a byte written twice without an erase
//! ends up as the AND of both values.

use std::{
    fs::{File, OpenOptions},
    io::{self, Read, Seek, SeekFrom, Write},
    path::Path,
};

/// The value every byte holds right after an erase.
pub const ERASED: u8 = 0xff;

/// The raw medium under the append store.
pub trait Flash: Send {
    /// Total amount of bytes in the medium.
    fn capacity(&self) -> usize;

    /// Size of the erase unit containing `addr`.
    fn page_size(&self, addr: usize) -> usize;

    /// Resets the page starting at `addr` to `ERASED`.
    fn erase_page(&mut self, addr: usize) -> io::Result<()>;

    /// Programs `data` at `addr`, the bytes are durable once this returns.
    fn write_bytes(&mut self, addr: usize, data: &[u8]) -> io::Result<()>;

    /// Copies `out.len()` bytes starting at `addr` into `out`.
    fn read_bytes(&self, addr: usize, out: &mut [u8]) -> io::Result<()>;
}

fn check_bounds(capacity: usize, addr: usize, len: usize) -> io::Result<()> {
    match addr.checked_add(len) {
        Some(end) if end <= capacity => Ok(()),
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("access of {len} bytes at {addr:#x} is outside the {capacity} bytes medium"),
        )),
    }
}

/// A volatile medium, used by tests and by nodes configured without a flash file.
#[derive(Debug, Clone)]
pub struct MemFlash {
    data: Vec<u8>,
    page_size: usize,
}

impl MemFlash {
    /// Creates a new fully erased `MemFlash`.
    ///
    /// # Arguments
    /// * `capacity` - The size of the medium in bytes.
    /// * `page_size` - The size of an erase unit in bytes.
    pub fn new(capacity: usize, page_size: usize) -> Self {
        Self {
            data: vec![ERASED; capacity],
            page_size,
        }
    }

    /// Returns the whole medium contents.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }
}

impl Flash for MemFlash {
    fn capacity(&self) -> usize {
        self.data.len()
    }

    fn page_size(&self, _addr: usize) -> usize {
        self.page_size
    }

    fn erase_page(&mut self, addr: usize) -> io::Result<()> {
        let len = self.page_size.min(self.data.len().saturating_sub(addr));
        check_bounds(self.data.len(), addr, len)?;
        self.data[addr..addr + len].fill(ERASED);
        Ok(())
    }

    fn write_bytes(&mut self, addr: usize, data: &[u8]) -> io::Result<()> {
        check_bounds(self.data.len(), addr, data.len())?;
        self.data[addr..addr + data.len()]
            .iter_mut()
            .zip(data)
            .for_each(|(dst, src)| *dst &= src);

        Ok(())
    }

    fn read_bytes(&self, addr: usize, out: &mut [u8]) -> io::Result<()> {
        check_bounds(self.data.len(), addr, out.len())?;
        out.copy_from_slice(&self.data[addr..addr + out.len()]);
        Ok(())
    }
}

/// A medium persisted in a regular file, so a stored model survives a restart.
#[derive(Debug)]
pub struct FileFlash {
    file: File,
    capacity: usize,
    page_size: usize,
}

impl FileFlash {
    /// Opens the medium at `path`, creating it fully erased if it doesn't exist yet.
    ///
    /// # Arguments
    /// * `path` - The backing file.
    /// * `capacity` - The size of the medium in bytes.
    /// * `page_size` - The size of an erase unit in bytes.
    ///
    /// # Errors
    /// An `io::Error` if the file can't be opened or has a different size.
    pub fn open(path: &Path, capacity: usize, page_size: usize) -> io::Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let len = file.metadata()?.len() as usize;
        if len == 0 {
            file.write_all(&vec![ERASED; capacity])?;
            file.sync_data()?;
        } else if len != capacity {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "flash file {} holds {len} bytes, expected {capacity}",
                    path.display()
                ),
            ));
        }

        Ok(Self {
            file,
            capacity,
            page_size,
        })
    }
}

impl Flash for FileFlash {
    fn capacity(&self) -> usize {
        self.capacity
    }

    fn page_size(&self, _addr: usize) -> usize {
        self.page_size
    }

    fn erase_page(&mut self, addr: usize) -> io::Result<()> {
        let len = self.page_size.min(self.capacity.saturating_sub(addr));
        check_bounds(self.capacity, addr, len)?;

        self.file.seek(SeekFrom::Start(addr as u64))?;
        self.file.write_all(&vec![ERASED; len])?;
        self.file.sync_data()
    }

    fn write_bytes(&mut self, addr: usize, data: &[u8]) -> io::Result<()> {
        let mut current = vec![0; data.len()];
        self.read_bytes(addr, &mut current)?;
        current.iter_mut().zip(data).for_each(|(dst, src)| *dst &= src);

        self.file.seek(SeekFrom::Start(addr as u64))?;
        self.file.write_all(&current)?;
        self.file.sync_data()
    }

    fn read_bytes(&self, addr: usize, out: &mut [u8]) -> io::Result<()> {
        check_bounds(self.capacity, addr, out.len())?;

        let mut file = &self.file;
        file.seek(SeekFrom::Start(addr as u64))?;
        file.read_exact(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mem_flash_starts_erased() {
        let flash = MemFlash::new(64, 16);
        assert!(flash.as_bytes().iter().all(|&b| b == ERASED));
    }

    #[test]
    fn test_programming_only_clears_bits() {
        let mut flash = MemFlash::new(32, 16);
        flash.write_bytes(0, &[0b1010_1010]).unwrap();
        flash.write_bytes(0, &[0b1100_1100]).unwrap();

        let mut out = [0];
        flash.read_bytes(0, &mut out).unwrap();
        assert_eq!(out, [0b1000_1000]);
    }

    #[test]
    fn test_erase_page_only_touches_that_page() {
        let mut flash = MemFlash::new(32, 16);
        flash.write_bytes(0, &[0; 32]).unwrap();
        flash.erase_page(16).unwrap();

        assert!(flash.as_bytes()[..16].iter().all(|&b| b == 0));
        assert!(flash.as_bytes()[16..].iter().all(|&b| b == ERASED));
    }

    #[test]
    fn test_out_of_bounds_access_fails() {
        let mut flash = MemFlash::new(32, 16);
        assert!(flash.write_bytes(30, &[0; 4]).is_err());
        assert!(flash.read_bytes(usize::MAX, &mut [0; 2]).is_err());
    }

    #[test]
    fn test_file_flash_persists_writes() {
        let path = std::env::temp_dir().join(format!("model_host_flash_{}", std::process::id()));
        let _ = std::fs::remove_file(&path);

        {
            let mut flash = FileFlash::open(&path, 64, 32).unwrap();
            flash.write_bytes(8, &[1, 2, 3, 4]).unwrap();
        }

        let flash = FileFlash::open(&path, 64, 32).unwrap();
        let mut out = [0; 6];
        flash.read_bytes(6, &mut out).unwrap();
        assert_eq!(out, [ERASED, ERASED, 1, 2, 3, 4]);

        assert!(FileFlash::open(&path, 128, 32).is_err());
        std::fs::remove_file(&path).unwrap();
    }
}
