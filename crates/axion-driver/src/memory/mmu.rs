//! The MMU mapping contract and a recording fake for tests.
//!
//! Real page-table manipulation is owned by the kernel driver; this trait is
//! the userspace view of it. The fake keeps a page-granular map so tests can
//! translate device addresses back to host memory and verify release.

use std::collections::HashMap;
use std::sync::Mutex;

use axion_api::{Buffer, Error, Result};

use crate::memory::util::{self, HOST_PAGE_SIZE};
use crate::memory::space::DmaDirection;

/// Userspace contract over the kernel's device MMU.
pub trait MmuMapper: Send + Sync {
    /// Brings the MMU online with `num_simple_page_table_entries` entries
    /// reserved for the simple region.
    fn open(&self, num_simple_page_table_entries: usize) -> Result<()>;

    /// Tears the MMU down. All mappings must already be released.
    fn close(&self) -> Result<()>;

    /// Maps the host memory backing `buffer` at device address
    /// `device_virtual_address`. The mapping covers whole pages.
    fn map(
        &self,
        buffer: &Buffer,
        device_virtual_address: u64,
        direction: DmaDirection,
    ) -> Result<()>;

    /// Releases `num_pages` pages starting at `device_virtual_address`.
    fn unmap(&self, device_virtual_address: u64, num_pages: u64) -> Result<()>;

    /// Translates one mapped device address back to a host address, when the
    /// implementation tracks enough state to do so.
    fn translate(&self, device_address: u64, size_bytes: usize) -> Result<Buffer>;
}

/// In-memory MMU fake: records page mappings, checks for double maps and
/// stray unmaps, translates addresses.
#[derive(Default)]
pub struct FakeMmuMapper {
    state: Mutex<FakeMmuState>,
}

#[derive(Default)]
struct FakeMmuState {
    open: bool,
    /// device page number -> host page address.
    pages: HashMap<u64, u64>,
}

impl FakeMmuMapper {
    /// Creates a closed fake MMU.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of currently mapped pages.
    pub fn num_mapped_pages(&self) -> usize {
        self.state.lock().unwrap().pages.len()
    }
}

impl MmuMapper for FakeMmuMapper {
    fn open(&self, _num_simple_page_table_entries: usize) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.open {
            return Err(Error::failed_precondition("MMU is already open"));
        }
        state.open = true;
        Ok(())
    }

    fn close(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if !state.open {
            return Err(Error::failed_precondition("MMU is not open"));
        }
        if !state.pages.is_empty() {
            return Err(Error::failed_precondition(format!(
                "MMU closed with {} pages still mapped",
                state.pages.len()
            )));
        }
        state.open = false;
        Ok(())
    }

    fn map(
        &self,
        buffer: &Buffer,
        device_virtual_address: u64,
        _direction: DmaDirection,
    ) -> Result<()> {
        if !buffer.is_ptr_type() {
            return Err(Error::invalid_argument(
                "fake MMU can only map host-memory buffers",
            ));
        }
        let host = buffer.ptr() as u64;
        let pages = util::num_pages(host, buffer.size_bytes());
        let first_device_page = util::page_number_from_address(device_virtual_address);
        let first_host_page = util::page_address(host);

        let mut state = self.state.lock().unwrap();
        if !state.open {
            return Err(Error::failed_precondition("MMU is not open"));
        }
        for page in 0..pages {
            let device_page = first_device_page + page;
            if state.pages.contains_key(&device_page) {
                return Err(Error::already_exists(format!(
                    "device page 0x{device_page:x} is already mapped"
                )));
            }
            state
                .pages
                .insert(device_page, first_host_page + page * HOST_PAGE_SIZE);
        }
        Ok(())
    }

    fn unmap(&self, device_virtual_address: u64, num_pages: u64) -> Result<()> {
        let first_device_page = util::page_number_from_address(device_virtual_address);
        let mut state = self.state.lock().unwrap();
        for page in 0..num_pages {
            if state.pages.remove(&(first_device_page + page)).is_none() {
                return Err(Error::not_found(format!(
                    "device page 0x{:x} is not mapped",
                    first_device_page + page
                )));
            }
        }
        Ok(())
    }

    fn translate(&self, device_address: u64, size_bytes: usize) -> Result<Buffer> {
        let state = self.state.lock().unwrap();
        let pages = util::num_pages(device_address, size_bytes);
        let first_device_page = util::page_number_from_address(device_address);

        // The range must be mapped host-contiguously to wrap it in a single
        // buffer.
        let first_host = *state.pages.get(&first_device_page).ok_or_else(|| {
            Error::not_found(format!("device address 0x{device_address:x} is not mapped"))
        })?;
        for page in 1..pages {
            let host = state.pages.get(&(first_device_page + page)).ok_or_else(|| {
                Error::not_found(format!(
                    "device page 0x{:x} is not mapped",
                    first_device_page + page
                ))
            })?;
            if *host != first_host + page * HOST_PAGE_SIZE {
                return Err(Error::failed_precondition(
                    "device range is not host-contiguous",
                ));
            }
        }
        let host_address = first_host + util::page_offset(device_address);
        Ok(Buffer::from_ptr(host_address as *mut u8, size_bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_translate_unmap_round_trip() {
        let mmu = FakeMmuMapper::new();
        mmu.open(256).unwrap();

        let mut storage = vec![0u8; 8192];
        let buffer = Buffer::from_ptr(storage.as_mut_ptr(), 8192);
        mmu.map(&buffer, 0x40_0000, DmaDirection::ToDevice).unwrap();

        let offset = util::page_offset(storage.as_ptr() as u64);
        let translated = mmu.translate(0x40_0000 + offset, 16).unwrap();
        assert_eq!(translated.ptr() as u64, storage.as_ptr() as u64);

        let pages = util::num_pages(storage.as_ptr() as u64, 8192);
        mmu.unmap(0x40_0000, pages).unwrap();
        assert_eq!(mmu.num_mapped_pages(), 0);
        mmu.close().unwrap();
    }

    #[test]
    fn double_map_is_rejected() {
        let mmu = FakeMmuMapper::new();
        mmu.open(256).unwrap();
        let mut storage = vec![0u8; 4096];
        let buffer = Buffer::from_ptr(storage.as_mut_ptr(), 4096);
        mmu.map(&buffer, 0x1000, DmaDirection::ToDevice).unwrap();
        let err = mmu.map(&buffer, 0x1000, DmaDirection::ToDevice).unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));
    }

    #[test]
    fn close_with_mappings_fails() {
        let mmu = FakeMmuMapper::new();
        mmu.open(256).unwrap();
        let mut storage = vec![0u8; 4096];
        let buffer = Buffer::from_ptr(storage.as_mut_ptr(), 4096);
        mmu.map(&buffer, 0x1000, DmaDirection::ToDevice).unwrap();
        assert!(mmu.close().is_err());
    }
}
