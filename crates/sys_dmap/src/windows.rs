use std::io::{self, Error};
use std::mem;
use std::ptr;

use windows_sys::Win32::Foundation::{CloseHandle, HANDLE, INVALID_HANDLE_VALUE};
use windows_sys::Win32::System::Memory::{
    CreateFileMappingW, MapViewOfFile, MapViewOfFileEx, UnmapViewOfFile, VirtualAlloc, VirtualFree,
    FILE_MAP_ALL_ACCESS, MEMORY_MAPPED_VIEW_ADDRESS, MEM_RELEASE, MEM_RESERVE, PAGE_NOACCESS,
    PAGE_READWRITE,
};
use windows_sys::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};

/// Returns the system allocation granularity (typically 64KB).
///
/// File mapping views must be placed at addresses, and start at file
/// offsets, that are multiples of this value. It is usually larger than
/// the page size.
pub fn allocation_granularity() -> usize {
    unsafe {
        let mut info: SYSTEM_INFO = mem::zeroed();
        GetSystemInfo(&mut info);
        let gran = info.dwAllocationGranularity as usize;
        if gran == 0 {
            65536
        } else {
            gran
        }
    }
}

pub fn page_size() -> usize {
    unsafe {
        let mut info: SYSTEM_INFO = mem::zeroed();
        GetSystemInfo(&mut info);
        let size = info.dwPageSize as usize;
        if size == 0 {
            4096
        } else {
            size
        }
    }
}

#[allow(clippy::cast_possible_truncation)]
const fn split_u64(value: u64) -> (u32, u32) {
    ((value >> 32) as u32, value as u32)
}

/// A pagefile-backed section mapped read-write at one base address.
///
/// The section handle is kept so further views of the same pages can be
/// created by [`AliasInner::map`].
pub struct ArenaInner {
    handle: HANDLE,
    base: *mut std::ffi::c_void,
    len: usize,
}

impl ArenaInner {
    /// Creates a new arena of `len` bytes.
    ///
    /// # Safety
    ///
    /// This function is unsafe because it creates raw OS mappings.
    pub unsafe fn create(len: usize) -> io::Result<ArenaInner> {
        let (size_high, size_low) = split_u64(len as u64);
        let handle = unsafe {
            CreateFileMappingW(
                INVALID_HANDLE_VALUE,
                ptr::null(),
                PAGE_READWRITE,
                size_high,
                size_low,
                ptr::null(),
            )
        };
        if handle.is_null() {
            return Err(Error::last_os_error());
        }

        let view = unsafe { MapViewOfFile(handle, FILE_MAP_ALL_ACCESS, 0, 0, len) };
        if view.Value.is_null() {
            let err = Error::last_os_error();
            unsafe { CloseHandle(handle) };
            return Err(err);
        }

        Ok(ArenaInner {
            handle,
            base: view.Value,
            len,
        })
    }

    pub fn base(&self) -> *mut u8 {
        self.base.cast::<u8>()
    }

    pub const fn len(&self) -> usize {
        self.len
    }
}

impl Drop for ArenaInner {
    fn drop(&mut self) {
        unsafe {
            UnmapViewOfFile(MEMORY_MAPPED_VIEW_ADDRESS { Value: self.base });
            CloseHandle(self.handle);
        }
    }
}

unsafe impl Send for ArenaInner {}
unsafe impl Sync for ArenaInner {}

/// A contiguous virtual range whose pages are additional views of arena chunks.
///
/// Unlike unix, every chunk is its own mapping view and must be unmapped
/// individually.
pub struct AliasInner {
    ptr: *mut std::ffi::c_void,
    len: usize,
    chunk_len: usize,
    views: usize,
}

impl AliasInner {
    /// Maps `offsets.len()` chunks of `chunk_len` bytes each into one
    /// contiguous range, in the order given.
    ///
    /// A free region of the right size is found by briefly reserving and
    /// releasing it, then each view is placed with `MapViewOfFileEx`. The
    /// probe is inherently racy against other mappers in the process; a
    /// view placement failure is surfaced as an error for the caller to
    /// retry or fall back.
    ///
    /// # Safety
    ///
    /// `arena` must outlive the returned alias; the caller guarantees each
    /// offset is a valid chunk within the arena.
    pub unsafe fn map(arena: &ArenaInner, offsets: &[usize], chunk_len: usize) -> io::Result<AliasInner> {
        let granularity = allocation_granularity();
        if chunk_len % granularity != 0 || offsets.iter().any(|off| off % granularity != 0) {
            return Err(Error::from(io::ErrorKind::InvalidInput));
        }

        let len = offsets.len() * chunk_len;

        let probe = unsafe { VirtualAlloc(ptr::null(), len, MEM_RESERVE, PAGE_NOACCESS) };
        if probe.is_null() {
            return Err(Error::last_os_error());
        }
        unsafe { VirtualFree(probe, 0, MEM_RELEASE) };

        for (i, &offset) in offsets.iter().enumerate() {
            let at = unsafe { probe.cast::<u8>().add(i * chunk_len) };
            let (offset_high, offset_low) = split_u64(offset as u64);
            let view = unsafe {
                MapViewOfFileEx(
                    arena.handle,
                    FILE_MAP_ALL_ACCESS,
                    offset_high,
                    offset_low,
                    chunk_len,
                    at.cast::<std::ffi::c_void>(),
                )
            };
            if view.Value.is_null() {
                let err = Error::last_os_error();
                unsafe { unmap_views(probe, chunk_len, i) };
                return Err(err);
            }
        }

        Ok(AliasInner {
            ptr: probe,
            len,
            chunk_len,
            views: offsets.len(),
        })
    }

    pub fn ptr(&self) -> *mut u8 {
        self.ptr.cast::<u8>()
    }

    pub const fn len(&self) -> usize {
        self.len
    }

    /// Unmaps the range, reporting failure instead of swallowing it.
    ///
    /// After a successful return the drop handler is a no-op.
    pub fn unmap(&mut self) -> io::Result<()> {
        if self.len == 0 {
            return Ok(());
        }
        unsafe { unmap_views(self.ptr, self.chunk_len, self.views) };
        self.len = 0;
        self.views = 0;
        Ok(())
    }
}

unsafe fn unmap_views(base: *mut std::ffi::c_void, chunk_len: usize, views: usize) {
    for i in 0..views {
        let at = unsafe { base.cast::<u8>().add(i * chunk_len) };
        unsafe {
            UnmapViewOfFile(MEMORY_MAPPED_VIEW_ADDRESS {
                Value: at.cast::<std::ffi::c_void>(),
            });
        }
    }
}

impl Drop for AliasInner {
    fn drop(&mut self) {
        if self.len > 0 {
            unsafe { unmap_views(self.ptr, self.chunk_len, self.views) };
        }
    }
}

unsafe impl Send for AliasInner {}
unsafe impl Sync for AliasInner {}
