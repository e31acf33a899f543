//! Stub backend for platforms without page-aliasing support.
//!
//! Every operation fails with [`std::io::ErrorKind::Unsupported`]; callers
//! should consult [`crate::supported`] first and fall back to copying.

use std::io;

fn unsupported() -> io::Error {
    io::Error::new(
        io::ErrorKind::Unsupported,
        "page aliasing is not supported on this platform",
    )
}

pub fn page_size() -> usize {
    4096
}

pub struct ArenaInner(());

impl ArenaInner {
    pub unsafe fn create(_len: usize) -> io::Result<ArenaInner> {
        Err(unsupported())
    }

    pub fn base(&self) -> *mut u8 {
        std::ptr::null_mut()
    }

    pub const fn len(&self) -> usize {
        0
    }
}

pub struct AliasInner(());

impl AliasInner {
    pub unsafe fn map(
        _arena: &ArenaInner,
        _offsets: &[usize],
        _chunk_len: usize,
    ) -> io::Result<AliasInner> {
        Err(unsupported())
    }

    pub fn ptr(&self) -> *mut u8 {
        std::ptr::null_mut()
    }

    pub const fn len(&self) -> usize {
        0
    }

    pub fn unmap(&mut self) -> io::Result<()> {
        Ok(())
    }
}
