use std::io::{self, Error};
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Returns the system page size, cached atomically.
pub fn page_size() -> usize {
    static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

    match PAGE_SIZE.load(Ordering::Relaxed) {
        0 => {
            let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize };
            PAGE_SIZE.store(page_size, Ordering::Relaxed);
            page_size
        }
        page_size => page_size,
    }
}

/// Creates the anonymous file descriptor that backs an arena.
///
/// On Linux this is a memfd. Elsewhere we fall back to a POSIX shared
/// memory object that is unlinked immediately after creation, so the fd
/// is the only remaining reference.
#[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
fn create_backing_fd() -> io::Result<libc::c_int> {
    let fd = unsafe {
        libc::memfd_create(
            c"sys_dmap_arena".as_ptr().cast::<libc::c_char>(),
            libc::MFD_CLOEXEC,
        )
    };
    if fd < 0 {
        return Err(Error::last_os_error());
    }
    Ok(fd)
}

#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
fn create_backing_fd() -> io::Result<libc::c_int> {
    // Name must be unique per arena; pid + counter is enough since the
    // object is unlinked before this function returns.
    static COUNTER: AtomicUsize = AtomicUsize::new(0);
    let name = format!(
        "/sys_dmap.{}.{}\0",
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::Relaxed)
    );
    let name_ptr = name.as_ptr().cast::<libc::c_char>();

    let fd = unsafe {
        libc::shm_open(
            name_ptr,
            libc::O_RDWR | libc::O_CREAT | libc::O_EXCL,
            0o600 as libc::mode_t,
        )
    };
    if fd < 0 {
        return Err(Error::last_os_error());
    }
    unsafe {
        libc::shm_unlink(name_ptr);
    }
    Ok(fd)
}

/// An fd-backed, shared memory region.
///
/// Every page of the region can be mapped a second time at another virtual
/// address through the backing fd, which is what [`AliasInner::map`] does.
pub struct ArenaInner {
    fd: libc::c_int,
    base: *mut libc::c_void,
    len: usize,
}

impl ArenaInner {
    /// Creates a new arena of `len` bytes (must be a page multiple).
    ///
    /// # Safety
    ///
    /// This function is unsafe because it calls `mmap`.
    pub unsafe fn create(len: usize) -> io::Result<ArenaInner> {
        let fd = create_backing_fd()?;

        #[allow(clippy::cast_possible_wrap)]
        let rc = unsafe { libc::ftruncate(fd, len as libc::off_t) };
        if rc != 0 {
            let err = Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(err);
        }

        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            let err = Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(err);
        }

        Ok(ArenaInner { fd, base, len })
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
            if self.len > 0 {
                libc::munmap(self.base, self.len);
            }
            libc::close(self.fd);
        }
    }
}

unsafe impl Send for ArenaInner {}
unsafe impl Sync for ArenaInner {}

/// A contiguous virtual range whose pages alias chunks of an arena.
pub struct AliasInner {
    ptr: *mut libc::c_void,
    len: usize,
}

impl AliasInner {
    /// Maps `offsets.len()` chunks of `chunk_len` bytes each from the
    /// arena's fd into one contiguous range, in the order given.
    ///
    /// A `PROT_NONE` reservation is taken first so the whole range is ours,
    /// then each chunk is mapped over it with `MAP_FIXED`. `MAP_FIXED` is
    /// safe here because it only ever replaces pages of our own reservation.
    ///
    /// # Safety
    ///
    /// `arena` must outlive the returned alias; the caller guarantees each
    /// offset is a valid chunk within the arena.
    pub unsafe fn map(arena: &ArenaInner, offsets: &[usize], chunk_len: usize) -> io::Result<AliasInner> {
        let len = offsets.len() * chunk_len;

        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(Error::last_os_error());
        }

        for (i, &offset) in offsets.iter().enumerate() {
            let at = unsafe { base.cast::<u8>().add(i * chunk_len) };
            #[allow(clippy::cast_possible_wrap)]
            let mapped = unsafe {
                libc::mmap(
                    at.cast::<libc::c_void>(),
                    chunk_len,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_SHARED | libc::MAP_FIXED,
                    arena.fd,
                    offset as libc::off_t,
                )
            };
            if mapped == libc::MAP_FAILED {
                let err = Error::last_os_error();
                unsafe { libc::munmap(base, len) };
                return Err(err);
            }
        }

        Ok(AliasInner { ptr: base, len })
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
        let rc = unsafe { libc::munmap(self.ptr, self.len) };
        if rc != 0 {
            return Err(Error::last_os_error());
        }
        self.len = 0;
        Ok(())
    }
}

impl Drop for AliasInner {
    fn drop(&mut self) {
        if self.len > 0 {
            unsafe {
                libc::munmap(self.ptr, self.len);
            }
        }
    }
}

unsafe impl Send for AliasInner {}
unsafe impl Sync for AliasInner {}
