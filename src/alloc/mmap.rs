// src/alloc/mmap.rs
//! File-backed arena for allocators running in mmap mode.
//!
//! The arena reserves a very large span of address space up front with
//! `PROT_NONE`, then maps an anonymous unlinked temp file over its head with
//! `MAP_FIXED`. Growth extends the file and remaps in place, so node
//! addresses never move for the lifetime of the allocator. Linux only; on
//! other platforms [`MmapArena::create`] reports
//! [`PoolError::MmapUnsupported`].

use crate::config::{ALLOCATOR_MMAP_RESERVED, BOUNDARY_SIZE};
use crate::error::{PoolError, Result};

/// State of one file-backed mapping. All extents are in `BOUNDARY_SIZE`
/// units.
pub(crate) struct MmapArena {
    fd: libc::c_int,
    pub(crate) base: *mut u8,
    /// Units handed out so far; the next node starts here.
    pub(crate) current: u32,
    /// Units currently committed (file length / mapped read-write extent).
    pub(crate) max: u32,
}

impl MmapArena {
    /// Creates the backing file and the fixed reservation. `initial_pages`
    /// of 0 selects the default extent of 1024 units (4 MiB).
    #[cfg(target_os = "linux")]
    pub(crate) fn create(initial_pages: u32) -> Result<MmapArena> {
        let pages = if initial_pages == 0 { 1024 } else { initial_pages };
        let size = pages as usize * BOUNDARY_SIZE;
        if size > ALLOCATOR_MMAP_RESERVED {
            return Err(PoolError::MmapSetup("initial extent exceeds reservation".into()));
        }

        unsafe {
            let mut template = *b"/tmp/treepool.mmap.XXXXXX\0";
            let fd = libc::mkstemp(template.as_mut_ptr() as *mut libc::c_char);
            if fd == -1 {
                return Err(setup_err("mkstemp"));
            }
            // The file stays alive through the descriptor only.
            libc::unlink(template.as_ptr() as *const libc::c_char);

            if libc::ftruncate(fd, size as libc::off_t) == -1 {
                let err = setup_err("ftruncate");
                libc::close(fd);
                return Err(err);
            }

            let reserve = libc::mmap(
                std::ptr::null_mut(),
                ALLOCATOR_MMAP_RESERVED,
                libc::PROT_NONE,
                libc::MAP_ANONYMOUS | libc::MAP_PRIVATE,
                -1,
                0,
            );
            if reserve == libc::MAP_FAILED {
                let err = setup_err("mmap reservation");
                libc::close(fd);
                return Err(err);
            }

            let map = libc::mmap(
                reserve,
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_FIXED | libc::MAP_NORESERVE,
                fd,
                0,
            );
            if map == libc::MAP_FAILED {
                let err = setup_err("mmap overlay");
                libc::munmap(reserve, ALLOCATOR_MMAP_RESERVED);
                libc::close(fd);
                return Err(err);
            }

            Ok(MmapArena {
                fd,
                base: map as *mut u8,
                current: 0,
                max: pages,
            })
        }
    }

    #[cfg(not(target_os = "linux"))]
    pub(crate) fn create(_initial_pages: u32) -> Result<MmapArena> {
        Err(PoolError::MmapUnsupported)
    }

    /// Grows the committed extent in place to at least `required` units.
    /// Requests a doubling or the exact extent, whichever is larger.
    #[cfg(target_os = "linux")]
    pub(crate) fn grow(&mut self, required: u32) -> Result<()> {
        let old_size = self.max as usize * BOUNDARY_SIZE;
        let mut new_size = old_size * 2;
        if new_size / BOUNDARY_SIZE < required as usize {
            new_size = required as usize * BOUNDARY_SIZE;
        }
        if new_size > ALLOCATOR_MMAP_RESERVED {
            log::error!("mmap arena reservation exhausted ({} bytes requested)", new_size);
            return Err(PoolError::MmapGrowth("reservation exhausted".into()));
        }

        unsafe {
            if libc::ftruncate(self.fd, new_size as libc::off_t) == -1 {
                return Err(growth_err("ftruncate"));
            }

            // Open the hole in the reservation, then expand the file
            // mapping into it without moving.
            libc::munmap(self.base.add(old_size) as *mut libc::c_void, new_size - old_size);
            let remapped = libc::mremap(self.base as *mut libc::c_void, old_size, new_size, 0);
            if remapped == libc::MAP_FAILED {
                return Err(growth_err("mremap"));
            }
        }

        self.max = (new_size / BOUNDARY_SIZE) as u32;
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    pub(crate) fn grow(&mut self, _required: u32) -> Result<()> {
        Err(PoolError::MmapUnsupported)
    }
}

impl Drop for MmapArena {
    fn drop(&mut self) {
        #[cfg(target_os = "linux")]
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, ALLOCATOR_MMAP_RESERVED);
            libc::close(self.fd);
        }
    }
}

#[cfg(target_os = "linux")]
fn setup_err(stage: &str) -> PoolError {
    let err = std::io::Error::last_os_error();
    log::error!("mmap arena setup failed at {}: {}", stage, err);
    PoolError::MmapSetup(format!("{}: {}", stage, err))
}

#[cfg(target_os = "linux")]
fn growth_err(stage: &str) -> PoolError {
    let err = std::io::Error::last_os_error();
    log::error!("mmap arena growth failed at {}: {}", stage, err);
    PoolError::MmapGrowth(format!("{}: {}", stage, err))
}
