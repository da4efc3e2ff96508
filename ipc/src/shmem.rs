use std::{fmt, num::NonZeroUsize};

use anyhow::{Context, Result};
use nix::{
    fcntl::OFlag,
    sys::{
        mman::{mmap, munmap, shm_open, shm_unlink, MapFlags, ProtFlags},
        stat::Mode,
    },
    unistd::{close, ftruncate},
};

/// A fixed-size memory region shared between the engine and the target
/// process. Named regions are backed by POSIX shared memory and can be
/// attached from another process; anonymous regions are inherited across
/// fork and used by in-process tests.
pub struct ShmRegion {
    ptr: *mut u8,
    len: usize,
    /// shm object name, set iff this side owns the name and must unlink it
    name: Option<String>,
}

// the region is a plain byte range, synchronization is the channel's job
unsafe impl Send for ShmRegion {}

impl fmt::Debug for ShmRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShmRegion")
            .field("len", &self.len)
            .field("name", &self.name)
            .finish()
    }
}

fn shm_name(name: &str) -> String {
    if name.starts_with('/') {
        name.into()
    } else {
        format!("/{name}")
    }
}

impl ShmRegion {
    /// create and own a named region, unlinked on drop
    pub fn create(name: &str, len: usize) -> Result<Self> {
        let name = shm_name(name);

        let fd = shm_open(
            name.as_str(),
            OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
            Mode::S_IRUSR | Mode::S_IWUSR,
        )
        .with_context(|| format!("Failed to create shared memory object {name:?}"))?;

        let result = ftruncate(fd, len as i64)
            .with_context(|| format!("Failed to size shared memory object {name:?}"))
            .and_then(|_| Self::map(fd, len));
        let _ = close(fd);

        match result {
            Ok(ptr) => Ok(Self {
                ptr,
                len,
                name: Some(name),
            }),
            Err(e) => {
                let _ = shm_unlink(name.as_str());
                Err(e)
            }
        }
    }

    /// attach to a region created by the peer
    pub fn open(name: &str, len: usize) -> Result<Self> {
        let name = shm_name(name);

        let fd = shm_open(name.as_str(), OFlag::O_RDWR, Mode::empty())
            .with_context(|| format!("Failed to open shared memory object {name:?}"))?;

        let result = Self::map(fd, len);
        let _ = close(fd);

        Ok(Self {
            ptr: result?,
            len,
            name: None,
        })
    }

    /// anonymous shared mapping, inherited across fork
    pub fn anonymous(len: usize) -> Result<Self> {
        let ptr = unsafe {
            mmap(
                None,
                NonZeroUsize::new(len).context("empty shared memory region")?,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED | MapFlags::MAP_ANONYMOUS,
                -1,
                0,
            )
        }
        .context("Failed to map anonymous shared memory")?;

        Ok(Self {
            ptr: ptr.cast(),
            len,
            name: None,
        })
    }

    fn map(fd: i32, len: usize) -> Result<*mut u8> {
        let ptr = unsafe {
            mmap(
                None,
                NonZeroUsize::new(len).context("empty shared memory region")?,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                fd,
                0,
            )
        }
        .context("Failed to map shared memory object")?;

        Ok(ptr.cast())
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }
}

impl Drop for ShmRegion {
    fn drop(&mut self) {
        if let Err(e) = unsafe { munmap(self.ptr.cast(), self.len) } {
            log::warn!("failed to unmap shared memory region: {}", e);
        }

        if let Some(name) = &self.name {
            if let Err(e) = shm_unlink(name.as_str()) {
                log::warn!("failed to unlink shared memory object {:?}: {}", name, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anonymous_region_read_write() {
        let region = ShmRegion::anonymous(4096).unwrap();
        assert_eq!(region.len(), 4096);

        unsafe {
            region.as_ptr().write(0xa5);
            assert_eq!(region.as_ptr().read(), 0xa5);
        }
    }

    #[test]
    fn named_region_roundtrip() {
        let name = format!("skadi-test-{}", std::process::id());

        let owner = ShmRegion::create(&name, 4096).unwrap();
        unsafe { owner.as_ptr().write(0x42) };

        let peer = ShmRegion::open(&name, 4096).unwrap();
        assert_eq!(unsafe { peer.as_ptr().read() }, 0x42);
    }
}
