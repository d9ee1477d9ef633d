//! POSIX shared-memory regions.
//!
//! A [`Region`] is a named shm object this process created and maps
//! read-write while filling it. Sealing it drops the mapping and leaves a
//! [`Sealed`] region: a read-only descriptor whose contents are copied out
//! with positioned reads. Nothing outside the writer ever maps a buffer, so a
//! peer that shrinks its object can make a read fail but cannot fault this
//! process.
//!
//! The name is unlinked independently of any descriptor: once unlinked no new
//! process can open it, while descriptors already open keep working.

use std::ffi::c_void;
use std::fs::File;
use std::io;
use std::num::NonZeroUsize;
use std::os::unix::fs::FileExt;
use std::ptr::NonNull;

use bytes::Bytes;
use nix::fcntl::OFlag;
use nix::sys::mman::{MapFlags, ProtFlags, mmap, munmap, shm_open, shm_unlink};
use nix::sys::stat::Mode;

struct Mapping {
    ptr: NonNull<c_void>,
    /// At least 1, since zero-length mappings are not allowed.
    len: usize,
}

// SAFETY: the mapping is process-wide memory owned by this value; it is only
// unmapped in Drop. Mutation goes through `&mut Region`.
unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

impl Drop for Mapping {
    fn drop(&mut self) {
        // SAFETY: ptr/len came from a successful mmap and are unmapped once.
        if let Err(e) = unsafe { munmap(self.ptr, self.len) } {
            tracing::warn!(error = %e, "munmap failed");
        }
    }
}

/// A region being written by the process that created it.
pub(crate) struct Region {
    name: String,
    file: File,
    mapping: Mapping,
    /// Bytes exposed to callers.
    len: usize,
}

impl Region {
    /// Create and map a new shm object. Fails if the name already exists.
    pub fn create(name: &str, len: usize) -> io::Result<Self> {
        let fd = shm_open(
            name,
            OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
            Mode::S_IRUSR | Mode::S_IWUSR,
        )?;
        let file = File::from(fd);
        let map_len = len.max(1);

        let mapped = file
            .set_len(map_len as u64)
            .and_then(|()| map_writable(&file, map_len));
        match mapped {
            Ok(ptr) => Ok(Self {
                name: name.to_string(),
                file,
                mapping: Mapping { ptr, len: map_len },
                len,
            }),
            Err(e) => {
                let _ = unlink(name);
                Err(e)
            }
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: the mapping is live and at least len bytes long.
        unsafe { std::slice::from_raw_parts(self.mapping.ptr.as_ptr().cast::<u8>(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above; the mapping is PROT_WRITE and `&mut self`
        // guarantees exclusive access within this process.
        unsafe { std::slice::from_raw_parts_mut(self.mapping.ptr.as_ptr().cast::<u8>(), self.len) }
    }

    /// Stop writing: unmap and keep only the descriptor.
    pub fn seal(self) -> Sealed {
        let Self {
            name,
            file,
            mapping,
            len,
        } = self;
        drop(mapping);
        Sealed { name, file, len }
    }
}

/// A finished region, read by copying.
pub(crate) struct Sealed {
    name: String,
    file: File,
    len: usize,
}

impl Sealed {
    /// Open an existing shm object read-only.
    pub fn open(name: &str, len: usize) -> io::Result<Self> {
        let fd = shm_open(name, OFlag::O_RDONLY, Mode::empty())?;
        let file = File::from(fd);
        let actual = file.metadata()?.len();
        if actual < len as u64 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("shm object {name} is {actual} bytes, expected {len}"),
            ));
        }
        Ok(Self {
            name: name.to_string(),
            file,
            len,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Copy the contents out. An object shrunk since it was opened yields
    /// `UnexpectedEof`.
    pub fn read(&self) -> io::Result<Bytes> {
        let mut buf = vec![0u8; self.len];
        self.file.read_exact_at(&mut buf, 0)?;
        Ok(Bytes::from(buf))
    }
}

fn map_writable(file: &File, map_len: usize) -> io::Result<NonNull<c_void>> {
    let len = NonZeroUsize::new(map_len)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty mapping"))?;
    // SAFETY: fresh shared file mapping; no existing memory is replaced.
    let ptr = unsafe {
        mmap(
            None,
            len,
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
            MapFlags::MAP_SHARED,
            file,
            0,
        )
    }?;
    Ok(ptr)
}

/// Remove the shm name. Open descriptors remain valid.
pub(crate) fn unlink(name: &str) -> io::Result<()> {
    shm_unlink(name)?;
    Ok(())
}
