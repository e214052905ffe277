use std::ffi::CString;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::ptr;

/// A read-only, private memory mapping of a whole file.
pub(crate) struct Mmap {
    ptr: *mut libc::c_void,
    len: usize,
}

impl Mmap {
    pub(crate) fn open(path: &Path) -> io::Result<Mmap> {
        let cpath = CString::new(path.as_os_str().as_bytes())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains NUL"))?;
        let fd = syscall!(open(cpath.as_ptr(), libc::O_RDONLY | libc::O_CLOEXEC))?;
        let result = Mmap::from_fd(fd);
        let _ = syscall!(close(fd));
        result
    }

    fn from_fd(fd: libc::c_int) -> io::Result<Mmap> {
        // SAFETY: all-zeroes is a valid `stat`.
        let mut stat: libc::stat = unsafe { std::mem::zeroed() };
        syscall!(fstat(fd, &mut stat))?;
        if stat.st_size <= 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "empty file"));
        }
        let len = stat.st_size as usize;
        // SAFETY: mapping a valid fd read-only; failure is checked below.
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ,
                libc::MAP_PRIVATE,
                fd,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(Mmap { ptr, len })
    }

    pub(crate) fn as_bytes(&self) -> &[u8] {
        // SAFETY: the mapping is PROT_READ, `len` bytes long and lives
        // until drop.
        unsafe { std::slice::from_raw_parts(self.ptr as *const u8, self.len) }
    }
}

impl Drop for Mmap {
    fn drop(&mut self) {
        // SAFETY: `ptr`/`len` came from a successful mmap.
        unsafe {
            libc::munmap(self.ptr, self.len);
        }
    }
}
