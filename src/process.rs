//! Process privilege helpers.
//!
//! Servers that bind privileged ports start as root and shed it before
//! accepting traffic. [`drop_privileges`] is a no-op for unprivileged
//! runs, so the same command line works in development.

use std::ffi::CString;
use std::io;

use crate::error::{Error, Result};

/// Drops root privileges to `user`.
///
/// The group changes before the user: once `setuid` has run, the process
/// is no longer allowed to change its group.
pub fn drop_privileges(user: &str) -> Result<()> {
    // SAFETY: `getuid` has no preconditions.
    if unsafe { libc::getuid() } != 0 {
        return Ok(());
    }
    let name = CString::new(user).map_err(|_| {
        Error::io(
            "drop privileges",
            io::Error::new(io::ErrorKind::InvalidInput, "user contains NUL"),
        )
    })?;
    // SAFETY: `getpwnam` returns null or a pointer into static storage
    // that stays valid until the next passwd lookup.
    let pw = unsafe { libc::getpwnam(name.as_ptr()) };
    if pw.is_null() {
        return Err(Error::io(
            "drop privileges",
            io::Error::new(io::ErrorKind::NotFound, "unknown user"),
        ));
    }
    // SAFETY: a non-null `getpwnam` result is a valid passwd entry.
    unsafe {
        if libc::setgid((*pw).pw_gid) < 0 {
            return Err(Error::io("drop privileges", io::Error::last_os_error()));
        }
        if libc::setuid((*pw).pw_uid) < 0 {
            return Err(Error::io("drop privileges", io::Error::last_os_error()));
        }
    }
    Ok(())
}
