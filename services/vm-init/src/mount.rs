//! Pseudo-filesystem mounts for the guest.
//!
//! Linux-only; uses direct libc calls like the rest of the early-boot path.

use crate::error::InitError;

#[cfg(target_os = "linux")]
use std::ffi::CString;

/// Mount /proc, /sys and /dev. Already-mounted targets are tolerated so a
/// re-executed init does not fail.
pub fn mount_pseudo_filesystems() -> Result<(), InitError> {
    mount_one("proc", "/proc", "proc")?;
    mount_one("sysfs", "/sys", "sysfs")?;
    mount_one("devtmpfs", "/dev", "devtmpfs")?;
    Ok(())
}

#[cfg(target_os = "linux")]
fn mount_one(source: &str, target: &str, fs_type: &str) -> Result<(), InitError> {
    use tracing::debug;

    std::fs::create_dir_all(target).map_err(|err| InitError::MountFailed {
        target: target.to_string(),
        detail: err.to_string(),
    })?;

    let c_source = CString::new(source).expect("static mount source");
    let c_target = CString::new(target).expect("static mount target");
    let c_fs_type = CString::new(fs_type).expect("static mount fs type");

    let rc = unsafe {
        libc::mount(
            c_source.as_ptr(),
            c_target.as_ptr(),
            c_fs_type.as_ptr(),
            0,
            std::ptr::null(),
        )
    };

    if rc != 0 {
        let err = std::io::Error::last_os_error();
        // EBUSY means the target is already mounted.
        if err.raw_os_error() == Some(libc::EBUSY) {
            debug!(target = %target, "already mounted");
            return Ok(());
        }
        return Err(InitError::MountFailed {
            target: target.to_string(),
            detail: err.to_string(),
        });
    }

    debug!(target = %target, fs_type = %fs_type, "mounted");
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn mount_one(_source: &str, target: &str, _fs_type: &str) -> Result<(), InitError> {
    Err(InitError::MountFailed {
        target: target.to_string(),
        detail: "pseudo-filesystem mounts are linux-only".to_string(),
    })
}
