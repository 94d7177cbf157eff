//! Peer credential checks (spec §4.H): reject a connection whose peer UID
//! differs from the server's own UID. Windows gets a stub here — the named
//! pipe transport's impersonation + trusted-IP check lives with the pipe
//! implementation itself, not this module.

use std::os::unix::io::RawFd;

use crate::error::IpcError;

#[cfg(target_os = "linux")]
pub fn peer_uid(fd: RawFd) -> Result<u32, IpcError> {
    use std::mem;

    let mut cred: libc::ucred = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::ucred>() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_PEERCRED,
            &mut cred as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    if ret != 0 {
        return Err(IpcError::Io(std::io::Error::last_os_error()));
    }
    Ok(cred.uid)
}

#[cfg(any(target_os = "macos", target_os = "freebsd", target_os = "openbsd", target_os = "netbsd"))]
pub fn peer_uid(fd: RawFd) -> Result<u32, IpcError> {
    let mut uid: libc::uid_t = 0;
    let mut gid: libc::gid_t = 0;
    let ret = unsafe { libc::getpeereid(fd, &mut uid, &mut gid) };
    if ret != 0 {
        return Err(IpcError::Io(std::io::Error::last_os_error()));
    }
    Ok(uid)
}

#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "freebsd", target_os = "openbsd", target_os = "netbsd")))]
pub fn peer_uid(_fd: RawFd) -> Result<u32, IpcError> {
    Err(IpcError::CredentialRejected("peer credential check unsupported on this platform".into()))
}

/// Rejects the connection unless its peer UID matches the server's own
/// (spec §4.H: "reject if peer UID differs from server UID").
pub fn check_same_user(fd: RawFd) -> Result<(), IpcError> {
    let peer = peer_uid(fd)?;
    let own = unsafe { libc::getuid() };
    if peer != own {
        return Err(IpcError::CredentialRejected(format!("peer uid {peer} does not match server uid {own}")));
    }
    Ok(())
}
