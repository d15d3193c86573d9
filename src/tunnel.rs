//! The tunnel file descriptor: a non-blocking, datagram-framed character
//! device where one `read` yields exactly one outbound IP packet and one
//! `write` injects exactly one inbound IP packet.

use crate::error::{Error, Result};
use mio::unix::SourceFd;
use std::os::unix::io::RawFd;

/// Owns the externally-provided tunnel fd for the lifetime of the engine
/// and closes it on drop, per the tunnel API's contract.
pub struct Tunnel {
    fd: RawFd,
}

impl Tunnel {
    /// Wrap an already-open tunnel fd, setting it non-blocking.
    ///
    /// # Safety
    /// `fd` must be a valid, open file descriptor the caller is handing
    /// over ownership of; `Tunnel` will close it on drop.
    pub fn from_raw_fd(fd: RawFd) -> Result<Self> {
        set_nonblocking(fd)?;
        Ok(Self { fd })
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.fd
    }

    /// Read exactly one packet into `buf`, returning its length.
    /// `Ok(0)` signals a zero-length read (host closed the tunnel side).
    pub fn read_packet(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = unsafe { libc::read(self.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n < 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    /// Write exactly one complete packet. The tunnel fd is treated as
    /// always-writable; an `EWOULDBLOCK` here is a contract violation by
    /// the host, surfaced as an ordinary I/O error rather than retried.
    pub fn write_packet(&mut self, pkt: &[u8]) -> std::io::Result<()> {
        let n = unsafe { libc::write(self.fd, pkt.as_ptr() as *const libc::c_void, pkt.len()) };
        if n < 0 {
            return Err(std::io::Error::last_os_error());
        }
        if n as usize != pkt.len() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "partial write to tunnel fd",
            ));
        }
        Ok(())
    }
}

impl mio::event::Source for Tunnel {
    fn register(
        &mut self,
        registry: &mio::Registry,
        token: mio::Token,
        interests: mio::Interest,
    ) -> std::io::Result<()> {
        SourceFd(&self.fd).register(registry, token, interests)
    }

    fn reregister(
        &mut self,
        registry: &mio::Registry,
        token: mio::Token,
        interests: mio::Interest,
    ) -> std::io::Result<()> {
        SourceFd(&self.fd).reregister(registry, token, interests)
    }

    fn deregister(&mut self, registry: &mio::Registry) -> std::io::Result<()> {
        SourceFd(&self.fd).deregister(registry)
    }
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

fn set_nonblocking(fd: RawFd) -> Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL, 0);
        if flags < 0 {
            return Err(Error::Io { source: std::io::Error::last_os_error() });
        }
        if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(Error::Io { source: std::io::Error::last_os_error() });
        }
    }
    Ok(())
}
