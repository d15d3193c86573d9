//! `TcpFlow`: one terminated TCP connection paired with its upstream
//! SOCKS4 socket.
//!
//! A flow never holds a raw pointer back into the engine or the stack;
//! it is identified by its `FlowId` (a stable slotmap key) and it
//! operates on the stack's `smoltcp::socket::tcp::Socket` only when the
//! engine hands it a `&mut` reference for the duration of a call.

use crate::buffer::StreamBuffer;
use crate::error::{Error, Result};
use crate::socks;
use slotmap::new_key_type;
use smoltcp::iface::SocketHandle;
use smoltcp::socket::tcp;
use socket2::Socket as RawSocket;
use std::io::{ErrorKind, Read, Write};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::unix::io::{AsRawFd, RawFd};

new_key_type! {
    /// Opaque, stable handle by which the engine and stack callbacks
    /// refer to a `TcpFlow`. Replaces the raw pointers into a vector the
    /// original source used.
    pub struct FlowId;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
    Connecting,
    Handshaking,
    Relaying,
    Dead,
}

pub struct TcpFlow {
    pub stack_handle: SocketHandle,
    pub original_dst: SocketAddrV4,
    socks: RawSocket,
    socks_send_buf: StreamBuffer,
    socks_recv_buf: StreamBuffer,
    handshake_done: bool,
    state: FlowState,
    /// Whether a write to `socks` is already pending dispatch; guards the
    /// "at most one pending SOCKS write in-flight" invariant.
    write_pending: bool,
}

impl TcpFlow {
    /// Create a flow for a freshly-accepted stack connection: opens the
    /// SOCKS socket non-blocking, starts the connect, and queues the
    /// 9-byte CONNECT request.
    pub fn new(
        stack_handle: SocketHandle,
        original_dst: SocketAddrV4,
        socks_server: SocketAddrV4,
        buffer_size: usize,
    ) -> Result<Self> {
        let socks = RawSocket::new(socket2::Domain::IPV4, socket2::Type::STREAM, Some(socket2::Protocol::TCP))
            .map_err(|e| Error::flow_setup(format!("socket(2) failed: {e}")))?;
        socks
            .set_nonblocking(true)
            .map_err(|e| Error::flow_setup(format!("set_nonblocking failed: {e}")))?;

        match socks.connect(&socket2::SockAddr::from(std::net::SocketAddr::V4(socks_server))) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.raw_os_error() == Some(libc::EINPROGRESS) => {}
            Err(e) => return Err(Error::flow_setup(format!("connect failed: {e}"))),
        }

        let mut socks_send_buf = StreamBuffer::new(buffer_size);
        let request = socks::build_connect_request(*original_dst.ip(), original_dst.port());
        socks_send_buf.append(&request)?;

        Ok(Self {
            stack_handle,
            original_dst,
            socks,
            socks_send_buf,
            socks_recv_buf: StreamBuffer::new(buffer_size),
            handshake_done: false,
            state: FlowState::Connecting,
            write_pending: true,
        })
    }

    pub fn state(&self) -> FlowState {
        self.state
    }

    pub fn socks_fd(&self) -> RawFd {
        self.socks.as_raw_fd()
    }

    pub fn original_dst_ip(&self) -> Ipv4Addr {
        *self.original_dst.ip()
    }

    /// Remaining room in `socks_send_buf`, the ceiling the stack-side
    /// `recv` consume count must respect so the guest's advertised window
    /// only reopens for bytes this flow actually buffered.
    pub fn socks_send_capacity(&self) -> usize {
        self.socks_send_buf.write_capacity()
    }

    /// Drain `socks_send_buf` to the wire. Used both for the initial
    /// CONNECT request and for relaying guest-originated bytes.
    pub fn on_socks_writable(&mut self) -> Result<()> {
        loop {
            if self.socks_send_buf.is_empty() {
                self.write_pending = false;
                break;
            }
            match self.socks.write(self.socks_send_buf.read_data()) {
                Ok(0) => return Err(Error::flow_relay("socks write returned 0")),
                Ok(n) => {
                    self.socks_send_buf.commit_read(n)?;
                    if self.state == FlowState::Connecting {
                        self.state = FlowState::Handshaking;
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    self.write_pending = true;
                    break;
                }
                Err(e) => return Err(Error::flow_relay(format!("socks write failed: {e}"))),
            }
        }
        Ok(())
    }

    /// Read available bytes from the SOCKS socket; consumes the 8-byte
    /// handshake reply first if it hasn't completed yet, then drains
    /// whatever follows toward the stack.
    pub fn on_socks_readable(&mut self, stack: &mut tcp::Socket<'_>) -> Result<()> {
        loop {
            if self.socks_recv_buf.write_capacity() == 0 {
                break;
            }
            match self.socks.read(self.socks_recv_buf.write_data()) {
                Ok(0) => return Err(Error::flow_relay("socks peer closed")),
                Ok(n) => self.socks_recv_buf.commit_write(n)?,
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => return Err(Error::flow_relay(format!("socks read failed: {e}"))),
            }
        }

        if !self.handshake_done {
            if self.socks_recv_buf.read_available() < socks::REPLY_LEN {
                return Ok(());
            }
            let mut reply = [0u8; socks::REPLY_LEN];
            reply.copy_from_slice(&self.socks_recv_buf.read_data()[..socks::REPLY_LEN]);
            self.socks_recv_buf.commit_read(socks::REPLY_LEN)?;
            socks::parse_reply(&reply).map_err(Error::SocksRejected)?;
            self.handshake_done = true;
            self.state = FlowState::Relaying;
        }

        self.drain_to_stack(stack)
    }

    /// Push buffered SOCKS-read bytes into the stack's send window, up to
    /// whatever it can currently accept. Stops without error on a full
    /// stack send buffer (backpressure); any other stack failure is fatal.
    fn drain_to_stack(&mut self, stack: &mut tcp::Socket<'_>) -> Result<()> {
        while self.socks_recv_buf.read_available() > 0 {
            if !stack.can_send() {
                break;
            }
            let data = self.socks_recv_buf.read_data();
            match stack.send_slice(data) {
                Ok(0) => break,
                Ok(n) => self.socks_recv_buf.commit_read(n)?,
                Err(_) => return Err(Error::stack("tcp_write failed")),
            }
        }
        Ok(())
    }

    /// The stack delivered `payload` from the terminated peer. `None`
    /// means the peer closed (FIN); the caller should destroy the flow.
    pub fn on_stack_recv(&mut self, payload: Option<&[u8]>) -> Result<()> {
        let Some(payload) = payload else {
            return Err(Error::flow_relay("peer closed"));
        };
        if payload.len() > self.socks_send_buf.write_capacity() {
            return Err(Error::BufferFull);
        }
        self.socks_send_buf.append(payload)?;
        Ok(())
    }

    /// The stack has transmitted `n` more bytes to the terminated peer;
    /// there may now be room to submit more from `socks_recv_buf`.
    pub fn on_stack_sent(&mut self, stack: &mut tcp::Socket<'_>) -> Result<()> {
        self.drain_to_stack(stack)
    }

    pub fn has_pending_socks_write(&self) -> bool {
        self.write_pending || !self.socks_send_buf.is_empty()
    }

    pub fn mark_dead(&mut self) {
        self.state = FlowState::Dead;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_flow_queues_the_connect_request() {
        // Exercises request construction without opening a real socket by
        // checking the buffer contents `TcpFlow::new` would produce.
        let mut buf = StreamBuffer::new(64);
        let req = socks::build_connect_request(Ipv4Addr::new(1, 2, 3, 4), 80);
        buf.append(&req).unwrap();
        assert_eq!(buf.read_data(), [0x04, 0x01, 0x00, 0x50, 0x01, 0x02, 0x03, 0x04, 0x00]);
    }
}
