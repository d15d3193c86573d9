//! The virtual `smoltcp` device backing the embedded TCP/IP stack.
//!
//! Unlike a hardware NIC, this device has no DMA rings to manage: inbound
//! packets are pushed by `Engine::input()` as owned buffers, and outbound
//! packets are collected into a queue for the engine to write to the
//! tunnel fd one-write-per-packet (P5).

use smoltcp::phy::{Device, DeviceCapabilities, Medium};
use smoltcp::time::Instant as SmolInstant;
use std::collections::VecDeque;

pub struct VirtualDevice {
    mtu: usize,
    rx_queue: VecDeque<Vec<u8>>,
    tx_queue: VecDeque<Vec<u8>>,
}

impl VirtualDevice {
    pub fn new(mtu: usize) -> Self {
        Self { mtu, rx_queue: VecDeque::new(), tx_queue: VecDeque::new() }
    }

    /// Queue a packet read from the tunnel fd (or re-injected by the SYN
    /// trap) for the interface to consume on its next `poll()`.
    pub fn enqueue_rx(&mut self, pkt: Vec<u8>) {
        self.rx_queue.push_back(pkt);
    }

    /// Drain packets the stack emitted for transmission, in order.
    pub fn drain_tx(&mut self) -> std::vec::Drain<'_, Vec<u8>> {
        self.tx_queue.drain(..)
    }

    /// Enqueue a packet built outside the socket layer (the DNS relay's
    /// synthesized UDP/IP replies) for transmission on the next drain,
    /// alongside whatever the stack itself emitted this iteration.
    pub fn push_tx(&mut self, pkt: Vec<u8>) {
        self.tx_queue.push_back(pkt);
    }
}

impl Device for VirtualDevice {
    type RxToken<'a> = RxToken;
    type TxToken<'a> = TxToken<'a>;

    fn receive(&mut self, _timestamp: SmolInstant) -> Option<(Self::RxToken<'_>, Self::TxToken<'_>)> {
        let pkt = self.rx_queue.pop_front()?;
        Some((RxToken { buffer: pkt }, TxToken { tx_queue: &mut self.tx_queue }))
    }

    fn transmit(&mut self, _timestamp: SmolInstant) -> Option<Self::TxToken<'_>> {
        Some(TxToken { tx_queue: &mut self.tx_queue })
    }

    fn capabilities(&self) -> DeviceCapabilities {
        let mut caps = DeviceCapabilities::default();
        caps.medium = Medium::Ip;
        caps.max_transmission_unit = self.mtu;
        caps
    }
}

pub struct RxToken {
    buffer: Vec<u8>,
}

impl smoltcp::phy::RxToken for RxToken {
    fn consume<R, F>(mut self, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        f(&mut self.buffer)
    }
}

pub struct TxToken<'a> {
    tx_queue: &'a mut VecDeque<Vec<u8>>,
}

impl<'a> smoltcp::phy::TxToken for TxToken<'a> {
    fn consume<R, F>(self, len: usize, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        let mut buffer = vec![0u8; len];
        let result = f(&mut buffer);
        self.tx_queue.push_back(buffer);
        result
    }
}
