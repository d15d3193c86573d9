//! SYN-trap and per-destination listening-socket pool.
//!
//! Vanilla `smoltcp` has no "pretend TCP" patch, so the redirect flag
//! described in the spec's NetStackAdapter contract is realized here: the
//! first SYN to a previously-unseen `(dst_ip, dst_port)` causes that
//! destination to be added to the interface's address list and a fresh
//! listening socket bound to that exact endpoint to be installed, then
//! the packet is re-fed to the interface so `smoltcp` completes the
//! accept on its own. Addresses are reference-counted so one is removed
//! only once neither a pooled listener nor a live flow still needs it.

use smoltcp::iface::{Interface, SocketHandle, SocketSet};
use smoltcp::socket::tcp;
use smoltcp::wire::{IpAddress, IpCidr, IpEndpoint, Ipv4Address};
use std::collections::HashMap;
use std::net::Ipv4Addr;

type Dest = (Ipv4Addr, u16);

pub struct ListenerPool {
    /// Destination -> the currently-listening socket waiting for a connect.
    pooled: HashMap<Dest, SocketHandle>,
    /// Reference count per address: 1 for the pooled listener (while one
    /// exists) plus 1 per live flow whose original destination is this
    /// address.
    addr_refcount: HashMap<Ipv4Addr, usize>,
    rx_buffer_size: usize,
    tx_buffer_size: usize,
}

impl ListenerPool {
    pub fn new(rx_buffer_size: usize, tx_buffer_size: usize) -> Self {
        Self {
            pooled: HashMap::new(),
            addr_refcount: HashMap::new(),
            rx_buffer_size,
            tx_buffer_size,
        }
    }

    /// Ensure a listening socket exists for `dest`, installing the
    /// interface address and a fresh `tcp::Socket` if this is the first
    /// SYN ever seen for it. Returns `true` if a new listener was created
    /// (the caller must re-feed the triggering SYN packet in that case).
    pub fn ensure_trapped(
        &mut self,
        iface: &mut Interface,
        sockets: &mut SocketSet<'static>,
        dest: Dest,
    ) -> bool {
        if self.pooled.contains_key(&dest) {
            return false;
        }
        self.add_address_ref(iface, dest.0);
        let handle = self.spawn_listener(sockets, dest);
        self.pooled.insert(dest, handle);
        true
    }

    /// Called once per engine iteration for every pooled listener that
    /// left the `Listen` state (i.e. accepted a connection): replenishes
    /// the pool so the next connection to the same destination is still
    /// caught, and returns the handle that was consumed so the caller can
    /// hand it off to a new `TcpFlow`.
    pub fn reap_accepted(
        &mut self,
        iface: &mut Interface,
        sockets: &mut SocketSet<'static>,
    ) -> Vec<(Dest, SocketHandle)> {
        let mut accepted = Vec::new();
        let consumed: Vec<Dest> = self
            .pooled
            .iter()
            .filter(|(_, handle)| {
                sockets.get::<tcp::Socket>(**handle).state() != tcp::State::Listen
            })
            .map(|(dest, _)| *dest)
            .collect();

        for dest in consumed {
            let handle = self.pooled.remove(&dest).expect("checked above");
            accepted.push((dest, handle));
            // Immediately replenish so a second connection to the same
            // destination is still trapped.
            self.add_address_ref(iface, dest.0);
            let fresh = self.spawn_listener(sockets, dest);
            self.pooled.insert(dest, fresh);
        }
        accepted
    }

    /// Release the address reference held on behalf of a flow whose
    /// `TcpFlow` has been destroyed.
    pub fn release_flow(&mut self, iface: &mut Interface, addr: Ipv4Addr) {
        self.release_address_ref(iface, addr);
    }

    fn spawn_listener(&self, sockets: &mut SocketSet<'static>, dest: Dest) -> SocketHandle {
        let rx_buffer = tcp::SocketBuffer::new(vec![0u8; self.rx_buffer_size]);
        let tx_buffer = tcp::SocketBuffer::new(vec![0u8; self.tx_buffer_size]);
        let mut socket = tcp::Socket::new(rx_buffer, tx_buffer);
        let endpoint = IpEndpoint::new(IpAddress::Ipv4(Ipv4Address::from_bytes(&dest.0.octets())), dest.1);
        socket
            .listen(endpoint)
            .expect("fresh socket can always enter Listen");
        sockets.add(socket)
    }

    fn add_address_ref(&mut self, iface: &mut Interface, addr: Ipv4Addr) {
        let count = self.addr_refcount.entry(addr).or_insert(0);
        if *count == 0 {
            let cidr = IpCidr::new(IpAddress::Ipv4(Ipv4Address::from_bytes(&addr.octets())), 32);
            iface.update_ip_addrs(|addrs| {
                if !addrs.contains(&cidr) {
                    let _ = addrs.push(cidr);
                }
            });
        }
        *count += 1;
    }

    fn release_address_ref(&mut self, iface: &mut Interface, addr: Ipv4Addr) {
        if let Some(count) = self.addr_refcount.get_mut(&addr) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.addr_refcount.remove(&addr);
                let cidr = IpCidr::new(IpAddress::Ipv4(Ipv4Address::from_bytes(&addr.octets())), 32);
                iface.update_ip_addrs(|addrs| {
                    let remaining: Vec<IpCidr> = addrs.iter().filter(|e| **e != cidr).cloned().collect();
                    addrs.clear();
                    for r in remaining {
                        let _ = addrs.push(r);
                    }
                });
            }
        }
    }
}
