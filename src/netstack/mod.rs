//! Binds the embedded TCP/IP stack (`smoltcp`) to a virtual interface,
//! routes raw IP bytes in and out, installs the redirect-flag emulation
//! (`trap`), and exposes the `input`/`tick`/`inject_udp` contract the
//! engine drives.

mod device;
mod trap;

pub use device::VirtualDevice;

use crate::error::Result;
use smoltcp::iface::{Config, Interface, SocketHandle, SocketSet};
use smoltcp::socket::tcp;
use smoltcp::time::Instant as SmolInstant;
use smoltcp::wire::{
    HardwareAddress, IpAddress, IpCidr, IpProtocol, Ipv4Address, Ipv4Packet, Ipv4Repr, TcpPacket,
    UdpPacket, UdpRepr,
};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Instant as StdInstant;
use trap::ListenerPool;

/// What an inbound raw IP packet from the tunnel turned out to be.
pub enum Classified {
    /// TCP destined somewhere; handed to the stack.
    Tcp,
    /// UDP destined to port 53; the caller should route the payload to the
    /// DNS relay.
    DnsQuery { src: SocketAddrV4, dst: SocketAddrV4, payload: Vec<u8> },
    /// Anything else; silently dropped.
    Other,
}

pub struct NetStackAdapter {
    iface: Interface,
    device: VirtualDevice,
    sockets: SocketSet<'static>,
    pool: ListenerPool,
    flow_rx_buffer: usize,
    flow_tx_buffer: usize,
    start: StdInstant,
}

impl NetStackAdapter {
    pub fn new(vpn_ip: Ipv4Addr, vpn_netmask: Ipv4Addr, mtu: usize, flow_buffer_size: usize) -> Result<Self> {
        let mut device = VirtualDevice::new(mtu);
        let config = Config::new(HardwareAddress::Ip);
        let start = StdInstant::now();
        let mut iface = Interface::new(config, &mut device, smol_now(start));

        let prefix_len = netmask_to_prefix_len(vpn_netmask);
        iface.update_ip_addrs(|addrs| {
            let _ = addrs.push(IpCidr::new(IpAddress::Ipv4(Ipv4Address::from_bytes(&vpn_ip.octets())), prefix_len));
        });

        Ok(Self {
            iface,
            device,
            sockets: SocketSet::new(vec![]),
            pool: ListenerPool::new(flow_buffer_size, flow_buffer_size),
            flow_rx_buffer: flow_buffer_size,
            flow_tx_buffer: flow_buffer_size,
            start,
        })
    }

    /// Classify and, for TCP, admit a raw IP packet read from the tunnel.
    /// Installs a trap listener on first sight of a new destination and
    /// re-feeds the triggering packet so the stack completes the accept.
    pub fn input(&mut self, pkt: Vec<u8>) -> Result<Classified> {
        match classify(&pkt) {
            Classified::Tcp => {
                if let Some((dst_addr, dst_port)) = syn_destination(&pkt) {
                    if self.pool.ensure_trapped(&mut self.iface, &mut self.sockets, (dst_addr, dst_port)) {
                        self.device.enqueue_rx(pkt);
                        return Ok(Classified::Tcp);
                    }
                }
                self.device.enqueue_rx(pkt);
                Ok(Classified::Tcp)
            }
            other => Ok(other),
        }
    }

    /// Service the stack's internal timers and socket state machine.
    /// Returns newly-accepted connections (handle plus pre-redirect
    /// destination) for the engine to wrap in a fresh `TcpFlow`.
    pub fn tick(&mut self) -> Vec<(SocketHandle, Ipv4Addr, u16)> {
        let now = smol_now(self.start);
        self.iface.poll(now, &mut self.device, &mut self.sockets);

        self.pool
            .reap_accepted(&mut self.iface, &mut self.sockets)
            .into_iter()
            .map(|((addr, port), handle)| (handle, addr, port))
            .collect()
    }

    pub fn socket_mut(&mut self, handle: SocketHandle) -> &mut tcp::Socket<'static> {
        self.sockets.get_mut::<tcp::Socket>(handle)
    }

    pub fn remove_socket(&mut self, handle: SocketHandle) {
        self.sockets.remove(handle);
    }

    pub fn release_flow_address(&mut self, addr: Ipv4Addr) {
        self.pool.release_flow(&mut self.iface, addr);
    }

    /// Drain IP packets the stack (or the DNS relay) queued for the
    /// tunnel, one complete packet per entry (P5).
    pub fn drain_outbound(&mut self) -> Vec<Vec<u8>> {
        self.device.drain_tx().collect()
    }

    /// Build a UDP/IP packet carrying `payload` from `src` to `dst` and
    /// queue it for delivery to the guest via the tunnel, used by the DNS
    /// relay to hand back a resolver's reply.
    pub fn inject_udp(&mut self, src: SocketAddrV4, dst: SocketAddrV4, payload: &[u8]) -> Result<()> {
        let udp_repr = UdpRepr { src_port: src.port(), dst_port: dst.port() };
        let ip_repr = Ipv4Repr {
            src_addr: Ipv4Address::from_bytes(&src.ip().octets()),
            dst_addr: Ipv4Address::from_bytes(&dst.ip().octets()),
            next_header: IpProtocol::Udp,
            payload_len: udp_repr.header_len() + payload.len(),
            hop_limit: 64,
        };

        let mut buf = vec![0u8; ip_repr.buffer_len() + udp_repr.header_len() + payload.len()];
        let mut ip_packet = Ipv4Packet::new_unchecked(&mut buf);
        ip_repr.emit(&mut ip_packet, &smoltcp::phy::ChecksumCapabilities::default());

        let mut udp_packet = UdpPacket::new_unchecked(ip_packet.payload_mut());
        udp_repr.emit(
            &mut udp_packet,
            &IpAddress::Ipv4(ip_repr.src_addr),
            &IpAddress::Ipv4(ip_repr.dst_addr),
            payload.len(),
            |data| data.copy_from_slice(payload),
            &smoltcp::phy::ChecksumCapabilities::default(),
        );

        self.device.push_tx(buf);
        Ok(())
    }

    pub fn flow_buffers(&self) -> (usize, usize) {
        (self.flow_rx_buffer, self.flow_tx_buffer)
    }
}

fn smol_now(start: StdInstant) -> SmolInstant {
    SmolInstant::from_micros(start.elapsed().as_micros() as i64)
}

fn classify(pkt: &[u8]) -> Classified {
    let Ok(ip) = Ipv4Packet::new_checked(pkt) else { return Classified::Other };
    match ip.next_header() {
        IpProtocol::Tcp => Classified::Tcp,
        IpProtocol::Udp => {
            let Ok(udp) = UdpPacket::new_checked(ip.payload()) else { return Classified::Other };
            if udp.dst_port() == 53 {
                let src = SocketAddrV4::new(ipv4_to_std(ip.src_addr()), udp.src_port());
                let dst = SocketAddrV4::new(ipv4_to_std(ip.dst_addr()), udp.dst_port());
                Classified::DnsQuery { src, dst, payload: udp.payload().to_vec() }
            } else {
                Classified::Other
            }
        }
        _ => Classified::Other,
    }
}

fn syn_destination(pkt: &[u8]) -> Option<(Ipv4Addr, u16)> {
    let ip = Ipv4Packet::new_checked(pkt).ok()?;
    if ip.next_header() != IpProtocol::Tcp {
        return None;
    }
    let tcp = TcpPacket::new_checked(ip.payload()).ok()?;
    if !tcp.syn() || tcp.ack() {
        return None;
    }
    Some((ipv4_to_std(ip.dst_addr()), tcp.dst_port()))
}

fn ipv4_to_std(addr: Ipv4Address) -> Ipv4Addr {
    let o = addr.octets();
    Ipv4Addr::new(o[0], o[1], o[2], o[3])
}

fn netmask_to_prefix_len(mask: Ipv4Addr) -> u8 {
    u32::from_be_bytes(mask.octets()).count_ones() as u8
}

impl std::fmt::Debug for NetStackAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetStackAdapter").finish_non_exhaustive()
    }
}
