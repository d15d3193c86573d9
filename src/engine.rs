//! The relay engine: the single-threaded reactor loop that ties the
//! tunnel, the embedded stack, per-flow SOCKS sockets, and the optional
//! DNS relay together.

use crate::config::EngineConfig;
use crate::dns::DnsRelay;
use crate::error::{Error, Result};
use crate::flow::{FlowId, TcpFlow};
use crate::netstack::{Classified, NetStackAdapter};
use crate::reactor::{EventToken, Reactor};
use crate::tunnel::Tunnel;
use mio::unix::SourceFd;
use mio::Interest;
use slotmap::SlotMap;
use std::collections::HashMap;
use std::net::SocketAddrV4;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

const TUNNEL_TOKEN: EventToken = EventToken(0);
const DNS_TOKEN: EventToken = EventToken(1);
const FIRST_FLOW_TOKEN: usize = 2;

/// One read from the tunnel fd is sized for the largest packet the
/// extended variant's DNS-carrying datagrams are expected to produce.
const READ_SCRATCH_LEN: usize = 65536;

/// A cheaply `Clone`-able handle that can signal the engine to stop from
/// any thread, including before `run` starts or after it returns.
#[derive(Clone)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn signal_stop(&self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

pub struct Engine {
    config: EngineConfig,
    tunnel: Tunnel,
    net: NetStackAdapter,
    reactor: Reactor,
    dns: Option<DnsRelay>,
    flows: SlotMap<FlowId, TcpFlow>,
    token_to_flow: HashMap<EventToken, FlowId>,
    flow_to_token: HashMap<FlowId, EventToken>,
    next_flow_token: usize,
    pending_removal: Vec<FlowId>,
    stop: Arc<AtomicBool>,
    next_tick_at: Instant,
}

impl Engine {
    pub fn new(config: EngineConfig, tunnel_fd: RawFd) -> Result<Self> {
        let mut tunnel = Tunnel::from_raw_fd(tunnel_fd)?;
        let net = NetStackAdapter::new(config.vpn_ip, config.vpn_netmask, READ_SCRATCH_LEN, config.flow_buffer_size)?;
        let mut reactor = Reactor::new(1024)?;

        reactor.add(&mut tunnel, Interest::READABLE, TUNNEL_TOKEN)?;

        let dns = match &config.dns {
            Some(dns_config) => {
                let mut relay = DnsRelay::new(dns_config)?;
                let fd = relay.fd();
                reactor.add(&mut SourceFd(&fd), Interest::READABLE, DNS_TOKEN)?;
                Some(relay)
            }
            None => None,
        };

        let tick_interval = config.tick_interval;
        Ok(Self {
            config,
            tunnel,
            net,
            reactor,
            dns,
            flows: SlotMap::with_key(),
            token_to_flow: HashMap::new(),
            flow_to_token: HashMap::new(),
            next_flow_token: FIRST_FLOW_TOKEN,
            pending_removal: Vec::new(),
            stop: Arc::new(AtomicBool::new(false)),
            next_tick_at: Instant::now() + tick_interval,
        })
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle(Arc::clone(&self.stop))
    }

    /// Blocking main loop. Returns once `stop` is set (via a `StopHandle`
    /// or a terminal tunnel condition) and every live flow has been torn
    /// down.
    pub fn run(mut self) -> Result<()> {
        info!("engine started");
        while !self.stop.load(Ordering::Relaxed) {
            let events = self.reactor.wait(self.config.tick_interval)?;

            if Instant::now() >= self.next_tick_at {
                self.next_tick_at += self.config.tick_interval;
                self.service_tick()?;
            }

            for event in events {
                if event.token == TUNNEL_TOKEN {
                    if event.error || event.hangup {
                        info!("tunnel closed, stopping");
                        self.stop.store(true, Ordering::Relaxed);
                        continue;
                    }
                    if event.readable {
                        if let Err(e) = self.drain_tunnel() {
                            error!(%e, "tunnel read failed, stopping");
                            self.stop.store(true, Ordering::Relaxed);
                        }
                    }
                } else if event.token == DNS_TOKEN && self.dns.is_some() {
                    if event.error || event.hangup {
                        warn!("dns relay socket error, disabling dns relay");
                        self.dns = None;
                        continue;
                    }
                    if event.readable {
                        self.poll_dns_replies();
                    }
                } else if let Some(&flow_id) = self.token_to_flow.get(&event.token) {
                    self.dispatch_flow_event(flow_id, event.readable, event.writable, event.error || event.hangup);
                }
            }

            self.flush_outbound()?;
            self.reap_dead_flows();
        }

        self.shutdown();
        info!("engine stopped");
        Ok(())
    }

    fn service_tick(&mut self) -> Result<()> {
        for (handle, dst_addr, dst_port) in self.net.tick() {
            self.accept_flow(handle, dst_addr, dst_port);
        }
        self.service_flows();
        if let Some(dns) = &mut self.dns {
            dns.sweep_timeouts();
        }
        self.flush_outbound()
    }

    /// Move data between each live flow and its stack endpoint: deliver
    /// newly-received guest bytes toward SOCKS, detect peer half-close,
    /// and resume a stalled `drain_to_stack` once the stack reports more
    /// send-buffer headroom.
    ///
    /// The stack's `recv` consume count is capped to the flow's remaining
    /// `socks_send_buf` room, never to the full chunk available: acking
    /// more than the flow can hold would reopen the guest's TCP window
    /// for bytes that then get dropped on a full buffer. Whatever doesn't
    /// fit stays in the stack's own rx buffer (window stays closed) and
    /// is retried next tick once `on_socks_writable` has drained room.
    fn service_flows(&mut self) {
        let flow_ids: Vec<FlowId> = self.flows.keys().collect();
        for flow_id in flow_ids {
            let Some((stack_handle, send_capacity)) =
                self.flows.get(flow_id).map(|f| (f.stack_handle, f.socks_send_capacity()))
            else {
                continue;
            };
            let socket = self.net.socket_mut(stack_handle);

            let payload = if socket.can_recv() && send_capacity > 0 {
                socket
                    .recv(|data| {
                        let n = data.len().min(send_capacity);
                        (n, data[..n].to_vec())
                    })
                    .ok()
            } else {
                None
            };
            let peer_closed = !socket.may_recv() && !socket.can_recv();
            let can_send_more = socket.can_send();

            let Some(flow) = self.flows.get_mut(flow_id) else { continue };
            let mut fail = false;

            if let Some(data) = payload {
                if let Err(e) = flow.on_stack_recv(Some(&data)) {
                    debug!(%e, "flow stack-recv failed");
                    fail = true;
                } else if !flow.has_pending_socks_write() {
                    if let Err(e) = flow.on_socks_writable() {
                        debug!(%e, "flow socks write failed");
                        fail = true;
                    }
                }
            }

            if peer_closed && !fail {
                if self.config.flush_on_half_close {
                    let _ = flow.on_socks_writable();
                }
                fail = true;
            }

            if can_send_more && !fail {
                let stack_socket = self.net.socket_mut(stack_handle);
                if let Err(e) = flow.on_stack_sent(stack_socket) {
                    debug!(%e, "flow stack-sent drain failed");
                    fail = true;
                }
            }

            if fail {
                self.pending_removal.push(flow_id);
            }
        }
    }

    fn accept_flow(&mut self, stack_handle: smoltcp::iface::SocketHandle, dst_addr: std::net::Ipv4Addr, dst_port: u16) {
        let original_dst = SocketAddrV4::new(dst_addr, dst_port);
        let socks_addr = SocketAddrV4::new(self.config.socks.addr, self.config.socks.port);

        match TcpFlow::new(stack_handle, original_dst, socks_addr, self.config.flow_buffer_size) {
            Ok(flow) => {
                let token = EventToken(self.next_flow_token);
                self.next_flow_token += 1;
                let fd = flow.socks_fd();
                let flow_id = self.flows.insert(flow);

                if let Err(e) = self.reactor.add(&mut SourceFd(&fd), Interest::READABLE | Interest::WRITABLE, token) {
                    warn!(%e, "failed to register flow socket, dropping connection");
                    self.flows.remove(flow_id);
                    self.net.remove_socket(stack_handle);
                    self.net.release_flow_address(dst_addr);
                    return;
                }

                self.token_to_flow.insert(token, flow_id);
                self.flow_to_token.insert(flow_id, token);
                info!(%original_dst, "flow created");
            }
            Err(e) => {
                warn!(%e, "flow setup failed, dropping connection");
                self.net.remove_socket(stack_handle);
                self.net.release_flow_address(dst_addr);
            }
        }
    }

    fn dispatch_flow_event(&mut self, flow_id: FlowId, readable: bool, writable: bool, terminal: bool) {
        if terminal {
            self.flush_half_close(flow_id);
            self.pending_removal.push(flow_id);
            return;
        }

        let mut failed = false;
        if writable {
            if let Some(flow) = self.flows.get_mut(flow_id) {
                if let Err(e) = flow.on_socks_writable() {
                    debug!(%e, "flow socks write failed");
                    failed = true;
                }
            }
        }
        if !failed && readable {
            if let Some(flow) = self.flows.get_mut(flow_id) {
                let stack_handle = flow.stack_handle;
                let stack_socket = self.net.socket_mut(stack_handle);
                if let Err(e) = flow.on_socks_readable(stack_socket) {
                    debug!(%e, "flow socks read failed");
                    failed = true;
                }
            }
        }
        if failed {
            self.flush_half_close(flow_id);
            self.pending_removal.push(flow_id);
        }
    }

    /// On a SOCKS-side close (hangup, error, or a read reporting the peer
    /// closed), push whatever already landed in `socks_recv_buf` on to the
    /// stack before the flow is torn down, the same policy `service_flows`
    /// applies on a stack-side half-close. A no-op unless configured.
    fn flush_half_close(&mut self, flow_id: FlowId) {
        if !self.config.flush_on_half_close {
            return;
        }
        let Some(flow) = self.flows.get_mut(flow_id) else { return };
        let stack_handle = flow.stack_handle;
        let stack_socket = self.net.socket_mut(stack_handle);
        let _ = flow.on_stack_sent(stack_socket);
    }

    /// Read every available packet from the tunnel (one syscall = one
    /// packet), routing TCP to the stack and DNS queries to the relay.
    fn drain_tunnel(&mut self) -> Result<()> {
        let mut scratch = vec![0u8; READ_SCRATCH_LEN];
        loop {
            let n = match self.tunnel.read_packet(&mut scratch) {
                Ok(0) => {
                    self.stop.store(true, Ordering::Relaxed);
                    return Ok(());
                }
                Ok(n) => n,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(Error::Io { source: e }),
            };
            let pkt = scratch[..n].to_vec();

            match self.net.input(pkt) {
                Ok(Classified::Tcp) => {}
                Ok(Classified::DnsQuery { src, payload, .. }) => {
                    if let Some(dns) = &mut self.dns {
                        if let Err(e) = dns.handle_outbound_query(src, &payload) {
                            warn!(%e, "dns query forwarding failed");
                        }
                    }
                }
                Ok(Classified::Other) => {}
                Err(e) => debug!(%e, "stack rejected inbound packet, continuing"),
            }
        }
    }

    fn poll_dns_replies(&mut self) {
        let Some(dns) = &mut self.dns else { return };
        let replies = match dns.poll_replies() {
            Ok(replies) => replies,
            Err(e) => {
                warn!(%e, "dns relay read failed");
                return;
            }
        };
        let resolver = dns.resolver_addr();
        for (requestor, payload) in replies {
            if let Err(e) = self.net.inject_udp(resolver, requestor, &payload) {
                warn!(%e, "failed to inject dns reply into guest network");
            }
        }
    }

    fn flush_outbound(&mut self) -> Result<()> {
        for pkt in self.net.drain_outbound() {
            if let Err(e) = self.tunnel.write_packet(&pkt) {
                debug!(%e, "dropping outbound packet, tunnel write failed");
            }
        }
        Ok(())
    }

    /// Destroy every flow marked for removal this iteration. Must only
    /// run after the event batch and tick have been fully dispatched, so
    /// a re-entrant accept or error from inside a callback never
    /// invalidates the iteration in progress.
    fn reap_dead_flows(&mut self) {
        for flow_id in self.pending_removal.drain(..) {
            self.destroy_flow(flow_id);
        }
    }

    fn destroy_flow(&mut self, flow_id: FlowId) {
        let Some(mut flow) = self.flows.remove(flow_id) else { return };
        flow.mark_dead();

        if let Some(token) = self.flow_to_token.remove(&flow_id) {
            self.token_to_flow.remove(&token);
        }
        let fd = flow.socks_fd();
        let _ = self.reactor.remove(&mut SourceFd(&fd));
        self.net.socket_mut(flow.stack_handle).abort();
        self.net.remove_socket(flow.stack_handle);
        self.net.release_flow_address(flow.original_dst_ip());
        info!(original_dst = %flow.original_dst, "flow destroyed");
    }

    fn shutdown(&mut self) {
        let flow_ids: Vec<FlowId> = self.flows.keys().collect();
        for flow_id in flow_ids {
            self.destroy_flow(flow_id);
        }
    }
}
