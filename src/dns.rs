//! UDP DNS relay (extended variant).
//!
//! A single non-blocking UDP socket connects to the configured resolver.
//! Outbound queries are forwarded verbatim; replies are matched back to
//! their requestor by `(src_ip, src_port, txn_id)` and handed to the
//! `NetStackAdapter` for delivery to the guest as a synthesized UDP/IP
//! packet. Entries that never get a reply are evicted on a timeout
//! sweep rather than retried — the guest's own resolver owns retries.

use crate::config::DnsConfig;
use crate::error::{Error, Result};
use bytes::BytesMut;
use socket2::{Domain, Protocol, Socket as RawSocket, Type};
use std::collections::HashMap;
use std::io::{ErrorKind, Read, Write};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::{Duration, Instant};
use tracing::debug;

type QueryKey = (Ipv4Addr, u16, u16);

pub struct PendingQuery {
    pub requestor: SocketAddrV4,
    pub deadline: Instant,
}

pub struct DnsRelay {
    socket: RawSocket,
    resolver: SocketAddrV4,
    pending: HashMap<QueryKey, PendingQuery>,
    /// Secondary index for demuxing a resolver reply (which carries only a
    /// transaction id, the connected socket already fixing the peer) back
    /// to the full `(src_ip, src_port, txn_id)` key.
    by_txn_id: HashMap<u16, QueryKey>,
    max_pending: usize,
    timeout: Duration,
}

impl DnsRelay {
    pub fn new(config: &DnsConfig) -> Result<Self> {
        let resolver = SocketAddrV4::new(config.addr, config.port);
        let socket = RawSocket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .map_err(|e| Error::init(format!("dns socket failed: {e}")))?;
        socket
            .set_nonblocking(true)
            .map_err(|e| Error::init(format!("dns set_nonblocking failed: {e}")))?;
        socket
            .connect(&socket2::SockAddr::from(SocketAddr::V4(resolver)))
            .map_err(|e| Error::init(format!("dns connect failed: {e}")))?;

        Ok(Self {
            socket,
            resolver,
            pending: HashMap::new(),
            by_txn_id: HashMap::new(),
            max_pending: config.max_pending_queries,
            timeout: config.query_timeout,
        })
    }

    pub fn fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }

    /// A guest datagram destined to port 53 arrived. Parses the
    /// transaction id from the header, records a pending-query entry,
    /// and forwards the payload verbatim to the resolver.
    pub fn handle_outbound_query(&mut self, src: SocketAddrV4, payload: &[u8]) -> Result<()> {
        let Some(txn_id) = transaction_id(payload) else {
            return Ok(());
        };
        if self.pending.len() >= self.max_pending {
            debug!(%src, "dns pending-query table full, dropping query");
            return Ok(());
        }

        let key = (*src.ip(), src.port(), txn_id);
        self.pending.insert(
            key,
            PendingQuery { requestor: src, deadline: Instant::now() + self.timeout },
        );
        self.by_txn_id.insert(txn_id, key);

        match self.socket.write(payload) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                self.pending.remove(&key);
                self.by_txn_id.remove(&txn_id);
                Ok(())
            }
            Err(e) => Err(Error::dns(format!("resolver write failed: {e}"))),
        }
    }

    /// Drain available datagrams from the resolver socket, returning
    /// `(requestor, reply_payload)` pairs ready to inject into the guest
    /// network. Unmatched replies are dropped.
    pub fn poll_replies(&mut self) -> Result<Vec<(SocketAddrV4, Vec<u8>)>> {
        let mut out = Vec::new();
        let mut scratch = BytesMut::zeroed(65535);
        loop {
            match self.socket.read(&mut scratch) {
                Ok(0) => break,
                Ok(n) => {
                    let payload = scratch.split_to(n).freeze();
                    scratch.resize(65535, 0);
                    let Some(txn_id) = transaction_id(&payload) else { continue };
                    match self.by_txn_id.remove(&txn_id).and_then(|key| self.pending.remove(&key).map(|p| (key, p))) {
                        Some((_, pending)) => out.push((pending.requestor, payload.to_vec())),
                        None => debug!(txn_id, "dns reply matched no pending query"),
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => return Err(Error::dns(format!("resolver read failed: {e}"))),
            }
        }
        Ok(out)
    }

    /// Evict entries whose deadline has passed. Called once per engine tick.
    pub fn sweep_timeouts(&mut self) {
        let now = Instant::now();
        let expired: Vec<QueryKey> = self
            .pending
            .iter()
            .filter(|(_, q)| q.deadline <= now)
            .map(|(key, _)| *key)
            .collect();
        for key in &expired {
            self.pending.remove(key);
            self.by_txn_id.remove(&key.2);
        }
        if !expired.is_empty() {
            debug!(evicted = expired.len(), "dns queries timed out");
        }
    }

    pub fn resolver_addr(&self) -> SocketAddrV4 {
        self.resolver
    }
}

/// DNS header: ID is the first 2 bytes, big-endian.
fn transaction_id(payload: &[u8]) -> Option<u16> {
    if payload.len() < 2 {
        return None;
    }
    Some(u16::from_be_bytes([payload[0], payload[1]]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    #[test]
    fn transaction_id_reads_the_first_two_bytes() {
        let payload = [0x12, 0x34, 0x01, 0x00];
        assert_eq!(transaction_id(&payload), Some(0x1234));
    }

    #[test]
    fn transaction_id_rejects_short_payloads() {
        assert_eq!(transaction_id(&[0x01]), None);
    }

    #[test]
    fn txn_id_index_resolves_back_to_the_requestor_key() {
        let mut pending: HashMap<QueryKey, PendingQuery> = HashMap::new();
        let mut by_txn_id: HashMap<u16, QueryKey> = HashMap::new();
        let requestor = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), 51234);
        let key = (*requestor.ip(), requestor.port(), 0x1234);
        pending.insert(key, PendingQuery { requestor, deadline: Instant::now() + Duration::from_secs(5) });
        by_txn_id.insert(0x1234, key);

        let resolved = by_txn_id.get(&0x1234).and_then(|k| pending.get(k));
        assert_eq!(resolved.unwrap().requestor, requestor);
    }

    proptest! {
        /// For any batch of concurrently in-flight queries with distinct
        /// transaction ids, a reply carrying one of those ids always
        /// demuxes back to the requestor that sent it, not some other
        /// guest socket sharing the same resolver connection.
        #[test]
        fn distinct_txn_ids_always_resolve_to_their_own_requestor(
            requestors in prop::collection::vec(
                (any::<u8>(), any::<u8>(), any::<u8>(), any::<u8>(), any::<u16>()),
                1..32,
            ),
            txn_ids in prop::collection::hash_set(any::<u16>(), 1..32),
        ) {
            let txn_ids: Vec<u16> = txn_ids.into_iter().collect();
            prop_assume!(requestors.len() <= txn_ids.len());

            let mut pending: HashMap<QueryKey, PendingQuery> = HashMap::new();
            let mut by_txn_id: HashMap<u16, QueryKey> = HashMap::new();
            let mut expected: HashMap<u16, SocketAddrV4> = HashMap::new();
            let mut seen_keys: HashSet<QueryKey> = HashSet::new();

            for (i, (a, b, c, d, port)) in requestors.iter().enumerate() {
                let requestor = SocketAddrV4::new(Ipv4Addr::new(*a, *b, *c, *d), *port);
                let txn_id = txn_ids[i];
                let key = (*requestor.ip(), requestor.port(), txn_id);
                prop_assume!(seen_keys.insert(key));

                pending.insert(key, PendingQuery { requestor, deadline: Instant::now() + Duration::from_secs(5) });
                by_txn_id.insert(txn_id, key);
                expected.insert(txn_id, requestor);
            }

            for (txn_id, requestor) in &expected {
                let resolved = by_txn_id.get(txn_id).and_then(|k| pending.get(k));
                prop_assert_eq!(resolved.unwrap().requestor, *requestor);
            }
        }
    }
}
