use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use bytes::Bytes;
use hickory_proto::op::ResponseCode;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info};

use crate::config::ServerConfig;
use crate::mutation;
use crate::proto_utils;
use crate::upstream::{query_upstream, Reply, Upstream};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pool {
    Trusted,
    Untrusted,
}

/// One terminal upstream attempt delivered to the merge point.
struct Arrival {
    pool: Pool,
    upstream: SocketAddr,
    result: Result<Reply>,
}

/// Outcome of the acceptance rules for a single reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    /// Trusted reply that passed its filters; wins immediately.
    Accept,
    /// Untrusted candidate; parked until the trusted pool is exhausted.
    Hold,
    Discard(&'static str),
}

/// Fans one client query out to both pools and selects the winning reply.
///
/// One `handle` call produces exactly one reply packet: a substantive
/// answer, NXDOMAIN for blacklisted domains, or SERVFAIL.
pub struct Dispatcher {
    cfg: Arc<ServerConfig>,
    correlator: AtomicU16,
}

impl Dispatcher {
    pub fn new(cfg: Arc<ServerConfig>) -> Self {
        Self {
            cfg,
            correlator: AtomicU16::new(1),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.cfg
    }

    pub async fn handle(&self, packet: &[u8], peer: SocketAddr) -> Result<Bytes> {
        let started = Instant::now();
        let mut qname_buf = [0u8; 256];
        let Some(q) = proto_utils::parse_query(packet, &mut qname_buf) else {
            bail!("client query from {} did not parse", peer);
        };
        let client_id = q.tx_id;
        let qname = q.qname;

        if self.cfg.domain_blacklist.has_suffix(qname) {
            let reply =
                proto_utils::build_failure_reply(packet, ResponseCode::NXDomain, self.cfg.udp_max_size);
            info!(
                event = "dns_response",
                qname = %qname,
                client_ip = %peer.ip(),
                rcode = "NXDOMAIN",
                latency_ms = started.elapsed().as_millis() as u64,
                "blacklisted domain"
            );
            return Ok(reply);
        }

        let trusted_only = self.cfg.domain_polluted.has_suffix(qname);
        if trusted_only {
            debug!(qname = %qname, "polluted domain, untrusted pool suppressed");
        }

        // The wire carries a fresh correlator; the client's transaction ID
        // is restored on whatever reply wins.
        let correlator = self.correlator.fetch_add(1, Ordering::Relaxed);
        let mut outbound = packet.to_vec();
        proto_utils::set_id(&mut outbound, correlator);

        let mutated = if self.cfg.mutation {
            mutation::mutate_query(&outbound)
        } else {
            None
        };
        let used_mutation = mutated.is_some();
        let trusted_packet = Arc::new(mutated.unwrap_or_else(|| outbound.clone()));
        let untrusted_packet = Arc::new(outbound);

        let deadline = started + self.cfg.timeout;
        let attempt_count = self.cfg.trusted.len() + self.cfg.untrusted.len();
        let (tx, mut rx) = mpsc::channel::<Arrival>(attempt_count.max(1));
        let mut attempts: JoinSet<()> = JoinSet::new();

        for up in &self.cfg.trusted {
            spawn_attempt(
                &mut attempts,
                tx.clone(),
                Pool::Trusted,
                up.clone(),
                trusted_packet.clone(),
                Duration::ZERO,
                self.cfg.timeout,
                self.cfg.udp_max_size as usize,
            );
        }
        // A delay at or beyond the deadline means the untrusted round
        // trip could never land in time; skip it entirely.
        let fire_untrusted = !trusted_only && self.cfg.delay < self.cfg.timeout;
        if fire_untrusted {
            for up in &self.cfg.untrusted {
                spawn_attempt(
                    &mut attempts,
                    tx.clone(),
                    Pool::Untrusted,
                    up.clone(),
                    untrusted_packet.clone(),
                    self.cfg.delay,
                    self.cfg.timeout - self.cfg.delay,
                    self.cfg.udp_max_size as usize,
                );
            }
        }
        drop(tx);

        let mut trusted_pending = self.cfg.trusted.len();
        let mut held: Option<Bytes> = None;

        loop {
            tokio::select! {
                arrival = rx.recv() => {
                    let Some(arrival) = arrival else {
                        break; // every attempt reached a terminal state
                    };
                    if arrival.pool == Pool::Trusted {
                        trusted_pending -= 1;
                    }
                    match arrival.result {
                        Ok(reply) => {
                            let verdict = judge(arrival.pool, &reply.bytes, &self.cfg);
                            debug!(
                                event = "upstream_reply",
                                qname = %qname,
                                upstream = %arrival.upstream,
                                pool = ?arrival.pool,
                                proto = %reply.proto,
                                rtt_ms = reply.rtt.as_millis() as u64,
                                verdict = ?verdict,
                                "reply judged"
                            );
                            match verdict {
                                Verdict::Accept => {
                                    match finalize_trusted(reply.bytes, used_mutation, client_id) {
                                        Some(bytes) => {
                                            info!(
                                                event = "dns_response",
                                                qname = %qname,
                                                upstream = %arrival.upstream,
                                                pool = ?arrival.pool,
                                                rcode = proto_utils::response_code(&bytes).unwrap_or(0),
                                                latency_ms = started.elapsed().as_millis() as u64,
                                                client_ip = %peer.ip(),
                                                "trusted reply accepted"
                                            );
                                            return Ok(bytes);
                                        }
                                        None => {
                                            debug!(
                                                upstream = %arrival.upstream,
                                                "mutated reply failed lenient decode, dropped"
                                            );
                                        }
                                    }
                                }
                                Verdict::Hold => {
                                    if held.is_none() {
                                        held = Some(reply.bytes);
                                    }
                                }
                                Verdict::Discard(reason) => {
                                    debug!(
                                        qname = %qname,
                                        upstream = %arrival.upstream,
                                        pool = ?arrival.pool,
                                        reason = reason,
                                        "reply discarded"
                                    );
                                }
                            }
                        }
                        Err(err) => {
                            debug!(
                                event = "upstream_error",
                                qname = %qname,
                                upstream = %arrival.upstream,
                                pool = ?arrival.pool,
                                error = %format!("{err:#}"),
                                "attempt failed"
                            );
                        }
                    }
                    // An untrusted candidate may commit only once no
                    // trusted attempt could still beat it.
                    if trusted_pending == 0 {
                        if let Some(bytes) = held.take() {
                            return Ok(self.commit_untrusted(bytes, client_id, qname, peer, started));
                        }
                    }
                }
                _ = sleep_until(deadline) => {
                    if let Some(bytes) = held.take() {
                        return Ok(self.commit_untrusted(bytes, client_id, qname, peer, started));
                    }
                    info!(
                        event = "dns_response",
                        qname = %qname,
                        rcode = "SERVFAIL",
                        latency_ms = started.elapsed().as_millis() as u64,
                        client_ip = %peer.ip(),
                        "deadline expired with no acceptable reply"
                    );
                    return Ok(proto_utils::build_failure_reply(
                        packet,
                        ResponseCode::ServFail,
                        self.cfg.udp_max_size,
                    ));
                }
            }
        }

        if let Some(bytes) = held.take() {
            return Ok(self.commit_untrusted(bytes, client_id, qname, peer, started));
        }
        info!(
            event = "dns_response",
            qname = %qname,
            rcode = "SERVFAIL",
            latency_ms = started.elapsed().as_millis() as u64,
            client_ip = %peer.ip(),
            "no acceptable reply from either pool"
        );
        Ok(proto_utils::build_failure_reply(
            packet,
            ResponseCode::ServFail,
            self.cfg.udp_max_size,
        ))
    }

    fn commit_untrusted(
        &self,
        bytes: Bytes,
        client_id: u16,
        qname: &str,
        peer: SocketAddr,
        started: Instant,
    ) -> Bytes {
        let mut out = bytes.to_vec();
        proto_utils::set_id(&mut out, client_id);
        info!(
            event = "dns_response",
            qname = %qname,
            pool = ?Pool::Untrusted,
            rcode = proto_utils::response_code(&out).unwrap_or(0),
            latency_ms = started.elapsed().as_millis() as u64,
            client_ip = %peer.ip(),
            "untrusted candidate committed"
        );
        Bytes::from(out)
    }
}

#[allow(clippy::too_many_arguments)]
fn spawn_attempt(
    attempts: &mut JoinSet<()>,
    tx: mpsc::Sender<Arrival>,
    pool: Pool,
    up: Upstream,
    packet: Arc<Vec<u8>>,
    delay: Duration,
    timeout: Duration,
    udp_max_size: usize,
) {
    attempts.spawn(async move {
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let result = query_upstream(&up, &packet, timeout, udp_max_size).await;
        // The merge point may already be gone; late arrivals are dropped.
        let _ = tx
            .send(Arrival {
                pool,
                upstream: up.addr,
                result,
            })
            .await;
    });
}

fn finalize_trusted(bytes: Bytes, used_mutation: bool, client_id: u16) -> Option<Bytes> {
    if used_mutation {
        mutation::restore_reply(&bytes, client_id)
    } else {
        let mut out = bytes.to_vec();
        proto_utils::set_id(&mut out, client_id);
        Some(Bytes::from(out))
    }
}

/// The acceptance rules. Pure over the reply bytes and the matchers, so
/// every branch is unit-testable without sockets.
fn judge(pool: Pool, reply: &[u8], cfg: &ServerConfig) -> Verdict {
    let Some(ips) = proto_utils::answer_ips(reply) else {
        return Verdict::Discard("unparseable reply");
    };
    // With an IPv4-only route table, AAAA answers cannot be classified
    // and bypass the route tests.
    let route_v6 = cfg.china_route.has_v6();

    match pool {
        Pool::Trusted => {
            if !cfg.bidirectional {
                return Verdict::Accept;
            }
            let redirected = ips
                .iter()
                .filter(|ip| ip.is_ipv4() || route_v6)
                .any(|ip| cfg.china_route.contains(*ip));
            if redirected {
                Verdict::Discard("china ip from trusted pool")
            } else {
                Verdict::Accept
            }
        }
        Pool::Untrusted => {
            if ips.iter().any(|ip| cfg.ip_blacklist.contains(*ip)) {
                return Verdict::Discard("blacklisted ip");
            }
            let all_china = ips
                .iter()
                .filter(|ip| ip.is_ipv4() || route_v6)
                .all(|ip| cfg.china_route.contains(*ip));
            if all_china {
                Verdict::Hold
            } else {
                Verdict::Discard("non-china ip from untrusted pool")
            }
        }
    }
}
