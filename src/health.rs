use std::str::FromStr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use anyhow::{bail, Result};
use hickory_proto::op::{Message, MessageType, Query};
use hickory_proto::rr::{DNSClass, Name, RecordType};
use hickory_proto::serialize::binary::BinEncodable;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::config::ServerConfig;
use crate::proto_utils;
use crate::upstream::{query_upstream, Upstream};

static PROBE_ID: AtomicU16 = AtomicU16::new(0x5D00);

fn build_probe(domain: &str) -> Result<Vec<u8>> {
    let mut msg = Message::new();
    msg.set_id(PROBE_ID.fetch_add(1, Ordering::Relaxed));
    msg.set_message_type(MessageType::Query);
    msg.set_recursion_desired(true);
    let mut q = Query::new();
    q.set_name(Name::from_str(domain)?);
    q.set_query_type(RecordType::A);
    q.set_query_class(DNSClass::IN);
    msg.add_query(q);
    Ok(msg.to_bytes()?)
}

/// Resolve every canary domain through every upstream and drop upstreams
/// that fail all of them. Runs once before the listeners come up; an
/// upstream removed here stays removed for the process lifetime.
pub async fn prune_pools(cfg: &mut ServerConfig) -> Result<()> {
    if cfg.test_domains.is_empty() {
        return Ok(());
    }
    let timeout = cfg.timeout;
    let udp_max = cfg.udp_max_size as usize;
    let domains = cfg.test_domains.clone();

    let trusted = std::mem::take(&mut cfg.trusted);
    let untrusted = std::mem::take(&mut cfg.untrusted);
    cfg.trusted = check_pool(trusted, &domains, timeout, udp_max, "trusted").await;
    cfg.untrusted = check_pool(untrusted, &domains, timeout, udp_max, "untrusted").await;

    if cfg.trusted.is_empty() && cfg.untrusted.is_empty() {
        bail!("health check left no usable upstream");
    }
    if cfg.trusted.is_empty() {
        warn!("trusted pool is empty after health check");
    }
    Ok(())
}

async fn check_pool(
    pool: Vec<Upstream>,
    domains: &[String],
    timeout: Duration,
    udp_max: usize,
    label: &'static str,
) -> Vec<Upstream> {
    let mut probes: JoinSet<(usize, Upstream, bool)> = JoinSet::new();
    for (idx, up) in pool.into_iter().enumerate() {
        let domains = domains.to_vec();
        probes.spawn(async move {
            for domain in &domains {
                let probe = match build_probe(domain) {
                    Ok(p) => p,
                    Err(err) => {
                        warn!(domain = %domain, error = %err, "unusable test domain");
                        continue;
                    }
                };
                match query_upstream(&up, &probe, timeout, udp_max).await {
                    Ok(reply) if proto_utils::is_response(&reply.bytes) => {
                        debug!(
                            upstream = %up,
                            pool = label,
                            domain = %domain,
                            rtt_ms = reply.rtt.as_millis() as u64,
                            "health probe ok"
                        );
                        return (idx, up, true);
                    }
                    Ok(_) => {}
                    Err(err) => {
                        debug!(
                            upstream = %up,
                            pool = label,
                            domain = %domain,
                            error = %format!("{err:#}"),
                            "health probe failed"
                        );
                    }
                }
            }
            (idx, up, false)
        });
    }

    let mut alive = Vec::new();
    while let Some(joined) = probes.join_next().await {
        match joined {
            Ok((idx, up, true)) => alive.push((idx, up)),
            Ok((_, up, false)) => {
                warn!(upstream = %up, pool = label, "failed all test domains, removed from pool");
            }
            Err(err) => warn!(error = %err, "health probe task failed"),
        }
    }
    // Preserve the configured order.
    alive.sort_by_key(|(idx, _)| *idx);
    alive.into_iter().map(|(_, up)| up).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RawConfig;
    use crate::upstream::Proto;
    use std::net::SocketAddr;
    use tokio::net::UdpSocket;

    async fn spawn_echo_upstream() -> SocketAddr {
        let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = sock.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            while let Ok((n, peer)) = sock.recv_from(&mut buf).await {
                let mut resp = buf[..n].to_vec();
                resp[2] |= 0x80;
                let _ = sock.send_to(&resp, peer).await;
            }
        });
        addr
    }

    fn config_with(trusted: Vec<Upstream>, untrusted: Vec<Upstream>) -> ServerConfig {
        let mut cfg = ServerConfig::build(RawConfig {
            servers: vec!["192.0.2.1".to_string()], // placeholder, replaced below
            timeout_ms: Some(200),
            ..RawConfig::default()
        })
        .unwrap();
        cfg.trusted = trusted;
        cfg.untrusted = untrusted;
        cfg
    }

    fn udp_up(addr: SocketAddr) -> Upstream {
        Upstream {
            addr,
            protos: vec![Proto::Udp],
        }
    }

    #[tokio::test]
    async fn dead_upstreams_are_pruned_live_ones_stay() {
        let live = spawn_echo_upstream().await;
        let dead = {
            let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
            sock.local_addr().unwrap()
        };
        let mut cfg = config_with(vec![udp_up(live), udp_up(dead)], Vec::new());
        prune_pools(&mut cfg).await.expect("one upstream survives");
        assert_eq!(cfg.trusted.len(), 1);
        assert_eq!(cfg.trusted[0].addr, live);
    }

    #[tokio::test]
    async fn startup_fails_when_nothing_survives() {
        let dead = {
            let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
            sock.local_addr().unwrap()
        };
        let mut cfg = config_with(vec![udp_up(dead)], Vec::new());
        let err = prune_pools(&mut cfg).await.expect_err("all dead");
        assert!(format!("{err:#}").contains("no usable upstream"));
    }

    #[tokio::test]
    async fn empty_test_domains_skip_the_check() {
        let dead = {
            let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
            sock.local_addr().unwrap()
        };
        let mut cfg = config_with(vec![udp_up(dead)], Vec::new());
        cfg.test_domains.clear();
        prune_pools(&mut cfg).await.expect("check skipped");
        assert_eq!(cfg.trusted.len(), 1);
    }
}
