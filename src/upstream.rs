use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::{timeout, Instant};

use crate::proto_utils::{self, HEADER_LEN};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Proto {
    Udp,
    Tcp,
}

impl fmt::Display for Proto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Proto::Udp => f.write_str("udp"),
            Proto::Tcp => f.write_str("tcp"),
        }
    }
}

/// One upstream resolver: an address plus the ordered list of transports
/// to attempt against it. Equality is by address only; protocol lists are
/// coalesced at configuration time.
#[derive(Debug, Clone)]
pub struct Upstream {
    pub addr: SocketAddr,
    pub protos: Vec<Proto>,
}

impl Upstream {
    /// Parse an upstream schema: `[proto+]*address[:port]` with protocols
    /// in order of attempt. Defaults: `udp+tcp`, port 53.
    pub fn parse(schema: &str) -> Result<Self> {
        let mut protos = Vec::new();
        let mut rest = schema.trim();
        loop {
            if let Some(r) = rest.strip_prefix("udp+") {
                if !protos.contains(&Proto::Udp) {
                    protos.push(Proto::Udp);
                }
                rest = r;
            } else if let Some(r) = rest.strip_prefix("tcp+") {
                if !protos.contains(&Proto::Tcp) {
                    protos.push(Proto::Tcp);
                }
                rest = r;
            } else {
                break;
            }
        }
        if protos.is_empty() {
            protos = vec![Proto::Udp, Proto::Tcp];
        }

        let addr = if let Ok(sa) = rest.parse::<SocketAddr>() {
            sa
        } else if let Ok(ip) = rest.parse::<IpAddr>() {
            SocketAddr::new(ip, 53)
        } else {
            bail!("bad upstream schema {:?}: address must be ip[:port]", schema);
        };

        Ok(Self { addr, protos })
    }
}

impl fmt::Display for Upstream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for p in &self.protos {
            write!(f, "{}+", p)?;
        }
        write!(f, "{}", self.addr)
    }
}

/// A raw reply from one upstream attempt.
#[derive(Debug, Clone)]
pub struct Reply {
    pub bytes: Bytes,
    pub proto: Proto,
    pub rtt: Duration,
    pub truncated: bool,
}

/// Send one query to one upstream, walking its protocol list top to
/// bottom within a single time budget.
///
/// A UDP reply flagged TC=1 (or a datagram that overran `udp_max_size` on
/// read) retries over TCP when TCP is listed for this upstream; if the TCP
/// retry fails the truncated reply is returned so the client can fall back
/// itself.
pub async fn query_upstream(
    up: &Upstream,
    packet: &[u8],
    total_timeout: Duration,
    udp_max_size: usize,
) -> Result<Reply> {
    let start = Instant::now();
    let mut truncated_fallback: Option<Reply> = None;
    let mut last_err: Option<anyhow::Error> = None;

    for &proto in &up.protos {
        let elapsed = start.elapsed();
        if elapsed >= total_timeout {
            break;
        }
        let remaining = total_timeout - elapsed;

        match proto {
            Proto::Udp => match query_udp(up.addr, packet, remaining, udp_max_size).await {
                Ok(reply) => {
                    if reply.truncated && up.protos.contains(&Proto::Tcp) {
                        truncated_fallback = Some(reply);
                        continue;
                    }
                    return Ok(reply);
                }
                Err(err) => last_err = Some(err),
            },
            Proto::Tcp => match query_tcp(up.addr, packet, remaining).await {
                Ok(reply) => return Ok(reply),
                Err(err) => last_err = Some(err),
            },
        }
    }

    if let Some(reply) = truncated_fallback {
        return Ok(reply);
    }
    match last_err {
        Some(err) => Err(err.context(format!("upstream {} failed", up.addr))),
        None => bail!("upstream {} timed out", up.addr),
    }
}

async fn query_udp(
    addr: SocketAddr,
    packet: &[u8],
    timeout_dur: Duration,
    udp_max_size: usize,
) -> Result<Reply> {
    let start = Instant::now();
    let bind_addr: SocketAddr = if addr.is_ipv4() {
        "0.0.0.0:0".parse().context("udp bind addr")?
    } else {
        "[::]:0".parse().context("udp bind addr")?
    };
    let sock = UdpSocket::bind(bind_addr).await.context("udp bind")?;
    sock.connect(addr).await.context("udp connect")?;
    sock.send(packet).await.context("udp send")?;

    // One extra byte so an exact-size datagram is distinguishable from an
    // oversized one.
    let mut buf = vec![0u8; udp_max_size + 1];
    let want_id = proto_utils::tx_id(packet);
    let recv = timeout(timeout_dur, async {
        loop {
            let n = sock.recv(&mut buf).await.context("udp recv")?;
            if proto_utils::tx_id(&buf[..n]) == want_id && proto_utils::is_response(&buf[..n]) {
                return Ok::<usize, anyhow::Error>(n);
            }
            // Stray datagram on our ephemeral port; keep waiting.
        }
    })
    .await;

    match recv {
        Ok(Ok(n)) => {
            let oversized = n > udp_max_size;
            let take = n.min(udp_max_size);
            let mut bytes = buf[..take].to_vec();
            if oversized && bytes.len() > 2 {
                bytes[2] |= 0x02; // surface the truncation to downstream checks
            }
            let truncated = proto_utils::is_truncated(&bytes);
            Ok(Reply {
                bytes: Bytes::from(bytes),
                proto: Proto::Udp,
                rtt: start.elapsed(),
                truncated,
            })
        }
        Ok(Err(err)) => Err(err),
        Err(_) => bail!("udp query to {} timed out", addr),
    }
}

async fn query_tcp(addr: SocketAddr, packet: &[u8], timeout_dur: Duration) -> Result<Reply> {
    if packet.len() > u16::MAX as usize {
        bail!("query too large for tcp framing");
    }
    let start = Instant::now();
    let attempt = async {
        let mut stream = TcpStream::connect(addr).await.context("tcp connect")?;
        let mut framed = Vec::with_capacity(2 + packet.len());
        framed.extend_from_slice(&(packet.len() as u16).to_be_bytes());
        framed.extend_from_slice(packet);
        stream.write_all(&framed).await.context("tcp write")?;

        let mut len_buf = [0u8; 2];
        stream.read_exact(&mut len_buf).await.context("tcp read len")?;
        let resp_len = u16::from_be_bytes(len_buf) as usize;
        if resp_len < HEADER_LEN {
            bail!("tcp frame shorter than a dns header");
        }
        let mut body = vec![0u8; resp_len];
        stream.read_exact(&mut body).await.context("tcp read body")?;
        Ok::<Bytes, anyhow::Error>(Bytes::from(body))
    };

    match timeout(timeout_dur, attempt).await {
        Ok(Ok(bytes)) => {
            let truncated = proto_utils::is_truncated(&bytes);
            Ok(Reply {
                bytes,
                proto: Proto::Tcp,
                rtt: start.elapsed(),
                truncated,
            })
        }
        Ok(Err(err)) => Err(err),
        Err(_) => bail!("tcp query to {} timed out", addr),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn sample_query() -> Vec<u8> {
        // Header + "qq.com" A IN
        let mut packet = Vec::new();
        packet.extend_from_slice(&0x0707u16.to_be_bytes());
        packet.extend_from_slice(&[0x01, 0x00]);
        packet.extend_from_slice(&1u16.to_be_bytes());
        packet.extend_from_slice(&[0, 0, 0, 0, 0, 0]);
        packet.extend_from_slice(b"\x02qq\x03com\x00");
        packet.extend_from_slice(&1u16.to_be_bytes());
        packet.extend_from_slice(&1u16.to_be_bytes());
        packet
    }

    /// UDP upstream answering every query by echoing it with QR (and
    /// optionally TC) set.
    async fn spawn_udp_upstream(set_tc: bool) -> SocketAddr {
        let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = sock.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            loop {
                let Ok((n, peer)) = sock.recv_from(&mut buf).await else {
                    break;
                };
                let mut resp = buf[..n].to_vec();
                resp[2] |= 0x80;
                if set_tc {
                    resp[2] |= 0x02;
                }
                let _ = sock.send_to(&resp, peer).await;
            }
        });
        addr
    }

    #[test]
    fn schema_defaults_to_udp_tcp_port_53() {
        let up = Upstream::parse("8.8.8.8").unwrap();
        assert_eq!(up.addr, "8.8.8.8:53".parse().unwrap());
        assert_eq!(up.protos, vec![Proto::Udp, Proto::Tcp]);
    }

    #[test]
    fn schema_honors_protocol_order() {
        let up = Upstream::parse("tcp+udp+114.114.114.114:5353").unwrap();
        assert_eq!(up.addr, "114.114.114.114:5353".parse().unwrap());
        assert_eq!(up.protos, vec![Proto::Tcp, Proto::Udp]);

        let tcp_only = Upstream::parse("tcp+1.1.1.1").unwrap();
        assert_eq!(tcp_only.protos, vec![Proto::Tcp]);
    }

    #[test]
    fn schema_accepts_ipv6() {
        let up = Upstream::parse("udp+[2001:4860:4860::8888]:53").unwrap();
        assert!(up.addr.is_ipv6());

        let bare = Upstream::parse("2001:4860:4860::8888").unwrap();
        assert_eq!(bare.addr.port(), 53);
    }

    #[test]
    fn schema_rejects_hostnames_and_garbage() {
        assert!(Upstream::parse("dns.google").is_err());
        assert!(Upstream::parse("udp+").is_err());
        assert!(Upstream::parse("").is_err());
    }

    #[test]
    fn schema_dedups_repeated_protocols() {
        let up = Upstream::parse("udp+udp+9.9.9.9").unwrap();
        assert_eq!(up.protos, vec![Proto::Udp]);
    }

    #[tokio::test]
    async fn udp_query_round_trips() {
        let addr = spawn_udp_upstream(false).await;
        let up = Upstream {
            addr,
            protos: vec![Proto::Udp],
        };
        let query = sample_query();
        let reply = query_upstream(&up, &query, Duration::from_secs(1), 4096)
            .await
            .expect("reply");
        assert_eq!(reply.proto, Proto::Udp);
        assert!(!reply.truncated);
        assert_eq!(proto_utils::tx_id(&reply.bytes), Some(0x0707));
        assert!(proto_utils::is_response(&reply.bytes));
    }

    #[tokio::test]
    async fn truncated_udp_falls_back_to_tcp() {
        // One logical upstream: TCP listener and a truncating UDP responder
        // sharing the same port.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut len_buf = [0u8; 2];
                    if stream.read_exact(&mut len_buf).await.is_err() {
                        return;
                    }
                    let len = u16::from_be_bytes(len_buf) as usize;
                    let mut body = vec![0u8; len];
                    if stream.read_exact(&mut body).await.is_err() {
                        return;
                    }
                    body[2] |= 0x80;
                    let mut out = Vec::with_capacity(2 + body.len());
                    out.extend_from_slice(&(body.len() as u16).to_be_bytes());
                    out.extend_from_slice(&body);
                    let _ = stream.write_all(&out).await;
                });
            }
        });
        let udp = UdpSocket::bind(addr).await.unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            while let Ok((n, peer)) = udp.recv_from(&mut buf).await {
                let mut resp = buf[..n].to_vec();
                resp[2] |= 0x80 | 0x02; // QR + TC
                let _ = udp.send_to(&resp, peer).await;
            }
        });

        let up = Upstream {
            addr,
            protos: vec![Proto::Udp, Proto::Tcp],
        };
        let reply = query_upstream(&up, &sample_query(), Duration::from_secs(1), 4096)
            .await
            .expect("reply");
        assert_eq!(reply.proto, Proto::Tcp);
        assert!(!reply.truncated);
    }

    #[tokio::test]
    async fn truncated_udp_without_tcp_is_returned_as_is() {
        let addr = spawn_udp_upstream(true).await;
        let up = Upstream {
            addr,
            protos: vec![Proto::Udp],
        };
        let reply = query_upstream(&up, &sample_query(), Duration::from_secs(1), 4096)
            .await
            .expect("reply");
        assert_eq!(reply.proto, Proto::Udp);
        assert!(reply.truncated);
    }

    #[tokio::test]
    async fn silent_upstream_times_out() {
        let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = sock.local_addr().unwrap();
        // keep the socket alive but never answer
        let up = Upstream {
            addr,
            protos: vec![Proto::Udp],
        };
        let started = Instant::now();
        let err = query_upstream(&up, &sample_query(), Duration::from_millis(80), 4096)
            .await
            .expect_err("should time out");
        assert!(started.elapsed() >= Duration::from_millis(80));
        assert!(format!("{err:#}").contains("timed out"), "got: {err:#}");
        drop(sock);
    }

    #[tokio::test]
    async fn oversized_datagram_is_marked_truncated() {
        let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = sock.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            if let Ok((n, peer)) = sock.recv_from(&mut buf).await {
                let mut resp = buf[..n].to_vec();
                resp[2] |= 0x80;
                resp.resize(600, 0); // exceed the read bound below
                let _ = sock.send_to(&resp, peer).await;
            }
        });

        let up = Upstream {
            addr,
            protos: vec![Proto::Udp],
        };
        let reply = query_upstream(&up, &sample_query(), Duration::from_secs(1), 512)
            .await
            .expect("reply");
        assert!(reply.truncated);
        assert!(reply.bytes.len() <= 512);
    }
}
