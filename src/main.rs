//! siftdns: a split-horizon DNS forwarder.
//!
//! Fans each client query out to trusted and untrusted upstream pools and
//! sieves the replies through CHNRoute and blacklist heuristics to reject
//! forged answers.

mod config;
mod dispatcher;
mod health;
mod matcher;
mod mutation;
mod proto_utils;
mod upstream;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{RawConfig, ServerConfig};
use crate::dispatcher::Dispatcher;

#[derive(Parser, Debug)]
#[command(author, version, about = "Split-horizon DNS forwarder with CHNRoute answer sieving", long_about = None)]
struct Args {
    /// JSON config file; CLI flags override its values
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,
    /// Listen address for UDP and TCP, e.g. [::]:53
    #[arg(short = 'l', long = "listen")]
    listen: Option<String>,
    /// China route list, one CIDR per line
    #[arg(long = "china-cidr")]
    china_cidr: Option<PathBuf>,
    /// IP blacklist, CIDR or bare IP per line
    #[arg(long = "ip-blacklist")]
    ip_blacklist: Option<PathBuf>,
    /// Domain blacklist; any subdomain answers NXDOMAIN
    #[arg(long = "domain-blacklist")]
    domain_blacklist: Option<PathBuf>,
    /// Polluted domains, resolved through the trusted pool only
    #[arg(long = "domain-polluted")]
    domain_polluted: Option<PathBuf>,
    /// Always-trusted upstream schema ([proto+]*ip[:port]), repeatable
    #[arg(short = 't', long = "trusted-server")]
    trusted_servers: Vec<String>,
    /// Upstream schema auto-classified by the China routes, repeatable
    #[arg(short = 's', long = "server")]
    servers: Vec<String>,
    /// Per-query deadline in milliseconds
    #[arg(long = "timeout-ms")]
    timeout_ms: Option<u64>,
    /// Maximum UDP payload size in bytes
    #[arg(long = "udp-max-size")]
    udp_max_size: Option<u16>,
    /// Query upstreams over TCP only
    #[arg(long = "tcp-only", default_value_t = false)]
    tcp_only: bool,
    /// Enable pointer mutation for trusted queries
    #[arg(long = "mutation", default_value_t = false)]
    mutation: bool,
    /// Drop trusted replies carrying China IPs
    #[arg(long = "bidirectional", default_value_t = false)]
    bidirectional: bool,
    /// Enable SO_REUSEPORT listeners, one UDP worker per core
    #[arg(long = "reuse-port", default_value_t = false)]
    reuse_port: bool,
    /// Hold untrusted fan-out this long after trusted, in milliseconds
    #[arg(long = "delay-ms")]
    delay_ms: Option<u64>,
    /// Canary domain for the startup health check, repeatable
    #[arg(long = "test-domain")]
    test_domains: Vec<String>,
    /// Enable debug logging
    #[arg(long = "debug", default_value_t = false)]
    debug: bool,
}

impl Args {
    fn overlay(self, mut raw: RawConfig) -> RawConfig {
        if self.listen.is_some() {
            raw.listen = self.listen;
        }
        if self.china_cidr.is_some() {
            raw.china_cidr = self.china_cidr;
        }
        if self.ip_blacklist.is_some() {
            raw.ip_blacklist = self.ip_blacklist;
        }
        if self.domain_blacklist.is_some() {
            raw.domain_blacklist = self.domain_blacklist;
        }
        if self.domain_polluted.is_some() {
            raw.domain_polluted = self.domain_polluted;
        }
        if !self.trusted_servers.is_empty() {
            raw.trusted_servers = self.trusted_servers;
        }
        if !self.servers.is_empty() {
            raw.servers = self.servers;
        }
        if self.timeout_ms.is_some() {
            raw.timeout_ms = self.timeout_ms;
        }
        if self.udp_max_size.is_some() {
            raw.udp_max_size = self.udp_max_size;
        }
        if self.delay_ms.is_some() {
            raw.delay_ms = self.delay_ms;
        }
        if !self.test_domains.is_empty() {
            raw.test_domains = Some(self.test_domains);
        }
        raw.tcp_only |= self.tcp_only;
        raw.mutation |= self.mutation;
        raw.bidirectional |= self.bidirectional;
        raw.reuse_port |= self.reuse_port;
        raw
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.debug);

    let raw = match &args.config {
        Some(path) => RawConfig::load(path)?,
        None => RawConfig::default(),
    };
    let raw = args.overlay(raw);
    let mut cfg = ServerConfig::build(raw)?;
    health::prune_pools(&mut cfg).await.context("startup health check")?;

    info!(
        listen = %cfg.listen,
        trusted = cfg.trusted.len(),
        untrusted = cfg.untrusted.len(),
        china_routes = cfg.china_route.len(),
        mutation = cfg.mutation,
        bidirectional = cfg.bidirectional,
        "dns forwarder started"
    );

    let listen = cfg.listen;
    let reuse_port = cfg.reuse_port;
    let dispatcher = Arc::new(Dispatcher::new(Arc::new(cfg)));

    let udp_workers = if reuse_port { num_cpus::get().max(1) } else { 1 };
    let mut udp_handles = Vec::with_capacity(udp_workers);

    if reuse_port && cfg!(unix) {
        // One socket per worker; the kernel spreads datagrams across them.
        for worker_id in 0..udp_workers {
            let std_socket = create_reuseport_udp_socket(listen)
                .with_context(|| format!("create udp socket for worker {worker_id}"))?;
            let socket = Arc::new(UdpSocket::from_std(std_socket)?);
            let dispatcher = dispatcher.clone();
            udp_handles.push(tokio::spawn(async move {
                if let Err(err) = run_udp_worker(worker_id, socket, dispatcher).await {
                    error!(worker_id, error = %err, "udp worker exited");
                }
            }));
        }
    } else {
        if reuse_port {
            warn!("reuse-port is only supported on unix; sharing one socket");
        }
        let socket = Arc::new(
            UdpSocket::bind(listen)
                .await
                .with_context(|| format!("bind udp {listen}"))?,
        );
        for worker_id in 0..udp_workers {
            let socket = socket.clone();
            let dispatcher = dispatcher.clone();
            udp_handles.push(tokio::spawn(async move {
                if let Err(err) = run_udp_worker(worker_id, socket, dispatcher).await {
                    error!(worker_id, error = %err, "udp worker exited");
                }
            }));
        }
    }

    let tcp_listener = bind_tcp_listener(listen, reuse_port)
        .await
        .with_context(|| format!("bind tcp {listen}"))?;
    let tcp_dispatcher = dispatcher.clone();
    let tcp_handle = tokio::spawn(async move {
        if let Err(err) = run_tcp(tcp_listener, tcp_dispatcher).await {
            error!(error = %err, "tcp listener exited");
        }
    });

    let _ = tcp_handle.await;
    for handle in udp_handles {
        let _ = handle.await;
    }
    Ok(())
}

fn init_tracing(debug: bool) {
    let fmt_layer = fmt::layer().with_target(false);
    let level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();
}

// SO_REUSEPORT via libc so multiple workers (or processes) can share the
// port. Unix only.
#[cfg(unix)]
fn create_reuseport_udp_socket(addr: SocketAddr) -> Result<std::net::UdpSocket> {
    use socket2::{Domain, Protocol, Socket, Type};
    use std::os::unix::io::AsRawFd;

    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    let val: libc::c_int = 1;
    let ret = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_REUSEPORT,
            &val as *const _ as *const libc::c_void,
            std::mem::size_of_val(&val) as libc::socklen_t,
        )
    };
    if ret != 0 {
        warn!("SO_REUSEPORT not available; continuing without it");
    }
    let _ = socket.set_recv_buffer_size(4 * 1024 * 1024);
    let _ = socket.set_send_buffer_size(4 * 1024 * 1024);
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    Ok(socket.into())
}

#[cfg(not(unix))]
fn create_reuseport_udp_socket(_addr: SocketAddr) -> Result<std::net::UdpSocket> {
    anyhow::bail!("reuse-port requires unix")
}

async fn bind_tcp_listener(addr: SocketAddr, reuse_port: bool) -> Result<TcpListener> {
    #[cfg(unix)]
    if reuse_port {
        use socket2::{Domain, Protocol, Socket, Type};
        use std::os::unix::io::AsRawFd;

        let domain = if addr.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };
        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        let val: libc::c_int = 1;
        unsafe {
            libc::setsockopt(
                socket.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_REUSEPORT,
                &val as *const _ as *const libc::c_void,
                std::mem::size_of_val(&val) as libc::socklen_t,
            );
        }
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        socket.listen(1024)?;
        let std_listener: std::net::TcpListener = socket.into();
        return Ok(TcpListener::from_std(std_listener)?);
    }
    let _ = reuse_port;
    Ok(TcpListener::bind(addr).await?)
}

async fn run_udp_worker(
    _worker_id: usize,
    socket: Arc<UdpSocket>,
    dispatcher: Arc<Dispatcher>,
) -> Result<()> {
    let max_size = dispatcher.config().udp_max_size as usize;
    let mut buf = vec![0u8; max_size];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((len, peer)) => {
                let packet = buf[..len].to_vec();
                let dispatcher = dispatcher.clone();
                let socket = Arc::clone(&socket);
                tokio::spawn(async move {
                    match dispatcher.handle(&packet, peer).await {
                        Ok(reply) => {
                            let _ = socket.send_to(&reply, peer).await;
                        }
                        Err(err) => {
                            debug!(client = %peer, error = %format!("{err:#}"), "query dropped");
                        }
                    }
                });
            }
            Err(err) => {
                warn!(error = %err, "udp recv error");
            }
        }
    }
}

async fn run_tcp(listener: TcpListener, dispatcher: Arc<Dispatcher>) -> Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_tcp_conn(stream, peer, dispatcher).await {
                debug!(client = %peer, error = %format!("{err:#}"), "tcp connection closed");
            }
        });
    }
}

/// Length-framed query loop; pipelined queries on one connection are
/// served in order until EOF or a malformed frame.
async fn handle_tcp_conn(
    mut stream: TcpStream,
    peer: SocketAddr,
    dispatcher: Arc<Dispatcher>,
) -> Result<()> {
    const MAX_TCP_FRAME: usize = 64 * 1024;
    let mut len_buf = [0u8; 2];

    loop {
        if let Err(err) = stream.read_exact(&mut len_buf).await {
            if err.kind() != std::io::ErrorKind::UnexpectedEof {
                return Err(err.into());
            }
            return Ok(());
        }
        let frame_len = u16::from_be_bytes(len_buf) as usize;
        if frame_len == 0 || frame_len > MAX_TCP_FRAME {
            return Ok(());
        }

        let mut packet = vec![0u8; frame_len];
        if stream.read_exact(&mut packet).await.is_err() {
            return Ok(());
        }

        let reply = match dispatcher.handle(&packet, peer).await {
            Ok(r) => r,
            Err(_) => return Ok(()),
        };

        if reply.len() <= u16::MAX as usize {
            stream
                .write_all(&(reply.len() as u16).to_be_bytes())
                .await?;
            stream.write_all(&reply).await?;
        }
    }
}
