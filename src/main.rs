use std::io::Write as _;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::Parser;
use http::{Method, Uri};
use tokio::io::AsyncWriteExt;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;

use loadlink::http::{HttpPayload, ALPN_HTTP1, ALPN_HTTP2};
use loadlink::tcp::{AckHandler, FlowStream, ReliableReader, TcpConn};
use loadlink::util::humanize_bytes;
use loadlink::{Egress, Link};

#[derive(Parser)]
#[command(name = "loadlink", about = "Userspace TCP load generator speaking directly to the link layer")]
struct Args {
    /// Number of workers.
    #[arg(short, long, default_value_t = 50)]
    workers: usize,
    /// Requests per connection.
    #[arg(short = 'n', long, default_value_t = 3)]
    requests: u32,
    /// Per-connection timeout.
    #[arg(short, long, default_value = "10s", value_parser = humantime::parse_duration)]
    timeout: Duration,
    /// HTTP method.
    #[arg(short, long, default_value = "GET")]
    method: String,
    /// Request URL.
    #[arg(short = 'r', long = "url")]
    url: String,
    /// User-Agent header.
    #[arg(short, long, default_value = "loadlink/0.1")]
    user_agent: String,
    /// Resolve override: an IP, or a path to a newline-separated IP list.
    #[arg(short = 'd', long)]
    resolve: Option<String>,
    /// Routing interface.
    #[arg(short, long)]
    interface: Option<String>,
    /// Keep a worker dialing after a dial error instead of exiting.
    #[arg(short, long)]
    keep_going: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let uri: Uri = args.url.parse().context("invalid request url")?;
    let method: Method = args.method.parse().context("invalid method")?;
    let (default_port, use_tls) = match uri.scheme_str() {
        Some("http") => (80, false),
        Some("https") => (443, true),
        _ => anyhow::bail!("unsupported scheme"),
    };
    let port = uri.port_u16().unwrap_or(default_port);
    let host = uri.host().context("url has no host")?.to_string();

    let payload = Arc::new(HttpPayload::new(method, uri.clone(), args.user_agent.clone(), args.requests));

    let addrs = resolve(&host, port, args.resolve.as_deref()).await?;
    anyhow::ensure!(!addrs.is_empty(), "no address found");
    anyhow::ensure!(args.workers > 0, "no workers");
    let addrs = Arc::new(addrs);

    let tls = if use_tls {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let mut config = ClientConfig::builder().with_root_certificates(roots).with_no_client_auth();
        config.alpn_protocols = vec![ALPN_HTTP2.as_bytes().to_vec(), ALPN_HTTP1.as_bytes().to_vec()];
        let server_name = ServerName::try_from(host.clone()).context("invalid server name")?;
        Some((TlsConnector::from(Arc::new(config)), server_name))
    } else {
        None
    };

    let (iface, gateway) = default_route(args.interface.as_deref())?;
    let src = interface_ipv4(&iface)?;
    log::info!("routing via {iface}: {src} -> {gateway}, target {}:{port}", host);

    let egress = Egress::open(&iface, src, gateway, None)?;
    let recv_loop = egress.clone().run();

    let completed = Arc::new(AtomicU64::new(0));
    spawn_stats(egress.clone(), completed.clone());

    let source_port = Arc::new(AtomicU16::new(rand::random()));
    for _ in 0..args.workers {
        let ctx = WorkerCtx {
            egress: egress.clone(),
            payload: payload.clone(),
            addrs: addrs.clone(),
            source_port: source_port.clone(),
            completed: completed.clone(),
            tls: tls.clone(),
            dst_port: port,
            timeout: args.timeout,
            keep_going: args.keep_going,
        };
        tokio::spawn(worker(ctx));
    }

    recv_loop.await?;
    anyhow::bail!("link receive loop terminated");
}

#[derive(Clone)]
struct WorkerCtx {
    egress: Arc<Egress>,
    payload: Arc<HttpPayload>,
    addrs: Arc<Vec<Ipv4Addr>>,
    source_port: Arc<AtomicU16>,
    completed: Arc<AtomicU64>,
    tls: Option<(TlsConnector, ServerName<'static>)>,
    dst_port: u16,
    timeout: Duration,
    keep_going: bool,
}

async fn worker(ctx: WorkerCtx) {
    loop {
        let source_port = ctx.source_port.fetch_add(1, Ordering::Relaxed);
        let addr = ctx.addrs[source_port as usize % ctx.addrs.len()];
        match dial_once(&ctx, addr, source_port).await {
            Ok(true) => {
                ctx.completed.fetch_add(1, Ordering::Relaxed);
            }
            Ok(false) => {}
            Err(e) => {
                log::error!("dial {addr}:{}: {e}", ctx.dst_port);
                if !ctx.keep_going {
                    std::process::exit(1);
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

/// One connection's lifetime. `Ok(true)` means the peer finished the flow
/// before our timeout.
async fn dial_once(ctx: &WorkerCtx, addr: Ipv4Addr, source_port: u16) -> anyhow::Result<bool> {
    let peer = SocketAddrV4::new(addr, ctx.dst_port);
    let deadline = Instant::now() + ctx.timeout;

    let Some((connector, server_name)) = ctx.tls.as_ref() else {
        let handler = AckHandler::new();
        let p = ctx.payload.payload(ALPN_HTTP1).context("no http/1.1 payload")?;
        handler.write(&p)?;
        let conn = TcpConn::dial(link(ctx), peer, source_port, handler)?;
        return Ok(wait_close(&conn, deadline).await);
    };

    let reader = ReliableReader::new();
    let conn = TcpConn::dial(link(ctx), peer, source_port, reader.clone())?;
    reader.set_read_deadline(Some(deadline));

    let stream = FlowStream::new(reader.clone());
    let detach = stream.detach_handle();
    let mut tls_stream = match connector.connect(server_name.clone(), stream).await {
        Ok(s) => s,
        Err(e) => {
            log::debug!("tls handshake {peer}: {e}");
            let _ = conn.close();
            return Ok(false);
        }
    };

    let alpn = tls_stream
        .get_ref()
        .1
        .alpn_protocol()
        .and_then(|p| std::str::from_utf8(p).ok())
        .unwrap_or(ALPN_HTTP1)
        .to_string();
    let Some(p) = ctx.payload.payload(&alpn) else {
        let _ = conn.close();
        return Ok(false);
    };
    if tls_stream.write_all(&p).await.is_err() || tls_stream.flush().await.is_err() {
        let _ = conn.close();
        return Ok(false);
    }

    // hand the connection off to the bulk HTTP phase, keeping the writer
    detach.detach();
    conn.set_window(u16::MAX);
    conn.set_handler(AckHandler::with_writer(reader.writer().clone()));
    drop(tls_stream);

    Ok(wait_close(&conn, deadline).await)
}

fn link(ctx: &WorkerCtx) -> Arc<dyn Link> {
    ctx.egress.clone()
}

async fn wait_close(conn: &Arc<TcpConn>, deadline: Instant) -> bool {
    tokio::select! {
        _ = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)) => {
            let _ = conn.close();
            false
        }
        _ = conn.closed() => true,
    }
}

fn spawn_stats(egress: Arc<Egress>, completed: Arc<AtomicU64>) {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        let start = Instant::now();
        let mut last_traffic = 0u64;
        loop {
            tick.tick().await;
            let total = egress.traffic();
            let rate = total - last_traffic;
            last_traffic = total;
            print!(
                "\x1b[2K\rtraffic: \x1b[32m{}\x1b[0m/s | total: \x1b[36m{}\x1b[0m | completed: \x1b[35m{}\x1b[0m | {:?}",
                humanize_bytes(rate),
                humanize_bytes(total),
                completed.load(Ordering::Relaxed),
                Duration::from_secs(start.elapsed().as_secs()),
            );
            let _ = std::io::stdout().flush();
        }
    });
}

async fn resolve(host: &str, port: u16, over: Option<&str>) -> anyhow::Result<Vec<Ipv4Addr>> {
    if let Some(over) = over {
        if let Ok(ip) = over.parse::<Ipv4Addr>() {
            return Ok(vec![ip]);
        }
        let list = std::fs::read_to_string(over).with_context(|| format!("reading {over}"))?;
        let mut addrs = Vec::new();
        for line in list.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            addrs.push(line.parse::<Ipv4Addr>().with_context(|| format!("invalid ip address {line:?}"))?);
        }
        return Ok(addrs);
    }
    let addrs: Vec<Ipv4Addr> = tokio::net::lookup_host((host, port))
        .await
        .context("dns lookup")?
        .filter_map(|a| match a {
            SocketAddr::V4(v4) => Some(*v4.ip()),
            SocketAddr::V6(_) => None,
        })
        .collect();
    anyhow::ensure!(!addrs.is_empty(), "no ipv4 address found");
    Ok(addrs)
}

/// Default route (interface, gateway) from the kernel routing table.
fn default_route(iface_override: Option<&str>) -> anyhow::Result<(String, Ipv4Addr)> {
    let table = std::fs::read_to_string("/proc/net/route").context("reading routing table")?;
    for line in table.lines().skip(1) {
        let cols: Vec<&str> = line.split_whitespace().collect();
        if cols.len() < 3 || cols[1] != "00000000" {
            continue;
        }
        if let Some(want) = iface_override {
            if cols[0] != want {
                continue;
            }
        }
        let gw = u32::from_str_radix(cols[2], 16).context("routing table gateway")?;
        if gw == 0 {
            continue;
        }
        return Ok((cols[0].to_string(), Ipv4Addr::from(gw.to_le_bytes())));
    }
    match iface_override {
        Some(want) => anyhow::bail!("no default route through {want}"),
        None => anyhow::bail!("no default route found"),
    }
}

fn interface_ipv4(name: &str) -> anyhow::Result<Ipv4Addr> {
    let iface = pnet_datalink::interfaces()
        .into_iter()
        .find(|i| i.name == name)
        .with_context(|| format!("no interface {name}"))?;
    iface
        .ips
        .iter()
        .find_map(|n| match n.ip() {
            IpAddr::V4(v4) => Some(v4),
            IpAddr::V6(_) => None,
        })
        .with_context(|| format!("no ipv4 address on {name}"))
}
