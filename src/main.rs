use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use portquiz::config::{DisplayFilter, RunConfig, VersionFilter, DEFAULT_QUEUE_DEPTH};
use portquiz::redirect::{Iptables, Redirector};
use portquiz::responder::{ResponderOptions, TcpResponder, UdpResponder};
use portquiz::scanner::Scanner;
use portquiz::types::{write_results_json, Proto};
use portquiz::{netdetect, ports};

/// portquiz: find which TCP/UDP ports reach a host through NAT and firewalls.
#[derive(Debug, Parser)]
#[command(name = "portquiz", version, long_about = None)]
struct Cli {
    /// Enable verbose logging (RUST_LOG overrides).
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Probe a host running `portquiz serve`.
    Probe(ProbeArgs),
    /// Answer probes, redirecting every port on the listen addresses to one socket.
    Serve(ServeArgs),
}

#[derive(Debug, Clone, Args)]
struct ProbeArgs {
    /// IP or host name to probe.
    host: String,

    /// Probe TCP ports.
    #[arg(long)]
    tcp: bool,

    /// Probe UDP ports.
    #[arg(long)]
    udp: bool,

    /// Force IPv4.
    #[arg(short = '4', long = "ipv4")]
    ipv4: bool,

    /// Force IPv6.
    #[arg(short = '6', long = "ipv6")]
    ipv6: bool,

    /// Comma separated list of ports to test (default: 1-65535).
    #[arg(long)]
    port: Option<String>,

    /// Number of worker tasks.
    #[arg(long, default_value_t = 20)]
    parallel: usize,

    /// Attempts per port before it is reported closed.
    #[arg(long, default_value_t = 3)]
    retry: u32,

    /// Probes per attempt that must all succeed, to make sure larger streams work.
    #[arg(long, default_value_t = 1)]
    multi: u32,

    /// Timeout for each network step in milliseconds.
    #[arg(long = "timeout-ms", default_value_t = 5000)]
    timeout_ms: u64,

    /// Print only open ports.
    #[arg(long)]
    open: bool,

    /// Print only closed ports.
    #[arg(long)]
    closed: bool,

    /// Shared secret; must match the server.
    #[arg(long, env = "PORTQUIZ_PASSWORD", default_value = portquiz::config::DEFAULT_SECRET)]
    password: String,

    /// Capacity of the job and result queues.
    #[arg(long = "queue-depth", default_value_t = DEFAULT_QUEUE_DEPTH)]
    queue_depth: usize,

    /// Cancel the whole run after this many seconds.
    #[arg(long = "deadline-secs")]
    deadline_secs: Option<u64>,

    /// Write results as pretty JSON to this path (optional).
    #[arg(long)]
    output: Option<PathBuf>,
}

#[derive(Debug, Clone, Args)]
struct ServeArgs {
    /// Start the TCP responder.
    #[arg(long)]
    tcp: bool,

    /// Start the UDP responder.
    #[arg(long)]
    udp: bool,

    /// Comma separated list of IPs to listen on (default: all non-loopback addresses).
    #[arg(long)]
    listen: Option<String>,

    /// Port to listen on; redirected traffic for every port lands here.
    #[arg(long, default_value_t = 1337)]
    port: u16,

    /// Per-connection timeout in milliseconds.
    #[arg(long = "timeout-ms", default_value_t = 10_000)]
    timeout_ms: u64,

    /// Shared secret; must match the client.
    #[arg(long, env = "PORTQUIZ_PASSWORD", default_value = portquiz::config::DEFAULT_SECRET)]
    password: String,

    /// Do not create iptables redirect rules.
    #[arg(long = "no-iptables")]
    no_iptables: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Probe(args) => {
            init_tracing(cli.verbose, "warn");
            run_probe(args).await
        }
        Command::Serve(args) => {
            init_tracing(cli.verbose, "info");
            run_serve(args).await
        }
    }
}

fn init_tracing(verbose: bool, quiet_level: &str) {
    let default = if verbose { "portquiz=debug" } else { quiet_level };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run_probe(args: ProbeArgs) -> Result<()> {
    let config = RunConfig {
        host: args.host,
        tcp: args.tcp,
        udp: args.udp,
        ports: ports::select_ports(args.port.as_deref())?,
        versions: VersionFilter {
            v4: args.ipv4,
            v6: args.ipv6,
        },
        timeout: Duration::from_millis(args.timeout_ms),
        retry: args.retry,
        multi: args.multi,
        workers: args.parallel,
        queue_depth: args.queue_depth,
        secret: args.password.into_bytes(),
        display: DisplayFilter::from_flags(args.open, args.closed),
    }
    .validate()?;

    debug!(
        "probing {} ({} ports, retry {}, multi {}, {} workers, timeout {:?})",
        config.host,
        config.ports.len(),
        config.retry,
        config.multi,
        config.workers,
        config.timeout
    );

    let cancel = CancellationToken::new();

    // Ctrl-C cancels the run.
    let cancel_ctrlc = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted");
            cancel_ctrlc.cancel();
        }
    });

    if let Some(secs) = args.deadline_secs {
        let cancel_deadline = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(secs)).await;
            warn!("deadline of {secs}s reached");
            cancel_deadline.cancel();
        });
    }

    let scanner = Scanner::new(config);
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let results = scanner.run(cancel, &mut out).await?;

    if let Some(path) = args.output.as_deref() {
        if let Err(e) = write_results_json(path, &results) {
            eprintln!("Failed to write JSON to {}: {e:#}", path.display());
        } else {
            info!("wrote JSON results to {}", path.display());
        }
    }
    Ok(())
}

async fn run_serve(args: ServeArgs) -> Result<()> {
    let mut protos = Vec::new();
    if args.tcp {
        protos.push(Proto::Tcp);
    }
    if args.udp {
        protos.push(Proto::Udp);
    }
    if protos.is_empty() {
        bail!("must set TCP and/or UDP");
    }
    if args.password.is_empty() {
        bail!("shared secret must not be empty");
    }

    let ips = match args.listen.as_deref() {
        Some(list) => netdetect::parse_listen_ips(list)?,
        None => netdetect::detect_listen_ips()?,
    };
    let opts = ResponderOptions::new(
        args.password.as_bytes(),
        Duration::from_millis(args.timeout_ms),
    );

    let cancel = CancellationToken::new();
    let mut redirector = Redirector::new(Iptables);
    let mut set = JoinSet::new();

    let started = async {
        for &ip in &ips {
            if !args.no_iptables {
                redirector
                    .redirect(ip, args.port, &protos, &args.password)
                    .await?;
            }
            let addr = SocketAddr::new(ip, args.port);
            if args.tcp {
                let r = TcpResponder::bind(addr, opts.clone()).await?;
                set.spawn(r.run(cancel.clone()));
            }
            if args.udp {
                let r = UdpResponder::bind(addr, opts.clone()).await?;
                set.spawn(r.run(cancel.clone()));
            }
        }
        Ok::<_, anyhow::Error>(())
    }
    .await;

    let outcome = match started {
        Ok(()) => {
            tokio::select! {
                res = tokio::signal::ctrl_c() => {
                    info!("interrupt received, cleaning up for exit");
                    res.context("waiting for ctrl-c")
                }
                Some(joined) = set.join_next() => {
                    joined.context("responder panicked").and_then(|r| r)
                }
            }
        }
        Err(e) => Err(e),
    };

    cancel.cancel();
    while set.join_next().await.is_some() {}

    let cleaned = redirector.cleanup().await;
    outcome?;
    cleaned
}
