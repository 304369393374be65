//! Wires the CLI/config/directory inputs into running roles: builds the
//! outer sockets, starts the capture sinks and the measurement server/
//! scheduler, and runs the selected forwarding role to completion.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use anyhow::{Context, Result};
use directory::{Directory, PeerRecord};
use forwarding::{OuterSocket, OuterSockets, RuntimeState};
use lifecycle::{Barrier, Lifecycle};
use measurement::{FlowResult, ScheduleMode};
use pcap_file::DataLink;
use tracing::{info, warn};
use tun_device::Tun;
use udptun_config::Config;

use crate::cli::{Cli, Role};
use crate::signals::Terminate;

pub async fn run(cli: Cli) -> Result<()> {
    let config = load_config(&cli)?;
    let directory = load_directory(&cli, &config)?;
    let peers = directory.list.clone();

    let tun: Arc<dyn Tun> = Arc::new(
        tun_device::LinuxTun::new(config.tun_if.as_deref()).context("failed to open tun device")?,
    );
    info!(tun = tun.name(), "tun device ready");

    let run_suffix = cli.run_id.as_deref().map(|id| format!(".{id}")).unwrap_or_default();
    let tun_capture = capture::CaptureHandle::start(
        tun.name(),
        &[],
        config.snaplen,
        DataLink::RAW,
        config.out_dir.join(format!("tun{run_suffix}.pcap")),
    )
    .context("failed to start the tunneled-path capture sink")?;
    let notun_capture = match config.default_if.as_deref() {
        Some(iface) => Some(
            capture::CaptureHandle::start(
                iface,
                &[],
                config.snaplen,
                DataLink::ETHERNET,
                config.out_dir.join(format!("notun{run_suffix}.pcap")),
            )
            .context("failed to start the direct-path capture sink")?,
        ),
        None => {
            warn!("no default_if configured; direct-path capture sink disabled");
            None
        }
    };

    let lifecycle = Lifecycle::new();
    spawn_signal_handler(lifecycle.clone())?;

    let mode = cli.schedule_mode();
    let result = match cli.role() {
        Role::Client => run_client_role(config, directory, peers, tun, lifecycle.clone(), mode).await,
        Role::Server => run_server_role(config, directory, tun, lifecycle.clone()).await,
        Role::Peer => run_peer_role(config, directory, peers, tun, lifecycle.clone(), mode).await,
    };

    if let Some(capture) = notun_capture {
        capture.stop().await;
    }
    tun_capture.stop().await;
    lifecycle.teardown().await;

    result
}

fn spawn_signal_handler(lifecycle: Lifecycle) -> Result<()> {
    let mut terminate = Terminate::new().context("failed to install SIGINT/SIGTERM handlers")?;
    tokio::spawn(async move {
        terminate.recv().await;
        info!("received shutdown signal");
        lifecycle.cancel();
    });
    Ok(())
}

async fn run_client_role(
    config: Config,
    directory: Directory,
    peers: Vec<Arc<PeerRecord>>,
    tun: Arc<dyn Tun>,
    lifecycle: Lifecycle,
    mode: ScheduleMode,
) -> Result<()> {
    let barrier = Arc::new(Barrier::new(2));
    let sockets = build_outer_sockets(&config, config.port)?;

    let state = RuntimeState {
        config: config.clone(),
        directory,
        tun,
        lifecycle: lifecycle.clone(),
        barrier: barrier.clone(),
    };
    let forwarding = tokio::spawn(forwarding::run_client(state, sockets));

    let results = measurement::run_scheduler(&config, &peers, mode, &barrier).await;
    log_flow_results(&results);

    // A client scheduler invokes the shutdown hook once every peer has
    // been measured (spec.md §4.5); the peer role does not (§4.5, §4.4.5).
    info!("client scheduler finished, signalling the forwarding loop to shut down");
    lifecycle.cancel();
    forwarding.await.context("client forwarding loop panicked")?;

    Ok(())
}

async fn run_server_role(
    config: Config,
    directory: Directory,
    tun: Arc<dyn Tun>,
    lifecycle: Lifecycle,
) -> Result<()> {
    let barrier = Arc::new(Barrier::new(1));
    let sockets = build_outer_sockets(&config, config.public_port)?;

    measurement::spawn_listeners(&config).context("failed to start measurement server listeners")?;

    let state = RuntimeState {
        config,
        directory,
        tun,
        lifecycle,
        barrier,
    };
    forwarding::run_server(state, sockets).await;

    Ok(())
}

async fn run_peer_role(
    config: Config,
    directory: Directory,
    peers: Vec<Arc<PeerRecord>>,
    tun: Arc<dyn Tun>,
    lifecycle: Lifecycle,
    mode: ScheduleMode,
) -> Result<()> {
    let barrier = Arc::new(Barrier::new(2));
    let client_sockets = build_outer_sockets(&config, config.port)?;
    let server_sockets = build_outer_sockets(&config, config.public_port)?;

    measurement::spawn_listeners(&config).context("failed to start measurement server listeners")?;

    let state = RuntimeState {
        config: config.clone(),
        directory,
        tun,
        lifecycle,
        barrier: barrier.clone(),
    };
    let forwarding = tokio::spawn(forwarding::run_peer(state, client_sockets, server_sockets));

    let results = measurement::run_scheduler(&config, &peers, mode, &barrier).await;
    log_flow_results(&results);
    info!("peer scheduler finished; forwarding loop continues until shutdown or inactivity timeout");

    forwarding.await.context("peer forwarding loop panicked")?;

    Ok(())
}

fn build_outer_sockets(config: &Config, bind_port: u16) -> Result<OuterSockets> {
    let mut sockets = OuterSockets::default();

    if config.private_addr4.is_some() || config.public_addr4.is_some() {
        sockets.v4 = Some(bind_outer(IpAddr::V4(Ipv4Addr::UNSPECIFIED), bind_port, config)?);
    }
    if config.private_addr6.is_some() || config.public_addr6.is_some() {
        sockets.v6 = Some(bind_outer(IpAddr::V6(Ipv6Addr::UNSPECIFIED), bind_port, config)?);
    }

    if sockets.is_empty() {
        anyhow::bail!(
            "no address family configured: set private_addr4/public_addr4 or private_addr6/public_addr6"
        );
    }

    Ok(sockets)
}

fn bind_outer(bind_addr: IpAddr, port: u16, config: &Config) -> Result<OuterSocket> {
    let socket = if config.udp {
        OuterSocket::bind_udp(SocketAddr::new(bind_addr, port))
            .with_context(|| format!("failed to bind outer UDP socket on {bind_addr}:{port}"))?
    } else {
        OuterSocket::bind_raw(bind_addr, config.protocol_num).with_context(|| {
            format!("failed to bind outer raw socket on {bind_addr} (protocol {})", config.protocol_num)
        })?
    };

    if let Err(error) = socket.enable_recverr() {
        warn!(%error, "failed to enable the kernel error queue on the outer socket; ICMP side-channel disabled");
    }

    Ok(socket)
}

fn log_flow_results(results: &[FlowResult]) {
    for result in results {
        info!(
            peer_port = result.peer_port,
            flow = result.flow,
            family = ?result.family,
            bytes = result.bytes,
            file = %result.file.display(),
            "measurement flow complete"
        );
    }
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = udptun_config::load(&cli.config_file)
        .with_context(|| format!("failed to load config file {}", cli.config_file.display()))?;

    if cli.udp {
        config.udp = true;
    }
    if cli.raw {
        config.udp = false;
    }
    if let Some(raw_header) = cli.raw_header_bytes()? {
        config.raw_header = raw_header;
    }
    if let Some(size) = cli.raw_header_size {
        config.raw_header_size = size;
    }
    if let Some(protocol_num) = cli.protocol_num {
        config.protocol_num = protocol_num;
    }
    if cli.planetlab {
        config.planetlab = true;
    }
    if cli.freebsd {
        warn!("-b/--freebsd given but this build only implements the Linux tun backend; ignoring");
    }

    match (cli.ipv6, cli.dual_stack) {
        (true, false) if config.private_addr6.is_none() => {
            warn!("-6/--ipv6 given but private_addr6 is not configured");
        }
        (false, true) if config.private_addr4.is_none() || config.private_addr6.is_none() => {
            warn!("-2/--dual-stack given but both private_addr4 and private_addr6 must be configured");
        }
        _ => {}
    }

    Ok(config)
}

fn load_directory(cli: &Cli, config: &Config) -> Result<Directory> {
    match &cli.dest_file {
        Some(path) => directory::load(path, config)
            .with_context(|| format!("failed to load destination file {}", path.display())),
        None if cli.role() == Role::Server => Ok(Directory::empty(config)),
        None => anyhow::bail!("a destination file (-d/--dest-file) is required for this role"),
    }
}
