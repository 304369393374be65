//! The measurement scheduler (C5): for every peer in the directory, drive
//! one tunneled and one direct TCP flow, in one of three selectable
//! orderings, writing each flow's received bytes to a result file.
//!
//! Grounded on `original_source/src/net.c`'s `tcp_cli` (bind, timeouts,
//! `TCP_MAXSEG` on the tunneled socket only, connect, read-to-EOF,
//! half-close, wait-for-FIN, chmod) and `original_source/src/cli.c`'s
//! `cli_thread` (iterate the directory, one peer after another).

use std::io::Read;
use std::net::{IpAddr, Shutdown, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use directory::PeerRecord;
use lifecycle::Barrier;
use packet_shaper::Family;
use tracing::{debug, info, warn};
use udptun_config::Config;

use crate::socket::{bind_tcp, set_tcp_maxseg};

/// Flow ordering for a peer's tunneled/direct pair (spec.md §4.5). Dual
/// stack forces the parallel shape regardless of the selected mode (see
/// [`run_peer`]'s doc comment).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleMode {
    Parallel,
    TunFirst,
    NotunFirst,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Tun,
    Notun,
}

/// One flow's outcome: bytes received (possibly zero, on a connect
/// timeout — "a legitimate observation" per spec.md §4.5) and the file
/// written to.
#[derive(Debug)]
pub struct FlowResult {
    pub peer_port: u16,
    pub flow: &'static str,
    pub family: Family,
    pub bytes: u64,
    pub file: PathBuf,
}

/// Runs the scheduler to completion: `config.initial_sleep`, then the
/// barrier wait shared with the forwarding loop and capture sinks, then
/// one peer at a time, in directory order.
///
/// Takes the peer list rather than a whole `Directory`, since the
/// directory's dynamic `by_sport` index is exclusively owned by the
/// concurrently-running forwarding loop (§5's single-writer rule) — the
/// scheduler only ever needs the static, ordered peer list.
pub async fn run_scheduler(config: &Config, peers: &[Arc<PeerRecord>], mode: ScheduleMode, barrier: &Barrier) -> Vec<FlowResult> {
    if config.initial_sleep > 0 {
        tokio::time::sleep(Duration::from_secs(config.initial_sleep)).await;
    }
    barrier.wait().await;

    info!(peers = peers.len(), "measurement scheduler starting");

    let mut results = Vec::new();
    for record in peers {
        results.extend(run_peer(config, record, mode).await);
    }

    info!(flows = results.len(), "measurement scheduler finished");
    results
}

/// Runs both flows for one peer. A peer with both address families
/// populated runs the "dual-stack collapse" shape from spec.md §4.5: v4
/// tun+notun in parallel, joined, then v6 tun+notun in parallel, joined —
/// regardless of `mode`, which only governs the single-stack case.
async fn run_peer(config: &Config, record: &PeerRecord, mode: ScheduleMode) -> Vec<FlowResult> {
    let has_v4 = record.private4.is_some() && record.public4.is_some();
    let has_v6 = record.private6.is_some() && record.public6.is_some();

    let mut out = Vec::new();
    if has_v4 && has_v6 {
        out.extend(run_pair_parallel(config, record, Family::V4).await);
        out.extend(run_pair_parallel(config, record, Family::V6).await);
        return out;
    }

    if has_v4 {
        out.extend(run_pair(config, record, Family::V4, mode).await);
    }
    if has_v6 {
        out.extend(run_pair(config, record, Family::V6, mode).await);
    }
    out
}

async fn run_pair(config: &Config, record: &PeerRecord, family: Family, mode: ScheduleMode) -> Vec<FlowResult> {
    match mode {
        ScheduleMode::Parallel => run_pair_parallel(config, record, family).await,
        ScheduleMode::TunFirst => {
            let tun = run_flow(config, record, family, Flow::Tun).await;
            let notun = run_flow(config, record, family, Flow::Notun).await;
            vec![tun, notun]
        }
        ScheduleMode::NotunFirst => {
            let notun = run_flow(config, record, family, Flow::Notun).await;
            let tun = run_flow(config, record, family, Flow::Tun).await;
            vec![tun, notun]
        }
    }
}

async fn run_pair_parallel(config: &Config, record: &PeerRecord, family: Family) -> Vec<FlowResult> {
    let (tun, notun) = tokio::join!(
        run_flow(config, record, family, Flow::Tun),
        run_flow(config, record, family, Flow::Notun),
    );
    vec![tun, notun]
}

async fn run_flow(config: &Config, record: &PeerRecord, family: Family, flow: Flow) -> FlowResult {
    let (bind_ip, dest, device, mss): (IpAddr, SocketAddr, Option<String>, Option<u32>) = match (family, flow) {
        (Family::V4, Flow::Tun) => (
            IpAddr::V4(config.private_addr4.expect("has_v4 checked by caller")),
            SocketAddr::new(IpAddr::V4(record.private4.expect("has_v4 checked by caller")), config.private_port),
            None,
            config.max_segment_size,
        ),
        (Family::V4, Flow::Notun) => (
            IpAddr::V4(config.public_addr4.expect("has_v4 checked by caller")),
            SocketAddr::new(IpAddr::V4(record.public4.expect("has_v4 checked by caller")), config.public_port),
            config.default_if.clone(),
            None,
        ),
        (Family::V6, Flow::Tun) => (
            IpAddr::V6(config.private_addr6.expect("has_v6 checked by caller")),
            SocketAddr::new(IpAddr::V6(record.private6.expect("has_v6 checked by caller")), config.private_port),
            None,
            config.max_segment_size,
        ),
        (Family::V6, Flow::Notun) => (
            IpAddr::V6(config.public_addr6.expect("has_v6 checked by caller")),
            SocketAddr::new(IpAddr::V6(record.public6.expect("has_v6 checked by caller")), config.public_port),
            config.default_if.clone(),
            None,
        ),
    };

    let file = result_file_path(config, record.port, family, flow);
    let snd_timeout = Duration::from_secs(config.tcp_snd_timeout);
    let rcv_timeout = Duration::from_secs(config.tcp_rcv_timeout);
    let bind_port = config.port;
    let peer_port = record.port;
    let file_for_worker = file.clone();

    let bytes = tokio::task::spawn_blocking(move || {
        run_flow_blocking(bind_ip, bind_port, dest, device.as_deref(), mss, snd_timeout, rcv_timeout, &file_for_worker)
    })
    .await
    .unwrap_or_else(|join_error| {
        warn!(%join_error, "measurement worker panicked");
        Ok(0)
    })
    .unwrap_or_else(|error| {
        warn!(%error, peer_port, ?family, flow = ?flow, "measurement flow ended with an error, short file retained");
        0
    });

    FlowResult {
        peer_port,
        flow: match flow {
            Flow::Tun => "tun",
            Flow::Notun => "notun",
        },
        family,
        bytes,
        file,
    }
}

fn result_file_path(config: &Config, peer_port: u16, family: Family, flow: Flow) -> PathBuf {
    let flow_tag = match flow {
        Flow::Tun => "tun",
        Flow::Notun => "notun",
    };
    let family_tag = match family {
        Family::V4 => "v4",
        Family::V6 => "v6",
    };
    config.cli_dir.join(format!("{peer_port}_{flow_tag}_{family_tag}.dat"))
}

/// The blocking worker body: bind, (optionally) set MSS, connect with
/// `tcp_snd_timeout` standing in for the original's `EINPROGRESS`
/// handling, read to EOF, half-close, chmod. Runs on a blocking-pool
/// thread — spec.md §5 describes this as a genuine suspension point, not
/// a cooperative one.
fn run_flow_blocking(
    bind_ip: IpAddr,
    bind_port: u16,
    dest: SocketAddr,
    device: Option<&str>,
    mss: Option<u32>,
    snd_timeout: Duration,
    rcv_timeout: Duration,
    out_file: &Path,
) -> std::io::Result<u64> {
    let socket = bind_tcp(SocketAddr::new(bind_ip, bind_port), device, Some(snd_timeout), Some(rcv_timeout))?;
    if let Some(mss) = mss {
        set_tcp_maxseg(&socket, mss)?;
    }

    if let Err(error) = socket.connect_timeout(&dest.into(), snd_timeout) {
        debug!(%error, %dest, "measurement connect timed out or failed, producing a short file");
        std::fs::File::create(out_file)?;
        chmod_world_writable(out_file)?;
        return Ok(0);
    }

    let mut stream: std::net::TcpStream = socket.into();
    let mut file = std::fs::File::create(out_file)?;
    let bytes = std::io::copy(&mut stream, &mut file)?;

    let _ = stream.shutdown(Shutdown::Both);
    // Wait for the peer's FIN to be observed; after a full shutdown this
    // reads 0 immediately, matching the original's redundant final recv.
    let mut drain = [0u8; 1];
    let _ = stream.read(&mut drain);

    chmod_world_writable(out_file)?;
    Ok(bytes)
}

fn chmod_world_writable(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o666))
}
