//! The packet-capture sink: out of scope per the design (§1) as a
//! collaborator, but realized here with a real `AF_PACKET` capture socket and
//! `pcap-file` writer so the measurement flows have somewhere to land.
//! BPF filter construction is likewise out of scope — callers hand in
//! already-compiled classic-BPF instructions as opaque bytes (§1, item d).

use std::ffi::CString;
use std::fs::File;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use pcap_file::pcap::{PcapHeader, PcapPacket, PcapWriter};
use pcap_file::DataLink;
use tokio::io::unix::AsyncFd;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

#[derive(thiserror::Error, Debug)]
pub enum CaptureError {
    #[error("failed to resolve interface index for {iface}")]
    NoSuchInterface { iface: String, source: std::io::Error },
    #[error("failed to open AF_PACKET capture socket")]
    SocketOpen(#[source] std::io::Error),
    #[error("failed to bind capture socket to {iface}")]
    Bind { iface: String, source: std::io::Error },
    #[error("failed to attach BPF filter")]
    AttachFilter(#[source] std::io::Error),
    #[error("failed to create pcap output file {path}")]
    CreateFile { path: PathBuf, source: std::io::Error },
    #[error("failed to write pcap header")]
    WriteHeader(#[source] std::io::Error),
}

/// One compiled classic-BPF instruction (`struct sock_filter`): opaque to
/// this crate, produced by the out-of-scope BPF-construction collaborator.
#[derive(Debug, Clone, Copy)]
pub struct BpfInsn {
    pub code: u16,
    pub jt: u8,
    pub jf: u8,
    pub k: u32,
}

/// A started capture: reads frames off an `AF_PACKET` socket bound to
/// `iface` and dumps them to a PCAP file until [`CaptureHandle::stop`] is
/// called or the handle is dropped.
pub struct CaptureHandle {
    stop_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl CaptureHandle {
    /// Opens the capture socket, attaches `filter` (empty = capture
    /// everything), and begins writing frames to `out_path` with `snaplen`
    /// truncation. By the time this returns, the socket is bound and the
    /// pcap file's global header is on disk — the capture is "armed" in the
    /// same sense as the original's `pcap_open_live` + `pcap_setfilter` +
    /// `pcap_dump_open` sequence, which runs before the synchronization
    /// barrier releases traffic-generating threads.
    pub fn start(
        iface: &str,
        filter: &[BpfInsn],
        snaplen: u32,
        datalink: DataLink,
        out_path: impl AsRef<Path>,
    ) -> Result<Self, CaptureError> {
        let fd = open_capture_socket(iface, filter, snaplen)?;

        let out_path = out_path.as_ref().to_path_buf();
        let file = File::create(&out_path).map_err(|source| CaptureError::CreateFile {
            path: out_path.clone(),
            source,
        })?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = std::fs::set_permissions(&out_path, std::fs::Permissions::from_mode(0o666));
        }

        let header = PcapHeader {
            version_major: 2,
            version_minor: 4,
            ts_correction: 0,
            ts_accuracy: 0,
            snaplen,
            datalink,
        };
        let writer = PcapWriter::with_header(file, header).map_err(CaptureError::WriteHeader)?;

        let (stop_tx, stop_rx) = oneshot::channel();
        let task = tokio::spawn(capture_loop(fd, snaplen, writer, stop_rx));

        Ok(CaptureHandle {
            stop_tx: Some(stop_tx),
            task: Some(task),
        })
    }

    /// Signals the capture loop to stop and waits for the pcap file to be
    /// flushed.
    pub async fn stop(mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Closes the underlying fd on drop; `AsyncFd<RawFd>` alone does not.
struct RawSocket(AsyncFd<RawFd>);

impl Drop for RawSocket {
    fn drop(&mut self) {
        // SAFETY: this socket is never shared or used after this point.
        unsafe {
            libc::close(self.0.as_raw_fd());
        }
    }
}

async fn capture_loop(
    fd: RawSocket,
    snaplen: u32,
    mut writer: PcapWriter<File>,
    mut stop_rx: oneshot::Receiver<()>,
) {
    let fd = &fd.0;
    let mut buf = vec![0u8; snaplen.max(1) as usize];

    loop {
        tokio::select! {
            biased;

            _ = &mut stop_rx => {
                tracing::debug!("capture sink stopping");
                return;
            }
            ready = fd.readable() => {
                let mut guard = match ready {
                    Ok(guard) => guard,
                    Err(error) => {
                        tracing::warn!(%error, "capture socket readiness error");
                        return;
                    }
                };

                let result = guard.try_io(|inner| {
                    let raw = *inner.get_ref();
                    // SAFETY: `raw` stays valid for the lifetime of `fd`.
                    let n = unsafe { libc::recv(raw, buf.as_mut_ptr().cast(), buf.len(), 0) };
                    if n < 0 {
                        Err(std::io::Error::last_os_error())
                    } else {
                        Ok(n as usize)
                    }
                });

                let Ok(read_result) = result else { continue };
                match read_result {
                    Ok(n) if n > 0 => {
                        let timestamp = SystemTime::now()
                            .duration_since(UNIX_EPOCH)
                            .unwrap_or_default();
                        let packet = PcapPacket::new(timestamp, n as u32, &buf[..n]);
                        if let Err(error) = writer.write_packet(&packet) {
                            tracing::warn!(%error, "failed to write pcap frame");
                        }
                    }
                    Ok(_) => {}
                    Err(error) => tracing::warn!(%error, "capture socket read error"),
                }
            }
        }
    }
}

fn open_capture_socket(
    iface: &str,
    filter: &[BpfInsn],
    _snaplen: u32,
) -> Result<RawSocket, CaptureError> {
    const ETH_P_ALL: u16 = 0x0003;

    // SAFETY: simple libc socket() call with constant arguments.
    let raw_fd = unsafe {
        libc::socket(
            libc::AF_PACKET,
            libc::SOCK_RAW,
            i32::from(ETH_P_ALL.to_be()),
        )
    };
    if raw_fd < 0 {
        return Err(CaptureError::SocketOpen(std::io::Error::last_os_error()));
    }
    // SAFETY: `raw_fd` was just returned by `socket` and is owned here.
    let owned: OwnedFd = unsafe { OwnedFd::from_raw_fd(raw_fd) };

    let ifindex = interface_index(iface).map_err(|source| CaptureError::NoSuchInterface {
        iface: iface.to_string(),
        source,
    })?;

    let mut addr: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
    addr.sll_family = libc::AF_PACKET as u16;
    addr.sll_protocol = ETH_P_ALL.to_be();
    addr.sll_ifindex = ifindex;

    // SAFETY: `addr` is a valid, fully-initialized `sockaddr_ll`.
    let rc = unsafe {
        libc::bind(
            owned.as_raw_fd(),
            std::ptr::addr_of!(addr).cast(),
            std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(CaptureError::Bind {
            iface: iface.to_string(),
            source: std::io::Error::last_os_error(),
        });
    }

    if !filter.is_empty() {
        attach_filter(owned.as_raw_fd(), filter)?;
    }

    set_non_blocking(owned.as_raw_fd()).map_err(CaptureError::SocketOpen)?;

    let raw = owned.as_raw_fd();
    std::mem::forget(owned); // ownership now lives inside `RawSocket`
    AsyncFd::new(raw).map(RawSocket).map_err(CaptureError::SocketOpen)
}

fn attach_filter(fd: RawFd, filter: &[BpfInsn]) -> Result<(), CaptureError> {
    let mut raw_insns: Vec<libc::sock_filter> = filter
        .iter()
        .map(|insn| libc::sock_filter {
            code: insn.code,
            jt: insn.jt,
            jf: insn.jf,
            k: insn.k,
        })
        .collect();

    let prog = libc::sock_fprog {
        len: raw_insns.len() as u16,
        filter: raw_insns.as_mut_ptr(),
    };

    // SAFETY: `prog` points at `raw_insns`, which outlives this call.
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ATTACH_FILTER,
            std::ptr::addr_of!(prog).cast(),
            std::mem::size_of::<libc::sock_fprog>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(CaptureError::AttachFilter(std::io::Error::last_os_error()));
    }
    Ok(())
}

fn interface_index(iface: &str) -> std::io::Result<i32> {
    let name = CString::new(iface).map_err(std::io::Error::other)?;
    // SAFETY: `name` is a valid NUL-terminated string.
    let idx = unsafe { libc::if_nametoindex(name.as_ptr()) };
    if idx == 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(idx as i32)
}

fn set_non_blocking(fd: RawFd) -> std::io::Result<()> {
    // SAFETY: `fd` is a valid, open descriptor.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(std::io::Error::last_os_error());
    }
    // SAFETY: as above.
    let rc = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if rc < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bpf_insn_maps_onto_sock_filter_layout() {
        let insn = BpfInsn {
            code: 0x06,
            jt: 0,
            jf: 0,
            k: 0xffff,
        };
        let raw = libc::sock_filter {
            code: insn.code,
            jt: insn.jt,
            jf: insn.jf,
            k: insn.k,
        };
        assert_eq!(raw.code, 0x06);
        assert_eq!(raw.k, 0xffff);
    }

    #[test]
    fn unknown_interface_is_reported_as_capture_error() {
        let err = interface_index("definitely-not-a-real-iface-xyz").unwrap_err();
        assert!(err.raw_os_error().is_some());
    }
}
