//! The tun-allocation collaborator: an opaque, file-like handle that accepts
//! and yields whole IP packets. Out of scope per the design (§1); this crate
//! exists only to give the forwarding engine a narrow, testable contract to
//! depend on.

use std::io;

/// A bidirectional packet pipe to the kernel's tun device. Implementations
/// own the underlying file descriptor; the forwarding engine never reaches
/// past this trait.
pub trait Tun: Send + Sync {
    /// Reads one packet into `buf`, returning the number of bytes written.
    /// Cancel-safe: callers may drop the future without losing packets
    /// already queued in the kernel.
    fn recv<'a>(
        &'a self,
        buf: &'a mut [u8],
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = io::Result<usize>> + Send + 'a>>;

    /// Writes one whole packet.
    fn send<'a>(
        &'a self,
        packet: &'a [u8],
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = io::Result<()>> + Send + 'a>>;

    fn name(&self) -> &str;
}

#[cfg(target_os = "linux")]
pub use linux::LinuxTun;

#[cfg(target_os = "linux")]
mod linux {
    use super::Tun;
    use std::ffi::CStr;
    use std::io;
    use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
    use tokio::io::unix::AsyncFd;

    const TUNSETIFF: libc::c_ulong = 0x4004_54ca;
    const TUN_FILE: &CStr = c"/dev/net/tun";

    #[repr(C)]
    struct IfReq {
        name: [u8; libc::IFNAMSIZ],
        flags: libc::c_short,
        _pad: [u8; 22],
    }

    /// A Linux `/dev/net/tun` handle opened in `IFF_TUN | IFF_NO_PI` mode:
    /// the kernel hands us whole IP packets with no link-layer framing, so
    /// packet-shaper's own PPI handling (§4.2) is the only framing concern
    /// left to the core.
    pub struct LinuxTun {
        fd: AsyncFd<RawFd>,
        // Keeps the descriptor's ownership tied to this struct so it closes
        // exactly once, on drop.
        _owned: OwnedFd,
        name: String,
    }

    impl LinuxTun {
        /// Opens (or creates, if `requested_name` names a fresh interface)
        /// a tun device. `None` lets the kernel pick a name (`tunN`).
        pub fn new(requested_name: Option<&str>) -> io::Result<Self> {
            // SAFETY: `TUN_FILE` is a valid NUL-terminated path.
            let raw_fd = unsafe { libc::open(TUN_FILE.as_ptr(), libc::O_RDWR) };
            if raw_fd < 0 {
                return Err(io::Error::last_os_error());
            }
            // SAFETY: `raw_fd` was just returned by `open` and is owned here.
            let owned = unsafe { OwnedFd::from_raw_fd(raw_fd) };

            let mut ifr = IfReq {
                name: [0u8; libc::IFNAMSIZ],
                flags: (libc::IFF_TUN | libc::IFF_NO_PI) as libc::c_short,
                _pad: [0u8; 22],
            };
            if let Some(requested) = requested_name {
                let bytes = requested.as_bytes();
                let len = bytes.len().min(libc::IFNAMSIZ - 1);
                ifr.name[..len].copy_from_slice(&bytes[..len]);
            }

            // SAFETY: `ifr` is a valid `ifreq`-shaped buffer for the
            // duration of the call; the fd is open and owned above.
            let rc = unsafe { libc::ioctl(owned.as_raw_fd(), TUNSETIFF, std::ptr::addr_of_mut!(ifr)) };
            if rc < 0 {
                return Err(io::Error::last_os_error());
            }

            set_non_blocking(owned.as_raw_fd())?;

            let name_len = ifr.name.iter().position(|&b| b == 0).unwrap_or(0);
            let name = String::from_utf8_lossy(&ifr.name[..name_len]).into_owned();

            Ok(LinuxTun {
                fd: AsyncFd::new(owned.as_raw_fd())?,
                _owned: owned,
                name,
            })
        }
    }

    fn set_non_blocking(fd: RawFd) -> io::Result<()> {
        // SAFETY: `fd` is a valid, open descriptor.
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: as above.
        let rc = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    impl Tun for LinuxTun {
        fn recv<'a>(
            &'a self,
            buf: &'a mut [u8],
        ) -> std::pin::Pin<Box<dyn std::future::Future<Output = io::Result<usize>> + Send + 'a>>
        {
            Box::pin(async move {
                loop {
                    let mut guard = self.fd.readable().await?;
                    // SAFETY: `fd` stays valid for the lifetime of `self`.
                    match guard.try_io(|inner| {
                        let raw = *inner.get_ref();
                        let n = unsafe {
                            libc::read(raw, buf.as_mut_ptr().cast(), buf.len())
                        };
                        if n < 0 {
                            Err(io::Error::last_os_error())
                        } else {
                            Ok(n as usize)
                        }
                    }) {
                        Ok(result) => return result,
                        Err(_would_block) => continue,
                    }
                }
            })
        }

        fn send<'a>(
            &'a self,
            packet: &'a [u8],
        ) -> std::pin::Pin<Box<dyn std::future::Future<Output = io::Result<()>> + Send + 'a>>
        {
            Box::pin(async move {
                loop {
                    let mut guard = self.fd.writable().await?;
                    match guard.try_io(|inner| {
                        let raw = *inner.get_ref();
                        // SAFETY: `fd` stays valid for the lifetime of `self`.
                        let n = unsafe {
                            libc::write(raw, packet.as_ptr().cast(), packet.len())
                        };
                        if n < 0 {
                            Err(io::Error::last_os_error())
                        } else {
                            Ok(n as usize)
                        }
                    }) {
                        Ok(Ok(n)) if n == packet.len() => return Ok(()),
                        Ok(Ok(_short_write)) => {
                            return Err(io::Error::other("short write to tun device"))
                        }
                        Ok(Err(e)) => return Err(e),
                        Err(_would_block) => continue,
                    }
                }
            })
        }

        fn name(&self) -> &str {
            &self.name
        }
    }
}

/// A fake, in-memory [`Tun`] driven by channels, used to exercise the
/// forwarding engine without a real kernel device (ground: teacher's
/// `bin-shared/tests/no_packet_loops_udp.rs` style of testing the real
/// forwarding code against a substitute transport).
pub mod fake {
    use super::Tun;
    use std::io;
    use tokio::sync::mpsc;

    pub struct FakeTun {
        pub inbound: tokio::sync::Mutex<mpsc::Receiver<Vec<u8>>>,
        pub outbound: mpsc::UnboundedSender<Vec<u8>>,
        pub name: String,
    }

    impl FakeTun {
        /// Returns the fake tun plus the handles a test uses to push
        /// packets "from the kernel" and observe packets "written to the
        /// kernel".
        pub fn new() -> (Self, mpsc::Sender<Vec<u8>>, mpsc::UnboundedReceiver<Vec<u8>>) {
            let (inbound_tx, inbound_rx) = mpsc::channel(1024);
            let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

            (
                FakeTun {
                    inbound: tokio::sync::Mutex::new(inbound_rx),
                    outbound: outbound_tx,
                    name: "faketun0".to_string(),
                },
                inbound_tx,
                outbound_rx,
            )
        }
    }

    impl Tun for FakeTun {
        fn recv<'a>(
            &'a self,
            buf: &'a mut [u8],
        ) -> std::pin::Pin<Box<dyn std::future::Future<Output = io::Result<usize>> + Send + 'a>>
        {
            Box::pin(async move {
                let mut guard = self.inbound.lock().await;
                match guard.recv().await {
                    Some(packet) => {
                        let n = packet.len().min(buf.len());
                        buf[..n].copy_from_slice(&packet[..n]);
                        Ok(n)
                    }
                    None => Err(io::Error::other("fake tun inbound channel closed")),
                }
            })
        }

        fn send<'a>(
            &'a self,
            packet: &'a [u8],
        ) -> std::pin::Pin<Box<dyn std::future::Future<Output = io::Result<()>> + Send + 'a>>
        {
            Box::pin(async move {
                self.outbound
                    .send(packet.to_vec())
                    .map_err(|_| io::Error::other("fake tun outbound channel closed"))
            })
        }

        fn name(&self) -> &str {
            &self.name
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fake::FakeTun;
    use super::Tun;

    #[tokio::test]
    async fn fake_tun_round_trips_a_packet() {
        let (tun, inbound_tx, mut outbound_rx) = FakeTun::new();

        inbound_tx.send(vec![1, 2, 3]).await.unwrap();
        let mut buf = [0u8; 16];
        let n = tun.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], &[1, 2, 3]);

        tun.send(&[9, 9]).await.unwrap();
        assert_eq!(outbound_rx.recv().await, Some(vec![9, 9]));
    }
}
