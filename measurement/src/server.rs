//! The measurement server (C6): one listener on the private address
//! (reached only via tun on the peer side) and one on the public address,
//! per active family, each streaming `serv_file` to every connection.
//!
//! Grounded on `original_source/src/net.c`'s `tcp_serv`/`serv_worker_thread`:
//! `SO_REUSEADDR` always, `TCP_MAXSEG` on the private listener only,
//! `backlog_size` as the listen backlog, one worker per accepted socket
//! that is a leaf — it never touches the directory or forwarding state.

use std::io::{Read, Write};
use std::net::{IpAddr, Shutdown, SocketAddr, TcpListener, TcpStream};
use std::path::PathBuf;

use tracing::{debug, error, info, warn};
use udptun_config::Config;

use crate::socket::{bind_tcp, set_tcp_maxseg};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Listener {
    Private,
    Public,
}

/// Spawns every active listener (up to four: private/public × v4/v6) as a
/// blocking accept loop on its own thread, and returns immediately; the
/// listeners run for the remainder of the process's life, torn down with
/// the rest of the process rather than through the lifecycle registry
/// (they hold no fd the forwarding engine or scheduler ever touches).
pub fn spawn_listeners(config: &Config) -> std::io::Result<()> {
    let mut any = false;

    if let Some(addr) = config.private_addr4 {
        spawn_listener(config, Listener::Private, IpAddr::V4(addr), config.private_port)?;
        any = true;
    }
    if let Some(addr) = config.private_addr6 {
        spawn_listener(config, Listener::Private, IpAddr::V6(addr), config.private_port)?;
        any = true;
    }
    if let Some(addr) = config.public_addr4 {
        spawn_listener(config, Listener::Public, IpAddr::V4(addr), config.public_port)?;
        any = true;
    }
    if let Some(addr) = config.public_addr6 {
        spawn_listener(config, Listener::Public, IpAddr::V6(addr), config.public_port)?;
        any = true;
    }

    if !any {
        warn!("measurement server started with no private or public address configured");
    }
    Ok(())
}

fn spawn_listener(config: &Config, kind: Listener, addr: IpAddr, port: u16) -> std::io::Result<()> {
    let bind_addr = SocketAddr::new(addr, port);
    let socket = bind_tcp(bind_addr, None, None, None)?;
    if kind == Listener::Private {
        if let Some(mss) = config.max_segment_size {
            set_tcp_maxseg(&socket, mss)?;
        }
    }
    socket.listen(config.backlog_size as i32)?;
    let listener: TcpListener = socket.into();

    info!(?kind, %bind_addr, "measurement server listener ready");

    let serv_file = config.serv_file.clone();
    let buf_length = config.buf_length;
    std::thread::spawn(move || accept_loop(listener, serv_file, buf_length));

    Ok(())
}

fn accept_loop(listener: TcpListener, serv_file: PathBuf, buf_length: usize) {
    loop {
        let (stream, peer_addr) = match listener.accept() {
            Ok(pair) => pair,
            Err(error) => {
                error!(%error, "measurement server accept failed");
                return;
            }
        };
        debug!(%peer_addr, "measurement server accepted connection");

        let serv_file = serv_file.clone();
        std::thread::spawn(move || serve_one(stream, &serv_file, buf_length));
    }
}

/// A leaf worker: stream `serv_file` in `buf_length` chunks, then
/// half-close. Never touches the directory or forwarding engine.
fn serve_one(mut stream: TcpStream, serv_file: &std::path::Path, buf_length: usize) {
    let mut file = match std::fs::File::open(serv_file) {
        Ok(file) => file,
        Err(error) => {
            error!(%error, path = %serv_file.display(), "measurement server failed to open serv_file");
            return;
        }
    };

    let mut buf = vec![0u8; buf_length.max(1)];
    loop {
        let n = match file.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(error) => {
                error!(%error, "measurement server read from serv_file failed");
                break;
            }
        };
        if let Err(error) = stream.write_all(&buf[..n]) {
            warn!(%error, "measurement server send failed");
            break;
        }
    }

    let _ = stream.shutdown(Shutdown::Both);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn serve_one_streams_file_contents_then_half_closes() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(b"hello measurement server").unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let path = tmp.path().to_path_buf();
        let handle = std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            serve_one(stream, &path, 8);
        });

        let mut client = TcpStream::connect(addr).unwrap();
        let mut received = Vec::new();
        client.read_to_end(&mut received).unwrap();

        handle.join().unwrap();
        assert_eq!(received, b"hello measurement server");
    }
}
