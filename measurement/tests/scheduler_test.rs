//! Scenario-level tests driving the real scheduler against loopback TCP
//! listeners standing in for a peer's tunneled and direct measurement
//! servers (S6-style: parallel mode, result files land in `cli_dir`).

use std::io::Write;
use std::net::{Ipv4Addr, TcpListener};
use std::sync::Arc;

use directory::PeerRecord;
use lifecycle::Barrier;
use measurement::{run_scheduler, ScheduleMode};
use udptun_config::Config;

fn spawn_echo_server(payload: &'static [u8]) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    std::thread::spawn(move || {
        if let Ok((mut stream, _)) = listener.accept() {
            let _ = stream.write_all(payload);
            let _ = stream.shutdown(std::net::Shutdown::Write);
        }
    });
    port
}

#[tokio::test]
async fn scheduler_writes_one_result_file_per_flow_in_parallel_mode() {
    let private_port = spawn_echo_server(b"tunneled flow payload");
    let public_port = spawn_echo_server(b"direct flow payload");

    let tmp_dir = tempfile::tempdir().unwrap();

    let config = Config {
        private_addr4: Some(Ipv4Addr::new(127, 0, 0, 1)),
        public_addr4: Some(Ipv4Addr::new(127, 0, 0, 2)),
        private_port,
        public_port,
        port: 0,
        cli_dir: tmp_dir.path().to_path_buf(),
        tcp_snd_timeout: 2,
        tcp_rcv_timeout: 2,
        ..Config::default()
    };

    let record = Arc::new(PeerRecord {
        port: 1,
        public4: Some(Ipv4Addr::new(127, 0, 0, 1)),
        private4: Some(Ipv4Addr::new(127, 0, 0, 1)),
        public6: None,
        private6: None,
    });
    let peers = vec![record];

    let barrier = Barrier::new(1);
    let results = run_scheduler(&config, &peers, ScheduleMode::Parallel, &barrier).await;

    assert_eq!(results.len(), 2);
    let tun_bytes = std::fs::read(tmp_dir.path().join("1_tun_v4.dat")).unwrap();
    let notun_bytes = std::fs::read(tmp_dir.path().join("1_notun_v4.dat")).unwrap();
    assert_eq!(tun_bytes, b"tunneled flow payload");
    assert_eq!(notun_bytes, b"direct flow payload");
}
