//! The static peer directory: the flat destination-file table and the four
//! indices built over it.

use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use udptun_config::Config;

#[derive(thiserror::Error, Debug)]
pub enum DirectoryError {
    #[error("failed to read destination file {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("destination file {path} line {line}: malformed row `{row}`")]
    MalformedRow {
        path: PathBuf,
        line: usize,
        row: String,
    },
    #[error("destination file {path} line {line}: duplicate unique port {port}")]
    DuplicatePort {
        path: PathBuf,
        line: usize,
        port: u16,
    },
}

/// Per-remote-peer identity: a unique source port and the public/private
/// addresses reachable in each configured stack. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    pub port: u16,
    pub public4: Option<Ipv4Addr>,
    pub private4: Option<Ipv4Addr>,
    pub public6: Option<Ipv6Addr>,
    pub private6: Option<Ipv6Addr>,
}

impl PeerRecord {
    /// The peer's public v4 socket address, using the configured global
    /// `public_port` (every peer listens on the same outer port).
    pub fn public4_addr(&self, public_port: u16) -> Option<SocketAddrV4> {
        self.public4.map(|addr| SocketAddrV4::new(addr, public_port))
    }

    pub fn public6_addr(&self, public_port: u16) -> Option<SocketAddrV6> {
        self.public6
            .map(|addr| SocketAddrV6::new(addr, public_port, 0, 0))
    }
}

/// A `by_sport` index bounded by `fd_lim`: the static directory pre-seeds it
/// at load; Server and Peer roles extend it dynamically up to the limit.
#[derive(Debug, Default)]
pub struct DynamicPortTable {
    table: HashMap<u16, Arc<PeerRecord>>,
    static_len: usize,
    fd_lim: usize,
}

impl DynamicPortTable {
    fn new(fd_lim: usize) -> Self {
        DynamicPortTable {
            table: HashMap::new(),
            static_len: 0,
            fd_lim,
        }
    }

    fn seed(&mut self, port: u16, record: Arc<PeerRecord>) {
        self.table.insert(port, record);
        self.static_len = self.table.len();
    }

    pub fn get(&self, port: u16) -> Option<&Arc<PeerRecord>> {
        self.table.get(&port)
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Records a peer discovered dynamically from an inbound packet's
    /// source port, subject to the `fd_lim` cap. Returns `false` (and does
    /// not insert) once the table has reached capacity and the port isn't
    /// already present.
    pub fn admit_dynamic(&mut self, port: u16, record: Arc<PeerRecord>) -> bool {
        if self.table.contains_key(&port) {
            self.table.insert(port, record);
            return true;
        }

        if self.table.len() >= self.fd_lim.max(self.static_len) {
            return false;
        }

        self.table.insert(port, record);
        true
    }
}

/// The loaded peer directory. `by_priv4`/`by_priv6` serve egress lookups
/// (client/peer path), `by_sport` serves ingress demux (server/peer path),
/// `list` is iteration order for the measurement scheduler.
#[derive(Debug)]
pub struct Directory {
    pub by_priv4: HashMap<Ipv4Addr, Arc<PeerRecord>>,
    pub by_priv6: HashMap<Ipv6Addr, Arc<PeerRecord>>,
    pub by_sport: DynamicPortTable,
    pub list: Vec<Arc<PeerRecord>>,
}

enum Row {
    Single {
        port: u16,
        public4: Ipv4Addr,
        private4: Ipv4Addr,
    },
    Dual {
        port: u16,
        public4: Ipv4Addr,
        private4: Ipv4Addr,
        public6: Ipv6Addr,
        private6: Ipv6Addr,
    },
}

fn parse_row(path: &Path, line_no: usize, raw: &str) -> Result<Option<Row>, DirectoryError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return Ok(None);
    }

    let malformed = || DirectoryError::MalformedRow {
        path: path.to_path_buf(),
        line: line_no,
        row: raw.to_string(),
    };

    let tokens: Vec<&str> = trimmed.split_whitespace().collect();

    match tokens.as_slice() {
        [port, public4, private4] => {
            let port = port.parse().map_err(|_| malformed())?;
            let public4 = public4.parse().map_err(|_| malformed())?;
            let private4 = private4.parse().map_err(|_| malformed())?;
            Ok(Some(Row::Single {
                port,
                public4,
                private4,
            }))
        }
        [port, public4, private4, public6, private6] => {
            let port = port.parse().map_err(|_| malformed())?;
            let public4 = public4.parse().map_err(|_| malformed())?;
            let private4 = private4.parse().map_err(|_| malformed())?;
            let public6 = public6.parse().map_err(|_| malformed())?;
            let private6 = private6.parse().map_err(|_| malformed())?;
            Ok(Some(Row::Dual {
                port,
                public4,
                private4,
                public6,
                private6,
            }))
        }
        _ => Err(malformed()),
    }
}

/// Loads the destination file into a [`Directory`]. Each row is either
/// 3 columns (single-stack: `port public4 private4`) or 5 columns
/// (dual-stack, with a v6 pair appended); the column count is detected
/// per-row, so a single file may mix single- and dual-stack peers.
pub fn load(path: impl AsRef<Path>, config: &Config) -> Result<Directory, DirectoryError> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path).map_err(|source| DirectoryError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    let mut by_priv4 = HashMap::new();
    let mut by_priv6 = HashMap::new();
    let mut by_sport = DynamicPortTable::new(config.fd_lim);
    let mut list = Vec::new();

    for (idx, raw_line) in contents.lines().enumerate() {
        let line_no = idx + 1;
        let Some(row) = parse_row(path, line_no, raw_line)? else {
            continue;
        };

        let record = Arc::new(match row {
            Row::Single {
                port,
                public4,
                private4,
            } => PeerRecord {
                port,
                public4: Some(public4),
                private4: Some(private4),
                public6: None,
                private6: None,
            },
            Row::Dual {
                port,
                public4,
                private4,
                public6,
                private6,
            } => PeerRecord {
                port,
                public4: Some(public4),
                private4: Some(private4),
                public6: Some(public6),
                private6: Some(private6),
            },
        });

        if by_sport.get(record.port).is_some() {
            return Err(DirectoryError::DuplicatePort {
                path: path.to_path_buf(),
                line: line_no,
                port: record.port,
            });
        }

        if let Some(addr4) = record.private4 {
            by_priv4.insert(addr4, record.clone());
        }
        if let Some(addr6) = record.private6 {
            by_priv6.insert(addr6, record.clone());
        }
        by_sport.seed(record.port, record.clone());
        list.push(record);
    }

    Ok(Directory {
        by_priv4,
        by_priv6,
        by_sport,
        list,
    })
}

impl Directory {
    /// An empty directory, for roles run without a destination file (the
    /// Server role doesn't require one — `original_source/src/udptun.c`'s
    /// `validate_args` only requires `dest_file` for Client/Fullmesh).
    /// Dynamic `by_sport` admission still obeys `config.fd_lim`.
    pub fn empty(config: &Config) -> Directory {
        Directory {
            by_priv4: HashMap::new(),
            by_priv6: HashMap::new(),
            by_sport: DynamicPortTable::new(config.fd_lim),
            list: Vec::new(),
        }
    }
}

/// Builds the full public socket address (v4 or v6) for a peer given the
/// outer family, using the configured global `public_port`.
pub fn public_socket_addr(record: &PeerRecord, public_port: u16, want_v6: bool) -> Option<SocketAddr> {
    if want_v6 {
        record.public6_addr(public_port).map(SocketAddr::V6)
    } else {
        record.public4_addr(public_port).map(SocketAddr::V4)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().expect("create temp file");
        file.write_all(contents.as_bytes()).expect("write");
        file
    }

    #[test]
    fn loads_single_stack_rows() {
        let file = write_temp("34501 203.0.113.7 10.0.0.2\n");
        let config = Config {
            fd_lim: 8,
            ..Config::default()
        };

        let directory = load(file.path(), &config).expect("load");

        assert_eq!(directory.list.len(), 1);
        assert!(directory.by_priv4.contains_key(&"10.0.0.2".parse().unwrap()));
        assert_eq!(directory.by_sport.get(34501).unwrap().port, 34501);
    }

    #[test]
    fn loads_dual_stack_rows() {
        let file = write_temp("34501 203.0.113.7 10.0.0.2 2001:db8::7 2001:db8::2\n");
        let config = Config::default();

        let directory = load(file.path(), &config).expect("load");

        let record = &directory.list[0];
        assert_eq!(record.public6, Some("2001:db8::7".parse().unwrap()));
        assert!(directory.by_priv6.contains_key(&"2001:db8::2".parse().unwrap()));
    }

    #[test]
    fn mixed_single_and_dual_rows_in_one_file() {
        let file = write_temp(
            "1 1.1.1.1 10.0.0.1\n\
             2 2.2.2.2 10.0.0.2 2001:db8::2 2001:db8::102\n",
        );
        let config = Config::default();

        let directory = load(file.path(), &config).expect("load");

        assert_eq!(directory.list.len(), 2);
        assert!(directory.list[0].public6.is_none());
        assert!(directory.list[1].public6.is_some());
    }

    #[test]
    fn rejects_duplicate_unique_port() {
        let file = write_temp("1 1.1.1.1 10.0.0.1\n1 2.2.2.2 10.0.0.2\n");
        let config = Config::default();

        let err = load(file.path(), &config).unwrap_err();

        assert!(matches!(err, DirectoryError::DuplicatePort { port: 1, .. }));
    }

    #[test]
    fn rejects_malformed_row() {
        let file = write_temp("not-a-port 1.1.1.1 10.0.0.1\n");
        let config = Config::default();

        let err = load(file.path(), &config).unwrap_err();

        assert!(matches!(err, DirectoryError::MalformedRow { .. }));
    }

    #[test]
    fn skips_comments_and_blank_lines() {
        let file = write_temp("# comment\n\n1 1.1.1.1 10.0.0.1\n");
        let config = Config::default();

        let directory = load(file.path(), &config).expect("load");

        assert_eq!(directory.list.len(), 1);
    }

    #[test]
    fn dynamic_admission_bounded_by_fd_lim() {
        let mut table = DynamicPortTable::new(2);
        let record = |port: u16| {
            Arc::new(PeerRecord {
                port,
                public4: None,
                private4: None,
                public6: None,
                private6: None,
            })
        };

        assert!(table.admit_dynamic(1, record(1)));
        assert!(table.admit_dynamic(2, record(2)));
        assert!(!table.admit_dynamic(3, record(3)), "third admission exceeds fd_lim");
        assert_eq!(table.len(), 2);
    }
}
