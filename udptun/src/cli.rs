//! The CLI surface (spec.md §6), in the shape of `rust/cli/src/main.rs`'s
//! `clap` derive usage: short letter-flags kept literal since they are
//! part of the external contract, long names added for readability.

use std::path::PathBuf;

use clap::{ArgGroup, Parser};
use measurement::ScheduleMode;

#[derive(Parser, Debug)]
#[command(name = "udptun", author, version, about, long_about = None)]
#[command(group(ArgGroup::new("role").args(["client", "server", "fullmesh"]).required(true)))]
#[command(group(ArgGroup::new("stack").args(["ipv6", "dual_stack"])))]
#[command(group(ArgGroup::new("transport").args(["udp", "raw"])))]
#[command(group(ArgGroup::new("schedule").args(["parallel", "tun_first", "notun_first"])))]
#[command(group(ArgGroup::new("verbosity").args(["verbose", "quiet"])))]
pub struct Cli {
    /// Client mode: originate measurement flows, forward by inner address.
    #[arg(short = 'c', long)]
    pub client: bool,
    /// Server mode: answer measurement flows, forward by inner port.
    #[arg(short = 's', long)]
    pub server: bool,
    /// Fullmesh mode: client and server roles in one process.
    #[arg(short = 'f', long)]
    pub fullmesh: bool,

    /// IPv6-only stack.
    #[arg(short = '6', long)]
    pub ipv6: bool,
    /// Dual-stack (IPv4 + IPv6).
    #[arg(short = '2', long = "dual-stack")]
    pub dual_stack: bool,

    /// Force a UDP outer transport.
    #[arg(short = 'U', long)]
    pub udp: bool,
    /// Force a raw-IP outer transport.
    #[arg(short = 'N', long)]
    pub raw: bool,

    /// PlanetLab host quirks (PPI prefix on the tun side).
    #[arg(short = 'p', long)]
    pub planetlab: bool,
    /// BSD host quirks.
    #[arg(short = 'b', long)]
    pub freebsd: bool,

    /// Run both measurement flows in parallel (default).
    #[arg(short = 'a', long)]
    pub parallel: bool,
    /// Run the tunneled flow to completion before the direct flow.
    #[arg(short = 't', long = "tun-first")]
    pub tun_first: bool,
    /// Run the direct flow to completion before the tunneled flow.
    #[arg(short = 'n', long = "notun-first")]
    pub notun_first: bool,

    /// Destination file (required for client/fullmesh, optional for server).
    #[arg(short = 'd', long = "dest-file")]
    pub dest_file: Option<PathBuf>,
    /// Configuration file.
    #[arg(short = 'o', long = "config", required = true)]
    pub config_file: PathBuf,
    /// Run ID, embedded in the PCAP output filenames.
    #[arg(short = 'i', long = "run-id")]
    pub run_id: Option<String>,

    /// Raw header bytes, as hex (e.g. `deadbeef`), overriding the config file.
    #[arg(short = 'r', long = "raw-header")]
    pub raw_header: Option<String>,
    /// Raw header size in bytes, overriding the config file.
    #[arg(short = 'S', long = "raw-header-size")]
    pub raw_header_size: Option<usize>,
    /// Outer raw IP protocol number, overriding the config file.
    #[arg(short = 'P', long = "protocol-num")]
    pub protocol_num: Option<u8>,

    /// Verbose logging (debug level).
    #[arg(short = 'v', long)]
    pub verbose: bool,
    /// Quiet logging (errors only).
    #[arg(short = 'q', long)]
    pub quiet: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
    Peer,
}

impl Cli {
    pub fn role(&self) -> Role {
        if self.server {
            Role::Server
        } else if self.fullmesh {
            Role::Peer
        } else {
            Role::Client
        }
    }

    pub fn schedule_mode(&self) -> ScheduleMode {
        if self.tun_first {
            ScheduleMode::TunFirst
        } else if self.notun_first {
            ScheduleMode::NotunFirst
        } else {
            ScheduleMode::Parallel
        }
    }

    /// The `EnvFilter` directive implied by `-v`/`-q` (spec.md §6, ground:
    /// `original_source/src/udptun.c`'s `verbose`/`silent` toggling
    /// `debug_print`).
    pub fn log_directive(&self) -> &'static str {
        if self.verbose {
            "debug"
        } else if self.quiet {
            "error"
        } else {
            "info"
        }
    }

    pub fn raw_header_bytes(&self) -> anyhow::Result<Option<Vec<u8>>> {
        let Some(hex) = self.raw_header.as_deref() else {
            return Ok(None);
        };
        let hex = hex.strip_prefix("0x").unwrap_or(hex);
        if hex.len() % 2 != 0 {
            anyhow::bail!("raw header hex string `{hex}` has an odd number of digits");
        }
        let bytes = (0..hex.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&hex[i..i + 2], 16))
            .collect::<Result<Vec<u8>, _>>()
            .map_err(|error| anyhow::anyhow!("invalid raw header hex string `{hex}`: {error}"))?;
        Ok(Some(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_defaults_to_client_when_neither_server_nor_fullmesh_set() {
        let cli = Cli::parse_from(["udptun", "-c", "-o", "udptun.cfg"]);
        assert_eq!(cli.role(), Role::Client);
    }

    #[test]
    fn server_flag_selects_server_role() {
        let cli = Cli::parse_from(["udptun", "-s", "-o", "udptun.cfg"]);
        assert_eq!(cli.role(), Role::Server);
    }

    #[test]
    fn fullmesh_flag_selects_peer_role() {
        let cli = Cli::parse_from(["udptun", "-f", "-o", "udptun.cfg"]);
        assert_eq!(cli.role(), Role::Peer);
    }

    #[test]
    fn schedule_mode_defaults_to_parallel() {
        let cli = Cli::parse_from(["udptun", "-c", "-o", "udptun.cfg"]);
        assert_eq!(cli.schedule_mode(), ScheduleMode::Parallel);
    }

    #[test]
    fn tun_first_flag_selects_tun_first_mode() {
        let cli = Cli::parse_from(["udptun", "-c", "-o", "udptun.cfg", "-t"]);
        assert_eq!(cli.schedule_mode(), ScheduleMode::TunFirst);
    }

    #[test]
    fn raw_header_bytes_parses_hex() {
        let cli = Cli::parse_from(["udptun", "-c", "-o", "udptun.cfg", "-r", "deadbeef"]);
        assert_eq!(cli.raw_header_bytes().unwrap(), Some(vec![0xde, 0xad, 0xbe, 0xef]));
    }

    #[test]
    fn mutually_exclusive_role_flags_are_rejected() {
        let result = Cli::try_parse_from(["udptun", "-c", "-s", "-o", "udptun.cfg"]);
        assert!(result.is_err());
    }
}
