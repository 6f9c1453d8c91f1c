use clap::{Parser, Subcommand};
use std::{net::Ipv4Addr, ops::RangeInclusive, path::PathBuf};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to the JSON protocol/controller config; defaults apply if omitted
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Path to save triggered captures
    #[arg(long, default_value = ".")]
    pub capture_path: PathBuf,
    /// Path to the sqlite event database
    #[arg(long, default_value = "softsync.db")]
    pub db_path: PathBuf,
    /// CPU cores to which we'll pin tasks; threads cycle over the range
    #[arg(long, default_value = "0:3", value_parser = parse_core_range)]
    pub core_range: RangeInclusive<usize>,
    /// Port to respond to prometheus requests for metrics
    #[arg(long, default_value_t = 8083)]
    #[clap(value_parser = clap::value_parser!(u16).range(1..))]
    pub metrics_port: u16,
    /// Override the config's UDP RPC port
    #[arg(long)]
    #[clap(value_parser = clap::value_parser!(u16).range(1..))]
    pub rpc_port: Option<u16>,
    /// Role this device plays on the rig
    #[command(subcommand)]
    pub role: Role,
}

#[derive(Debug, Subcommand)]
pub enum Role {
    /// Coordinate the rig: track clients, negotiate offsets, fan out captures
    Leader,
    /// Follow a leader discovered on the local subnet
    Client {
        /// Identity advertised in heartbeats
        #[arg(long, default_value = "cam-0")]
        client_id: String,
        /// Override the subnet broadcast address derived from the local
        /// interface (used until the leader's address is latched)
        #[arg(long)]
        broadcast: Option<Ipv4Addr>,
    },
}

pub fn parse_core_range(input: &str) -> Result<RangeInclusive<usize>, String> {
    let (start, stop) = input
        .split_once(':')
        .ok_or_else(|| "Expected a start:stop core range".to_owned())?;
    let start: usize = start.parse().map_err(|_| "Invalid start core".to_owned())?;
    let stop: usize = stop.parse().map_err(|_| "Invalid stop core".to_owned())?;
    if stop < start {
        return Err("Invalid CPU range".to_owned());
    }
    Ok(start..=stop)
}

#[cfg(test)]
pub mod tests {
    use super::*;

    #[test]
    fn core_range_parses() {
        assert_eq!(parse_core_range("0:3").unwrap(), 0..=3);
        assert_eq!(parse_core_range("2:2").unwrap(), 2..=2);
        assert!(parse_core_range("3:1").is_err());
        assert!(parse_core_range("0-3").is_err());
        assert!(parse_core_range("x:y").is_err());
    }

    #[test]
    fn cli_parses_both_roles() {
        let cli = Cli::try_parse_from(["softsync", "leader"]).unwrap();
        assert!(matches!(cli.role, Role::Leader));
        let cli = Cli::try_parse_from([
            "softsync",
            "--rpc-port",
            "50123",
            "client",
            "--client-id",
            "cam-7",
        ])
        .unwrap();
        assert_eq!(cli.rpc_port, Some(50_123));
        match cli.role {
            Role::Client { client_id, .. } => assert_eq!(client_id, "cam-7"),
            Role::Leader => panic!("expected client role"),
        }
    }
}
