use std::{
    ffi::OsString,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    num::NonZeroUsize,
};

use clap::{Args, Parser, Subcommand};

use crate::server::{DEFAULT_PORT, ServerConfig};

pub const DEFAULT_HOST: &str = "localhost";

#[derive(Parser, Debug)]
#[command(
    name = "broadcast-server",
    author,
    version,
    about = "Relay text lines between every connected client",
    long_about = None
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the broadcast server.
    Start(StartArgs),
    /// Connect to a broadcast server and send lines typed on stdin.
    Connect(ConnectArgs),
}

/// Lowercases the command name (the first argument after the program name) so
/// `START` and `Connect` select the same subcommands as `start` and `connect`.
pub fn normalize_command<I>(args: I) -> Vec<OsString>
where
    I: IntoIterator<Item = OsString>,
{
    args.into_iter()
        .enumerate()
        .map(|(index, arg)| match arg.to_str() {
            Some(command) if index == 1 => OsString::from(command.to_lowercase()),
            _ => arg,
        })
        .collect()
}

#[derive(Args, Debug, Clone)]
pub struct StartArgs {
    /// Port to listen on. Use 0 for an ephemeral port.
    #[arg(default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Interface address to listen on.
    #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    pub bind: IpAddr,

    /// Serve at most this many clients at once; further clients wait to be accepted.
    #[arg(long)]
    pub max_connections: Option<NonZeroUsize>,
}

impl StartArgs {
    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            bind: SocketAddr::new(self.bind, self.port),
            max_connections: self.max_connections,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ConnectArgs {
    /// Host name or address of the server.
    #[arg(default_value = DEFAULT_HOST)]
    pub host: String,

    /// Port the server listens on.
    #[arg(default_value_t = DEFAULT_PORT)]
    pub port: u16,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Cli, clap::Error> {
        Cli::try_parse_from(std::iter::once("broadcast-server").chain(args.iter().copied()))
    }

    #[test]
    fn start_defaults_to_all_interfaces_on_the_default_port() {
        let Command::Start(args) = parse(&["start"]).unwrap().command else {
            panic!("expected start");
        };
        assert_eq!(args.server_config(), ServerConfig::default());
    }

    #[test]
    fn start_accepts_port_and_limits() {
        let Command::Start(args) =
            parse(&["start", "9000", "--bind", "127.0.0.1", "--max-connections", "4"])
                .unwrap()
                .command
        else {
            panic!("expected start");
        };
        let config = args.server_config();
        assert_eq!(config.bind, "127.0.0.1:9000".parse().unwrap());
        assert_eq!(config.max_connections, NonZeroUsize::new(4));
    }

    #[test]
    fn connect_defaults_to_localhost() {
        let Command::Connect(args) = parse(&["connect"]).unwrap().command else {
            panic!("expected connect");
        };
        assert_eq!(args.host, "localhost");
        assert_eq!(args.port, DEFAULT_PORT);

        let Command::Connect(args) = parse(&["connect", "192.168.1.100", "9000"])
            .unwrap()
            .command
        else {
            panic!("expected connect");
        };
        assert_eq!(args.host, "192.168.1.100");
        assert_eq!(args.port, 9000);
    }

    #[test]
    fn command_names_match_case_insensitively() {
        let normalized = |args: &[&str]| {
            let args = std::iter::once("broadcast-server")
                .chain(args.iter().copied())
                .map(OsString::from);
            Cli::try_parse_from(normalize_command(args))
        };

        assert!(matches!(
            normalized(&["START", "9000"]).unwrap().command,
            Command::Start(StartArgs { port: 9000, .. })
        ));
        let Command::Connect(args) = normalized(&["Connect", "MyHost"]).unwrap().command else {
            panic!("expected connect");
        };
        assert_eq!(args.host, "MyHost");
        assert!(normalized(&["SERVE"]).is_err());
    }

    #[test]
    fn unknown_commands_and_bad_ports_are_rejected() {
        assert!(parse(&[]).is_err());
        assert!(parse(&["serve"]).is_err());
        assert!(parse(&["start", "http"]).is_err());
        assert!(parse(&["start", "--max-connections", "0"]).is_err());
    }
}
