use std::{net::SocketAddr, path::PathBuf};

use clap::{Args, Parser, Subcommand};

use crate::server::{DEFAULT_AUDIT_LOG, DEFAULT_MAX_CONNECTIONS, ServerConfig};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the chat server. Type `QUIT CHAT` on stdin or press Ctrl-C to stop it.
    Serve(ServeArgs),
    /// Connect to a chat server and relay lines between it and the terminal.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Socket address the server should bind to. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "127.0.0.1:12345")]
    pub listen: SocketAddr,

    /// Maximum number of sessions, counting clients still picking a server.
    #[arg(long, default_value_t = DEFAULT_MAX_CONNECTIONS, value_parser = parse_capacity)]
    pub max_connections: usize,

    /// File the audit trail is appended to.
    #[arg(long, default_value = DEFAULT_AUDIT_LOG)]
    pub log_file: PathBuf,

    /// Do not write an audit trail.
    #[arg(long)]
    pub no_audit_log: bool,
}

impl ServeArgs {
    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            max_connections: self.max_connections,
            audit_log: (!self.no_audit_log).then(|| self.log_file.clone()),
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Address of the chat server to connect to.
    #[arg(long, default_value = "127.0.0.1:12345")]
    pub server: SocketAddr,
}

fn parse_capacity(value: &str) -> Result<usize, String> {
    match value.parse::<usize>() {
        Ok(0) => Err("must be at least 1".to_string()),
        Ok(capacity) => Ok(capacity),
        Err(err) => Err(err.to_string()),
    }
}
