use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::PathBuf,
};

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the relay immediately and run until Ctrl-C.
    Serve(ServeArgs),
    /// Manage the relay from an interactive console (start/stop/info/exit).
    Console(ConsoleArgs),
    /// Connect to a relay and chat with other users.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Socket address to bind. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "0.0.0.0:5000")]
    pub listen: SocketAddr,
}

#[derive(Args, Debug, Clone)]
pub struct ConsoleArgs {
    /// Interface that `start <port>` binds to.
    #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    pub host: IpAddr,
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Nickname to register with the relay.
    #[arg(long)]
    pub nickname: String,

    /// JSON file holding the relay's host and port.
    #[arg(long, default_value = "config.json")]
    pub config: PathBuf,
}
