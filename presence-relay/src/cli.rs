use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::{participant::ParticipantConfig, transport::PeerAddress};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub logging: LoggingArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the directory that tracks participants and relays their messages.
    Directory(DirectoryArgs),
    /// Register with a directory and chat with other participants.
    Participant(ParticipantArgs),
}

#[derive(Args, Debug, Clone)]
pub struct LoggingArgs {
    /// Write logs to this file instead of stderr.
    #[arg(long, global = true)]
    pub logfile: Option<PathBuf>,

    /// Minimum log level. `RUST_LOG` takes precedence when set.
    #[arg(long, global = true, default_value = "info")]
    pub loglevel: String,
}

#[derive(Args, Debug, Clone)]
pub struct DirectoryArgs {
    /// Host the directory binds to.
    #[arg(long, default_value = "localhost")]
    pub host: String,

    /// Port the directory binds to. Use 0 for an ephemeral port.
    #[arg(long, default_value_t = 6000)]
    pub port: u16,
}

impl DirectoryArgs {
    pub fn listen(&self) -> PeerAddress {
        PeerAddress::new(self.host.clone(), self.port)
    }
}

#[derive(Args, Debug, Clone)]
pub struct ParticipantArgs {
    /// Host this participant listens on and declares to the directory.
    #[arg(long, default_value = "localhost")]
    pub host: String,

    /// Port this participant listens on. Use 0 for an ephemeral port.
    #[arg(long, default_value_t = 6001)]
    pub port: u16,

    /// Host of the directory to register with.
    #[arg(long, default_value = "localhost")]
    pub directory_host: String,

    /// Port of the directory to register with.
    #[arg(long, default_value_t = 6000)]
    pub directory_port: u16,

    /// Name to register under. Prompted for when omitted.
    #[arg(long)]
    pub username: Option<String>,
}

impl ParticipantArgs {
    pub fn config(&self) -> ParticipantConfig {
        ParticipantConfig {
            listen: PeerAddress::new(self.host.clone(), self.port),
            directory: PeerAddress::new(self.directory_host.clone(), self.directory_port),
            username: self.username.clone(),
        }
    }
}
