use anyhow::Result;
use clap::Parser;
use tracing::{Instrument, info, info_span};

use presence_relay::{
    cli::{Cli, Command},
    directory::Directory,
    participant::{Participant, StdioConsole},
    telemetry,
};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _log_guard = telemetry::init(&cli.logging)?;

    match cli.command {
        Command::Directory(args) => {
            let span = info_span!("directory", port = args.port);
            async move {
                let directory = Directory::bind(&args.listen()).await?;
                info!("directory listening on {}", directory.local_addr()?);
                directory.run_until_ctrl_c().await
            }
            .instrument(span)
            .await?
        }
        Command::Participant(args) => {
            let span = info_span!("participant", port = args.port);
            async move {
                let participant = Participant::bind(args.config()).await?;
                let mut console = StdioConsole::new();
                participant.run_until_ctrl_c(&mut console).await
            }
            .instrument(span)
            .await?
        }
    }

    Ok(())
}
