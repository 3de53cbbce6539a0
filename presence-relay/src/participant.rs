use std::{future::Future, io::BufRead, net::SocketAddr, sync::Arc, thread};

use anyhow::{Context, Result};
use tokio::{
    io::{self, AsyncWriteExt},
    net::TcpListener,
    select,
    sync::mpsc,
};
use tracing::{Instrument, debug, info, warn};

use crate::{
    envelope::{DirectoryRequest, ParticipantNotice},
    session::{Farewell, Input, Next, Session},
    transport::{self, EnvelopeHandler, PeerAddress, send_one, shutdown_channel},
};

const NAME_PROMPT: &str = "Enter your user name: ";
const TARGET_PROMPT: &str = "Enter your friend's username to start chatting: ";
const MESSAGE_PROMPT: &str = "Me: ";

// Notices that arrive while the user is typing wait here.
const NOTICE_BUFFER: usize = 64;

/// Where prompts go and where answers come from.
pub trait Console: Send {
    /// Returns `None` once the input source is exhausted.
    fn ask(&mut self, prompt: &str) -> impl Future<Output = Result<Option<String>>> + Send;

    /// Reads the next line without prompting. Raced against incoming
    /// notices, so dropping the future must not lose a line.
    fn listen(&mut self) -> impl Future<Output = Result<Option<String>>> + Send;

    fn show(&mut self, line: &str) -> impl Future<Output = Result<()>> + Send;
}

/// Terminal console. Stdin is read on its own thread and handed over line by
/// line, which keeps [`Console::listen`] cancel safe and never holds the
/// runtime open at exit.
pub struct StdioConsole {
    lines: mpsc::Receiver<io::Result<String>>,
}

impl StdioConsole {
    pub fn new() -> Self {
        let (tx, lines) = mpsc::channel(1);
        thread::spawn(move || {
            for line in std::io::stdin().lock().lines() {
                let failed = line.is_err();
                if tx.blocking_send(line).is_err() || failed {
                    break;
                }
            }
        });
        Self { lines }
    }

    async fn next_line(&mut self) -> Result<Option<String>> {
        match self.lines.recv().await {
            Some(line) => {
                let line = line.context("failed to read from stdin")?;
                Ok(Some(line.trim_end_matches('\r').to_string()))
            }
            None => Ok(None),
        }
    }
}

impl Default for StdioConsole {
    fn default() -> Self {
        Self::new()
    }
}

impl Console for StdioConsole {
    async fn ask(&mut self, prompt: &str) -> Result<Option<String>> {
        let mut stdout = io::stdout();
        stdout.write_all(prompt.as_bytes()).await?;
        stdout.flush().await?;
        self.next_line().await
    }

    async fn listen(&mut self) -> Result<Option<String>> {
        self.next_line().await
    }

    async fn show(&mut self, line: &str) -> Result<()> {
        write_stdout(line).await?;
        Ok(())
    }
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}

#[derive(Debug, Clone)]
pub struct ParticipantConfig {
    pub listen: PeerAddress,
    pub directory: PeerAddress,
    /// Skips the first name prompt when set.
    pub username: Option<String>,
}

pub struct Participant {
    listener: TcpListener,
    address: PeerAddress,
    directory: PeerAddress,
    username: Option<String>,
}

impl Participant {
    /// Binds the participant's own listener. The declared address uses the
    /// configured host and the port actually bound, so port 0 works.
    pub async fn bind(config: ParticipantConfig) -> Result<Self> {
        let listener = transport::bind(&config.listen).await?;
        let port = listener.local_addr()?.port();
        let address = PeerAddress::new(config.listen.host, port);
        info!(%address, directory = %config.directory, "participant listening");

        Ok(Self {
            listener,
            address,
            directory: config.directory,
            username: config.username,
        })
    }

    pub fn address(&self) -> &PeerAddress {
        &self.address
    }

    pub async fn run<C>(self, console: &mut C) -> Result<()>
    where
        C: Console,
    {
        self.run_until(console, std::future::pending()).await
    }

    pub async fn run_until_ctrl_c<C>(self, console: &mut C) -> Result<()>
    where
        C: Console,
    {
        self.run_until(console, async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
                std::future::pending::<()>().await;
            }
        })
        .await
    }

    /// Registers, converses, and leaves. `shutdown` ends the conversation
    /// early the same way the `shutdown` sentinel does.
    pub async fn run_until<C, F>(self, console: &mut C, shutdown: F) -> Result<()>
    where
        C: Console,
        F: Future<Output = ()> + Send,
    {
        let Participant {
            listener,
            address,
            directory,
            username,
        } = self;

        let (notice_tx, mut notices) = mpsc::channel(NOTICE_BUFFER);
        let (trigger, signal) = shutdown_channel();
        let inbox = Arc::new(Inbox { notices: notice_tx });
        let listening = tokio::spawn(transport::serve(listener, inbox, signal).in_current_span());

        let mut session = Session::new(address);
        let outcome = {
            let conversation = converse(&mut session, console, &mut notices, &directory, username);
            tokio::pin!(shutdown);
            select! {
                result = conversation => result,
                _ = &mut shutdown => {
                    info!("interrupted; leaving");
                    Ok(Farewell::Leave)
                }
            }
        };

        let result = match outcome {
            Ok(farewell) => say_goodbye(&mut session, console, &directory, farewell).await,
            Err(err) => Err(err),
        };

        drop(notices);
        trigger.trigger();
        if let Err(err) = listening.await {
            warn!(error = ?err, "participant listener task failed");
        }
        info!("participant stopped");
        result
    }
}

/// Forwards notices from the listener to the conversation loop.
struct Inbox {
    notices: mpsc::Sender<ParticipantNotice>,
}

impl EnvelopeHandler for Inbox {
    type Envelope = ParticipantNotice;

    async fn handle(&self, notice: ParticipantNotice, peer: SocketAddr) {
        debug!(%peer, message_type = notice.message_type(), "notice received");
        if self.notices.send(notice).await.is_err() {
            debug!("session already finished; notice dropped");
        }
    }
}

enum Wake {
    Notice(Option<ParticipantNotice>),
    Input(Option<String>),
}

async fn converse<C>(
    session: &mut Session,
    console: &mut C,
    notices: &mut mpsc::Receiver<ParticipantNotice>,
    directory: &PeerAddress,
    mut preset_name: Option<String>,
) -> Result<Farewell>
where
    C: Console,
{
    let mut next = Next::ChooseName;

    loop {
        next = match next {
            Next::ChooseName => {
                let line = match preset_name.take() {
                    Some(name) => Some(name),
                    None => console.ask(NAME_PROMPT).await?,
                };
                match Input::parse(line.as_deref()) {
                    Input::Text(name) => {
                        let request = session.register(name);
                        if submit(directory, &request, console).await? {
                            Next::Wait
                        } else {
                            Next::ChooseName
                        }
                    }
                    Input::Blank => Next::ChooseName,
                    Input::Finish(farewell) => return Ok(farewell),
                }
            }
            Next::ChooseTarget => match Input::parse(console.ask(TARGET_PROMPT).await?.as_deref()) {
                Input::Text(target) => Next::Compose { to: target },
                Input::Blank => Next::ChooseTarget,
                Input::Finish(farewell) => return Ok(farewell),
            },
            Next::Compose { to } => {
                match Input::parse(console.ask(MESSAGE_PROMPT).await?.as_deref()) {
                    Input::Text(message) => match session.send(&to, message) {
                        Some(request) => {
                            if submit(directory, &request, console).await? {
                                Next::Wait
                            } else {
                                Next::ChooseTarget
                            }
                        }
                        None => Next::Wait,
                    },
                    Input::Blank => Next::Compose { to },
                    Input::Finish(farewell) => return Ok(farewell),
                }
            }
            Next::Wait => {
                let wake = select! {
                    biased;
                    notice = notices.recv() => Wake::Notice(notice),
                    line = console.listen() => Wake::Input(line?),
                };
                match wake {
                    Wake::Notice(Some(notice)) => {
                        let reaction = session.on_notice(notice);
                        if let Some(line) = reaction.display {
                            console.show(&line).await?;
                        }
                        reaction.next
                    }
                    Wake::Notice(None) => return Ok(Farewell::Leave),
                    Wake::Input(line) => match Input::parse(line.as_deref()) {
                        Input::Text(message) => follow_up(session, console, directory, message).await?,
                        Input::Blank => Next::Wait,
                        Input::Finish(farewell) => return Ok(farewell),
                    },
                }
            }
        };
    }
}

/// Text typed while waiting goes to whoever was written to last. Before any
/// message has been sent there is nobody to address, and the line is dropped.
async fn follow_up<C>(
    session: &mut Session,
    console: &mut C,
    directory: &PeerAddress,
    message: String,
) -> Result<Next>
where
    C: Console,
{
    let Some(target) = session.last_target().map(str::to_string) else {
        debug!("input while waiting with no conversation yet; ignored");
        return Ok(Next::Wait);
    };
    let Some(request) = session.send(&target, message) else {
        debug!(%target, "input before registration confirmed; ignored");
        return Ok(Next::Wait);
    };
    if submit(directory, &request, console).await? {
        Ok(Next::Wait)
    } else {
        Ok(Next::ChooseTarget)
    }
}

/// Sends a request to the directory. An unreachable directory is reported to
/// the user and returns `false`; the conversation goes on.
async fn submit<C>(directory: &PeerAddress, request: &DirectoryRequest, console: &mut C) -> Result<bool>
where
    C: Console,
{
    match send_one(directory, request).await {
        Ok(()) => {
            debug!(message_type = request.message_type(), "request sent");
            Ok(true)
        }
        Err(err) => {
            warn!(%directory, message_type = request.message_type(), error = %err, "directory unreachable");
            console
                .show(&format!("!!! directory at {directory} is unreachable"))
                .await?;
            Ok(false)
        }
    }
}

async fn say_goodbye<C>(
    session: &mut Session,
    console: &mut C,
    directory: &PeerAddress,
    farewell: Farewell,
) -> Result<()>
where
    C: Console,
{
    if let Some(request) = session.finish(farewell) {
        if let Err(err) = send_one(directory, &request).await {
            warn!(%directory, error = %err, "failed to notify directory on exit");
        }
    }
    console.show("*** leaving chat").await
}
