use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result, anyhow};
use presence_relay::{
    directory::{Directory, Router},
    envelope::{DirectoryRequest, ParticipantNotice},
    participant::{Console, Participant, ParticipantConfig},
    registry::Presence,
    transport::{PeerAddress, receive_envelope, send_one},
};
use tokio::{
    io::AsyncWriteExt,
    net::{TcpListener, TcpStream},
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::timeout,
};

const WAIT: Duration = Duration::from_secs(3);

#[derive(Debug, PartialEq, Eq)]
enum ConsoleEvent {
    Prompt(String),
    Shown(String),
}

/// A console driven by the test: every prompt and every displayed line is
/// reported as an event, and answers are fed through a channel.
struct ScriptedConsole {
    events: mpsc::UnboundedSender<ConsoleEvent>,
    answers: mpsc::UnboundedReceiver<String>,
}

impl Console for ScriptedConsole {
    async fn ask(&mut self, prompt: &str) -> Result<Option<String>> {
        let _ = self.events.send(ConsoleEvent::Prompt(prompt.to_string()));
        Ok(self.answers.recv().await)
    }

    async fn listen(&mut self) -> Result<Option<String>> {
        Ok(self.answers.recv().await)
    }

    async fn show(&mut self, line: &str) -> Result<()> {
        let _ = self.events.send(ConsoleEvent::Shown(line.to_string()));
        Ok(())
    }
}

struct User {
    name: &'static str,
    events: mpsc::UnboundedReceiver<ConsoleEvent>,
    answers: mpsc::UnboundedSender<String>,
    task: JoinHandle<Result<()>>,
}

impl User {
    async fn spawn(name: &'static str, directory: &PeerAddress, username: Option<&str>) -> Result<Self> {
        let participant = Participant::bind(ParticipantConfig {
            listen: PeerAddress::new("127.0.0.1", 0),
            directory: directory.clone(),
            username: username.map(str::to_string),
        })
        .await?;

        let (events_tx, events) = mpsc::unbounded_channel();
        let (answers, answers_rx) = mpsc::unbounded_channel();
        let mut console = ScriptedConsole {
            events: events_tx,
            answers: answers_rx,
        };
        let task = tokio::spawn(async move { participant.run(&mut console).await });

        Ok(Self {
            name,
            events,
            answers,
            task,
        })
    }

    async fn expect(&mut self, expected: ConsoleEvent) -> Result<()> {
        let event = timeout(WAIT, self.events.recv())
            .await
            .with_context(|| format!("{} waiting for {expected:?}", self.name))?
            .ok_or_else(|| anyhow!("{} console closed", self.name))?;
        if event != expected {
            return Err(anyhow!("{}: expected {expected:?}, got {event:?}", self.name));
        }
        Ok(())
    }

    async fn shown(&mut self, line: &str) -> Result<()> {
        self.expect(ConsoleEvent::Shown(line.to_string())).await
    }

    async fn prompted(&mut self, prompt: &str) -> Result<()> {
        self.expect(ConsoleEvent::Prompt(prompt.to_string())).await
    }

    fn answer(&self, line: &str) -> Result<()> {
        self.answers
            .send(line.to_string())
            .map_err(|_| anyhow!("{} stopped reading input", self.name))
    }

    /// Ends the input stream, as a closed stdin would.
    fn close_input(&mut self) {
        self.answers = mpsc::unbounded_channel().0;
    }

    async fn finished(self) -> Result<()> {
        timeout(WAIT, self.task).await??
    }
}

const NAME: &str = "Enter your user name: ";
const TARGET: &str = "Enter your friend's username to start chatting: ";
const ME: &str = "Me: ";

async fn start_directory() -> Result<(PeerAddress, Arc<Router>, oneshot::Sender<()>)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let address = PeerAddress::from(listener.local_addr()?);
    let directory = Directory::new(listener);
    let router = directory.router();
    let (stop, stop_rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        let _ = directory
            .run_until(async move {
                let _ = stop_rx.await;
            })
            .await;
    });
    Ok((address, router, stop))
}

/// A bare listener in place of the directory, so a test sees exactly what a
/// participant sends and decides what it gets back.
struct FakeDirectory {
    listener: TcpListener,
    address: PeerAddress,
}

impl FakeDirectory {
    async fn bind() -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let address = PeerAddress::from(listener.local_addr()?);
        Ok(Self { listener, address })
    }

    async fn next_request(&self) -> Result<DirectoryRequest> {
        let (mut stream, _) = timeout(WAIT, self.listener.accept())
            .await
            .context("no request reached the directory")??;
        let request = timeout(WAIT, receive_envelope::<_, DirectoryRequest>(&mut stream))
            .await
            .context("request never completed")??;
        Ok(request)
    }

    /// Accepts a registration for `name` and returns the declared address.
    async fn registration(&self, name: &str) -> Result<PeerAddress> {
        match self.next_request().await? {
            DirectoryRequest::Register {
                username,
                host,
                port,
            } if username == name => Ok(PeerAddress::new(host, port)),
            other => Err(anyhow!("expected register for {name}, got {other:?}")),
        }
    }

    async fn expect_silence(&self) -> Result<()> {
        match timeout(Duration::from_millis(300), self.listener.accept()).await {
            Err(_) => Ok(()),
            Ok(_) => Err(anyhow!("directory was contacted unexpectedly")),
        }
    }
}

async fn send_raw(address: &PeerAddress, bytes: &[u8]) -> Result<()> {
    let mut stream = TcpStream::connect((address.host.as_str(), address.port)).await?;
    stream.write_all(bytes).await?;
    stream.shutdown().await?;
    Ok(())
}

fn relay(from: &str, reply_to: &PeerAddress, target: &str, message: &str) -> DirectoryRequest {
    DirectoryRequest::SendMessage {
        username: from.into(),
        host: reply_to.host.clone(),
        port: reply_to.port,
        target: target.into(),
        message: message.into(),
    }
}

/// Leave is fire-and-forget, so the registry catches up asynchronously.
async fn wait_until_offline(router: &Router, name: &str) -> Result<()> {
    timeout(WAIT, async {
        loop {
            match router.record(name).await {
                Some(record) if record.presence == Presence::Offline => break,
                _ => tokio::time::sleep(Duration::from_millis(20)).await,
            }
        }
    })
    .await
    .with_context(|| format!("{name} was never marked offline"))
}

#[tokio::test]
async fn two_participants_chat_through_the_directory() -> Result<()> {
    let (directory, router, stop) = start_directory().await?;

    let mut alice = User::spawn("alice", &directory, Some("alice")).await?;
    alice.shown("Welcome alice").await?;
    alice.prompted(TARGET).await?;

    // Bob first tries the taken name, then picks another.
    let mut bob = User::spawn("bob", &directory, Some("alice")).await?;
    bob.shown("Username alice is already taken. Please choose another name.")
        .await?;
    bob.prompted(NAME).await?;
    bob.answer("bob")?;
    bob.shown("Welcome bob").await?;
    bob.prompted(TARGET).await?;
    bob.answer("alice")?;
    bob.prompted(ME).await?;
    bob.answer("hi")?;

    // Alice was still at her target prompt; bob's message waits for her.
    alice.answer("bob")?;
    alice.prompted(ME).await?;
    alice.answer("hey bob")?;
    alice.shown("bob : hi").await?;
    alice.prompted(ME).await?;

    bob.shown("alice : hey bob").await?;
    bob.prompted(ME).await?;

    alice.answer("shutdown")?;
    alice.shown("*** leaving chat").await?;
    alice.finished().await?;

    wait_until_offline(&router, "alice").await?;

    bob.answer("are you there?")?;
    bob.shown("alice is offline.").await?;
    bob.prompted(TARGET).await?;
    bob.answer("carol")?;
    bob.prompted(ME).await?;
    bob.answer("hello carol")?;
    bob.shown("No user named carol is registered.").await?;
    bob.prompted(TARGET).await?;
    bob.answer("/delete")?;
    bob.shown("*** leaving chat").await?;
    bob.finished().await?;

    // Delete is fire-and-forget; give the directory a moment to apply it.
    let deleted = timeout(WAIT, async {
        while router.record("bob").await.is_some() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(deleted.is_ok(), "bob should be removed from the registry");

    let _ = stop.send(());
    Ok(())
}

#[tokio::test]
async fn blank_input_asks_again_and_eof_ends_session() -> Result<()> {
    let (directory, router, stop) = start_directory().await?;

    let mut carol = User::spawn("carol", &directory, None).await?;
    carol.prompted(NAME).await?;
    carol.answer("   ")?;
    carol.prompted(NAME).await?;
    carol.answer("carol")?;
    carol.shown("Welcome carol").await?;
    carol.prompted(TARGET).await?;

    // Closing the input source behaves like the shutdown sentinel.
    carol.close_input();
    carol.shown("*** leaving chat").await?;
    carol.finished().await?;

    wait_until_offline(&router, "carol").await?;

    let _ = stop.send(());
    Ok(())
}

#[tokio::test]
async fn unreachable_directory_is_reported() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let directory = PeerAddress::from(listener.local_addr()?);
    drop(listener);

    let mut dave = User::spawn("dave", &directory, Some("dave")).await?;
    dave.shown(&format!("!!! directory at {directory} is unreachable"))
        .await?;
    dave.prompted(NAME).await?;
    dave.answer("shutdown")?;
    dave.shown("*** leaving chat").await?;
    dave.finished().await
}

#[tokio::test]
async fn garbage_on_the_listener_does_not_block_registration() -> Result<()> {
    let directory = FakeDirectory::bind().await?;
    let mut erin = User::spawn("erin", &directory.address, Some("erin")).await?;
    let erin_address = directory.registration("erin").await?;

    send_raw(&erin_address, b"not json at all").await?;
    send_raw(&erin_address, br#"{"message_type": "registered", "mess"#).await?;
    send_raw(&erin_address, br#"{"message_type": "launch"}"#).await?;
    send_raw(&erin_address, b"").await?;

    send_one(
        &erin_address,
        &ParticipantNotice::Registered {
            message: "Welcome erin".into(),
        },
    )
    .await?;
    erin.shown("Welcome erin").await?;
    erin.prompted(TARGET).await?;

    erin.answer("shutdown")?;
    erin.shown("*** leaving chat").await?;
    erin.finished().await?;
    assert_eq!(
        directory.next_request().await?,
        DirectoryRequest::Leave {
            username: "erin".into()
        }
    );
    Ok(())
}

#[tokio::test]
async fn lines_typed_while_waiting_are_read() -> Result<()> {
    let directory = FakeDirectory::bind().await?;
    let mut erin = User::spawn("erin", &directory.address, Some("erin")).await?;
    let erin_address = directory.registration("erin").await?;
    send_one(
        &erin_address,
        &ParticipantNotice::Registered {
            message: "Welcome erin".into(),
        },
    )
    .await?;
    erin.shown("Welcome erin").await?;
    erin.prompted(TARGET).await?;
    erin.answer("frank")?;
    erin.prompted(ME).await?;
    erin.answer("one")?;
    assert_eq!(directory.next_request().await?, relay("erin", &erin_address, "frank", "one"));

    // No prompt is up while waiting for a reply; the line still goes out.
    erin.answer("two")?;
    assert_eq!(directory.next_request().await?, relay("erin", &erin_address, "frank", "two"));

    erin.answer("shutdown")?;
    erin.shown("*** leaving chat").await?;
    erin.finished().await?;
    assert_eq!(
        directory.next_request().await?,
        DirectoryRequest::Leave {
            username: "erin".into()
        }
    );
    Ok(())
}

#[tokio::test]
async fn shutdown_while_awaiting_registration() -> Result<()> {
    let directory = FakeDirectory::bind().await?;
    let mut erin = User::spawn("erin", &directory.address, Some("erin")).await?;
    directory.registration("erin").await?;

    // The directory never answers.
    erin.answer("shutdown")?;
    erin.shown("*** leaving chat").await?;
    erin.finished().await?;

    // The name was never confirmed, so nothing is sent on the way out.
    directory.expect_silence().await
}
