//! Participant state machine.
//!
//! The session never touches a socket or a terminal. It turns notices into
//! [`Reaction`]s that tell the driver what to show and what to ask for next,
//! and turns the answers into [`DirectoryRequest`]s. Scripted input is enough
//! to walk it through every transition.

use tracing::debug;

use crate::{
    envelope::{DirectoryRequest, ParticipantNotice},
    transport::PeerAddress,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Unregistered,
    AwaitingRegistration { username: String },
    Active { username: String },
    Shutdown,
}

/// What the driver should ask for next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Next {
    ChooseName,
    ChooseTarget,
    Compose { to: String },
    Wait,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reaction {
    pub display: Option<String>,
    pub next: Next,
}

impl Reaction {
    fn show(line: impl Into<String>, next: Next) -> Self {
        Self {
            display: Some(line.into()),
            next,
        }
    }

    fn silent() -> Self {
        Self {
            display: None,
            next: Next::Wait,
        }
    }
}

/// How the session ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Farewell {
    /// Go offline but keep the name reserved.
    Leave,
    /// Give the name up entirely.
    Delete,
}

/// One line of local input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    Text(String),
    Blank,
    Finish(Farewell),
}

impl Input {
    /// `None` means the input source is exhausted and ends the session like
    /// `shutdown` does.
    pub fn parse(line: Option<&str>) -> Self {
        let Some(line) = line else {
            return Input::Finish(Farewell::Leave);
        };
        match line.trim() {
            "" => Input::Blank,
            "shutdown" | "/quit" => Input::Finish(Farewell::Leave),
            "/delete" => Input::Finish(Farewell::Delete),
            text => Input::Text(text.to_string()),
        }
    }
}

#[derive(Debug)]
pub struct Session {
    address: PeerAddress,
    state: SessionState,
    last_target: Option<String>,
}

impl Session {
    /// `address` is where this participant's own listener can be reached.
    pub fn new(address: PeerAddress) -> Self {
        Self {
            address,
            state: SessionState::Unregistered,
            last_target: None,
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn register(&mut self, username: String) -> DirectoryRequest {
        self.state = SessionState::AwaitingRegistration {
            username: username.clone(),
        };
        DirectoryRequest::Register {
            username,
            host: self.address.host.clone(),
            port: self.address.port,
        }
    }

    /// Builds a relay request. Only an active session can send.
    pub fn send(&mut self, target: &str, message: String) -> Option<DirectoryRequest> {
        let SessionState::Active { username } = &self.state else {
            return None;
        };
        let request = DirectoryRequest::SendMessage {
            username: username.clone(),
            host: self.address.host.clone(),
            port: self.address.port,
            target: target.to_string(),
            message,
        };
        self.last_target = Some(target.to_string());
        Some(request)
    }

    pub fn on_notice(&mut self, notice: ParticipantNotice) -> Reaction {
        match (&self.state, notice) {
            (SessionState::AwaitingRegistration { username }, ParticipantNotice::Registered { message }) => {
                self.state = SessionState::Active {
                    username: username.clone(),
                };
                Reaction::show(message, Next::ChooseTarget)
            }
            (SessionState::AwaitingRegistration { username }, ParticipantNotice::UsernameTaken) => {
                let line =
                    format!("Username {username} is already taken. Please choose another name.");
                self.state = SessionState::Unregistered;
                Reaction::show(line, Next::ChooseName)
            }
            (SessionState::Active { .. }, ParticipantNotice::SendMessage { sender, message }) => {
                let line = format!("{sender} : {message}");
                Reaction::show(line, Next::Compose { to: sender })
            }
            (SessionState::Active { .. }, ParticipantNotice::UserOffline) => {
                let line = format!("{} is offline.", self.last_target_label());
                Reaction::show(line, Next::ChooseTarget)
            }
            (SessionState::Active { .. }, ParticipantNotice::UserNotFound) => {
                let line = format!("No user named {} is registered.", self.last_target_label());
                Reaction::show(line, Next::ChooseTarget)
            }
            (SessionState::Shutdown, notice) => {
                debug!(message_type = notice.message_type(), "notice after shutdown ignored");
                Reaction::silent()
            }
            (_, ParticipantNotice::SendMessage { sender, message }) => {
                Reaction::show(format!("{sender} : {message}"), Next::Wait)
            }
            (state, notice) => {
                debug!(?state, message_type = notice.message_type(), "unexpected notice ignored");
                Reaction::silent()
            }
        }
    }

    /// Ends the session. Returns the request that tells the directory, if the
    /// name was ever confirmed as ours.
    pub fn finish(&mut self, farewell: Farewell) -> Option<DirectoryRequest> {
        let previous = std::mem::replace(&mut self.state, SessionState::Shutdown);
        let SessionState::Active { username } = previous else {
            return None;
        };
        Some(match farewell {
            Farewell::Leave => DirectoryRequest::Leave { username },
            Farewell::Delete => DirectoryRequest::Delete { username },
        })
    }

    /// The most recent target this session sent to.
    pub fn last_target(&self) -> Option<&str> {
        self.last_target.as_deref()
    }

    fn last_target_label(&self) -> &str {
        self.last_target().unwrap_or("that user")
    }
}
