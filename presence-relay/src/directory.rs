use std::{future::Future, net::SocketAddr, sync::Arc};

use anyhow::Result;
use tokio::{net::TcpListener, select, sync::Mutex};
use tracing::{debug, info, warn};

use crate::{
    envelope::{DirectoryRequest, ParticipantNotice},
    registry::{ParticipantRecord, RegisterOutcome, Registry, Route},
    transport::{self, EnvelopeHandler, PeerAddress, Shutdown, send_one, shutdown_channel},
};

pub struct Directory {
    listener: TcpListener,
    router: Arc<Router>,
}

impl Directory {
    pub fn new(listener: TcpListener) -> Self {
        Self {
            listener,
            router: Arc::new(Router::new()),
        }
    }

    pub async fn bind(address: &PeerAddress) -> Result<Self> {
        Ok(Self::new(transport::bind(address).await?))
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn router(&self) -> Arc<Router> {
        Arc::clone(&self.router)
    }

    pub async fn run(self, shutdown: Shutdown) -> Result<()> {
        let Directory { listener, router } = self;
        transport::serve(listener, router, shutdown).await;
        info!("directory stopped");
        Ok(())
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let (trigger, signal) = shutdown_channel();
        let serving = self.run(signal);
        tokio::pin!(serving, shutdown);

        select! {
            result = &mut serving => return result,
            _ = &mut shutdown => {
                info!("directory shutting down");
                trigger.trigger();
            }
        }

        serving.await
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

/// A notice and the address it has to be sent to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatch {
    pub to: PeerAddress,
    pub notice: ParticipantNotice,
}

/// Owns the registry and turns requests into dispatches.
///
/// Every request takes the registry lock once, for the decision only. The
/// lock is released before any network I/O.
#[derive(Debug, Default)]
pub struct Router {
    registry: Mutex<Registry>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn dispatch(&self, request: DirectoryRequest) -> Option<Dispatch> {
        match request {
            DirectoryRequest::Register {
                username,
                host,
                port,
            } => Some(self.register(username, PeerAddress::new(host, port)).await),
            DirectoryRequest::SendMessage {
                username,
                host,
                port,
                target,
                message,
            } => {
                let route = self.registry.lock().await.route(&target);
                Some(resolve_route(
                    route,
                    username,
                    PeerAddress::new(host, port),
                    &target,
                    message,
                ))
            }
            DirectoryRequest::Leave { username } => {
                if self.registry.lock().await.leave(&username) {
                    info!(%username, "participant went offline");
                } else {
                    debug!(%username, "leave for unknown participant ignored");
                }
                None
            }
            DirectoryRequest::Delete { username } => {
                if self.registry.lock().await.delete(&username) {
                    info!(%username, "participant deleted");
                } else {
                    debug!(%username, "delete for unknown participant ignored");
                }
                None
            }
        }
    }

    async fn register(&self, username: String, reply_to: PeerAddress) -> Dispatch {
        let outcome = self
            .registry
            .lock()
            .await
            .register(&username, reply_to.clone());

        let notice = match outcome {
            RegisterOutcome::Registered => {
                info!(%username, address = %reply_to, "participant registered");
                ParticipantNotice::Registered {
                    message: format!("Welcome {username}"),
                }
            }
            RegisterOutcome::NameTaken => {
                info!(%username, address = %reply_to, "registration rejected; name taken");
                ParticipantNotice::UsernameTaken
            }
        };

        Dispatch {
            to: reply_to,
            notice,
        }
    }

    pub async fn record(&self, name: &str) -> Option<ParticipantRecord> {
        self.registry.lock().await.get(name).cloned()
    }

    pub async fn participant_count(&self) -> usize {
        self.registry.lock().await.len()
    }
}

fn resolve_route(
    route: Route,
    sender: String,
    reply_to: PeerAddress,
    target: &str,
    message: String,
) -> Dispatch {
    match route {
        Route::Deliver(to) => {
            debug!(%sender, %target, %to, "relaying message");
            Dispatch {
                to,
                notice: ParticipantNotice::SendMessage { sender, message },
            }
        }
        Route::Offline => {
            debug!(%sender, %target, "target offline");
            Dispatch {
                to: reply_to,
                notice: ParticipantNotice::UserOffline,
            }
        }
        Route::NotFound => {
            debug!(%sender, %target, "target not registered");
            Dispatch {
                to: reply_to,
                notice: ParticipantNotice::UserNotFound,
            }
        }
    }
}

impl EnvelopeHandler for Router {
    type Envelope = DirectoryRequest;

    async fn handle(&self, request: DirectoryRequest, peer: SocketAddr) {
        debug!(
            %peer,
            message_type = request.message_type(),
            username = request.username(),
            "request received"
        );
        if let Some(dispatch) = self.dispatch(request).await {
            deliver(dispatch).await;
        }
    }
}

/// Fire-and-forget delivery. There is no negative acknowledgement in the
/// protocol, so an unreachable destination is only visible in the logs.
async fn deliver(dispatch: Dispatch) {
    let Dispatch { to, notice } = dispatch;
    if let Err(err) = send_one(&to, &notice).await {
        warn!(
            %to,
            message_type = notice.message_type(),
            error = %err,
            "delivery failed; envelope dropped"
        );
    }
}
