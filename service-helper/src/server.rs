use std::fs::Permissions;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use futures::SinkExt;
use futures::StreamExt;
use tokio::net::UnixListener;
use tokio::net::UnixStream;
use tokio::task::JoinSet;
use tokio_util::codec::Framed;
use tokio_util::codec::LinesCodec;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::broker::UdevRules;
use crate::errors::FAILED;
use crate::errors::UdevRulesError;
use crate::identity::OwnerToken;
use crate::identity::PeerSender;
use crate::identity::SenderInfo;
use crate::identity::next_owner_token;
use crate::protocol::Call;
use crate::protocol::MAX_FRAME_LENGTH;
use crate::protocol::Outcome;
use crate::protocol::Reply;
use crate::protocol::Request;
use crate::protocol::Response;
use crate::protocol::WireError;

/// Anyone may connect; the broker decides per call what the caller may do.
const SOCKET_MODE: u32 = 0o666;

const ACCEPT_BACKOFF_MIN: Duration = Duration::from_millis(10);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Binds the service socket, replacing a stale socket file left behind by
/// an earlier instance.
pub fn bind_socket(path: &Path) -> anyhow::Result<UnixListener> {
    match std::fs::remove_file(path) {
        Ok(()) => debug!("removed stale socket {}", path.display()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => {
            return Err(err).with_context(|| format!("failed to remove {}", path.display()));
        }
    }
    let listener =
        UnixListener::bind(path).with_context(|| format!("failed to bind {}", path.display()))?;
    std::fs::set_permissions(path, Permissions::from_mode(SOCKET_MODE))
        .with_context(|| format!("failed to set permissions of {}", path.display()))?;
    Ok(listener)
}

/// Serves [`UdevRules`] over a Unix socket. Each connection gets its own
/// owner token; requests of one connection are handled in order.
pub struct ServiceHelperServer {
    broker: Arc<UdevRules>,
}

impl ServiceHelperServer {
    pub fn new(broker: Arc<UdevRules>) -> Self {
        Self { broker }
    }

    /// Accepts connections until `cancel` fires, then waits for the open
    /// connections to wind down.
    pub async fn serve(&self, listener: UnixListener, cancel: CancellationToken) {
        let mut connections = JoinSet::new();
        let mut failed_accepts = 0u32;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        failed_accepts = 0;
                        connections.spawn(handle_connection(
                            stream,
                            Arc::clone(&self.broker),
                            cancel.child_token(),
                        ));
                    }
                    Err(err) => {
                        // Errors like EMFILE persist until a connection closes.
                        failed_accepts = failed_accepts.saturating_add(1);
                        let delay = accept_backoff(failed_accepts);
                        error!("failed to accept connection, retrying in {delay:?}: {err}");
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                },
                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(err) = joined {
                        error!("connection task failed: {err}");
                    }
                }
            }
        }
        info!("shutting down, waiting for {} connection(s)", connections.len());
        while connections.join_next().await.is_some() {}
    }
}

/// Delay before the next `accept` after `failures` failed ones in a row.
fn accept_backoff(failures: u32) -> Duration {
    let doublings = failures.saturating_sub(1).min(16);
    ACCEPT_BACKOFF_MIN
        .saturating_mul(1 << doublings)
        .min(ACCEPT_BACKOFF_MAX)
}

async fn handle_connection(stream: UnixStream, broker: Arc<UdevRules>, cancel: CancellationToken) {
    let owner = next_owner_token();
    debug!("{owner} connected");
    let mut framed = Framed::new(stream, LinesCodec::new_with_max_length(MAX_FRAME_LENGTH));

    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => break,
            line = framed.next() => line,
        };
        let line = match line {
            Some(Ok(line)) => line,
            Some(Err(err)) => {
                warn!("dropping connection {owner}: {err}");
                break;
            }
            None => break,
        };

        let response = match serde_json::from_str::<Request>(&line) {
            Ok(request) => {
                let sender = PeerSender::new(framed.get_ref(), owner.clone());
                dispatch(&broker, &sender, request).await
            }
            Err(err) => {
                warn!("malformed request from {owner}: {err}");
                Response {
                    id: 0,
                    outcome: Outcome::Err(WireError {
                        name: FAILED.to_string(),
                        message: format!("malformed request: {err}"),
                    }),
                }
            }
        };

        let json = match serde_json::to_string(&response) {
            Ok(json) => json,
            Err(err) => {
                error!("failed to serialize response for {owner}: {err}");
                break;
            }
        };
        if let Err(err) = framed.send(json).await {
            warn!("failed to answer {owner}: {err}");
            break;
        }
    }

    broker.forget(&owner).await;
    debug!("{owner} disconnected");
}

async fn dispatch(broker: &UdevRules, sender: &dyn SenderInfo, request: Request) -> Response {
    let Request { id, call } = request;
    let name = call.name();
    let result: Result<Reply, UdevRulesError> = match call {
        Call::AddRule { cmd, uuid } => broker
            .add_rule(sender, &cmd, &uuid)
            .await
            .map(|()| Reply::Done),
        Call::Save => broker.save(sender).await.map(Reply::Saved),
        Call::Delete => broker.delete(sender).await.map(|()| Reply::Done),
        Call::Clean => {
            broker.clean(sender).await;
            Ok(Reply::Done)
        }
    };

    let outcome = match result {
        Ok(reply) => Outcome::Ok(reply),
        Err(err) => {
            log_failure(&sender.name_owner(), name, &err);
            Outcome::Err(WireError::from(&err))
        }
    };
    Response { id, outcome }
}

fn log_failure(owner: &OwnerToken, call: &str, err: &UdevRulesError) {
    match err {
        UdevRulesError::Io { .. } | UdevRulesError::Identity(_) => {
            error!("{call} from {owner} failed: {err}");
        }
        _ => debug!("{call} from {owner} refused: {err}"),
    }
}
