use std::io;
use std::path::Path;

use futures::SinkExt;
use futures::StreamExt;
use tokio::net::UnixStream;
use tokio_util::codec::Framed;
use tokio_util::codec::LinesCodec;

use crate::errors::UdevRulesError;
use crate::protocol::Call;
use crate::protocol::MAX_FRAME_LENGTH;
use crate::protocol::Outcome;
use crate::protocol::Reply;
use crate::protocol::Request;
use crate::protocol::Response;

/// Talks to a running service helper. Rejections come back as the same
/// [`UdevRulesError`] variants the service raised; transport problems are
/// reported as [`UdevRulesError::Io`].
pub struct ServiceHelperClient {
    framed: Framed<UnixStream, LinesCodec>,
    next_id: u64,
}

impl ServiceHelperClient {
    pub async fn connect(socket_path: &Path) -> Result<Self, UdevRulesError> {
        let stream = UnixStream::connect(socket_path).await.map_err(|err| {
            UdevRulesError::io(format!("failed to connect to {}", socket_path.display()), err)
        })?;
        Ok(Self::from_stream(stream))
    }

    pub fn from_stream(stream: UnixStream) -> Self {
        Self {
            framed: Framed::new(stream, LinesCodec::new_with_max_length(MAX_FRAME_LENGTH)),
            next_id: 1,
        }
    }

    /// Stages a rule that runs `cmd` when the device with `uuid` appears.
    pub async fn add_rule(&mut self, cmd: &str, uuid: &str) -> Result<(), UdevRulesError> {
        let reply = self
            .call(Call::AddRule {
                cmd: cmd.to_string(),
                uuid: uuid.to_string(),
            })
            .await?;
        expect_done(reply)
    }

    /// Installs the staged rules. Returns whether the rules file changed.
    pub async fn save(&mut self) -> Result<bool, UdevRulesError> {
        match self.call(Call::Save).await? {
            Reply::Saved(saved) => Ok(saved),
            Reply::Done => Err(protocol_error("unexpected reply to save")),
        }
    }

    pub async fn delete(&mut self) -> Result<(), UdevRulesError> {
        let reply = self.call(Call::Delete).await?;
        expect_done(reply)
    }

    pub async fn clean(&mut self) -> Result<(), UdevRulesError> {
        let reply = self.call(Call::Clean).await?;
        expect_done(reply)
    }

    async fn call(&mut self, call: Call) -> Result<Reply, UdevRulesError> {
        let id = self.next_id;
        self.next_id += 1;
        let name = call.name();

        let request = serde_json::to_string(&Request { id, call })
            .map_err(|err| UdevRulesError::io("failed to encode request", io::Error::other(err)))?;
        self.framed
            .send(request)
            .await
            .map_err(|err| UdevRulesError::io(format!("failed to send {name}"), io::Error::other(err)))?;

        let line = match self.framed.next().await {
            Some(Ok(line)) => line,
            Some(Err(err)) => {
                return Err(UdevRulesError::io(
                    format!("failed to read reply to {name}"),
                    io::Error::other(err),
                ));
            }
            None => {
                return Err(UdevRulesError::io(
                    format!("service helper hung up during {name}"),
                    io::ErrorKind::UnexpectedEof.into(),
                ));
            }
        };
        let response: Response = serde_json::from_str(&line)
            .map_err(|err| UdevRulesError::io("malformed reply", io::Error::other(err)))?;
        if response.id != id {
            return Err(protocol_error(&format!(
                "reply {} does not answer request {id}",
                response.id
            )));
        }
        match response.outcome {
            Outcome::Ok(reply) => Ok(reply),
            Outcome::Err(err) => Err(err.into()),
        }
    }
}

fn expect_done(reply: Reply) -> Result<(), UdevRulesError> {
    match reply {
        Reply::Done => Ok(()),
        Reply::Saved(_) => Err(protocol_error("unexpected reply")),
    }
}

fn protocol_error(message: &str) -> UdevRulesError {
    UdevRulesError::io(
        "service helper protocol error",
        io::Error::new(io::ErrorKind::InvalidData, message.to_string()),
    )
}
