use std::path::Path;

use akrun_protocol::{MAX_JSON_LINE_BYTES, Request, Response};
use anyhow::{Result, anyhow, bail};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};

/// Client for the akrun server's front-end socket.
pub struct AkrunClient {
    reader: FramedRead<OwnedReadHalf, LinesCodec>,
    writer: FramedWrite<OwnedWriteHalf, LinesCodec>,
}

impl AkrunClient {
    pub async fn connect(socket_path: &Path) -> Result<Self> {
        let stream = UnixStream::connect(socket_path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::ConnectionRefused
                || e.kind() == std::io::ErrorKind::NotFound
            {
                anyhow!("akrun server is not running. Start it with: akrun server start")
            } else {
                anyhow!(
                    "failed to connect to akrun server at {}: {e}",
                    socket_path.display()
                )
            }
        })?;
        let (r, w) = stream.into_split();
        Ok(Self {
            reader: FramedRead::new(r, LinesCodec::new_with_max_length(MAX_JSON_LINE_BYTES)),
            writer: FramedWrite::new(w, LinesCodec::new_with_max_length(MAX_JSON_LINE_BYTES)),
        })
    }

    async fn next_response(&mut self) -> Result<Response> {
        let Some(line) = self.reader.next().await else {
            bail!("server closed connection");
        };
        Ok(serde_json::from_str(&line?)?)
    }

    /// Send `req` and return the data of the answer, or its error message.
    pub async fn request(&mut self, req: &Request) -> Result<Option<Value>> {
        self.writer.send(serde_json::to_string(req)?).await?;
        match self.next_response().await? {
            Response::Ok { data } => Ok(data),
            Response::Error { message, code } => {
                let code = serde_json::to_value(code)?;
                bail!("{message} ({})", code.as_str().unwrap_or("error"))
            }
        }
    }
}
