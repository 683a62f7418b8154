//! Object-bus client: request/response calls and signal subscriptions over
//! a newline-delimited JSON Unix socket.

use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::warn;

use crate::ipc::{Method, Request, Response, ResponseData, Signal};

/// Frames larger than this are junk, not requests.
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// A connection to one published object.
pub struct BusClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    next_id: u64,
    path: PathBuf,
}

impl BusClient {
    /// Connects with a short retry window, enough to ride out a daemon
    /// restart recreating its socket.
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self> {
        Self::connect_with_retries(path, 10, Duration::from_millis(50)).await
    }

    /// Connects, retrying `attempts` times with `delay` between attempts.
    /// The sync daemon lookup uses this with its own long backoff.
    pub async fn connect_with_retries(
        path: impl AsRef<Path>,
        attempts: usize,
        delay: Duration,
    ) -> Result<Self> {
        let path = path.as_ref();

        for attempt in 0..attempts {
            match UnixStream::connect(path).await {
                Ok(stream) => {
                    let (reader, writer) = stream.into_split();
                    return Ok(BusClient {
                        reader: BufReader::new(reader),
                        writer,
                        next_id: 1,
                        path: path.to_path_buf(),
                    });
                }
                Err(_) if attempt + 1 < attempts => sleep(delay).await,
                Err(e) => {
                    return Err(e).with_context(|| {
                        format!("connecting to {} after {attempts} attempts", path.display())
                    });
                }
            }
        }

        bail!("connecting to {}: no attempts made", path.display())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Sends one request and waits for its response. Typed errors from the
    /// far side come back as [`crate::ipc::IpcError`] inside the anyhow
    /// chain so callers can downcast for policy rejections.
    pub async fn call(&mut self, method: Method) -> Result<ResponseData> {
        let id = self.next_id;
        self.next_id += 1;

        let frame = serde_json::to_string(&Request { id, method })? + "\n";
        self.writer
            .write_all(frame.as_bytes())
            .await
            .context("sending request")?;

        let mut line = String::new();
        let n = self
            .reader
            .read_line(&mut line)
            .await
            .context("reading response")?;
        if n == 0 {
            bail!("connection to {} closed mid-call", self.path.display());
        }

        let response: Response =
            serde_json::from_str(&line).context("parsing response")?;
        if response.id != id {
            bail!("response id mismatch from {}", self.path.display());
        }

        response.result.map_err(anyhow::Error::from)
    }

    /// Reads all properties of the object into a map.
    pub async fn get_properties(&mut self) -> Result<crate::ipc::PropertyMap> {
        match self.call(Method::GetProperties).await? {
            ResponseData::Properties(map) => Ok(map),
            other => bail!("unexpected GetProperties response: {other:?}"),
        }
    }
}

/// Opens a dedicated connection in signal-stream mode. The returned channel
/// yields signals until the far side goes away; channel closure is the
/// name-owner-lost indication, distinct from a clean `InterfacesRemoved`.
pub async fn subscribe(path: impl AsRef<Path>) -> Result<mpsc::Receiver<Signal>> {
    let mut client = BusClient::connect(path.as_ref()).await?;

    let frame = serde_json::to_string(&Request {
        id: client.next_id,
        method: Method::Subscribe,
    })? + "\n";
    client
        .writer
        .write_all(frame.as_bytes())
        .await
        .context("sending subscribe")?;

    let path = client.path.clone();
    let mut reader = client.reader;
    let (tx, rx) = mpsc::channel(64);

    tokio::spawn(async move {
        let mut line = String::new();
        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) => break,
                Ok(n) if n > MAX_FRAME_SIZE => {
                    warn!(path = %path.display(), "Oversized signal frame, dropping stream");
                    break;
                }
                Ok(_) => match serde_json::from_str::<Signal>(&line) {
                    Ok(signal) => {
                        if tx.send(signal).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "Unparseable signal frame");
                    }
                },
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Signal stream read failed");
                    break;
                }
            }
        }
    });

    Ok(rx)
}
