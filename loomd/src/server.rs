//! Newline-delimited JSON transport
//!
//! One request object per line in, one response object per line out. The
//! same loop serves TCP connections and the interactive console.

use crate::auth::Auth;
use loom_core::{render, Loom, LoomError};
use serde_json::Value;
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::Instrument;

/// Request handler shared by every connection
#[derive(Debug, Clone)]
pub struct Server {
    loom: Loom,
    auth: Arc<Auth>,
}

impl Server {
    /// Create a server for a running core
    #[must_use]
    pub fn new(loom: Loom, auth: Auth) -> Self {
        Self {
            loom,
            auth: Arc::new(auth),
        }
    }

    /// Core behind this server
    #[inline]
    #[must_use]
    pub fn loom(&self) -> &Loom {
        &self.loom
    }

    /// Answer one request line
    pub async fn respond(&self, line: &str) -> Value {
        let result = match serde_json::from_str::<Value>(line) {
            Ok(request) if request.is_object() => match self.auth.check(&request) {
                Ok(()) => self.loom.handle(&request).await,
                Err(e) => Err(e),
            },
            Ok(_) => Err(LoomError::RequestMalformed("request must be a JSON object".to_string())),
            Err(e) => Err(LoomError::from(e)),
        };

        match &result {
            Err(e) if e.is_client_error() => tracing::info!("Rejected request: {}", e),
            Err(e) => tracing::error!("Request failed: {}", e),
            Ok(_) => {}
        }
        render(result)
    }

    /// Serve requests from `reader` until it closes or the core stops
    ///
    /// # Errors
    /// Returns the I/O error that ended the stream.
    pub async fn serve_lines<R, W>(&self, reader: R, mut writer: W) -> io::Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut stop = self.loom.stop_signal();
        let mut lines = reader.lines();

        loop {
            let line = tokio::select! {
                biased;
                _ = stop.wait_for(|stopped| *stopped) => None,
                line = lines.next_line() => line?,
            };
            let Some(line) = line else { break };
            if line.trim().is_empty() {
                continue;
            }

            let response = self.respond(&line).await;
            let mut payload = serde_json::to_vec(&response)?;
            payload.push(b'\n');
            writer.write_all(&payload).await?;
            writer.flush().await?;
        }
        Ok(())
    }

    /// Accept TCP connections until the core stops
    ///
    /// # Errors
    /// Returns an error only if the listener itself fails.
    pub async fn serve_tcp(&self, listener: TcpListener) -> io::Result<()> {
        tracing::info!("Listening on {}", listener.local_addr()?);
        let mut stop = self.loom.stop_signal();

        loop {
            let accepted = tokio::select! {
                biased;
                _ = stop.wait_for(|stopped| *stopped) => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    let server = self.clone();
                    let span = tracing::info_span!("conn", %peer);
                    tokio::spawn(
                        async move {
                            let (reader, writer) = stream.into_split();
                            if let Err(e) = server.serve_lines(tokio::io::BufReader::new(reader), writer).await {
                                tracing::warn!("Connection closed with error: {}", e);
                            }
                        }
                        .instrument(span),
                    );
                }
                Err(e) => tracing::error!("Accept error: {}", e),
            }
        }

        tracing::info!("Listener stopped");
        Ok(())
    }
}
