//! Stdio transport: reads request lines from stdin, writes replies to stdout.

use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::protocol::ProtocolHandler;
use crate::types::{BridgeError, BridgeResult};

use super::codec::{self, MAX_LINE_BYTES};

pub struct StdioTransport {
    handler: ProtocolHandler,
    max_line_bytes: usize,
}

impl StdioTransport {
    pub fn new(handler: ProtocolHandler) -> Self {
        Self {
            handler,
            max_line_bytes: MAX_LINE_BYTES,
        }
    }

    pub fn with_max_line_bytes(mut self, max_line_bytes: usize) -> Self {
        self.max_line_bytes = max_line_bytes;
        self
    }

    /// Run the transport loop over the process's stdin and stdout.
    pub async fn run(&self) -> BridgeResult<()> {
        self.run_with(BufReader::new(tokio::io::stdin()), tokio::io::stdout())
            .await
    }

    /// Run the transport loop until `reader` reaches EOF.
    pub async fn run_with<R, W>(&self, mut reader: R, mut writer: W) -> BridgeResult<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut line = String::new();

        tracing::info!("Stdio transport started");

        loop {
            line.clear();
            let bytes_read = reader.read_line(&mut line).await.map_err(BridgeError::Io)?;

            if bytes_read == 0 {
                tracing::info!("EOF on stdin, shutting down");
                break;
            }

            let reply = match codec::decode_line(&line, self.max_line_bytes) {
                Ok(Some(envelope)) => self.handler.handle_envelope(envelope).await,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!("Rejected request line: {e}");
                    e.to_envelope(Value::Null)
                }
            };
            let framed = codec::encode_reply(&reply)?;
            writer
                .write_all(framed.as_bytes())
                .await
                .map_err(BridgeError::Io)?;
            writer.flush().await.map_err(BridgeError::Io)?;
        }

        Ok(())
    }
}
