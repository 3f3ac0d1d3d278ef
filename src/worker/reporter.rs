use anyhow::{Context, Result};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use objsim_types::protocol::encode_line;
use objsim_types::WorkerMessage;

/// Writes tagged messages to the control channel.
pub struct Reporter<W> {
    out: W,
    sent: usize,
}

impl<W: AsyncWrite + Unpin> Reporter<W> {
    pub fn new(out: W) -> Self {
        Self { out, sent: 0 }
    }

    pub async fn send(&mut self, message: &WorkerMessage) -> Result<()> {
        let line = encode_line(message).context("Failed to encode worker message")?;
        self.out
            .write_all(line.as_bytes())
            .await
            .with_context(|| format!("Failed to send {} message", message.tag()))?;
        self.out.flush().await?;
        self.sent += 1;
        Ok(())
    }

    pub fn sent(&self) -> usize {
        self.sent
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}
