use async_trait::async_trait;
use eyre::{Result, eyre};
use futures::stream;
use std::io::Write;
use std::path::PathBuf;
use tokio_util::bytes::Bytes;
use tracing::info;

use super::Command;
use crate::render::render_notification;
use chatwire_core::{ChatwireConfig, SessionSnapshot};

pub struct ReplayCommand {
    pub file: PathBuf,
    pub chunk_size: Option<usize>,
    pub config: ChatwireConfig,
    pub session_db: Option<PathBuf>,
}

#[async_trait]
impl Command for ReplayCommand {
    async fn execute(&self) -> Result<()> {
        let mut stdout = std::io::stdout();
        let snapshot = self.replay_into(&mut stdout).await?;

        let mut stderr = std::io::stderr();
        writeln!(
            stderr,
            "Session {} finished {} at revision {}",
            snapshot.session_id, snapshot.status, snapshot.revision
        )?;
        for diagnostic in &snapshot.diagnostics {
            writeln!(stderr, "warning: {diagnostic}")?;
        }
        Ok(())
    }
}

impl ReplayCommand {
    /// Run the capture through a full session, rendering to `out`.
    pub async fn replay_into<W: Write + Send>(&self, out: &mut W) -> Result<SessionSnapshot> {
        let body = tokio::fs::read(&self.file)
            .await
            .map_err(|e| eyre!("Failed to read {}: {}", self.file.display(), e))?;
        let chunks = split_chunks(body, self.chunk_size);
        info!(
            file = %self.file.display(),
            chunks = chunks.len(),
            "Replaying capture"
        );

        let service =
            crate::create_service(self.config.clone(), self.session_db.as_ref()).await?;
        let byte_stream = stream::iter(chunks.into_iter().map(Ok::<_, std::io::Error>));
        let mut handle = service.open_unchecked(byte_stream);

        while let Some(notification) = handle.recv().await {
            render_notification(out, &notification)?;
        }
        let snapshot = handle.join().await?;
        service.shutdown().await;

        Ok(snapshot)
    }
}

fn split_chunks(body: Vec<u8>, chunk_size: Option<usize>) -> Vec<Bytes> {
    match chunk_size {
        Some(size) if size > 0 => body
            .chunks(size)
            .map(Bytes::copy_from_slice)
            .collect(),
        _ => vec![Bytes::from(body)],
    }
}
