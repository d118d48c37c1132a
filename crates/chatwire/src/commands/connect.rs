use async_trait::async_trait;
use eyre::{Result, eyre};
use std::io::Write;
use std::path::PathBuf;
use tracing::{info, warn};

use super::Command;
use crate::render::render_notification;
use chatwire_core::{ChatwireConfig, StreamRequest, admission_key};

pub struct ConnectCommand {
    pub url: String,
    pub body: String,
    pub user: Option<String>,
    pub headers: Vec<(String, String)>,
    pub config: ChatwireConfig,
    pub session_db: Option<PathBuf>,
}

#[async_trait]
impl Command for ConnectCommand {
    async fn execute(&self) -> Result<()> {
        let body: serde_json::Value = serde_json::from_str(&self.body)
            .map_err(|e| eyre!("--body is not valid JSON: {}", e))?;
        let request = StreamRequest {
            url: self.url.clone(),
            body,
            headers: self.headers.clone(),
        };

        let key = admission_key(self.user.as_deref(), None);
        let service =
            crate::create_service(self.config.clone(), self.session_db.as_ref()).await?;
        let http = reqwest::Client::new();

        let mut handle = match service.connect(&key, &http, &request).await {
            Ok(handle) => handle,
            Err(e) => {
                service.shutdown().await;
                return Err(e.into());
            }
        };
        info!(session_id = %handle.session_id(), url = %self.url, "Streaming response");

        let mut stdout = std::io::stdout();
        let mut cancelled = false;
        loop {
            tokio::select! {
                biased;
                signal = tokio::signal::ctrl_c(), if !cancelled => {
                    if let Err(e) = signal {
                        warn!("Failed to listen for Ctrl-C: {}", e);
                    }
                    cancelled = true;
                    handle.cancel();
                }
                next = handle.recv() => match next {
                    Some(notification) => render_notification(&mut stdout, &notification)?,
                    None => break,
                },
            }
        }

        let snapshot = handle.join().await?;
        service.shutdown().await;

        let mut stderr = std::io::stderr();
        writeln!(
            stderr,
            "Session {} finished {} ({} bytes)",
            snapshot.session_id,
            snapshot.status,
            snapshot.text.len()
        )?;
        Ok(())
    }
}
