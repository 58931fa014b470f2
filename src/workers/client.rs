//! Headless client workers driving the transfer engine: `send` streams
//! files to a waiting peer, `receive` mints a code and writes whatever
//! arrives into an output directory.

use crate::core::engine::signaling::WsSignaling;
use crate::core::engine::{
    mint_code, EngineEvent, OutgoingFile, TransferConfig, TransferSession, TransferStatus,
};
use crate::core::transport::webrtc::WebRtcTransport;
use crate::core::transport::{TransportConfig, TransportFactory};
use crate::utils::sos::SignalOfStop;
use anyhow::{anyhow, bail, Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Production transport factory: WebRTC endpoints with default ICE servers.
fn webrtc_factory() -> TransportFactory {
    Arc::new(|initiator| {
        Box::pin(WebRtcTransport::create(initiator, TransportConfig::default()))
    })
}

// ── Send ──────────────────────────────────────────────────────────────────────

pub async fn send(
    broker_url: &str,
    code: &str,
    paths: &[PathBuf],
    config: TransferConfig,
    sos: SignalOfStop,
) -> Result<()> {
    let mut files = Vec::with_capacity(paths.len());
    for path in paths {
        let data = tokio::fs::read(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| anyhow!("{} has no usable file name", path.display()))?;
        files.push(OutgoingFile::new(name, "application/octet-stream", data));
    }

    let (link, sig_events) = WsSignaling::connect(broker_url, code).await?;
    let (session, handle, mut events) = TransferSession::sender(
        code,
        files,
        link,
        sig_events,
        webrtc_factory(),
        config,
    );
    let task = tokio::spawn(session.run());

    let outcome = drive(&mut events, &sos, &handle, |_event| Ok(())).await;
    task.await??;
    outcome
}

// ── Receive ───────────────────────────────────────────────────────────────────

pub async fn receive(
    broker_url: &str,
    output_dir: &Path,
    config: TransferConfig,
    sos: SignalOfStop,
) -> Result<()> {
    let code = mint_code();
    let (link, sig_events) = WsSignaling::connect(broker_url, &code).await?;
    let (session, handle, mut events) = TransferSession::receiver(
        &code,
        link,
        sig_events,
        webrtc_factory(),
        config,
    );
    let task = tokio::spawn(session.run());

    let output_dir = output_dir.to_path_buf();
    let outcome = drive(&mut events, &sos, &handle, move |event| {
        match event {
            EngineEvent::CodeReady { code } => {
                // The one deliberate stdout line: the human hands this code
                // to the sender.
                println!("Share this code with the sender: {code}");
            }
            EngineEvent::FileReceived { metadata, bytes } => {
                let dest = output_dir.join(sanitize_file_name(&metadata.file_name));
                let bytes = bytes.clone();
                let dest_log = dest.clone();
                tokio::spawn(async move {
                    if let Err(e) = tokio::fs::write(&dest, &bytes).await {
                        warn!(event = "file_write_failure", path = %dest.display(), error = %e, "Failed to write received file");
                    } else {
                        info!(event = "file_saved", path = %dest_log.display(), bytes = bytes.len(), "File saved");
                    }
                });
            }
            _ => {}
        }
        Ok(())
    })
    .await;
    task.await??;
    outcome
}

// ── Shared event pump ─────────────────────────────────────────────────────────

/// Drain engine events until a terminal status, reacting to ctrl-c by
/// cancelling the session.
async fn drive(
    events: &mut mpsc::UnboundedReceiver<EngineEvent>,
    sos: &SignalOfStop,
    handle: &crate::core::engine::SessionHandle,
    mut on_event: impl FnMut(&EngineEvent) -> Result<()>,
) -> Result<()> {
    let mut cancel_requested = false;
    loop {
        tokio::select! {
            _ = sos.wait(), if !cancel_requested => {
                handle.cancel();
                cancel_requested = true;
            }
            event = events.recv() => {
                let Some(event) = event else {
                    bail!("engine event channel closed before a terminal status");
                };
                match &event {
                    EngineEvent::StatusChanged(status) => {
                        info!(event = "status", status = status.as_str(), "Transfer status");
                        match status {
                            TransferStatus::Completed => return Ok(()),
                            TransferStatus::Cancelled => bail!("transfer cancelled"),
                            TransferStatus::Error => bail!("transfer failed"),
                            _ => {}
                        }
                    }
                    EngineEvent::Progress { bytes_transferred, total_bytes } => {
                        info!(
                            event = "progress",
                            bytes = bytes_transferred,
                            total = total_bytes,
                            "Transfer progress"
                        );
                    }
                    EngineEvent::Error(message) => {
                        warn!(event = "engine_error", message, "Engine reported an error");
                    }
                    EngineEvent::PeerJoined { peer_id, role } => {
                        info!(event = "peer_joined", peer = %peer_id, role = ?role, "Peer joined");
                    }
                    _ => {}
                }
                on_event(&event)?;
            }
        }
    }
}

/// Keep only the final path component, stripped to a safe character set.
fn sanitize_file_name(name: &str) -> String {
    let last = name
        .replace('\\', "/")
        .split('/')
        .filter(|s| !s.is_empty())
        .next_back()
        .map(str::to_string)
        .unwrap_or_default();
    let safe: String = last
        .chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, '.' | '-' | '_' | ' '))
        .collect();
    if safe.is_empty() || safe.chars().all(|c| c == '.') {
        "file".to_string()
    } else {
        safe
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_file_name() {
        assert_eq!(sanitize_file_name("hello.txt"), "hello.txt");
        assert_eq!(sanitize_file_name("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_file_name("dir\\evil.exe"), "evil.exe");
        assert_eq!(sanitize_file_name("..."), "file");
        assert_eq!(sanitize_file_name(""), "file");
        assert_eq!(sanitize_file_name("sp ace-ok_1.bin"), "sp ace-ok_1.bin");
    }
}
