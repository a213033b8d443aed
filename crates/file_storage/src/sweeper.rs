//! Background cleanup of abandoned multipart sessions. Anything a client
//! never completed or aborted is reclaimed here once its token has expired,
//! so a crashed uploader can never leak quota or provider chunks for good.

use common::{
    knobs::SESSION_SWEEP_INTERVAL,
    runtime::Runtime,
};
use errors::report_error;
use storage::UploadId;

use crate::FileStorage;

impl<RT: Runtime> FileStorage<RT> {
    /// One pass over expired sessions. Idempotent and safe against double
    /// execution: the session row delete is the linearization point, and a
    /// session whose file node already exists was completed, so only its
    /// stale row is dropped.
    pub async fn sweep_expired_sessions(&self) -> anyhow::Result<usize> {
        let now = self.rt.unix_timestamp();
        let expired = self.db.expired_sessions(now)?;
        let mut swept = 0;
        for session in expired {
            if !self.db.delete_session(session.id)? {
                continue;
            }
            swept += 1;
            if self.db.node_id_exists(session.file_id)? {
                // Completed upload with a leftover row; reservation is
                // accounted for by the node.
                continue;
            }
            if let Err(e) = self.db.release(session.owner_id, session.total_size) {
                report_error(&e.context(format!(
                    "failed to release quota for expired session {}",
                    session.id
                )));
            }
            self.abort_provider_upload(
                session.owner_id,
                session.file_id,
                &UploadId::from(session.upload_id.clone()),
            )
            .await;
            tracing::info!(
                session_id = %session.id,
                owner_id = %session.owner_id,
                total_size = session.total_size,
                "swept expired multipart session"
            );
        }
        Ok(swept)
    }

    /// Spawns the periodic sweeper task. Runs until the handle is aborted.
    pub fn start_session_sweeper(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(*SESSION_SWEEP_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                match self.sweep_expired_sessions().await {
                    Ok(0) => (),
                    Ok(swept) => tracing::info!(swept, "session sweep finished"),
                    Err(e) => report_error(&e.context("session sweep failed")),
                }
            }
        })
    }
}
