//! Polling of asynchronous API actions.

use tokio::time::{Instant, sleep};
use tracing::debug;

use crate::error::VolumeError;
use crate::volume::CallContext;

use super::types::{ActionEnvelope, ActionResource};
use super::{HTTP_CLIENT, HcloudVolumeService, error};

impl HcloudVolumeService {
    async fn fetch_action(&self, id: u64) -> Result<ActionResource, VolumeError> {
        let envelope: ActionEnvelope = self
            .fetch(HTTP_CLIENT.get(self.url(&format!("/actions/{id}"))))
            .await?;
        Ok(envelope.action)
    }

    /// Polls `action` until it settles, the adapter wait timeout passes or
    /// the caller deadline passes, whichever comes first.
    pub(super) async fn wait_for_action(
        &self,
        ctx: &CallContext,
        action: ActionResource,
    ) -> Result<(), VolumeError> {
        let deadline = ctx.deadline.min(Instant::now() + self.wait_timeout);
        let mut current = action;

        loop {
            match current.status.as_str() {
                "success" => return Ok(()),
                "error" => {
                    return Err(current.error.map_or_else(
                        || VolumeError::Internal(format!("action {} failed", current.id)),
                        |failure| error::classify(&failure.code, &failure.message, None),
                    ));
                }
                _ => {}
            }

            if Instant::now() + self.poll_interval > deadline {
                return Err(VolumeError::Transient(format!(
                    "timed out waiting for action {}",
                    current.id
                )));
            }
            debug!(request_id = %ctx.request_id, action_id = current.id, "action still running");
            sleep(self.poll_interval).await;
            current = self.fetch_action(current.id).await?;
        }
    }
}
