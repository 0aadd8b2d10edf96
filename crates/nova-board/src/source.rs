use nova_core::{ExternalRef, RunId};

use crate::{BoardItem, BoardSchema};

/// The external board tasks come from.
pub trait TaskSource: Send + Sync {
    fn schema(&self) -> &BoardSchema;

    /// Items whose status property carries the ready value.
    fn list_ready(&self) -> anyhow::Result<Vec<BoardItem>>;

    /// Best-effort annotation of the item with the owning run id.
    fn attach_claim_marker(&self, external_ref: &ExternalRef, run_id: &RunId) -> anyhow::Result<()>;
}
