//! The command abstraction.
//!
//! A command is one externally triggered unit of work: it runs against a
//! fresh [`CommandContext`], seeds the agenda, and either commits its whole
//! effect at the flush boundary or leaves no trace. The engine is driven
//! exclusively through `ProcessEngine::execute_command`.

use async_trait::async_trait;

use crate::context::CommandContext;
use crate::error::EngineResult;

#[async_trait]
pub trait Command: Send + Sync {
    type Output: Send;

    /// Stable name for logs and retry diagnostics.
    fn name(&self) -> &'static str;

    /// Command body: load state, mutate the cache, seed the agenda. The
    /// pipeline drains the agenda and flushes after this returns.
    async fn execute(&self, ctx: &mut CommandContext) -> EngineResult<Self::Output>;
}
