/*!
 * Transport-side translation of tasks.
 */
use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::task::{Task, TaskRequest};

/// Turns tasks into transport traffic
///
/// Implemented once per transport. The translator decides how a request is
/// identified for correlation and physically sends launched tasks; the
/// task's [`Command`](crate::command::Command) tells it what to encode.
#[async_trait]
pub trait Translator: Send + Sync + Debug {
    /// Correlation identifier for a request.
    ///
    /// `Ok(None)` marks the command as fire-and-forget. An error aborts the
    /// task before it is dispatched.
    fn identify(&self, request: &TaskRequest) -> Result<Option<String>> {
        Ok(request.default_identifier())
    }

    /// Send a launched task
    async fn transmit(&self, task: &Arc<Task>) -> Result<()>;
}
