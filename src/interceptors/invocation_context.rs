//! Invocation Context Interceptor
//!
//! Outermost stage: refuses calls while the cache is not started and turns
//! failures into empty results for fail-silently calls.

use std::sync::Arc;

use tracing::{debug, trace};

use super::{Interceptor, Next};
use crate::cache::StatusCell;
use crate::commands::{Command, CommandResult};
use crate::context::InvocationContext;
use crate::error::{Error, Result};

pub struct InvocationContextInterceptor {
    status: Arc<StatusCell>,
}

impl InvocationContextInterceptor {
    pub fn new(status: Arc<StatusCell>) -> Self {
        Self { status }
    }
}

impl Interceptor for InvocationContextInterceptor {
    fn name(&self) -> &str {
        "InvocationContextInterceptor"
    }

    fn handle(&self, ctx: &mut InvocationContext, command: &Command, next: Next<'_>) -> Result<CommandResult> {
        // Boundaries still run so that in-flight transactions can finish
        if !ctx.options().skip_cache_status_check && !command.is_transaction_boundary() {
            let status = self.status.get();
            if !status.allows_invocations() {
                return Err(Error::InvalidState(format!("cache is {}, cannot run {}", status, command)));
            }
        }

        trace!(command = %command, origin_local = ctx.is_origin_local(), "invoking");
        match next.invoke(ctx, command) {
            Err(e) if ctx.options().fail_silently => {
                debug!(command = %command, error = %e, "failing silently");
                Ok(CommandResult::None)
            }
            result => result,
        }
    }
}
