//! Notification Interceptor
//!
//! Node events are fired where the change happens (the call interceptor);
//! this stage reports transaction completion.

use std::sync::Arc;

use super::{Interceptor, Next};
use crate::commands::{Command, CommandResult};
use crate::context::InvocationContext;
use crate::domain::events::{CacheEvent, EventKind};
use crate::error::Result;
use crate::notifier::Notifier;

pub struct NotificationInterceptor {
    notifier: Arc<Notifier>,
}

impl NotificationInterceptor {
    pub fn new(notifier: Arc<Notifier>) -> Self {
        Self { notifier }
    }
}

impl Interceptor for NotificationInterceptor {
    fn name(&self) -> &str {
        "NotificationInterceptor"
    }

    fn handle(&self, ctx: &mut InvocationContext, command: &Command, next: Next<'_>) -> Result<CommandResult> {
        let result = next.invoke(ctx, command);

        let successful = match command {
            Command::Commit { .. } => result.is_ok(),
            Command::Rollback { .. } => false,
            _ => return result,
        };
        if let (Some(gtx), true) = (command.boundary_gtx(), ctx.is_in_transaction()) {
            self.notifier.notify_with(EventKind::TransactionCompleted, || {
                CacheEvent::transaction_completed(gtx.clone(), successful)
            })?;
        }
        result
    }
}
