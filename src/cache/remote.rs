//! Remote Command Application
//!
//! Commands received from other members run through the same chain as
//! local calls, but in a context marked remote so they are neither
//! replicated again nor enlisted in the receiving thread's transaction.

use std::time::Duration;

use tracing::{trace, warn};

use super::CacheCore;
use crate::commands::ReplicableCommand;
use crate::context::{InvocationContext, Options};
use crate::domain::ports::RemoteCommandHandler;
use crate::error::Result;
use crate::transaction::Address;

impl CacheCore {
    fn apply_remote(&self, origin: Address, command: ReplicableCommand) -> Result<()> {
        let options = match command {
            ReplicableCommand::PutForExternalRead { .. } => Options::default()
                .fail_silently()
                .lock_acquisition_timeout(Duration::ZERO),
            _ => Options::default(),
        };
        let Some(command) = command.into_command() else { return Ok(()) };
        trace!(origin = %origin, command = %command, "applying remote command");

        let mut ctx = InvocationContext::remote(options, self.config.lock_acquisition_timeout);
        self.chain.invoke(&mut ctx, &command).map(|_| ())
    }
}

impl RemoteCommandHandler for CacheCore {
    fn handle_remote(&self, origin: Address, command: ReplicableCommand) -> Result<()> {
        let ReplicableCommand::Batch { commands } = command else {
            return self.apply_remote(origin, command);
        };

        // Every queued command is attempted; the first failure is reported
        let mut first_error = None;
        for command in commands {
            if let Err(e) = self.apply_remote(origin, command) {
                warn!(origin = %origin, error = %e, "remote batch entry failed");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}
