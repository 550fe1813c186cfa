//! Management Statistics Interceptor

use std::sync::Arc;
use std::time::Instant;

use super::{Interceptor, Next};
use crate::commands::{Command, CommandResult};
use crate::context::InvocationContext;
use crate::error::Result;
use crate::stats::CacheStatistics;

/// Records hits, misses, stores, removals, evictions and latencies
pub struct CacheMgmtInterceptor {
    stats: Arc<CacheStatistics>,
}

impl CacheMgmtInterceptor {
    pub fn new(stats: Arc<CacheStatistics>) -> Self {
        Self { stats }
    }
}

impl Interceptor for CacheMgmtInterceptor {
    fn name(&self) -> &str {
        "CacheMgmtInterceptor"
    }

    fn handle(&self, ctx: &mut InvocationContext, command: &Command, next: Next<'_>) -> Result<CommandResult> {
        let started = Instant::now();
        let result = next.invoke(ctx, command)?;
        let elapsed = started.elapsed();

        match command {
            Command::Get { .. } | Command::GetData { .. } | Command::GetKeys { .. } | Command::GetNode { .. } => {
                if result.is_hit() {
                    self.stats.record_hit(elapsed);
                } else {
                    self.stats.record_miss(elapsed);
                }
            }
            Command::Put { .. }
            | Command::PutKeyValue { .. }
            | Command::PutForExternalRead { .. }
            | Command::Move { .. } => self.stats.record_store(elapsed),
            Command::RemoveNode { .. } | Command::RemoveKey { .. } | Command::ClearData { .. } => {
                self.stats.record_remove(elapsed)
            }
            Command::Evict { .. } => self.stats.record_eviction(),
            _ => {}
        }
        Ok(result)
    }
}
