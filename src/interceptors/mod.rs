//! Interceptor Chain
//!
//! Every command runs through a frozen pipeline of [`Interceptor`]s. Each one
//! receives the [`InvocationContext`], the [`Command`] and a [`Next`] handle
//! to the rest of the pipeline; it may work before and after delegating, or
//! return without delegating at all.
//!
//! # Default order (outermost first)
//!
//! ```text
//! InvocationContextInterceptor
//! CacheMgmtInterceptor            (statistics enabled)
//! TxInterceptor
//! NotificationInterceptor
//! Replication/InvalidationInterceptor (clustered)
//! CacheLoader/ActivationInterceptor   (loader, MVCC)
//! PessimisticLockInterceptor | MvccLockingInterceptor
//! CacheLoader/ActivationInterceptor   (loader, pessimistic)
//! CacheStore/PassivationInterceptor   (loader)
//! EvictionInterceptor             (eviction)
//! CallInterceptor
//! ```

mod call;
mod eviction;
mod factory;
mod invalidation;
mod invocation_context;
mod loader;
mod mgmt;
mod mvcc;
mod notification;
mod pessimistic;
mod replication;
mod store;
mod tx;

use std::fmt;
use std::sync::Arc;

pub use call::{CallInterceptor, ViewKind};
pub use eviction::EvictionInterceptor;
pub use factory::{ChainComponents, ChainFactory};
pub use invalidation::InvalidationInterceptor;
pub use invocation_context::InvocationContextInterceptor;
pub use loader::CacheLoaderInterceptor;
pub use mgmt::CacheMgmtInterceptor;
pub use mvcc::MvccLockingInterceptor;
pub use notification::NotificationInterceptor;
pub use pessimistic::PessimisticLockInterceptor;
pub use replication::{ReplicationInterceptor, ReplicationQueue};
pub use store::{CacheStoreInterceptor, PassivationInterceptor};
pub use tx::TxInterceptor;

use crate::commands::{Command, CommandResult};
use crate::context::InvocationContext;
use crate::error::Result;

/// One stage of the pipeline
pub trait Interceptor: Send + Sync {
    /// Name used for placement and display
    fn name(&self) -> &str;

    /// Handle `command`, delegating to `next` as needed
    fn handle(&self, ctx: &mut InvocationContext, command: &Command, next: Next<'_>) -> Result<CommandResult>;
}

/// Remainder of the pipeline after the current interceptor
///
/// `Next` is `Copy`: an interceptor may run the rest of the pipeline more
/// than once, e.g. once per modification of a received transaction.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    rest: &'a [Arc<dyn Interceptor>],
}

impl<'a> Next<'a> {
    /// Run the remaining interceptors
    pub fn invoke(self, ctx: &mut InvocationContext, command: &Command) -> Result<CommandResult> {
        match self.rest.split_first() {
            Some((head, rest)) => head.handle(ctx, command, Next { rest }),
            None => Ok(CommandResult::None),
        }
    }

    /// True when nothing follows
    pub fn is_end(&self) -> bool {
        self.rest.is_empty()
    }
}

/// Frozen, ordered interceptor pipeline
#[derive(Clone)]
pub struct InterceptorChain {
    interceptors: Arc<[Arc<dyn Interceptor>]>,
}

impl InterceptorChain {
    pub(crate) fn new(interceptors: Vec<Arc<dyn Interceptor>>) -> Self {
        Self {
            interceptors: interceptors.into(),
        }
    }

    /// Run `command` through the whole chain
    pub fn invoke(&self, ctx: &mut InvocationContext, command: &Command) -> Result<CommandResult> {
        if ctx.chain().is_none() {
            ctx.set_chain(self.clone());
        }
        Next {
            rest: &self.interceptors,
        }
        .invoke(ctx, command)
    }

    pub fn len(&self) -> usize {
        self.interceptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }

    /// Interceptor names, outermost first
    pub fn names(&self) -> Vec<String> {
        self.interceptors.iter().map(|i| i.name().to_string()).collect()
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.interceptors.iter().position(|i| i.name() == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    pub fn get(&self, index: usize) -> Option<&Arc<dyn Interceptor>> {
        self.interceptors.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Interceptor>> {
        self.interceptors.iter()
    }
}

impl fmt::Debug for InterceptorChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.interceptors.iter().map(|i| i.name())).finish()
    }
}

impl fmt::Display for InterceptorChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, interceptor) in self.interceptors.iter().enumerate() {
            writeln!(f, "{:>2}. {}", index, interceptor.name())?;
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fqn::Fqn;
    use parking_lot::Mutex;
    use std::time::Duration;

    struct Recording {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
        short_circuit: bool,
    }

    impl Interceptor for Recording {
        fn name(&self) -> &str {
            self.name
        }

        fn handle(&self, ctx: &mut InvocationContext, command: &Command, next: Next<'_>) -> Result<CommandResult> {
            self.log.lock().push(format!("enter {}", self.name));
            if self.short_circuit {
                return Ok(CommandResult::Bool(true));
            }
            let result = next.invoke(ctx, command);
            self.log.lock().push(format!("leave {}", self.name));
            result
        }
    }

    fn chain(log: &Arc<Mutex<Vec<String>>>, short_at: Option<&'static str>) -> InterceptorChain {
        let interceptors: Vec<Arc<dyn Interceptor>> = ["a", "b", "c"]
            .into_iter()
            .map(|name| {
                Arc::new(Recording {
                    name,
                    log: Arc::clone(log),
                    short_circuit: short_at == Some(name),
                }) as Arc<dyn Interceptor>
            })
            .collect();
        InterceptorChain::new(interceptors)
    }

    fn exists() -> Command {
        Command::Exists {
            fqn: Fqn::from_string("/a"),
        }
    }

    #[test]
    fn test_wrap_unwrap_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = chain(&log, None);
        let mut ctx = InvocationContext::new(Default::default(), Duration::from_secs(1));

        chain.invoke(&mut ctx, &exists()).unwrap();
        assert_eq!(
            *log.lock(),
            vec!["enter a", "enter b", "enter c", "leave c", "leave b", "leave a"]
        );
        assert!(ctx.chain().is_some());
    }

    #[test]
    fn test_short_circuit() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = chain(&log, Some("b"));
        let mut ctx = InvocationContext::new(Default::default(), Duration::from_secs(1));

        let result = chain.invoke(&mut ctx, &exists()).unwrap();
        assert_eq!(result, CommandResult::Bool(true));
        assert_eq!(*log.lock(), vec!["enter a", "enter b", "leave a"]);
    }

    #[test]
    fn test_introspection() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = chain(&log, None);
        assert_eq!(chain.names(), vec!["a", "b", "c"]);
        assert_eq!(chain.position("c"), Some(2));
        assert!(!chain.contains("z"));
        assert_eq!(format!("{:?}", chain), r#"["a", "b", "c"]"#);
    }
}
