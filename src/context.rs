//! Invocation Context
//!
//! One [`InvocationContext`] is created per top-level cache call. It carries
//! the active transaction (if any), the per-invocation lock ledger that is
//! always drained when the call returns, the MVCC working copies of a
//! non-transactional call, and the caller's [`Options`] overrides.

use std::time::Duration;

use crate::fqn::Fqn;
use crate::interceptors::InterceptorChain;
use crate::lock::{AcquiredLock, LockOwner};
use crate::transaction::{GlobalTransaction, SharedTransactionContext};
use crate::tree::Workspace;

/// Per-call option overrides
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Options {
    /// Do not replicate or invalidate this call
    pub cache_mode_local: bool,
    /// Acquire no locks
    pub suppress_locking: bool,
    /// Swallow errors and return an empty result
    pub fail_silently: bool,
    /// Do not read through the cache loader
    pub skip_cache_loading: bool,
    /// Reads take write locks
    pub force_write_lock: bool,
    /// Overrides the configured acquisition timeout
    pub lock_acquisition_timeout: Option<Duration>,
    /// Allow the call while the cache is not started
    pub skip_cache_status_check: bool,
}

impl Options {
    pub fn cache_mode_local(mut self) -> Self {
        self.cache_mode_local = true;
        self
    }

    pub fn suppress_locking(mut self) -> Self {
        self.suppress_locking = true;
        self
    }

    pub fn fail_silently(mut self) -> Self {
        self.fail_silently = true;
        self
    }

    pub fn skip_cache_loading(mut self) -> Self {
        self.skip_cache_loading = true;
        self
    }

    pub fn force_write_lock(mut self) -> Self {
        self.force_write_lock = true;
        self
    }

    pub fn lock_acquisition_timeout(mut self, timeout: Duration) -> Self {
        self.lock_acquisition_timeout = Some(timeout);
        self
    }

    pub fn skip_cache_status_check(mut self) -> Self {
        self.skip_cache_status_check = true;
        self
    }
}

/// Transaction attached to an invocation
#[derive(Debug, Clone)]
pub struct TxHandle {
    pub gtx: GlobalTransaction,
    pub context: SharedTransactionContext,
}

/// Per-invocation state
#[derive(Debug)]
pub struct InvocationContext {
    options: Options,
    tx: Option<TxHandle>,
    origin_local: bool,
    locks: Vec<AcquiredLock>,
    workspace: Workspace,
    default_lock_timeout: Duration,
    chain: Option<InterceptorChain>,
}

impl InvocationContext {
    /// Context for a call made by a local application thread
    pub fn new(options: Options, default_lock_timeout: Duration) -> Self {
        Self {
            options,
            tx: None,
            origin_local: true,
            locks: Vec::new(),
            workspace: Workspace::new(),
            default_lock_timeout,
            chain: None,
        }
    }

    /// Context for a command received from another member
    pub fn remote(options: Options, default_lock_timeout: Duration) -> Self {
        Self {
            origin_local: false,
            ..Self::new(options.cache_mode_local(), default_lock_timeout)
        }
    }

    // ----- options -----

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn options_mut(&mut self) -> &mut Options {
        &mut self.options
    }

    pub fn is_origin_local(&self) -> bool {
        self.origin_local
    }

    /// Effective acquisition timeout
    pub fn lock_timeout(&self) -> Duration {
        self.options
            .lock_acquisition_timeout
            .unwrap_or(self.default_lock_timeout)
    }

    // ----- transaction -----

    pub fn transaction(&self) -> Option<&GlobalTransaction> {
        self.tx.as_ref().map(|tx| &tx.gtx)
    }

    pub fn tx_context(&self) -> Option<SharedTransactionContext> {
        self.tx.as_ref().map(|tx| tx.context.clone())
    }

    pub fn set_transaction(&mut self, tx: Option<TxHandle>) {
        self.tx = tx;
    }

    pub fn is_in_transaction(&self) -> bool {
        self.tx.is_some()
    }

    /// Identity that owns locks taken by this invocation
    pub fn lock_owner(&self) -> LockOwner {
        match &self.tx {
            Some(tx) => LockOwner::Transaction(tx.gtx.clone()),
            None => LockOwner::current_thread(),
        }
    }

    // ----- lock ledger -----

    /// Record an acquisition to be released at the transaction boundary,
    /// or at the end of the invocation when there is no transaction
    pub fn record_lock(&mut self, lock: AcquiredLock) {
        match &self.tx {
            Some(tx) => tx.context.lock().locks.push(lock),
            None => self.locks.push(lock),
        }
    }

    /// Record an acquisition released at the end of this invocation
    pub fn record_invocation_lock(&mut self, lock: AcquiredLock) {
        self.locks.push(lock);
    }

    /// Move the invocation ledger entry for `fqn` to the transaction ledger
    pub fn promote_lock(&mut self, fqn: &Fqn) {
        let Some(tx) = &self.tx else { return };
        if let Some(pos) = self.locks.iter().position(|lock| &lock.fqn == fqn) {
            let lock = self.locks.remove(pos);
            tx.context.lock().locks.push(lock);
        }
    }

    /// Invocation ledger
    pub fn invocation_locks(&self) -> &[AcquiredLock] {
        &self.locks
    }

    /// Drain the invocation ledger
    pub fn take_invocation_locks(&mut self) -> Vec<AcquiredLock> {
        std::mem::take(&mut self.locks)
    }

    // ----- MVCC working copies -----

    pub fn workspace_mut(&mut self) -> &mut Workspace {
        &mut self.workspace
    }

    pub fn take_workspace(&mut self) -> Workspace {
        std::mem::take(&mut self.workspace)
    }

    // ----- chain -----

    pub fn chain(&self) -> Option<&InterceptorChain> {
        self.chain.as_ref()
    }

    pub fn set_chain(&mut self, chain: InterceptorChain) {
        self.chain = Some(chain);
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::LockMode;
    use crate::transaction::{Address, TransactionTable};
    use crate::tree::TreeNode;
    use std::sync::Arc;

    fn lock_on(path: &str) -> AcquiredLock {
        AcquiredLock::node(Arc::new(TreeNode::new(Fqn::from_string(path))), LockMode::Read)
    }

    #[test]
    fn test_timeout_override() {
        let ctx = InvocationContext::new(Options::default(), Duration::from_secs(10));
        assert_eq!(ctx.lock_timeout(), Duration::from_secs(10));

        let ctx = InvocationContext::new(
            Options::default().lock_acquisition_timeout(Duration::ZERO),
            Duration::from_secs(10),
        );
        assert_eq!(ctx.lock_timeout(), Duration::ZERO);
    }

    #[test]
    fn test_remote_context_is_local_only() {
        let ctx = InvocationContext::remote(Options::default(), Duration::from_secs(1));
        assert!(!ctx.is_origin_local());
        assert!(ctx.options().cache_mode_local);
    }

    #[test]
    fn test_ledger_routing() {
        let table = TransactionTable::new();
        let gtx = GlobalTransaction::new(Address::random(), 1);
        let (txc, _) = table.get_or_create(&gtx, false);

        let mut ctx = InvocationContext::new(Options::default(), Duration::from_secs(1));
        ctx.record_lock(lock_on("/a"));
        assert_eq!(ctx.invocation_locks().len(), 1);

        ctx.set_transaction(Some(TxHandle {
            gtx: gtx.clone(),
            context: txc.clone(),
        }));
        assert_eq!(ctx.lock_owner(), LockOwner::Transaction(gtx));
        ctx.record_lock(lock_on("/b"));
        assert_eq!(txc.lock().locks.len(), 1);

        ctx.record_invocation_lock(lock_on("/c"));
        ctx.promote_lock(&Fqn::from_string("/c"));
        assert_eq!(txc.lock().locks.len(), 2);
        assert_eq!(ctx.take_invocation_locks().len(), 1);
    }
}
