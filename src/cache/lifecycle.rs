//! Cache Lifecycle

use std::fmt;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Lifecycle phase of a cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ComponentStatus {
    Instantiated,
    Starting,
    Started,
    Stopping,
    Stopped,
    Destroyed,
    /// A lifecycle transition failed; `stop()` is required before restarting
    Failed,
}

impl ComponentStatus {
    /// Only a started cache accepts invocations
    pub fn allows_invocations(&self) -> bool {
        *self == ComponentStatus::Started
    }

    pub fn can_start(&self) -> bool {
        matches!(
            self,
            ComponentStatus::Instantiated | ComponentStatus::Stopped | ComponentStatus::Destroyed
        )
    }

    pub fn can_stop(&self) -> bool {
        matches!(self, ComponentStatus::Started | ComponentStatus::Failed)
    }
}

impl fmt::Display for ComponentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Shared lifecycle status
#[derive(Debug)]
pub struct StatusCell(RwLock<ComponentStatus>);

impl Default for StatusCell {
    fn default() -> Self {
        Self(RwLock::new(ComponentStatus::Instantiated))
    }
}

impl StatusCell {
    pub fn get(&self) -> ComponentStatus {
        *self.0.read()
    }

    pub fn set(&self, status: ComponentStatus) {
        *self.0.write() = status;
    }

    /// Move to `to` if the current status satisfies `allowed`; returns the
    /// previous status
    pub fn transition(&self, allowed: impl Fn(&ComponentStatus) -> bool, to: ComponentStatus) -> Result<ComponentStatus> {
        let mut status = self.0.write();
        if !allowed(&status) {
            return Err(Error::InvalidState(format!("cannot move from {} to {}", *status, to)));
        }
        Ok(std::mem::replace(&mut *status, to))
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_transitions() {
        let cell = StatusCell::default();
        assert_eq!(cell.get(), ComponentStatus::Instantiated);

        let previous = cell.transition(ComponentStatus::can_start, ComponentStatus::Starting).unwrap();
        assert_eq!(previous, ComponentStatus::Instantiated);
        cell.set(ComponentStatus::Started);
        assert!(cell.get().allows_invocations());

        assert_matches!(
            cell.transition(ComponentStatus::can_start, ComponentStatus::Starting),
            Err(Error::InvalidState(_))
        );
    }

    #[test]
    fn test_failed_requires_stop() {
        assert!(!ComponentStatus::Failed.can_start());
        assert!(ComponentStatus::Failed.can_stop());
        assert!(!ComponentStatus::Failed.allows_invocations());
    }
}
