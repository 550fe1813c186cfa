//! Domain Layer
//!
//! - **Ports** (`ports.rs`) - collaborator traits: persistence, transport,
//!   eviction policy, listeners
//! - **Events** (`events.rs`) - cache events delivered through the notifier
//!
//! # Usage
//!
//! ```ignore
//! use treecache::domain::ports::CacheLoader;
//!
//! fn warm<L: CacheLoader>(loader: &L, fqn: &Fqn) -> Result<()> {
//!     if let Some(data) = loader.get(fqn)? {
//!         // ...
//!     }
//!     Ok(())
//! }
//! ```

pub mod events;
pub mod ports;

pub use events::{CacheEvent, EventKind, ModificationType};
pub use ports::{
    CacheListener, CacheLoader, DeliveryMode, EvictionEvent, EvictionPolicy, Modification,
    RemoteCommandHandler, Transport,
};
