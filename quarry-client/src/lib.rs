//! Quarry Client - Cache-Policy Dispatch and Watchers
//!
//! Runs operations through a normalized cache and a transport under a
//! chosen cache policy, fans results out to subscribers, and keeps live
//! watchers current as the cache changes.

pub mod cancel;
pub mod client;
pub mod dispatcher;
pub mod watcher;

pub use cancel::{Cancellable, ResultHandler};
pub use client::QuarryClient;
pub use dispatcher::{DispatchStream, Dispatcher};
pub use watcher::WatcherHandle;
