//! Pull/push synchronization between replicas of a store.
//!
//! A [`SyncServer`] answers requests against its local stores. A
//! [`Synchronizer`] walks the hash tree of one local backing against a
//! [`Remote`], which may be the server in-process ([`LocalRemote`]) or any
//! transport carrying the bincode-framed [`SyncMessage`]s.

mod engine;
mod messages;
mod remote;
mod server;

pub use engine::{SyncFailure, SyncReport, Synchronizer};
pub use messages::{PullRequest, PullResponse, PushOutcome, PushRequest, SyncMessage, SyncReply};
pub use remote::{LocalRemote, Remote};
pub use server::SyncServer;
