pub mod backoff;
pub mod coordinator;
pub mod error;
pub mod remote;
pub mod token;

pub use backoff::Backoff;
pub use coordinator::SyncCoordinator;
pub use error::SyncError;
pub use remote::{HttpRemoteStore, PullResponse, RemoteStore};
pub use token::{StaticTokenProvider, TokenProvider};
