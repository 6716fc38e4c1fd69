#![warn(clippy::all, clippy::pedantic, clippy::cargo, clippy::nursery)]

pub mod jsonrpc;
pub mod nats;

mod client;
mod shutdown;
mod state;
mod subject;

pub use client::{
    ClientId, ClientProfile, ClientStatus, ClientVersion, ConnectionType, Head, NodeInfo,
    SyncStatus,
};
pub use shutdown::shutdown_token;
pub use state::{profile_bucket, status_bucket, StateManager};
pub use subject::{
    new_heads_stream_name, new_heads_stream_subjects, new_heads_subject, rpc_subject,
    rpc_subject_prefix, sanitize_version_token, subject_name,
};
