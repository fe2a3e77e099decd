// ── rxfer-engine / xfer module ───────────────────────────────────────────────
//
// Connection lifecycle, pooling and transfer-scheduling engine:
//   • `types`     : endpoint descriptors, transfer items, config structs
//   • `error`     : typed engine error with stable codes
//   • `session`   : the session capability the engine consumes + connector
//   • `events`    : engine event bus (connection + queue notifications)
//   • `registry`  : one logical connection per endpoint, auto-reconnect
//   • `pool`      : extra per-endpoint sessions with idle eviction
//   • `collision` : serialised overwrite/skip prompting
//   • `paths`     : remote path helpers and the recursive-delete guard
//   • `traverse`  : bounded breadth-first directory expansion + ignore globs
//   • `scheduler` : bounded-concurrency transfer queue and directory sync
//   • `service`   : `TransferEngine` facade owning all of the above

pub mod types;
pub mod error;
pub mod session;
pub mod events;
pub mod registry;
pub mod pool;
pub mod collision;
pub mod paths;
pub mod traverse;
pub mod scheduler;
pub mod service;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use types::*;
pub use error::{ConnectionFailure, XferError, XferResult};
pub use session::{
    CredentialSource, Credentials, RemoteSession, SessionConnector, SessionEvent, SessionFactory,
};
pub use events::{EngineEvent, EventBus};
pub use registry::ConnectionRegistry;
pub use pool::ConnectionPool;
pub use collision::{CollisionPrompt, CollisionPrompter, CollisionResolver};
pub use scheduler::{TransferHandle, TransferScheduler};
pub use service::TransferEngine;
