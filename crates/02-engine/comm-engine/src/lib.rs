//! Funnelled communication engine.
//!
//! Multiplexes active messages and put/get transfers over a single
//! [`transport::Transport`] endpoint with a bounded table of outstanding
//! requests. Persistent receives for registered tags sit in a static region
//! of the table; transient transfers share a dynamic region and spill into an
//! overflow queue when it is full. [`Engine::progress`] polls the table,
//! runs completion callbacks, compacts, and drains the overflow queue.

#![allow(missing_docs)]

mod callback;
mod config;
mod engine;
mod error;
mod handshake;
mod hooks;
mod mem;
mod overflow;
mod rendezvous;
mod runtime;
mod slots;
mod tag;

pub use callback::{
    ActiveMessage, AmHandler, CompletionToken, LocalCompletion, OneSidedCompletion,
    RemoteCompletion, RemoteHandler,
};
pub use config::EngineConfig;
pub use engine::Engine;
pub use error::{EngineError, EngineResult};
pub use hooks::{CommEvent, EngineStats, Hook, Hooks, TransferKind};
pub use mem::{HandleToken, MemHandle, MemRegistration};
pub use rendezvous::Transfer;
pub use runtime::{ServiceEngine, WorkerRuntime};
pub use slots::SlotStats;
pub use tag::{TagLayout, FIRST_USER_TAG, GET_TAG, PUT_TAG};
