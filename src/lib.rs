#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::unused_async)]
#![allow(clippy::implicit_hasher)]
#![allow(clippy::redundant_closure_for_method_calls)]

//! sandboxd library — the building blocks of the in-container sandbox server.
//!
//! - `shell` — file-IPC bash driver, wire protocol, temp files
//! - `sessions` — per-session shells with execution mutexes
//! - `process` — background-process table with output fanout
//! - `code` — code-interpreter contexts and language workers
//! - `ports` — exposed-port registry and reverse proxy
//! - `terminal` — PTY multiplexer with replay buffers
//! - `bucket` — FUSE mounting of S3-compatible buckets
//! - `routes` / `ws` — the HTTP and WebSocket surfaces

pub mod bucket;
pub mod code;
pub mod config;
pub mod error;
pub mod ports;
pub mod process;
pub mod routes;
pub mod security;
pub mod services;
pub mod sessions;
pub mod shell;
pub mod state;
pub mod terminal;
pub mod ws;

// Re-export key types at crate root for convenience.
pub use config::Config;
pub use error::ApiError;
pub use process::ProcessManager;
pub use sessions::SessionRegistry;
pub use state::AppState;
