//! Crypto worker
//!
//! Key derivation and bulk AEAD run on a small pool of OS threads so the
//! async control path never blocks on them. Requests and replies are plain
//! values moved across channels.

mod client;
mod pool;
pub mod protocol;

pub use client::WorkerClient;
pub use pool::CryptoWorker;
pub use protocol::{Operation, Output, Request, Response};
