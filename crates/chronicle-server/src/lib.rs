#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **chronicle-server** – Request/reply command server for Chronicle.
//!
//! Clients talk to the store through multipart messages over TCP: a
//! request names a command in its first frame and carries arguments in the
//! following frames; replies reuse the same framing, flagging every frame
//! except the last with "more". The [`protocol`] module owns the framing,
//! [`server`] the command dispatch.

pub mod protocol;
pub mod server;

pub use server::CommandServer;
