//! Session transport: a small authenticated blob server and its client.
//!
//! The producer pushes a file under a unique name, the consumer fetches it
//! later by that name and the blob is deleted once the transfer is done.

pub mod client;
pub mod protocol;
pub mod server;

pub use client::{BlobReader, SessionClient};
pub use server::{RunningSessionServer, SessionServer};
