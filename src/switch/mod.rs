//! The switch handshake: a client contacts a server on its well-known port, and both move on to a
//!  [crate::channel::Channel] on a port the server allocates for that client alone.

pub mod client;
pub mod messages;
pub mod server;
