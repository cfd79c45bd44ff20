//! Reliable, selectively acknowledged message delivery on top of plain UDP, plus a rendezvous
//!  handshake that moves a peer from a shared well-known port to a private ephemeral port.
//!
//! The protocol is deliberately small. There is no ordering beyond per-message acknowledgement,
//!  no congestion control, no fragmentation and no encryption.
//!
//! ## Reliable frames
//!
//! All numbers are little-endian.
//!
//! ```ascii
//! 0: flags (u8)
//!    * bit 0: ACK_REQUEST  - the receiver must reply with an ACK_RESPONSE for this id
//!    * bit 1: ACK_RESPONSE - acknowledges the frame with this id
//!    * bit 2: MESSAGE      - application payload follows
//!    * bit 3: reserved
//! 1: id (u16) - chosen by the sender, unique among its pending sends
//! 3: payload
//! ```
//!
//! An ACK_RESPONSE is exactly three bytes: `[2][id]`. A sender re-transmits an ACK_REQUEST frame
//!  at a fixed interval until it is acknowledged or the retry budget runs out.
//!
//! ## Switch handshake
//!
//! These datagrams precede channel creation and carry no frame header.
//!
//! ```ascii
//! ConnectionRequest: [major version (u16)][minor version (u16)][32 byte ASCII token]
//! SwitchOffer:       [ConnectionRequest][port (u16)]
//! SwitchAck:         [32 byte ASCII token, distinct from the request token]
//! ```
//!
//! A client sends ConnectionRequests to the server's well-known port. The server binds a fresh
//!  ephemeral socket for the client and keeps offering its port until the client sends a
//!  SwitchAck. From then on, both sides talk through a [channel::Channel] on the private port.

pub mod acks;
pub mod channel;
pub mod config;
pub mod retry;
pub mod socket;
pub mod switch;

#[cfg(test)]
mod test_util;
