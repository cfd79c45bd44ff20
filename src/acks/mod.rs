//! Bookkeeping for selective acknowledgements: a cyclic bitfield and a tracker on top of it that
//!  resolves 32 bit ack masks into newly confirmed sequence numbers.

pub mod ack_tracker;
pub mod bitfield;
