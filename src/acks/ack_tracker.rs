use std::fmt::{Debug, Formatter};
use std::sync::{PoisonError, RwLock};
use tracing::trace;

use crate::acks::bitfield::Bitfield;

/// Number of sequence numbers *before* the acknowledged one that an ack mask covers
const ACK_MASK_BITS: u32 = 32;

/// Tracks which sent sequence numbers are still unacknowledged, and turns incoming ack masks into
///  the set of sequence numbers that are confirmed for the first time.
///
/// A bit is *cleared* while its sequence number is waiting for an ack and *set* otherwise. All
///  bits start out set, so sequence numbers that were never sent are never reported.
///
/// The underlying bitfield is cyclic, i.e. the tracker has meaningful state only for the most
///  recent `bit_len` sequence numbers. Older bits are silently reused: an ack for a sequence
///  number that fell out of the window is never reported twice, but it may not be reported at all.
pub struct AckTracker {
    sent_seq_acks: RwLock<Bitfield>,
}

impl Debug for AckTracker {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "AckTracker{{{}}}", self.read_bitfield())
    }
}

impl Default for AckTracker {
    fn default() -> Self {
        AckTracker {
            sent_seq_acks: RwLock::new(Bitfield::single_word(true)),
        }
    }
}

impl AckTracker {
    /// `min_bit_count` is rounded up to the next power-of-two multiple of 64
    pub fn new(min_bit_count: usize) -> anyhow::Result<AckTracker> {
        Ok(AckTracker {
            sent_seq_acks: RwLock::new(Bitfield::with_min_bits(min_bit_count, true)?),
        })
    }

    pub fn bit_len(&self) -> u64 {
        self.read_bitfield().bit_len()
    }

    fn read_bitfield(&self) -> std::sync::RwLockReadGuard<'_, Bitfield> {
        self.sent_seq_acks.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Marks a sequence number as unacknowledged. This must be called once per sequence number
    ///  before it is first transmitted.
    pub fn sequence_sent(&self, seq: u32) {
        self.sent_seq_acks.write().unwrap_or_else(PoisonError::into_inner)
            .zero_bit(seq as u64);
    }

    pub fn is_acked(&self, seq: u32) -> bool {
        self.read_bitfield().get_bits(seq as u64) & 1 != 0
    }

    /// Applies an acknowledgement for `seq` and the 32 sequence numbers before it: bit `k` of
    ///  `ack_bits` acknowledges `seq - k - 1`, and `seq` itself is always acknowledged.
    ///
    /// Returns the sequence numbers that were newly confirmed, newest first. Stale or duplicate
    ///  acks yield an empty result.
    pub fn receive_acks(&self, seq: u32, ack_bits: u32) -> Vec<u32> {
        // The 64 bit window starts 32 below `seq`: ack bit k maps to window bit 31-k, and `seq`
        //  itself to window bit 32.
        let window_start = seq.wrapping_sub(ACK_MASK_BITS);
        let ack_mask = (ack_bits.reverse_bits() as u64) | (1u64 << ACK_MASK_BITS);

        let new_acks = {
            // test-and-set: reading and updating must happen under the same exclusive lock so
            //  that no two concurrent calls report the same sequence number
            let mut sent_seq_acks = self.sent_seq_acks.write().unwrap_or_else(PoisonError::into_inner);
            let new_acks = !sent_seq_acks.get_bits(window_start as u64) & ack_mask;
            if new_acks == 0 {
                trace!("ack for {} with mask {:#x} contains no new acks", seq, ack_bits);
                return Vec::new();
            }
            sent_seq_acks.or(window_start as u64, new_acks);
            new_acks
        };

        let mut result = Vec::with_capacity(new_acks.count_ones() as usize);
        let mut remaining = new_acks;
        while remaining != 0 {
            let bit_index = u64::BITS - 1 - remaining.leading_zeros();
            result.push(window_start.wrapping_add(bit_index));
            remaining &= !(1u64 << bit_index);
        }
        result
    }
}
