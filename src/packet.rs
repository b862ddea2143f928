
use std::cell::Cell;
use std::rc::Rc;

/// The packet must be received by the remote host, in order relative to other reliable
/// packets on the same channel. Retransmitted until acknowledged.
pub const PACKET_FLAG_RELIABLE: u32 = 1 << 0;

/// The packet bypasses channel sequencing entirely. It may arrive out of order
/// relative to every other packet, but duplicates are discarded by the receiver.
pub const PACKET_FLAG_UNSEQUENCED: u32 = 1 << 1;

/// Advisory flag indicating the packet was constructed around an existing buffer
/// rather than a copy. [`Packet::from_boxed`] sets it implicitly.
pub const PACKET_FLAG_NO_ALLOCATE: u32 = 1 << 2;

/// An unreliable packet larger than one fragment is split into unreliable fragments
/// instead of falling back to reliable delivery.
pub const PACKET_FLAG_UNRELIABLE_FRAGMENT: u32 = 1 << 3;

/// Set by the engine once the packet has been transmitted at least once.
pub const PACKET_FLAG_SENT: u32 = 1 << 8;

struct Shared {
    data: Box<[u8]>,
    flags: Cell<u32>,
}

/// A reference-counted application payload.
///
/// A packet stays alive while any queued command or the application holds a handle to
/// it; cloning a `Packet` clones the handle, not the bytes. The payload itself is
/// immutable once created.
#[derive(Clone)]
pub struct Packet {
    shared: Rc<Shared>,
}

impl Packet {
    /// Creates a packet by copying the given slice.
    pub fn new(data: &[u8], flags: u32) -> Self {
        Self {
            shared: Rc::new(Shared {
                data: data.into(),
                flags: Cell::new(flags & !PACKET_FLAG_SENT),
            }),
        }
    }

    /// Creates a packet around an existing buffer without copying.
    pub fn from_boxed(data: Box<[u8]>, flags: u32) -> Self {
        Self {
            shared: Rc::new(Shared {
                data,
                flags: Cell::new((flags | PACKET_FLAG_NO_ALLOCATE) & !PACKET_FLAG_SENT),
            }),
        }
    }

    /// The packet's payload bytes.
    pub fn data(&self) -> &[u8] {
        &self.shared.data
    }

    /// The payload length in bytes.
    pub fn len(&self) -> usize {
        self.shared.data.len()
    }

    /// Returns `true` if the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.shared.data.is_empty()
    }

    /// The packet's flag bits.
    pub fn flags(&self) -> u32 {
        self.shared.flags.get()
    }

    /// The number of live handles to this packet, including this one.
    pub fn reference_count(&self) -> usize {
        Rc::strong_count(&self.shared)
    }

    // Wraps an engine-owned buffer for delivery to the application.
    pub(crate) fn from_incoming(data: Box<[u8]>, flags: u32) -> Self {
        Self {
            shared: Rc::new(Shared {
                data,
                flags: Cell::new(flags),
            }),
        }
    }

    pub(crate) fn mark_sent(&self) {
        self.shared.flags.set(self.shared.flags.get() | PACKET_FLAG_SENT);
    }
}

impl std::fmt::Debug for Packet {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Packet")
            .field("len", &self.len())
            .field("flags", &self.flags())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clone_shares_data() {
        let a = Packet::new(&[1, 2, 3], PACKET_FLAG_RELIABLE);
        let b = a.clone();

        assert_eq!(a.reference_count(), 2);
        assert_eq!(b.data(), &[1, 2, 3]);

        drop(b);
        assert_eq!(a.reference_count(), 1);
    }

    #[test]
    fn sent_flag_visible_through_clones() {
        let a = Packet::new(&[0; 8], 0);
        let b = a.clone();

        assert_eq!(b.flags() & PACKET_FLAG_SENT, 0);
        a.mark_sent();
        assert_ne!(b.flags() & PACKET_FLAG_SENT, 0);
    }

    #[test]
    fn from_boxed_does_not_copy_flags_blindly() {
        let p = Packet::from_boxed(vec![5; 4].into_boxed_slice(), PACKET_FLAG_SENT);

        // SENT is reserved for the engine and cleared at construction.
        assert_eq!(p.flags() & PACKET_FLAG_SENT, 0);
        assert_ne!(p.flags() & PACKET_FLAG_NO_ALLOCATE, 0);
    }
}
