
#![warn(missing_docs)]

//! `tether` is a connection-based layer over UDP that multiplexes any number of peer
//! connections over a single socket. It provides per-channel reliable and unreliable
//! sequenced delivery, packet fragmentation and reassembly, connection management, and
//! both per-peer and host-wide congestion control, producing a simple and robust data
//! link for real-time applications.
//!
//! # Hosts and peers
//!
//! A [`Host`] owns one UDP socket and a fixed number of peer slots. Connections are
//! initiated with [`Host::connect`], and accepted automatically when a remote host
//! connects. All network activity is driven by [`Host::service`], which delivers at
//! most one [`Event`] per call.
//!
//! # Sending data
//!
//! Data is sent as discrete [`Packet`]s on numbered channels. Each channel is an
//! independent ordering domain: reliable packets on one channel never stall delivery
//! on another. Packet flags select reliable, unreliable, or unsequenced delivery.

mod channel;
mod checksum;
mod compress;
mod host;
mod packet;
mod peer;
mod protocol;

pub use checksum::crc32;
pub use compress::Compressor;
pub use host::Host;
pub use host::HostParams;
pub use host::Intercept;
pub use packet::Packet;
pub use packet::PACKET_FLAG_NO_ALLOCATE;
pub use packet::PACKET_FLAG_RELIABLE;
pub use packet::PACKET_FLAG_SENT;
pub use packet::PACKET_FLAG_UNRELIABLE_FRAGMENT;
pub use packet::PACKET_FLAG_UNSEQUENCED;
pub use peer::Peer;
pub use peer::PeerState;

use thiserror::Error;

/// The maximum number of peer slots a single host may be created with.
pub const MAX_PEER_COUNT: usize = protocol::MAXIMUM_PEER_ID as usize;

/// The maximum number of channels which may be used on a given connection.
pub const MAX_CHANNEL_COUNT: usize = protocol::MAXIMUM_CHANNEL_COUNT as usize;

/// The ratio against which packet throttle acceleration and deceleration are expressed.
///
/// When the throttle sits at this value, no unreliable packets are dropped by the
/// sender; at zero, all unreliable packets carrying data are dropped before transmit.
pub const PACKET_THROTTLE_SCALE: u32 = 32;

/// The ratio against which [`Peer::packet_loss`] is expressed.
pub const PACKET_LOSS_SCALE: u32 = 1 << 16;

/// An index identifying a peer slot of a [`Host`].
///
/// Slot indices are reused after a disconnection, so a `PeerId` only names a
/// particular connection until the corresponding [`Event::Disconnect`] is delivered.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeerId(pub usize);

/// An event produced by [`Host::service`] or [`Host::check_events`].
#[derive(Clone, Debug)]
pub enum Event {
    /// Indicates a successful connection to or from a remote host.
    Connect {
        /// The peer slot of the new connection.
        peer: PeerId,
        /// User data supplied by the connecting host.
        data: u32,
    },
    /// Indicates a disconnection from the remote host.
    Disconnect {
        /// The peer slot of the lost connection. The slot is already reset when this
        /// event is delivered.
        peer: PeerId,
        /// User data supplied by the disconnecting host, or 0 on a timeout.
        data: u32,
    },
    /// Indicates a packet has been received from the remote host.
    Receive {
        /// The peer slot the packet arrived on.
        peer: PeerId,
        /// The channel the packet arrived on.
        channel_id: u8,
        /// The received packet.
        packet: Packet,
    },
}

/// An error produced by a [`Host`] operation.
#[derive(Debug, Error)]
pub enum Error {
    /// The underlying socket failed.
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
    /// A host was configured with more than [`MAX_PEER_COUNT`] peer slots.
    #[error("peer count exceeds maximum")]
    TooManyPeers,
    /// No free peer slot was available for a new connection.
    #[error("all peer slots are in use")]
    NoFreeSlots,
    /// The peer is not in a state that permits the operation.
    #[error("peer is not connected")]
    NotConnected,
    /// The channel index is outside the range negotiated for the connection.
    #[error("invalid channel id")]
    InvalidChannel,
    /// The packet is larger than the host's maximum packet size.
    #[error("packet exceeds maximum packet size")]
    PacketTooLarge,
    /// The peer id does not name a peer slot of this host.
    #[error("invalid peer id")]
    InvalidPeer,
    /// The intercept callback reported a failure.
    #[error("datagram rejected by intercept callback")]
    Intercepted,
}

// Service time wraps a u32 millisecond clock. Two stamps are comparable as long as
// they were taken less than a day apart.
pub(crate) const TIME_OVERFLOW: u32 = 86_400_000;

pub(crate) fn time_less(a: u32, b: u32) -> bool {
    a.wrapping_sub(b) >= TIME_OVERFLOW
}

pub(crate) fn time_greater_equal(a: u32, b: u32) -> bool {
    !time_less(a, b)
}

pub(crate) fn time_difference(a: u32, b: u32) -> u32 {
    if a.wrapping_sub(b) >= TIME_OVERFLOW {
        b.wrapping_sub(a)
    } else {
        a.wrapping_sub(b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_comparisons_wrap() {
        assert!(time_less(0xFFFF_FF00, 0x0000_0100));
        assert!(time_greater_equal(0x0000_0100, 0xFFFF_FF00));
        assert_eq!(time_difference(0x0000_0100, 0xFFFF_FF00), 0x200);
        assert_eq!(time_difference(0xFFFF_FF00, 0x0000_0100), 0x200);
        assert_eq!(time_difference(5000, 1000), 4000);
    }
}
