
pub(crate) mod incoming;

use crate::channel::Channel;
use crate::packet::Packet;
use crate::packet::PACKET_FLAG_RELIABLE;
use crate::packet::PACKET_FLAG_UNRELIABLE_FRAGMENT;
use crate::packet::PACKET_FLAG_UNSEQUENCED;
use crate::protocol;
use crate::protocol::serial;
use crate::protocol::Command;
use crate::protocol::FragmentRecord;
use crate::channel::IncomingCommand;
use crate::Error;
use crate::PACKET_THROTTLE_SCALE;

use std::collections::VecDeque;
use std::net;

pub(crate) const DEFAULT_ROUND_TRIP_TIME: u32 = 500;
pub(crate) const DEFAULT_PACKET_THROTTLE: u32 = 32;
pub(crate) const PACKET_THROTTLE_COUNTER: u32 = 7;
pub(crate) const PACKET_THROTTLE_ACCELERATION: u32 = 2;
pub(crate) const PACKET_THROTTLE_DECELERATION: u32 = 2;
pub(crate) const PACKET_THROTTLE_INTERVAL: u32 = 5000;
pub(crate) const PACKET_LOSS_INTERVAL: u32 = 10000;
pub(crate) const WINDOW_SIZE_SCALE: u32 = 64 * 1024;
pub(crate) const TIMEOUT_LIMIT: u32 = 32;
pub(crate) const TIMEOUT_MINIMUM: u32 = 5000;
pub(crate) const TIMEOUT_MAXIMUM: u32 = 30000;
pub(crate) const PING_INTERVAL: u32 = 500;
pub(crate) const UNSEQUENCED_WINDOW_SIZE: u32 = 1024;
pub(crate) const FREE_UNSEQUENCED_WINDOWS: u32 = 32;

/// The connection state of a peer slot.
///
/// States are ordered by connection progress; the discriminant order matters to the
/// engine's bookkeeping.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum PeerState {
    /// The slot is free.
    Disconnected,
    /// A CONNECT has been sent and no reply received yet.
    Connecting,
    /// A CONNECT was accepted; waiting for our VERIFY_CONNECT to be acknowledged.
    AcknowledgingConnect,
    /// The handshake completed on the acceptor side; a connect event is pending.
    ConnectionPending,
    /// The handshake completed on the initiator side; a connect event is pending.
    ConnectionSucceeded,
    /// The connection is established.
    Connected,
    /// A disconnect was requested but queued traffic is still draining.
    DisconnectLater,
    /// A DISCONNECT has been sent and its acknowledgement is pending.
    Disconnecting,
    /// A remote DISCONNECT was received; its acknowledgement is on the wire.
    AcknowledgingDisconnect,
    /// The connection is dead; a disconnect event is pending delivery.
    Zombie,
}

impl PeerState {
    pub(crate) fn is_connected(self) -> bool {
        self == PeerState::Connected || self == PeerState::DisconnectLater
    }
}

#[derive(Debug)]
pub(crate) struct OutgoingCommand {
    pub command: u8,
    pub channel_id: u8,
    pub reliable_sequence_number: u16,
    pub unreliable_sequence_number: u16,
    pub sent_time: u32,
    pub round_trip_timeout: u32,
    pub round_trip_timeout_limit: u32,
    pub fragment_offset: u32,
    pub fragment_length: u16,
    pub send_attempts: u16,
    pub kind: Command,
    pub packet: Option<Packet>,
}

/// A deferred acknowledgement, echoing the sender's timestamp so it can measure the
/// round trip on receipt.
#[derive(Debug)]
pub(crate) struct Acknowledgement {
    pub sent_time: u16,
    pub command: u8,
    pub channel_id: u8,
    pub reliable_sequence_number: u16,
}

/// One connection slot of a [`Host`](crate::Host).
///
/// Peers are owned by their host and addressed by [`PeerId`](crate::PeerId); this
/// type only exposes read access to connection state and statistics. All operations
/// on a peer (sending, disconnecting, configuration) go through the host.
pub struct Peer {
    pub(crate) incoming_peer_id: u16,
    pub(crate) outgoing_peer_id: u16,
    pub(crate) incoming_session_id: u8,
    pub(crate) outgoing_session_id: u8,
    pub(crate) address: Option<net::SocketAddr>,
    pub(crate) state: PeerState,
    pub(crate) channels: Vec<Channel>,

    pub(crate) incoming_bandwidth: u32,
    pub(crate) outgoing_bandwidth: u32,
    pub(crate) incoming_bandwidth_throttle_epoch: u32,
    pub(crate) outgoing_bandwidth_throttle_epoch: u32,
    pub(crate) incoming_data_total: u32,
    pub(crate) outgoing_data_total: u32,

    pub(crate) last_send_time: u32,
    pub(crate) last_receive_time: u32,
    pub(crate) next_timeout: u32,
    pub(crate) earliest_timeout: u32,

    pub(crate) packet_loss_epoch: u32,
    pub(crate) packets_sent: u32,
    pub(crate) packets_lost: u32,
    pub(crate) packet_loss: u32,
    pub(crate) packet_loss_variance: u32,

    pub(crate) packet_throttle: u32,
    pub(crate) packet_throttle_limit: u32,
    pub(crate) packet_throttle_counter: u32,
    pub(crate) packet_throttle_epoch: u32,
    pub(crate) packet_throttle_acceleration: u32,
    pub(crate) packet_throttle_deceleration: u32,
    pub(crate) packet_throttle_interval: u32,

    pub(crate) ping_interval: u32,
    pub(crate) timeout_limit: u32,
    pub(crate) timeout_minimum: u32,
    pub(crate) timeout_maximum: u32,

    pub(crate) last_round_trip_time: u32,
    pub(crate) lowest_round_trip_time: u32,
    pub(crate) last_round_trip_time_variance: u32,
    pub(crate) highest_round_trip_time_variance: u32,
    pub(crate) round_trip_time: u32,
    pub(crate) round_trip_time_variance: u32,

    pub(crate) mtu: u32,
    pub(crate) window_size: u32,
    pub(crate) reliable_data_in_transit: u32,
    pub(crate) outgoing_reliable_sequence_number: u16,

    pub(crate) acknowledgements: VecDeque<Acknowledgement>,
    pub(crate) sent_reliable_commands: VecDeque<OutgoingCommand>,
    pub(crate) sent_unreliable_commands: VecDeque<OutgoingCommand>,
    pub(crate) outgoing_commands: VecDeque<OutgoingCommand>,
    pub(crate) dispatched_commands: VecDeque<IncomingCommand>,
    pub(crate) needs_dispatch: bool,

    pub(crate) incoming_unsequenced_group: u16,
    pub(crate) outgoing_unsequenced_group: u16,
    pub(crate) unsequenced_window: [u32; (UNSEQUENCED_WINDOW_SIZE / 32) as usize],

    pub(crate) event_data: u32,
    pub(crate) connect_id: u32,
    pub(crate) total_waiting_data: usize,
}

impl Peer {
    pub(crate) fn new(incoming_peer_id: u16, host_mtu: u32) -> Self {
        let mut peer = Self {
            incoming_peer_id,
            outgoing_peer_id: protocol::MAXIMUM_PEER_ID,
            incoming_session_id: 0xFF,
            outgoing_session_id: 0xFF,
            address: None,
            state: PeerState::Disconnected,
            channels: Vec::new(),

            incoming_bandwidth: 0,
            outgoing_bandwidth: 0,
            incoming_bandwidth_throttle_epoch: 0,
            outgoing_bandwidth_throttle_epoch: 0,
            incoming_data_total: 0,
            outgoing_data_total: 0,

            last_send_time: 0,
            last_receive_time: 0,
            next_timeout: 0,
            earliest_timeout: 0,

            packet_loss_epoch: 0,
            packets_sent: 0,
            packets_lost: 0,
            packet_loss: 0,
            packet_loss_variance: 0,

            packet_throttle: DEFAULT_PACKET_THROTTLE,
            packet_throttle_limit: PACKET_THROTTLE_SCALE,
            packet_throttle_counter: 0,
            packet_throttle_epoch: 0,
            packet_throttle_acceleration: PACKET_THROTTLE_ACCELERATION,
            packet_throttle_deceleration: PACKET_THROTTLE_DECELERATION,
            packet_throttle_interval: PACKET_THROTTLE_INTERVAL,

            ping_interval: PING_INTERVAL,
            timeout_limit: TIMEOUT_LIMIT,
            timeout_minimum: TIMEOUT_MINIMUM,
            timeout_maximum: TIMEOUT_MAXIMUM,

            last_round_trip_time: DEFAULT_ROUND_TRIP_TIME,
            lowest_round_trip_time: DEFAULT_ROUND_TRIP_TIME,
            last_round_trip_time_variance: 0,
            highest_round_trip_time_variance: 0,
            round_trip_time: DEFAULT_ROUND_TRIP_TIME,
            round_trip_time_variance: 0,

            mtu: host_mtu,
            window_size: protocol::MAXIMUM_WINDOW_SIZE,
            reliable_data_in_transit: 0,
            outgoing_reliable_sequence_number: 0,

            acknowledgements: VecDeque::new(),
            sent_reliable_commands: VecDeque::new(),
            sent_unreliable_commands: VecDeque::new(),
            outgoing_commands: VecDeque::new(),
            dispatched_commands: VecDeque::new(),
            needs_dispatch: false,

            incoming_unsequenced_group: 0,
            outgoing_unsequenced_group: 0,
            unsequenced_window: [0; (UNSEQUENCED_WINDOW_SIZE / 32) as usize],

            event_data: 0,
            connect_id: 0,
            total_waiting_data: 0,
        };

        peer.reset(host_mtu);
        peer
    }

    /// The connection state of the slot.
    pub fn state(&self) -> PeerState {
        self.state
    }

    /// The remote address of the connection, if one has been established or attempted.
    pub fn address(&self) -> Option<net::SocketAddr> {
        self.address
    }

    /// The number of channels negotiated for the connection.
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// The smoothed round trip time estimate, in milliseconds.
    pub fn round_trip_time(&self) -> u32 {
        self.round_trip_time
    }

    /// The round trip time variance estimate, in milliseconds.
    pub fn round_trip_time_variance(&self) -> u32 {
        self.round_trip_time_variance
    }

    /// Mean packet loss, as a ratio against [`PACKET_LOSS_SCALE`](crate::PACKET_LOSS_SCALE).
    pub fn packet_loss(&self) -> u32 {
        self.packet_loss
    }

    /// Packet loss variance, as a ratio against [`PACKET_LOSS_SCALE`](crate::PACKET_LOSS_SCALE).
    pub fn packet_loss_variance(&self) -> u32 {
        self.packet_loss_variance
    }

    /// The current unreliable packet throttle, out of
    /// [`PACKET_THROTTLE_SCALE`](crate::PACKET_THROTTLE_SCALE).
    pub fn packet_throttle(&self) -> u32 {
        self.packet_throttle
    }

    /// The path MTU negotiated for the connection, in bytes.
    pub fn mtu(&self) -> u32 {
        self.mtu
    }

    /// The random nonce pairing the two ends of this connection.
    pub fn connect_id(&self) -> u32 {
        self.connect_id
    }

    /// The ping interval, in milliseconds.
    pub fn ping_interval(&self) -> u32 {
        self.ping_interval
    }

    /// The total payload size of received packets not yet delivered to the
    /// application, in bytes.
    pub fn total_waiting_data(&self) -> usize {
        self.total_waiting_data
    }

    /// Drops all queued traffic and returns the slot to its default configuration.
    /// Session ids survive so a reconnection on the same slot is distinguishable.
    pub(crate) fn reset(&mut self, host_mtu: u32) {
        self.outgoing_peer_id = protocol::MAXIMUM_PEER_ID;
        self.connect_id = 0;

        self.state = PeerState::Disconnected;

        self.incoming_bandwidth = 0;
        self.outgoing_bandwidth = 0;
        self.incoming_bandwidth_throttle_epoch = 0;
        self.outgoing_bandwidth_throttle_epoch = 0;
        self.incoming_data_total = 0;
        self.outgoing_data_total = 0;
        self.last_send_time = 0;
        self.last_receive_time = 0;
        self.next_timeout = 0;
        self.earliest_timeout = 0;
        self.packet_loss_epoch = 0;
        self.packets_sent = 0;
        self.packets_lost = 0;
        self.packet_loss = 0;
        self.packet_loss_variance = 0;
        self.packet_throttle = DEFAULT_PACKET_THROTTLE;
        self.packet_throttle_limit = PACKET_THROTTLE_SCALE;
        self.packet_throttle_counter = 0;
        self.packet_throttle_epoch = 0;
        self.packet_throttle_acceleration = PACKET_THROTTLE_ACCELERATION;
        self.packet_throttle_deceleration = PACKET_THROTTLE_DECELERATION;
        self.packet_throttle_interval = PACKET_THROTTLE_INTERVAL;
        self.ping_interval = PING_INTERVAL;
        self.timeout_limit = TIMEOUT_LIMIT;
        self.timeout_minimum = TIMEOUT_MINIMUM;
        self.timeout_maximum = TIMEOUT_MAXIMUM;
        self.last_round_trip_time = DEFAULT_ROUND_TRIP_TIME;
        self.lowest_round_trip_time = DEFAULT_ROUND_TRIP_TIME;
        self.last_round_trip_time_variance = 0;
        self.highest_round_trip_time_variance = 0;
        self.round_trip_time = DEFAULT_ROUND_TRIP_TIME;
        self.round_trip_time_variance = 0;
        self.mtu = host_mtu;
        self.reliable_data_in_transit = 0;
        self.outgoing_reliable_sequence_number = 0;
        self.window_size = protocol::MAXIMUM_WINDOW_SIZE;
        self.incoming_unsequenced_group = 0;
        self.outgoing_unsequenced_group = 0;
        self.event_data = 0;
        self.total_waiting_data = 0;
        self.unsequenced_window = [0; (UNSEQUENCED_WINDOW_SIZE / 32) as usize];

        self.reset_queues();
    }

    pub(crate) fn reset_queues(&mut self) {
        self.needs_dispatch = false;

        self.acknowledgements.clear();
        self.sent_reliable_commands.clear();
        self.sent_unreliable_commands.clear();
        self.outgoing_commands.clear();
        self.dispatched_commands.clear();
        self.channels.clear();
    }

    pub(crate) fn setup_channels(&mut self, channel_count: usize) {
        self.channels = (0..channel_count).map(|_| Channel::new()).collect();
    }

    /// Queues a packet for delivery, fragmenting it if it does not fit within the
    /// connection MTU. `fragment_length` accounts for the per-datagram overhead the
    /// host will add when the command is eventually transmitted.
    pub(crate) fn enqueue_packet(
        &mut self,
        channel_id: u8,
        packet: Packet,
        maximum_packet_size: usize,
        checksum_enabled: bool,
    ) -> Result<(), Error> {
        if self.state != PeerState::Connected {
            return Err(Error::NotConnected);
        }
        if channel_id as usize >= self.channels.len() {
            return Err(Error::InvalidChannel);
        }
        if packet.len() > maximum_packet_size {
            return Err(Error::PacketTooLarge);
        }

        let mut fragment_length = self.mtu as usize
            - serial::HEADER_SIZE_SENT_TIME
            - protocol::command_size(protocol::COMMAND_SEND_FRAGMENT);
        if checksum_enabled {
            fragment_length -= serial::CHECKSUM_SIZE;
        }

        if packet.len() > fragment_length {
            return self.enqueue_fragments(channel_id, packet, fragment_length);
        }

        let flags = packet.flags();
        let data_length = packet.len() as u16;

        let (command, kind) = if flags & (PACKET_FLAG_RELIABLE | PACKET_FLAG_UNSEQUENCED)
            == PACKET_FLAG_UNSEQUENCED
        {
            (
                protocol::COMMAND_SEND_UNSEQUENCED | protocol::COMMAND_FLAG_UNSEQUENCED,
                Command::SendUnsequenced {
                    unsequenced_group: 0,
                    data_length,
                },
            )
        } else if flags & PACKET_FLAG_RELIABLE != 0
            || self.channels[channel_id as usize].outgoing_unreliable_sequence_number >= 0xFFFF
        {
            (
                protocol::COMMAND_SEND_RELIABLE | protocol::COMMAND_FLAG_ACKNOWLEDGE,
                Command::SendReliable { data_length },
            )
        } else {
            (
                protocol::COMMAND_SEND_UNRELIABLE,
                Command::SendUnreliable {
                    unreliable_sequence_number: 0,
                    data_length,
                },
            )
        };

        self.queue_outgoing_command(command, channel_id, kind, Some(packet), 0, data_length);

        Ok(())
    }

    fn enqueue_fragments(
        &mut self,
        channel_id: u8,
        packet: Packet,
        fragment_length: usize,
    ) -> Result<(), Error> {
        let fragment_count = ((packet.len() + fragment_length - 1) / fragment_length) as u32;

        if fragment_count > protocol::MAXIMUM_FRAGMENT_COUNT {
            return Err(Error::PacketTooLarge);
        }

        let channel = &self.channels[channel_id as usize];
        let flags = packet.flags();

        let unreliable = flags & (PACKET_FLAG_RELIABLE | PACKET_FLAG_UNRELIABLE_FRAGMENT)
            == PACKET_FLAG_UNRELIABLE_FRAGMENT
            && channel.outgoing_unreliable_sequence_number < 0xFFFF;

        let (command, start_sequence_number) = if unreliable {
            (
                protocol::COMMAND_SEND_UNRELIABLE_FRAGMENT,
                channel.outgoing_unreliable_sequence_number.wrapping_add(1),
            )
        } else {
            (
                protocol::COMMAND_SEND_FRAGMENT | protocol::COMMAND_FLAG_ACKNOWLEDGE,
                channel.outgoing_reliable_sequence_number.wrapping_add(1),
            )
        };

        let total_length = packet.len() as u32;
        let mut fragment_offset = 0u32;
        let mut fragment_number = 0u32;

        while (fragment_offset as usize) < packet.len() {
            let length = fragment_length.min(packet.len() - fragment_offset as usize) as u16;

            let record = FragmentRecord {
                start_sequence_number,
                data_length: length,
                fragment_count,
                fragment_number,
                total_length,
                fragment_offset,
            };
            let kind = if unreliable {
                Command::SendUnreliableFragment(record)
            } else {
                Command::SendFragment(record)
            };

            self.queue_outgoing_command(
                command,
                channel_id,
                kind,
                Some(packet.clone()),
                fragment_offset,
                length,
            );

            fragment_number += 1;
            fragment_offset += fragment_length as u32;
        }

        Ok(())
    }

    pub(crate) fn ping(&mut self) {
        if self.state != PeerState::Connected {
            return;
        }

        self.queue_outgoing_command(
            protocol::COMMAND_PING | protocol::COMMAND_FLAG_ACKNOWLEDGE,
            0xFF,
            Command::Ping,
            None,
            0,
            0,
        );
    }

    pub(crate) fn queue_outgoing_command(
        &mut self,
        command: u8,
        channel_id: u8,
        kind: Command,
        packet: Option<Packet>,
        fragment_offset: u32,
        fragment_length: u16,
    ) {
        let outgoing = OutgoingCommand {
            command,
            channel_id,
            reliable_sequence_number: 0,
            unreliable_sequence_number: 0,
            sent_time: 0,
            round_trip_timeout: 0,
            round_trip_timeout_limit: 0,
            fragment_offset,
            fragment_length,
            send_attempts: 0,
            kind,
            packet,
        };

        self.setup_outgoing_command(outgoing);
    }

    fn setup_outgoing_command(&mut self, mut outgoing: OutgoingCommand) {
        self.outgoing_data_total +=
            protocol::command_size(outgoing.command) as u32 + outgoing.fragment_length as u32;

        if outgoing.channel_id == 0xFF {
            self.outgoing_reliable_sequence_number =
                self.outgoing_reliable_sequence_number.wrapping_add(1);

            outgoing.reliable_sequence_number = self.outgoing_reliable_sequence_number;
            outgoing.unreliable_sequence_number = 0;
        } else {
            let channel = &mut self.channels[outgoing.channel_id as usize];

            if outgoing.command & protocol::COMMAND_FLAG_ACKNOWLEDGE != 0 {
                channel.outgoing_reliable_sequence_number =
                    channel.outgoing_reliable_sequence_number.wrapping_add(1);
                channel.outgoing_unreliable_sequence_number = 0;

                outgoing.reliable_sequence_number = channel.outgoing_reliable_sequence_number;
                outgoing.unreliable_sequence_number = 0;
            } else if outgoing.command & protocol::COMMAND_FLAG_UNSEQUENCED != 0 {
                self.outgoing_unsequenced_group = self.outgoing_unsequenced_group.wrapping_add(1);

                outgoing.reliable_sequence_number = 0;
                outgoing.unreliable_sequence_number = 0;
            } else {
                if outgoing.fragment_offset == 0 {
                    channel.outgoing_unreliable_sequence_number =
                        channel.outgoing_unreliable_sequence_number.wrapping_add(1);
                }

                outgoing.reliable_sequence_number = channel.outgoing_reliable_sequence_number;
                outgoing.unreliable_sequence_number = channel.outgoing_unreliable_sequence_number;
            }
        }

        // The sequence numbers just assigned are reflected into the wire records they
        // travel in.
        match &mut outgoing.kind {
            Command::SendUnreliable {
                unreliable_sequence_number,
                ..
            } => {
                *unreliable_sequence_number = outgoing.unreliable_sequence_number;
            }
            Command::SendUnsequenced {
                unsequenced_group, ..
            } => {
                *unsequenced_group = self.outgoing_unsequenced_group;
            }
            _ => (),
        }

        self.outgoing_commands.push_back(outgoing);
    }

    /// Queues an acknowledgement for a received reliable command, unless the command
    /// sits at the edge of the free reliable window span, where acknowledging would
    /// let the sender run past our bookkeeping.
    pub(crate) fn queue_acknowledgement(
        &mut self,
        command: u8,
        channel_id: u8,
        reliable_sequence_number: u16,
        sent_time: u16,
    ) -> bool {
        if (channel_id as usize) < self.channels.len() {
            let channel = &self.channels[channel_id as usize];
            let window = channel.incoming_window(reliable_sequence_number);
            let current = channel.current_window();

            if window >= current + crate::channel::FREE_RELIABLE_WINDOWS - 1
                && window <= current + crate::channel::FREE_RELIABLE_WINDOWS
            {
                return false;
            }
        }

        self.outgoing_data_total +=
            protocol::command_size(protocol::COMMAND_ACKNOWLEDGE) as u32;

        self.acknowledgements.push_back(Acknowledgement {
            sent_time,
            command,
            channel_id,
            reliable_sequence_number,
        });

        true
    }

    /// Adjusts the packet throttle from a round trip measurement. Returns 1, -1, or 0
    /// for acceleration, deceleration, or no change.
    pub(crate) fn throttle(&mut self, rtt: u32) -> i32 {
        if self.last_round_trip_time <= self.last_round_trip_time_variance {
            self.packet_throttle = self.packet_throttle_limit;
        } else if rtt <= self.last_round_trip_time {
            self.packet_throttle = (self.packet_throttle + self.packet_throttle_acceleration)
                .min(self.packet_throttle_limit);
            return 1;
        } else if rtt > self.last_round_trip_time + 2 * self.last_round_trip_time_variance {
            self.packet_throttle = self
                .packet_throttle
                .saturating_sub(self.packet_throttle_deceleration);
            return -1;
        }

        0
    }

    /// Dequeues one received packet, if any is ready for delivery.
    pub(crate) fn receive(&mut self) -> Option<(u8, Packet)> {
        let command = self.dispatched_commands.pop_front()?;

        self.total_waiting_data -= command.data.len();

        let packet = Packet::from_incoming(command.data, command.packet_flags);

        Some((command.channel_id, packet))
    }

    /// The congestion window currently permitted by the packet throttle, never less
    /// than one full datagram.
    pub(crate) fn throttled_window(&self) -> u32 {
        let window = (self.packet_throttle * self.window_size) / PACKET_THROTTLE_SCALE;
        window.max(self.mtu)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::PACKET_FLAG_RELIABLE;

    fn connected_peer(channels: usize) -> Peer {
        let mut peer = Peer::new(0, 1400);
        peer.state = PeerState::Connected;
        peer.setup_channels(channels);
        peer
    }

    #[test]
    fn sequence_numbers_advance_per_channel() {
        let mut peer = connected_peer(2);

        peer.enqueue_packet(0, Packet::new(&[0; 4], PACKET_FLAG_RELIABLE), 1 << 20, false)
            .unwrap();
        peer.enqueue_packet(0, Packet::new(&[0; 4], PACKET_FLAG_RELIABLE), 1 << 20, false)
            .unwrap();
        peer.enqueue_packet(1, Packet::new(&[0; 4], PACKET_FLAG_RELIABLE), 1 << 20, false)
            .unwrap();

        let sequences: Vec<(u8, u16)> = peer
            .outgoing_commands
            .iter()
            .map(|c| (c.channel_id, c.reliable_sequence_number))
            .collect();

        assert_eq!(sequences, [(0, 1), (0, 2), (1, 1)]);
    }

    #[test]
    fn unreliable_sends_take_reliable_context() {
        let mut peer = connected_peer(1);

        peer.enqueue_packet(0, Packet::new(&[0; 4], PACKET_FLAG_RELIABLE), 1 << 20, false)
            .unwrap();
        peer.enqueue_packet(0, Packet::new(&[0; 4], 0), 1 << 20, false)
            .unwrap();
        peer.enqueue_packet(0, Packet::new(&[0; 4], 0), 1 << 20, false)
            .unwrap();

        let command = &peer.outgoing_commands[1];
        assert_eq!(command.reliable_sequence_number, 1);
        assert_eq!(command.unreliable_sequence_number, 1);

        let command = &peer.outgoing_commands[2];
        assert_eq!(command.reliable_sequence_number, 1);
        assert_eq!(command.unreliable_sequence_number, 2);
    }

    #[test]
    fn fragment_refcount_matches_queued_references() {
        let mut peer = connected_peer(1);

        // Fits in 3 fragments at the default MTU.
        let packet = Packet::new(&vec![0xAB; 4000], PACKET_FLAG_RELIABLE);
        peer.enqueue_packet(0, packet.clone(), 1 << 20, false).unwrap();

        let fragments = peer.outgoing_commands.len();
        assert_eq!(fragments, 3);
        assert_eq!(packet.reference_count(), 1 + fragments);

        // All fragments share the start sequence number and cover the payload exactly.
        let mut covered = 0usize;
        for command in peer.outgoing_commands.iter() {
            match &command.kind {
                Command::SendFragment(record) => {
                    assert_eq!(record.start_sequence_number, 1);
                    assert_eq!(record.total_length, 4000);
                    covered += record.data_length as usize;
                }
                other => panic!("unexpected command {:?}", other),
            }
        }
        assert_eq!(covered, 4000);
    }

    #[test]
    fn single_send_refcount_is_two() {
        let mut peer = connected_peer(1);

        let packet = Packet::new(&[1, 2, 3], PACKET_FLAG_RELIABLE);
        peer.enqueue_packet(0, packet.clone(), 1 << 20, false).unwrap();

        assert_eq!(packet.reference_count(), 2);
    }

    #[test]
    fn send_rejects_bad_arguments() {
        let mut peer = connected_peer(1);

        assert!(matches!(
            peer.enqueue_packet(1, Packet::new(&[0], 0), 1 << 20, false),
            Err(Error::InvalidChannel)
        ));
        assert!(matches!(
            peer.enqueue_packet(0, Packet::new(&[0; 64], 0), 32, false),
            Err(Error::PacketTooLarge)
        ));

        peer.state = PeerState::Disconnected;
        assert!(matches!(
            peer.enqueue_packet(0, Packet::new(&[0], 0), 1 << 20, false),
            Err(Error::NotConnected)
        ));
    }

    #[test]
    fn throttle_tracks_rtt() {
        let mut peer = Peer::new(0, 1400);
        peer.last_round_trip_time = 100;
        peer.last_round_trip_time_variance = 10;
        peer.packet_throttle = 16;

        assert_eq!(peer.throttle(90), 1);
        assert_eq!(peer.packet_throttle, 16 + PACKET_THROTTLE_ACCELERATION);

        assert_eq!(peer.throttle(200), -1);
        assert_eq!(peer.packet_throttle, 16);

        // Within the variance band: no change.
        assert_eq!(peer.throttle(110), 0);
        assert_eq!(peer.packet_throttle, 16);
    }

    #[test]
    fn throttle_saturates_at_zero() {
        let mut peer = Peer::new(0, 1400);
        peer.last_round_trip_time = 100;
        peer.last_round_trip_time_variance = 1;
        peer.packet_throttle = 1;
        peer.packet_throttle_deceleration = 8;

        assert_eq!(peer.throttle(1000), -1);
        assert_eq!(peer.packet_throttle, 0);
    }
}
