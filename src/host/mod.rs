
mod service;

use crate::compress::Compressor;
use crate::packet::Packet;
use crate::peer;
use crate::peer::Peer;
use crate::peer::PeerState;
use crate::protocol;
use crate::protocol::Command;
use crate::protocol::Handshake;
use crate::Error;
use crate::PeerId;
use crate::PACKET_THROTTLE_SCALE;

use std::collections::VecDeque;
use std::net;
use std::time;

const DEFAULT_MTU: u32 = 1400;
const DEFAULT_MAXIMUM_PACKET_SIZE: usize = 32 * 1024 * 1024;
const DEFAULT_MAXIMUM_WAITING_DATA: usize = 32 * 1024 * 1024;
const BANDWIDTH_THROTTLE_INTERVAL: u32 = 1000;

pub(crate) type ChecksumFn = Box<dyn Fn(&[&[u8]]) -> u32>;
pub(crate) type InterceptFn = Box<dyn FnMut(net::SocketAddr, &[u8]) -> Intercept>;

/// Verdict returned by an intercept callback installed with
/// [`Host::set_intercept`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Intercept {
    /// Hand the datagram to the protocol as usual.
    Pass,
    /// The callback claimed the datagram; the protocol never sees it.
    Consume,
    /// Treat the datagram as a transport failure; the service call returns an error.
    Error,
}

/// Configuration for a [`Host`], built in the usual chained style.
#[derive(Clone, Debug)]
pub struct HostParams {
    pub(crate) peer_count: usize,
    pub(crate) channel_limit: usize,
    pub(crate) incoming_bandwidth: u32,
    pub(crate) outgoing_bandwidth: u32,
    pub(crate) duplicate_peers: usize,
    pub(crate) maximum_packet_size: usize,
    pub(crate) maximum_waiting_data: usize,
}

impl HostParams {
    /// Default configuration: one peer slot, unlimited bandwidth, the protocol
    /// maximum of channels.
    pub fn new() -> Self {
        Self {
            peer_count: 1,
            channel_limit: protocol::MAXIMUM_CHANNEL_COUNT,
            incoming_bandwidth: 0,
            outgoing_bandwidth: 0,
            duplicate_peers: protocol::MAXIMUM_PEER_ID as usize,
            maximum_packet_size: DEFAULT_MAXIMUM_PACKET_SIZE,
            maximum_waiting_data: DEFAULT_MAXIMUM_WAITING_DATA,
        }
    }

    /// The number of peer slots to allocate. At most [`MAX_PEER_COUNT`](crate::MAX_PEER_COUNT).
    pub fn peer_count(mut self, peer_count: usize) -> HostParams {
        self.peer_count = peer_count;
        self
    }

    /// The maximum channel count accepted from incoming connections. Zero means the
    /// protocol maximum.
    pub fn channel_limit(mut self, channel_limit: usize) -> HostParams {
        self.channel_limit = normalize_channel_limit(channel_limit);
        self
    }

    /// Downstream bandwidth in bytes/second; zero for unlimited.
    pub fn incoming_bandwidth(mut self, bandwidth: u32) -> HostParams {
        self.incoming_bandwidth = bandwidth;
        self
    }

    /// Upstream bandwidth in bytes/second; zero for unlimited.
    pub fn outgoing_bandwidth(mut self, bandwidth: u32) -> HostParams {
        self.outgoing_bandwidth = bandwidth;
        self
    }

    /// How many concurrent connections to allow from the same IP address.
    pub fn duplicate_peers(mut self, duplicate_peers: usize) -> HostParams {
        self.duplicate_peers = duplicate_peers.max(1);
        self
    }

    /// The largest packet, in bytes, the host will send or accept.
    pub fn maximum_packet_size(mut self, size: usize) -> HostParams {
        self.maximum_packet_size = size;
        self
    }

    /// The most received-but-undelivered payload bytes buffered per peer before
    /// further packets are refused.
    pub fn maximum_waiting_data(mut self, size: usize) -> HostParams {
        self.maximum_waiting_data = size;
        self
    }
}

impl Default for HostParams {
    fn default() -> Self {
        Self::new()
    }
}

/// A UDP endpoint multiplexing up to a fixed number of peer connections over one
/// socket.
///
/// All peer operations take the [`PeerId`] handed out by [`connect`](Self::connect)
/// or carried by [`Event`](crate::Event)s. The host performs no work on its own;
/// [`service`](Self::service) (or [`flush`](Self::flush)) must be called regularly
/// to move data.
pub struct Host {
    pub(crate) socket: net::UdpSocket,
    pub(crate) peers: Vec<Peer>,
    pub(crate) dispatch_queue: VecDeque<usize>,

    pub(crate) incoming_bandwidth: u32,
    pub(crate) outgoing_bandwidth: u32,
    pub(crate) bandwidth_throttle_epoch: u32,
    pub(crate) recalculate_bandwidth_limits: bool,
    pub(crate) mtu: u32,
    pub(crate) channel_limit: usize,

    pub(crate) time_base: time::Instant,
    pub(crate) service_time: u32,

    pub(crate) duplicate_peers: usize,
    pub(crate) maximum_packet_size: usize,
    pub(crate) maximum_waiting_data: usize,

    pub(crate) connected_peers: usize,
    pub(crate) bandwidth_limited_peers: usize,

    pub(crate) total_sent_data: u64,
    pub(crate) total_sent_packets: u64,
    pub(crate) total_received_data: u64,
    pub(crate) total_received_packets: u64,

    // Scratch state for one outgoing datagram under assembly.
    pub(crate) command_buffer: Vec<u8>,
    pub(crate) command_count: usize,
    pub(crate) header_sent_time: bool,
    pub(crate) continue_sending: bool,

    pub(crate) receive_buffer: Box<[u8]>,
    pub(crate) compress_buffer: Vec<u8>,
    pub(crate) stashed_datagram: Option<(usize, net::SocketAddr)>,

    pub(crate) compressor: Option<Box<dyn Compressor>>,
    pub(crate) checksum: Option<ChecksumFn>,
    pub(crate) intercept: Option<InterceptFn>,
}

fn normalize_channel_limit(channel_limit: usize) -> usize {
    if channel_limit == 0 || channel_limit > protocol::MAXIMUM_CHANNEL_COUNT {
        protocol::MAXIMUM_CHANNEL_COUNT
    } else {
        channel_limit.max(protocol::MINIMUM_CHANNEL_COUNT)
    }
}

impl Host {
    /// Opens a non-blocking UDP socket bound to `addr` and creates a host around it.
    pub fn bind<A: net::ToSocketAddrs>(addr: A, params: HostParams) -> Result<Self, Error> {
        if params.peer_count > protocol::MAXIMUM_PEER_ID as usize {
            return Err(Error::TooManyPeers);
        }

        let socket = net::UdpSocket::bind(addr)?;
        socket.set_nonblocking(true)?;

        let peers = (0..params.peer_count)
            .map(|index| Peer::new(index as u16, DEFAULT_MTU))
            .collect();

        Ok(Self {
            socket,
            peers,
            dispatch_queue: VecDeque::new(),

            incoming_bandwidth: params.incoming_bandwidth,
            outgoing_bandwidth: params.outgoing_bandwidth,
            bandwidth_throttle_epoch: 0,
            recalculate_bandwidth_limits: false,
            mtu: DEFAULT_MTU,
            channel_limit: normalize_channel_limit(params.channel_limit),

            time_base: time::Instant::now(),
            service_time: 0,

            duplicate_peers: params.duplicate_peers,
            maximum_packet_size: params.maximum_packet_size,
            maximum_waiting_data: params.maximum_waiting_data,

            connected_peers: 0,
            bandwidth_limited_peers: 0,

            total_sent_data: 0,
            total_sent_packets: 0,
            total_received_data: 0,
            total_received_packets: 0,

            command_buffer: Vec::new(),
            command_count: 0,
            header_sent_time: false,
            continue_sending: false,

            receive_buffer: vec![0; protocol::MAXIMUM_MTU as usize].into_boxed_slice(),
            compress_buffer: Vec::new(),
            stashed_datagram: None,

            compressor: None,
            checksum: None,
            intercept: None,
        })
    }

    /// Equivalent to calling [`bind()`](Self::bind) with address
    /// `(`[`std::net::Ipv4Addr::UNSPECIFIED`](std::net::Ipv4Addr::UNSPECIFIED)`, 0)`.
    pub fn bind_any(params: HostParams) -> Result<Self, Error> {
        Self::bind((net::Ipv4Addr::UNSPECIFIED, 0), params)
    }

    /// Returns the local address of the internal UDP socket.
    pub fn address(&self) -> net::SocketAddr {
        self.socket.local_addr().unwrap()
    }

    /// Initiates a connection to a remote host. The connection is not usable until a
    /// [`Connect`](crate::Event::Connect) event for the returned peer is delivered.
    pub fn connect(
        &mut self,
        address: net::SocketAddr,
        channel_count: usize,
        data: u32,
    ) -> Result<PeerId, Error> {
        let channel_count = channel_count
            .max(protocol::MINIMUM_CHANNEL_COUNT)
            .min(protocol::MAXIMUM_CHANNEL_COUNT);

        let index = self
            .peers
            .iter()
            .position(|peer| peer.state == PeerState::Disconnected)
            .ok_or(Error::NoFreeSlots)?;

        let window_size = initial_window_size(self.outgoing_bandwidth);

        let peer = &mut self.peers[index];
        peer.setup_channels(channel_count);
        peer.state = PeerState::Connecting;
        peer.address = Some(address);
        peer.connect_id = rand::random::<u32>();
        peer.window_size = window_size;

        let handshake = Handshake {
            outgoing_peer_id: peer.incoming_peer_id,
            incoming_session_id: peer.incoming_session_id,
            outgoing_session_id: peer.outgoing_session_id,
            mtu: peer.mtu,
            window_size: peer.window_size,
            channel_count: channel_count as u32,
            incoming_bandwidth: self.incoming_bandwidth,
            outgoing_bandwidth: self.outgoing_bandwidth,
            packet_throttle_interval: peer.packet_throttle_interval,
            packet_throttle_acceleration: peer.packet_throttle_acceleration,
            packet_throttle_deceleration: peer.packet_throttle_deceleration,
            connect_id: peer.connect_id,
            data,
        };

        log::debug!("peer {}: connecting to {}", index, address);

        peer.queue_outgoing_command(
            protocol::COMMAND_CONNECT | protocol::COMMAND_FLAG_ACKNOWLEDGE,
            0xFF,
            Command::Connect(handshake),
            None,
            0,
            0,
        );

        Ok(PeerId(index))
    }

    /// Queues a packet for delivery to one peer.
    pub fn send(&mut self, peer: PeerId, channel_id: u8, packet: Packet) -> Result<(), Error> {
        let maximum_packet_size = self.maximum_packet_size;
        let checksum_enabled = self.checksum.is_some();

        self.peer_slot_mut(peer)?
            .enqueue_packet(channel_id, packet, maximum_packet_size, checksum_enabled)
    }

    /// Queues a packet for delivery to every connected peer.
    pub fn broadcast(&mut self, channel_id: u8, packet: Packet) {
        let maximum_packet_size = self.maximum_packet_size;
        let checksum_enabled = self.checksum.is_some();

        for peer in self.peers.iter_mut() {
            if peer.state != PeerState::Connected {
                continue;
            }

            let _ = peer.enqueue_packet(
                channel_id,
                packet.clone(),
                maximum_packet_size,
                checksum_enabled,
            );
        }
    }

    /// Dequeues one received packet from a peer, bypassing the event queue.
    pub fn receive(&mut self, peer: PeerId) -> Result<Option<(u8, Packet)>, Error> {
        Ok(self.peer_slot_mut(peer)?.receive())
    }

    /// Sends a ping request immediately. The host pings idle connections on its own;
    /// this merely forces an extra measurement.
    pub fn ping(&mut self, peer: PeerId) -> Result<(), Error> {
        self.peer_slot_mut(peer)?.ping();
        Ok(())
    }

    /// Sets the interval at which idle connections are pinged. Zero restores the
    /// default.
    pub fn set_ping_interval(&mut self, peer: PeerId, interval: u32) -> Result<(), Error> {
        self.peer_slot_mut(peer)?.ping_interval = if interval != 0 {
            interval
        } else {
            peer::PING_INTERVAL
        };
        Ok(())
    }

    /// Sets the retransmission timeout parameters for a peer. Zeroes restore the
    /// defaults.
    ///
    /// A peer is disconnected when a reliable command has gone unacknowledged for
    /// `maximum` milliseconds, or for `minimum` milliseconds after its retransmission
    /// timeout has doubled past `limit` times its initial value.
    pub fn set_timeout(
        &mut self,
        peer: PeerId,
        limit: u32,
        minimum: u32,
        maximum: u32,
    ) -> Result<(), Error> {
        let peer = self.peer_slot_mut(peer)?;

        peer.timeout_limit = if limit != 0 { limit } else { peer::TIMEOUT_LIMIT };
        peer.timeout_minimum = if minimum != 0 { minimum } else { peer::TIMEOUT_MINIMUM };
        peer.timeout_maximum = if maximum != 0 { maximum } else { peer::TIMEOUT_MAXIMUM };

        Ok(())
    }

    /// Configures the unreliable packet throttle and informs the remote host.
    ///
    /// `acceleration` and `deceleration` are expressed against
    /// [`PACKET_THROTTLE_SCALE`](crate::PACKET_THROTTLE_SCALE); `interval` is the
    /// measurement period in milliseconds.
    pub fn throttle_configure(
        &mut self,
        peer: PeerId,
        interval: u32,
        acceleration: u32,
        deceleration: u32,
    ) -> Result<(), Error> {
        let peer = self.peer_slot_mut(peer)?;

        peer.packet_throttle_interval = interval;
        peer.packet_throttle_acceleration = acceleration;
        peer.packet_throttle_deceleration = deceleration;

        peer.queue_outgoing_command(
            protocol::COMMAND_THROTTLE_CONFIGURE | protocol::COMMAND_FLAG_ACKNOWLEDGE,
            0xFF,
            Command::ThrottleConfigure {
                packet_throttle_interval: interval,
                packet_throttle_acceleration: acceleration,
                packet_throttle_deceleration: deceleration,
            },
            None,
            0,
            0,
        );

        Ok(())
    }

    /// Requests a disconnection. Queued outgoing packets are discarded; a
    /// [`Disconnect`](crate::Event::Disconnect) event is delivered once the remote
    /// host acknowledges.
    pub fn disconnect(&mut self, peer: PeerId, data: u32) -> Result<(), Error> {
        let index = self.check_peer(peer)?;

        match self.peers[index].state {
            PeerState::Disconnecting
            | PeerState::Disconnected
            | PeerState::AcknowledgingDisconnect
            | PeerState::Zombie => return Ok(()),
            _ => (),
        }

        self.purge_dispatch(index);
        self.peers[index].reset_queues();

        let connected = self.peers[index].state.is_connected();
        let command = if connected {
            protocol::COMMAND_DISCONNECT | protocol::COMMAND_FLAG_ACKNOWLEDGE
        } else {
            protocol::COMMAND_DISCONNECT | protocol::COMMAND_FLAG_UNSEQUENCED
        };

        self.peers[index].queue_outgoing_command(
            command,
            0xFF,
            Command::Disconnect { data },
            None,
            0,
            0,
        );

        if connected {
            self.peer_on_disconnect(index);
            self.peers[index].state = PeerState::Disconnecting;
        } else {
            self.flush()?;
            self.reset_peer_slot(index);
        }

        Ok(())
    }

    /// Requests a disconnection, but only once all queued outgoing packets have been
    /// delivered.
    pub fn disconnect_later(&mut self, peer: PeerId, data: u32) -> Result<(), Error> {
        let index = self.check_peer(peer)?;
        let slot = &mut self.peers[index];

        if slot.state.is_connected()
            && !(slot.outgoing_commands.is_empty() && slot.sent_reliable_commands.is_empty())
        {
            slot.state = PeerState::DisconnectLater;
            slot.event_data = data;
            Ok(())
        } else {
            self.disconnect(peer, data)
        }
    }

    /// Disconnects immediately. A single unsequenced notification is sent, but its
    /// delivery is not guaranteed and no event is generated locally.
    pub fn disconnect_now(&mut self, peer: PeerId, data: u32) -> Result<(), Error> {
        let index = self.check_peer(peer)?;

        if self.peers[index].state == PeerState::Disconnected {
            return Ok(());
        }

        if self.peers[index].state != PeerState::Zombie
            && self.peers[index].state != PeerState::Disconnecting
        {
            self.purge_dispatch(index);
            self.peers[index].reset_queues();

            self.peers[index].queue_outgoing_command(
                protocol::COMMAND_DISCONNECT | protocol::COMMAND_FLAG_UNSEQUENCED,
                0xFF,
                Command::Disconnect { data },
                None,
                0,
                0,
            );

            self.flush()?;
        }

        self.reset_peer_slot(index);
        Ok(())
    }

    /// Forcefully resets a peer slot. The remote host is not notified and will time
    /// out on its own; no event is generated locally.
    pub fn reset_peer(&mut self, peer: PeerId) -> Result<(), Error> {
        let index = self.check_peer(peer)?;
        self.reset_peer_slot(index);
        Ok(())
    }

    /// Read access to a peer slot.
    pub fn peer(&self, peer: PeerId) -> Option<&Peer> {
        self.peers.get(peer.0)
    }

    /// The number of peer slots the host was created with.
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// The number of peers currently connected.
    pub fn connected_peers(&self) -> usize {
        self.connected_peers
    }

    /// Limits the channel count accepted from future incoming connections.
    pub fn set_channel_limit(&mut self, channel_limit: usize) {
        self.channel_limit = normalize_channel_limit(channel_limit);
    }

    /// Adjusts the host's bandwidth limits, in bytes/second. Connected peers are
    /// informed of the new incoming limit over the wire.
    pub fn set_bandwidth_limit(&mut self, incoming_bandwidth: u32, outgoing_bandwidth: u32) {
        self.incoming_bandwidth = incoming_bandwidth;
        self.outgoing_bandwidth = outgoing_bandwidth;
        self.recalculate_bandwidth_limits = true;
    }

    /// Installs (or removes) the per-datagram compressor.
    pub fn set_compressor(&mut self, compressor: Option<Box<dyn Compressor>>) {
        self.compressor = compressor;
    }

    /// Installs (or removes) the datagram checksum function.
    ///
    /// Both ends of every connection must agree on the checksum in use. The function
    /// receives the datagram as a sequence of byte ranges with the checksum slot
    /// holding the connection id.
    pub fn set_checksum(&mut self, checksum: Option<ChecksumFn>) {
        self.checksum = checksum;
    }

    /// Installs the CRC-32 checksum from [`crc32`](crate::crc32).
    pub fn use_crc32_checksum(&mut self) {
        self.checksum = Some(Box::new(|buffers| crate::checksum::crc32(buffers)));
    }

    /// Installs (or removes) a raw-datagram intercept callback, invoked before any
    /// protocol processing.
    pub fn set_intercept(&mut self, intercept: Option<InterceptFn>) {
        self.intercept = intercept;
    }

    /// Total bytes of UDP data sent since creation.
    pub fn total_sent_data(&self) -> u64 {
        self.total_sent_data
    }

    /// Total UDP datagrams sent since creation.
    pub fn total_sent_packets(&self) -> u64 {
        self.total_sent_packets
    }

    /// Total bytes of UDP data received since creation.
    pub fn total_received_data(&self) -> u64 {
        self.total_received_data
    }

    /// Total UDP datagrams received since creation.
    pub fn total_received_packets(&self) -> u64 {
        self.total_received_packets
    }

    fn check_peer(&self, peer: PeerId) -> Result<usize, Error> {
        if peer.0 < self.peers.len() {
            Ok(peer.0)
        } else {
            Err(Error::InvalidPeer)
        }
    }

    fn peer_slot_mut(&mut self, peer: PeerId) -> Result<&mut Peer, Error> {
        let index = self.check_peer(peer)?;
        Ok(&mut self.peers[index])
    }

    pub(crate) fn reset_peer_slot(&mut self, index: usize) {
        self.peer_on_disconnect(index);
        self.purge_dispatch(index);

        let mtu = self.mtu;
        self.peers[index].reset(mtu);
    }

    // A reset slot must not linger on the dispatch queue; stale entries are also
    // skipped defensively on pop, but the flag has to be cleared here.
    fn purge_dispatch(&mut self, index: usize) {
        self.peers[index].needs_dispatch = false;
    }

    pub(crate) fn ensure_dispatch(&mut self, index: usize) {
        if !self.peers[index].needs_dispatch {
            self.peers[index].needs_dispatch = true;
            self.dispatch_queue.push_back(index);
        }
    }

    pub(crate) fn peer_on_connect(&mut self, index: usize) {
        let peer = &self.peers[index];

        if !peer.state.is_connected() {
            if peer.incoming_bandwidth != 0 {
                self.bandwidth_limited_peers += 1;
            }
            self.connected_peers += 1;
        }
    }

    pub(crate) fn peer_on_disconnect(&mut self, index: usize) {
        let peer = &self.peers[index];

        if peer.state.is_connected() {
            if peer.incoming_bandwidth != 0 {
                self.bandwidth_limited_peers -= 1;
            }
            self.connected_peers -= 1;
        }
    }

    pub(crate) fn change_state(&mut self, index: usize, state: PeerState) {
        if state.is_connected() {
            self.peer_on_connect(index);
        } else {
            self.peer_on_disconnect(index);
        }

        self.peers[index].state = state;
    }

    pub(crate) fn dispatch_state(&mut self, index: usize, state: PeerState) {
        self.change_state(index, state);
        self.ensure_dispatch(index);
    }

    /// Recomputes per-peer throttle limits from the host's outgoing bandwidth, and
    /// (when limits changed) assigns each peer a share of the host's incoming
    /// bandwidth, broadcast via BANDWIDTH_LIMIT.
    pub(crate) fn bandwidth_throttle(&mut self) {
        let time_current = self.service_time;
        let elapsed = time_current.wrapping_sub(self.bandwidth_throttle_epoch);

        if elapsed < BANDWIDTH_THROTTLE_INTERVAL {
            return;
        }

        self.bandwidth_throttle_epoch = time_current;

        let mut peers_remaining = self.connected_peers as u32;
        if peers_remaining == 0 {
            return;
        }

        let mut data_total = u32::MAX;
        let mut bandwidth = u32::MAX;
        let mut needs_adjustment = self.bandwidth_limited_peers > 0;

        if self.outgoing_bandwidth != 0 {
            data_total = 0;
            bandwidth = scale_bandwidth(self.outgoing_bandwidth, elapsed);

            for peer in self.peers.iter() {
                if peer.state.is_connected() {
                    data_total = data_total.saturating_add(peer.outgoing_data_total);
                }
            }
        }

        let mut throttle;

        while peers_remaining > 0 && needs_adjustment {
            needs_adjustment = false;

            throttle = if data_total <= bandwidth {
                PACKET_THROTTLE_SCALE
            } else {
                ((bandwidth as u64 * PACKET_THROTTLE_SCALE as u64) / data_total as u64) as u32
            };

            for peer in self.peers.iter_mut() {
                if !peer.state.is_connected()
                    || peer.incoming_bandwidth == 0
                    || peer.outgoing_bandwidth_throttle_epoch == time_current
                {
                    continue;
                }

                let peer_bandwidth = scale_bandwidth(peer.incoming_bandwidth, elapsed);
                if (throttle as u64 * peer.outgoing_data_total as u64) / PACKET_THROTTLE_SCALE as u64
                    <= peer_bandwidth as u64
                {
                    continue;
                }

                peer.packet_throttle_limit = ((peer_bandwidth as u64
                    * PACKET_THROTTLE_SCALE as u64)
                    / peer.outgoing_data_total as u64)
                    .max(1) as u32;
                peer.packet_throttle = peer.packet_throttle.min(peer.packet_throttle_limit);

                peer.outgoing_bandwidth_throttle_epoch = time_current;
                peer.incoming_data_total = 0;
                peer.outgoing_data_total = 0;

                needs_adjustment = true;
                peers_remaining -= 1;
                bandwidth = bandwidth.saturating_sub(peer_bandwidth);
                data_total = data_total.saturating_sub(peer_bandwidth);
            }
        }

        if peers_remaining > 0 {
            throttle = if data_total <= bandwidth {
                PACKET_THROTTLE_SCALE
            } else {
                ((bandwidth as u64 * PACKET_THROTTLE_SCALE as u64) / data_total as u64) as u32
            };

            for peer in self.peers.iter_mut() {
                if !peer.state.is_connected()
                    || peer.outgoing_bandwidth_throttle_epoch == time_current
                {
                    continue;
                }

                peer.packet_throttle_limit = throttle;
                peer.packet_throttle = peer.packet_throttle.min(throttle);
                peer.incoming_data_total = 0;
                peer.outgoing_data_total = 0;
            }
        }

        if self.recalculate_bandwidth_limits {
            self.recalculate_bandwidth_limits = false;

            let mut peers_remaining = self.connected_peers as u32;
            let mut bandwidth = self.incoming_bandwidth;
            let mut needs_adjustment = true;
            let mut bandwidth_limit = 0;

            if bandwidth != 0 {
                while peers_remaining > 0 && needs_adjustment {
                    needs_adjustment = false;
                    bandwidth_limit = bandwidth / peers_remaining;

                    for peer in self.peers.iter_mut() {
                        if !peer.state.is_connected()
                            || peer.incoming_bandwidth_throttle_epoch == time_current
                        {
                            continue;
                        }

                        if peer.outgoing_bandwidth > 0 && peer.outgoing_bandwidth >= bandwidth_limit
                        {
                            continue;
                        }

                        peer.incoming_bandwidth_throttle_epoch = time_current;

                        needs_adjustment = true;
                        peers_remaining -= 1;
                        bandwidth -= peer.outgoing_bandwidth;
                    }
                }
            }

            let outgoing_bandwidth = self.outgoing_bandwidth;

            for peer in self.peers.iter_mut() {
                if !peer.state.is_connected() {
                    continue;
                }

                let incoming_bandwidth = if peer.incoming_bandwidth_throttle_epoch == time_current {
                    peer.outgoing_bandwidth
                } else {
                    bandwidth_limit
                };

                peer.queue_outgoing_command(
                    protocol::COMMAND_BANDWIDTH_LIMIT | protocol::COMMAND_FLAG_ACKNOWLEDGE,
                    0xFF,
                    Command::BandwidthLimit {
                        incoming_bandwidth,
                        outgoing_bandwidth,
                    },
                    None,
                    0,
                    0,
                );
            }
        }
    }
}

fn scale_bandwidth(bytes_per_second: u32, elapsed_ms: u32) -> u32 {
    ((bytes_per_second as u64 * elapsed_ms as u64) / 1000).min(u32::MAX as u64) as u32
}

pub(crate) fn initial_window_size(outgoing_bandwidth: u32) -> u32 {
    let window_size = if outgoing_bandwidth == 0 {
        protocol::MAXIMUM_WINDOW_SIZE
    } else {
        (outgoing_bandwidth / peer::WINDOW_SIZE_SCALE) * protocol::MINIMUM_WINDOW_SIZE
    };

    window_size
        .max(protocol::MINIMUM_WINDOW_SIZE)
        .min(protocol::MAXIMUM_WINDOW_SIZE)
}

/// Window size from the lower (or only) of the two bandwidth limits that apply to a
/// direction of flow.
pub(crate) fn negotiated_window_size(local_bandwidth: u32, remote_bandwidth: u32) -> u32 {
    let window_size = if local_bandwidth == 0 && remote_bandwidth == 0 {
        protocol::MAXIMUM_WINDOW_SIZE
    } else if local_bandwidth == 0 || remote_bandwidth == 0 {
        (local_bandwidth.max(remote_bandwidth) / peer::WINDOW_SIZE_SCALE)
            * protocol::MINIMUM_WINDOW_SIZE
    } else {
        (local_bandwidth.min(remote_bandwidth) / peer::WINDOW_SIZE_SCALE)
            * protocol::MINIMUM_WINDOW_SIZE
    };

    window_size
        .max(protocol::MINIMUM_WINDOW_SIZE)
        .min(protocol::MAXIMUM_WINDOW_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_size_scaling() {
        assert_eq!(initial_window_size(0), protocol::MAXIMUM_WINDOW_SIZE);
        assert_eq!(initial_window_size(1), protocol::MINIMUM_WINDOW_SIZE);
        // 256 kB/s scales to four minimum windows.
        assert_eq!(initial_window_size(256 * 1024), 4 * protocol::MINIMUM_WINDOW_SIZE);
        assert_eq!(initial_window_size(u32::MAX), protocol::MAXIMUM_WINDOW_SIZE);
    }

    #[test]
    fn negotiated_window_takes_lower_limit() {
        assert_eq!(
            negotiated_window_size(0, 0),
            protocol::MAXIMUM_WINDOW_SIZE
        );
        assert_eq!(
            negotiated_window_size(0, 128 * 1024),
            2 * protocol::MINIMUM_WINDOW_SIZE
        );
        assert_eq!(
            negotiated_window_size(128 * 1024, 256 * 1024),
            2 * protocol::MINIMUM_WINDOW_SIZE
        );
    }

    #[test]
    fn channel_limit_normalization() {
        assert_eq!(normalize_channel_limit(0), protocol::MAXIMUM_CHANNEL_COUNT);
        assert_eq!(normalize_channel_limit(5), 5);
        assert_eq!(
            normalize_channel_limit(1000),
            protocol::MAXIMUM_CHANNEL_COUNT
        );
    }
}
