
use super::negotiated_window_size;
use super::Host;
use super::Intercept;
use super::BANDWIDTH_THROTTLE_INTERVAL;

use crate::channel::FREE_RELIABLE_WINDOWS;
use crate::channel::RELIABLE_WINDOWS;
use crate::channel::RELIABLE_WINDOW_SIZE;
use crate::peer;
use crate::peer::incoming::IncomingResult;
use crate::peer::OutgoingCommand;
use crate::peer::PeerState;
use crate::protocol;
use crate::protocol::serial;
use crate::protocol::serial::CommandHeader;
use crate::protocol::serial::DatagramHeader;
use crate::protocol::Command;
use crate::protocol::Handshake;
use crate::time_difference;
use crate::time_greater_equal;
use crate::time_less;
use crate::Error;
use crate::Event;
use crate::PeerId;
use crate::PACKET_LOSS_SCALE;

use std::io::ErrorKind;
use std::net;
use std::time;

// At most this many datagrams are drained from the socket per service call, so a
// flood cannot starve the send and dispatch phases.
const MAX_RECEIVE_BATCH: usize = 256;

fn abs_difference(a: u32, b: u32) -> u32 {
    if a > b {
        a - b
    } else {
        b - a
    }
}

impl Host {
    /// Waits up to `timeout` milliseconds for events, shuttling datagrams between the
    /// socket and the peers, and returns at most one event per call.
    pub fn service(&mut self, timeout: u32) -> Result<Option<Event>, Error> {
        if let Some(event) = self.dispatch_incoming_commands() {
            return Ok(Some(event));
        }

        self.update_service_time();
        let deadline = self.service_time.wrapping_add(timeout);

        loop {
            if time_difference(self.service_time, self.bandwidth_throttle_epoch)
                >= BANDWIDTH_THROTTLE_INTERVAL
            {
                self.bandwidth_throttle();
            }

            if let Some(event) = self.send_outgoing_commands(true, true)? {
                return Ok(Some(event));
            }

            if let Some(event) = self.receive_incoming_commands(true)? {
                return Ok(Some(event));
            }

            if let Some(event) = self.send_outgoing_commands(true, true)? {
                return Ok(Some(event));
            }

            if let Some(event) = self.dispatch_incoming_commands() {
                return Ok(Some(event));
            }

            self.update_service_time();

            if time_greater_equal(self.service_time, deadline) {
                return Ok(None);
            }

            let remaining = time_difference(deadline, self.service_time);
            if !self.wait_receive(remaining)? {
                return Ok(None);
            }

            self.update_service_time();
        }
    }

    /// Checks for any queued events and dispatches one if available, without doing
    /// any socket work.
    pub fn check_events(&mut self) -> Option<Event> {
        self.dispatch_incoming_commands()
    }

    /// Sends any queued outgoing commands immediately, without servicing events.
    pub fn flush(&mut self) -> Result<(), Error> {
        self.update_service_time();
        self.send_outgoing_commands(false, false)?;
        Ok(())
    }

    pub(crate) fn update_service_time(&mut self) {
        self.service_time = self.time_base.elapsed().as_millis() as u32;
    }

    fn datagram_header_size(&self) -> usize {
        let checksum = if self.checksum.is_some() {
            serial::CHECKSUM_SIZE
        } else {
            0
        };

        serial::HEADER_SIZE_SENT_TIME + checksum
    }

    fn datagram_remaining(&self, index: usize) -> usize {
        (self.peers[index].mtu as usize)
            .saturating_sub(self.datagram_header_size() + self.command_buffer.len())
    }

    // Blocks on the socket until a datagram arrives or the timeout lapses. The
    // datagram, if any, is stashed for the next receive pass.
    fn wait_receive(&mut self, timeout_ms: u32) -> Result<bool, Error> {
        if timeout_ms == 0 {
            return Ok(false);
        }

        self.socket.set_nonblocking(false)?;
        self.socket
            .set_read_timeout(Some(time::Duration::from_millis(timeout_ms as u64)))?;

        let result = self.socket.recv_from(&mut self.receive_buffer);

        self.socket.set_nonblocking(true)?;

        match result {
            Ok((length, address)) => {
                self.stashed_datagram = Some((length, address));
                Ok(true)
            }
            Err(error)
                if error.kind() == ErrorKind::WouldBlock
                    || error.kind() == ErrorKind::TimedOut
                    || error.kind() == ErrorKind::Interrupted =>
            {
                Ok(false)
            }
            Err(error) => Err(error.into()),
        }
    }

    fn dispatch_incoming_commands(&mut self) -> Option<Event> {
        while let Some(index) = self.dispatch_queue.pop_front() {
            // Slots reset since they were queued are skipped.
            if !self.peers[index].needs_dispatch {
                continue;
            }
            self.peers[index].needs_dispatch = false;

            match self.peers[index].state {
                PeerState::ConnectionPending | PeerState::ConnectionSucceeded => {
                    self.change_state(index, PeerState::Connected);

                    let data = self.peers[index].event_data;
                    return Some(Event::Connect {
                        peer: PeerId(index),
                        data,
                    });
                }
                PeerState::Zombie => {
                    self.recalculate_bandwidth_limits = true;

                    let data = self.peers[index].event_data;
                    self.reset_peer_slot(index);

                    return Some(Event::Disconnect {
                        peer: PeerId(index),
                        data,
                    });
                }
                PeerState::Connected => {
                    let (channel_id, packet) = match self.peers[index].receive() {
                        Some(received) => received,
                        None => continue,
                    };

                    if !self.peers[index].dispatched_commands.is_empty() {
                        self.ensure_dispatch(index);
                    }

                    return Some(Event::Receive {
                        peer: PeerId(index),
                        channel_id,
                        packet,
                    });
                }
                _ => continue,
            }
        }

        None
    }

    fn send_outgoing_commands(
        &mut self,
        check_for_timeouts: bool,
        produce_events: bool,
    ) -> Result<Option<Event>, Error> {
        self.continue_sending = true;

        while self.continue_sending {
            self.continue_sending = false;

            for index in 0..self.peers.len() {
                match self.peers[index].state {
                    PeerState::Disconnected | PeerState::Zombie => continue,
                    _ => (),
                }

                self.header_sent_time = false;
                self.command_count = 0;
                self.command_buffer.clear();

                if !self.peers[index].acknowledgements.is_empty() {
                    self.send_acknowledgements(index);
                }

                if check_for_timeouts
                    && !self.peers[index].sent_reliable_commands.is_empty()
                    && time_greater_equal(self.service_time, self.peers[index].next_timeout)
                    && self.check_timeouts(index)
                {
                    log::debug!("peer {}: retransmission limits exhausted", index);

                    let event = self.notify_disconnect(index, produce_events);
                    if event.is_some() {
                        return Ok(event);
                    }
                    continue;
                }

                let mut can_ping = true;
                if !self.peers[index].outgoing_commands.is_empty() {
                    can_ping = self.check_outgoing_commands(index);
                }

                let ping_due = {
                    let peer = &self.peers[index];
                    can_ping
                        && peer.sent_reliable_commands.is_empty()
                        && time_difference(self.service_time, peer.last_receive_time)
                            >= peer.ping_interval
                        && self.datagram_remaining(index)
                            >= protocol::command_size(protocol::COMMAND_PING)
                };

                if ping_due {
                    self.peers[index].ping();
                    self.check_outgoing_commands(index);
                }

                if self.command_count == 0 {
                    continue;
                }

                self.update_packet_loss(index);

                let result = self.transmit_datagram(index);
                self.remove_sent_unreliable_commands(index);
                result?;
            }
        }

        Ok(None)
    }

    fn update_packet_loss(&mut self, index: usize) {
        let service_time = self.service_time;
        let peer = &mut self.peers[index];

        if peer.packet_loss_epoch == 0 {
            peer.packet_loss_epoch = service_time;
        } else if time_difference(service_time, peer.packet_loss_epoch)
            >= peer::PACKET_LOSS_INTERVAL
            && peer.packets_sent > 0
        {
            let packet_loss = peer.packets_lost * PACKET_LOSS_SCALE / peer.packets_sent;

            peer.packet_loss_variance = (peer.packet_loss_variance * 3
                + abs_difference(packet_loss, peer.packet_loss))
                / 4;
            peer.packet_loss = (peer.packet_loss * 7 + packet_loss) / 8;

            peer.packet_loss_epoch = service_time;
            peer.packets_sent = 0;
            peer.packets_lost = 0;
        }
    }

    fn send_acknowledgements(&mut self, index: usize) {
        let header_size = self.datagram_header_size();
        let ack_size = protocol::command_size(protocol::COMMAND_ACKNOWLEDGE);
        let mut disconnect_acked = false;

        while !self.peers[index].acknowledgements.is_empty() {
            let remaining = (self.peers[index].mtu as usize)
                .saturating_sub(header_size + self.command_buffer.len());

            if self.command_count >= protocol::MAXIMUM_PACKET_COMMANDS || remaining < ack_size {
                self.continue_sending = true;
                break;
            }

            let acknowledgement = self.peers[index].acknowledgements.pop_front().unwrap();

            let header = CommandHeader {
                command: protocol::COMMAND_ACKNOWLEDGE,
                channel_id: acknowledgement.channel_id,
                reliable_sequence_number: acknowledgement.reliable_sequence_number,
            };

            serial::write_command(
                &mut self.command_buffer,
                &header,
                &Command::Acknowledge {
                    received_reliable_sequence_number: acknowledgement.reliable_sequence_number,
                    received_sent_time: acknowledgement.sent_time,
                },
            );
            self.command_count += 1;

            if acknowledgement.command & protocol::COMMAND_MASK == protocol::COMMAND_DISCONNECT {
                disconnect_acked = true;
            }
        }

        if disconnect_acked {
            self.dispatch_state(index, PeerState::Zombie);
        }
    }

    // Returns true when the peer's retransmission allowance is exhausted and it must
    // be disconnected; otherwise expired commands have been moved back to the front
    // of the outgoing queue with doubled timeouts.
    fn check_timeouts(&mut self, index: usize) -> bool {
        let service_time = self.service_time;
        let peer = &mut self.peers[index];

        let mut expired: Vec<OutgoingCommand> = Vec::new();
        let mut i = 0;

        while i < peer.sent_reliable_commands.len() {
            {
                let command = &peer.sent_reliable_commands[i];

                if time_difference(service_time, command.sent_time) < command.round_trip_timeout {
                    i += 1;
                    continue;
                }

                if peer.earliest_timeout == 0 || time_less(command.sent_time, peer.earliest_timeout)
                {
                    peer.earliest_timeout = command.sent_time;
                }

                let age = time_difference(service_time, peer.earliest_timeout);
                if age >= peer.timeout_maximum
                    || (command.round_trip_timeout >= command.round_trip_timeout_limit
                        && age >= peer.timeout_minimum)
                {
                    return true;
                }
            }

            let mut command = peer.sent_reliable_commands.remove(i).unwrap();

            if command.packet.is_some() {
                peer.reliable_data_in_transit = peer
                    .reliable_data_in_transit
                    .saturating_sub(command.fragment_length as u32);
            }

            peer.packets_lost += 1;
            command.round_trip_timeout *= 2;

            expired.push(command);
        }

        for command in expired.into_iter().rev() {
            peer.outgoing_commands.push_front(command);
        }

        if let Some(head) = peer.sent_reliable_commands.front() {
            peer.next_timeout = head.sent_time.wrapping_add(head.round_trip_timeout);
        }

        false
    }

    // Walks the outgoing queue, copying every command that fits and that the
    // reliable windows and congestion window permit into the datagram under
    // assembly. Returns whether a ping could still be queued this flush.
    fn check_outgoing_commands(&mut self, index: usize) -> bool {
        let service_time = self.service_time;
        let header_size = self.datagram_header_size();

        let mut window_exceeded = false;
        let mut window_wrap = false;
        let mut can_ping = true;

        let mut i = 0;
        loop {
            let peer = &mut self.peers[index];

            if i >= peer.outgoing_commands.len() {
                break;
            }

            let reliable;
            {
                let command = &peer.outgoing_commands[i];
                reliable = command.command & protocol::COMMAND_FLAG_ACKNOWLEDGE != 0;

                if reliable {
                    let mut blocked = false;

                    if let Some(channel) = peer.channels.get(command.channel_id as usize) {
                        let window =
                            (command.reliable_sequence_number / RELIABLE_WINDOW_SIZE) as u32;

                        if !window_wrap
                            && command.send_attempts < 1
                            && command.reliable_sequence_number % RELIABLE_WINDOW_SIZE == 0
                        {
                            // Entering a fresh reliable window requires the previous
                            // window to be fully acknowledged and the free span ahead
                            // to be clear.
                            let free_span = (1u32 << (FREE_RELIABLE_WINDOWS + 2)) - 1;
                            let mask = (free_span << window)
                                | (free_span >> (RELIABLE_WINDOWS as u32 - window));
                            let previous =
                                ((window + RELIABLE_WINDOWS as u32 - 1) % RELIABLE_WINDOWS as u32)
                                    as usize;

                            if channel.reliable_windows[previous] >= RELIABLE_WINDOW_SIZE
                                || channel.used_reliable_windows as u32 & mask != 0
                            {
                                window_wrap = true;
                            }
                        }

                        if window_wrap {
                            blocked = true;
                        }
                    }

                    if !blocked && command.packet.is_some() {
                        if !window_exceeded
                            && peer.reliable_data_in_transit + command.fragment_length as u32
                                > peer.throttled_window()
                        {
                            window_exceeded = true;
                        }

                        if window_exceeded {
                            blocked = true;
                        }
                    }

                    if blocked {
                        i += 1;
                        continue;
                    }

                    can_ping = false;
                }

                let size = protocol::command_size(command.command);
                let payload = if command.packet.is_some() {
                    command.fragment_length as usize
                } else {
                    0
                };
                let remaining =
                    (peer.mtu as usize).saturating_sub(header_size + self.command_buffer.len());

                if self.command_count >= protocol::MAXIMUM_PACKET_COMMANDS
                    || remaining < size + payload
                {
                    self.continue_sending = true;
                    break;
                }
            }

            if !reliable {
                let command = &peer.outgoing_commands[i];

                if command.packet.is_some() && command.fragment_offset == 0 {
                    // Unreliable data rides the packet throttle; a dropped packet
                    // takes all of its follow-on fragments with it.
                    peer.packet_throttle_counter += peer::PACKET_THROTTLE_COUNTER;
                    peer.packet_throttle_counter %= crate::PACKET_THROTTLE_SCALE;

                    if peer.packet_throttle_counter > peer.packet_throttle {
                        let reliable_sequence_number = command.reliable_sequence_number;
                        let unreliable_sequence_number = command.unreliable_sequence_number;

                        loop {
                            let _ = peer.outgoing_commands.remove(i);

                            match peer.outgoing_commands.get(i) {
                                Some(next)
                                    if next.reliable_sequence_number
                                        == reliable_sequence_number
                                        && next.unreliable_sequence_number
                                            == unreliable_sequence_number => {}
                                _ => break,
                            }
                        }

                        continue;
                    }
                }
            }

            let mut command = peer.outgoing_commands.remove(i).unwrap();

            if reliable {
                if command.send_attempts < 1 {
                    if let Some(channel) = peer.channels.get_mut(command.channel_id as usize) {
                        let window =
                            (command.reliable_sequence_number / RELIABLE_WINDOW_SIZE) as usize;
                        channel.used_reliable_windows |= 1 << window;
                        channel.reliable_windows[window] += 1;
                    }
                }

                command.send_attempts += 1;

                if command.round_trip_timeout == 0 {
                    command.round_trip_timeout =
                        peer.round_trip_time + 4 * peer.round_trip_time_variance;
                    command.round_trip_timeout_limit =
                        peer.timeout_limit * command.round_trip_timeout;
                }

                if peer.sent_reliable_commands.is_empty() {
                    peer.next_timeout = service_time.wrapping_add(command.round_trip_timeout);
                }

                command.sent_time = service_time;
                peer.reliable_data_in_transit += command.fragment_length as u32;

                self.header_sent_time = true;
            }

            let header = CommandHeader {
                command: command.command,
                channel_id: command.channel_id,
                reliable_sequence_number: command.reliable_sequence_number,
            };
            serial::write_command(&mut self.command_buffer, &header, &command.kind);

            if let Some(packet) = &command.packet {
                let offset = command.fragment_offset as usize;
                let length = command.fragment_length as usize;

                self.command_buffer
                    .extend_from_slice(&packet.data()[offset..offset + length]);
                packet.mark_sent();
            }

            self.command_count += 1;
            peer.packets_sent += 1;

            if reliable {
                peer.sent_reliable_commands.push_back(command);
            } else if command.packet.is_some() {
                peer.sent_unreliable_commands.push_back(command);
            }
        }

        let peer = &self.peers[index];
        if peer.state == PeerState::DisconnectLater
            && peer.outgoing_commands.is_empty()
            && peer.sent_reliable_commands.is_empty()
            && peer.sent_unreliable_commands.is_empty()
        {
            let data = peer.event_data;
            let _ = self.disconnect(PeerId(index), data);
        }

        can_ping
    }

    fn transmit_datagram(&mut self, index: usize) -> Result<(), Error> {
        let address = match self.peers[index].address {
            Some(address) => address,
            None => return Ok(()),
        };

        let mut compressed = false;
        if let Some(compressor) = &mut self.compressor {
            if !self.command_buffer.is_empty() {
                self.compress_buffer.clear();
                self.compress_buffer.resize(self.command_buffer.len(), 0);

                if let Some(size) =
                    compressor.compress(&self.command_buffer, &mut self.compress_buffer)
                {
                    if size < self.command_buffer.len() {
                        compressed = true;
                        self.compress_buffer.truncate(size);
                    }
                }
            }
        }

        let peer = &self.peers[index];
        let known_peer = peer.outgoing_peer_id < protocol::MAXIMUM_PEER_ID;

        let header = DatagramHeader {
            peer_id: peer.outgoing_peer_id,
            session_id: if known_peer { peer.outgoing_session_id } else { 0 },
            compressed,
            sent_time: if self.header_sent_time {
                Some((self.service_time & 0xFFFF) as u16)
            } else {
                None
            },
        };

        let body: &[u8] = if compressed {
            &self.compress_buffer
        } else {
            &self.command_buffer
        };

        let mut datagram = Vec::with_capacity(serial::HEADER_SIZE_SENT_TIME + serial::CHECKSUM_SIZE + body.len());
        serial::write_header(&mut datagram, &header);

        if let Some(checksum) = &self.checksum {
            // The slot carries the connection id while the checksum is computed, and
            // the result afterwards. The checksum always covers the uncompressed
            // command region; the receiver verifies after decompressing.
            let connect_id = if known_peer { peer.connect_id } else { 0 };
            datagram.extend_from_slice(&connect_id.to_be_bytes());

            let value = checksum(&[&datagram[..], &self.command_buffer[..]]);

            let slot = datagram.len() - serial::CHECKSUM_SIZE;
            datagram[slot..].copy_from_slice(&value.to_be_bytes());
        }

        datagram.extend_from_slice(body);

        self.peers[index].last_send_time = self.service_time;

        match self.socket.send_to(&datagram, address) {
            Ok(sent) => {
                self.total_sent_data += sent as u64;
                self.total_sent_packets += 1;
                Ok(())
            }
            // A full send buffer defers the datagram; reliable traffic retransmits.
            Err(error) if error.kind() == ErrorKind::WouldBlock => Ok(()),
            Err(error) => Err(error.into()),
        }
    }

    fn remove_sent_unreliable_commands(&mut self, index: usize) {
        if self.peers[index].sent_unreliable_commands.is_empty() {
            return;
        }

        self.peers[index].sent_unreliable_commands.clear();

        let peer = &self.peers[index];
        if peer.state == PeerState::DisconnectLater
            && peer.outgoing_commands.is_empty()
            && peer.sent_reliable_commands.is_empty()
        {
            let data = peer.event_data;
            let _ = self.disconnect(PeerId(index), data);
        }
    }

    fn remove_sent_reliable_command(
        &mut self,
        index: usize,
        reliable_sequence_number: u16,
        channel_id: u8,
    ) -> u8 {
        let peer = &mut self.peers[index];
        let mut was_sent = true;

        let position = peer.sent_reliable_commands.iter().position(|command| {
            command.reliable_sequence_number == reliable_sequence_number
                && command.channel_id == channel_id
        });

        let command = match position {
            Some(position) => peer.sent_reliable_commands.remove(position).unwrap(),
            None => {
                // The command may be back on the outgoing queue awaiting
                // retransmission; an ack for it still counts.
                let mut found = None;
                for (position, command) in peer.outgoing_commands.iter().enumerate() {
                    if command.command & protocol::COMMAND_FLAG_ACKNOWLEDGE == 0 {
                        continue;
                    }
                    if command.send_attempts < 1 {
                        return 0;
                    }
                    if command.reliable_sequence_number == reliable_sequence_number
                        && command.channel_id == channel_id
                    {
                        found = Some(position);
                        break;
                    }
                }

                match found {
                    Some(position) => {
                        was_sent = false;
                        peer.outgoing_commands.remove(position).unwrap()
                    }
                    None => return 0,
                }
            }
        };

        if let Some(channel) = peer.channels.get_mut(channel_id as usize) {
            let window = (reliable_sequence_number / RELIABLE_WINDOW_SIZE) as usize;

            if channel.reliable_windows[window] > 0 {
                channel.reliable_windows[window] -= 1;
                if channel.reliable_windows[window] == 0 {
                    channel.used_reliable_windows &= !(1 << window);
                }
            }
        }

        if command.packet.is_some() && was_sent {
            peer.reliable_data_in_transit = peer
                .reliable_data_in_transit
                .saturating_sub(command.fragment_length as u32);
        }

        if let Some(head) = peer.sent_reliable_commands.front() {
            peer.next_timeout = head.sent_time.wrapping_add(head.round_trip_timeout);
        }

        command.command & protocol::COMMAND_MASK
    }

    fn receive_incoming_commands(&mut self, produce_events: bool) -> Result<Option<Event>, Error> {
        for _ in 0..MAX_RECEIVE_BATCH {
            let (length, address) = match self.stashed_datagram.take() {
                Some(stashed) => stashed,
                None => match self.socket.recv_from(&mut self.receive_buffer) {
                    Ok(received) => received,
                    Err(error) if error.kind() == ErrorKind::WouldBlock => return Ok(None),
                    Err(error) if error.kind() == ErrorKind::Interrupted => continue,
                    Err(error) => return Err(error.into()),
                },
            };

            self.total_received_data += length as u64;
            self.total_received_packets += 1;

            if let Some(intercept) = &mut self.intercept {
                match intercept(address, &self.receive_buffer[..length]) {
                    Intercept::Pass => (),
                    Intercept::Consume => continue,
                    Intercept::Error => return Err(Error::Intercepted),
                }
            }

            if let Some(event) = self.handle_datagram(address, length, produce_events) {
                return Ok(Some(event));
            }
        }

        Ok(None)
    }

    // Parses one received datagram and feeds its commands through the protocol. Any
    // malformed structure discards the remainder of the datagram silently.
    fn handle_datagram(
        &mut self,
        address: net::SocketAddr,
        length: usize,
        produce_events: bool,
    ) -> Option<Event> {
        let header = serial::read_header(&self.receive_buffer[..length])?;
        let base_header_size = header.size();
        let header_size = base_header_size
            + if self.checksum.is_some() {
                serial::CHECKSUM_SIZE
            } else {
                0
            };

        if length < header_size {
            return None;
        }

        let mut peer_index = if header.peer_id == protocol::MAXIMUM_PEER_ID {
            None
        } else if header.peer_id as usize >= self.peers.len() {
            return None;
        } else {
            let peer = &self.peers[header.peer_id as usize];

            match peer.state {
                PeerState::Disconnected | PeerState::Zombie => return None,
                _ => (),
            }

            if peer.address != Some(address) {
                return None;
            }

            if peer.outgoing_peer_id < protocol::MAXIMUM_PEER_ID
                && header.session_id != peer.incoming_session_id
            {
                return None;
            }

            Some(header.peer_id as usize)
        };

        let body: Vec<u8> = if header.compressed {
            let compressor = self.compressor.as_mut()?;

            self.compress_buffer.clear();
            self.compress_buffer
                .resize(protocol::MAXIMUM_MTU as usize, 0);

            let size = compressor.decompress(
                &self.receive_buffer[header_size..length],
                &mut self.compress_buffer,
            )?;

            self.compress_buffer[..size].to_vec()
        } else {
            self.receive_buffer[header_size..length].to_vec()
        };

        if let Some(checksum) = &self.checksum {
            let slot = &self.receive_buffer[base_header_size..base_header_size + 4];
            let received_value = u32::from_be_bytes([slot[0], slot[1], slot[2], slot[3]]);

            let connect_id = match peer_index {
                Some(index) => self.peers[index].connect_id,
                None => 0,
            };

            let header_bytes = &self.receive_buffer[..base_header_size];
            let connect_id_bytes = connect_id.to_be_bytes();

            if checksum(&[header_bytes, &connect_id_bytes[..], &body[..]]) != received_value {
                log::warn!("datagram with invalid checksum from {}", address);
                return None;
            }
        }

        if let Some(index) = peer_index {
            let peer = &mut self.peers[index];
            peer.address = Some(address);
            peer.incoming_data_total += (header_size + body.len()) as u32;
        }

        let maximum_packet_size = self.maximum_packet_size;
        let maximum_waiting_data = self.maximum_waiting_data;

        // An event produced here must not cut the datagram short: later commands in
        // it still need processing (and the command that produced the event still
        // needs its acknowledgement queued). The first event is held and returned
        // once the whole datagram has been walked; any further state changes reach
        // the application through the dispatch queue.
        let mut produced: Option<Event> = None;

        let mut current = 0;
        while current < body.len() {
            let (command_header, command, record_size) = match serial::read_command(&body[current..])
            {
                Some(parsed) => parsed,
                None => break,
            };
            current += record_size;

            let command_number = command_header.command & protocol::COMMAND_MASK;

            if peer_index.is_none() && command_number != protocol::COMMAND_CONNECT {
                break;
            }

            let payload = match &command {
                Command::SendReliable { data_length }
                | Command::SendUnreliable { data_length, .. }
                | Command::SendUnsequenced { data_length, .. } => {
                    match take_payload(&body, &mut current, *data_length, maximum_packet_size) {
                        Some(payload) => payload,
                        None => break,
                    }
                }
                Command::SendFragment(record) | Command::SendUnreliableFragment(record) => {
                    match take_payload(&body, &mut current, record.data_length, maximum_packet_size)
                    {
                        Some(payload) => payload,
                        None => break,
                    }
                }
                _ => &[][..],
            };

            match command {
                Command::Acknowledge {
                    received_reliable_sequence_number,
                    received_sent_time,
                } => {
                    let index = peer_index.unwrap();
                    match self.handle_acknowledge(
                        index,
                        command_header.channel_id,
                        received_reliable_sequence_number,
                        received_sent_time,
                        produce_events && produced.is_none(),
                    ) {
                        Ok(Some(event)) => produced = Some(event),
                        Ok(None) => (),
                        Err(()) => break,
                    }
                }
                Command::Connect(handshake) => {
                    if peer_index.is_some() {
                        break;
                    }
                    match self.handle_connect(address, handshake) {
                        Some(index) => peer_index = Some(index),
                        None => break,
                    }
                }
                Command::VerifyConnect(handshake) => {
                    let index = peer_index.unwrap();
                    match self.handle_verify_connect(
                        index,
                        &handshake,
                        produce_events && produced.is_none(),
                    ) {
                        Ok(Some(event)) => produced = Some(event),
                        Ok(None) => (),
                        Err(()) => break,
                    }
                }
                Command::Disconnect { data } => {
                    let index = peer_index.unwrap();
                    self.handle_disconnect(index, command_header.command, data);
                }
                Command::Ping => {
                    let index = peer_index.unwrap();
                    if !self.peers[index].state.is_connected() {
                        break;
                    }
                }
                Command::SendReliable { .. } => {
                    let index = peer_index.unwrap();
                    let result = self.peers[index].handle_send_reliable(
                        command_header.channel_id,
                        command_header.reliable_sequence_number,
                        command_header.command,
                        payload,
                        maximum_waiting_data,
                    );
                    if result == IncomingResult::Rejected {
                        break;
                    }
                }
                Command::SendUnreliable {
                    unreliable_sequence_number,
                    ..
                } => {
                    let index = peer_index.unwrap();
                    let result = self.peers[index].handle_send_unreliable(
                        command_header.channel_id,
                        command_header.reliable_sequence_number,
                        unreliable_sequence_number,
                        command_header.command,
                        payload,
                        maximum_waiting_data,
                    );
                    if result == IncomingResult::Rejected {
                        break;
                    }
                }
                Command::SendUnsequenced {
                    unsequenced_group, ..
                } => {
                    let index = peer_index.unwrap();
                    let result = self.peers[index].handle_send_unsequenced(
                        command_header.channel_id,
                        unsequenced_group,
                        command_header.command,
                        payload,
                        maximum_waiting_data,
                    );
                    if result == IncomingResult::Rejected {
                        break;
                    }
                }
                Command::SendFragment(record) => {
                    let index = peer_index.unwrap();
                    let result = self.peers[index].handle_send_fragment(
                        command_header.channel_id,
                        &record,
                        payload,
                        maximum_packet_size,
                        maximum_waiting_data,
                    );
                    if result == IncomingResult::Rejected {
                        break;
                    }
                }
                Command::SendUnreliableFragment(record) => {
                    let index = peer_index.unwrap();
                    let result = self.peers[index].handle_send_unreliable_fragment(
                        command_header.channel_id,
                        command_header.reliable_sequence_number,
                        &record,
                        payload,
                        maximum_packet_size,
                        maximum_waiting_data,
                    );
                    if result == IncomingResult::Rejected {
                        break;
                    }
                }
                Command::BandwidthLimit {
                    incoming_bandwidth,
                    outgoing_bandwidth,
                } => {
                    let index = peer_index.unwrap();
                    if self
                        .handle_bandwidth_limit(index, incoming_bandwidth, outgoing_bandwidth)
                        .is_err()
                    {
                        break;
                    }
                }
                Command::ThrottleConfigure {
                    packet_throttle_interval,
                    packet_throttle_acceleration,
                    packet_throttle_deceleration,
                } => {
                    let index = peer_index.unwrap();

                    if !self.peers[index].state.is_connected() {
                        break;
                    }

                    let peer = &mut self.peers[index];
                    peer.packet_throttle_interval = packet_throttle_interval;
                    peer.packet_throttle_acceleration = packet_throttle_acceleration;
                    peer.packet_throttle_deceleration = packet_throttle_deceleration;
                }
            }

            if let Some(index) = peer_index {
                if command_header.command & protocol::COMMAND_FLAG_ACKNOWLEDGE != 0 {
                    let sent_time = match header.sent_time {
                        Some(sent_time) => sent_time,
                        None => break,
                    };

                    match self.peers[index].state {
                        PeerState::Disconnecting
                        | PeerState::AcknowledgingConnect
                        | PeerState::Disconnected
                        | PeerState::Zombie => (),
                        PeerState::AcknowledgingDisconnect => {
                            if command_number == protocol::COMMAND_DISCONNECT {
                                self.peers[index].queue_acknowledgement(
                                    command_header.command,
                                    command_header.channel_id,
                                    command_header.reliable_sequence_number,
                                    sent_time,
                                );
                            }
                        }
                        _ => {
                            self.peers[index].queue_acknowledgement(
                                command_header.command,
                                command_header.channel_id,
                                command_header.reliable_sequence_number,
                                sent_time,
                            );
                        }
                    }
                }
            }
        }

        if let Some(index) = peer_index {
            if !self.peers[index].dispatched_commands.is_empty() {
                self.ensure_dispatch(index);
            }
        }

        produced
    }

    fn handle_acknowledge(
        &mut self,
        index: usize,
        channel_id: u8,
        received_reliable_sequence_number: u16,
        received_sent_time: u16,
        produce_events: bool,
    ) -> Result<Option<Event>, ()> {
        match self.peers[index].state {
            PeerState::Disconnected | PeerState::Zombie => return Ok(None),
            _ => (),
        }

        let service_time = self.service_time;

        // The echoed 16-bit timestamp is widened against the current clock, stepping
        // back one epoch if it appears to be from the future.
        let mut sent_time = received_sent_time as u32 | (service_time & 0xFFFF_0000);
        if (sent_time & 0x8000) > (service_time & 0x8000) {
            sent_time = sent_time.wrapping_sub(0x10000);
        }

        if time_less(service_time, sent_time) {
            return Ok(None);
        }

        let round_trip_time = time_difference(service_time, sent_time).max(1);

        {
            let peer = &mut self.peers[index];

            if peer.last_receive_time > 0 {
                peer.throttle(round_trip_time);

                peer.round_trip_time_variance -= peer.round_trip_time_variance / 4;

                if round_trip_time >= peer.round_trip_time {
                    let difference = round_trip_time - peer.round_trip_time;
                    peer.round_trip_time_variance += difference / 4;
                    peer.round_trip_time += difference / 8;
                } else {
                    let difference = peer.round_trip_time - round_trip_time;
                    peer.round_trip_time_variance += difference / 4;
                    peer.round_trip_time -= difference / 8;
                }
            } else {
                peer.round_trip_time = round_trip_time;
                peer.round_trip_time_variance = (round_trip_time + 1) / 2;
            }

            peer.lowest_round_trip_time = peer.lowest_round_trip_time.min(peer.round_trip_time);
            peer.highest_round_trip_time_variance = peer
                .highest_round_trip_time_variance
                .max(peer.round_trip_time_variance);

            if peer.packet_throttle_epoch == 0
                || time_difference(service_time, peer.packet_throttle_epoch)
                    >= peer.packet_throttle_interval
            {
                peer.last_round_trip_time = peer.lowest_round_trip_time;
                peer.last_round_trip_time_variance = peer.highest_round_trip_time_variance.max(1);
                peer.lowest_round_trip_time = peer.round_trip_time;
                peer.highest_round_trip_time_variance = peer.round_trip_time_variance;
                peer.packet_throttle_epoch = service_time;
            }

            peer.last_receive_time = service_time.max(1);
            peer.earliest_timeout = 0;
        }

        let removed =
            self.remove_sent_reliable_command(index, received_reliable_sequence_number, channel_id);

        match self.peers[index].state {
            PeerState::AcknowledgingConnect => {
                if removed != protocol::COMMAND_VERIFY_CONNECT {
                    return Err(());
                }
                Ok(self.notify_connect(index, produce_events))
            }
            PeerState::Disconnecting => {
                if removed != protocol::COMMAND_DISCONNECT {
                    return Err(());
                }
                Ok(self.notify_disconnect(index, produce_events))
            }
            PeerState::DisconnectLater => {
                let peer = &self.peers[index];
                if peer.outgoing_commands.is_empty() && peer.sent_reliable_commands.is_empty() {
                    let data = peer.event_data;
                    let _ = self.disconnect(PeerId(index), data);
                }
                Ok(None)
            }
            _ => Ok(None),
        }
    }

    fn handle_connect(&mut self, address: net::SocketAddr, handshake: Handshake) -> Option<usize> {
        let channel_count = handshake.channel_count as usize;

        if channel_count < protocol::MINIMUM_CHANNEL_COUNT
            || channel_count > protocol::MAXIMUM_CHANNEL_COUNT
        {
            return None;
        }

        let mut slot = None;
        let mut duplicate_peers = 0;

        for (index, peer) in self.peers.iter().enumerate() {
            if peer.state == PeerState::Disconnected {
                if slot.is_none() {
                    slot = Some(index);
                }
            } else if peer.state != PeerState::Connecting {
                if let Some(peer_address) = peer.address {
                    if peer_address.ip() == address.ip() {
                        if peer_address.port() == address.port()
                            && peer.connect_id == handshake.connect_id
                        {
                            // A retransmitted CONNECT for a connection already
                            // being set up.
                            return None;
                        }

                        duplicate_peers += 1;
                    }
                }
            }
        }

        let slot = slot?;

        if duplicate_peers >= self.duplicate_peers {
            log::debug!("refusing connection from {}: duplicate peer limit", address);
            return None;
        }

        let channel_count = channel_count.min(self.channel_limit);
        let incoming_bandwidth = self.incoming_bandwidth;
        let outgoing_bandwidth = self.outgoing_bandwidth;

        let peer = &mut self.peers[slot];

        peer.setup_channels(channel_count);
        peer.state = PeerState::AcknowledgingConnect;
        peer.connect_id = handshake.connect_id;
        peer.address = Some(address);
        peer.outgoing_peer_id = handshake.outgoing_peer_id;
        peer.incoming_bandwidth = handshake.incoming_bandwidth;
        peer.outgoing_bandwidth = handshake.outgoing_bandwidth;
        peer.packet_throttle_interval = handshake.packet_throttle_interval;
        peer.packet_throttle_acceleration = handshake.packet_throttle_acceleration;
        peer.packet_throttle_deceleration = handshake.packet_throttle_deceleration;
        peer.event_data = handshake.data;

        let session_mask = (protocol::HEADER_SESSION_MASK >> protocol::HEADER_SESSION_SHIFT) as u8;

        // Session ids advance on every connection over a slot, skipping the value the
        // previous session used so stragglers from it are recognizably stale.
        let mut incoming_session_id = if handshake.incoming_session_id == 0xFF {
            peer.outgoing_session_id
        } else {
            handshake.incoming_session_id
        };
        incoming_session_id = incoming_session_id.wrapping_add(1) & session_mask;
        if incoming_session_id == peer.outgoing_session_id {
            incoming_session_id = incoming_session_id.wrapping_add(1) & session_mask;
        }
        peer.outgoing_session_id = incoming_session_id;

        let mut outgoing_session_id = if handshake.outgoing_session_id == 0xFF {
            peer.incoming_session_id
        } else {
            handshake.outgoing_session_id
        };
        outgoing_session_id = outgoing_session_id.wrapping_add(1) & session_mask;
        if outgoing_session_id == peer.incoming_session_id {
            outgoing_session_id = outgoing_session_id.wrapping_add(1) & session_mask;
        }
        peer.incoming_session_id = outgoing_session_id;

        peer.mtu = handshake
            .mtu
            .max(protocol::MINIMUM_MTU)
            .min(protocol::MAXIMUM_MTU);

        peer.window_size = negotiated_window_size(outgoing_bandwidth, peer.incoming_bandwidth);

        let window_size = if incoming_bandwidth == 0 {
            protocol::MAXIMUM_WINDOW_SIZE
        } else {
            (incoming_bandwidth / peer::WINDOW_SIZE_SCALE) * protocol::MINIMUM_WINDOW_SIZE
        }
        .min(handshake.window_size)
        .max(protocol::MINIMUM_WINDOW_SIZE)
        .min(protocol::MAXIMUM_WINDOW_SIZE);

        let verify = Handshake {
            outgoing_peer_id: peer.incoming_peer_id,
            incoming_session_id,
            outgoing_session_id,
            mtu: peer.mtu,
            window_size,
            channel_count: channel_count as u32,
            incoming_bandwidth,
            outgoing_bandwidth,
            packet_throttle_interval: peer.packet_throttle_interval,
            packet_throttle_acceleration: peer.packet_throttle_acceleration,
            packet_throttle_deceleration: peer.packet_throttle_deceleration,
            connect_id: peer.connect_id,
            data: 0,
        };

        peer.queue_outgoing_command(
            protocol::COMMAND_VERIFY_CONNECT | protocol::COMMAND_FLAG_ACKNOWLEDGE,
            0xFF,
            Command::VerifyConnect(verify),
            None,
            0,
            0,
        );

        log::debug!("peer {}: accepted connection from {}", slot, address);

        Some(slot)
    }

    fn handle_verify_connect(
        &mut self,
        index: usize,
        handshake: &Handshake,
        produce_events: bool,
    ) -> Result<Option<Event>, ()> {
        if self.peers[index].state != PeerState::Connecting {
            return Ok(None);
        }

        let channel_count = handshake.channel_count as usize;

        let mismatched = {
            let peer = &self.peers[index];

            channel_count < protocol::MINIMUM_CHANNEL_COUNT
                || channel_count > protocol::MAXIMUM_CHANNEL_COUNT
                || handshake.packet_throttle_interval != peer.packet_throttle_interval
                || handshake.packet_throttle_acceleration != peer.packet_throttle_acceleration
                || handshake.packet_throttle_deceleration != peer.packet_throttle_deceleration
                || handshake.connect_id != peer.connect_id
        };

        if mismatched {
            log::debug!("peer {}: connection verification mismatch", index);

            self.peers[index].event_data = 0;
            self.dispatch_state(index, PeerState::Zombie);

            return Err(());
        }

        self.remove_sent_reliable_command(index, 1, 0xFF);

        let peer = &mut self.peers[index];

        if channel_count < peer.channels.len() {
            peer.channels.truncate(channel_count);
        }

        peer.outgoing_peer_id = handshake.outgoing_peer_id;
        peer.incoming_session_id = handshake.incoming_session_id;
        peer.outgoing_session_id = handshake.outgoing_session_id;

        let mtu = handshake
            .mtu
            .max(protocol::MINIMUM_MTU)
            .min(protocol::MAXIMUM_MTU);
        if mtu < peer.mtu {
            peer.mtu = mtu;
        }

        let window_size = handshake
            .window_size
            .max(protocol::MINIMUM_WINDOW_SIZE)
            .min(protocol::MAXIMUM_WINDOW_SIZE);
        if window_size < peer.window_size {
            peer.window_size = window_size;
        }

        peer.incoming_bandwidth = handshake.incoming_bandwidth;
        peer.outgoing_bandwidth = handshake.outgoing_bandwidth;

        Ok(self.notify_connect(index, produce_events))
    }

    fn handle_disconnect(&mut self, index: usize, command: u8, data: u32) {
        let state = self.peers[index].state;

        match state {
            PeerState::Disconnected | PeerState::Zombie | PeerState::AcknowledgingDisconnect => {
                return;
            }
            _ => (),
        }

        self.peers[index].needs_dispatch = false;
        self.peers[index].reset_queues();

        match state {
            PeerState::ConnectionSucceeded | PeerState::Disconnecting | PeerState::Connecting => {
                self.dispatch_state(index, PeerState::Zombie);
            }
            PeerState::Connected | PeerState::DisconnectLater => {
                if command & protocol::COMMAND_FLAG_ACKNOWLEDGE != 0 {
                    // The remote host expects its DISCONNECT acknowledged before the
                    // slot dies.
                    self.change_state(index, PeerState::AcknowledgingDisconnect);
                } else {
                    self.dispatch_state(index, PeerState::Zombie);
                }
            }
            _ => {
                if state == PeerState::ConnectionPending {
                    self.recalculate_bandwidth_limits = true;
                }
                self.reset_peer_slot(index);
            }
        }

        if self.peers[index].state != PeerState::Disconnected {
            self.peers[index].event_data = data;
        }
    }

    fn handle_bandwidth_limit(
        &mut self,
        index: usize,
        incoming_bandwidth: u32,
        outgoing_bandwidth: u32,
    ) -> Result<(), ()> {
        if !self.peers[index].state.is_connected() {
            return Err(());
        }

        let host_outgoing_bandwidth = self.outgoing_bandwidth;
        let peer = &mut self.peers[index];

        if peer.incoming_bandwidth != 0 {
            self.bandwidth_limited_peers -= 1;
        }

        peer.incoming_bandwidth = incoming_bandwidth;
        peer.outgoing_bandwidth = outgoing_bandwidth;

        if peer.incoming_bandwidth != 0 {
            self.bandwidth_limited_peers += 1;
        }

        peer.window_size = negotiated_window_size(host_outgoing_bandwidth, peer.incoming_bandwidth);

        Ok(())
    }

    fn notify_connect(&mut self, index: usize, produce_events: bool) -> Option<Event> {
        self.recalculate_bandwidth_limits = true;

        if produce_events {
            self.change_state(index, PeerState::Connected);

            log::debug!("peer {}: connected", index);

            Some(Event::Connect {
                peer: PeerId(index),
                data: self.peers[index].event_data,
            })
        } else {
            let state = if self.peers[index].state == PeerState::Connecting {
                PeerState::ConnectionSucceeded
            } else {
                PeerState::ConnectionPending
            };

            self.dispatch_state(index, state);
            None
        }
    }

    fn notify_disconnect(&mut self, index: usize, produce_events: bool) -> Option<Event> {
        let state = self.peers[index].state;

        if state >= PeerState::ConnectionPending {
            self.recalculate_bandwidth_limits = true;
        }

        // A connection that never completed resets silently; an established one
        // surfaces a disconnect event.
        if state != PeerState::Connecting && state < PeerState::ConnectionSucceeded {
            self.reset_peer_slot(index);
            None
        } else if produce_events {
            self.reset_peer_slot(index);

            Some(Event::Disconnect {
                peer: PeerId(index),
                data: 0,
            })
        } else {
            self.peers[index].event_data = 0;
            self.dispatch_state(index, PeerState::Zombie);
            None
        }
    }
}

fn take_payload<'a>(
    body: &'a [u8],
    current: &mut usize,
    data_length: u16,
    maximum_packet_size: usize,
) -> Option<&'a [u8]> {
    let length = data_length as usize;

    if length > maximum_packet_size || *current + length > body.len() {
        return None;
    }

    let payload = &body[*current..*current + length];
    *current += length;

    Some(payload)
}

#[cfg(test)]
mod tests {
    use crate::Event;
    use crate::Host;
    use crate::HostParams;
    use crate::Packet;
    use crate::PACKET_FLAG_RELIABLE;

    use std::thread;
    use std::time;

    fn connect_pair() -> (Host, Host, crate::PeerId) {
        let mut server = Host::bind("127.0.0.1:0", HostParams::new().peer_count(1)).unwrap();
        let mut client = Host::bind("127.0.0.1:0", HostParams::new().peer_count(1)).unwrap();

        let peer = client.connect(server.address(), 1, 0).unwrap();

        let mut connected = 0;
        let deadline = time::Instant::now() + time::Duration::from_secs(5);
        while time::Instant::now() < deadline && connected < 2 {
            for host in [&mut client, &mut server] {
                while let Some(event) = host.service(0).unwrap() {
                    if let Event::Connect { .. } = event {
                        connected += 1;
                    }
                }
            }
            thread::sleep(time::Duration::from_millis(2));
        }
        assert_eq!(connected, 2, "handshake did not complete");

        (server, client, peer)
    }

    #[test]
    fn zero_throttle_drops_unreliable_payloads() {
        let (mut server, mut client, peer) = connect_pair();

        // Pin the throttle closed; acknowledgements cannot reopen it past the limit.
        client.peers[peer.0].packet_throttle = 0;
        client.peers[peer.0].packet_throttle_limit = 0;

        for value in 0..20u8 {
            client.send(peer, 0, Packet::new(&[value], 0)).unwrap();
        }
        client
            .send(peer, 0, Packet::new(b"marker", PACKET_FLAG_RELIABLE))
            .unwrap();

        let mut received = Vec::new();
        let deadline = time::Instant::now() + time::Duration::from_secs(5);
        while time::Instant::now() < deadline && received.is_empty() {
            let _ = client.service(0).unwrap();
            while let Some(event) = server.service(0).unwrap() {
                if let Event::Receive { packet, .. } = event {
                    received.push(packet.data().to_vec());
                }
            }
            thread::sleep(time::Duration::from_millis(2));
        }

        // Reliable traffic still flows; every unreliable payload was dropped at the
        // sender before transmission.
        assert_eq!(received, [b"marker".to_vec()]);
        assert!(client.peers[peer.0].outgoing_commands.is_empty());
        assert!(client.peers[peer.0].sent_unreliable_commands.is_empty());
    }

    #[test]
    fn reliable_data_in_transit_settles_to_zero() {
        let (mut server, mut client, peer) = connect_pair();

        client
            .send(peer, 0, Packet::new(&[0x77; 600], PACKET_FLAG_RELIABLE))
            .unwrap();

        client.flush().unwrap();
        assert!(client.peers[peer.0].reliable_data_in_transit > 0);

        let deadline = time::Instant::now() + time::Duration::from_secs(5);
        while time::Instant::now() < deadline {
            let _ = client.service(0).unwrap();
            while let Some(_) = server.service(0).unwrap() {}

            if client.peers[peer.0].sent_reliable_commands.is_empty() {
                break;
            }

            thread::sleep(time::Duration::from_millis(2));
        }

        assert!(client.peers[peer.0].sent_reliable_commands.is_empty());
        assert_eq!(client.peers[peer.0].reliable_data_in_transit, 0);
    }
}
