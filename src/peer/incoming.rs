
use super::Peer;
use super::PeerState;
use super::FREE_UNSEQUENCED_WINDOWS;
use super::UNSEQUENCED_WINDOW_SIZE;

use crate::channel::FREE_RELIABLE_WINDOWS;
use crate::channel::IncomingCommand;
use crate::channel::RELIABLE_WINDOWS;
use crate::channel::RELIABLE_WINDOW_SIZE;
use crate::packet::PACKET_FLAG_RELIABLE;
use crate::packet::PACKET_FLAG_UNRELIABLE_FRAGMENT;
use crate::packet::PACKET_FLAG_UNSEQUENCED;
use crate::protocol;
use crate::protocol::FragmentRecord;

/// Outcome of feeding one received send command into a peer's channel queues.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum IncomingResult {
    /// The command was accepted (or was a fragment applied to an existing message).
    Queued,
    /// The command was silently dropped; parsing of the datagram continues.
    Discarded,
    /// The command was invalid; parsing of the datagram stops.
    Rejected,
}

enum Payload<'a> {
    Bytes(&'a [u8]),
    Zeroed(usize),
}

#[derive(Clone, Copy)]
enum QueuePosition {
    Reliable(usize),
    Unreliable(usize),
}

impl Peer {
    pub(crate) fn handle_send_reliable(
        &mut self,
        channel_id: u8,
        reliable_sequence_number: u16,
        command: u8,
        payload: &[u8],
        maximum_waiting_data: usize,
    ) -> IncomingResult {
        if channel_id as usize >= self.channels.len() || !self.state.is_connected() {
            return IncomingResult::Rejected;
        }

        let result = self.queue_incoming(
            command,
            channel_id,
            reliable_sequence_number,
            0,
            Payload::Bytes(payload),
            PACKET_FLAG_RELIABLE,
            0,
            maximum_waiting_data,
        );

        match result {
            Ok(_) => {
                self.dispatch_incoming_reliable_commands(channel_id as usize);
                IncomingResult::Queued
            }
            Err(other) => other,
        }
    }

    pub(crate) fn handle_send_unreliable(
        &mut self,
        channel_id: u8,
        reliable_sequence_number: u16,
        unreliable_sequence_number: u16,
        command: u8,
        payload: &[u8],
        maximum_waiting_data: usize,
    ) -> IncomingResult {
        if channel_id as usize >= self.channels.len() || !self.state.is_connected() {
            return IncomingResult::Rejected;
        }

        let result = self.queue_incoming(
            command,
            channel_id,
            reliable_sequence_number,
            unreliable_sequence_number,
            Payload::Bytes(payload),
            0,
            0,
            maximum_waiting_data,
        );

        match result {
            Ok(_) => {
                self.dispatch_incoming_unreliable_commands(channel_id as usize);
                IncomingResult::Queued
            }
            Err(other) => other,
        }
    }

    pub(crate) fn handle_send_unsequenced(
        &mut self,
        channel_id: u8,
        unsequenced_group: u16,
        command: u8,
        payload: &[u8],
        maximum_waiting_data: usize,
    ) -> IncomingResult {
        if channel_id as usize >= self.channels.len() || !self.state.is_connected() {
            return IncomingResult::Rejected;
        }

        let index = (unsequenced_group as u32) % UNSEQUENCED_WINDOW_SIZE;

        let mut group = unsequenced_group as u32;
        if unsequenced_group < self.incoming_unsequenced_group {
            group += 0x10000;
        }

        if group
            >= self.incoming_unsequenced_group as u32
                + FREE_UNSEQUENCED_WINDOWS * UNSEQUENCED_WINDOW_SIZE
        {
            return IncomingResult::Discarded;
        }

        let group = group & 0xFFFF;
        let window_base = (group - index) as u16;

        if window_base != self.incoming_unsequenced_group {
            self.incoming_unsequenced_group = window_base;
            self.unsequenced_window = [0; (UNSEQUENCED_WINDOW_SIZE / 32) as usize];
        } else if self.unsequenced_window[(index / 32) as usize] & (1 << (index % 32)) != 0 {
            return IncomingResult::Discarded;
        }

        let result = self.queue_incoming(
            command,
            channel_id,
            0,
            0,
            Payload::Bytes(payload),
            PACKET_FLAG_UNSEQUENCED,
            0,
            maximum_waiting_data,
        );

        match result {
            Err(IncomingResult::Rejected) => IncomingResult::Rejected,
            other => {
                self.unsequenced_window[(index / 32) as usize] |= 1 << (index % 32);

                if other.is_ok() {
                    self.dispatch_incoming_unreliable_commands(channel_id as usize);
                }

                IncomingResult::Queued
            }
        }
    }

    pub(crate) fn handle_send_fragment(
        &mut self,
        channel_id: u8,
        record: &FragmentRecord,
        payload: &[u8],
        maximum_packet_size: usize,
        maximum_waiting_data: usize,
    ) -> IncomingResult {
        if channel_id as usize >= self.channels.len() || !self.state.is_connected() {
            return IncomingResult::Rejected;
        }

        let start_sequence_number = record.start_sequence_number;

        if !self.channels[channel_id as usize].incoming_window_valid(start_sequence_number) {
            return IncomingResult::Discarded;
        }

        if record.fragment_count > protocol::MAXIMUM_FRAGMENT_COUNT
            || record.fragment_number >= record.fragment_count
            || record.total_length as usize > maximum_packet_size
            || record.fragment_offset >= record.total_length
            || record.data_length as u32 > record.total_length - record.fragment_offset
        {
            return IncomingResult::Rejected;
        }

        // Locate the message this fragment belongs to, scanning backwards the same way
        // ordered insertion does.
        let mut start_index = None;
        {
            let channel = &self.channels[channel_id as usize];
            let current = channel.incoming_reliable_sequence_number;

            for i in (0..channel.incoming_reliable_commands.len()).rev() {
                let incoming = &channel.incoming_reliable_commands[i];

                if start_sequence_number >= current {
                    if incoming.reliable_sequence_number < current {
                        continue;
                    }
                } else if incoming.reliable_sequence_number >= current {
                    break;
                }

                if incoming.reliable_sequence_number <= start_sequence_number {
                    if incoming.reliable_sequence_number < start_sequence_number {
                        break;
                    }

                    if incoming.command & protocol::COMMAND_MASK != protocol::COMMAND_SEND_FRAGMENT
                        || record.total_length as usize != incoming.data.len()
                        || record.fragment_count != incoming.fragment_count
                    {
                        return IncomingResult::Rejected;
                    }

                    start_index = Some(i);
                    break;
                }
            }
        }

        let index = match start_index {
            Some(index) => index,
            None => {
                match self.queue_incoming(
                    protocol::COMMAND_SEND_FRAGMENT | protocol::COMMAND_FLAG_ACKNOWLEDGE,
                    channel_id,
                    start_sequence_number,
                    0,
                    Payload::Zeroed(record.total_length as usize),
                    PACKET_FLAG_RELIABLE,
                    record.fragment_count,
                    maximum_waiting_data,
                ) {
                    Ok(QueuePosition::Reliable(index)) => index,
                    _ => return IncomingResult::Rejected,
                }
            }
        };

        let complete = {
            let incoming = &mut self.channels[channel_id as usize].incoming_reliable_commands[index];
            apply_fragment(incoming, record, payload)
        };

        if complete {
            self.dispatch_incoming_reliable_commands(channel_id as usize);
        }

        IncomingResult::Queued
    }

    pub(crate) fn handle_send_unreliable_fragment(
        &mut self,
        channel_id: u8,
        reliable_sequence_number: u16,
        record: &FragmentRecord,
        payload: &[u8],
        maximum_packet_size: usize,
        maximum_waiting_data: usize,
    ) -> IncomingResult {
        if channel_id as usize >= self.channels.len() || !self.state.is_connected() {
            return IncomingResult::Rejected;
        }

        let start_sequence_number = record.start_sequence_number;

        {
            let channel = &self.channels[channel_id as usize];

            if !channel.incoming_window_valid(reliable_sequence_number) {
                return IncomingResult::Discarded;
            }

            if reliable_sequence_number == channel.incoming_reliable_sequence_number
                && start_sequence_number <= channel.incoming_unreliable_sequence_number
            {
                return IncomingResult::Discarded;
            }
        }

        if record.fragment_count > protocol::MAXIMUM_FRAGMENT_COUNT
            || record.fragment_number >= record.fragment_count
            || record.total_length as usize > maximum_packet_size
            || record.fragment_offset >= record.total_length
            || record.data_length as u32 > record.total_length - record.fragment_offset
        {
            return IncomingResult::Rejected;
        }

        let mut start_index = None;
        {
            let channel = &self.channels[channel_id as usize];
            let current = channel.incoming_reliable_sequence_number;

            for i in (0..channel.incoming_unreliable_commands.len()).rev() {
                let incoming = &channel.incoming_unreliable_commands[i];

                if reliable_sequence_number >= current {
                    if incoming.reliable_sequence_number < current {
                        continue;
                    }
                } else if incoming.reliable_sequence_number >= current {
                    break;
                }

                if incoming.reliable_sequence_number < reliable_sequence_number {
                    break;
                }

                if incoming.reliable_sequence_number > reliable_sequence_number {
                    continue;
                }

                if incoming.unreliable_sequence_number <= start_sequence_number {
                    if incoming.unreliable_sequence_number < start_sequence_number {
                        break;
                    }

                    if incoming.command & protocol::COMMAND_MASK
                        != protocol::COMMAND_SEND_UNRELIABLE_FRAGMENT
                        || record.total_length as usize != incoming.data.len()
                        || record.fragment_count != incoming.fragment_count
                    {
                        return IncomingResult::Rejected;
                    }

                    start_index = Some(i);
                    break;
                }
            }
        }

        let index = match start_index {
            Some(index) => index,
            None => {
                match self.queue_incoming(
                    protocol::COMMAND_SEND_UNRELIABLE_FRAGMENT,
                    channel_id,
                    reliable_sequence_number,
                    start_sequence_number,
                    Payload::Zeroed(record.total_length as usize),
                    PACKET_FLAG_UNRELIABLE_FRAGMENT,
                    record.fragment_count,
                    maximum_waiting_data,
                ) {
                    Ok(QueuePosition::Unreliable(index)) => index,
                    _ => return IncomingResult::Rejected,
                }
            }
        };

        let complete = {
            let incoming =
                &mut self.channels[channel_id as usize].incoming_unreliable_commands[index];
            apply_fragment(incoming, record, payload)
        };

        if complete {
            self.dispatch_incoming_unreliable_commands(channel_id as usize);
        }

        IncomingResult::Queued
    }

    /// Files a received command into its channel queue at the position its sequence
    /// numbers demand. Returns the queue and index it landed at.
    fn queue_incoming(
        &mut self,
        command: u8,
        channel_id: u8,
        reliable_sequence_number: u16,
        unreliable_sequence_number: u16,
        payload: Payload,
        packet_flags: u32,
        fragment_count: u32,
        maximum_waiting_data: usize,
    ) -> Result<QueuePosition, IncomingResult> {
        if self.state == PeerState::DisconnectLater {
            return Err(discard(fragment_count));
        }

        let number = command & protocol::COMMAND_MASK;
        let channel = &self.channels[channel_id as usize];

        if number != protocol::COMMAND_SEND_UNSEQUENCED
            && !channel.incoming_window_valid(reliable_sequence_number)
        {
            return Err(discard(fragment_count));
        }

        let position = match number {
            protocol::COMMAND_SEND_FRAGMENT | protocol::COMMAND_SEND_RELIABLE => {
                if reliable_sequence_number == channel.incoming_reliable_sequence_number {
                    return Err(discard(fragment_count));
                }

                let current = channel.incoming_reliable_sequence_number;
                let queue = &channel.incoming_reliable_commands;
                let mut insert_at = 0;

                for i in (0..queue.len()).rev() {
                    let incoming = &queue[i];

                    if reliable_sequence_number >= current {
                        if incoming.reliable_sequence_number < current {
                            continue;
                        }
                    } else if incoming.reliable_sequence_number >= current {
                        insert_at = i + 1;
                        break;
                    }

                    if incoming.reliable_sequence_number <= reliable_sequence_number {
                        if incoming.reliable_sequence_number < reliable_sequence_number {
                            insert_at = i + 1;
                            break;
                        }

                        return Err(discard(fragment_count));
                    }
                }

                QueuePosition::Reliable(insert_at)
            }
            protocol::COMMAND_SEND_UNRELIABLE | protocol::COMMAND_SEND_UNRELIABLE_FRAGMENT => {
                if reliable_sequence_number == channel.incoming_reliable_sequence_number
                    && unreliable_sequence_number <= channel.incoming_unreliable_sequence_number
                {
                    return Err(discard(fragment_count));
                }

                let current = channel.incoming_reliable_sequence_number;
                let queue = &channel.incoming_unreliable_commands;
                let mut insert_at = 0;

                for i in (0..queue.len()).rev() {
                    let incoming = &queue[i];

                    if reliable_sequence_number >= current {
                        if incoming.reliable_sequence_number < current {
                            continue;
                        }
                    } else if incoming.reliable_sequence_number >= current {
                        insert_at = i + 1;
                        break;
                    }

                    if incoming.reliable_sequence_number < reliable_sequence_number {
                        insert_at = i + 1;
                        break;
                    }

                    if incoming.reliable_sequence_number > reliable_sequence_number {
                        continue;
                    }

                    if incoming.unreliable_sequence_number <= unreliable_sequence_number {
                        if incoming.unreliable_sequence_number < unreliable_sequence_number {
                            insert_at = i + 1;
                            break;
                        }

                        return Err(discard(fragment_count));
                    }
                }

                QueuePosition::Unreliable(insert_at)
            }
            // Unsequenced commands carry no ordering; they go at the front so they
            // ride out with the next dispatched run instead of waiting behind
            // commands from future reliable contexts.
            protocol::COMMAND_SEND_UNSEQUENCED => QueuePosition::Unreliable(0),
            _ => return Err(discard(fragment_count)),
        };

        if self.total_waiting_data >= maximum_waiting_data
            || fragment_count > protocol::MAXIMUM_FRAGMENT_COUNT
        {
            return Err(IncomingResult::Rejected);
        }

        let data: Box<[u8]> = match payload {
            Payload::Bytes(bytes) => bytes.into(),
            Payload::Zeroed(length) => vec![0; length].into_boxed_slice(),
        };

        let fragments: Box<[u32]> = if fragment_count > 0 {
            vec![0u32; ((fragment_count + 31) / 32) as usize].into_boxed_slice()
        } else {
            Box::new([])
        };

        self.total_waiting_data += data.len();

        let incoming = IncomingCommand {
            reliable_sequence_number,
            unreliable_sequence_number,
            command,
            channel_id,
            packet_flags,
            fragment_count,
            fragments_remaining: fragment_count,
            fragments,
            data,
        };

        let channel = &mut self.channels[channel_id as usize];
        match position {
            QueuePosition::Reliable(index) => {
                channel.incoming_reliable_commands.insert(index, incoming);
            }
            QueuePosition::Unreliable(index) => {
                channel.incoming_unreliable_commands.insert(index, incoming);
            }
        }

        Ok(position)
    }

    /// Moves the contiguous run of completed reliable commands at the head of the
    /// channel's sequence space to the dispatched queue.
    pub(crate) fn dispatch_incoming_reliable_commands(&mut self, channel_id: usize) {
        let channel = &mut self.channels[channel_id];

        let mut count = 0;
        for incoming in channel.incoming_reliable_commands.iter() {
            if incoming.fragments_remaining > 0
                || incoming.reliable_sequence_number
                    != channel.incoming_reliable_sequence_number.wrapping_add(1)
            {
                break;
            }

            channel.incoming_reliable_sequence_number = incoming.reliable_sequence_number;

            if incoming.fragment_count > 0 {
                // A fragmented message consumes one sequence number per fragment.
                channel.incoming_reliable_sequence_number = channel
                    .incoming_reliable_sequence_number
                    .wrapping_add(incoming.fragment_count as u16 - 1);
            }

            count += 1;
        }

        if count == 0 {
            return;
        }

        channel.incoming_unreliable_sequence_number = 0;

        for _ in 0..count {
            let incoming = self.channels[channel_id]
                .incoming_reliable_commands
                .pop_front()
                .unwrap();
            self.dispatched_commands.push_back(incoming);
        }

        if !self.channels[channel_id].incoming_unreliable_commands.is_empty() {
            self.dispatch_incoming_unreliable_commands(channel_id);
        }
    }

    /// Delivers unreliable commands that belong to the current reliable context,
    /// drops those whose context has already passed, and leaves future ones queued.
    pub(crate) fn dispatch_incoming_unreliable_commands(&mut self, channel_id: usize) {
        let channel = &mut self.channels[channel_id];

        let current_reliable = channel.incoming_reliable_sequence_number;
        let current_window = current_reliable / RELIABLE_WINDOW_SIZE;
        let mut unreliable_sequence = channel.incoming_unreliable_sequence_number;

        let queue = std::mem::take(&mut channel.incoming_unreliable_commands);
        let mut kept = std::collections::VecDeque::new();
        let mut ready: Vec<IncomingCommand> = Vec::new();
        let mut run: Vec<IncomingCommand> = Vec::new();
        let mut dropped_bytes = 0usize;

        let mut commands = queue.into_iter();
        let mut stopped = false;

        while let Some(incoming) = commands.next() {
            if incoming.command & protocol::COMMAND_MASK == protocol::COMMAND_SEND_UNSEQUENCED {
                run.push(incoming);
                continue;
            }

            if incoming.reliable_sequence_number == current_reliable {
                if incoming.fragments_remaining == 0 {
                    unreliable_sequence = incoming.unreliable_sequence_number;
                    run.push(incoming);
                } else {
                    // An incomplete fragment message blocks nothing behind it, but
                    // cannot itself be delivered yet.
                    ready.append(&mut run);
                    kept.push_back(incoming);
                }
                continue;
            }

            let mut window = incoming.reliable_sequence_number / RELIABLE_WINDOW_SIZE;
            if incoming.reliable_sequence_number < current_reliable {
                window += RELIABLE_WINDOWS;
            }

            if window >= current_window && window < current_window + FREE_RELIABLE_WINDOWS - 1 {
                // Waiting on a future reliable context; everything from here on stays.
                ready.append(&mut run);
                kept.push_back(incoming);
                stopped = true;
                break;
            }

            // The reliable context this command belonged to has passed; it is late.
            ready.append(&mut run);
            dropped_bytes += incoming.data.len();
        }

        if stopped {
            kept.extend(commands);
        }

        ready.append(&mut run);

        channel.incoming_unreliable_commands = kept;
        channel.incoming_unreliable_sequence_number = unreliable_sequence;

        self.total_waiting_data -= dropped_bytes;
        self.dispatched_commands.extend(ready);
    }
}

fn discard(fragment_count: u32) -> IncomingResult {
    // A fragment that cannot be filed is an error rather than a silent drop, since
    // the rest of the message can never complete.
    if fragment_count > 0 {
        IncomingResult::Rejected
    } else {
        IncomingResult::Discarded
    }
}

fn apply_fragment(incoming: &mut IncomingCommand, record: &FragmentRecord, payload: &[u8]) -> bool {
    if !incoming.has_fragment(record.fragment_number) {
        incoming.fragments_remaining -= 1;
        incoming.mark_fragment(record.fragment_number);

        let offset = record.fragment_offset as usize;
        let mut length = record.data_length as usize;

        if offset + length > incoming.data.len() {
            length = incoming.data.len() - offset;
        }

        incoming.data[offset..offset + length].copy_from_slice(&payload[..length]);
    }

    incoming.fragments_remaining == 0
}
