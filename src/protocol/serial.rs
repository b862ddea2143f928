
use super::*;

// All multi-byte fields are big-endian.

pub const HEADER_SIZE_MINIMAL: usize = 2;
pub const HEADER_SIZE_SENT_TIME: usize = 4;
pub const CHECKSUM_SIZE: usize = 4;
pub const COMMAND_HEADER_SIZE: usize = 4;

/// The first two (or four) bytes of every datagram, decoded.
#[derive(Clone, Debug, PartialEq)]
pub struct DatagramHeader {
    pub peer_id: u16,
    pub session_id: u8,
    pub compressed: bool,
    pub sent_time: Option<u16>,
}

impl DatagramHeader {
    /// Size of the encoded header, not counting any checksum slot that follows it.
    pub fn size(&self) -> usize {
        if self.sent_time.is_some() {
            HEADER_SIZE_SENT_TIME
        } else {
            HEADER_SIZE_MINIMAL
        }
    }
}

pub fn write_header(out: &mut Vec<u8>, header: &DatagramHeader) {
    let mut field = header.peer_id & !(HEADER_FLAG_MASK | HEADER_SESSION_MASK);
    field |= ((header.session_id as u16) << HEADER_SESSION_SHIFT) & HEADER_SESSION_MASK;
    if header.compressed {
        field |= HEADER_FLAG_COMPRESSED;
    }
    if header.sent_time.is_some() {
        field |= HEADER_FLAG_SENT_TIME;
    }

    out.extend_from_slice(&field.to_be_bytes());
    if let Some(sent_time) = header.sent_time {
        out.extend_from_slice(&sent_time.to_be_bytes());
    }
}

pub fn read_header(data: &[u8]) -> Option<DatagramHeader> {
    if data.len() < HEADER_SIZE_MINIMAL {
        return None;
    }

    let field = u16::from_be_bytes([data[0], data[1]]);

    let sent_time = if field & HEADER_FLAG_SENT_TIME != 0 {
        if data.len() < HEADER_SIZE_SENT_TIME {
            return None;
        }
        Some(u16::from_be_bytes([data[2], data[3]]))
    } else {
        None
    };

    Some(DatagramHeader {
        peer_id: field & !(HEADER_FLAG_MASK | HEADER_SESSION_MASK),
        session_id: ((field & HEADER_SESSION_MASK) >> HEADER_SESSION_SHIFT) as u8,
        compressed: field & HEADER_FLAG_COMPRESSED != 0,
        sent_time,
    })
}

/// The 4-byte header common to every command record. The `command` byte carries the
/// command number in its low bits plus the ACKNOWLEDGE / UNSEQUENCED flag bits.
#[derive(Clone, Debug, PartialEq)]
pub struct CommandHeader {
    pub command: u8,
    pub channel_id: u8,
    pub reliable_sequence_number: u16,
}

fn write_handshake(out: &mut Vec<u8>, handshake: &Handshake) {
    out.extend_from_slice(&handshake.outgoing_peer_id.to_be_bytes());
    out.push(handshake.incoming_session_id);
    out.push(handshake.outgoing_session_id);
    out.extend_from_slice(&handshake.mtu.to_be_bytes());
    out.extend_from_slice(&handshake.window_size.to_be_bytes());
    out.extend_from_slice(&handshake.channel_count.to_be_bytes());
    out.extend_from_slice(&handshake.incoming_bandwidth.to_be_bytes());
    out.extend_from_slice(&handshake.outgoing_bandwidth.to_be_bytes());
    out.extend_from_slice(&handshake.packet_throttle_interval.to_be_bytes());
    out.extend_from_slice(&handshake.packet_throttle_acceleration.to_be_bytes());
    out.extend_from_slice(&handshake.packet_throttle_deceleration.to_be_bytes());
    out.extend_from_slice(&handshake.connect_id.to_be_bytes());
    out.extend_from_slice(&handshake.data.to_be_bytes());
}

fn write_fragment(out: &mut Vec<u8>, fragment: &FragmentRecord) {
    out.extend_from_slice(&fragment.start_sequence_number.to_be_bytes());
    out.extend_from_slice(&fragment.data_length.to_be_bytes());
    out.extend_from_slice(&fragment.fragment_count.to_be_bytes());
    out.extend_from_slice(&fragment.fragment_number.to_be_bytes());
    out.extend_from_slice(&fragment.total_length.to_be_bytes());
    out.extend_from_slice(&fragment.fragment_offset.to_be_bytes());
}

/// Appends a command record. Any payload following a send command is appended by the
/// caller; `data_length` fields must already agree with it.
pub fn write_command(out: &mut Vec<u8>, header: &CommandHeader, command: &Command) {
    out.push(header.command);
    out.push(header.channel_id);
    out.extend_from_slice(&header.reliable_sequence_number.to_be_bytes());

    match command {
        Command::Acknowledge {
            received_reliable_sequence_number,
            received_sent_time,
        } => {
            out.extend_from_slice(&received_reliable_sequence_number.to_be_bytes());
            out.extend_from_slice(&received_sent_time.to_be_bytes());
        }
        Command::Connect(handshake) | Command::VerifyConnect(handshake) => {
            write_handshake(out, handshake);
        }
        Command::Disconnect { data } => {
            out.extend_from_slice(&data.to_be_bytes());
        }
        Command::Ping => {}
        Command::SendReliable { data_length } => {
            out.extend_from_slice(&data_length.to_be_bytes());
        }
        Command::SendUnreliable {
            unreliable_sequence_number,
            data_length,
        } => {
            out.extend_from_slice(&unreliable_sequence_number.to_be_bytes());
            out.extend_from_slice(&data_length.to_be_bytes());
        }
        Command::SendFragment(fragment) | Command::SendUnreliableFragment(fragment) => {
            write_fragment(out, fragment);
        }
        Command::SendUnsequenced {
            unsequenced_group,
            data_length,
        } => {
            out.extend_from_slice(&unsequenced_group.to_be_bytes());
            out.extend_from_slice(&data_length.to_be_bytes());
        }
        Command::BandwidthLimit {
            incoming_bandwidth,
            outgoing_bandwidth,
        } => {
            out.extend_from_slice(&incoming_bandwidth.to_be_bytes());
            out.extend_from_slice(&outgoing_bandwidth.to_be_bytes());
        }
        Command::ThrottleConfigure {
            packet_throttle_interval,
            packet_throttle_acceleration,
            packet_throttle_deceleration,
        } => {
            out.extend_from_slice(&packet_throttle_interval.to_be_bytes());
            out.extend_from_slice(&packet_throttle_acceleration.to_be_bytes());
            out.extend_from_slice(&packet_throttle_deceleration.to_be_bytes());
        }
    }
}

fn get_u16(data: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([data[offset], data[offset + 1]])
}

fn get_u32(data: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

fn read_handshake(data: &[u8]) -> Handshake {
    Handshake {
        outgoing_peer_id: get_u16(data, 0),
        incoming_session_id: data[2],
        outgoing_session_id: data[3],
        mtu: get_u32(data, 4),
        window_size: get_u32(data, 8),
        channel_count: get_u32(data, 12),
        incoming_bandwidth: get_u32(data, 16),
        outgoing_bandwidth: get_u32(data, 20),
        packet_throttle_interval: get_u32(data, 24),
        packet_throttle_acceleration: get_u32(data, 28),
        packet_throttle_deceleration: get_u32(data, 32),
        connect_id: get_u32(data, 36),
        data: get_u32(data, 40),
    }
}

fn read_fragment(data: &[u8]) -> FragmentRecord {
    FragmentRecord {
        start_sequence_number: get_u16(data, 0),
        data_length: get_u16(data, 2),
        fragment_count: get_u32(data, 4),
        fragment_number: get_u32(data, 8),
        total_length: get_u32(data, 12),
        fragment_offset: get_u32(data, 16),
    }
}

/// Reads one command record from the front of `data`. Returns the decoded header and
/// body along with the record size consumed; any payload of a send command follows at
/// that offset. Fails on truncated records and unassigned command numbers.
pub fn read_command(data: &[u8]) -> Option<(CommandHeader, Command, usize)> {
    if data.len() < COMMAND_HEADER_SIZE {
        return None;
    }

    let command_byte = data[0];
    let size = command_size(command_byte);

    if size == 0 || data.len() < size {
        return None;
    }

    let header = CommandHeader {
        command: command_byte,
        channel_id: data[1],
        reliable_sequence_number: get_u16(data, 2),
    };

    let body = &data[COMMAND_HEADER_SIZE..];

    let command = match command_byte & COMMAND_MASK {
        COMMAND_ACKNOWLEDGE => Command::Acknowledge {
            received_reliable_sequence_number: get_u16(body, 0),
            received_sent_time: get_u16(body, 2),
        },
        COMMAND_CONNECT => Command::Connect(read_handshake(body)),
        COMMAND_VERIFY_CONNECT => Command::VerifyConnect(read_handshake(body)),
        COMMAND_DISCONNECT => Command::Disconnect {
            data: get_u32(body, 0),
        },
        COMMAND_PING => Command::Ping,
        COMMAND_SEND_RELIABLE => Command::SendReliable {
            data_length: get_u16(body, 0),
        },
        COMMAND_SEND_UNRELIABLE => Command::SendUnreliable {
            unreliable_sequence_number: get_u16(body, 0),
            data_length: get_u16(body, 2),
        },
        COMMAND_SEND_FRAGMENT => Command::SendFragment(read_fragment(body)),
        COMMAND_SEND_UNSEQUENCED => Command::SendUnsequenced {
            unsequenced_group: get_u16(body, 0),
            data_length: get_u16(body, 2),
        },
        COMMAND_BANDWIDTH_LIMIT => Command::BandwidthLimit {
            incoming_bandwidth: get_u32(body, 0),
            outgoing_bandwidth: get_u32(body, 4),
        },
        COMMAND_THROTTLE_CONFIGURE => Command::ThrottleConfigure {
            packet_throttle_interval: get_u32(body, 0),
            packet_throttle_acceleration: get_u32(body, 4),
            packet_throttle_deceleration: get_u32(body, 8),
        },
        COMMAND_SEND_UNRELIABLE_FRAGMENT => Command::SendUnreliableFragment(read_fragment(body)),
        _ => return None,
    };

    Some((header, command, size))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn verify_consistent(header: &CommandHeader, command: &Command) {
        let mut bytes = Vec::new();
        write_command(&mut bytes, header, command);

        assert_eq!(bytes.len(), command_size(header.command));

        let (header2, command2, size) = read_command(&bytes).unwrap();

        assert_eq!(*header, header2);
        assert_eq!(*command, command2);
        assert_eq!(size, bytes.len());
    }

    fn verify_truncation_fails(header: &CommandHeader, command: &Command) {
        let mut bytes = Vec::new();
        write_command(&mut bytes, header, command);

        for i in 0..bytes.len() {
            assert!(read_command(&bytes[..i]).is_none());
        }
    }

    fn test_header(command: &Command, flags: u8) -> CommandHeader {
        CommandHeader {
            command: command.number() | flags,
            channel_id: 0xA5,
            reliable_sequence_number: 0x1234,
        }
    }

    fn test_handshake() -> Handshake {
        Handshake {
            outgoing_peer_id: 0x0ABC,
            incoming_session_id: 2,
            outgoing_session_id: 1,
            mtu: 1400,
            window_size: 0x8000,
            channel_count: 8,
            incoming_bandwidth: 0x12345678,
            outgoing_bandwidth: 0x9ABCDEF0,
            packet_throttle_interval: 5000,
            packet_throttle_acceleration: 2,
            packet_throttle_deceleration: 2,
            connect_id: 0xDEADBEEF,
            data: 0x01020304,
        }
    }

    #[test]
    fn header_minimal() {
        let h = DatagramHeader {
            peer_id: 0x0FFF,
            session_id: 3,
            compressed: false,
            sent_time: None,
        };

        let mut bytes = Vec::new();
        write_header(&mut bytes, &h);

        assert_eq!(bytes.len(), HEADER_SIZE_MINIMAL);
        assert_eq!(read_header(&bytes).unwrap(), h);
    }

    #[test]
    fn header_sent_time() {
        let h = DatagramHeader {
            peer_id: 0x0001,
            session_id: 0,
            compressed: true,
            sent_time: Some(0xBEEF),
        };

        let mut bytes = Vec::new();
        write_header(&mut bytes, &h);

        assert_eq!(bytes.len(), HEADER_SIZE_SENT_TIME);
        assert_eq!(read_header(&bytes).unwrap(), h);

        assert!(read_header(&bytes[..1]).is_none());
        assert!(read_header(&bytes[..3]).is_none());
    }

    #[test]
    fn header_field_packing() {
        let mut bytes = Vec::new();
        write_header(
            &mut bytes,
            &DatagramHeader {
                peer_id: 0x0123,
                session_id: 2,
                compressed: false,
                sent_time: Some(0x00FF),
            },
        );

        // 0x0123 | (2 << 12) | SENT_TIME
        assert_eq!(bytes, [0xA1, 0x23, 0x00, 0xFF]);
    }

    #[test]
    fn acknowledge_basic() {
        let c = Command::Acknowledge {
            received_reliable_sequence_number: 0xFFFE,
            received_sent_time: 0x8001,
        };
        let h = test_header(&c, 0);
        verify_consistent(&h, &c);
        verify_truncation_fails(&h, &c);
    }

    #[test]
    fn connect_basic() {
        let c = Command::Connect(test_handshake());
        let h = test_header(&c, COMMAND_FLAG_ACKNOWLEDGE);
        verify_consistent(&h, &c);
        verify_truncation_fails(&h, &c);
    }

    #[test]
    fn verify_connect_basic() {
        let c = Command::VerifyConnect(test_handshake());
        let h = test_header(&c, COMMAND_FLAG_ACKNOWLEDGE);
        verify_consistent(&h, &c);
        verify_truncation_fails(&h, &c);
    }

    #[test]
    fn disconnect_basic() {
        let c = Command::Disconnect { data: 0xCAFEF00D };
        let h = test_header(&c, COMMAND_FLAG_UNSEQUENCED);
        verify_consistent(&h, &c);
        verify_truncation_fails(&h, &c);
    }

    #[test]
    fn ping_basic() {
        let c = Command::Ping;
        let h = test_header(&c, COMMAND_FLAG_ACKNOWLEDGE);
        verify_consistent(&h, &c);
        verify_truncation_fails(&h, &c);
    }

    #[test]
    fn send_commands_basic() {
        let fragment = FragmentRecord {
            start_sequence_number: 17,
            data_length: 900,
            fragment_count: 5,
            fragment_number: 3,
            total_length: 4000,
            fragment_offset: 2700,
        };

        let commands = [
            Command::SendReliable { data_length: 32 },
            Command::SendUnreliable {
                unreliable_sequence_number: 7,
                data_length: 100,
            },
            Command::SendFragment(fragment.clone()),
            Command::SendUnsequenced {
                unsequenced_group: 0x4000,
                data_length: 1,
            },
            Command::SendUnreliableFragment(fragment),
        ];

        for c in commands.iter() {
            let h = test_header(c, 0);
            verify_consistent(&h, c);
            verify_truncation_fails(&h, c);
        }
    }

    #[test]
    fn control_commands_basic() {
        let commands = [
            Command::BandwidthLimit {
                incoming_bandwidth: 57600,
                outgoing_bandwidth: 14400,
            },
            Command::ThrottleConfigure {
                packet_throttle_interval: 5000,
                packet_throttle_acceleration: 2,
                packet_throttle_deceleration: 2,
            },
        ];

        for c in commands.iter() {
            let h = test_header(c, COMMAND_FLAG_ACKNOWLEDGE);
            verify_consistent(&h, c);
            verify_truncation_fails(&h, c);
        }
    }

    #[test]
    fn unassigned_command_numbers_fail() {
        for number in [0u8, 13, 14, 15] {
            let bytes = [number, 0, 0, 0, 0, 0, 0, 0];
            assert!(read_command(&bytes).is_none());
        }
    }

    #[test]
    fn flag_bits_do_not_disturb_decode() {
        let c = Command::SendReliable { data_length: 4 };
        let h = CommandHeader {
            command: c.number() | COMMAND_FLAG_ACKNOWLEDGE | COMMAND_FLAG_UNSEQUENCED,
            channel_id: 0,
            reliable_sequence_number: 1,
        };
        verify_consistent(&h, &c);
    }
}
