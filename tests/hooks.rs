
use std::thread;
use std::time;

use tether::Compressor;
use tether::Event;
use tether::Host;
use tether::HostParams;
use tether::Packet;
use tether::PACKET_FLAG_RELIABLE;

extern crate md5;

// A deliberately simple run-length coder; enough to exercise the compression path
// with both compressible and incompressible payloads.
struct RunLength;

impl Compressor for RunLength {
    fn compress(&mut self, data: &[u8], output: &mut [u8]) -> Option<usize> {
        let mut written = 0;
        let mut i = 0;

        while i < data.len() {
            let byte = data[i];
            let mut run = 1;
            while i + run < data.len() && data[i + run] == byte && run < 255 {
                run += 1;
            }

            if written + 2 > output.len() {
                return None;
            }

            output[written] = run as u8;
            output[written + 1] = byte;
            written += 2;
            i += run;
        }

        if written < data.len() {
            Some(written)
        } else {
            None
        }
    }

    fn decompress(&mut self, data: &[u8], output: &mut [u8]) -> Option<usize> {
        if data.len() % 2 != 0 {
            return None;
        }

        let mut written = 0;
        for pair in data.chunks(2) {
            let run = pair[0] as usize;
            if run == 0 || written + run > output.len() {
                return None;
            }

            for slot in output[written..written + run].iter_mut() {
                *slot = pair[1];
            }
            written += run;
        }

        Some(written)
    }
}

fn connect_with_hooks() -> (Host, Host, tether::PeerId) {
    let mut server = Host::bind("127.0.0.1:0", HostParams::new().peer_count(1)).unwrap();
    let mut client = Host::bind("127.0.0.1:0", HostParams::new().peer_count(1)).unwrap();

    for host in [&mut server, &mut client] {
        host.use_crc32_checksum();
        host.set_compressor(Some(Box::new(RunLength)));
    }

    let client_peer = client.connect(server.address(), 1, 0).unwrap();

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
    assert_eq!(connected, 2, "handshake did not complete with hooks enabled");

    (server, client, client_peer)
}

#[test]
fn checksummed_compressed_transfer() {
    let (mut server, mut client, client_peer) = connect_with_hooks();

    // One payload the coder shrinks dramatically, one it cannot compress at all.
    let compressible = vec![0x55u8; 2600];
    let incompressible: Vec<u8> = (0..2600u32).map(|v| (v.wrapping_mul(2654435761) >> 13) as u8).collect();

    client
        .send(client_peer, 0, Packet::new(&compressible, PACKET_FLAG_RELIABLE))
        .unwrap();
    client
        .send(client_peer, 0, Packet::new(&incompressible, PACKET_FLAG_RELIABLE))
        .unwrap();

    let mut received = Vec::new();
    let deadline = time::Instant::now() + time::Duration::from_secs(5);
    while time::Instant::now() < deadline && received.len() < 2 {
        let _ = client.service(0).unwrap();
        while let Some(event) = server.service(0).unwrap() {
            if let Event::Receive { packet, .. } = event {
                received.push(packet.data().to_vec());
            }
        }
        thread::sleep(time::Duration::from_millis(2));
    }

    assert_eq!(received.len(), 2);
    assert_eq!(md5::compute(&received[0]), md5::compute(&compressible));
    assert_eq!(md5::compute(&received[1]), md5::compute(&incompressible));
}

#[test]
fn checksum_mismatch_refuses_connection() {
    // Only one side carries a checksum; its trailing word reads as garbage commands
    // on the other side, so the handshake can never complete.
    let mut server = Host::bind("127.0.0.1:0", HostParams::new().peer_count(1)).unwrap();
    let mut client = Host::bind("127.0.0.1:0", HostParams::new().peer_count(1)).unwrap();

    client.use_crc32_checksum();

    client.connect(server.address(), 1, 0).unwrap();

    let deadline = time::Instant::now() + time::Duration::from_millis(800);
    while time::Instant::now() < deadline {
        while let Some(event) = client.service(0).unwrap() {
            if let Event::Connect { .. } = event {
                panic!("connected across mismatched checksum configuration");
            }
        }
        while let Some(event) = server.service(0).unwrap() {
            if let Event::Connect { .. } = event {
                panic!("connected across mismatched checksum configuration");
            }
        }
        thread::sleep(time::Duration::from_millis(2));
    }

    assert_eq!(server.connected_peers(), 0);
    assert_eq!(client.connected_peers(), 0);
}
