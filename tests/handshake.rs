
use std::thread;
use std::time;

use tether::Event;
use tether::Host;
use tether::HostParams;
use tether::PeerState;

fn step(host: &mut Host, events: &mut Vec<Event>) {
    while let Some(event) = host.service(0).unwrap() {
        events.push(event);
    }
}

#[test]
fn connect_handshake() {
    let mut server = Host::bind("127.0.0.1:0", HostParams::new().peer_count(1)).unwrap();
    let mut client = Host::bind("127.0.0.1:0", HostParams::new().peer_count(1)).unwrap();

    let client_peer = client.connect(server.address(), 1, 0xBEEF).unwrap();

    let mut server_events = Vec::new();
    let mut client_events = Vec::new();

    let deadline = time::Instant::now() + time::Duration::from_secs(5);
    while time::Instant::now() < deadline {
        step(&mut client, &mut client_events);
        step(&mut server, &mut server_events);

        if !server_events.is_empty() && !client_events.is_empty() {
            break;
        }

        thread::sleep(time::Duration::from_millis(2));
    }

    let server_peer = match server_events.as_slice() {
        [Event::Connect { peer, data }] => {
            assert_eq!(*data, 0xBEEF);
            *peer
        }
        other => panic!("unexpected server events: {:?}", other),
    };

    match client_events.as_slice() {
        [Event::Connect { peer, data }] => {
            assert_eq!(*peer, client_peer);
            assert_eq!(*data, 0);
        }
        other => panic!("unexpected client events: {:?}", other),
    }

    let server_view = server.peer(server_peer).unwrap();
    let client_view = client.peer(client_peer).unwrap();

    assert_eq!(server_view.state(), PeerState::Connected);
    assert_eq!(client_view.state(), PeerState::Connected);

    // Both ends share the nonce minted by the initiator.
    assert_ne!(client_view.connect_id(), 0);
    assert_eq!(server_view.connect_id(), client_view.connect_id());

    assert_eq!(server_view.channel_count(), 1);
    assert_eq!(client_view.channel_count(), 1);
}

#[test]
fn duplicate_peer_limit() {
    let mut server = Host::bind(
        "127.0.0.1:0",
        HostParams::new().peer_count(4).duplicate_peers(1),
    )
    .unwrap();

    let mut first = Host::bind("127.0.0.1:0", HostParams::new()).unwrap();
    let mut second = Host::bind("127.0.0.1:0", HostParams::new()).unwrap();

    first.connect(server.address(), 1, 0).unwrap();

    let mut server_events = Vec::new();
    let mut ignored = Vec::new();

    let deadline = time::Instant::now() + time::Duration::from_secs(5);
    while time::Instant::now() < deadline && server_events.is_empty() {
        step(&mut first, &mut ignored);
        step(&mut server, &mut server_events);
        thread::sleep(time::Duration::from_millis(2));
    }

    assert!(matches!(server_events.as_slice(), [Event::Connect { .. }]));

    // A second connection from the same address is silently refused.
    second.connect(server.address(), 1, 0).unwrap();

    let deadline = time::Instant::now() + time::Duration::from_millis(1500);
    while time::Instant::now() < deadline {
        step(&mut first, &mut ignored);
        step(&mut second, &mut ignored);
        step(&mut server, &mut server_events);
        thread::sleep(time::Duration::from_millis(2));
    }

    assert_eq!(server_events.len(), 1);
    assert_eq!(server.connected_peers(), 1);
}
