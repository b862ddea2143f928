
use std::thread;
use std::time;

use tether::Event;
use tether::Host;
use tether::HostParams;
use tether::Packet;
use tether::PACKET_FLAG_RELIABLE;

#[test]
fn unreachable_peer_times_out() {
    let mut server = Host::bind("127.0.0.1:0", HostParams::new().peer_count(1)).unwrap();
    let mut client = Host::bind("127.0.0.1:0", HostParams::new().peer_count(1)).unwrap();

    let client_peer = client.connect(server.address(), 1, 0).unwrap();

    let mut connected = false;
    let deadline = time::Instant::now() + time::Duration::from_secs(5);
    while time::Instant::now() < deadline && !connected {
        while let Some(event) = client.service(0).unwrap() {
            if let Event::Connect { .. } = event {
                connected = true;
            }
        }
        while let Some(_) = server.service(0).unwrap() {}
        thread::sleep(time::Duration::from_millis(2));
    }
    assert!(connected);

    // Tighten the timeout so the test completes quickly, then stop servicing the
    // server entirely. The client's reliable traffic goes unacknowledged and its
    // retransmission allowance runs out.
    client.set_timeout(client_peer, 2, 500, 1500).unwrap();
    client
        .send(client_peer, 0, Packet::new(&[1, 2, 3], PACKET_FLAG_RELIABLE))
        .unwrap();

    drop(server);

    let start = time::Instant::now();
    let mut disconnect = None;
    while start.elapsed() < time::Duration::from_secs(15) && disconnect.is_none() {
        while let Some(event) = client.service(0).unwrap() {
            if let Event::Disconnect { data, .. } = event {
                disconnect = Some(data);
            }
        }
        thread::sleep(time::Duration::from_millis(5));
    }

    // A timeout disconnect carries no user data.
    assert_eq!(disconnect, Some(0));
    // It cannot fire until the unacknowledged command has aged well past the
    // configured minimum.
    assert!(start.elapsed() >= time::Duration::from_millis(400));

    assert_eq!(client.connected_peers(), 0);
}

#[test]
fn idle_service_is_quiet() {
    let mut host = Host::bind("127.0.0.1:0", HostParams::new().peer_count(4)).unwrap();

    // With no peers and no traffic, service produces nothing and does not block
    // beyond its timeout.
    let start = time::Instant::now();
    assert!(host.service(30).unwrap().is_none());
    assert!(start.elapsed() >= time::Duration::from_millis(25));
    assert!(start.elapsed() < time::Duration::from_secs(5));

    assert!(host.check_events().is_none());
    assert_eq!(host.total_sent_packets(), 0);
}
