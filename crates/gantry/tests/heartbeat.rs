use std::{
    io::Read,
    net::TcpStream,
    sync::Arc,
    time::Duration,
};

use gantry::{
    HEARTBEAT_DEFAULT_MSG_ID, Server, ServerConfig, ServerMode,
    codec::{Packet, TlvPacket},
};

fn test_config(port: u16) -> ServerConfig {
    ServerConfig {
        name: "heartbeat".into(),
        host: "127.0.0.1".into(),
        tcp_port: port,
        mode: ServerMode::Tcp,
        worker_pool_size: 1,
        // Tight liveness window so the silent client gets cut off.
        heartbeat_max: 1,
        ..ServerConfig::default()
    }
}

#[test]
fn probes_then_stops_silent_connection() {
    let server = Server::new(test_config(28831));
    server.start_heartbeat(Duration::from_millis(200)).unwrap();
    server.start().unwrap();

    let mut client = TcpStream::connect(("127.0.0.1", 28831)).unwrap();
    client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();

    // First the probe arrives.
    let pack = TlvPacket::new(4096);
    let mut header = [0u8; 8];
    client.read_exact(&mut header).unwrap();
    let msg = pack.unpack(&header).unwrap();
    assert_eq!(msg.id(), HEARTBEAT_DEFAULT_MSG_ID);

    let mut payload = vec![0u8; msg.data_len() as usize];
    client.read_exact(&mut payload).unwrap();
    let text = String::from_utf8(payload).unwrap();
    assert!(text.starts_with("heartbeat ["), "unexpected probe payload: {text}");

    // The client never sends anything, so once the liveness window lapses
    // the not-alive action stops the connection and the stream ends.
    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    let mut buf = [0u8; 256];
    loop {
        match client.read(&mut buf) {
            Ok(0) => break,
            Ok(_) => {}
            Err(_) => break,
        }
        assert!(std::time::Instant::now() < deadline, "connection was never stopped");
    }

    assert!(server.conn_mgr().is_empty() || {
        // Finalizer may still be running; give it a moment.
        std::thread::sleep(Duration::from_millis(500));
        server.conn_mgr().is_empty()
    });

    server.stop();
}

#[test]
fn active_client_stays_alive() {
    use std::io::Write;

    use gantry::{Request, Router, codec::Message};

    struct Sink;
    impl Router for Sink {
        fn handle(&self, _req: &mut Request) {}
    }

    let server = Server::new(test_config(28832));
    server.start_heartbeat(Duration::from_millis(200)).unwrap();
    server.add_router(1, Arc::new(Sink)).unwrap();
    server.start().unwrap();

    let mut client = TcpStream::connect(("127.0.0.1", 28832)).unwrap();
    client.set_read_timeout(Some(Duration::from_millis(200))).unwrap();

    // Keep chattering for well past the liveness window; the connection
    // must survive.
    let pack = TlvPacket::new(4096);
    let ping = pack.pack(&Message::with_id(1, b"ping".to_vec())).unwrap();
    for _ in 0..8 {
        client.write_all(&ping).unwrap();
        std::thread::sleep(Duration::from_millis(250));
        // Drain any probes the server sent meanwhile.
        let mut buf = [0u8; 1024];
        let _ = client.read(&mut buf);
    }

    assert_eq!(server.conn_mgr().len(), 1);
    server.stop();
}
