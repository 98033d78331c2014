use std::{net::TcpStream, sync::Arc, thread, time::Duration};

use gantry::{Request, Router, Server, ServerConfig, ServerMode};

fn test_config(port: u16) -> ServerConfig {
    ServerConfig {
        name: "conn-manager".into(),
        host: "127.0.0.1".into(),
        tcp_port: port,
        mode: ServerMode::Tcp,
        worker_pool_size: 1,
        ..ServerConfig::default()
    }
}

struct Sink;

impl Router for Sink {
    fn handle(&self, _req: &mut Request) {}
}

fn wait_until(mut cond: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = std::time::Instant::now() + timeout;
    while std::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    cond()
}

#[test]
fn tracks_connect_and_disconnect() {
    let server = Server::new(test_config(28821));
    server.add_router(1, Arc::new(Sink)).unwrap();
    server.start().unwrap();

    let clients: Vec<TcpStream> =
        (0..3).map(|_| TcpStream::connect(("127.0.0.1", 28821)).unwrap()).collect();

    assert!(wait_until(|| server.conn_mgr().len() == 3, Duration::from_secs(5)));

    let mut ids = server.conn_mgr().all_conn_ids();
    ids.sort_unstable();
    assert_eq!(ids, vec![1, 2, 3]);

    let conn = server.conn_mgr().get(2).unwrap();
    assert_eq!(conn.conn_id_str(), "2");
    assert!(server.conn_mgr().get(99).is_err());

    let mut visited = 0;
    server.conn_mgr().range(|_, _| visited += 1);
    assert_eq!(visited, 3);

    drop(clients);
    assert!(wait_until(|| server.conn_mgr().is_empty(), Duration::from_secs(5)));

    server.stop();
}

#[test]
fn clear_stops_every_connection() {
    let server = Server::new(test_config(28822));
    server.add_router(1, Arc::new(Sink)).unwrap();
    server.start().unwrap();

    let _clients: Vec<TcpStream> =
        (0..4).map(|_| TcpStream::connect(("127.0.0.1", 28822)).unwrap()).collect();
    assert!(wait_until(|| server.conn_mgr().len() == 4, Duration::from_secs(5)));

    server.conn_mgr().clear();
    // Stop only cancels; each connection's finalizer removes itself.
    assert!(wait_until(|| server.conn_mgr().is_empty(), Duration::from_secs(5)));

    server.stop();
}

#[test]
fn connection_properties_round_trip() {
    let server = Server::new(test_config(28823));
    server.add_router(1, Arc::new(Sink)).unwrap();
    server.start().unwrap();

    let _client = TcpStream::connect(("127.0.0.1", 28823)).unwrap();
    assert!(wait_until(|| server.conn_mgr().len() == 1, Duration::from_secs(5)));

    let conn = server.conn_mgr().get(1).unwrap();
    conn.set_property("session", Arc::new(String::from("abc")));
    let value = conn.get_property("session").unwrap();
    assert_eq!(value.downcast_ref::<String>().map(String::as_str), Some("abc"));

    conn.remove_property("session");
    assert!(conn.get_property("session").is_err());

    server.stop();
}
