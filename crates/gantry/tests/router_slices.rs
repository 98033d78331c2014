use std::{
    io::{Read, Write},
    net::TcpStream,
    sync::Arc,
    time::Duration,
};

use gantry::{
    Request, RouterHandler, Server, ServerConfig, ServerMode,
    codec::{Message, Packet, TlvPacket},
};

fn test_config(port: u16) -> ServerConfig {
    ServerConfig {
        name: "router-slices".into(),
        host: "127.0.0.1".into(),
        tcp_port: port,
        mode: ServerMode::Tcp,
        router_slices_mode: true,
        worker_pool_size: 1,
        ..ServerConfig::default()
    }
}

fn read_msg(stream: &mut TcpStream) -> Message {
    let pack = TlvPacket::new(4096);
    let mut header = [0u8; 8];
    stream.read_exact(&mut header).unwrap();
    let mut msg = pack.unpack(&header).unwrap();
    let mut payload = vec![0u8; msg.data_len() as usize];
    stream.read_exact(&mut payload).unwrap();
    msg.set_data(payload);
    msg
}

fn send_msg(stream: &mut TcpStream, id: u32, data: &[u8]) {
    let pack = TlvPacket::new(4096);
    stream.write_all(&pack.pack(&Message::with_id(id, data.to_vec())).unwrap()).unwrap();
}

#[test]
fn middleware_runs_before_handlers() {
    let server = Server::new(test_config(28811));

    // Middleware stamps the request context; the handler replies with the
    // stamp ahead of the payload.
    let stamp: RouterHandler = Arc::new(|req: &mut Request| {
        req.set_ctx("stamp", Arc::new(0xAAu8));
    });
    let reply: RouterHandler = Arc::new(|req: &mut Request| {
        let stamp = req
            .get_ctx("stamp")
            .and_then(|v| v.downcast_ref::<u8>().copied())
            .unwrap_or(0);
        let mut out = vec![stamp];
        out.extend_from_slice(req.data());
        if let Some(conn) = req.connection() {
            conn.send_msg(req.msg_id(), &out).unwrap();
        }
    });

    server.use_middleware([stamp]).unwrap();
    server.add_router_slices(1, [reply]).unwrap();
    server.start().unwrap();

    let mut client = TcpStream::connect(("127.0.0.1", 28811)).unwrap();
    client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();

    send_msg(&mut client, 1, b"xy");
    let msg = read_msg(&mut client);
    assert_eq!(msg.data(), [0xAA, b'x', b'y']);

    server.stop();
}

#[test]
fn abort_in_middleware_skips_handler() {
    let server = Server::new(test_config(28812));

    let gate: RouterHandler = Arc::new(|req: &mut Request| {
        // Reject everything with an empty-payload nack and stop the walk.
        if let Some(conn) = req.connection() {
            conn.send_msg(u32::MAX, &[]).unwrap();
        }
        req.abort();
    });
    let never: RouterHandler = Arc::new(|req: &mut Request| {
        if let Some(conn) = req.connection() {
            conn.send_msg(req.msg_id(), b"handled").unwrap();
        }
    });

    server.use_middleware([gate]).unwrap();
    server.add_router_slices(9, [never]).unwrap();
    server.start().unwrap();

    let mut client = TcpStream::connect(("127.0.0.1", 28812)).unwrap();
    client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();

    send_msg(&mut client, 9, b"payload");
    let msg = read_msg(&mut client);
    assert_eq!(msg.id(), u32::MAX);
    assert_eq!(msg.data_len(), 0);

    // Only the nack arrives; the handler response never does.
    client.set_read_timeout(Some(Duration::from_millis(300))).unwrap();
    let mut extra = [0u8; 1];
    assert!(client.read_exact(&mut extra).is_err());

    server.stop();
}

#[test]
fn group_handlers_carry_group_middleware() {
    let server = Server::new(test_config(28813));

    let group_tag: RouterHandler = Arc::new(|req: &mut Request| {
        req.set_ctx("group", Arc::new(true));
    });
    let reply: RouterHandler = Arc::new(|req: &mut Request| {
        let tagged = req.get_ctx("group").is_some();
        if let Some(conn) = req.connection() {
            conn.send_msg(req.msg_id(), &[u8::from(tagged)]).unwrap();
        }
    });

    let group = server.group(100, 200, [group_tag]).unwrap();
    group.add_handler(150, [Arc::clone(&reply)]).unwrap();
    assert!(group.add_handler(50, [reply]).is_err());

    server.start().unwrap();

    let mut client = TcpStream::connect(("127.0.0.1", 28813)).unwrap();
    client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();

    send_msg(&mut client, 150, b"");
    let msg = read_msg(&mut client);
    assert_eq!(msg.data(), [1]);

    server.stop();
}
