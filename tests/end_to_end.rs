use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use loquic::{
    Bytes, ConnectionHooks, Network, Stream, StreamCloseCb, StreamDataCb, TlsCreds,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn creds() -> (TlsCreds, TlsCreds) {
    let rcgen::CertifiedKey { cert, key_pair } =
        rcgen::generate_simple_self_signed(vec!["localhost".into()]).unwrap();
    let cert_der = cert.der().clone();
    let key = rustls::pki_types::PrivateKeyDer::Pkcs8(key_pair.serialize_der().into());
    let server = TlsCreds::server_from_der(vec![cert_der.clone()], key).unwrap();
    let client = TlsCreds::client_from_roots([cert_der], "localhost").unwrap();
    (server, client)
}

fn localhost() -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, 0))
}

fn wait_for(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}

fn data_hooks(cb: StreamDataCb) -> ConnectionHooks {
    let mut hooks = ConnectionHooks::default();
    hooks.on_stream_data = Some(cb);
    hooks
}

#[test]
fn single_stream_hello() {
    init_tracing();
    let (server_creds, client_creds) = creds();
    let net = Network::new().unwrap();
    let msg = "hello from the other siiiii-iiiiide";

    let received = Arc::new(Mutex::new(String::new()));
    let received2 = received.clone();
    let on_data: StreamDataCb = Arc::new(move |_stream, data| {
        received2
            .lock()
            .unwrap()
            .push_str(std::str::from_utf8(&data).unwrap());
    });

    let server = net.endpoint(localhost()).unwrap();
    server.listen(&server_creds, data_hooks(on_data)).unwrap();

    let client = net.endpoint(localhost()).unwrap();
    let conn = client
        .connect(server.local_addr(), &client_creds, ConnectionHooks::default())
        .unwrap();
    let stream = conn.open_stream(None, None).unwrap();
    stream.send(msg).unwrap();

    assert!(
        wait_for(Duration::from_secs(5), || *received.lock().unwrap() == msg),
        "server received {:?}",
        *received.lock().unwrap()
    );
    net.close(true).unwrap();
}

#[test]
fn round_trip_with_close_after_final_data() {
    init_tracing();
    let (server_creds, client_creds) = creds();
    let net = Network::new().unwrap();

    // Events recorded in callback order: all data must precede the close.
    let events = Arc::new(Mutex::new(Vec::<String>::new()));
    let mut hooks = ConnectionHooks::default();
    let ev = events.clone();
    let on_data: StreamDataCb = Arc::new(move |_stream, data| {
        ev.lock()
            .unwrap()
            .push(format!("data:{}", String::from_utf8_lossy(&data)));
    });
    let ev = events.clone();
    let on_close: StreamCloseCb = Arc::new(move |_stream, code| {
        ev.lock().unwrap().push(format!("close:{code}"));
    });
    hooks.on_stream_data = Some(on_data);
    hooks.on_stream_close = Some(on_close);

    let server = net.endpoint(localhost()).unwrap();
    server.listen(&server_creds, hooks).unwrap();

    let client = net.endpoint(localhost()).unwrap();
    let conn = client
        .connect(server.local_addr(), &client_creds, ConnectionHooks::default())
        .unwrap();
    let stream = conn.open_stream(None, None).unwrap();
    stream.send("part one, ").unwrap();
    stream.send("part two").unwrap();
    stream.close(0).unwrap();
    // A second close must be a no-op.
    stream.close(0).unwrap();

    assert!(wait_for(Duration::from_secs(5), || {
        events.lock().unwrap().iter().any(|e| e.starts_with("close"))
    }));
    std::thread::sleep(Duration::from_millis(50));

    let events = events.lock().unwrap();
    let concatenated: String = events
        .iter()
        .filter_map(|e| e.strip_prefix("data:"))
        .collect();
    assert_eq!(concatenated, "part one, part two");
    assert_eq!(events.last().unwrap(), "close:0");
    assert_eq!(events.iter().filter(|e| e.starts_with("close")).count(), 1);
    net.close(true).unwrap();
}

#[test]
fn multi_client_fanout() {
    init_tracing();
    let (server_creds, client_creds) = creds();
    let net = Network::new().unwrap();
    let msg = "hello from the other siiiii-iiiiide";

    let seen = Arc::new(Mutex::new(Vec::<u64>::new()));
    let seen2 = seen.clone();
    let on_data: StreamDataCb = Arc::new(move |stream, _data| {
        seen2.lock().unwrap().push(stream.connection().id());
    });

    let server = net.endpoint(localhost()).unwrap();
    server.listen(&server_creds, data_hooks(on_data)).unwrap();
    let server_addr = server.local_addr();

    let mut conns = Vec::new();
    for _ in 0..4 {
        let client = net.endpoint(localhost()).unwrap();
        let conn = client
            .connect(server_addr, &client_creds, ConnectionHooks::default())
            .unwrap();
        let stream = conn.open_stream(None, None).unwrap();
        stream.send(msg).unwrap();
        conns.push((client, conn));
    }

    assert!(wait_for(Duration::from_secs(5), || seen.lock().unwrap().len() >= 4));
    // One message per connection, none routed to the wrong one.
    let mut ids = seen.lock().unwrap().clone();
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), 4);
    assert_eq!(server.get_all_conns(None).unwrap().len(), 4);
    net.close(true).unwrap();
}

/// Producer counting through `limit`, shared counter across nested stages.
fn counting_producer(
    prefix: &'static str,
    limit: usize,
    counter: Arc<AtomicUsize>,
) -> impl FnMut(&Stream) -> Option<Bytes> + Send + 'static {
    move |_stream| {
        let next = counter.load(Ordering::SeqCst) + 1;
        if next <= limit {
            counter.store(next, Ordering::SeqCst);
            Some(Bytes::from(format!("[{prefix}-{next}]")))
        } else {
            None
        }
    }
}

#[test]
fn nested_chunked_sends() {
    init_tracing();
    let (server_creds, client_creds) = creds();
    let net = Network::new().unwrap();

    let received = Arc::new(Mutex::new(String::new()));
    let received2 = received.clone();
    let on_data: StreamDataCb = Arc::new(move |_stream, data| {
        received2
            .lock()
            .unwrap()
            .push_str(std::str::from_utf8(&data).unwrap());
    });

    let server = net.endpoint(localhost()).unwrap();
    server.listen(&server_creds, data_hooks(on_data)).unwrap();

    let client = net.endpoint(localhost()).unwrap();
    let conn = client
        .connect(server.local_addr(), &client_creds, ConnectionHooks::default())
        .unwrap();
    let stream = conn.open_stream(None, None).unwrap();
    stream.send("HELLO!").unwrap();

    let counter = Arc::new(AtomicUsize::new(0));
    let (c1, c2, c3) = (counter.clone(), counter.clone(), counter.clone());
    stream
        .send_chunks(
            counting_producer("CHUNK", 3, c1),
            move |stream: &Stream| {
                let c3 = c3.clone();
                stream
                    .send_chunks(
                        counting_producer("Chunk", 6, c2),
                        move |stream: &Stream| {
                            stream
                                .send_chunks(
                                    counting_producer("chunk", 10, c3),
                                    |stream: &Stream| {
                                        stream.send("Goodbye.").unwrap();
                                    },
                                    2,
                                )
                                .unwrap();
                        },
                        2,
                    )
                    .unwrap();
            },
            2,
        )
        .unwrap();

    let expected = "HELLO![CHUNK-1][CHUNK-2][CHUNK-3][Chunk-4][Chunk-5][Chunk-6]\
                    [chunk-7][chunk-8][chunk-9][chunk-10]Goodbye.";
    assert!(
        wait_for(Duration::from_secs(10), || *received.lock().unwrap() == expected),
        "server received {:?}",
        *received.lock().unwrap()
    );
    net.close(true).unwrap();
}

#[test]
fn empty_producer_completes_without_sending() {
    init_tracing();
    let (server_creds, client_creds) = creds();
    let net = Network::new().unwrap();

    let server = net.endpoint(localhost()).unwrap();
    server.listen(&server_creds, ConnectionHooks::default()).unwrap();

    let client = net.endpoint(localhost()).unwrap();
    let conn = client
        .connect(server.local_addr(), &client_creds, ConnectionHooks::default())
        .unwrap();
    let stream = conn.open_stream(None, None).unwrap();

    let done = Arc::new(AtomicUsize::new(0));
    let done2 = done.clone();
    stream
        .send_chunks(
            |_stream| None,
            move |_stream: &Stream| {
                done2.fetch_add(1, Ordering::SeqCst);
            },
            4,
        )
        .unwrap();

    assert!(wait_for(Duration::from_secs(5), || {
        done.load(Ordering::SeqCst) == 1
    }));
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(done.load(Ordering::SeqCst), 1);
    net.close(true).unwrap();
}

#[test]
fn echo_from_data_callback() {
    init_tracing();
    let (server_creds, client_creds) = creds();
    let net = Network::new().unwrap();

    // The server echoes from inside its data callback, exercising API
    // re-entry on the loop thread.
    let echo: StreamDataCb = Arc::new(move |stream, data| {
        stream.send(data).unwrap();
    });

    let server = net.endpoint(localhost()).unwrap();
    server.listen(&server_creds, data_hooks(echo)).unwrap();

    let client = net.endpoint(localhost()).unwrap();
    let conn = client
        .connect(server.local_addr(), &client_creds, ConnectionHooks::default())
        .unwrap();

    let echoed = Arc::new(Mutex::new(String::new()));
    let echoed2 = echoed.clone();
    let on_data: StreamDataCb = Arc::new(move |_stream, data| {
        echoed2
            .lock()
            .unwrap()
            .push_str(std::str::from_utf8(&data).unwrap());
    });
    let stream = conn.open_stream(Some(on_data), None).unwrap();
    stream.send("ping pong").unwrap();

    assert!(wait_for(Duration::from_secs(5), || {
        *echoed.lock().unwrap() == "ping pong"
    }));
    net.close(true).unwrap();
}

#[test]
fn version_negotiation_for_unknown_version() {
    init_tracing();
    let (server_creds, _) = creds();
    let net = Network::new().unwrap();
    let server = net.endpoint(localhost()).unwrap();
    server.listen(&server_creds, ConnectionHooks::default()).unwrap();
    let server_addr = server.local_addr();

    // A long-header Initial with a version the server does not speak, padded
    // to the minimum Initial size.
    let mut packet = vec![0u8; 1200];
    packet[0] = 0xc0;
    packet[1..5].copy_from_slice(&0x1a2a_3a4au32.to_be_bytes());
    packet[5] = 8;
    packet[6..14].copy_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
    packet[14] = 8;
    packet[15..23].copy_from_slice(&[8, 7, 6, 5, 4, 3, 2, 1]);

    let raw = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    raw.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    raw.send_to(&packet, server_addr).unwrap();

    let mut response = [0u8; 1500];
    let (len, from) = raw.recv_from(&mut response).unwrap();
    assert_eq!(from, server_addr);
    // Version Negotiation: long header with the version field zero.
    assert_eq!(response[0] & 0x80, 0x80);
    assert_eq!(&response[1..5], &[0, 0, 0, 0]);

    let dcid_len = response[5] as usize;
    let scid_offset = 6 + dcid_len;
    let scid_len = response[scid_offset] as usize;
    let mut offset = scid_offset + 1 + scid_len;
    let mut offers_v1 = false;
    while offset + 4 <= len {
        offers_v1 |= response[offset..offset + 4] == [0, 0, 0, 1];
        offset += 4;
    }
    assert!(offers_v1, "version negotiation must offer QUIC v1");
    net.close(true).unwrap();
}

#[test]
fn draining_after_peer_close() {
    init_tracing();
    let (server_creds, client_creds) = creds();
    let net = Network::new().unwrap();

    let close_code = Arc::new(AtomicU64::new(u64::MAX));
    let mut hooks = ConnectionHooks::default();
    let code2 = close_code.clone();
    hooks.on_closing = Some(Arc::new(move |_conn, code| {
        code2.store(code, Ordering::SeqCst);
    }));

    let server = net.endpoint(localhost()).unwrap();
    server.listen(&server_creds, hooks).unwrap();

    let client = net.endpoint(localhost()).unwrap();
    let conn = client
        .connect(server.local_addr(), &client_creds, ConnectionHooks::default())
        .unwrap();
    assert!(wait_for(Duration::from_secs(5), || {
        server.get_all_conns(None).unwrap().len() == 1
    }));

    conn.close(42, b"goodbye").unwrap();
    conn.close(42, b"goodbye").unwrap(); // idempotent

    assert!(wait_for(Duration::from_secs(5), || {
        close_code.load(Ordering::SeqCst) == 42
    }));
    assert!(conn.is_closed());
    // The drained connection is removed from the endpoint's table after the
    // close deadline (3x PTO) elapses.
    assert!(wait_for(Duration::from_secs(10), || {
        server.get_all_conns(None).unwrap().is_empty()
    }));
    net.close(true).unwrap();
}

#[test]
fn streams_beyond_credit_are_queued() {
    init_tracing();
    let (server_creds, client_creds) = creds();
    let net = Network::new().unwrap();

    // More streams than the 32-stream credit; closing each frees credit for
    // the queued remainder.
    let closes = Arc::new(AtomicUsize::new(0));
    let mut hooks = ConnectionHooks::default();
    let closes2 = closes.clone();
    hooks.on_stream_close = Some(Arc::new(move |_stream, _code| {
        closes2.fetch_add(1, Ordering::SeqCst);
    }));

    let server = net.endpoint(localhost()).unwrap();
    server.listen(&server_creds, hooks).unwrap();

    let client = net.endpoint(localhost()).unwrap();
    let conn = client
        .connect(server.local_addr(), &client_creds, ConnectionHooks::default())
        .unwrap();
    for i in 0..40 {
        let stream = conn.open_stream(None, None).unwrap();
        stream.send(format!("stream-{i}")).unwrap();
        stream.close(0).unwrap();
    }

    assert!(
        wait_for(Duration::from_secs(10), || closes.load(Ordering::SeqCst) >= 40),
        "only {} streams closed",
        closes.load(Ordering::SeqCst)
    );
    net.close(true).unwrap();
}

#[test]
fn unreliable_datagram_roundtrip() {
    init_tracing();
    let (server_creds, client_creds) = creds();
    let net = Network::new().unwrap();

    let received = Arc::new(Mutex::new(Vec::<u8>::new()));
    let mut server_hooks = ConnectionHooks::default();
    let received2 = received.clone();
    server_hooks.on_datagram = Some(Arc::new(move |_conn, data| {
        received2.lock().unwrap().extend_from_slice(&data);
    }));

    let server = net.endpoint(localhost()).unwrap();
    server.listen(&server_creds, server_hooks).unwrap();

    let connected = Arc::new(AtomicUsize::new(0));
    let mut client_hooks = ConnectionHooks::default();
    let connected2 = connected.clone();
    client_hooks.on_open = Some(Arc::new(move |_conn| {
        connected2.fetch_add(1, Ordering::SeqCst);
    }));

    let client = net.endpoint(localhost()).unwrap();
    let conn = client
        .connect(server.local_addr(), &client_creds, client_hooks)
        .unwrap();
    assert!(wait_for(Duration::from_secs(5), || {
        connected.load(Ordering::SeqCst) == 1
    }));

    conn.send_datagram(&b"unreliable ping"[..]).unwrap();
    assert!(wait_for(Duration::from_secs(5), || {
        received.lock().unwrap().as_slice() == b"unreliable ping"
    }));
    net.close(true).unwrap();
}

#[test]
fn graceful_shutdown_stops_callbacks() {
    init_tracing();
    let (server_creds, client_creds) = creds();
    let net = Network::new().unwrap();

    let count = Arc::new(AtomicUsize::new(0));
    let count2 = count.clone();
    let on_data: StreamDataCb = Arc::new(move |_stream, _data| {
        count2.fetch_add(1, Ordering::SeqCst);
    });

    let server = net.endpoint(localhost()).unwrap();
    server.listen(&server_creds, data_hooks(on_data)).unwrap();

    let client = net.endpoint(localhost()).unwrap();
    let conn = client
        .connect(server.local_addr(), &client_creds, ConnectionHooks::default())
        .unwrap();
    let stream = conn.open_stream(None, None).unwrap();
    stream.send("before close").unwrap();
    assert!(wait_for(Duration::from_secs(5), || {
        count.load(Ordering::SeqCst) >= 1
    }));

    net.close(true).unwrap();
    let after = count.load(Ordering::SeqCst);

    // The loop has exited: no further callbacks fire and new work is refused.
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(count.load(Ordering::SeqCst), after);
    assert!(net.endpoint(localhost()).is_err());
    assert!(stream.send("after close").is_err());
    // Closing again is a no-op.
    net.close(true).unwrap();
}
