//! End-to-end tests over loopback.

use chatter::{
    connect,
    listen,
    Config,
    Connection,
    Data,
    Error,
    SendOpts,
    Server,
};
use sbs::{
    schema,
    Value,
};
use std::{
    sync::Arc,
    time::Duration,
};
use tokio::{
    io::AsyncWriteExt,
    net::TcpStream,
    sync::mpsc,
    time::{sleep, timeout},
};


fn test_repo() -> Arc<sbs::Repository> {
    let mut repo = chatter::sbs_repo();
    repo.register("Test", "Data", schema!(integer));
    Arc::new(repo)
}

fn test_data() -> Data {
    Data::new(Some("Test".to_owned()), "Data", Value::Integer(123))
}

async fn listen_on_loopback(
    repo: Arc<sbs::Repository>,
    config: Config,
) -> (Server, mpsc::UnboundedReceiver<Connection>) {
    let (conn_send, conn_recv) = mpsc::unbounded_channel();
    let server = listen(
        repo,
        "tcp+sbs://127.0.0.1:0",
        move |conn| {
            let _ = conn_send.send(conn);
        },
        config,
    )
    .await
    .unwrap();
    (server, conn_recv)
}

#[test]
fn repository_encodes_the_envelope() {
    let repo = test_repo();
    let data = repo
        .encode(Some("Test"), "Data", &Value::Integer(123))
        .unwrap();
    assert_eq!(
        repo.decode(Some("Test"), "Data", &data).unwrap(),
        Value::Integer(123),
    );

    let msg = Value::Record(vec![
        ("id", Value::Integer(1)).into(),
        ("first", Value::Integer(2)).into(),
        ("owner", Value::Boolean(true)).into(),
        ("token", Value::Boolean(false)).into(),
        ("last", Value::Boolean(true)).into(),
        ("data", Value::Record(vec![
            ("module", Value::some(Value::Str("Test".to_owned()))).into(),
            ("type", Value::Str("Data".to_owned())).into(),
            ("data", Value::Bytes(data)).into(),
        ])).into(),
    ]);
    let encoded = repo.encode(Some("Hat"), "Msg", &msg).unwrap();
    assert_eq!(repo.decode(Some("Hat"), "Msg", &encoded).unwrap(), msg);
}

#[tokio::test]
async fn basic_connect_and_close() {
    let repo = test_repo();

    // nobody listening yet
    let unused = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = unused.local_addr().unwrap().port();
    drop(unused);
    assert!(connect(
        Arc::clone(&repo),
        &format!("tcp+sbs://127.0.0.1:{}", port),
        Config::default(),
    )
    .await
    .is_err());

    let (server, mut conns) = listen_on_loopback(Arc::clone(&repo), Config::default()).await;
    let addr = server.addresses()[0].to_string();
    let conn = connect(Arc::clone(&repo), &addr, Config::default())
        .await
        .unwrap();
    let srv_conn = timeout(Duration::from_secs(5), conns.recv())
        .await
        .unwrap()
        .unwrap();

    assert!(!conn.is_closed());
    assert!(!srv_conn.is_closed());
    assert!(!server.is_closed());
    assert_eq!(conn.remote_address().to_string(), addr);
    assert_eq!(srv_conn.local_address().to_string(), addr);

    conn.close().await;
    server.close().await;
    timeout(Duration::from_secs(5), srv_conn.wait_closed())
        .await
        .unwrap();

    assert!(conn.is_closed());
    assert!(srv_conn.is_closed());
    assert!(server.is_closed());
}

#[tokio::test]
async fn connect_after_server_close_fails() {
    let repo = test_repo();
    let (server, _conns) = listen_on_loopback(Arc::clone(&repo), Config::default()).await;
    let addr = server.addresses()[0].to_string();

    let conn = connect(Arc::clone(&repo), &addr, Config::default())
        .await
        .unwrap();
    conn.close().await;

    server.close().await;
    assert!(server.is_closed());
    assert!(connect(Arc::clone(&repo), &addr, Config::default())
        .await
        .is_err());
}

#[tokio::test]
async fn wrong_address_is_rejected() {
    let repo = test_repo();
    for addr in ["tcp+sbs://127.0.0.1", "tcp://127.0.0.1:1234"] {
        assert!(matches!(
            connect(Arc::clone(&repo), addr, Config::default()).await,
            Err(Error::AddressInvalid(_)),
        ));
        assert!(matches!(
            listen(Arc::clone(&repo), addr, |_conn| (), Config::default()).await,
            Err(Error::AddressInvalid(_)),
        ));
    }
}

#[tokio::test]
async fn send_receive_round_trip() {
    let repo = test_repo();
    let (server, mut conns) = listen_on_loopback(Arc::clone(&repo), Config::default()).await;
    let addr = server.addresses()[0].to_string();
    let conn1 = connect(Arc::clone(&repo), &addr, Config::default())
        .await
        .unwrap();
    let conn2 = timeout(Duration::from_secs(5), conns.recv())
        .await
        .unwrap()
        .unwrap();

    let data = test_data();
    let conv = conn1.send(data.clone()).unwrap();
    assert!(conv.owner);

    let msg = timeout(Duration::from_secs(5), conn2.receive())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(msg.data, data);
    assert!(!msg.conv.owner);
    assert_eq!(msg.conv.first_id, conv.first_id);
    assert!(msg.first);
    assert!(msg.last);
    assert!(msg.token);

    conn1.close().await;
    conn2.close().await;
    server.close().await;

    assert!(matches!(conn1.send(data), Err(Error::ConnectionClosed)));
    assert!(matches!(conn2.receive().await, Err(Error::ConnectionClosed)));
}

#[tokio::test]
async fn send_receive_builtin_type() {
    let repo = test_repo();
    let (server, mut conns) = listen_on_loopback(Arc::clone(&repo), Config::default()).await;
    let addr = server.addresses()[0].to_string();
    let conn1 = connect(Arc::clone(&repo), &addr, Config::default())
        .await
        .unwrap();
    let conn2 = timeout(Duration::from_secs(5), conns.recv())
        .await
        .unwrap()
        .unwrap();

    let data = Data::new(None, "Integer", Value::Integer(123));
    conn1.send(data.clone()).unwrap();
    let msg = timeout(Duration::from_secs(5), conn2.receive())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(msg.data, data);

    conn1.close().await;
    conn2.close().await;
    server.close().await;
}

#[tokio::test]
async fn sends_arrive_in_wire_order() {
    let repo = test_repo();
    let (server, mut conns) = listen_on_loopback(Arc::clone(&repo), Config::default()).await;
    let addr = server.addresses()[0].to_string();
    let conn1 = connect(Arc::clone(&repo), &addr, Config::default())
        .await
        .unwrap();
    let conn2 = timeout(Duration::from_secs(5), conns.recv())
        .await
        .unwrap()
        .unwrap();

    for n in 0..100i64 {
        conn1
            .send(Data::new(None, "Integer", Value::Integer(n)))
            .unwrap();
    }
    let mut last_first_id = 0;
    for n in 0..100i64 {
        let msg = timeout(Duration::from_secs(5), conn2.receive())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg.data.data, Value::Integer(n));
        assert!(msg.first);
        assert!(msg.last);
        assert!(msg.conv.first_id > last_first_id);
        last_first_id = msg.conv.first_id;
    }

    conn1.close().await;
    conn2.close().await;
    server.close().await;
}

#[tokio::test]
async fn invalid_frame_closes_connection() {
    let repo = test_repo();
    let (server, mut conns) = listen_on_loopback(Arc::clone(&repo), Config::default()).await;
    let addr = server.addresses()[0].clone();

    let mut raw = TcpStream::connect((addr.host.as_str(), addr.port))
        .await
        .unwrap();
    let conn = timeout(Duration::from_secs(5), conns.recv())
        .await
        .unwrap()
        .unwrap();

    raw.write_all(&[0x01, 0x02, 0x03, 0x04]).await.unwrap();

    assert!(matches!(
        timeout(Duration::from_secs(5), conn.receive()).await.unwrap(),
        Err(Error::ConnectionClosed),
    ));
    timeout(Duration::from_secs(5), conn.wait_closed())
        .await
        .unwrap();

    drop(raw);
    server.close().await;
}

#[tokio::test]
async fn ping_timeout_closes_connection() {
    let repo = test_repo();
    let config = Config {
        ping_timeout: Duration::from_millis(20),
        ..Config::default()
    };
    let (server, mut conns) = listen_on_loopback(Arc::clone(&repo), config).await;
    let addr = server.addresses()[0].clone();

    // a peer that never writes anything, not even pongs
    let raw = TcpStream::connect((addr.host.as_str(), addr.port))
        .await
        .unwrap();
    let conn = timeout(Duration::from_secs(5), conns.recv())
        .await
        .unwrap()
        .unwrap();

    timeout(Duration::from_secs(5), conn.wait_closed())
        .await
        .unwrap();
    assert!(conn.is_closed());

    drop(raw);
    server.close().await;
}

#[tokio::test]
async fn pings_are_answered_and_invisible() {
    let repo = test_repo();
    let config = Config {
        ping_timeout: Duration::from_millis(50),
        ..Config::default()
    };
    let (server, mut conns) = listen_on_loopback(Arc::clone(&repo), config.clone()).await;
    let addr = server.addresses()[0].to_string();
    let conn1 = connect(Arc::clone(&repo), &addr, config).await.unwrap();
    let conn2 = timeout(Duration::from_secs(5), conns.recv())
        .await
        .unwrap()
        .unwrap();

    // both directions go idle; keep-alive traffic must sustain the
    // connection without surfacing anything
    sleep(Duration::from_millis(400)).await;
    assert!(!conn1.is_closed());
    assert!(!conn2.is_closed());

    let data = test_data();
    conn1.send(data.clone()).unwrap();
    let msg = timeout(Duration::from_secs(5), conn2.receive())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(msg.data, data);

    conn1.close().await;
    conn2.close().await;
    server.close().await;
}

#[tokio::test]
async fn keep_alive_survives_asymmetric_traffic() {
    let repo = test_repo();
    let (server, mut conns) = listen_on_loopback(Arc::clone(&repo), Config::default()).await;
    let addr = server.addresses()[0].to_string();
    // only the client probes; the server answers from its own id space
    let config = Config {
        ping_timeout: Duration::from_millis(50),
        ..Config::default()
    };
    let conn1 = connect(Arc::clone(&repo), &addr, config).await.unwrap();
    let conn2 = timeout(Duration::from_secs(5), conns.recv())
        .await
        .unwrap()
        .unwrap();

    // push the client's id counter well past the server's
    for _ in 0..5 {
        conn1.send(test_data()).unwrap();
    }
    for _ in 0..5 {
        timeout(Duration::from_secs(5), conn2.receive())
            .await
            .unwrap()
            .unwrap();
    }

    // the client goes idle and pings with first > any id the server has
    // allocated; the pong must not be taken for a protocol violation
    sleep(Duration::from_millis(300)).await;
    assert!(!conn1.is_closed());
    assert!(!conn2.is_closed());

    let data = test_data();
    conn2.send(data.clone()).unwrap();
    let msg = timeout(Duration::from_secs(5), conn1.receive())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(msg.data, data);

    conn1.close().await;
    conn2.close().await;
    server.close().await;
}

#[tokio::test]
async fn colliding_peer_conversation_keeps_timeout_armed() {
    let repo = test_repo();
    let (server, mut conns) = listen_on_loopback(Arc::clone(&repo), Config::default()).await;
    let addr = server.addresses()[0].to_string();
    let conn1 = connect(Arc::clone(&repo), &addr, Config::default())
        .await
        .unwrap();
    let conn2 = timeout(Duration::from_secs(5), conns.recv())
        .await
        .unwrap()
        .unwrap();

    let (cb_send, mut cb_recv) = mpsc::unbounded_channel();
    let conv = conn1
        .send_with(test_data(), SendOpts {
            last: false,
            timeout: Some(Duration::from_millis(100)),
            timeout_cb: Some(Box::new(move |conv| {
                let _ = cb_send.send(conv);
            })),
            ..Default::default()
        })
        .unwrap();

    // both id counters start at 1, so the peer's own first conversation
    // collides with ours; it is not a reply and must not disarm the timeout
    conn2.send(test_data()).unwrap();
    let msg = timeout(Duration::from_secs(5), conn1.receive())
        .await
        .unwrap()
        .unwrap();
    assert!(!msg.conv.owner);
    assert_eq!(msg.conv.first_id, conv.first_id);

    let timed_out = timeout(Duration::from_secs(5), cb_recv.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(timed_out, conv);

    conn1.close().await;
    conn2.close().await;
    server.close().await;
}

#[tokio::test]
async fn conversation_timeout_fires_latest_callback() {
    let repo = test_repo();
    let (server, mut conns) = listen_on_loopback(Arc::clone(&repo), Config::default()).await;
    let addr = server.addresses()[0].to_string();
    let conn1 = connect(Arc::clone(&repo), &addr, Config::default())
        .await
        .unwrap();
    let conn2 = timeout(Duration::from_secs(5), conns.recv())
        .await
        .unwrap()
        .unwrap();

    let data = test_data();
    let (cb_send, mut cb_recv) = mpsc::unbounded_channel();

    // opening send arms a long timeout; the reply below disarms it
    let conv = conn1
        .send_with(data.clone(), SendOpts {
            last: false,
            timeout: Some(Duration::from_secs(5)),
            timeout_cb: Some(Box::new({
                let cb_send = cb_send.clone();
                move |conv| {
                    let _ = cb_send.send(("first", conv));
                }
            })),
            ..Default::default()
        })
        .unwrap();

    let msg = timeout(Duration::from_secs(5), conn2.receive())
        .await
        .unwrap()
        .unwrap();
    conn2
        .send_with(data.clone(), SendOpts {
            conv: Some(msg.conv),
            last: false,
            ..Default::default()
        })
        .unwrap();
    let msg = timeout(Duration::from_secs(5), conn1.receive())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(msg.conv, conv);

    // two quick re-arms; only the latest callback may fire
    conn1
        .send_with(data.clone(), SendOpts {
            conv: Some(conv),
            last: false,
            token: false,
            timeout: Some(Duration::from_millis(50)),
            timeout_cb: Some(Box::new({
                let cb_send = cb_send.clone();
                move |conv| {
                    let _ = cb_send.send(("second", conv));
                }
            })),
            ..Default::default()
        })
        .unwrap();
    conn1
        .send_with(data.clone(), SendOpts {
            conv: Some(conv),
            last: false,
            timeout: Some(Duration::from_millis(50)),
            timeout_cb: Some(Box::new({
                let cb_send = cb_send.clone();
                move |conv| {
                    let _ = cb_send.send(("third", conv));
                }
            })),
            ..Default::default()
        })
        .unwrap();

    let (which, timed_out) = timeout(Duration::from_secs(5), cb_recv.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(which, "third");
    assert_eq!(timed_out, conv);
    assert!(cb_recv.try_recv().is_err());

    conn1.close().await;
    conn2.close().await;
    server.close().await;
}

#[tokio::test]
async fn close_while_receive_queue_blocked() {
    let repo = test_repo();
    let (server, mut conns) = listen_on_loopback(Arc::clone(&repo), Config::default()).await;
    let addr = server.addresses()[0].to_string();
    let config = Config {
        queue_maxsize: 1,
        ..Config::default()
    };
    let conn1 = connect(Arc::clone(&repo), &addr, config).await.unwrap();
    let conn2 = timeout(Duration::from_secs(5), conns.recv())
        .await
        .unwrap()
        .unwrap();

    // second message wedges conn1's reader against the full queue
    conn2.send(test_data()).unwrap();
    conn2.send(test_data()).unwrap();
    sleep(Duration::from_millis(20)).await;

    conn1.close().await;
    timeout(Duration::from_millis(100), conn2.wait_closed())
        .await
        .unwrap();

    server.close().await;
}

#[tokio::test]
async fn tls_connect() {
    let repo = test_repo();
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_owned()]).unwrap();
    let mut pem = cert.cert.pem();
    pem.push_str(&cert.key_pair.serialize_pem());
    let mut pem_file = tempfile::NamedTempFile::new().unwrap();
    std::io::Write::write_all(&mut pem_file, pem.as_bytes()).unwrap();

    // pem file is mandatory for a TLS listener
    assert!(listen(
        Arc::clone(&repo),
        "ssl+sbs://127.0.0.1:0",
        |_conn| (),
        Config::default(),
    )
    .await
    .is_err());

    let config = Config {
        pem_file: Some(pem_file.path().to_owned()),
        ..Config::default()
    };
    let (conn_send, mut conns) = mpsc::unbounded_channel();
    let server = listen(
        Arc::clone(&repo),
        "ssl+sbs://127.0.0.1:0",
        move |conn| {
            let _ = conn_send.send(conn);
        },
        config.clone(),
    )
    .await
    .unwrap();
    let addr = server.addresses()[0].to_string();
    assert!(addr.starts_with("ssl+sbs://"));

    // without a client certificate
    let conn = connect(Arc::clone(&repo), &addr, Config::default())
        .await
        .unwrap();
    let srv_conn = timeout(Duration::from_secs(5), conns.recv())
        .await
        .unwrap()
        .unwrap();
    let data = test_data();
    conn.send(data.clone()).unwrap();
    let msg = timeout(Duration::from_secs(5), srv_conn.receive())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(msg.data, data);
    conn.close().await;
    assert!(conn.is_closed());

    // with a client certificate
    let conn = connect(Arc::clone(&repo), &addr, config).await.unwrap();
    assert!(!conn.is_closed());
    conn.close().await;
    assert!(conn.is_closed());

    server.close().await;
}
