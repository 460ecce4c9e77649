//! End-to-end scenarios run against real loopback TCP sockets, exercising
//! the IDE-side command listener and the engine-side splice engine together.

use std::sync::Arc;
use std::time::Duration;

use dbgp_proxy::listener::{run_command_listener, run_engine_listener};
use dbgp_proxy::registry::{EndpointKind, Registry};
use dbgp_proxy::session::SpliceConfig;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

async fn write_command(stream: &mut TcpStream, text: &str) {
    stream.write_all(text.as_bytes()).await.unwrap();
    stream.write_all(&[0u8]).await.unwrap();
}

async fn read_response(stream: &mut TcpStream) -> String {
    let mut digits = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        stream.read_exact(&mut byte).await.unwrap();
        if byte[0] == 0 {
            break;
        }
        digits.push(byte[0]);
    }
    let len: usize = String::from_utf8(digits).unwrap().parse().unwrap();
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await.unwrap();
    stream.read_exact(&mut byte).await.unwrap();
    assert_eq!(byte[0], 0);
    String::from_utf8(payload).unwrap()
}

async fn write_response(stream: &mut TcpStream, payload: &str) {
    stream
        .write_all(format!("{}\0", payload.len()).as_bytes())
        .await
        .unwrap();
    stream.write_all(payload.as_bytes()).await.unwrap();
    stream.write_all(&[0u8]).await.unwrap();
}

fn spawn_ide_listener(
    addr: &str,
    proxy: Arc<Registry>,
    cloud: Arc<Registry>,
    shutdown: CancellationToken,
) {
    let addr = addr.parse().unwrap();
    tokio::spawn(run_command_listener("ide", addr, None, proxy, cloud, shutdown));
}

fn spawn_engine_listener(
    addr: &str,
    proxy: Arc<Registry>,
    shutdown: CancellationToken,
) {
    let addr = addr.parse().unwrap();
    tokio::spawn(run_engine_listener(
        "engine",
        addr,
        None,
        proxy,
        SpliceConfig::default(),
        shutdown,
    ));
}

#[tokio::test]
async fn s1_proxyinit_registers_an_ide() {
    let proxy = Arc::new(Registry::new());
    let cloud = Arc::new(Registry::new_force_replace());
    let shutdown = CancellationToken::new();
    spawn_ide_listener("127.0.0.1:19101", proxy.clone(), cloud, shutdown.clone());
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut client = TcpStream::connect("127.0.0.1:19101").await.unwrap();
    write_command(&mut client, "proxyinit -i 1 -k KEY1 -p 9000 -m 1").await;
    let reply = read_response(&mut client).await;

    assert!(reply.contains(r#"success="1""#));
    assert!(reply.contains(r#"idekey="KEY1""#));
    assert!(reply.contains(r#"port="9000""#));

    let info = proxy.find("KEY1").unwrap();
    assert_eq!(info.port, 9000);
    shutdown.cancel();
}

#[tokio::test]
async fn s2_duplicate_proxyinit_fails() {
    let proxy = Arc::new(Registry::new());
    let cloud = Arc::new(Registry::new_force_replace());
    let shutdown = CancellationToken::new();
    spawn_ide_listener("127.0.0.1:19102", proxy.clone(), cloud, shutdown.clone());
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut client = TcpStream::connect("127.0.0.1:19102").await.unwrap();
    write_command(&mut client, "proxyinit -i 1 -k KEY1 -p 9000").await;
    let first = read_response(&mut client).await;
    assert!(first.contains(r#"success="1""#));

    let mut client = TcpStream::connect("127.0.0.1:19102").await.unwrap();
    write_command(&mut client, "proxyinit -i 2 -k KEY1 -p 9100").await;
    let second = read_response(&mut client).await;
    assert!(second.contains(r#"success="0""#));
    assert!(second.contains("PROXY-ERR-01"));
    shutdown.cancel();
}

#[tokio::test]
async fn s3_engine_connection_is_spliced_to_registered_ide() {
    let proxy = Arc::new(Registry::new());
    let cloud = Arc::new(Registry::new_force_replace());
    let shutdown = CancellationToken::new();

    // A fake IDE, listening on its own port, waiting to receive the
    // forwarded `init` packet and reply once.
    let fake_ide = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let fake_ide_port = fake_ide.local_addr().unwrap().port();

    spawn_ide_listener("127.0.0.1:19103", proxy.clone(), cloud, shutdown.clone());
    spawn_engine_listener("127.0.0.1:19203", proxy.clone(), shutdown.clone());
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut registrar = TcpStream::connect("127.0.0.1:19103").await.unwrap();
    write_command(
        &mut registrar,
        &format!("proxyinit -i 1 -k KEY1 -p {fake_ide_port}"),
    )
    .await;
    let reply = read_response(&mut registrar).await;
    assert!(reply.contains(r#"success="1""#));

    let ide_task = tokio::spawn(async move {
        let (mut sock, _) = fake_ide.accept().await.unwrap();
        let mut digits = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            sock.read_exact(&mut byte).await.unwrap();
            if byte[0] == 0 {
                break;
            }
            digits.push(byte[0]);
        }
        let len: usize = String::from_utf8(digits).unwrap().parse().unwrap();
        let mut init_payload = vec![0u8; len];
        sock.read_exact(&mut init_payload).await.unwrap();
        sock.read_exact(&mut byte).await.unwrap();
        write_response(&mut sock, r#"<response command="step_into" status="break"/>"#).await;
        String::from_utf8(init_payload).unwrap()
    });

    let mut engine = TcpStream::connect("127.0.0.1:19203").await.unwrap();
    let init_doc = r#"<init xmlns="urn:debugger_protocol_v1" idekey="KEY1" fileuri="file:///tmp/a.php"/>"#;
    write_response(&mut engine, init_doc).await;

    let received_init = ide_task.await.unwrap();
    assert_eq!(received_init, init_doc);

    let response = read_response(&mut engine).await;
    assert!(response.contains("step_into"));
    shutdown.cancel();
}

#[tokio::test]
async fn s4_stop_terminator_ends_the_splice() {
    let proxy = Arc::new(Registry::new());
    let cloud = Arc::new(Registry::new_force_replace());
    let shutdown = CancellationToken::new();

    let fake_ide = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let fake_ide_port = fake_ide.local_addr().unwrap().port();

    spawn_ide_listener("127.0.0.1:19104", proxy.clone(), cloud, shutdown.clone());
    spawn_engine_listener("127.0.0.1:19204", proxy.clone(), shutdown.clone());
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut registrar = TcpStream::connect("127.0.0.1:19104").await.unwrap();
    write_command(
        &mut registrar,
        &format!("proxyinit -i 1 -k KEY1 -p {fake_ide_port}"),
    )
    .await;
    read_response(&mut registrar).await;

    tokio::spawn(async move {
        let (mut sock, _) = fake_ide.accept().await.unwrap();
        let mut digits = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            sock.read_exact(&mut byte).await.unwrap();
            if byte[0] == 0 {
                break;
            }
            digits.push(byte[0]);
        }
        let len: usize = String::from_utf8(digits).unwrap().parse().unwrap();
        let mut init_payload = vec![0u8; len];
        sock.read_exact(&mut init_payload).await.unwrap();
        sock.read_exact(&mut byte).await.unwrap();
        write_response(&mut sock, r#"<response command="stop" status="stopping"/>"#).await;
    });

    let mut engine = TcpStream::connect("127.0.0.1:19204").await.unwrap();
    let init_doc = r#"<init xmlns="urn:debugger_protocol_v1" idekey="KEY1" fileuri="file:///tmp/a.php"/>"#;
    write_response(&mut engine, init_doc).await;

    let response = read_response(&mut engine).await;
    assert!(response.contains(r#"command="stop""#));

    // The splice should terminate; a further read should observe EOF rather
    // than hang, since the engine side is shut down on teardown.
    let mut buf = [0u8; 1];
    tokio::time::timeout(Duration::from_secs(5), engine.read(&mut buf))
        .await
        .expect("splice should have torn down instead of hanging")
        .unwrap();

    shutdown.cancel();
}

#[tokio::test]
async fn s5_proxystop_evicts_an_active_splice() {
    let proxy = Arc::new(Registry::new());
    let cloud = Arc::new(Registry::new_force_replace());
    let shutdown = CancellationToken::new();

    let fake_ide = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let fake_ide_port = fake_ide.local_addr().unwrap().port();

    spawn_ide_listener("127.0.0.1:19105", proxy.clone(), cloud, shutdown.clone());
    spawn_engine_listener("127.0.0.1:19205", proxy.clone(), shutdown.clone());
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut registrar = TcpStream::connect("127.0.0.1:19105").await.unwrap();
    write_command(
        &mut registrar,
        &format!("proxyinit -i 1 -k KEY1 -p {fake_ide_port}"),
    )
    .await;
    read_response(&mut registrar).await;

    // Fake IDE accepts the forwarded init and then just holds the
    // connection open, never replying — the splice only ends if the
    // registry's eviction signal reaches it.
    let ide_task = tokio::spawn(async move {
        let (mut sock, _) = fake_ide.accept().await.unwrap();
        let mut digits = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            sock.read_exact(&mut byte).await.unwrap();
            if byte[0] == 0 {
                break;
            }
            digits.push(byte[0]);
        }
        let len: usize = String::from_utf8(digits).unwrap().parse().unwrap();
        let mut init_payload = vec![0u8; len];
        sock.read_exact(&mut init_payload).await.unwrap();
        sock.read_exact(&mut byte).await.unwrap();
        sock
    });

    let mut engine = TcpStream::connect("127.0.0.1:19205").await.unwrap();
    let init_doc = r#"<init xmlns="urn:debugger_protocol_v1" idekey="KEY1" fileuri="file:///tmp/a.php"/>"#;
    write_response(&mut engine, init_doc).await;
    let _fake_ide_sock = ide_task.await.unwrap();

    // Give the splice a moment to actually be in its claimed, spliced state
    // before evicting it from under itself.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut evictor = TcpStream::connect("127.0.0.1:19105").await.unwrap();
    write_command(&mut evictor, "proxystop -i 3 -k KEY1").await;
    let reply = read_response(&mut evictor).await;
    assert!(reply.contains(r#"success="1""#));

    assert!(proxy.find("KEY1").is_err());

    // The engine side must be torn down as a result of the eviction rather
    // than left hanging.
    let mut buf = [0u8; 1];
    tokio::time::timeout(Duration::from_secs(5), engine.read(&mut buf))
        .await
        .expect("eviction should have torn down the splice instead of hanging")
        .unwrap();

    shutdown.cancel();
}

#[tokio::test]
async fn s6_cloud_userid_routes_via_xdebug_prefix() {
    // Mirrors what a successful `cloudinit -u USER` registers, without
    // standing up the full TLS cloud client: a cloud-multiplexed entry
    // keyed by the bare user id.
    let proxy = Arc::new(Registry::new());
    let shutdown = CancellationToken::new();

    let fake_ide = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let fake_ide_port = fake_ide.local_addr().unwrap().port();

    proxy
        .add(
            "USER",
            "127.0.0.1".into(),
            fake_ide_port,
            false,
            EndpointKind::CloudMultiplexed,
        )
        .unwrap();

    spawn_engine_listener("127.0.0.1:19206", proxy.clone(), shutdown.clone());
    tokio::time::sleep(Duration::from_millis(50)).await;

    let ide_task = tokio::spawn(async move {
        let (mut sock, _) = fake_ide.accept().await.unwrap();
        let mut digits = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            sock.read_exact(&mut byte).await.unwrap();
            if byte[0] == 0 {
                break;
            }
            digits.push(byte[0]);
        }
        let len: usize = String::from_utf8(digits).unwrap().parse().unwrap();
        let mut init_payload = vec![0u8; len];
        sock.read_exact(&mut init_payload).await.unwrap();
        sock.read_exact(&mut byte).await.unwrap();
        write_response(&mut sock, r#"<response command="step_into" status="break"/>"#).await;
        String::from_utf8(init_payload).unwrap()
    });

    let mut engine = TcpStream::connect("127.0.0.1:19206").await.unwrap();
    // The real wire shape: the cloud userid is carried as `xdebug:userid`,
    // not a bare `userid` attribute.
    let init_doc = r#"<init xmlns="urn:debugger_protocol_v1" xmlns:xdebug="https://xdebug.org/dbgp/xdebug" xdebug:userid="USER" fileuri="file:///tmp/a.php"/>"#;
    write_response(&mut engine, init_doc).await;

    let received_init = ide_task.await.unwrap();
    assert_eq!(received_init, init_doc);

    let response = read_response(&mut engine).await;
    assert!(response.contains("step_into"));

    shutdown.cancel();
}
