//! Acceptance state machine tests: command classification, auth token
//! handling and the happy-path session flow.


use std::time::Duration;

use rfc2217_proxy::Config;
use test_helpers::*;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

#[tokio::test]
async fn test_happy_path_no_auth() {
    let proxy = spawn_proxy(Config::default()).await;

    // Device registers and stays connected
    let mut device = register_device(proxy.addr, "dev1").await;
    wait_for("device registration", || proxy.registry.count() == 1).await;

    // Client connects to the device; the device hears nothing about it
    let mut client = connect_client(proxy.addr, "dev1").await;
    wait_for("session creation", || proxy.sessions.count() == 1).await;

    // Bytes pass through the bridge exactly, in both directions
    client.write_all(&[0x48, 0x65, 0x6C, 0x6C, 0x6F]).await.expect("client write");
    let mut buf = [0u8; 5];
    device.read_exact(&mut buf).await.expect("device read");
    assert_eq!(&buf, b"Hello");

    device.write_all(&[0x57, 0x6F, 0x72, 0x6C, 0x64]).await.expect("device write");
    let mut buf = [0u8; 5];
    client.read_exact(&mut buf).await.expect("client read");
    assert_eq!(&buf, b"World");

    let session = proxy.sessions.list().pop().expect("session");
    wait_for("byte counters", || {
        session.bytes_in() == 5 && session.bytes_out() == 5
    })
    .await;

    // After both sides close, no device and no session remain
    drop(client);
    drop(device);
    wait_for("session teardown", || proxy.sessions.count() == 0).await;
    wait_for("device teardown", || proxy.registry.count() == 0).await;
}

#[tokio::test]
async fn test_unknown_command_rejected() {
    let proxy = spawn_proxy(Config::default()).await;

    let mut stream = TcpStream::connect(proxy.addr).await.expect("connect");
    stream.write_all(b"ATH0\r\n").await.expect("write");

    expect_reply(&mut stream, b"ERROR\r\n").await;
    let rest = read_until_close(&mut stream).await;
    assert!(rest.is_empty(), "nothing after ERROR");
}

#[tokio::test]
async fn test_init_timeout_sends_error() {
    let cfg = Config {
        init_timeout: Duration::from_millis(200),
        ..Config::default()
    };
    let proxy = spawn_proxy(cfg).await;

    // Say nothing and wait out the deadline
    let mut stream = TcpStream::connect(proxy.addr).await.expect("connect");
    expect_reply(&mut stream, b"ERROR\r\n").await;
    read_until_close(&mut stream).await;
}

#[tokio::test]
async fn test_dial_prefix_extends_deadline() {
    let cfg = Config {
        init_timeout: Duration::from_millis(300),
        post_connect_timeout: Duration::from_secs(5),
        ..Config::default()
    };
    let proxy = spawn_proxy(cfg).await;
    let _device = register_device(proxy.addr, "dev1").await;

    let mut client = TcpStream::connect(proxy.addr).await.expect("connect");
    client.write_all(b"ATDT\r\n").await.expect("write dial");
    expect_reply(&mut client, b"OK\r\n").await;

    // Wait past the init deadline; the dial moved us to the longer one
    tokio::time::sleep(Duration::from_millis(600)).await;

    client
        .write_all(b"AT+CONNECT=dev1\r\n")
        .await
        .expect("write connect");
    expect_reply(&mut client, b"OK\r\n").await;
}

#[tokio::test]
async fn test_auth_token_accepted() {
    let cfg = Config {
        auth_token: "s3cret".to_string(),
        ..Config::default()
    };
    let proxy = spawn_proxy(cfg).await;

    let _device = register_device(proxy.addr, "s3cret+dev1").await;
    wait_for("device registration", || proxy.registry.count() == 1).await;

    let _client = connect_client(proxy.addr, "s3cret+dev1").await;
    wait_for("session creation", || proxy.sessions.count() == 1).await;
}

#[tokio::test]
async fn test_auth_token_mismatch_rejected() {
    let cfg = Config {
        auth_token: "s3cret".to_string(),
        ..Config::default()
    };
    let proxy = spawn_proxy(cfg).await;

    let mut stream = TcpStream::connect(proxy.addr).await.expect("connect");
    stream
        .write_all(b"AT+REG=wrong+dev1\r\n")
        .await
        .expect("write");
    expect_reply(&mut stream, b"ERROR\r\n").await;
    assert_eq!(proxy.registry.count(), 0);
}

#[tokio::test]
async fn test_auth_token_without_separator_rejected() {
    let cfg = Config {
        auth_token: "s3cret".to_string(),
        ..Config::default()
    };
    let proxy = spawn_proxy(cfg).await;

    let mut stream = TcpStream::connect(proxy.addr).await.expect("connect");
    stream.write_all(b"AT+REG=dev1\r\n").await.expect("write");
    expect_reply(&mut stream, b"ERROR\r\n").await;
}

#[tokio::test]
async fn test_empty_device_id_rejected() {
    let cfg = Config {
        auth_token: "s3cret".to_string(),
        ..Config::default()
    };
    let proxy = spawn_proxy(cfg).await;

    let mut stream = TcpStream::connect(proxy.addr).await.expect("connect");
    stream.write_all(b"AT+REG=s3cret+\r\n").await.expect("write");
    expect_reply(&mut stream, b"ERROR\r\n").await;
}

#[tokio::test]
async fn test_connect_to_unknown_device_rejected() {
    let proxy = spawn_proxy(Config::default()).await;

    let mut stream = TcpStream::connect(proxy.addr).await.expect("connect");
    stream
        .write_all(b"AT+CONNECT=ghost\r\n")
        .await
        .expect("write");
    expect_reply(&mut stream, b"ERROR\r\n").await;
    read_until_close(&mut stream).await;
    assert_eq!(proxy.sessions.count(), 0);
}

#[tokio::test]
async fn test_device_dial_after_registration_gets_ok() {
    let proxy = spawn_proxy(Config::default()).await;

    let mut device = register_device(proxy.addr, "dev1").await;
    device.write_all(b"ATDT\r\n").await.expect("write dial");
    expect_reply(&mut device, b"OK\r\n").await;

    // The device is still registered and reachable afterwards
    wait_for("device registration", || proxy.registry.count() == 1).await;
    let _client = connect_client(proxy.addr, "dev1").await;
}
