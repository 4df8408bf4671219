mod common;

use std::net::TcpListener;

use common::*;
use gensio::{Accepter, ControlDepth, ControlKey, Env, Error, Gensio};

#[test]
fn test_tcp_accept_and_addresses() {
    init_tracing();
    let env = Env::new();
    let acc_h = AccHandler::new();
    let (acc, port) = tcp_accepter(&env, "", acc_h.clone());
    assert!(acc.is_listening());
    assert_eq!(
        acc.control(true, ControlKey::Laddr, "").unwrap(),
        format!("ipv4,127.0.0.1,{}", port)
    );

    let client_h = Handler::new();
    let client = Gensio::new(&env, &format!("tcp,127.0.0.1,{}", port), client_h.clone()).unwrap();
    client.open_s(WAIT).unwrap();
    client.read_cb_enable(true);
    assert_eq!(client.raddr().unwrap(), format!("ipv4,127.0.0.1,{}", port));

    let server = acc_h.wait_conn().unwrap();
    assert!(server.raddr().unwrap().starts_with("ipv4,127.0.0.1,"));

    check_transfer(&client, &acc_h.conn_handler, b"hello");
    check_transfer(&server, &client_h, b"world");

    server.close_s(WAIT).unwrap();
    assert!(client_h.wait_error().unwrap().is_peer_unreachable());
    client.close_s(WAIT).unwrap();
    acc.shutdown_s(WAIT).unwrap();
    assert!(!acc.is_listening());
}

#[test]
fn test_connection_refused() {
    let port = {
        let l = TcpListener::bind("127.0.0.1:0").unwrap();
        l.local_addr().unwrap().port()
    };
    let env = Env::new();
    let io = Gensio::new(&env, &format!("tcp,127.0.0.1,{}", port), Handler::new()).unwrap();
    let err = io.open_s(WAIT).unwrap_err();
    assert!(err.is_peer_unreachable(), "{}", err);
    // A failed open leaves the gensio closed and reusable.
    assert!(io.open_s(WAIT).is_err());
}

#[test]
fn test_telnet_over_tcp() {
    let env = Env::new();
    let acc_h = AccHandler::new();
    let (acc, port) = tcp_accepter(&env, "telnet,", acc_h.clone());
    let client_h = Handler::new();
    let spec = format!("telnet,tcp,127.0.0.1,{}", port);
    let client = Gensio::new(&env, &spec, client_h.clone()).unwrap();
    client.open_s(WAIT).unwrap();
    client.read_cb_enable(true);
    let server = acc_h.wait_conn().unwrap();

    check_transfer(&client, &acc_h.conn_handler, b"line one\r\n");
    check_transfer(&server, &client_h, b"\xff escaped \xff");

    client.close_s(WAIT).unwrap();
    server.close_s(WAIT).unwrap();
    acc.shutdown_s(WAIT).unwrap();
}

#[test]
fn test_ssl_peer_certificate() {
    init_tracing();
    let env = cert_env();
    let acc_h = AccHandler::new();
    let (acc, port) = tcp_accepter(&env, "ssl(cert=server,key=server),", acc_h.clone());

    let client_h = Handler::new();
    let spec = format!("ssl(CA=ca),tcp,127.0.0.1,{}", port);
    let client = Gensio::new(&env, &spec, client_h.clone()).unwrap();
    client.open_s(WAIT).unwrap();
    client.read_cb_enable(true);
    assert_eq!(
        client
            .control(ControlDepth::First, true, ControlKey::GetPeerCertName, "-1,CN")
            .unwrap(),
        "1,CN,ser2net.org"
    );
    let fp = client
        .control(ControlDepth::First, true, ControlKey::CertFingerprint, "")
        .unwrap();
    assert_eq!(fp.split(':').count(), 32);

    let server = acc_h.wait_conn().unwrap();
    check_transfer(&client, &acc_h.conn_handler, b"secret");
    check_transfer(&server, &client_h, b"reply");

    client.close_s(WAIT).unwrap();
    assert!(acc_h.conn_handler.wait_error().unwrap().is_peer_unreachable());
    server.close_s(WAIT).unwrap();
    acc.shutdown_s(WAIT).unwrap();
}

#[test]
fn test_ssl_untrusted_server() {
    let env = cert_env();
    let acc_h = AccHandler::new();
    let (acc, port) = tcp_accepter(&env, "ssl(cert=server,key=server),", acc_h.clone());
    // The client's own CA did not issue the server certificate.
    let spec = format!("ssl(CA=clientcert),tcp,127.0.0.1,{}", port);
    let client = Gensio::new(&env, &spec, Handler::new()).unwrap();
    let err = client.open_s(WAIT).unwrap_err();
    assert!(err.is_peer_unreachable(), "{}", err);
    acc.shutdown_s(WAIT).unwrap();
}

#[test]
fn test_ssl_clientauth_requires_cert() {
    init_tracing();
    let env = cert_env();
    let acc_h = AccHandler::new();
    let (acc, port) = tcp_accepter(
        &env,
        "ssl(cert=server,key=server,clientauth=true,CA=clientcert),",
        acc_h.clone(),
    );

    let spec = format!("ssl(CA=ca),tcp,127.0.0.1,{}", port);
    let client = Gensio::new(&env, &spec, Handler::new()).unwrap();
    let err = client.open_s(WAIT).unwrap_err();
    assert!(err.is_peer_unreachable(), "{}", err);
    assert!(acc_h.wait_log().is_some());
    assert!(acc_h.conns.lock().unwrap().is_empty());

    // With a trusted client certificate it goes through.
    let spec = format!("ssl(CA=ca,cert=client,key=client),tcp,127.0.0.1,{}", port);
    let client = Gensio::new(&env, &spec, Handler::new()).unwrap();
    client.open_s(WAIT).unwrap();
    let server = acc_h.wait_conn().unwrap();
    assert_eq!(
        server
            .control(ControlDepth::First, true, ControlKey::GetPeerCertName, "-1,CN")
            .unwrap(),
        "0,CN,gensio.org"
    );
    client.close_s(WAIT).unwrap();
    server.close_s(WAIT).unwrap();
    acc.shutdown_s(WAIT).unwrap();
}

#[test]
fn test_mem_accepter_and_str_to_gensio() {
    let env = Env::new();
    let acc_h = AccHandler::new();
    let acc = Accepter::new(&env, "msgdelim,mem,acc-test", acc_h.clone()).unwrap();
    acc.startup().unwrap();
    assert_eq!(acc.control(true, ControlKey::Laddr, "").unwrap(), "mem,acc-test");

    // A spec naming only a transport gets the accepter's layers.
    let client_h = Handler::new();
    let client = acc.str_to_gensio("mem,acc-test", client_h.clone()).unwrap();
    client.open_s(WAIT).unwrap();
    client.read_cb_enable(true);
    let server = acc_h.wait_conn().unwrap();
    check_transfer(&client, &acc_h.conn_handler, b"framed");
    check_transfer(&server, &client_h, b"framed back");
    client.close_s(WAIT).unwrap();
    server.close_s(WAIT).unwrap();

    acc.shutdown_s(WAIT).unwrap();
    let late = Gensio::new(&env, "mem,acc-test", Handler::new()).unwrap();
    assert_eq!(late.open_s(WAIT), Err(Error::CommError));

    // Restartable after shutdown.
    acc.startup().unwrap();
    assert!(acc.is_listening());
    acc.shutdown_s(WAIT).unwrap();
}
