mod common;

use std::sync::Arc;
use std::thread;

use common::*;
use gensio::{Env, Gensio};
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};

const CLIENT: &str = "mux,relpkt,msgdelim,serialdev,/dev/ttyPipeA0,9600N81";
const SERVER: &str =
    "mux(mode=server),relpkt(mode=server),msgdelim,serialdev,/dev/ttyPipeB0,9600N81";

fn random_data(seed: u64, len: usize) -> Vec<u8> {
    let mut data = vec![0u8; len];
    StdRng::seed_from_u64(seed).fill_bytes(&mut data);
    data
}

#[test]
fn test_relpkt_bulk_both_ways() {
    init_tracing();
    let env = Env::new();

    let server_h = Handler::new();
    let server = Gensio::new(&env, SERVER, server_h.clone()).unwrap();
    let opened = gensio::Waiter::new();
    let w = opened.clone();
    server
        .open(move |_, r| {
            r.unwrap();
            w.wake();
        })
        .unwrap();

    let client_h = Handler::new();
    let client = Gensio::new(&env, CLIENT, client_h.clone()).unwrap();
    client.open_s(WAIT).unwrap();
    opened.wait(1, WAIT).unwrap();
    client.read_cb_enable(true);
    server.read_cb_enable(true);

    let up = Arc::new(random_data(1, 128 * 1024));
    let down = random_data(2, 128 * 1024);

    let writer = {
        let client = client.clone();
        let up = up.clone();
        thread::spawn(move || client.write_s(&up, WAIT))
    };
    server.write_s(&down, WAIT).unwrap();
    writer.join().unwrap().unwrap();

    assert_eq!(server_h.wait_data(up.len()), *up);
    assert_eq!(client_h.wait_data(down.len()), down);

    client.close_s(WAIT).unwrap();
    assert!(server_h.wait_error().unwrap().is_peer_unreachable());
    server.close_s(WAIT).unwrap();
}

#[test]
fn test_relpkt_open_times_out_without_peer() {
    let env = Env::new();
    let h = Handler::new();
    let io = Gensio::new(
        &env,
        "relpkt(timeout=300),msgdelim,serialdev,/dev/ttyPipeA3",
        h,
    )
    .unwrap();
    assert_eq!(io.open_s(WAIT), Err(gensio::Error::Timeout));
}

#[test]
fn test_large_packets_need_matching_msgdelim() {
    let env = Env::new();
    let small = "relpkt(max_pktsize=4096),msgdelim,serialdev,/dev/ttyPipeA5";
    assert!(matches!(
        Gensio::new(&env, small, Handler::new()),
        Err(gensio::Error::Config(_))
    ));

    let server_h = Handler::new();
    let server = Gensio::new(
        &env,
        "relpkt(mode=server,max_pktsize=4096),msgdelim(readbuf=8192),serialdev,/dev/ttyPipeB5",
        server_h.clone(),
    )
    .unwrap();
    let opened = gensio::Waiter::new();
    let w = opened.clone();
    server
        .open(move |_, r| {
            r.unwrap();
            w.wake();
        })
        .unwrap();
    let client = Gensio::new(
        &env,
        "relpkt(max_pktsize=4096),msgdelim(readbuf=8192),serialdev,/dev/ttyPipeA5",
        Handler::new(),
    )
    .unwrap();
    client.open_s(WAIT).unwrap();
    opened.wait(1, WAIT).unwrap();
    server.read_cb_enable(true);

    let data = random_data(3, 8192);
    client.write_s(&data, WAIT).unwrap();
    assert_eq!(server_h.wait_data(data.len()), data);
    client.close_s(WAIT).unwrap();
    server.close_s(WAIT).unwrap();
}
