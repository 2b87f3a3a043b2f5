//! In-process bridge simulators shared by the integration tests.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Write};
use std::net::{Ipv4Addr, TcpListener, UdpSocket};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use gpib_bridge::discovery::{
    decode_request, DiscoveryReply, IpAssignment, MacAddress, Uptime, Version,
};

const SETUP_PREFIXES: [&str; 4] = ["++mode", "++auto", "++read_tmo_ms", "++eos"];

/// What the simulated bridge sends back on `++read eoi`.
#[derive(Debug, Clone)]
pub enum Reply {
    /// Never answer, so the client read times out.
    Silent,
    /// Always answer with this text.
    Fixed(String),
    /// Answer with the currently selected address, e.g. `"addr=3\n"`.
    Address,
}

#[derive(Default)]
struct State {
    lines: Vec<String>,
    script: VecDeque<Option<String>>,
}

/// TCP control-channel simulator listening on a loopback port.
#[derive(Clone)]
pub struct FakeBridge {
    port: u16,
    state: Arc<Mutex<State>>,
    connections: Arc<AtomicUsize>,
}

impl FakeBridge {
    pub fn start(reply: Reply) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let bridge = Self {
            port,
            state: Arc::new(Mutex::new(State::default())),
            connections: Arc::new(AtomicUsize::new(0)),
        };

        let accept = bridge.clone();
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { break };
                accept.connections.fetch_add(1, Ordering::SeqCst);
                let handler = accept.clone();
                let reply = reply.clone();
                thread::spawn(move || handler.serve(stream, reply));
            }
        });

        bridge
    }

    fn serve(&self, stream: std::net::TcpStream, reply: Reply) {
        let mut writer = stream.try_clone().unwrap();
        let mut selected: Option<u8> = None;
        for line in BufReader::new(stream).lines() {
            let Ok(line) = line else { break };
            let scripted = {
                let mut state = self.state.lock().unwrap();
                state.lines.push(line.clone());
                if line == "++read eoi" {
                    state.script.pop_front()
                } else {
                    None
                }
            };

            if let Some(addr) = line.strip_prefix("++addr ") {
                selected = addr.trim().parse().ok();
            }
            if line != "++read eoi" {
                continue;
            }

            let answer = match scripted {
                Some(scripted) => scripted,
                None => match &reply {
                    Reply::Silent => None,
                    Reply::Fixed(text) => Some(text.clone()),
                    Reply::Address => Some(format!("addr={}\n", selected.unwrap_or(255))),
                },
            };
            if let Some(answer) = answer {
                if writer.write_all(answer.as_bytes()).is_err() {
                    break;
                }
            }
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Queue answers for the next `++read eoi` requests; `None` stays silent.
    pub fn script<I>(&self, replies: I)
    where
        I: IntoIterator<Item = Option<&'static str>>,
    {
        let mut state = self.state.lock().unwrap();
        state
            .script
            .extend(replies.into_iter().map(|r| r.map(str::to_string)));
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn lines(&self) -> Vec<String> {
        self.state.lock().unwrap().lines.clone()
    }

    /// Every received line except the setup sequence.
    pub fn traffic(&self) -> Vec<String> {
        self.lines()
            .into_iter()
            .filter(|line| !SETUP_PREFIXES.iter().any(|p| line.starts_with(p)))
            .collect()
    }

    pub fn read_requests(&self) -> usize {
        self.lines().iter().filter(|l| *l == "++read eoi").count()
    }

    /// Wait until at least `count` non-setup lines have arrived.
    pub fn wait_for_traffic(&self, count: usize) -> Vec<String> {
        wait_until(|| self.traffic().len() >= count);
        self.traffic()
    }

    /// Wait until at least `count` setup sequences have arrived.
    pub fn wait_for_setups(&self, count: usize) -> usize {
        wait_until(|| self.setups() >= count);
        self.setups()
    }

    pub fn setups(&self) -> usize {
        self.lines().iter().filter(|l| *l == "++mode 1").count()
    }
}

pub fn wait_until(mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while !done() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
}

/// A port nothing is listening on.
pub fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

pub fn sample_reply(mac: [u8; 6], ip: Ipv4Addr, name: &str) -> DiscoveryReply {
    DiscoveryReply {
        sequence: 0,
        hw_addr: MacAddress(mac),
        uptime: Uptime {
            days: 12,
            hours: 1,
            minutes: 2,
            seconds: 3,
        },
        mode: 1,
        alert: 0,
        ip_type: IpAssignment::Static,
        ip_addr: ip,
        netmask: Ipv4Addr::new(255, 255, 255, 0),
        gateway: Ipv4Addr::new(192, 168, 1, 1),
        app_version: Version([1, 6, 6, 0]),
        boot_version: Version([1, 0, 3, 0]),
        hw_version: Version([1, 0, 0, 0]),
        name: name.to_string(),
    }
}

/// NetFinder responder on a loopback UDP port.
///
/// Answers the first identify request it sees with the datagrams produced by
/// `respond`, which receives the request's sequence number.
pub fn spawn_responder<F>(respond: F) -> (u16, thread::JoinHandle<()>)
where
    F: FnOnce(u16) -> Vec<Vec<u8>> + Send + 'static,
{
    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    socket
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();
    let port = socket.local_addr().unwrap().port();

    let handle = thread::spawn(move || {
        let mut buf = [0u8; 64];
        let Ok((len, from)) = socket.recv_from(&mut buf) else {
            return;
        };
        let request = decode_request(&buf[..len]).unwrap();
        // Give the client time to release its send socket.
        thread::sleep(Duration::from_millis(20));
        for datagram in respond(request.sequence) {
            socket.send_to(&datagram, from).unwrap();
        }
    });

    (port, handle)
}
