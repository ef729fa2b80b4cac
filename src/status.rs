//! Out-of-band status page for operators: one JSON document over HTTP/1.0.

use crate::world::Weather;
use serde::{Deserialize, Serialize};
use std::io::{self, Read, Write};
use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub pulse: u64,
    pub uptime: u64,
    pub connections: usize,
    pub players: usize,
    pub active: usize,
    pub pending_children: usize,
    pub in_bytes: u64,
    pub out_bytes: u64,
    pub hour: u8,
    pub weather: Weather,
}

/// Status clients held open at once. Further ones wait in the listen backlog.
const MAX_WAITING: usize = 8;
/// Passes a status client may take to send its request and read the answer.
const MAX_AGE: u32 = 50;

#[derive(Debug)]
struct Waiting {
    stream: TcpStream,
    addr: SocketAddr,
    request: Vec<u8>,
    response: Option<Vec<u8>>,
    age: u32,
}
impl Waiting {
    /// Reads what has arrived. True once the request is complete or the peer stopped sending.
    fn read_request(&mut self) -> io::Result<bool> {
        let mut buf = [0; 1024];
        loop {
            match self.stream.read(&mut buf) {
                Ok(0) => return Ok(true),
                Ok(n) => {
                    self.request.extend_from_slice(&buf[..n]);
                    if self.request.windows(4).any(|w| w == b"\r\n\r\n") || self.request.windows(2).any(|w| w == b"\n\n") {
                        return Ok(true);
                    }
                    if self.request.len() > 8 * 1024 {
                        return Err(io::Error::new(io::ErrorKind::InvalidData, "request too large"));
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }
    /// Sends what it can of the response. True once all of it is out.
    fn write_response(&mut self) -> io::Result<bool> {
        let Some(response) = &mut self.response else { return Ok(false) };
        while !response.is_empty() {
            match self.stream.write(response) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    response.drain(..n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }
}

/// Never blocks: clients are held non-blocking across passes until answered or too old.
#[derive(Debug)]
pub struct StatusEndpoint {
    listener: TcpListener,
    waiting: Vec<Waiting>,
}
impl StatusEndpoint {
    pub fn bind(port: u16) -> io::Result<Self> {
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, port))?;
        listener.set_nonblocking(true)?;
        Ok(Self { listener, waiting: vec![] })
    }
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }
    /// Clients connected and not yet done with.
    pub fn waiting(&self) -> usize {
        self.waiting.len()
    }

    /// Answers at most one complete request. True if one was answered.
    pub fn service(&mut self, status: impl FnOnce() -> Status) -> bool {
        self.accept();
        let mut status = Some(status);
        let mut answered = false;
        self.waiting.retain_mut(|client| {
            client.age += 1;
            let step = (|| -> io::Result<bool> {
                if client.response.is_none() {
                    if answered || !client.read_request()? {
                        return Ok(false);
                    }
                    let Some(status) = status.take() else { return Ok(false) };
                    let body = serde_json::to_string(&status()).map_err(io::Error::from)?;
                    client.response = Some(
                        format!(
                            "HTTP/1.0 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                            body.len()
                        )
                        .into_bytes(),
                    );
                    answered = true;
                }
                client.write_response()
            })();
            match step {
                Ok(true) => false,
                Ok(false) if client.age > MAX_AGE => {
                    log::debug!("dropping status client {} after {MAX_AGE} passes", client.addr);
                    false
                }
                Ok(false) => true,
                Err(e) => {
                    log::debug!("status request from {} failed: {e}", client.addr);
                    false
                }
            }
        });
        answered
    }
    fn accept(&mut self) {
        while self.waiting.len() < MAX_WAITING {
            match self.listener.accept() {
                Ok((stream, addr)) => {
                    if let Err(e) = stream.set_nonblocking(true) {
                        log::debug!("status client {addr}: {e}");
                        continue;
                    }
                    self.waiting.push(Waiting {
                        stream,
                        addr,
                        request: vec![],
                        response: None,
                        age: 0,
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    log::debug!("status accept failed: {e}");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn status() -> Status {
        Status {
            pulse: 7,
            uptime: 1,
            connections: 2,
            players: 1,
            active: 0,
            pending_children: 0,
            in_bytes: 3,
            out_bytes: 4,
            hour: 8,
            weather: Weather::Clear,
        }
    }

    fn serve_until(endpoint: &mut StatusEndpoint, mut done: impl FnMut(&StatusEndpoint, usize) -> bool) -> usize {
        let mut answered = 0;
        for _ in 0..200 {
            answered += usize::from(endpoint.service(status));
            if done(endpoint, answered) {
                return answered;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        panic!("status endpoint never settled");
    }

    #[test]
    fn one_request_per_call() {
        let mut endpoint = StatusEndpoint::bind(0).unwrap();
        let port = endpoint.local_addr().unwrap().port();
        assert!(!endpoint.service(status));

        let mut first = TcpStream::connect((Ipv4Addr::LOCALHOST, port)).unwrap();
        let mut second = TcpStream::connect((Ipv4Addr::LOCALHOST, port)).unwrap();
        first.write_all(b"GET / HTTP/1.0\r\n\r\n").unwrap();
        second.write_all(b"GET / HTTP/1.0\r\n\r\n").unwrap();
        // one answer per call, so two requests need two calls
        serve_until(&mut endpoint, |_, answered| answered == 2);
        serve_until(&mut endpoint, |e, _| e.waiting() == 0);

        for client in [&mut first, &mut second] {
            let mut response = String::new();
            client.read_to_string(&mut response).unwrap();
            assert!(response.starts_with("HTTP/1.0 200 OK\r\n"));
            let body = response.split("\r\n\r\n").nth(1).unwrap();
            assert_eq!(serde_json::from_str::<Status>(body).unwrap(), status());
        }
    }

    #[test]
    fn silent_clients_do_not_hold_up_the_caller() {
        let mut endpoint = StatusEndpoint::bind(0).unwrap();
        let port = endpoint.local_addr().unwrap().port();
        let mut silent = TcpStream::connect((Ipv4Addr::LOCALHOST, port)).unwrap();
        serve_until(&mut endpoint, |e, _| e.waiting() == 1);

        let started = std::time::Instant::now();
        assert!(!endpoint.service(status));
        assert!(started.elapsed() < Duration::from_millis(10));

        for _ in 0..MAX_AGE {
            endpoint.service(status);
        }
        assert_eq!(endpoint.waiting(), 0);
        let mut rest = vec![];
        silent.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        assert_eq!(silent.read_to_end(&mut rest).unwrap(), 0);
    }
}
