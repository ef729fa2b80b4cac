//! The socket side of the reactor: listeners, connections and readiness.
//!
//! Registrations are oneshot. A fired source stays disarmed until
//! [`Network::process_output`] re-arms it at the end of the pass.

use crate::prelude::*;
use std::net::{Ipv4Addr, SocketAddr, TcpListener};
use std::os::fd::{AsRawFd, IntoRawFd, RawFd};

pub mod connection;
mod inboxes;
pub mod telnet;

pub use connection::{ConnState, Connection, Inbox};
pub use inboxes::Inboxes;

/// Poller keys at or above this belong to listeners; below it they are connection slots.
const LISTENER_BASE: usize = usize::MAX / 2;

#[derive(Debug)]
struct Listener {
    port: u16,
    socket: TcpListener,
    ready: bool,
}

#[derive(Debug)]
pub struct Network {
    listeners: Vec<Listener>,
    scratch_buffer: Vec<u8>,

    poller: polling::Poller,
    events: Vec<polling::Event>,

    connections: SlotMap<ConnKey, Connection>,
    max_connections: usize,
    in_bytes: u64,
    out_bytes: u64,
}

impl Network {
    pub fn new(max_connections: usize) -> io::Result<Self> {
        Ok(Self {
            listeners: vec![],
            scratch_buffer: vec![0; 64 * 1024],

            poller: polling::Poller::new()?,
            events: vec![],

            connections: SlotMap::new(),
            max_connections,
            in_bytes: 0,
            out_bytes: 0,
        })
    }

    /// Binds `port` on all interfaces. Port 0 picks a free one; the bound address is returned.
    pub fn add_listen_port(&mut self, port: u16) -> io::Result<SocketAddr> {
        let socket = TcpListener::bind((Ipv4Addr::UNSPECIFIED, port))?;
        self.add_listener(socket)
    }
    /// Starts accepting on an already bound socket, such as one inherited across a reboot.
    pub fn add_listener(&mut self, socket: TcpListener) -> io::Result<SocketAddr> {
        socket.set_nonblocking(true)?;
        let addr = socket.local_addr()?;
        let key = LISTENER_BASE + self.listeners.len();
        self.poller.add(&socket, polling::Event::readable(key))?;
        log::info!("listening on {addr}");
        self.listeners.push(Listener {
            port: addr.port(),
            socket,
            ready: false,
        });
        Ok(addr)
    }
    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }
    pub fn listener_fds(&self) -> Vec<(u16, RawFd)> {
        self.listeners.iter().map(|l| (l.port, l.socket.as_raw_fd())).collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
    pub fn keys(&self) -> Vec<ConnKey> {
        self.connections.keys()
    }
    pub fn iter(&self) -> impl Iterator<Item = (ConnKey, &Connection)> {
        self.connections.iter()
    }
    pub fn connection(&self, key: ConnKey) -> Option<&Connection> {
        self.connections.get(key)
    }
    pub fn connection_mut(&mut self, key: ConnKey) -> Option<&mut Connection> {
        self.connections.get_mut(key)
    }
    pub fn in_bytes(&self) -> u64 {
        self.in_bytes
    }
    pub fn out_bytes(&self) -> u64 {
        self.out_bytes
    }
    /// Carries traffic totals over from a previous image.
    pub fn set_counters(&mut self, in_bytes: u64, out_bytes: u64) {
        self.in_bytes = in_bytes;
        self.out_bytes = out_bytes;
    }

    /// Collects readiness without blocking.
    pub fn poll(&mut self) -> io::Result<()> {
        self.events.clear();
        match self.poller.wait(&mut self.events, Some(time::Duration::ZERO)) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e),
        }
        for event in self.events.drain(..) {
            if event.key >= LISTENER_BASE {
                if let Some(listener) = self.listeners.get_mut(event.key - LISTENER_BASE) {
                    listener.ready = true;
                }
                continue;
            }
            let Some(conn) = self.connections.key_at(event.key).and_then(|k| self.connections.get_mut(k)) else {
                log::debug!("readiness for closed slot {}", event.key);
                continue;
            };
            conn.readable |= event.readable;
        }
        Ok(())
    }

    /// Accepts everything pending on ready listeners. Over capacity, new peers are closed at once.
    pub fn accept(&mut self, now: u64) -> Vec<ConnKey> {
        let mut accepted = vec![];
        for i in 0..self.listeners.len() {
            if !core::mem::take(&mut self.listeners[i].ready) {
                continue;
            }
            loop {
                match self.listeners[i].socket.accept() {
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        log::warn!("accept on port {} failed: {e}", self.listeners[i].port);
                        break;
                    }
                    Ok((stream, addr)) => {
                        if self.connections.len() >= self.max_connections {
                            log::warn!("refusing {addr}: {} connections open", self.connections.len());
                            continue;
                        }
                        match Connection::accept(stream, addr.ip(), now).and_then(|c| self.register(c)) {
                            Ok(key) => {
                                log::debug!("{addr} connected as {key}");
                                accepted.push(key);
                            }
                            Err(e) => log::warn!("unable to set up connection from {addr}: {e}"),
                        }
                    }
                }
            }
            let listener = &self.listeners[i];
            if let Err(e) = self.poller.modify(&listener.socket, polling::Event::readable(LISTENER_BASE + i)) {
                log::error!("unable to rearm listener on port {}: {e}", listener.port);
            }
        }
        accepted
    }
    /// Adds a connection that did not come from [`Network::accept`].
    pub fn insert(&mut self, conn: Connection) -> io::Result<ConnKey> {
        self.register(conn)
    }
    fn register(&mut self, mut conn: Connection) -> io::Result<ConnKey> {
        let key = self.connections.next_key();
        self.poller.add(conn.conn(), polling::Event::readable(key.idx()))?;
        conn.registered = true;
        Ok(self.connections.insert(conn))
    }

    /// Reads from every connection that reported readable. Hangups are marked for cleanup.
    pub fn process_input(&mut self, now: u64) {
        let Network {
            connections,
            scratch_buffer,
            in_bytes,
            ..
        } = self;
        for (key, conn) in connections.iter_mut() {
            if !core::mem::take(&mut conn.readable) || conn.is_disconnecting() {
                continue;
            }
            match conn.read(scratch_buffer, now) {
                Ok(n) => *in_bytes += n as u64,
                Err(Disconnection(..)) => {
                    log::debug!("connection {key} hung up");
                    conn.set_state(ConnState::Disconnecting);
                }
            }
        }
    }
    /// The next queued line of a connection whose input is being run.
    pub fn take_command(&mut self, key: ConnKey) -> Option<(ConnState, String)> {
        let conn = self.connections.get_mut(key)?;
        match conn.state() {
            ConnState::DnsLookup | ConnState::Disconnecting => None,
            state => conn.next_command().map(|line| (state, line)),
        }
    }

    /// Flushes pending output and rearms every live registration.
    pub fn process_output(&mut self) {
        let Network {
            connections,
            poller,
            out_bytes,
            ..
        } = self;
        for (key, conn) in connections.iter_mut() {
            if conn.has_output() {
                match conn.flush() {
                    Ok(n) => *out_bytes += n as u64,
                    Err(Disconnection(..)) => conn.set_state(ConnState::Disconnecting),
                }
            }
            if !conn.registered || conn.is_disconnecting() {
                continue;
            }
            let interest = polling::Event {
                key: key.idx(),
                readable: true,
                writable: conn.waiting_for_write,
            };
            if let Err(e) = poller.modify(conn.conn(), interest) {
                log::warn!("unable to rearm connection {key}: {e}");
                conn.set_state(ConnState::Disconnecting);
            }
        }
    }

    pub fn mark_disconnecting(&mut self, key: ConnKey) {
        if let Some(conn) = self.connections.get_mut(key) {
            conn.set_state(ConnState::Disconnecting);
        }
    }
    pub fn disconnect_all(&mut self) {
        for (_, conn) in self.connections.iter_mut() {
            conn.set_state(ConnState::Disconnecting);
        }
    }

    /// Closes every connection marked disconnecting, after one last try at sending what it has.
    /// Returns the closed keys and the players that were on them.
    pub fn clean_up(&mut self) -> Vec<(ConnKey, Option<CreatureId>)> {
        let dead: Vec<ConnKey> = self
            .connections
            .iter()
            .filter(|(_, c)| c.is_disconnecting())
            .map(|(key, _)| key)
            .collect();
        let mut closed = Vec::with_capacity(dead.len());
        for key in dead {
            let Some(mut conn) = self.connections.release(key) else { continue };
            if conn.has_output() {
                if let Ok(n) = conn.flush() {
                    self.out_bytes += n as u64;
                }
            }
            if conn.registered {
                if let Err(e) = self.poller.delete(conn.conn()) {
                    log::debug!("deregistering connection {key}: {e}");
                }
            }
            log::info!("closing connection {key} from {}", conn.hostname());
            closed.push((key, conn.player()));
        }
        closed
    }

    /// Gives up ownership of every socket without closing it, for a new image to pick up.
    pub fn into_raw_fds(mut self) -> (Vec<RawFd>, Vec<RawFd>) {
        let listeners = core::mem::take(&mut self.listeners)
            .into_iter()
            .map(|l| l.socket.into_raw_fd())
            .collect();
        let connections = self
            .connections
            .keys()
            .into_iter()
            .filter_map(|key| self.connections.release(key))
            .map(Connection::into_raw_fd)
            .collect();
        (listeners, connections)
    }
}
