use crate::prelude::*;
use super::telnet::{self, Event, Telnet, Telopts};
use flate2::{write::ZlibEncoder, Compression};
use std::collections::VecDeque;
use std::io::{Read, Write};
use std::net::IpAddr;
use std::os::fd::{AsRawFd, IntoRawFd, RawFd};

/// Unsent output a connection may pile up before it is dropped.
pub const MAX_PENDING_OUTPUT: usize = 1024 * 1024;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ConnState {
    /// Waiting for the reverse lookup of the peer address. Input is queued but not run.
    DnsLookup,
    Login,
    Playing,
    Disconnecting,
}

/// The world's handle for writing to one connection.
#[derive(Debug)]
pub struct Inbox<'a>(pub(super) &'a mut Connection);
impl Inbox<'_> {
    pub fn print(&mut self, text: &str) {
        self.0.write_text(text);
    }
    /// Writes `text` and marks it as a prompt.
    pub fn prompt(&mut self, text: &str) {
        self.0.write_text(text);
        let end = self.0.opts.prompt_end();
        self.0.queue(end);
    }
    pub fn disconnect(&mut self) {
        self.0.state = ConnState::Disconnecting;
    }
    pub fn player(&self) -> Option<CreatureId> {
        self.0.player
    }
    pub(crate) fn set_player(&mut self, player: Option<CreatureId>) {
        self.0.player = player;
    }
    pub fn reborrow(&mut self) -> Inbox<'_> {
        Inbox(self.0)
    }
}

pub struct Connection {
    conn: TcpStream,
    ip: IpAddr,
    hostname: String,
    state: ConnState,
    telnet: Telnet,
    opts: Telopts,
    commands: VecDeque<String>,
    pending_bytes: Vec<u8>,
    pending_byte_cursor: usize,
    compressor: Option<ZlibEncoder<Vec<u8>>>,
    player: Option<CreatureId>,
    idle_since: u64,

    pub(super) readable: bool,
    pub(super) waiting_for_write: bool,
    pub(super) registered: bool,
}
impl Connection {
    pub fn accept(conn: TcpStream, ip: IpAddr, now: u64) -> io::Result<Self> {
        conn.set_nonblocking(true)?;
        let mut connection = Self::adopt(conn, ip, now, Telopts::default());
        connection.queue(telnet::OFFER);
        Ok(connection)
    }
    /// Wraps a stream that already went through negotiation, i.e. one inherited across a reboot.
    pub fn restore(conn: TcpStream, ip: IpAddr, now: u64, opts: Telopts) -> io::Result<Self> {
        conn.set_nonblocking(true)?;
        let compress = opts.compress;
        let mut connection = Self::adopt(conn, ip, now, Telopts { compress: false, ..opts });
        if compress {
            connection.queue(&[telnet::IAC, telnet::WILL, telnet::COMPRESS2]);
        }
        Ok(connection)
    }
    fn adopt(conn: TcpStream, ip: IpAddr, now: u64, opts: Telopts) -> Self {
        Self {
            conn,
            ip,
            hostname: ip.to_string(),
            state: ConnState::Login,
            telnet: Telnet::new(),
            opts,
            commands: VecDeque::new(),
            pending_bytes: vec![],
            pending_byte_cursor: 0,
            compressor: None,
            player: None,
            idle_since: now,
            readable: false,
            waiting_for_write: false,
            registered: false,
        }
    }

    pub(super) fn conn(&self) -> &TcpStream {
        &self.conn
    }
    pub fn fd(&self) -> RawFd {
        self.conn.as_raw_fd()
    }
    pub(crate) fn into_raw_fd(self) -> RawFd {
        self.conn.into_raw_fd()
    }
    pub fn ip(&self) -> IpAddr {
        self.ip
    }
    pub fn hostname(&self) -> &str {
        &self.hostname
    }
    pub fn set_hostname(&mut self, hostname: impl Into<String>) {
        self.hostname = hostname.into();
    }
    pub fn state(&self) -> ConnState {
        self.state
    }
    pub fn set_state(&mut self, state: ConnState) {
        if self.state != state {
            log::trace!("{} {:?} -> {:?}", self.ip, self.state, state);
        }
        self.state = state;
    }
    pub fn is_disconnecting(&self) -> bool {
        self.state == ConnState::Disconnecting
    }
    pub fn telopts(&self) -> &Telopts {
        &self.opts
    }
    pub fn player(&self) -> Option<CreatureId> {
        self.player
    }
    pub fn set_player(&mut self, player: Option<CreatureId>) {
        self.player = player;
    }
    pub fn idle_since(&self) -> u64 {
        self.idle_since
    }
    pub fn inbox(&mut self) -> Inbox<'_> {
        Inbox(self)
    }

    pub fn has_command(&self) -> bool {
        !self.commands.is_empty()
    }
    pub fn queued_commands(&self) -> usize {
        self.commands.len()
    }
    pub(super) fn next_command(&mut self) -> Option<String> {
        self.commands.pop_front()
    }
    pub fn has_output(&self) -> bool {
        self.pending_byte_cursor < self.pending_bytes.len()
    }

    /// Runs bytes from the peer through the telnet layer, queueing complete lines as commands.
    pub fn receive(&mut self, bytes: &[u8], now: u64) {
        let mut events = vec![];
        self.telnet.feed(bytes, &mut self.opts, &mut events);
        for event in events {
            match event {
                Event::Line(line) => {
                    self.idle_since = now;
                    self.commands.push_back(line);
                }
                Event::Send(reply) => self.queue(&reply),
                Event::StartCompress => self.start_compress(),
                Event::StopCompress => self.end_compress(),
            }
        }
    }

    /// Reads everything available. Returns the byte count, or why the peer is gone.
    pub fn read(&mut self, scratch: &mut [u8], now: u64) -> Result<usize, Disconnection> {
        let mut total = 0;
        loop {
            match self.conn.read(scratch) {
                Ok(0) => return Err(Disconnection::new()),
                Ok(n) => {
                    total += n;
                    self.receive(&scratch[..n], now);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(total),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    log::debug!("read from {} failed: {e}", self.ip);
                    return Err(Disconnection::new());
                }
            }
        }
    }

    /// Pushes pending output to the socket. Leftovers wait for the next writable event.
    pub fn flush(&mut self) -> Result<usize, Disconnection> {
        let mut written = 0;
        while self.pending_byte_cursor < self.pending_bytes.len() {
            match self.conn.write(&self.pending_bytes[self.pending_byte_cursor..]) {
                Ok(0) => return Err(Disconnection::new()),
                Ok(n) => {
                    self.pending_byte_cursor += n;
                    written += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.waiting_for_write = true;
                    return Ok(written);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    log::debug!("write to {} failed: {e}", self.ip);
                    return Err(Disconnection::new());
                }
            }
        }
        self.pending_bytes.clear();
        self.pending_byte_cursor = 0;
        self.waiting_for_write = false;
        Ok(written)
    }

    pub(crate) fn write_text(&mut self, text: &str) {
        let mut raw = Vec::with_capacity(text.len() + 8);
        for b in text.bytes() {
            if b == b'\n' {
                raw.push(b'\r');
            }
            raw.push(b);
        }
        self.queue(&raw);
    }
    fn backlog(&self) -> usize {
        self.pending_bytes.len() - self.pending_byte_cursor
    }
    fn queue(&mut self, raw: &[u8]) {
        if self.backlog() > MAX_PENDING_OUTPUT {
            return;
        }
        match &mut self.compressor {
            Some(compressor) => {
                let result = compressor.write_all(raw).and_then(|()| compressor.flush());
                match result {
                    Ok(()) => self.pending_bytes.append(compressor.get_mut()),
                    Err(e) => log::warn!("compressing output for {} failed: {e}", self.ip),
                }
            }
            None => self.pending_bytes.extend_from_slice(raw),
        }
        if self.backlog() > MAX_PENDING_OUTPUT {
            log::warn!("{} is not reading its output, dropping it", self.ip);
            self.state = ConnState::Disconnecting;
        }
    }
    pub(crate) fn start_compress(&mut self) {
        if self.compressor.is_some() {
            return;
        }
        self.queue(telnet::START_COMPRESS);
        self.compressor = Some(ZlibEncoder::new(Vec::new(), Compression::default()));
        self.opts.compress = true;
        log::debug!("compression started for {}", self.ip);
    }
    /// Ends the zlib stream; the peer goes back to plain telnet.
    pub(crate) fn end_compress(&mut self) {
        if let Some(compressor) = self.compressor.take() {
            match compressor.finish() {
                Ok(mut tail) => self.pending_bytes.append(&mut tail),
                Err(e) => log::warn!("finishing compression for {} failed: {e}", self.ip),
            }
        }
        self.opts.compress = false;
    }
}
impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut fields = f.debug_struct("Connection");
        fields.field("ip", &self.ip);
        fields.field("hostname", &self.hostname);
        fields.field("state", &self.state);
        fields.field("queued", &self.commands.len());
        fields.finish()
    }
}
