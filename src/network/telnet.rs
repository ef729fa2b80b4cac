//! Telnet option negotiation and line framing.

use serde::{Deserialize, Serialize};

pub const IAC: u8 = 255;
pub const DONT: u8 = 254;
pub const DO: u8 = 253;
pub const WONT: u8 = 252;
pub const WILL: u8 = 251;
pub const SB: u8 = 250;
pub const GA: u8 = 249;
pub const SE: u8 = 240;
pub const EOR_MARK: u8 = 239;

pub const TTYPE: u8 = 24;
pub const EOR: u8 = 25;
pub const NAWS: u8 = 31;
pub const COMPRESS2: u8 = 86;

const TTYPE_IS: u8 = 0;
const TTYPE_SEND: u8 = 1;

/// Longest line kept; the rest of an overlong line is dropped.
pub const MAX_LINE: usize = 4096;

/// What the server asks for as soon as a client connects.
pub const OFFER: &[u8] = &[IAC, WILL, COMPRESS2, IAC, WILL, EOR, IAC, DO, NAWS, IAC, DO, TTYPE];
pub const START_COMPRESS: &[u8] = &[IAC, SB, COMPRESS2, IAC, SE];
const REQUEST_TTYPE: &[u8] = &[IAC, SB, TTYPE, TTYPE_SEND, IAC, SE];

/// Negotiated options of one connection. Survives a reboot through the manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Telopts {
    pub compress: bool,
    pub eor: bool,
    pub dumb: bool,
    pub term: String,
    pub cols: u16,
    pub rows: u16,
}
impl Default for Telopts {
    fn default() -> Self {
        Self {
            compress: false,
            eor: false,
            dumb: true,
            term: "dumb".to_owned(),
            cols: 82,
            rows: 40,
        }
    }
}
impl Telopts {
    /// Marks the end of a prompt so clients can tell it from partial output.
    pub fn prompt_end(&self) -> &'static [u8] {
        if self.eor {
            &[IAC, EOR_MARK]
        } else {
            &[IAC, GA]
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum Event {
    Line(String),
    Send(Vec<u8>),
    StartCompress,
    StopCompress,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Data,
    Iac,
    Option(u8),
    Sub,
    SubIac,
}

#[derive(Debug)]
pub struct Telnet {
    state: State,
    line: Vec<u8>,
    sub: Vec<u8>,
}
impl Default for Telnet {
    fn default() -> Self {
        Self::new()
    }
}
impl Telnet {
    pub fn new() -> Self {
        Self {
            state: State::Data,
            line: Vec::new(),
            sub: Vec::new(),
        }
    }
    /// Consumes raw socket bytes. Partial lines and sequences carry over to the next call.
    pub fn feed(&mut self, bytes: &[u8], opts: &mut Telopts, events: &mut Vec<Event>) {
        for &b in bytes {
            self.state = match (self.state, b) {
                (State::Data, IAC) => State::Iac,
                (State::Data, b'\n') => {
                    let line = String::from_utf8_lossy(&self.line).into_owned();
                    self.line.clear();
                    events.push(Event::Line(line));
                    State::Data
                }
                (State::Data, b'\r') => State::Data,
                (State::Data, 8 | 127) => {
                    self.line.pop();
                    State::Data
                }
                (State::Data, b) => {
                    self.push(b);
                    State::Data
                }
                (State::Iac, IAC) => {
                    self.push(IAC);
                    State::Data
                }
                (State::Iac, WILL | WONT | DO | DONT) => State::Option(b),
                (State::Iac, SB) => {
                    self.sub.clear();
                    State::Sub
                }
                (State::Iac, _) => State::Data,
                (State::Option(cmd), opt) => {
                    negotiate(cmd, opt, opts, events);
                    State::Data
                }
                (State::Sub, IAC) => State::SubIac,
                (State::Sub, b) => {
                    self.push_sub(b);
                    State::Sub
                }
                (State::SubIac, SE) => {
                    subnegotiate(&self.sub, opts);
                    State::Data
                }
                (State::SubIac, IAC) => {
                    self.push_sub(IAC);
                    State::Sub
                }
                (State::SubIac, _) => {
                    log::trace!("unterminated subnegotiation, dropping {} bytes", self.sub.len());
                    State::Data
                }
            };
        }
    }
    fn push(&mut self, b: u8) {
        if self.line.len() < MAX_LINE {
            self.line.push(b);
        }
    }
    fn push_sub(&mut self, b: u8) {
        if self.sub.len() < MAX_LINE {
            self.sub.push(b);
        }
    }
}

fn negotiate(cmd: u8, opt: u8, opts: &mut Telopts, events: &mut Vec<Event>) {
    match (cmd, opt) {
        (DO, COMPRESS2) if !opts.compress => events.push(Event::StartCompress),
        (DONT, COMPRESS2) if opts.compress => events.push(Event::StopCompress),
        (DO | DONT, COMPRESS2) => {}
        (DO, EOR) => opts.eor = true,
        (DONT, EOR) => opts.eor = false,
        (WILL, TTYPE) => events.push(Event::Send(REQUEST_TTYPE.to_vec())),
        (WILL | WONT, NAWS) | (WONT, TTYPE) => {}
        (DO, opt) => events.push(Event::Send(vec![IAC, WONT, opt])),
        (WILL, opt) => events.push(Event::Send(vec![IAC, DONT, opt])),
        (WONT | DONT, _) => {}
        _ => log::trace!("ignoring telnet command {cmd} {opt}"),
    }
}

fn subnegotiate(sub: &[u8], opts: &mut Telopts) {
    match sub {
        [NAWS, w1, w0, h1, h0] => {
            opts.cols = u16::from_be_bytes([*w1, *w0]);
            opts.rows = u16::from_be_bytes([*h1, *h0]);
        }
        [TTYPE, TTYPE_IS, name @ ..] if !name.is_empty() => {
            opts.term = String::from_utf8_lossy(name).to_ascii_lowercase();
            opts.dumb = false;
        }
        _ => log::trace!("unhandled subnegotiation {sub:?}"),
    }
}
