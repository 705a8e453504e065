//! Packet layer of the remote-debug wire protocol: `$payload#checksum`
//! framing with `+`/`-` acks (until no-ack mode is negotiated), request
//! parsing into a typed enum, and reply formatting helpers.

use crate::gdb_register::GdbRegisterValue;
use libc::pid_t;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};

/// Z/z packet kinds, by wire number.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum BreakpointKind {
    Software = 0,
    Hardware = 1,
    WriteWatch = 2,
    ReadWatch = 3,
    AccessWatch = 4,
}

impl BreakpointKind {
    fn from_wire(v: u32) -> Option<BreakpointKind> {
        Some(match v {
            0 => BreakpointKind::Software,
            1 => BreakpointKind::Hardware,
            2 => BreakpointKind::WriteWatch,
            3 => BreakpointKind::ReadWatch,
            4 => BreakpointKind::AccessWatch,
            _ => return None,
        })
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ResumeAction {
    Continue,
    Step,
    ContinueWithSignal(i32),
    StepWithSignal(i32),
}

#[derive(Clone, Debug)]
pub enum GdbRequest {
    None,
    Interrupt,
    GetRegs,
    SetRegs(Vec<u8>),
    GetReg(usize),
    SetReg(usize, u64),
    GetMem {
        addr: usize,
        len: usize,
    },
    SetMem {
        addr: usize,
        bytes: Vec<u8>,
    },
    SearchMem {
        addr: usize,
        len: usize,
        needle: Vec<u8>,
    },
    SetBreakpoint {
        kind: BreakpointKind,
        addr: usize,
        len: usize,
        conditions: Vec<Vec<u8>>,
    },
    RemoveBreakpoint {
        kind: BreakpointKind,
        addr: usize,
        len: usize,
    },
    Resume {
        action: ResumeAction,
        reverse: bool,
    },
    QueryThreadList,
    GetCurrentThread,
    SetQueryThread(pid_t),
    SetResumeThread(pid_t),
    ThreadAlive(pid_t),
    GetStopReason,
    Detach,
    Kill,
    Restart {
        /// Empty = previous target; else an event number or checkpoint
        /// name from the restart argument.
        param: String,
    },
    /// The engine's custom command channel.
    EngineCmd(String),
    /// qXfer siginfo read: the marker the client emits before running
    /// divergent code; enters/refs a diversion session.
    ReadSiginfo,
    WriteSiginfo,
    /// Anything unrecognised; reply empty per protocol.
    Unsupported,
}

pub struct GdbConnection {
    sock: TcpStream,
    inbuf: Vec<u8>,
    no_ack: bool,
    alive: bool,
    /// Thread the client believes is current, as a recorded tid.
    pub query_thread: pid_t,
    pub resume_thread: pid_t,
}

fn to_hex(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        s.push_str(&format!("{:02x}", b));
    }
    s
}

fn from_hex(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    let mut out = Vec::with_capacity(s.len() / 2);
    let bytes = s.as_bytes();
    for i in (0..s.len()).step_by(2) {
        let hi = (bytes[i] as char).to_digit(16)?;
        let lo = (bytes[i + 1] as char).to_digit(16)?;
        out.push(((hi << 4) | lo) as u8);
    }
    Some(out)
}

fn checksum(payload: &[u8]) -> u8 {
    payload.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

impl GdbConnection {
    /// Listen on 127.0.0.1, probing ports from `port_seed` upward when the
    /// seed is taken, and accept one client. Returns the connection and
    /// the port actually used.
    pub fn await_client(port_seed: u16, probe: bool) -> (GdbConnection, u16) {
        let mut port = port_seed;
        let listener = loop {
            match TcpListener::bind(("127.0.0.1", port)) {
                Ok(l) => break l,
                Err(e) => {
                    if !probe || port.checked_add(1).is_none() {
                        clean_fatal!("Couldn't bind debugger port {}: {}", port, e);
                    }
                    port += 1;
                }
            }
        };
        eprintln!("Launch the debugger client and connect to 127.0.0.1:{}.", port);
        let (sock, _addr) = match listener.accept() {
            Ok(pair) => pair,
            Err(e) => clean_fatal!("accept() on debugger socket failed: {}", e),
        };
        sock.set_nodelay(true).ok();
        (
            GdbConnection {
                sock,
                inbuf: Vec::new(),
                no_ack: false,
                alive: true,
                query_thread: 0,
                resume_thread: 0,
            },
            port,
        )
    }

    pub fn connection_alive(&self) -> bool {
        self.alive
    }

    // --- raw packet I/O ---

    fn fill(&mut self) -> bool {
        let mut buf = [0u8; 4096];
        match self.sock.read(&mut buf) {
            Ok(0) => {
                self.alive = false;
                false
            }
            Ok(n) => {
                self.inbuf.extend_from_slice(&buf[..n]);
                true
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => true,
            Err(_) => {
                self.alive = false;
                false
            }
        }
    }

    fn send_raw(&mut self, bytes: &[u8]) {
        if self.sock.write_all(bytes).is_err() {
            self.alive = false;
        }
    }

    /// Frame and send one reply packet.
    pub fn write_packet(&mut self, payload: &str) {
        let framed = format!("${}#{:02x}", payload, checksum(payload.as_bytes()));
        log!(crate::log::LogDebug, "dbg tx: {}", framed);
        self.send_raw(framed.as_bytes());
        if !self.no_ack {
            // Wait for the client's ack; a nak means retransmit.
            loop {
                match self.next_byte() {
                    Some(b'+') | None => break,
                    Some(b'-') => self.send_raw(framed.as_bytes()),
                    Some(_) => continue,
                }
            }
        }
    }

    pub fn write_hex_bytes_packet(&mut self, bytes: &[u8]) {
        let hex = to_hex(bytes);
        self.write_packet(&hex);
    }

    pub fn write_ok(&mut self) {
        self.write_packet("OK");
    }

    pub fn write_error(&mut self, errno_val: i32) {
        self.write_packet(&format!("E{:02x}", errno_val & 0xff));
    }

    /// Protocol-defined "unsupported" reply.
    pub fn write_unsupported(&mut self) {
        self.write_packet("");
    }

    fn next_byte(&mut self) -> Option<u8> {
        while self.inbuf.is_empty() {
            if !self.fill() {
                return None;
            }
        }
        Some(self.inbuf.remove(0))
    }

    /// Read one framed packet's payload (or an out-of-band interrupt).
    fn read_packet_payload(&mut self) -> Option<Vec<u8>> {
        // Skip to the packet start, honoring 0x03 interrupts.
        loop {
            let b = self.next_byte()?;
            match b {
                b'$' => break,
                0x03 => return Some(vec![0x03]),
                b'+' | b'-' => continue,
                _ => continue,
            }
        }
        let mut payload = Vec::new();
        loop {
            let b = self.next_byte()?;
            if b == b'#' {
                break;
            }
            payload.push(b);
        }
        let c1 = self.next_byte()?;
        let c2 = self.next_byte()?;
        let their_sum =
            u8::from_str_radix(&format!("{}{}", c1 as char, c2 as char), 16).unwrap_or(0);
        let our_sum = checksum(&payload);
        if their_sum != our_sum {
            if !self.no_ack {
                self.send_raw(b"-");
            }
            return self.read_packet_payload();
        }
        if !self.no_ack {
            self.send_raw(b"+");
        }
        // Undo escape sequences (0x7d xor 0x20).
        let mut out = Vec::with_capacity(payload.len());
        let mut i = 0;
        while i < payload.len() {
            if payload[i] == 0x7d && i + 1 < payload.len() {
                out.push(payload[i + 1] ^ 0x20);
                i += 2;
            } else {
                out.push(payload[i]);
                i += 1;
            }
        }
        Some(out)
    }

    /// Block until the next request.
    pub fn get_request(&mut self) -> GdbRequest {
        let payload = match self.read_packet_payload() {
            Some(p) => p,
            None => return GdbRequest::Detach,
        };
        if payload == [0x03] {
            return GdbRequest::Interrupt;
        }
        let text = String::from_utf8_lossy(&payload).into_owned();
        log!(crate::log::LogDebug, "dbg rx: {}", text);
        self.parse_request(&text, &payload)
    }

    fn parse_request(&mut self, text: &str, raw: &[u8]) -> GdbRequest {
        let mut chars = text.chars();
        let cmd = match chars.next() {
            Some(c) => c,
            None => return GdbRequest::None,
        };
        let rest = &text[cmd.len_utf8()..];
        match cmd {
            'g' => GdbRequest::GetRegs,
            'G' => match from_hex(rest) {
                Some(bytes) => GdbRequest::SetRegs(bytes),
                None => GdbRequest::Unsupported,
            },
            'p' => usize::from_str_radix(rest, 16)
                .map(GdbRequest::GetReg)
                .unwrap_or(GdbRequest::Unsupported),
            'P' => {
                let mut parts = rest.splitn(2, '=');
                let regno = usize::from_str_radix(parts.next().unwrap_or(""), 16);
                let value = parts
                    .next()
                    .and_then(from_hex)
                    .map(|mut b| {
                        // Wire order is target byte order (little endian).
                        b.resize(8, 0);
                        u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
                    });
                match (regno, value) {
                    (Ok(r), Some(v)) => GdbRequest::SetReg(r, v),
                    _ => GdbRequest::Unsupported,
                }
            }
            'm' => {
                let mut parts = rest.splitn(2, ',');
                let addr = usize::from_str_radix(parts.next().unwrap_or(""), 16);
                let len = usize::from_str_radix(parts.next().unwrap_or(""), 16);
                match (addr, len) {
                    (Ok(addr), Ok(len)) => GdbRequest::GetMem { addr, len },
                    _ => GdbRequest::Unsupported,
                }
            }
            'M' => {
                let mut parts = rest.splitn(2, ':');
                let addr_len = parts.next().unwrap_or("");
                let hex = parts.next().unwrap_or("");
                let mut al = addr_len.splitn(2, ',');
                let addr = usize::from_str_radix(al.next().unwrap_or(""), 16);
                match (addr, from_hex(hex)) {
                    (Ok(addr), Some(bytes)) => GdbRequest::SetMem { addr, bytes },
                    _ => GdbRequest::Unsupported,
                }
            }
            'X' => {
                // Binary write: X addr,len:bytes (bytes already unescaped).
                let colon = match raw.iter().position(|b| *b == b':') {
                    Some(i) => i,
                    None => return GdbRequest::Unsupported,
                };
                let header = String::from_utf8_lossy(&raw[1..colon]).into_owned();
                let mut al = header.splitn(2, ',');
                let addr = usize::from_str_radix(al.next().unwrap_or(""), 16);
                match addr {
                    Ok(addr) => GdbRequest::SetMem {
                        addr,
                        bytes: raw[colon + 1..].to_vec(),
                    },
                    _ => GdbRequest::Unsupported,
                }
            }
            'Z' | 'z' => self.parse_breakpoint(cmd == 'Z', rest),
            'c' => GdbRequest::Resume {
                action: ResumeAction::Continue,
                reverse: false,
            },
            's' => GdbRequest::Resume {
                action: ResumeAction::Step,
                reverse: false,
            },
            'C' => {
                let sig = i32::from_str_radix(rest.split(';').next().unwrap_or(""), 16).unwrap_or(0);
                GdbRequest::Resume {
                    action: ResumeAction::ContinueWithSignal(sig),
                    reverse: false,
                }
            }
            'S' => {
                let sig = i32::from_str_radix(rest.split(';').next().unwrap_or(""), 16).unwrap_or(0);
                GdbRequest::Resume {
                    action: ResumeAction::StepWithSignal(sig),
                    reverse: false,
                }
            }
            'b' => match rest.chars().next() {
                Some('c') => GdbRequest::Resume {
                    action: ResumeAction::Continue,
                    reverse: true,
                },
                Some('s') => GdbRequest::Resume {
                    action: ResumeAction::Step,
                    reverse: true,
                },
                _ => GdbRequest::Unsupported,
            },
            'H' => {
                let op = rest.chars().next();
                let tid = Self::parse_thread_id(&rest[1..]);
                match op {
                    Some('g') => GdbRequest::SetQueryThread(tid),
                    Some('c') => GdbRequest::SetResumeThread(tid),
                    _ => GdbRequest::Unsupported,
                }
            }
            'T' => GdbRequest::ThreadAlive(Self::parse_thread_id(rest)),
            '?' => GdbRequest::GetStopReason,
            'D' => GdbRequest::Detach,
            'k' => GdbRequest::Kill,
            'R' => GdbRequest::Restart {
                param: rest.to_owned(),
            },
            'v' => self.parse_v_packet(rest),
            'q' => self.parse_query(rest),
            'Q' => self.parse_set(rest),
            _ => GdbRequest::Unsupported,
        }
    }

    fn parse_thread_id(s: &str) -> pid_t {
        // Forms: "tid", "-1", "pPID.TID".
        let s = s.trim_start_matches('p');
        let tid_part = s.rsplit('.').next().unwrap_or(s);
        if tid_part.starts_with('-') {
            return -1;
        }
        pid_t::from_str_radix(tid_part, 16).unwrap_or(0)
    }

    fn parse_breakpoint(&mut self, set: bool, rest: &str) -> GdbRequest {
        let mut parts = rest.split(';');
        let main = parts.next().unwrap_or("");
        let mut fields = main.split(',');
        let kind_num = fields.next().and_then(|v| v.parse::<u32>().ok());
        let addr = fields
            .next()
            .and_then(|v| usize::from_str_radix(v, 16).ok());
        let len = fields.next().and_then(|v| v.parse::<usize>().ok());
        let kind = kind_num.and_then(BreakpointKind::from_wire);
        let (kind, addr, len) = match (kind, addr, len) {
            (Some(k), Some(a), Some(l)) => (k, a, l),
            _ => return GdbRequest::Unsupported,
        };
        if set {
            // Conditions arrive as ";X<len>,<hex bytecode>" groups.
            let mut conditions = Vec::new();
            for p in parts {
                if let Some(stripped) = p.strip_prefix('X') {
                    if let Some(comma) = stripped.find(',') {
                        if let Some(bytes) = from_hex(&stripped[comma + 1..]) {
                            conditions.push(bytes);
                        }
                    }
                }
            }
            GdbRequest::SetBreakpoint {
                kind,
                addr,
                len,
                conditions,
            }
        } else {
            GdbRequest::RemoveBreakpoint { kind, addr, len }
        }
    }

    fn parse_v_packet(&mut self, rest: &str) -> GdbRequest {
        if let Some(actions) = rest.strip_prefix("Cont") {
            if actions == "?" {
                self.write_packet("vCont;c;C;s;S");
                return GdbRequest::None;
            }
            // Use the first action; per-thread action lists collapse to it.
            for clause in actions.trim_start_matches(';').split(';') {
                let mut it = clause.splitn(2, ':');
                let act = it.next().unwrap_or("");
                let action = match act.chars().next() {
                    Some('c') => ResumeAction::Continue,
                    Some('s') => ResumeAction::Step,
                    Some('C') => ResumeAction::ContinueWithSignal(
                        i32::from_str_radix(&act[1..], 16).unwrap_or(0),
                    ),
                    Some('S') => ResumeAction::StepWithSignal(
                        i32::from_str_radix(&act[1..], 16).unwrap_or(0),
                    ),
                    _ => continue,
                };
                if let Some(tid) = it.next() {
                    self.resume_thread = Self::parse_thread_id(tid);
                }
                return GdbRequest::Resume {
                    action,
                    reverse: false,
                };
            }
            return GdbRequest::Unsupported;
        }
        GdbRequest::Unsupported
    }

    fn parse_query(&mut self, rest: &str) -> GdbRequest {
        if rest.starts_with("Supported") {
            self.write_packet(
                "PacketSize=4000;QStartNoAckMode+;qXfer:features:read-;ReverseContinue+;ReverseStep+;multiprocess-",
            );
            return GdbRequest::None;
        }
        if rest == "fThreadInfo" || rest == "sThreadInfo" {
            return if rest.starts_with('f') {
                GdbRequest::QueryThreadList
            } else {
                // The full list went out with the f packet.
                self.write_packet("l");
                GdbRequest::None
            };
        }
        if rest == "C" {
            return GdbRequest::GetCurrentThread;
        }
        if rest == "Attached" {
            self.write_packet("1");
            return GdbRequest::None;
        }
        if let Some(args) = rest.strip_prefix("Search:memory:") {
            let mut parts = args.splitn(3, ';');
            let addr = usize::from_str_radix(parts.next().unwrap_or(""), 16);
            let len = usize::from_str_radix(parts.next().unwrap_or(""), 16);
            let needle = parts.next().and_then(from_hex);
            if let (Ok(addr), Ok(len), Some(needle)) = (addr, len, needle) {
                return GdbRequest::SearchMem { addr, len, needle };
            }
            return GdbRequest::Unsupported;
        }
        if let Some(cmd) = rest.strip_prefix("RetraceCmd:") {
            return GdbRequest::EngineCmd(cmd.to_owned());
        }
        // Compatibility alias used by stock client macros.
        if let Some(cmd) = rest.strip_prefix("RRCmd:") {
            return GdbRequest::EngineCmd(cmd.to_owned());
        }
        if rest.starts_with("Xfer:siginfo:read") {
            return GdbRequest::ReadSiginfo;
        }
        if rest.starts_with("Xfer:siginfo:write") {
            return GdbRequest::WriteSiginfo;
        }
        if rest.starts_with("Symbol") || rest.starts_with("TStatus") || rest.starts_with("Offsets")
        {
            self.write_unsupported();
            return GdbRequest::None;
        }
        GdbRequest::Unsupported
    }

    fn parse_set(&mut self, rest: &str) -> GdbRequest {
        if rest == "StartNoAckMode" {
            self.write_ok();
            self.no_ack = true;
            return GdbRequest::None;
        }
        GdbRequest::Unsupported
    }

    // --- typed replies ---

    pub fn reply_get_regs(&mut self, values: &[GdbRegisterValue]) {
        let mut payload = String::new();
        for v in values {
            if v.defined {
                payload.push_str(&to_hex(&v.value[..v.size]));
            } else {
                for _ in 0..v.size {
                    payload.push_str("xx");
                }
            }
        }
        self.write_packet(&payload);
    }

    pub fn reply_get_reg(&mut self, v: &GdbRegisterValue) {
        if v.defined {
            let hex = to_hex(&v.value[..v.size]);
            self.write_packet(&hex);
        } else {
            let payload = "xx".repeat(v.size);
            self.write_packet(&payload);
        }
    }

    pub fn reply_get_mem(&mut self, bytes: &[u8]) {
        self.write_hex_bytes_packet(bytes);
    }

    /// "T<signal>thread:<tid>;" stop reply.
    pub fn notify_stop(&mut self, tid: pid_t, sig: i32, watch_addr: Option<usize>) {
        let mut payload = format!("T{:02x}", sig & 0x7f);
        if let Some(addr) = watch_addr {
            payload.push_str(&format!("watch:{:x};", addr));
        }
        payload.push_str(&format!("thread:{:x};", tid));
        self.write_packet(&payload);
    }

    pub fn notify_exit_code(&mut self, code: i32) {
        self.write_packet(&format!("W{:02x}", code & 0xff));
    }

    pub fn notify_exit_signal(&mut self, sig: i32) {
        self.write_packet(&format!("X{:02x}", sig & 0x7f));
    }

    pub fn reply_thread_list(&mut self, tids: &[pid_t]) {
        if tids.is_empty() {
            self.write_packet("l");
            return;
        }
        let list: Vec<String> = tids.iter().map(|t| format!("{:x}", t)).collect();
        let payload = format!("m{}", list.join(","));
        self.write_packet(&payload);
    }

    pub fn reply_current_thread(&mut self, tid: pid_t) {
        self.write_packet(&format!("QC{:x}", tid));
    }

    /// Console output for the client (O packets), used by the custom
    /// command channel.
    pub fn write_console_output(&mut self, text: &str) {
        let hex = to_hex(text.as_bytes());
        self.write_packet(&format!("O{}", hex));
    }

    /// Custom-command result: hex-encoded so arbitrary text survives.
    pub fn reply_engine_cmd(&mut self, result: &str) {
        self.write_hex_bytes_packet(result.as_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_round_trip() {
        assert_eq!(to_hex(&[0x00, 0xff, 0x7d]), "00ff7d");
        assert_eq!(from_hex("00ff7d").unwrap(), vec![0x00, 0xff, 0x7d]);
        assert!(from_hex("0").is_none());
        assert!(from_hex("zz").is_none());
    }

    #[test]
    fn checksum_matches_protocol() {
        // "$OK#9a": 'O'+'K' = 0x4f+0x4b = 0x9a.
        assert_eq!(checksum(b"OK"), 0x9a);
    }

    #[test]
    fn thread_id_forms() {
        assert_eq!(GdbConnection::parse_thread_id("1f"), 31);
        assert_eq!(GdbConnection::parse_thread_id("p10.1f"), 31);
        assert_eq!(GdbConnection::parse_thread_id("-1"), -1);
    }
}
