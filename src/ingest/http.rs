//! HTTP/1.1 `SourceIngest`: async DNS via a helper thread, non-blocking
//! connect, a literal `GET <path> HTTP/1.1` request, and a four-state
//! header skip before streaming the body into the parser.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::mpsc;
use std::time::Duration;

use crate::error::PlayerError;
use crate::parser::{FrameSink, NalParser};

use super::{IdleTimer, IngestEvent, SourceIngest};

const READ_CHUNK: usize = 64 * 1024;

/// Header-skip state: consumes bytes one at a time until `\r\n\r\n` is
/// seen, as a literal four-state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HeaderState {
    Empty,
    Cr,
    CrLf,
    CrLfCr,
    Done,
}

impl HeaderState {
    fn advance(self, b: u8) -> HeaderState {
        use HeaderState::*;
        match (self, b) {
            (Done, _) => Done,
            (_, b'\r') => match self {
                Empty => Cr,
                CrLf => CrLfCr,
                Cr | CrLfCr => Cr,
                Done => Done,
            },
            (_, b'\n') => match self {
                Cr => CrLf,
                CrLfCr => Done,
                Empty | CrLf => Empty,
                Done => Done,
            },
            _ => Empty,
        }
    }
}

enum Phase {
    ResolvingDns,
    Connecting,
    WritingRequest { sent: usize },
    SkippingHeaders(HeaderState),
    StreamingBody,
}

/// Ongoing DNS lookup: the helper thread's join handle and the channel
/// the cooperative loop polls each tick with `try_recv`.
struct DnsLookup {
    rx: mpsc::Receiver<std::io::Result<Vec<SocketAddr>>>,
}

pub struct HttpIngest {
    host: String,
    port: u16,
    path: String,
    keep_alive: bool,
    conn_timeout: Duration,

    socket: Option<TcpStream>,
    dns: Option<DnsLookup>,
    phase: Phase,
    request: Vec<u8>,
    idle: IdleTimer,
    buf: Vec<u8>,
}

impl HttpIngest {
    pub fn new(
        host: String,
        port: u16,
        path: String,
        keep_alive: bool,
        conn_timeout: Duration,
    ) -> Self {
        let request = format!("GET {path} HTTP/1.1\r\nHost: {host}\r\n\r\n").into_bytes();
        Self {
            host,
            port,
            path,
            keep_alive,
            conn_timeout,
            socket: None,
            dns: None,
            phase: Phase::ResolvingDns,
            request,
            idle: IdleTimer::new(conn_timeout),
            buf: vec![0u8; READ_CHUNK],
        }
    }

    /// Starts (or restarts) the connection sequence: spawns a one-shot
    /// resolver thread and transitions to `ResolvingDns`.
    pub fn open(&mut self) {
        let host = self.host.clone();
        let port = self.port;
        let (tx, rx) = mpsc::channel();
        std::thread::spawn(move || {
            let result = (host.as_str(), port)
                .to_socket_addrs()
                .map(|iter| iter.collect::<Vec<_>>());
            let _ = tx.send(result);
        });
        self.dns = Some(DnsLookup { rx });
        self.phase = Phase::ResolvingDns;
        self.idle.mark_progress();
    }

    fn begin_connect(&mut self, addr: SocketAddr) -> Result<(), PlayerError> {
        // SAFETY: a freshly created, locally owned socket fd.
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM | libc::SOCK_NONBLOCK, 0) };
        if fd < 0 {
            return Err(PlayerError::TransientDevice {
                device: self.host.clone(),
                reason: std::io::Error::last_os_error().to_string(),
            });
        }
        let sockaddr = socket_addr_to_libc(addr);
        // SAFETY: `sockaddr` is a validly initialized `sockaddr_in`.
        let rc = unsafe {
            libc::connect(
                fd,
                &sockaddr as *const libc::sockaddr_in as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_in>() as u32,
            )
        };
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINPROGRESS) {
                unsafe { libc::close(fd) };
                return Err(PlayerError::TransientDevice {
                    device: self.host.clone(),
                    reason: err.to_string(),
                });
            }
        }
        // SAFETY: `fd` is a valid, open socket owned exclusively here.
        let stream = unsafe { <TcpStream as std::os::unix::io::FromRawFd>::from_raw_fd(fd) };
        self.socket = Some(stream);
        self.phase = Phase::Connecting;
        Ok(())
    }

    fn finish_connect_check(&mut self) -> Result<bool, PlayerError> {
        let Some(stream) = self.socket.as_ref() else {
            return Ok(false);
        };
        let fd = stream.as_raw_fd();
        let mut err: libc::c_int = 0;
        let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
        // SAFETY: standard `getsockopt(SO_ERROR)` non-blocking-connect
        // completion check.
        let rc = unsafe {
            libc::getsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_ERROR,
                &mut err as *mut libc::c_int as *mut libc::c_void,
                &mut len,
            )
        };
        if rc < 0 {
            return Err(PlayerError::TransientDevice {
                device: self.host.clone(),
                reason: std::io::Error::last_os_error().to_string(),
            });
        }
        if err != 0 {
            return Err(PlayerError::TransientDevice {
                device: self.host.clone(),
                reason: std::io::Error::from_raw_os_error(err).to_string(),
            });
        }
        Ok(true)
    }

    /// Polled once per tick from `StreamContext::tick`: advances DNS
    /// resolution without blocking the cooperative loop.
    pub fn poll_dns(&mut self) -> Result<(), PlayerError> {
        let Some(lookup) = self.dns.as_ref() else {
            return Ok(());
        };
        match lookup.rx.try_recv() {
            Ok(Ok(addrs)) => {
                self.dns = None;
                let addr = addrs
                    .into_iter()
                    .find(|a| a.is_ipv4())
                    .ok_or_else(|| PlayerError::PermanentSource {
                        stream: self.host.clone(),
                        reason: "DNS resolution returned no IPv4 addresses".into(),
                    })?;
                self.begin_connect(addr)
            }
            Ok(Err(e)) => {
                self.dns = None;
                Err(PlayerError::TransientDevice {
                    device: self.host.clone(),
                    reason: e.to_string(),
                })
            }
            Err(mpsc::TryRecvError::Empty) => Ok(()),
            Err(mpsc::TryRecvError::Disconnected) => {
                self.dns = None;
                Err(PlayerError::TransientDevice {
                    device: self.host.clone(),
                    reason: "DNS resolver thread terminated without a result".into(),
                })
            }
        }
    }
}

/// Converts an IPv4 `SocketAddr` into a `sockaddr_in` for `connect(2)`.
/// `poll_dns` already filters resolved addresses down to v4 before this
/// is called; v6-only hosts surface as a `PermanentSource` error there.
fn socket_addr_to_libc(addr: SocketAddr) -> libc::sockaddr_in {
    let v4 = match addr {
        SocketAddr::V4(v4) => v4,
        SocketAddr::V6(_) => unreachable!("poll_dns only resolves to IPv4 addresses"),
    };
    let mut sa: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    sa.sin_family = libc::AF_INET as libc::sa_family_t;
    sa.sin_port = v4.port().to_be();
    sa.sin_addr.s_addr = u32::from_ne_bytes(v4.ip().octets());
    sa
}

impl SourceIngest for HttpIngest {
    fn open(&mut self) -> Result<(), PlayerError> {
        HttpIngest::open(self);
        Ok(())
    }

    fn poll(&mut self) -> Result<(), PlayerError> {
        self.poll_dns()
    }

    fn poll_fd(&self) -> Option<RawFd> {
        self.socket.as_ref().map(|s| s.as_raw_fd())
    }

    fn wants_read(&self) -> bool {
        matches!(self.phase, Phase::SkippingHeaders(_) | Phase::StreamingBody)
    }

    fn wants_write(&self) -> bool {
        matches!(self.phase, Phase::Connecting | Phase::WritingRequest { .. })
    }

    fn on_readable(&mut self, parser: &mut NalParser, sink: &mut dyn FrameSink) -> IngestEvent {
        let Some(stream) = self.socket.as_mut() else {
            return IngestEvent::Idle;
        };
        match stream.read(&mut self.buf) {
            Ok(0) => IngestEvent::Eof,
            Ok(n) => {
                self.idle.mark_progress();
                let data = &self.buf[..n];
                let mut body_start = 0;
                if let Phase::SkippingHeaders(mut state) = self.phase {
                    let mut i = 0;
                    while i < data.len() && state != HeaderState::Done {
                        state = state.advance(data[i]);
                        i += 1;
                    }
                    if state == HeaderState::Done {
                        self.phase = Phase::StreamingBody;
                        body_start = i;
                    } else {
                        self.phase = Phase::SkippingHeaders(state);
                        return IngestEvent::Progressed;
                    }
                }
                if matches!(self.phase, Phase::StreamingBody) && body_start < data.len() {
                    parser.feed(sink, &data[body_start..]);
                }
                IngestEvent::Progressed
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => IngestEvent::Idle,
            Err(e) => IngestEvent::Transient(e.to_string()),
        }
    }

    fn on_writable(&mut self) -> IngestEvent {
        if matches!(self.phase, Phase::Connecting) {
            match self.finish_connect_check() {
                Ok(true) => {
                    self.phase = Phase::WritingRequest { sent: 0 };
                    self.idle.mark_progress();
                }
                Ok(false) => return IngestEvent::Idle,
                Err(e) => return IngestEvent::Transient(e.to_string()),
            }
        }
        if let Phase::WritingRequest { sent } = self.phase {
            let Some(stream) = self.socket.as_mut() else {
                return IngestEvent::Idle;
            };
            match stream.write(&self.request[sent..]) {
                Ok(n) if sent + n >= self.request.len() => {
                    self.phase = Phase::SkippingHeaders(HeaderState::Empty);
                    self.idle.mark_progress();
                    IngestEvent::Progressed
                }
                Ok(n) => {
                    self.phase = Phase::WritingRequest { sent: sent + n };
                    self.idle.mark_progress();
                    IngestEvent::Progressed
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => IngestEvent::Idle,
                Err(e) => IngestEvent::Transient(e.to_string()),
            }
        } else {
            IngestEvent::Idle
        }
    }

    fn suspend_read_until_next_tick(&mut self) {
        // HTTP sources are not backpressured to render cadence; only file
        // sources are (the kernel's socket buffer already bounds how far
        // ahead an HTTP source can get).
    }

    fn resume_read(&mut self) {}

    fn idle_timed_out(&self) -> bool {
        self.idle.elapsed()
    }

    fn close(&mut self) {
        self.socket = None;
        self.dns = None;
        self.phase = Phase::ResolvingDns;
    }

    fn is_reconnectable(&self) -> bool {
        self.keep_alive
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn socket_addr_to_libc_encodes_ipv4_octets_and_port() {
        let addr = SocketAddr::V4(std::net::SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 7), 8080));
        let sa = socket_addr_to_libc(addr);
        assert_eq!(sa.sin_family, libc::AF_INET as libc::sa_family_t);
        assert_eq!(sa.sin_port, 8080u16.to_be());
        assert_eq!(u32::from_ne_bytes(Ipv4Addr::new(10, 0, 0, 7).octets()), sa.sin_addr.s_addr);
    }

    #[test]
    fn header_state_advance_reaches_done_only_on_full_crlfcrlf() {
        let mut state = HeaderState::Empty;
        for b in b"\r\n\r\n" {
            state = state.advance(*b);
        }
        assert!(matches!(state, HeaderState::Done));
    }

    #[test]
    fn header_state_advance_resets_on_unexpected_byte() {
        let state = HeaderState::Empty.advance(b'\r').advance(b'X');
        assert!(matches!(state, HeaderState::Empty));
    }
}
