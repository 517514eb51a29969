//! Guest TCP sockets (vm_tcp_*)
//!
//! The bridge issues and tears down socket handles. Transport is supplied
//! by a [`SocketConnector`]; [`TcpConnector`] uses the host network stack.

use crate::handles::{Handle, HandleTable};
use om_core::error::KernelError;
use parking_lot::Mutex;
use std::io::{self, ErrorKind, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, trace, warn};

/// Socket error codes as seen by the guest
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum SocError {
    #[error("Socket error")]
    Error = -1,
    #[error("Operation would block")]
    WouldBlock = -2,
    #[error("Socket limit reached")]
    LimitResource = -3,
    #[error("Invalid socket")]
    InvalidSocket = -4,
    #[error("Invalid account")]
    InvalidAccount = -5,
    #[error("Name too long")]
    NameTooLong = -6,
    #[error("Operation already in progress")]
    Already = -7,
    #[error("Operation not supported")]
    OpNotSupp = -8,
    #[error("Connection aborted")]
    ConnAborted = -9,
    #[error("Invalid argument")]
    Inval = -10,
    #[error("Broken pipe")]
    Pipe = -11,
    #[error("Socket not connected")]
    NotConn = -12,
    #[error("Message too long")]
    MsgSize = -13,
    #[error("Bearer failure")]
    BearerFail = -14,
    #[error("Connection reset")]
    ConnReset = -15,
    #[error("DHCP error")]
    DhcpError = -16,
    #[error("IP address changed")]
    IpChanged = -17,
    #[error("Address in use")]
    AddrInUse = -18,
    #[error("Bearer activation cancelled")]
    CancelActBearer = -19,
}

impl SocError {
    /// Negative code returned to the guest
    pub fn code(self) -> i32 {
        self as i32
    }
}

impl From<io::Error> for SocError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            ErrorKind::WouldBlock | ErrorKind::TimedOut => Self::WouldBlock,
            ErrorKind::ConnectionReset => Self::ConnReset,
            ErrorKind::ConnectionAborted => Self::ConnAborted,
            ErrorKind::BrokenPipe => Self::Pipe,
            ErrorKind::NotConnected => Self::NotConn,
            ErrorKind::AddrInUse => Self::AddrInUse,
            ErrorKind::InvalidInput => Self::Inval,
            _ => Self::Error,
        }
    }
}

impl From<KernelError> for SocError {
    fn from(err: KernelError) -> Self {
        match err {
            KernelError::InvalidHandle(_) => Self::InvalidSocket,
            KernelError::ResourceLimit => Self::LimitResource,
            KernelError::WouldBlock => Self::WouldBlock,
            KernelError::PermissionDenied | KernelError::Io(_) => Self::Error,
        }
    }
}

/// Collapse a byte-count result into the guest calling convention
pub fn to_guest_len(result: Result<usize, SocError>) -> i32 {
    match result {
        Ok(n) => i32::try_from(n).unwrap_or(i32::MAX),
        Err(e) => e.code(),
    }
}

/// Notifications delivered to the guest's socket callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum TcpEvent {
    Connected = 1,
    CanWrite = 2,
    CanRead = 3,
    PipeBroken = 4,
    HostNotFound = 5,
    PipeClosed = 6,
}

/// A connected byte stream
pub trait SocketTransport: Send {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    fn write(&mut self, data: &[u8]) -> io::Result<usize>;
    fn close(&mut self);
}

/// Opens transports for the bridge
pub trait SocketConnector: Send + Sync {
    fn connect(&self, host: &str, port: u16) -> io::Result<Box<dyn SocketTransport>>;
}

impl SocketTransport for TcpStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Read::read(self, buf)
    }

    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        Write::write(self, data)
    }

    fn close(&mut self) {
        if let Err(e) = self.shutdown(Shutdown::Both) {
            trace!("TCP shutdown: {}", e);
        }
    }
}

/// Host TCP connector
///
/// Streams are switched to non-blocking mode after connecting, so reads
/// with no pending data report `WouldBlock` to the guest.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    pub timeout: Duration,
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
        }
    }
}

impl SocketConnector for TcpConnector {
    fn connect(&self, host: &str, port: u16) -> io::Result<Box<dyn SocketTransport>> {
        let mut last_err = io::Error::new(ErrorKind::NotFound, format!("{} did not resolve", host));

        for addr in (host, port).to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, self.timeout) {
                Ok(stream) => {
                    stream.set_nonblocking(true)?;
                    stream.set_nodelay(true)?;
                    return Ok(Box::new(stream));
                }
                Err(e) => last_err = e,
            }
        }

        Err(last_err)
    }
}

struct GuestSocket {
    host: String,
    port: u16,
    transport: Mutex<Box<dyn SocketTransport>>,
}

/// Per-app table of sockets
pub struct SocketBridge {
    connector: Arc<dyn SocketConnector>,
    sockets: HandleTable<GuestSocket>,
    events: Mutex<Vec<(Handle, TcpEvent)>>,
}

impl SocketBridge {
    pub fn new(connector: Arc<dyn SocketConnector>, max_sockets: usize) -> Self {
        Self {
            connector,
            sockets: HandleTable::with_limit("socket", max_sockets),
            events: Mutex::new(Vec::new()),
        }
    }

    fn notify(&self, handle: Handle, event: TcpEvent) {
        let mut events = self.events.lock();
        // A socket closed while its read or write was in flight
        if self.sockets.is_active(handle) {
            events.push((handle, event));
        }
    }

    /// Connect and return the socket handle
    pub fn connect(&self, host: &str, port: u16) -> Result<Handle, SocError> {
        let transport = self.connector.connect(host, port).map_err(|e| {
            warn!("Connection to {}:{} failed: {}", host, port, e);
            SocError::from(e)
        })?;

        let socket = GuestSocket {
            host: host.to_string(),
            port,
            transport: Mutex::new(transport),
        };

        match self.sockets.push(socket) {
            Ok(handle) => {
                debug!("Socket {} connected to {}:{}", handle, host, port);
                self.notify(handle, TcpEvent::Connected);
                Ok(handle)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn read(&self, handle: Handle, buf: &mut [u8]) -> Result<usize, SocError> {
        let socket = self.sockets.access(handle)?;
        let result = socket.transport.lock().read(buf);
        drop(socket);

        match result {
            Ok(0) if !buf.is_empty() => {
                self.notify(handle, TcpEvent::PipeClosed);
                Ok(0)
            }
            Ok(n) => Ok(n),
            Err(e) => {
                let err = SocError::from(e);
                if err != SocError::WouldBlock {
                    self.notify(handle, TcpEvent::PipeBroken);
                }
                Err(err)
            }
        }
    }

    pub fn write(&self, handle: Handle, data: &[u8]) -> Result<usize, SocError> {
        let socket = self.sockets.access(handle)?;
        let result = socket.transport.lock().write(data);
        drop(socket);

        result.map_err(|e| {
            let err = SocError::from(e);
            if err != SocError::WouldBlock {
                self.notify(handle, TcpEvent::PipeBroken);
            }
            err
        })
    }

    pub fn is_open(&self, handle: Handle) -> bool {
        self.sockets.is_active(handle)
    }

    /// Peer of an open socket
    pub fn peer(&self, handle: Handle) -> Option<(String, u16)> {
        let socket = self.sockets.access(handle).ok()?;
        Some((socket.host.clone(), socket.port))
    }

    /// Close a socket; closing an inactive handle is a no-op
    pub fn close(&self, handle: Handle) {
        if let Some(socket) = self.sockets.remove(handle) {
            socket.transport.lock().close();
            self.events.lock().retain(|(h, _)| *h != handle);
            trace!("Socket {} closed", handle);
        }
    }

    /// Close every socket, returning how many were open
    pub fn close_all(&self) -> usize {
        let sockets = self.sockets.reset_all();
        for socket in &sockets {
            socket.transport.lock().close();
        }
        self.events.lock().clear();
        sockets.len()
    }

    pub fn open_count(&self) -> usize {
        self.sockets.active_count()
    }

    /// Drain pending notifications for the guest callback
    pub fn take_events(&self) -> Vec<(Handle, TcpEvent)> {
        std::mem::take(&mut *self.events.lock())
    }
}
