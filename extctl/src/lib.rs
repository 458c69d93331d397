//! Client support for the emulator external control protocol.
//!
//! The external control server multiplexes two kinds of traffic over one TCP
//! connection:
//!
//! - synchronous command exchanges: a 7-byte request header
//!   (`'R'`, `'E'`, command byte, `u32` little-endian payload length)
//!   followed by the payload, answered with a return-code-tagged response
//!   frame, and
//! - asynchronous event frames the server may emit at any time, including
//!   between a request and its response. Event frames are tagged with a
//!   32-bit event descriptor allocated by this client at callback
//!   registration time.
//!
//! A second, line-oriented TCP connection (the [`Monitor`]) carries free-form
//! administrative commands whose replies end in a parenthesised prompt.
//!
//! # Connecting
//!
//! ```rust,no_run
//! use extctl::{Client, TimeUnit};
//!
//! # fn main() -> extctl::Result<()> {
//! let client = Client::connect("127.0.0.1", 5555)?;
//! client.handshake()?;
//! client.connect_monitor("127.0.0.1", 5556)?;
//!
//! let machine = client.get_machine("stm32-machine")?;
//! machine.run_for(100, TimeUnit::Milliseconds)?;
//! println!("simulation time: {} us", machine.get_time(TimeUnit::Microseconds)?);
//! # Ok(())
//! # }
//! ```
//!
//! # Peripherals
//!
//! Peripherals are addressed by their dotted path under the system bus.
//! Acquiring one performs a registration exchange with the server, which
//! hands back an instance identifier used for all further sub-commands:
//!
//! ```rust,no_run
//! use extctl::{Client, GpioState};
//!
//! # fn main() -> extctl::Result<()> {
//! # let client = Client::connect("127.0.0.1", 5555)?;
//! # client.handshake()?;
//! let machine = client.get_machine("stm32-machine")?;
//! let gpio = machine.get_gpio("sysbus.gpioPortA")?;
//! gpio.set_state(3, GpioState::High)?;
//!
//! let handle = gpio.register_state_change(3, |pin, state| {
//!     println!("pin {} changed to {:?}", pin, state);
//! })?;
//! # let _ = handle;
//! # Ok(())
//! # }
//! ```
//!
//! Callbacks fire on the thread that is draining the socket, either inside a
//! synchronous exchange that found event frames interleaved with its
//! response, or from [`Client::poll_events`] between exchanges. Keep them
//! short; the [`worker`] module shows the intended pattern of re-posting
//! into a channel.
//!
//! # Threading
//!
//! At most one command exchange is in flight at a time; the session mutex
//! serialises every socket access, including the event pump. Use
//! [`worker::SimulationWorker`] to drive a session from a dedicated
//! background thread with a command queue in and an event queue out.

use std::collections::HashMap;
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

#[macro_use]
pub mod error;
pub use crate::error::{Error, ErrorKind, Result};
use crate::error::*;

pub(crate) mod codec;
pub mod stream;
pub use crate::stream::Stream;

pub mod events;
pub mod launch;
pub mod machine;
pub mod monitor;
pub mod worker;


pub use crate::events::EventRegistry;
pub use crate::launch::{launch_and_connect, EmulatorProcess, LaunchConfig};
pub use crate::machine::{Adc, BusContext, Gpio, Machine, SysBus};
pub use crate::monitor::{Monitor, PeripheralEntry};

/// Default timeout for [`Client::connect`].
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// The two magic bytes opening every request header.
pub(crate) const FRAME_MAGIC: [u8; 2] = [b'R', b'E'];

/// Single-byte return code leading every synchronous response frame.
///
/// The numeric values are part of the wire contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReturnCode {
    CommandFailed = 0,
    FatalError = 1,
    InvalidCommand = 2,
    SuccessWithData = 3,
    SuccessWithoutData = 4,
    OkHandshake = 5,
    AsyncEvent = 6,
}

impl ReturnCode {
    pub fn from_u8(b: u8) -> Option<ReturnCode> {
        match b {
            0 => Some(ReturnCode::CommandFailed),
            1 => Some(ReturnCode::FatalError),
            2 => Some(ReturnCode::InvalidCommand),
            3 => Some(ReturnCode::SuccessWithData),
            4 => Some(ReturnCode::SuccessWithoutData),
            5 => Some(ReturnCode::OkHandshake),
            6 => Some(ReturnCode::AsyncEvent),
            _ => None,
        }
    }
}

/// Command opcodes of the binary protocol. Command slot `0` is implicitly
/// occupied by the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ApiCommand {
    RunFor = 1,
    GetTime = 2,
    GetMachine = 3,
    Adc = 4,
    Gpio = 5,
    SystemBus = 6,
}

/// Time units accepted by [`Machine::run_for`] and [`Machine::get_time`].
///
/// The discriminant is the microsecond multiplier, used to convert outgoing
/// durations and to divide incoming microsecond times.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum TimeUnit {
    Microseconds = 1,
    Milliseconds = 1_000,
    Seconds = 1_000_000,
}

impl TimeUnit {
    #[inline]
    pub fn multiplier(self) -> u64 {
        self as u64
    }
}

/// Access width of a system bus transfer. Carried in a single byte on the
/// wire; also used locally to size response payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AccessWidth {
    MultiByte = 0,
    Byte = 1,
    Word = 2,
    DoubleWord = 4,
    QuadWord = 8,
}

impl AccessWidth {
    /// Response element size in bytes. `MultiByte` transfers size as single
    /// bytes.
    #[inline]
    pub fn element_size(self) -> usize {
        match self {
            AccessWidth::MultiByte => 1,
            w => w as usize,
        }
    }
}

/// State of a single GPIO pin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum GpioState {
    Low = 0,
    High = 1,
    HighZ = 2,
}

impl GpioState {
    pub fn from_u8(b: u8) -> Option<GpioState> {
        match b {
            0 => Some(GpioState::Low),
            1 => Some(GpioState::High),
            2 => Some(GpioState::HighZ),
            _ => None,
        }
    }
}

/// Command/version pairs announced during the handshake, in wire order.
/// This table is part of the wire contract.
pub(crate) const COMMAND_VERSIONS: [(ApiCommand, u8); 6] = [
    (ApiCommand::RunFor, 0),
    (ApiCommand::GetTime, 0),
    (ApiCommand::GetMachine, 0),
    (ApiCommand::Adc, 0),
    (ApiCommand::Gpio, 1),
    (ApiCommand::SystemBus, 0),
];

pub(crate) struct SessionIo {
    pub(crate) stream: Option<Box<dyn Stream>>,
}

impl SessionIo {
    pub(crate) fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown();
        }
    }
}

/// Shared core of a client session: the control socket behind one mutex, the
/// session-owned event registry, the machine cache and the optional monitor.
///
/// `canceller` is a clone of the control socket held outside the io mutex,
/// so `disconnect` can shut the socket down while an exchange is blocked in
/// a read; the exchange then observes the failure and releases the lock.
pub(crate) struct SessionCore {
    pub(crate) io: Mutex<SessionIo>,
    pub(crate) canceller: Mutex<Option<Box<dyn Stream>>>,
    pub(crate) events: EventRegistry,
    pub(crate) machines: Mutex<HashMap<String, Weak<Machine>>>,
    pub(crate) monitor: Mutex<Option<Arc<Monitor>>>,
}

impl SessionCore {
    pub(crate) fn new(
        stream: Option<Box<dyn Stream>>,
        canceller: Option<Box<dyn Stream>>,
    ) -> SessionCore {
        SessionCore {
            io: Mutex::new(SessionIo { stream }),
            canceller: Mutex::new(canceller),
            events: EventRegistry::new(),
            machines: Mutex::new(HashMap::new()),
            monitor: Mutex::new(None),
        }
    }

    /// Perform one command exchange under the session lock.
    ///
    /// Interleaved event frames are drained into the registry before the
    /// synchronous response is returned. A protocol desync or a lost
    /// connection closes the socket; later exchanges fail with
    /// `NotConnected`.
    pub(crate) fn exchange(&self, command: ApiCommand, payload: &[u8]) -> Result<Vec<u8>> {
        let mut io = self.io.lock().unwrap();
        let result = Self::exchange_io(&mut io, &self.events, command, payload);
        if let Err(e) = &result {
            match e.kind() {
                ErrorKind::ProtocolDesync(_) | ErrorKind::ConnectionClosed => io.close(),
                _ => {}
            }
        }
        result
    }

    fn exchange_io(
        io: &mut SessionIo,
        events: &EventRegistry,
        command: ApiCommand,
        payload: &[u8],
    ) -> Result<Vec<u8>> {
        let stream = io
            .stream
            .as_mut()
            .ok_or_else(|| Error::from(context!(ErrorKind::NotConnected)))?;

        let mut frame = Vec::with_capacity(7 + payload.len());
        frame.extend_from_slice(&FRAME_MAGIC);
        frame.push(command as u8);
        codec::put_u32(&mut frame, payload.len() as u32);
        frame.extend_from_slice(payload);
        codec::write_all(stream.as_mut(), &frame)?;

        loop {
            let mut code = [0u8; 1];
            codec::read_exact(stream.as_mut(), &mut code)?;

            match ReturnCode::from_u8(code[0]) {
                Some(ReturnCode::AsyncEvent) => {
                    // command(1) + ed(4) + size(4) + data(size)
                    let mut head = [0u8; 9];
                    codec::read_exact(stream.as_mut(), &mut head)?;
                    let ed = codec::get_u32(&head, 1)?;
                    let size = codec::get_u32(&head, 5)? as usize;
                    let mut data = vec![0u8; size];
                    codec::read_exact(stream.as_mut(), &mut data)?;
                    events.dispatch(ed, &data);
                }
                Some(ReturnCode::SuccessWithoutData) => {
                    Self::read_echoed(stream.as_mut(), command)?;
                    return Ok(Vec::new());
                }
                Some(ReturnCode::SuccessWithData) => {
                    Self::read_echoed(stream.as_mut(), command)?;
                    return Self::read_sized(stream.as_mut());
                }
                Some(ReturnCode::CommandFailed) => {
                    Self::read_echoed(stream.as_mut(), command)?;
                    let data = Self::read_sized(stream.as_mut())?;
                    return Err(context!(ErrorKind::CommandFailed(
                        String::from_utf8_lossy(&data).into_owned(),
                    ))
                    .into());
                }
                Some(ReturnCode::FatalError) => {
                    let data = Self::read_sized(stream.as_mut())?;
                    return Err(context!(ErrorKind::CommandFailed(
                        String::from_utf8_lossy(&data).into_owned(),
                    ))
                    .into());
                }
                Some(ReturnCode::InvalidCommand) => {
                    Self::read_echoed(stream.as_mut(), command)?;
                    return Err(context!(ErrorKind::InvalidCommand(command as u8)).into());
                }
                // OK_HANDSHAKE only ever answers the handshake itself.
                Some(ReturnCode::OkHandshake) | None => {
                    return Err(context!(ErrorKind::ProtocolDesync(format!(
                        "unexpected return code {:#04x}",
                        code[0]
                    )))
                    .into());
                }
            }
        }
    }

    fn read_echoed(stream: &mut dyn Stream, command: ApiCommand) -> Result<()> {
        let mut echoed = [0u8; 1];
        codec::read_exact(&mut *stream, &mut echoed)?;
        if echoed[0] != command as u8 {
            return Err(context!(ErrorKind::ProtocolDesync(format!(
                "server echoed command {:#04x}, expected {:#04x}",
                echoed[0], command as u8
            )))
            .into());
        }
        Ok(())
    }

    fn read_sized(stream: &mut dyn Stream) -> Result<Vec<u8>> {
        let mut size = [0u8; 4];
        codec::read_exact(&mut *stream, &mut size)?;
        let size = u32::from_le_bytes(size) as usize;
        let mut data = vec![0u8; size];
        codec::read_exact(&mut *stream, &mut data)?;
        Ok(data)
    }
}

/// A session on the external control channel.
///
/// Owns the control socket. Every command exchange and every event pump run
/// is serialised under one mutex, so at most one operation touches the
/// socket at a time. Dropping the client disconnects.
pub struct Client {
    core: Arc<SessionCore>,
}

impl Client {
    /// Connect to an external control server with the default timeout.
    ///
    /// No protocol exchange happens yet; call [`Client::handshake`] next.
    pub fn connect(host: &str, port: u16) -> Result<Client> {
        Client::connect_with_timeout(host, port, DEFAULT_CONNECT_TIMEOUT)
    }

    /// Connect with a caller-supplied timeout, trying every resolved address.
    pub fn connect_with_timeout(host: &str, port: u16, timeout: Duration) -> Result<Client> {
        let addrs = (host, port).to_socket_addrs().map_err(|e| {
            Error::from(context!(ErrorKind::ConnectionFailed(format!(
                "resolve {}:{}: {}",
                host, port, e
            ))))
        })?;

        let mut last_error = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, timeout) {
                Ok(stream) => return Ok(Client::from_stream(stream)),
                Err(e) => last_error = Some(e),
            }
        }
        Err(context!(ErrorKind::ConnectionFailed(match last_error {
            Some(e) => format!("connect {}:{}: {}", host, port, e),
            None => format!("{}:{}: no addresses resolved", host, port),
        }))
        .into())
    }

    /// Wrap an already-connected control socket.
    pub fn from_stream(stream: TcpStream) -> Client {
        let canceller = stream
            .try_clone()
            .ok()
            .map(|s| Box::new(s) as Box<dyn Stream>);
        Client {
            core: Arc::new(SessionCore::new(Some(Box::new(stream)), canceller)),
        }
    }

    /// Announce the supported command versions and await the single
    /// acknowledgment byte.
    ///
    /// The handshake has its own framing: the payload is sent raw, without
    /// the `'R'`,`'E'` header and without a length prefix, and the reply is
    /// one byte that must equal `ReturnCode::OkHandshake`.
    pub fn handshake(&self) -> Result<()> {
        let mut io = self.core.io.lock().unwrap();
        let stream = io
            .stream
            .as_mut()
            .ok_or_else(|| Error::from(context!(ErrorKind::NotConnected)))?;

        let mut buf = Vec::with_capacity(2 + COMMAND_VERSIONS.len() * 2);
        codec::put_u16(&mut buf, COMMAND_VERSIONS.len() as u16);
        for (command, version) in COMMAND_VERSIONS.iter() {
            buf.push(*command as u8);
            buf.push(*version);
        }
        codec::write_all(stream.as_mut(), &buf)?;

        let mut response = [0u8; 1];
        codec::read_exact(stream.as_mut(), &mut response)?;
        if response[0] != ReturnCode::OkHandshake as u8 {
            return Err(context!(ErrorKind::HandshakeRejected(response[0])).into());
        }
        Ok(())
    }

    /// Send one command and return the response payload.
    pub fn exchange(&self, command: ApiCommand, payload: &[u8]) -> Result<Vec<u8>> {
        self.core.exchange(command, payload)
    }

    /// Acquire a machine by name.
    ///
    /// Re-acquiring the same name returns the same `Arc` while any holder
    /// keeps it alive.
    pub fn get_machine(&self, name: &str) -> Result<Arc<Machine>> {
        Machine::acquire(&self.core, name)
    }

    /// Connect the monitor channel on a second port.
    pub fn connect_monitor(&self, host: &str, port: u16) -> Result<()> {
        let monitor = Monitor::connect(host, port)?;
        *self.core.monitor.lock().unwrap() = Some(Arc::new(monitor));
        Ok(())
    }

    /// The monitor session, if one is connected.
    pub fn monitor(&self) -> Option<Arc<Monitor>> {
        self.core.monitor.lock().unwrap().clone()
    }

    /// Drain event frames waiting in the socket buffer.
    ///
    /// Consumes only whole event frames; a pending synchronous frame or a
    /// partially received event is left untouched. Returns the number of
    /// events dispatched.
    pub fn poll_events(&self) -> Result<usize> {
        events::poll(&self.core)
    }

    /// The session-owned event registry.
    pub fn events(&self) -> &EventRegistry {
        &self.core.events
    }

    /// Close the control socket. Idempotent; subsequent operations fail with
    /// `NotConnected`.
    ///
    /// Safe to call while a command is in flight on another thread: the
    /// socket is shut down first, which makes the blocked exchange observe a
    /// read failure and release the session lock.
    pub fn disconnect(&self) {
        if let Some(mut canceller) = self.core.canceller.lock().unwrap().take() {
            let _ = canceller.shutdown();
        }
        self.core.io.lock().unwrap().close();
    }

    pub fn is_connected(&self) -> bool {
        self.core.io.lock().unwrap().stream.is_some()
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.disconnect();
    }
}
