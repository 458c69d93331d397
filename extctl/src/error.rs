use chainerror::*;
use std::io;

#[macro_export]
macro_rules! context {
    ($kind:expr) => {
        $crate::error::Error::new($kind, None, Some(format!("{}:{}", file!(), line!())))
    };
}

#[macro_export]
macro_rules! map_context {
    () => {
        |e| {
            <$crate::error::ErrorKind as ::chainerror::ChainErrorFrom<_>>::chain_error_from(
                e,
                Some(format!("{}:{}", file!(), line!())),
            )
        }
    };
}

pub use context;
pub use map_context;

#[derive(Clone, PartialEq, Debug)]
pub enum ErrorKind {
    Io(::std::io::ErrorKind),
    ConnectionFailed(String),
    ConnectionClosed,
    ProtocolDesync(String),
    CommandFailed(String),
    InvalidCommand(u8),
    HandshakeRejected(u8),
    NotConnected,
    MonitorNotConnected,
    NotRegistered(String),
    RegistrationFailed(String),
    MachineNotFound(String),
    MonitorPrompt,
    TruncatedPayload { needed: usize, got: usize },
    UnexpectedReplySize { expected: usize, got: usize },
    InvalidResponse(String),
    Timeout,
    Launch(String),
    WorkerStopped,
    SerdeJson(String),
}

impl ::std::error::Error for ErrorKind {}

impl ::std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut ::std::fmt::Formatter) -> ::std::fmt::Result {
        match self {
            ErrorKind::Io(_) => write!(f, "IO error"),
            ErrorKind::ConnectionFailed(v) => write!(f, "Connection failed: {}", v),
            ErrorKind::ConnectionClosed => write!(f, "Connection closed"),
            ErrorKind::ProtocolDesync(v) => write!(f, "Protocol desync: {}", v),
            ErrorKind::CommandFailed(v) => write!(f, "Command failed: {}", v),
            ErrorKind::InvalidCommand(c) => {
                write!(f, "Server rejected command {:#04x} as invalid", c)
            }
            ErrorKind::HandshakeRejected(b) => {
                write!(f, "Handshake rejected with response byte {:#04x}", b)
            }
            ErrorKind::NotConnected => write!(f, "Not connected"),
            ErrorKind::MonitorNotConnected => write!(f, "Monitor not connected"),
            ErrorKind::NotRegistered(v) => write!(f, "Peripheral not registered: '{}'", v),
            ErrorKind::RegistrationFailed(v) => {
                write!(f, "Peripheral registration failed: '{}'", v)
            }
            ErrorKind::MachineNotFound(v) => write!(f, "Machine not found: '{}'", v),
            ErrorKind::MonitorPrompt => write!(f, "No monitor prompt in response"),
            ErrorKind::TruncatedPayload { needed, got } => {
                write!(f, "Truncated payload: needed {} bytes, got {}", needed, got)
            }
            ErrorKind::UnexpectedReplySize { expected, got } => {
                write!(f, "Unexpected reply size: expected {} bytes, got {}", expected, got)
            }
            ErrorKind::InvalidResponse(v) => write!(f, "Invalid response: {}", v),
            ErrorKind::Timeout => write!(f, "Timeout Error"),
            ErrorKind::Launch(v) => write!(f, "Emulator launch failed: {}", v),
            ErrorKind::WorkerStopped => write!(f, "Worker thread stopped"),
            ErrorKind::SerdeJson(v) => write!(f, "JSON error: {}", v),
        }
    }
}

impl ChainErrorFrom<std::io::Error> for ErrorKind {
    fn chain_error_from(e: io::Error, line_filename: Option<String>) -> ChainError<Self> {
        match e.kind() {
            io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::UnexpectedEof => {
                ChainError::<_>::new(ErrorKind::ConnectionClosed, Some(Box::from(e)), line_filename)
            }

            kind => ChainError::<_>::new(ErrorKind::Io(kind), Some(Box::from(e)), line_filename),
        }
    }
}

impl ChainErrorFrom<serde_json::error::Error> for ErrorKind {
    fn chain_error_from(e: serde_json::error::Error, line_filename: Option<String>) -> ChainError<Self> {
        ChainError::<_>::new(
            ErrorKind::SerdeJson(e.to_string()),
            Some(Box::from(e)),
            line_filename,
        )
    }
}

pub type Result<T> = ChainResult<T, ErrorKind>;
pub type Error = ChainError<ErrorKind>;
