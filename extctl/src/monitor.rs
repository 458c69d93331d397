//! The monitor channel: free-form administrative commands over a second TCP
//! connection.
//!
//! Commands are terminated by `\n`; the reply is everything the server
//! prints up to its interactive prompt, a parenthesised name followed by a
//! space, e.g. `(machine-0) `. Responses may embed ANSI escape sequences;
//! they are passed through untouched.

use std::io::Read;
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Mutex;
use std::time::Duration;

use crate::codec;
use crate::error::*;

/// Read timeout on the monitor socket. A reply whose prompt does not arrive
/// within this window fails with `MonitorPrompt` instead of hanging.
const READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound on a single monitor reply.
const MAX_RESPONSE: usize = 1 << 20;

/// One peripheral from the monitor's `peripherals` listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeripheralEntry {
    /// Dotted path, e.g. `sysbus.gpioPortA`.
    pub path: String,
    /// Short name, the last path segment.
    pub name: String,
    /// Parenthesised type token from the listing.
    pub kind: String,
}

/// A connection to the monitor port.
///
/// The greeting prompt is consumed during [`Monitor::connect`], so the first
/// [`Monitor::execute`] starts from a clean line.
pub struct Monitor {
    io: Mutex<TcpStream>,
}

impl Monitor {
    pub fn connect(host: &str, port: u16) -> Result<Monitor> {
        let addrs = (host, port).to_socket_addrs().map_err(|e| {
            Error::from(context!(ErrorKind::ConnectionFailed(format!(
                "resolve {}:{}: {}",
                host, port, e
            ))))
        })?;

        let mut last_error = None;
        for addr in addrs {
            match TcpStream::connect(addr) {
                Ok(stream) => {
                    stream
                        .set_read_timeout(Some(READ_TIMEOUT))
                        .map_err(map_context!())?;
                    let mut stream = stream;
                    // Greeting banner ends in the first prompt.
                    read_until_prompt(&mut stream)?;
                    return Ok(Monitor {
                        io: Mutex::new(stream),
                    });
                }
                Err(e) => last_error = Some(e),
            }
        }
        Err(context!(ErrorKind::ConnectionFailed(match last_error {
            Some(e) => format!("connect {}:{}: {}", host, port, e),
            None => format!("{}:{}: no addresses resolved", host, port),
        }))
        .into())
    }

    /// Run one monitor command and return its cleaned-up output.
    pub fn execute(&self, command: &str) -> Result<String> {
        let mut stream = self.io.lock().unwrap();
        let mut line = String::with_capacity(command.len() + 1);
        line.push_str(command);
        line.push('\n');
        codec::write_all(&mut *stream, line.as_bytes())?;

        let raw = read_until_prompt(&mut stream)?;
        Ok(strip_response(&raw))
    }

    pub fn pause(&self) -> Result<()> {
        self.execute("pause").map(|_| ())
    }

    /// Resume the emulation. The monitor verb is `start`.
    pub fn start(&self) -> Result<()> {
        self.execute("start").map(|_| ())
    }

    pub fn reset(&self) -> Result<()> {
        self.execute("machine Reset").map(|_| ())
    }

    pub fn load_platform_description(&self, path: &str) -> Result<()> {
        self.execute(&format!("machine LoadPlatformDescription @{}", path))
            .map(|_| ())
    }

    pub fn load_elf(&self, path: &str) -> Result<()> {
        self.execute(&format!("sysbus LoadELF @{}", path)).map(|_| ())
    }
}

/// Accumulate bytes until the buffer contains a prompt of the shape
/// `(` … `)` followed by a space, then return everything before the line
/// the prompt starts on.
fn read_until_prompt(stream: &mut TcpStream) -> Result<String> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 256];
    loop {
        let n = match stream.read(&mut chunk) {
            Ok(0) => return Err(context!(ErrorKind::ConnectionClosed).into()),
            Ok(n) => n,
            Err(ref e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                return Err(context!(ErrorKind::MonitorPrompt).into());
            }
            Err(e) => return Err(Error::from(context!(ErrorKind::Io(e.kind())))),
        };
        buf.extend_from_slice(&chunk[..n]);
        if buf.len() > MAX_RESPONSE {
            return Err(context!(ErrorKind::MonitorPrompt).into());
        }

        let text = String::from_utf8_lossy(&buf);
        if let Some(before_prompt) = split_at_prompt(&text) {
            return Ok(before_prompt.to_string());
        }
    }
}

/// Locate the prompt and return the text preceding the line it starts on,
/// or `None` if no prompt has been received yet.
fn split_at_prompt(text: &str) -> Option<&str> {
    let marker = text.rfind(") ")?;
    let open = text[..marker].rfind('(')?;
    let line_start = match text[..open].rfind('\n') {
        Some(p) => p + 1,
        None => 0,
    };
    Some(&text[..line_start])
}

/// Strip an optional leading blank line, the echoed command line, and
/// trailing whitespace from a raw monitor reply.
fn strip_response(raw: &str) -> String {
    let mut start = 0;
    if raw.starts_with('\n') {
        start = 1;
    }
    if let Some(pos) = raw[start..].find('\n') {
        start += pos + 1;
    }
    raw[start..]
        .trim_end_matches(|c| c == '\n' || c == '\r' || c == ' ')
        .to_string()
}

/// Parse the output of the monitor verb `peripherals`.
///
/// A line ending in `:` opens a new bus section; every other non-empty line
/// of the shape `<name> (<type>)` names a peripheral whose path is
/// `<bus>.<name>`, or `<name>` alone before any bus section. Lines that do
/// not match are skipped.
pub fn parse_peripheral_listing(output: &str) -> Vec<PeripheralEntry> {
    let mut entries = Vec::new();
    let mut bus: Option<String> = None;

    for line in output.lines() {
        let line = line.trim_end();
        if line.is_empty() {
            continue;
        }
        if line.ends_with(':') {
            bus = Some(line.trim_start().trim_end_matches(':').to_string());
            continue;
        }

        let entry = line.trim_start();
        let open = match entry.find('(') {
            Some(p) => p,
            None => continue,
        };
        if !entry.ends_with(')') {
            continue;
        }
        let name = entry[..open].trim_end();
        let kind = &entry[open + 1..entry.len() - 1];
        if name.is_empty() || name.contains(' ') || kind.is_empty() {
            continue;
        }

        let path = match &bus {
            Some(b) => format!("{}.{}", b, name),
            None => name.to_string(),
        };
        entries.push(PeripheralEntry {
            path,
            name: name.to_string(),
            kind: kind.to_string(),
        });
    }
    entries
}
