//! Asynchronous event dispatch.
//!
//! Event frames are tagged with a 32-bit event descriptor allocated by
//! [`EventRegistry::register`]. The server stamps that descriptor on every
//! event caused by the registration, and the client routes the frame payload
//! to the matching callback, either while draining interleaved frames inside
//! a synchronous exchange, or from [`poll`] between exchanges.

use std::collections::HashMap;
use std::io;
use std::sync::Mutex;

use crate::error::*;
use crate::stream::Stream;
use crate::{codec, ReturnCode, SessionCore};

/// ASYNC_EVENT frame layout, from the first byte of the frame:
///
/// ```text
/// byte  0    : return code = ASYNC_EVENT (6)
/// byte  1    : event command byte
/// bytes 2..5 : event descriptor (u32 LE)
/// bytes 6..9 : payload size (u32 LE)
/// bytes 10.. : payload
/// ```
pub(crate) const EVENT_HEADER_LEN: usize = 10;

pub type RawCallback = Box<dyn Fn(&[u8]) + Send>;

/// Session-owned mapping from server event descriptor to callback.
///
/// Descriptors are monotonic and never reused within a session. Callbacks
/// are invoked under the registry lock, so they must stay short and must not
/// call back into the registry.
pub struct EventRegistry {
    inner: Mutex<RegistryInner>,
}

struct RegistryInner {
    next_id: u32,
    callbacks: HashMap<u32, RawCallback>,
}

impl EventRegistry {
    pub(crate) fn new() -> EventRegistry {
        EventRegistry {
            inner: Mutex::new(RegistryInner {
                next_id: 0,
                callbacks: HashMap::new(),
            }),
        }
    }

    /// Store a callback and return the event descriptor to announce to the
    /// server.
    pub fn register(&self, callback: RawCallback) -> u32 {
        let mut inner = self.inner.lock().unwrap();
        let ed = inner.next_id;
        inner.next_id += 1;
        inner.callbacks.insert(ed, callback);
        ed
    }

    /// Remove a callback. Registered descriptors are never removed
    /// implicitly.
    pub fn unregister(&self, ed: u32) -> bool {
        self.inner.lock().unwrap().callbacks.remove(&ed).is_some()
    }

    /// Invoke the callback registered under `ed`, if any.
    pub fn dispatch(&self, ed: u32, data: &[u8]) -> bool {
        let inner = self.inner.lock().unwrap();
        match inner.callbacks.get(&ed) {
            Some(callback) => {
                callback(data);
                true
            }
            None => {
                log::debug!("event descriptor {} has no registered callback", ed);
                false
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().callbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Drain complete event frames from the socket buffer without disturbing
/// anything else.
///
/// Runs under the session lock, so it never races a synchronous exchange.
/// The socket is switched to non-blocking for the duration; frames are
/// peeked before they are consumed, so a partial frame or a pending
/// synchronous frame stays in the kernel buffer untouched.
pub(crate) fn poll(core: &SessionCore) -> Result<usize> {
    let mut io = core.io.lock().unwrap();
    let result = match io.stream.as_mut() {
        Some(stream) => {
            stream.set_nonblocking(true)?;
            let drained = drain_ready(stream.as_mut(), &core.events);
            let restored = stream.set_nonblocking(false);
            drained.and_then(|n| restored.map(|_| n))
        }
        None => Err(context!(ErrorKind::NotConnected).into()),
    };
    if let Err(e) = &result {
        if let ErrorKind::ConnectionClosed = e.kind() {
            io.close();
        }
    }
    result
}

fn drain_ready(stream: &mut dyn Stream, events: &EventRegistry) -> Result<usize> {
    let mut dispatched = 0;
    loop {
        let mut header = [0u8; EVENT_HEADER_LEN];
        let peeked = match stream.peek(&mut header) {
            Ok(0) => return Err(context!(ErrorKind::ConnectionClosed).into()),
            Ok(n) => n,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) => return Err(Error::from(context!(ErrorKind::Io(e.kind())))),
        };

        // A synchronous frame belongs to the exchange that requested it.
        if header[0] != ReturnCode::AsyncEvent as u8 {
            break;
        }
        if peeked < EVENT_HEADER_LEN {
            break;
        }

        let size = codec::get_u32(&header, 6)? as usize;
        let total = EVENT_HEADER_LEN + size;

        let mut frame = vec![0u8; total];
        let available = match stream.peek(&mut frame) {
            Ok(n) => n,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) => return Err(Error::from(context!(ErrorKind::Io(e.kind())))),
        };
        if available < total {
            // Partial frame; wait for the rest to arrive.
            break;
        }

        codec::read_exact(&mut *stream, &mut frame)?;
        let ed = codec::get_u32(&frame, 2)?;
        events.dispatch(ed, &frame[EVENT_HEADER_LEN..]);
        dispatched += 1;
    }
    Ok(dispatched)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn descriptors_are_monotonic() {
        let registry = EventRegistry::new();
        let a = registry.register(Box::new(|_| {}));
        let b = registry.register(Box::new(|_| {}));
        let c = registry.register(Box::new(|_| {}));
        assert!(a < b && b < c);

        // Unregistering never frees a descriptor for reuse.
        registry.unregister(b);
        let d = registry.register(Box::new(|_| {}));
        assert!(d > c);
    }

    #[test]
    fn dispatch_routes_payload() {
        let registry = EventRegistry::new();
        let (tx, rx) = mpsc::channel();
        let ed = registry.register(Box::new(move |data| {
            tx.send(data.to_vec()).unwrap();
        }));

        assert!(registry.dispatch(ed, &[1, 2, 3]));
        assert_eq!(rx.recv().unwrap(), vec![1, 2, 3]);

        assert!(!registry.dispatch(ed + 1, &[]));
    }

    #[test]
    fn unregister_stops_dispatch() {
        let registry = EventRegistry::new();
        let ed = registry.register(Box::new(|_| panic!("must not fire")));
        assert!(registry.unregister(ed));
        assert!(!registry.unregister(ed));
        assert!(!registry.dispatch(ed, &[]));
        assert!(registry.is_empty());
    }
}
