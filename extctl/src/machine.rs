//! Machines and their peripherals.
//!
//! A [`Machine`] is acquired by name from the server and identified by a
//! non-negative 32-bit descriptor. Peripherals follow one registration
//! pattern: the client sends `i32(-1)`, the machine descriptor and the
//! dotted peripheral path, and the server answers with the instance
//! identifier that addresses every subsequent sub-command.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, Weak};

use crate::error::*;
use crate::monitor::{parse_peripheral_listing, Monitor, PeripheralEntry};
use crate::{codec, AccessWidth, ApiCommand, GpioState, SessionCore, TimeUnit};

const GPIO_GET_STATE: u8 = 0;
const GPIO_SET_STATE: u8 = 1;
const GPIO_REGISTER_EVENT: u8 = 2;

const ADC_GET_CHANNEL_COUNT: u8 = 0;
const ADC_GET_CHANNEL_VALUE: u8 = 1;
const ADC_SET_CHANNEL_VALUE: u8 = 2;

const BUS_READ: u8 = 0;
const BUS_WRITE: u8 = 1;

/// One emulated machine on the server.
///
/// Lifecycle and time operations go over the control channel where an opcode
/// exists (`run_for`, `get_time`) and over the monitor channel otherwise
/// (`pause`, `resume`, `reset`, `load_configuration`, `is_running`,
/// `list_peripherals`).
pub struct Machine {
    name: String,
    descriptor: i32,
    session: Arc<SessionCore>,
}

impl Machine {
    pub(crate) fn acquire(core: &Arc<SessionCore>, name: &str) -> Result<Arc<Machine>> {
        let mut payload = Vec::new();
        codec::put_str(&mut payload, name);
        let reply = core.exchange(ApiCommand::GetMachine, &payload)?;
        if reply.len() != 4 {
            return Err(context!(ErrorKind::UnexpectedReplySize {
                expected: 4,
                got: reply.len(),
            })
            .into());
        }
        let descriptor = codec::get_i32(&reply, 0)?;
        if descriptor < 0 {
            return Err(context!(ErrorKind::MachineNotFound(name.to_string())).into());
        }

        let mut machines = core.machines.lock().unwrap();
        if let Some(existing) = machines.get(name).and_then(Weak::upgrade) {
            return Ok(existing);
        }
        let machine = Arc::new(Machine {
            name: name.to_string(),
            descriptor,
            session: core.clone(),
        });
        machines.insert(name.to_string(), Arc::downgrade(&machine));
        Ok(machine)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The server-assigned machine descriptor, always non-negative.
    pub fn descriptor(&self) -> i32 {
        self.descriptor
    }

    fn monitor(&self) -> Result<Arc<Monitor>> {
        self.session
            .monitor
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| Error::from(context!(ErrorKind::MonitorNotConnected)))
    }

    /// Advance the simulation by `duration` in `unit`.
    ///
    /// The server may interleave event frames with the response; they are
    /// dispatched before this call returns.
    pub fn run_for(&self, duration: u64, unit: TimeUnit) -> Result<()> {
        let mut payload = Vec::with_capacity(8);
        codec::put_u64(&mut payload, duration.saturating_mul(unit.multiplier()));
        self.session.exchange(ApiCommand::RunFor, &payload)?;
        Ok(())
    }

    /// Current simulation time, divided down into `unit`.
    pub fn get_time(&self, unit: TimeUnit) -> Result<u64> {
        // The request carries an 8-byte placeholder.
        let mut payload = Vec::with_capacity(8);
        codec::put_u64(&mut payload, 0);
        let reply = self.session.exchange(ApiCommand::GetTime, &payload)?;
        if reply.len() != 8 {
            return Err(context!(ErrorKind::UnexpectedReplySize {
                expected: 8,
                got: reply.len(),
            })
            .into());
        }
        Ok(codec::get_u64(&reply, 0)? / unit.multiplier())
    }

    pub fn pause(&self) -> Result<()> {
        self.monitor()?.pause()
    }

    pub fn resume(&self) -> Result<()> {
        self.monitor()?.start()
    }

    pub fn reset(&self) -> Result<()> {
        self.monitor()?.reset()
    }

    /// Load an image or platform description, picking the monitor verb by
    /// file extension: `.elf` (case-insensitive) loads through the system
    /// bus, anything else through the platform description loader.
    pub fn load_configuration(&self, path: &str) -> Result<()> {
        let monitor = self.monitor()?;
        if is_elf_path(path) {
            monitor.load_elf(path)
        } else {
            monitor.load_platform_description(path)
        }
    }

    pub fn is_running(&self) -> Result<bool> {
        let reply = self.monitor()?.execute("emulation IsStarted")?;
        Ok(reply.contains("True"))
    }

    /// Discover peripherals via the monitor's `peripherals` verb.
    pub fn list_peripherals(&self) -> Result<Vec<PeripheralEntry>> {
        let listing = self.monitor()?.execute("peripherals")?;
        Ok(parse_peripheral_listing(&listing))
    }

    pub fn get_gpio(&self, path: &str) -> Result<Gpio> {
        let instance = self.register_peripheral(ApiCommand::Gpio, path)?;
        Ok(Gpio {
            path: path.to_string(),
            session: self.session.clone(),
            instance,
            handles: Mutex::new(GpioHandles {
                next: 0,
                events: HashMap::new(),
            }),
        })
    }

    pub fn get_adc(&self, path: &str) -> Result<Adc> {
        let instance = self.register_peripheral(ApiCommand::Adc, path)?;
        Ok(Adc {
            path: path.to_string(),
            session: self.session.clone(),
            instance,
        })
    }

    pub fn get_sys_bus(&self, path: &str) -> Result<SysBus> {
        let instance = self.register_peripheral(ApiCommand::SystemBus, path)?;
        Ok(SysBus {
            path: path.to_string(),
            session: self.session.clone(),
            instance,
        })
    }

    /// The registration exchange shared by every peripheral type.
    fn register_peripheral(&self, command: ApiCommand, path: &str) -> Result<i32> {
        if self.descriptor < 0 {
            return Err(context!(ErrorKind::NotRegistered(self.name.clone())).into());
        }
        let mut payload = Vec::new();
        codec::put_i32(&mut payload, -1);
        codec::put_i32(&mut payload, self.descriptor);
        codec::put_str(&mut payload, path);
        let reply = self.session.exchange(command, &payload)?;
        if reply.len() != 4 {
            return Err(context!(ErrorKind::UnexpectedReplySize {
                expected: 4,
                got: reply.len(),
            })
            .into());
        }
        let instance = codec::get_i32(&reply, 0)?;
        if instance < 0 {
            return Err(context!(ErrorKind::RegistrationFailed(path.to_string())).into());
        }
        Ok(instance)
    }
}

fn is_elf_path(path: &str) -> bool {
    Path::new(path)
        .extension()
        .map(|e| e.eq_ignore_ascii_case("elf"))
        .unwrap_or(false)
}

struct GpioHandles {
    next: u32,
    /// Local handle → server event descriptor.
    events: HashMap<u32, u32>,
}

/// A GPIO port peripheral.
///
/// Peripherals are handles into the session that registered them: the
/// server-assigned instance identifier plus the shared session core. They
/// stop working, with `NotConnected`, once the session disconnects.
pub struct Gpio {
    path: String,
    session: Arc<SessionCore>,
    instance: i32,
    handles: Mutex<GpioHandles>,
}

impl Gpio {
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn instance_id(&self) -> i32 {
        self.instance
    }

    fn subcommand(&self, sub: u8, args: &[u8]) -> Result<Vec<u8>> {
        if self.instance < 0 {
            return Err(context!(ErrorKind::NotRegistered(self.path.clone())).into());
        }
        let mut payload = Vec::with_capacity(5 + args.len());
        codec::put_i32(&mut payload, self.instance);
        payload.push(sub);
        payload.extend_from_slice(args);
        self.session.exchange(ApiCommand::Gpio, &payload)
    }

    pub fn get_state(&self, pin: i32) -> Result<GpioState> {
        let mut args = Vec::with_capacity(4);
        codec::put_i32(&mut args, pin);
        let reply = self.subcommand(GPIO_GET_STATE, &args)?;
        if reply.len() != 1 {
            return Err(context!(ErrorKind::UnexpectedReplySize {
                expected: 1,
                got: reply.len(),
            })
            .into());
        }
        GpioState::from_u8(reply[0]).ok_or_else(|| {
            Error::from(context!(ErrorKind::InvalidResponse(format!(
                "GPIO state byte {:#04x}",
                reply[0]
            ))))
        })
    }

    pub fn set_state(&self, pin: i32, state: GpioState) -> Result<()> {
        let mut args = Vec::with_capacity(5);
        codec::put_i32(&mut args, pin);
        args.push(state as u8);
        self.subcommand(GPIO_SET_STATE, &args)?;
        Ok(())
    }

    /// Register a state-change callback for `pin` and return a local handle.
    ///
    /// The server reports changes as event frames carrying a microsecond
    /// timestamp and the new level; the callback receives the pin and the
    /// decoded state. It runs on whichever thread is draining the socket, so
    /// it must stay short; typically it forwards into a channel.
    pub fn register_state_change<F>(&self, pin: i32, callback: F) -> Result<u32>
    where
        F: Fn(i32, GpioState) + Send + 'static,
    {
        if self.instance < 0 {
            return Err(context!(ErrorKind::NotRegistered(self.path.clone())).into());
        }

        let registry = &self.session.events;
        let ed = registry.register(Box::new(move |data: &[u8]| {
            // u64 timestamp, u8 state
            if data.len() < 9 {
                log::warn!("short GPIO event payload: {} bytes", data.len());
                return;
            }
            let state = if data[8] == 0 {
                GpioState::Low
            } else {
                GpioState::High
            };
            callback(pin, state);
        }));

        let mut args = Vec::with_capacity(8);
        codec::put_i32(&mut args, pin);
        codec::put_u32(&mut args, ed);
        match self.subcommand(GPIO_REGISTER_EVENT, &args) {
            Ok(_) => {
                let mut handles = self.handles.lock().unwrap();
                let handle = handles.next;
                handles.next += 1;
                handles.events.insert(handle, ed);
                Ok(handle)
            }
            Err(e) => {
                registry.unregister(ed);
                Err(e)
            }
        }
    }

    /// Remove a callback registered with [`Gpio::register_state_change`].
    ///
    /// Only unhooks the local dispatch; the server keeps emitting events for
    /// the descriptor, which are then dropped.
    pub fn unregister_state_change(&self, handle: u32) -> Result<()> {
        let ed = self
            .handles
            .lock()
            .unwrap()
            .events
            .remove(&handle)
            .ok_or_else(|| {
                Error::from(context!(ErrorKind::NotRegistered(format!(
                    "gpio callback handle {}",
                    handle
                ))))
            })?;
        self.session.events.unregister(ed);
        Ok(())
    }
}

/// An ADC peripheral.
///
/// The wire carries raw 4-byte channel values; the public type is `f64`
/// with `f64::from(raw)` on read and `value as u32` on write, so fractional
/// parts are lost on the wire.
pub struct Adc {
    path: String,
    session: Arc<SessionCore>,
    instance: i32,
}

impl Adc {
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn instance_id(&self) -> i32 {
        self.instance
    }

    fn subcommand(&self, sub: u8, args: &[u8]) -> Result<Vec<u8>> {
        if self.instance < 0 {
            return Err(context!(ErrorKind::NotRegistered(self.path.clone())).into());
        }
        let mut payload = Vec::with_capacity(5 + args.len());
        codec::put_i32(&mut payload, self.instance);
        payload.push(sub);
        payload.extend_from_slice(args);
        self.session.exchange(ApiCommand::Adc, &payload)
    }

    pub fn get_channel_count(&self) -> Result<u32> {
        let reply = self.subcommand(ADC_GET_CHANNEL_COUNT, &[])?;
        if reply.len() != 4 {
            return Err(context!(ErrorKind::UnexpectedReplySize {
                expected: 4,
                got: reply.len(),
            })
            .into());
        }
        codec::get_u32(&reply, 0)
    }

    pub fn get_channel_value(&self, channel: i32) -> Result<f64> {
        let mut args = Vec::with_capacity(4);
        codec::put_i32(&mut args, channel);
        let reply = self.subcommand(ADC_GET_CHANNEL_VALUE, &args)?;
        if reply.len() != 4 {
            return Err(context!(ErrorKind::UnexpectedReplySize {
                expected: 4,
                got: reply.len(),
            })
            .into());
        }
        Ok(f64::from(codec::get_u32(&reply, 0)?))
    }

    pub fn set_channel_value(&self, channel: i32, value: f64) -> Result<()> {
        let mut args = Vec::with_capacity(8);
        codec::put_i32(&mut args, channel);
        codec::put_u32(&mut args, value as u32);
        self.subcommand(ADC_SET_CHANNEL_VALUE, &args)?;
        Ok(())
    }
}

/// The system bus peripheral. Access goes through a [`BusContext`].
pub struct SysBus {
    path: String,
    session: Arc<SessionCore>,
    instance: i32,
}

impl SysBus {
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn instance_id(&self) -> i32 {
        self.instance
    }

    /// A context for a target node. The context addresses the bus with this
    /// sys-bus instance identifier; `node_path` only labels it.
    pub fn bus_context(&self, node_path: &str) -> BusContext {
        BusContext {
            path: node_path.to_string(),
            session: self.session.clone(),
            instance: self.instance,
        }
    }
}

/// Read/write access to the system bus.
pub struct BusContext {
    path: String,
    session: Arc<SessionCore>,
    instance: i32,
}

impl BusContext {
    pub fn path(&self) -> &str {
        &self.path
    }

    fn bus_exchange(
        &self,
        op: u8,
        width: AccessWidth,
        address: u64,
        count: u32,
        data: &[u8],
    ) -> Result<Vec<u8>> {
        if self.instance < 0 {
            return Err(context!(ErrorKind::NotRegistered(self.path.clone())).into());
        }
        let mut payload = Vec::with_capacity(18 + data.len());
        codec::put_i32(&mut payload, self.instance);
        payload.push(op);
        payload.push(width as u8);
        codec::put_u64(&mut payload, address);
        codec::put_u32(&mut payload, count);
        payload.extend_from_slice(data);
        self.session.exchange(ApiCommand::SystemBus, &payload)
    }

    /// Read one element of `width` at `address`.
    pub fn read(&self, address: u64, width: AccessWidth) -> Result<u64> {
        let size = width.element_size();
        let reply = self.bus_exchange(BUS_READ, width, address, 1, &[])?;
        if reply.len() != size {
            return Err(context!(ErrorKind::UnexpectedReplySize {
                expected: size,
                got: reply.len(),
            })
            .into());
        }
        let mut value: u64 = 0;
        for (i, b) in reply.iter().enumerate() {
            value |= u64::from(*b) << (8 * i);
        }
        Ok(value)
    }

    /// Write one element of `width` to `address`.
    pub fn write(&self, address: u64, width: AccessWidth, value: u64) -> Result<()> {
        let size = width.element_size();
        let bytes = value.to_le_bytes();
        self.bus_exchange(BUS_WRITE, width, address, 1, &bytes[..size])?;
        Ok(())
    }

    /// Read `count` elements of `width` starting at `address`, returned as
    /// raw little-endian bytes.
    pub fn read_block(&self, address: u64, width: AccessWidth, count: u32) -> Result<Vec<u8>> {
        let expected = width.element_size() * count as usize;
        let reply = self.bus_exchange(BUS_READ, width, address, count, &[])?;
        if reply.len() != expected {
            return Err(context!(ErrorKind::UnexpectedReplySize {
                expected,
                got: reply.len(),
            })
            .into());
        }
        Ok(reply)
    }

    /// Write raw little-endian element data starting at `address`. The data
    /// length must be a whole number of `width` elements.
    pub fn write_block(&self, address: u64, width: AccessWidth, data: &[u8]) -> Result<()> {
        let size = width.element_size();
        if data.is_empty() || data.len() % size != 0 {
            return Err(context!(ErrorKind::InvalidResponse(format!(
                "write of {} bytes is not a multiple of element size {}",
                data.len(),
                size
            )))
            .into());
        }
        let count = (data.len() / size) as u32;
        self.bus_exchange(BUS_WRITE, width, address, count, data)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SessionCore;
    use std::sync::Arc;

    fn offline_machine() -> Arc<Machine> {
        Arc::new(Machine {
            name: "test".to_string(),
            descriptor: 0,
            session: Arc::new(SessionCore::new(None, None)),
        })
    }

    #[test]
    fn unregistered_peripheral_refuses_subcommands() {
        let machine = offline_machine();
        let gpio = Gpio {
            path: "sysbus.gpio0".to_string(),
            session: machine.session.clone(),
            instance: -1,
            handles: Mutex::new(GpioHandles {
                next: 0,
                events: HashMap::new(),
            }),
        };

        // The session has no socket; a NotRegistered error (rather than
        // NotConnected) proves the guard fires before any traffic.
        for result in vec![
            gpio.get_state(0).map(|_| ()),
            gpio.set_state(0, GpioState::High),
            gpio.register_state_change(0, |_, _| {}).map(|_| ()),
        ] {
            match result {
                Err(e) => match e.kind() {
                    ErrorKind::NotRegistered(_) => {}
                    kind => panic!("unexpected error {:?}", kind),
                },
                Ok(_) => panic!("expected NotRegistered"),
            }
        }
        assert!(machine.session.events.is_empty());

        let adc = Adc {
            path: "sysbus.adc0".to_string(),
            session: machine.session.clone(),
            instance: -1,
        };
        assert!(adc.get_channel_count().is_err());

        let bus = BusContext {
            path: "mem".to_string(),
            session: machine.session.clone(),
            instance: -1,
        };
        match bus.read(0, AccessWidth::DoubleWord) {
            Err(e) => match e.kind() {
                ErrorKind::NotRegistered(_) => {}
                kind => panic!("unexpected error {:?}", kind),
            },
            Ok(_) => panic!("expected NotRegistered"),
        }
    }

    #[test]
    fn unknown_callback_handle_errors() {
        let machine = offline_machine();
        let gpio = Gpio {
            path: "sysbus.gpio0".to_string(),
            session: machine.session.clone(),
            instance: 3,
            handles: Mutex::new(GpioHandles {
                next: 0,
                events: HashMap::new(),
            }),
        };
        assert!(gpio.unregister_state_change(7).is_err());
    }

    #[test]
    fn elf_extension_detection() {
        for path in &["firmware.elf", "firmware.ELF", "dir.pd/fw.Elf"] {
            assert!(is_elf_path(path), "{}", path);
        }
        for path in &["platform.repl", "firmware.elf.sig", "elf"] {
            assert!(!is_elf_path(path), "{}", path);
        }
    }
}
