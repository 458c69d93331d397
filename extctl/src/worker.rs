//! The task boundary between a UI thread and the protocol session.
//!
//! A [`SimulationWorker`] hosts the client on a dedicated background thread.
//! The owner posts [`Command`] values, which never block, and receives
//! [`WorkerEvent`] values over the channel it supplied at spawn time.
//! Commands execute in FIFO order; between commands the worker drains
//! pending event frames, so GPIO callbacks keep flowing while the session is
//! otherwise idle. Protocol callbacks are re-posted as events, never invoked
//! inline on the owner.

use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::error::*;
use crate::launch::{launch_and_connect, EmulatorProcess, LaunchConfig};
use crate::machine::{Adc, Gpio, Machine};
use crate::{Client, GpioState, TimeUnit};

const IDLE_POLL: Duration = Duration::from_millis(50);

/// Pin probing stops at the first inaccessible pin, or here.
const GPIO_PROBE_LIMIT: i32 = 64;

/// Commands accepted by the worker.
#[derive(Debug)]
pub enum Command {
    /// Launch an emulator from `config`, connect, handshake, connect the
    /// monitor and acquire `machine`.
    Connect {
        config: LaunchConfig,
        machine: String,
    },
    /// Like `Connect`, against an already-running server.
    Attach {
        host: String,
        port: u16,
        monitor_port: u16,
        machine: String,
    },
    Disconnect,
    RunFor {
        duration: u64,
        unit: TimeUnit,
    },
    Pause,
    Resume,
    Reset,
    LoadConfiguration {
        path: String,
    },
    GetTime,
    DiscoverPeripherals,
    RefreshGpio {
        path: String,
        pin_count: i32,
    },
    SetGpioPin {
        path: String,
        pin: i32,
        state: GpioState,
    },
    RefreshAdc {
        path: String,
    },
    SetAdcChannel {
        path: String,
        channel: i32,
        value: f64,
    },
    Shutdown,
}

/// A discovered GPIO port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GpioPortInfo {
    pub path: String,
    pub name: String,
    pub pin_count: i32,
}

/// A discovered ADC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdcPortInfo {
    pub path: String,
    pub name: String,
}

/// Events delivered back to the worker's owner.
#[derive(Debug)]
pub enum WorkerEvent {
    Connected {
        machine: String,
        descriptor: i32,
    },
    ConnectionFailed {
        message: String,
    },
    Disconnected,
    SimulationTimeUpdated {
        microseconds: u64,
    },
    RunForCompleted,
    RunForFailed {
        message: String,
    },
    Paused,
    Resumed,
    ResetDone,
    OperationFailed {
        operation: String,
        message: String,
    },
    GpioStatesUpdated {
        path: String,
        pins: Vec<(i32, GpioState)>,
    },
    GpioPinChanged {
        path: String,
        pin: i32,
        state: GpioState,
    },
    AdcDataUpdated {
        path: String,
        channel_count: u32,
        channels: Vec<(i32, f64)>,
    },
    PeripheralsDiscovered {
        gpio_ports: Vec<GpioPortInfo>,
        adc_ports: Vec<AdcPortInfo>,
    },
}

/// Handle to the background worker thread.
///
/// Dropping the handle shuts the worker down and joins the thread.
pub struct SimulationWorker {
    commands: Sender<Command>,
    thread: Option<thread::JoinHandle<()>>,
}

impl SimulationWorker {
    /// Start the worker thread. Events are delivered on `events`.
    pub fn spawn(events: Sender<WorkerEvent>) -> Result<SimulationWorker> {
        let (commands, receiver) = mpsc::channel();
        let thread = thread::Builder::new()
            .name("extctl-worker".to_string())
            .spawn(move || WorkerState::new(events).run(receiver))
            .map_err(map_context!())?;
        Ok(SimulationWorker {
            commands,
            thread: Some(thread),
        })
    }

    /// Queue a command. Never blocks; fails only when the worker thread is
    /// gone.
    pub fn post(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| Error::from(context!(ErrorKind::WorkerStopped)))
    }
}

impl Drop for SimulationWorker {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Shutdown);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

struct WorkerState {
    events: Sender<WorkerEvent>,
    client: Option<Client>,
    process: Option<EmulatorProcess>,
    machine: Option<Arc<Machine>>,
    gpios: HashMap<String, Gpio>,
    adcs: HashMap<String, Adc>,
    callback_handles: Vec<(String, u32)>,
}

impl WorkerState {
    fn new(events: Sender<WorkerEvent>) -> WorkerState {
        WorkerState {
            events,
            client: None,
            process: None,
            machine: None,
            gpios: HashMap::new(),
            adcs: HashMap::new(),
            callback_handles: Vec::new(),
        }
    }

    fn run(mut self, commands: Receiver<Command>) {
        loop {
            match commands.recv_timeout(IDLE_POLL) {
                Ok(Command::Shutdown) => break,
                Ok(command) => self.handle(command),
                Err(RecvTimeoutError::Timeout) => self.pump(),
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        self.teardown();
        log::debug!("worker thread exiting");
    }

    fn emit(&self, event: WorkerEvent) {
        if self.events.send(event).is_err() {
            log::debug!("event receiver dropped");
        }
    }

    /// Drain event frames while no command is queued.
    fn pump(&mut self) {
        let client = match &self.client {
            Some(client) => client,
            None => return,
        };
        match client.poll_events() {
            Ok(_) => {}
            Err(e) => {
                if matches!(
                    e.kind(),
                    ErrorKind::ConnectionClosed | ErrorKind::NotConnected
                ) {
                    log::warn!("control connection lost: {}", e);
                    self.emit(WorkerEvent::Disconnected);
                    self.teardown();
                } else {
                    log::warn!("event pump error: {}", e);
                }
            }
        }
    }

    fn handle(&mut self, command: Command) {
        log::debug!("command: {:?}", command);
        match command {
            Command::Connect { config, machine } => {
                let result = self.bring_up_launched(&config, &machine);
                self.finish_connect(result);
            }
            Command::Attach {
                host,
                port,
                monitor_port,
                machine,
            } => {
                let result = self.bring_up_attached(&host, port, monitor_port, &machine);
                self.finish_connect(result);
            }
            Command::Disconnect => {
                self.teardown();
                self.emit(WorkerEvent::Disconnected);
            }
            Command::RunFor { duration, unit } => self.run_for(duration, unit),
            Command::Pause => match self.machine().and_then(|m| m.pause()) {
                Ok(()) => self.emit(WorkerEvent::Paused),
                Err(e) => self.fail("pause", e),
            },
            Command::Resume => match self.machine().and_then(|m| m.resume()) {
                Ok(()) => self.emit(WorkerEvent::Resumed),
                Err(e) => self.fail("resume", e),
            },
            Command::Reset => match self.machine().and_then(|m| m.reset()) {
                Ok(()) => self.emit(WorkerEvent::ResetDone),
                Err(e) => self.fail("reset", e),
            },
            Command::LoadConfiguration { path } => {
                if let Err(e) = self.machine().and_then(|m| m.load_configuration(&path)) {
                    self.fail("loadConfiguration", e);
                }
            }
            Command::GetTime => match self.machine().and_then(|m| m.get_time(TimeUnit::Microseconds)) {
                Ok(microseconds) => self.emit(WorkerEvent::SimulationTimeUpdated { microseconds }),
                Err(e) => log::warn!("getTime failed: {}", e),
            },
            Command::DiscoverPeripherals => self.discover(),
            Command::RefreshGpio { path, pin_count } => self.refresh_gpio(&path, pin_count),
            Command::SetGpioPin { path, pin, state } => self.set_gpio_pin(&path, pin, state),
            Command::RefreshAdc { path } => self.refresh_adc(&path),
            Command::SetAdcChannel {
                path,
                channel,
                value,
            } => self.set_adc_channel(&path, channel, value),
            Command::Shutdown => unreachable!("handled by the run loop"),
        }
    }

    fn machine(&self) -> Result<Arc<Machine>> {
        self.machine
            .clone()
            .ok_or_else(|| Error::from(context!(ErrorKind::NotConnected)))
    }

    /// Report a failed operation. A desync or lost connection tears the
    /// session down and surfaces `Disconnected` + `ConnectionFailed`.
    fn fail(&mut self, operation: &str, error: Error) {
        log::warn!("{} failed: {}", operation, error);
        if matches!(
            error.kind(),
            ErrorKind::ProtocolDesync(_) | ErrorKind::ConnectionClosed
        ) {
            self.teardown();
            self.emit(WorkerEvent::Disconnected);
            self.emit(WorkerEvent::ConnectionFailed {
                message: error.to_string(),
            });
        } else {
            self.emit(WorkerEvent::OperationFailed {
                operation: operation.to_string(),
                message: error.to_string(),
            });
        }
    }

    fn finish_connect(&mut self, result: Result<(String, i32)>) {
        match result {
            Ok((machine, descriptor)) => {
                self.emit(WorkerEvent::Connected {
                    machine,
                    descriptor,
                });
            }
            Err(e) => {
                log::warn!("connect failed: {}", e);
                self.teardown();
                self.emit(WorkerEvent::ConnectionFailed {
                    message: e.to_string(),
                });
            }
        }
    }

    fn bring_up_launched(
        &mut self,
        config: &LaunchConfig,
        machine_name: &str,
    ) -> Result<(String, i32)> {
        let (process, client) = launch_and_connect(config)?;
        self.process = Some(process);
        self.finish_bring_up(client, &config.host, config.monitor_port, machine_name)
    }

    fn bring_up_attached(
        &mut self,
        host: &str,
        port: u16,
        monitor_port: u16,
        machine_name: &str,
    ) -> Result<(String, i32)> {
        let client = Client::connect(host, port)?;
        self.finish_bring_up(client, host, monitor_port, machine_name)
    }

    fn finish_bring_up(
        &mut self,
        client: Client,
        host: &str,
        monitor_port: u16,
        machine_name: &str,
    ) -> Result<(String, i32)> {
        client.handshake()?;
        if monitor_port > 0 {
            client.connect_monitor(host, monitor_port)?;
        }
        let machine = client.get_machine(machine_name)?;
        let summary = (machine.name().to_string(), machine.descriptor());
        self.machine = Some(machine);
        self.client = Some(client);
        Ok(summary)
    }

    fn run_for(&mut self, duration: u64, unit: TimeUnit) {
        let machine = match self.machine() {
            Ok(machine) => machine,
            Err(e) => {
                return self.emit(WorkerEvent::RunForFailed {
                    message: e.to_string(),
                });
            }
        };
        if let Err(e) = machine.run_for(duration, unit) {
            log::warn!("runFor failed: {}", e);
            if matches!(
                e.kind(),
                ErrorKind::ProtocolDesync(_) | ErrorKind::ConnectionClosed
            ) {
                return self.fail("runFor", e);
            }
            return self.emit(WorkerEvent::RunForFailed {
                message: e.to_string(),
            });
        }
        match machine.get_time(TimeUnit::Microseconds) {
            Ok(microseconds) => self.emit(WorkerEvent::SimulationTimeUpdated { microseconds }),
            Err(e) => log::warn!("getTime after runFor failed: {}", e),
        }
        self.emit(WorkerEvent::RunForCompleted);
    }

    fn ensure_gpio(&mut self, path: &str) -> Result<()> {
        if self.gpios.contains_key(path) {
            return Ok(());
        }
        let machine = self.machine()?;
        let gpio = machine.get_gpio(path)?;
        self.install_gpio_callback(path, &gpio)?;
        self.gpios.insert(path.to_string(), gpio);
        Ok(())
    }

    /// Install one state-change callback per port.
    ///
    /// The server may fan a single registration out to every pin of the
    /// port, so per-pin registration risks duplicate deliveries; one
    /// registration per port keeps the event stream flat either way.
    fn install_gpio_callback(&mut self, path: &str, gpio: &Gpio) -> Result<()> {
        if self.callback_handles.iter().any(|(p, _)| p == path) {
            return Ok(());
        }
        let events = self.events.clone();
        let event_path = path.to_string();
        let handle = gpio.register_state_change(0, move |pin, state| {
            let _ = events.send(WorkerEvent::GpioPinChanged {
                path: event_path.clone(),
                pin,
                state,
            });
        })?;
        self.callback_handles.push((path.to_string(), handle));
        Ok(())
    }

    fn ensure_adc(&mut self, path: &str) -> Result<()> {
        if self.adcs.contains_key(path) {
            return Ok(());
        }
        let machine = self.machine()?;
        let adc = machine.get_adc(path)?;
        self.adcs.insert(path.to_string(), adc);
        Ok(())
    }

    fn refresh_gpio(&mut self, path: &str, pin_count: i32) {
        if let Err(e) = self.ensure_gpio(path) {
            self.gpios.remove(path);
            return self.fail("refreshGpio", e);
        }
        let gpio = &self.gpios[path];
        let mut pins = Vec::with_capacity(pin_count.max(0) as usize);
        for pin in 0..pin_count {
            match gpio.get_state(pin) {
                Ok(state) => pins.push((pin, state)),
                Err(e) => log::warn!("getState failed for pin {}: {}", pin, e),
            }
        }
        self.emit(WorkerEvent::GpioStatesUpdated {
            path: path.to_string(),
            pins,
        });
    }

    fn set_gpio_pin(&mut self, path: &str, pin: i32, state: GpioState) {
        let result = match self.gpios.get(path) {
            Some(gpio) => gpio.set_state(pin, state),
            None => {
                return self.emit(WorkerEvent::OperationFailed {
                    operation: "setGpioPin".to_string(),
                    message: "GPIO peripheral not initialized".to_string(),
                });
            }
        };
        if let Err(e) = result {
            self.fail("setGpioPin", e);
        }
    }

    fn refresh_adc(&mut self, path: &str) {
        if let Err(e) = self.ensure_adc(path) {
            self.adcs.remove(path);
            return self.fail("refreshAdc", e);
        }
        let adc = &self.adcs[path];
        let channel_count = match adc.get_channel_count() {
            Ok(count) => count,
            Err(e) => return self.fail("refreshAdc", e),
        };
        let mut channels = Vec::with_capacity(channel_count as usize);
        for channel in 0..channel_count as i32 {
            match adc.get_channel_value(channel) {
                Ok(value) => channels.push((channel, value)),
                Err(e) => log::warn!("getChannelValue failed for channel {}: {}", channel, e),
            }
        }
        self.emit(WorkerEvent::AdcDataUpdated {
            path: path.to_string(),
            channel_count,
            channels,
        });
    }

    fn set_adc_channel(&mut self, path: &str, channel: i32, value: f64) {
        let result = match self.adcs.get(path) {
            Some(adc) => adc.set_channel_value(channel, value),
            None => {
                return self.emit(WorkerEvent::OperationFailed {
                    operation: "setAdcChannel".to_string(),
                    message: "ADC peripheral not initialized".to_string(),
                });
            }
        };
        if let Err(e) = result {
            self.fail("setAdcChannel", e);
        }
    }

    /// Walk the monitor's peripheral listing, registering every GPIO and ADC
    /// it names. GPIO pin counts are probed by reading pins until the first
    /// per-pin error.
    fn discover(&mut self) {
        let machine = match self.machine() {
            Ok(machine) => machine,
            Err(e) => return self.fail("discoverPeripherals", e),
        };
        let listing = match machine.list_peripherals() {
            Ok(listing) => listing,
            Err(e) => return self.fail("discoverPeripherals", e),
        };

        let mut gpio_ports = Vec::new();
        let mut adc_ports = Vec::new();
        for entry in listing {
            let kind = entry.kind.to_ascii_lowercase();
            if kind.contains("gpio") {
                if let Err(e) = self.ensure_gpio(&entry.path) {
                    log::warn!("skipping GPIO {}: {}", entry.path, e);
                    self.gpios.remove(&entry.path);
                    continue;
                }
                let gpio = &self.gpios[&entry.path];
                let mut pin_count = 0;
                for pin in 0..GPIO_PROBE_LIMIT {
                    if gpio.get_state(pin).is_err() {
                        break;
                    }
                    pin_count = pin + 1;
                }
                if pin_count == 0 {
                    log::warn!("GPIO {}: no pins accessible, skipping", entry.path);
                    continue;
                }
                gpio_ports.push(GpioPortInfo {
                    path: entry.path,
                    name: entry.name,
                    pin_count,
                });
            } else if kind.contains("adc") {
                if let Err(e) = self.ensure_adc(&entry.path) {
                    log::warn!("skipping ADC {}: {}", entry.path, e);
                    self.adcs.remove(&entry.path);
                    continue;
                }
                adc_ports.push(AdcPortInfo {
                    path: entry.path,
                    name: entry.name,
                });
            }
        }

        log::debug!(
            "discovered {} GPIO port(s), {} ADC(s)",
            gpio_ports.len(),
            adc_ports.len()
        );
        self.emit(WorkerEvent::PeripheralsDiscovered {
            gpio_ports,
            adc_ports,
        });
    }

    fn teardown(&mut self) {
        for (path, handle) in self.callback_handles.drain(..) {
            if let Some(gpio) = self.gpios.get(&path) {
                let _ = gpio.unregister_state_change(handle);
            }
        }
        self.adcs.clear();
        self.gpios.clear();
        self.machine = None;
        if let Some(client) = self.client.take() {
            client.disconnect();
        }
        // Dropping the process handle terminates the emulator.
        self.process = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_without_a_connection_fail_cleanly() {
        let (tx, rx) = mpsc::channel();
        let worker = SimulationWorker::spawn(tx).unwrap();

        worker
            .post(Command::RunFor {
                duration: 1,
                unit: TimeUnit::Milliseconds,
            })
            .unwrap();
        match rx.recv_timeout(Duration::from_secs(5)).unwrap() {
            WorkerEvent::RunForFailed { .. } => {}
            other => panic!("unexpected event {:?}", other),
        }

        worker.post(Command::Pause).unwrap();
        match rx.recv_timeout(Duration::from_secs(5)).unwrap() {
            WorkerEvent::OperationFailed { operation, .. } => assert_eq!(operation, "pause"),
            other => panic!("unexpected event {:?}", other),
        }

        worker
            .post(Command::SetGpioPin {
                path: "sysbus.gpio0".to_string(),
                pin: 0,
                state: GpioState::High,
            })
            .unwrap();
        match rx.recv_timeout(Duration::from_secs(5)).unwrap() {
            WorkerEvent::OperationFailed { operation, .. } => assert_eq!(operation, "setGpioPin"),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn worker_shuts_down_on_drop() {
        let (tx, _rx) = mpsc::channel();
        let worker = SimulationWorker::spawn(tx).unwrap();
        drop(worker);
    }
}
