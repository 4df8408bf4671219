//! Simulated serial devices.
//!
//! `/dev/ttyPipeA<n>` and `/dev/ttyPipeB<n>` are the two ends of a null
//! modem cable: bytes written on one end are read on the other if it is
//! open, and each end's DTR/RTS drive the other end's DSR+CD/CTS. The null
//! modem wiring can be switched off and the lines seen by a device driven
//! directly with [`SerialSim::set_modem_lines`]. `/dev/ttyEcho<n>` loops
//! back onto itself.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};

use tracing::{debug, trace};

use super::{
    expect_args, RoomNotify, SendQueue, Transport, TransportFactory, TransportInput,
    TransportListener,
};
use crate::config::TransportSpec;
use crate::control::ControlKey;
use crate::error::{Error, Result};
use crate::serial::{ModemState, SerialControl, SerialSettings};

const PIPE_A: &str = "/dev/ttyPipeA";
const PIPE_B: &str = "/dev/ttyPipeB";
const ECHO: &str = "/dev/ttyEcho";

static NEXT_PORT_ID: AtomicU64 = AtomicU64::new(1);

struct OpenPort {
    id: u64,
    tx: Sender<TransportInput>,
    /// Bytes sent to this port and not read yet.
    inq: Arc<SendQueue>,
}

struct Device {
    port: Option<OpenPort>,
    settings: SerialSettings,
    null_modem: bool,
    manual_lines: u8,
    reported: u8,
    rs485: Option<(u32, u32)>,
}

impl Default for Device {
    fn default() -> Self {
        Self {
            port: None,
            settings: SerialSettings::default(),
            null_modem: true,
            manual_lines: 0,
            reported: 0,
            rs485: None,
        }
    }
}

#[derive(Default)]
struct SimState {
    devices: HashMap<String, Device>,
}

/// Registry of simulated serial devices. One per [`Env`](crate::Env).
#[derive(Clone, Default)]
pub struct SerialSim {
    state: Arc<Mutex<SimState>>,
}

/// The device wired to `path`, or `None` if `path` is not a simulated device.
fn peer_path(path: &str) -> Option<String> {
    if let Some(n) = path.strip_prefix(PIPE_A) {
        Some(format!("{}{}", PIPE_B, n))
    } else if let Some(n) = path.strip_prefix(PIPE_B) {
        Some(format!("{}{}", PIPE_A, n))
    } else if path.starts_with(ECHO) {
        Some(path.to_string())
    } else {
        None
    }
}

impl SimState {
    fn device(&mut self, path: &str) -> &mut Device {
        self.devices.entry(path.to_string()).or_default()
    }

    /// Line levels currently seen by the device at `path`.
    fn levels(&self, path: &str) -> u8 {
        let Some(dev) = self.devices.get(path) else {
            return 0;
        };
        if !dev.null_modem {
            return dev.manual_lines & 0xf0;
        }
        let Some(peer) = peer_path(path).and_then(|p| self.devices.get(&p)) else {
            return 0;
        };
        if peer.port.is_none() {
            return 0;
        }
        let mut lines = 0;
        if peer.settings.dtr_on() {
            lines |= ModemState::CD | ModemState::DSR;
        }
        if peer.settings.rts_on() {
            lines |= ModemState::CTS;
        }
        lines
    }

    /// Report line changes on both ends of the cable attached to `path`.
    fn update_lines(&mut self, path: &str) {
        let mut paths = vec![path.to_string()];
        if let Some(p) = peer_path(path) {
            if p != path {
                paths.push(p);
            }
        }
        for p in paths {
            let levels = self.levels(&p);
            let dev = self.device(&p);
            if levels == dev.reported {
                continue;
            }
            let report = ModemState::transition(ModemState(dev.reported), ModemState(levels));
            dev.reported = levels;
            if let Some(port) = &dev.port {
                trace!(path = %p, state = report.0, "modem state change");
                let _ = port.tx.send(TransportInput::ModemState(report));
            }
        }
    }
}

impl SerialSim {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drive the modem lines seen by the device at `path`. Bits in `mask`
    /// (CD/DSR/CTS/RI as in [`ModemState`]) are set from `value`. Also
    /// switches the device out of null modem wiring.
    pub fn set_modem_lines(&self, path: &str, mask: u8, value: u8) {
        let mut st = self.state.lock().unwrap();
        let dev = st.device(path);
        if dev.null_modem {
            dev.manual_lines = 0;
            dev.null_modem = false;
        }
        dev.manual_lines = (dev.manual_lines & !mask) | (value & mask);
        st.update_lines(path);
    }

    /// Switch null modem wiring for the device at `path` on or off.
    pub fn set_null_modem(&self, path: &str, on: bool) {
        let mut st = self.state.lock().unwrap();
        st.device(path).null_modem = on;
        st.update_lines(path);
    }

    /// RS-485 state of a device: `"<before> <after> enabled"` or `"disabled"`.
    pub fn rs485(&self, path: &str) -> String {
        let st = self.state.lock().unwrap();
        match st.devices.get(path).and_then(|d| d.rs485) {
            Some((before, after)) => format!("{} {} enabled", before, after),
            None => "disabled".to_string(),
        }
    }

    /// Current line settings of a device, if it is open.
    pub fn settings(&self, path: &str) -> Option<SerialSettings> {
        let st = self.state.lock().unwrap();
        st.devices
            .get(path)
            .filter(|d| d.port.is_some())
            .map(|d| d.settings.clone())
    }

    fn open(&self, path: &str, args: &[String]) -> Result<SerialPort> {
        if peer_path(path).is_none() {
            return Err(Error::NotFound);
        }
        let mut settings = SerialSettings::default();
        let mut rs485 = None;
        for arg in args {
            apply_arg(&mut settings, &mut rs485, arg)?;
        }

        let mut st = self.state.lock().unwrap();
        let dev = st.device(path);
        if dev.port.is_some() {
            return Err(Error::InUse);
        }
        let (tx, rx) = mpsc::channel();
        let id = NEXT_PORT_ID.fetch_add(1, Ordering::Relaxed);
        let inq = SendQueue::new();
        dev.port = Some(OpenPort {
            id,
            tx: tx.clone(),
            inq: Arc::clone(&inq),
        });
        dev.settings = settings;
        dev.rs485 = rs485;
        dev.reported = 0;

        // Every open starts with a report of the current levels.
        let levels = st.levels(path);
        let dev = st.device(path);
        dev.reported = levels;
        let _ = tx.send(TransportInput::ModemState(ModemState(levels)));
        st.update_lines(path);
        debug!(path, "serial device opened");

        Ok(SerialPort {
            sim: self.clone(),
            path: path.to_string(),
            id,
            tx,
            rx: Mutex::new(rx),
            inq,
            room_notify: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }
}

fn apply_arg(settings: &mut SerialSettings, rs485: &mut Option<(u32, u32)>, arg: &str) -> Result<()> {
    match arg {
        "LOCAL" | "CLOCAL" => settings.local = true,
        "-LOCAL" | "-CLOCAL" => settings.local = false,
        _ => {
            if let Some(v) = arg.strip_prefix("rs485=") {
                *rs485 = Some(parse_rs485(v)?);
            } else if arg.starts_with(|c: char| c.is_ascii_digit()) {
                settings.apply_speed(arg)?;
            } else {
                return Err(Error::config(format!("serialdev: unknown option '{}'", arg)));
            }
        }
    }
    Ok(())
}

fn parse_rs485(v: &str) -> Result<(u32, u32)> {
    let bad = || Error::config(format!("serialdev: invalid rs485 '{}'", v));
    let (before, after) = v.split_once(':').ok_or_else(bad)?;
    Ok((
        before.parse().map_err(|_| bad())?,
        after.parse().map_err(|_| bad())?,
    ))
}

/// An open simulated serial device.
pub struct SerialPort {
    sim: SerialSim,
    path: String,
    id: u64,
    tx: Sender<TransportInput>,
    rx: Mutex<Receiver<TransportInput>>,
    inq: Arc<SendQueue>,
    room_notify: Mutex<Option<RoomNotify>>,
    closed: AtomicBool,
}

impl SerialPort {
    /// Input queue of the port on the other end of the cable, if open.
    fn peer_queue(&self) -> Option<Arc<SendQueue>> {
        let st = self.sim.state.lock().unwrap();
        let peer = peer_path(&self.path)?;
        st.devices
            .get(&peer)
            .and_then(|d| d.port.as_ref())
            .map(|p| Arc::clone(&p.inq))
    }

    fn with_device<R>(&self, f: impl FnOnce(&mut SimState, &str) -> R) -> Result<R> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::LocalClosed);
        }
        let mut st = self.sim.state.lock().unwrap();
        Ok(f(&mut st, &self.path))
    }
}

impl Transport for SerialPort {
    fn write(&self, data: &[u8]) -> Result<()> {
        let notify = self.room_notify.lock().unwrap().clone();
        self.with_device(|st, path| {
            // A write to a cable with nobody on the other end is lost.
            let Some(peer) = peer_path(path) else { return };
            if let Some(port) = st.devices.get(&peer).and_then(|d| d.port.as_ref()) {
                if let Some(n) = notify {
                    port.inq.set_notify(n);
                }
                port.inq.push(data.len());
                let _ = port.tx.send(TransportInput::Data(data.to_vec()));
            }
        })
    }

    fn write_room(&self) -> usize {
        self.peer_queue().map_or(usize::MAX, |q| q.room())
    }

    fn on_write_room(&self, notify: RoomNotify) {
        *self.room_notify.lock().unwrap() = Some(notify);
    }

    fn recv(&self) -> TransportInput {
        let input = self
            .rx
            .lock()
            .unwrap()
            .recv()
            .unwrap_or(TransportInput::Closed(Error::LocalClosed));
        if let TransportInput::Data(d) = &input {
            self.inq.pop(d.len());
        }
        input
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut st = self.sim.state.lock().unwrap();
        let dev = st.device(&self.path);
        if dev.port.as_ref().map(|p| p.id) == Some(self.id) {
            dev.port = None;
        }
        st.update_lines(&self.path);
        let _ = self.tx.send(TransportInput::Closed(Error::LocalClosed));
        debug!(path = %self.path, "serial device closed");
    }

    fn raddr(&self) -> String {
        let st = self.sim.state.lock().unwrap();
        let settings = st
            .devices
            .get(&self.path)
            .map(|d| d.settings.to_string())
            .unwrap_or_default();
        format!("{},{}", self.path, settings)
    }

    fn control(&self, get: bool, key: ControlKey, data: &str) -> Result<String> {
        match key {
            ControlKey::Rs485 if get => Ok(self.sim.rs485(&self.path)),
            ControlKey::Rs485 => {
                let cfg = if data.is_empty() || data == "off" {
                    None
                } else {
                    Some(parse_rs485(data)?)
                };
                self.with_device(|st, path| st.device(path).rs485 = cfg)?;
                Ok(String::new())
            }
            _ => Err(Error::NotSupported),
        }
    }

    fn serial_set(&self, control: SerialControl, value: u32) -> Result<u32> {
        self.with_device(|st, path| {
            let actual = st.device(path).settings.set(control, value)?;
            if matches!(control, SerialControl::Dtr | SerialControl::Rts) {
                st.update_lines(path);
            }
            Ok(actual)
        })?
    }
}

impl Drop for SerialPort {
    fn drop(&mut self) {
        self.close();
    }
}

/// Factory for `serialdev,<path>[,<speed>][,LOCAL][,rs485=<before>:<after>]`.
pub struct SerialFactory {
    sim: SerialSim,
}

impl SerialFactory {
    pub fn new(sim: SerialSim) -> Self {
        Self { sim }
    }
}

impl TransportFactory for SerialFactory {
    fn validate(&self, spec: &TransportSpec, listen: bool) -> Result<()> {
        if listen {
            return Err(Error::NotSupported);
        }
        spec.params.check_keys("serialdev", &[])?;
        expect_args(spec, 1, 8)?;
        let mut settings = SerialSettings::default();
        let mut rs485 = None;
        for arg in &spec.args[1..] {
            apply_arg(&mut settings, &mut rs485, arg)?;
        }
        Ok(())
    }

    fn connect(&self, spec: &TransportSpec) -> Result<Box<dyn Transport>> {
        self.validate(spec, false)?;
        Ok(Box::new(self.sim.open(&spec.args[0], &spec.args[1..])?))
    }

    fn listen(&self, _spec: &TransportSpec) -> Result<Box<dyn TransportListener>> {
        Err(Error::NotSupported)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serial::{DTR_OFF, RTS_OFF};

    fn args(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    fn expect_modem(p: &SerialPort, want: u8) {
        match p.recv() {
            TransportInput::ModemState(m) => assert_eq!(m.0, want),
            other => panic!("expected modem state, got {:?}", other),
        }
    }

    #[test]
    fn test_pipe_data_and_raddr() {
        let sim = SerialSim::new();
        let a = sim.open("/dev/ttyPipeA0", &args(&["9600N81", "LOCAL"])).unwrap();
        let b = sim.open("/dev/ttyPipeB0", &args(&["9600"])).unwrap();
        assert_eq!(a.raddr(), "/dev/ttyPipeA0,9600N81 RTSHI DTRHI CLOCAL");
        assert_eq!(b.raddr(), "/dev/ttyPipeB0,9600N81 RTSHI DTRHI");

        // Initial report of A (peer closed), then B's open raises A's lines.
        expect_modem(&a, 0);
        expect_modem(&a, ModemState::CTS_CHANGED | ModemState::DSR_CHANGED | ModemState::CD_CHANGED
            | ModemState::CTS | ModemState::DSR | ModemState::CD);

        a.write(b"abc").unwrap();
        expect_modem(&b, ModemState::CTS | ModemState::DSR | ModemState::CD);
        assert_eq!(b.recv(), TransportInput::Data(b"abc".to_vec()));
    }

    #[test]
    fn test_exclusive_open_and_unknown_device() {
        let sim = SerialSim::new();
        let _a = sim.open("/dev/ttyPipeA1", &[]).unwrap();
        assert!(matches!(sim.open("/dev/ttyPipeA1", &[]), Err(Error::InUse)));
        assert!(matches!(sim.open("/dev/ttyS0", &[]), Err(Error::NotFound)));
    }

    #[test]
    fn test_manual_lines_and_null_modem() {
        let sim = SerialSim::new();
        let b = sim.open("/dev/ttyPipeB2", &[]).unwrap();
        b.serial_set(SerialControl::Dtr, DTR_OFF).unwrap();
        b.serial_set(SerialControl::Rts, RTS_OFF).unwrap();
        sim.set_modem_lines("/dev/ttyPipeA2", 0xf0, 0);

        let a = sim.open("/dev/ttyPipeA2", &[]).unwrap();
        expect_modem(&a, 0);
        sim.set_modem_lines("/dev/ttyPipeA2", ModemState::CD, ModemState::CD);
        expect_modem(&a, ModemState::CD_CHANGED | ModemState::CD);
        sim.set_modem_lines("/dev/ttyPipeA2", ModemState::RI, ModemState::RI);
        expect_modem(&a, ModemState::RI_CHANGED | ModemState::CD | ModemState::RI);

        sim.set_modem_lines("/dev/ttyPipeA2", 0xf0, 0);
        expect_modem(&a, ModemState::RI_CHANGED | ModemState::CD_CHANGED);

        b.serial_set(SerialControl::Dtr, crate::serial::DTR_ON).unwrap();
        b.serial_set(SerialControl::Rts, crate::serial::RTS_ON).unwrap();
        sim.set_null_modem("/dev/ttyPipeA2", true);
        expect_modem(&a, ModemState::CD_CHANGED | ModemState::DSR_CHANGED | ModemState::CTS_CHANGED
            | ModemState::CD | ModemState::DSR | ModemState::CTS);
    }

    #[test]
    fn test_rs485_control() {
        let sim = SerialSim::new();
        let a = sim.open("/dev/ttyPipeA3", &args(&["9600N81", "LOCAL", "rs485=103:495"])).unwrap();
        assert_eq!(sim.rs485("/dev/ttyPipeA3"), "103 495 enabled");
        assert_eq!(a.control(true, ControlKey::Rs485, "").unwrap(), "103 495 enabled");
        a.control(false, ControlKey::Rs485, "off").unwrap();
        assert_eq!(sim.rs485("/dev/ttyPipeA3"), "disabled");
        assert!(a.control(false, ControlKey::Rs485, "x").is_err());
    }

    #[test]
    fn test_echo_device() {
        let sim = SerialSim::new();
        let e = sim.open("/dev/ttyEcho0", &[]).unwrap();
        // Own DTR/RTS loop back onto own lines.
        expect_modem(&e, ModemState::CD | ModemState::DSR | ModemState::CTS);
        e.write(b"x").unwrap();
        assert_eq!(e.recv(), TransportInput::Data(b"x".to_vec()));
    }
}
