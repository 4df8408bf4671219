//! Serial line control types shared by the telnet (RFC 2217) layer and the
//! serial device transport.

use std::fmt;

use crate::error::{Error, Result};

/// Modem state bits. The low nibble flags lines that changed since the last
/// report, the high nibble carries the current line levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ModemState(pub u8);

impl ModemState {
    pub const CTS_CHANGED: u8 = 1 << 0;
    pub const DSR_CHANGED: u8 = 1 << 1;
    pub const RI_CHANGED: u8 = 1 << 2;
    pub const CD_CHANGED: u8 = 1 << 3;
    pub const CTS: u8 = 1 << 4;
    pub const DSR: u8 = 1 << 5;
    pub const RI: u8 = 1 << 6;
    pub const CD: u8 = 1 << 7;

    /// Build a report from the previous and current line levels.
    pub fn transition(old: ModemState, new: ModemState) -> ModemState {
        let levels = new.0 & 0xf0;
        ModemState(levels | ((old.0 ^ new.0) >> 4 & 0x0f))
    }

    pub fn levels(&self) -> ModemState {
        ModemState(self.0 & 0xf0)
    }

    pub fn changed(&self) -> u8 {
        self.0 & 0x0f
    }

    pub fn cd(&self) -> bool {
        self.0 & Self::CD != 0
    }

    pub fn dsr(&self) -> bool {
        self.0 & Self::DSR != 0
    }

    pub fn cts(&self) -> bool {
        self.0 & Self::CTS != 0
    }

    pub fn ri(&self) -> bool {
        self.0 & Self::RI != 0
    }
}

/// A serial setting negotiable with `serial_set`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SerialControl {
    Baud,
    DataSize,
    Parity,
    StopBits,
    FlowControl,
    IFlowControl,
    Break,
    Dtr,
    Rts,
}

impl fmt::Display for SerialControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SerialControl::Baud => "baud",
            SerialControl::DataSize => "datasize",
            SerialControl::Parity => "parity",
            SerialControl::StopBits => "stopbits",
            SerialControl::FlowControl => "flowcontrol",
            SerialControl::IFlowControl => "iflowcontrol",
            SerialControl::Break => "sbreak",
            SerialControl::Dtr => "dtr",
            SerialControl::Rts => "rts",
        };
        write!(f, "{}", s)
    }
}

// Values for `serial_set`. Zero always means "query the current value".

pub const PARITY_NONE: u32 = 1;
pub const PARITY_ODD: u32 = 2;
pub const PARITY_EVEN: u32 = 3;
pub const PARITY_MARK: u32 = 4;
pub const PARITY_SPACE: u32 = 5;

pub const FLOWCONTROL_NONE: u32 = 1;
pub const FLOWCONTROL_XON_XOFF: u32 = 2;
pub const FLOWCONTROL_RTS_CTS: u32 = 3;
pub const FLOWCONTROL_DCD: u32 = 4;
pub const FLOWCONTROL_DTR: u32 = 5;
pub const FLOWCONTROL_DSR: u32 = 6;

pub const BREAK_ON: u32 = 1;
pub const BREAK_OFF: u32 = 2;
pub const DTR_ON: u32 = 1;
pub const DTR_OFF: u32 = 2;
pub const RTS_ON: u32 = 1;
pub const RTS_OFF: u32 = 2;

/// Line settings of a serial port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialSettings {
    pub baud: u32,
    pub parity: u32,
    pub datasize: u32,
    pub stopbits: u32,
    pub flowcontrol: u32,
    pub iflowcontrol: u32,
    pub sbreak: u32,
    pub dtr: u32,
    pub rts: u32,
    /// Ignore modem control lines (CLOCAL).
    pub local: bool,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            baud: 9600,
            parity: PARITY_NONE,
            datasize: 8,
            stopbits: 1,
            flowcontrol: FLOWCONTROL_NONE,
            iflowcontrol: FLOWCONTROL_NONE,
            sbreak: BREAK_OFF,
            dtr: DTR_ON,
            rts: RTS_ON,
            local: false,
        }
    }
}

impl SerialSettings {
    /// Parse a `<baud>[<parity><datasize>[<stopbits>]]` string such as
    /// `9600`, `9600N81` or `115200e72`.
    pub fn apply_speed(&mut self, s: &str) -> Result<()> {
        let digits = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
        self.baud = s[..digits]
            .parse()
            .map_err(|_| Error::config(format!("invalid serial speed '{}'", s)))?;
        let mut rest = s[digits..].chars();
        if let Some(p) = rest.next() {
            self.parity = parity_from_char(p)
                .ok_or_else(|| Error::config(format!("invalid parity in '{}'", s)))?;
        }
        if let Some(d) = rest.next() {
            self.datasize = match d.to_digit(10) {
                Some(d @ 5..=8) => d,
                _ => return Err(Error::config(format!("invalid data size in '{}'", s))),
            };
        }
        if let Some(b) = rest.next() {
            self.stopbits = match b.to_digit(10) {
                Some(b @ 1..=2) => b,
                _ => return Err(Error::config(format!("invalid stop bits in '{}'", s))),
            };
        }
        if rest.next().is_some() {
            return Err(Error::config(format!("trailing characters in '{}'", s)));
        }
        Ok(())
    }

    /// Apply a `serial_set` request. Zero queries; returns the resulting value.
    pub fn set(&mut self, control: SerialControl, value: u32) -> Result<u32> {
        let slot = match control {
            SerialControl::Baud => &mut self.baud,
            SerialControl::DataSize => &mut self.datasize,
            SerialControl::Parity => &mut self.parity,
            SerialControl::StopBits => &mut self.stopbits,
            SerialControl::FlowControl => &mut self.flowcontrol,
            SerialControl::IFlowControl => &mut self.iflowcontrol,
            SerialControl::Break => &mut self.sbreak,
            SerialControl::Dtr => &mut self.dtr,
            SerialControl::Rts => &mut self.rts,
        };
        if value != 0 {
            if !valid_value(control, value) {
                return Err(Error::config(format!("invalid {} value {}", control, value)));
            }
            *slot = value;
        }
        Ok(*slot)
    }

    pub fn dtr_on(&self) -> bool {
        self.dtr == DTR_ON
    }

    pub fn rts_on(&self) -> bool {
        self.rts == RTS_ON
    }
}

impl fmt::Display for SerialSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}{}{}",
            self.baud,
            parity_char(self.parity),
            self.datasize,
            self.stopbits
        )?;
        write!(f, " {}", if self.rts_on() { "RTSHI" } else { "RTSLO" })?;
        write!(f, " {}", if self.dtr_on() { "DTRHI" } else { "DTRLO" })?;
        if self.local {
            write!(f, " CLOCAL")?;
        }
        Ok(())
    }
}

fn valid_value(control: SerialControl, value: u32) -> bool {
    match control {
        SerialControl::Baud => true,
        SerialControl::DataSize => (5..=8).contains(&value),
        SerialControl::Parity => (PARITY_NONE..=PARITY_SPACE).contains(&value),
        SerialControl::StopBits => (1..=2).contains(&value),
        SerialControl::FlowControl | SerialControl::IFlowControl => {
            (FLOWCONTROL_NONE..=FLOWCONTROL_DSR).contains(&value)
        }
        SerialControl::Break | SerialControl::Dtr | SerialControl::Rts => {
            value == 1 || value == 2
        }
    }
}

fn parity_from_char(c: char) -> Option<u32> {
    match c.to_ascii_uppercase() {
        'N' => Some(PARITY_NONE),
        'O' => Some(PARITY_ODD),
        'E' => Some(PARITY_EVEN),
        'M' => Some(PARITY_MARK),
        'S' => Some(PARITY_SPACE),
        _ => None,
    }
}

fn parity_char(p: u32) -> char {
    match p {
        PARITY_ODD => 'O',
        PARITY_EVEN => 'E',
        PARITY_MARK => 'M',
        PARITY_SPACE => 'S',
        _ => 'N',
    }
}
