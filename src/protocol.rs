use crate::Error;
use std::collections::BTreeMap;
use std::fmt;

#[cfg(feature = "serde")]
use serde::Serialize;

/// Every frame sent by the BMS starts with these two bytes.
pub const MARKER: [u8; 2] = [0xd2, 0x03];

const HEADER_LENGTH: usize = 3;
const SUFFIX_LENGTH: usize = 2;

/// Asks for the configuration block, answered with a [`Command::SetInfo`] frame.
pub const CONFIGURATION_REQUEST: [u8; 8] = [0xd2, 0x03, 0x00, 0x80, 0x00, 0x29, 0x96, 0x5f];
/// Asks for the runtime block, answered with a [`Command::RunInfo`] frame.
pub const RUNTIME_REQUEST: [u8; 8] = [0xd2, 0x03, 0x00, 0x00, 0x00, 0x3e, 0xd7, 0xb9];
/// The fixed write sequence issued at the start of every acquisition.
pub const REQUEST_SEQUENCE: [[u8; 8]; 2] = [CONFIGURATION_REQUEST, RUNTIME_REQUEST];

/// Minimum number of registers in a runtime frame (R0-R61).
pub const RUNTIME_MIN_REGISTERS: usize = 62;
/// Number of registers in the complete runtime register map (R0-R66).
pub const RUNTIME_FULL_REGISTERS: usize = 67;
pub const CELLS: usize = 32;
pub const TEMPERATURE_SENSORS: usize = 8;

const CONFIGURATION_REGISTER_OFFSET: usize = 44;
const CELL_REGISTERS: std::ops::Range<usize> = 0..CELLS;
const TEMPERATURE_REGISTERS: std::ops::Range<usize> = 32..40;
const MOS_TEMPERATURE_REGISTER: usize = 33;
const TOTAL_VOLTAGE_REGISTER: usize = 40;
const CURRENT_REGISTER: usize = 41;
const SOC_REGISTER: usize = 42;
const ALARM_REGISTERS: [usize; 4] = [58, 59, 60, 61];
const TRAILER_LENGTH: usize = 32;
const CYCLE_COUNT_OFFSET: usize = 10;

// The BMS adds an offset of 40 to temperatures and 30000 to the current to avoid negative numbers
const TEMPERATURE_OFFSET: i32 = 40;
const CURRENT_OFFSET: i32 = 30000;
const CURRENT_IDLE_BAND: f32 = 0.01;

macro_rules! read_bit {
    ($value:expr,$position:expr) => {
        ($value >> $position) & 1 != 0
    };
}

fn round_to(value: f32, decimals: i32) -> f32 {
    let factor = 10f32.powi(decimals);
    (value * factor).round() / factor
}

fn thousandths(raw: u16) -> f32 {
    round_to(raw as f32 / 1000.0, 3)
}

/// Splits a payload into 16 bit big endian registers.
///
/// A trailing odd byte does not form a register and is dropped.
pub fn decode_registers(payload: &[u8]) -> Vec<u16> {
    payload
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
#[repr(u8)]
pub enum Command {
    /// Configuration data
    SetInfo = 0x52,
    /// Runtime data
    RunInfo = 0x7c,
}

impl Command {
    pub fn code(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for Command {
    type Error = Error;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            0x52 => Ok(Command::SetInfo),
            0x7c => Ok(Command::RunInfo),
            _ => Err(Error::UnknownCommand(code)),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Command::SetInfo => write!(f, "SET_INFO (52)"),
            Command::RunInfo => write!(f, "RUN_INFO (7C)"),
        }
    }
}

/// One protocol message: marker, command byte, payload and a 2 byte suffix.
///
/// The suffix is kept as received and never checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame<'a> {
    pub command: u8,
    pub payload: &'a [u8],
    pub suffix: [u8; 2],
}

impl<'a> Frame<'a> {
    fn parse(candidate: &'a [u8]) -> Result<Self, Error> {
        let body = &candidate[HEADER_LENGTH..];
        if body.len() <= SUFFIX_LENGTH {
            log::warn!(
                "Frame without payload - length={} frame={:02X?}",
                candidate.len(),
                candidate
            );
            return Err(Error::EmptyPayload {
                frame_len: candidate.len(),
            });
        }
        let (payload, suffix) = body.split_at(body.len() - SUFFIX_LENGTH);
        Ok(Self {
            command: candidate[2],
            payload,
            suffix: [suffix[0], suffix[1]],
        })
    }
}

/// Splits a raw notification into frames.
///
/// Every marker starts a new frame which runs up to the next marker or the end
/// of the stream. Bytes before the first marker are ignored and candidates
/// shorter than marker plus command byte are dropped.
pub fn split_frames(stream: &[u8]) -> Result<Vec<Frame<'_>>, Error> {
    let starts: Vec<usize> = stream
        .windows(MARKER.len())
        .enumerate()
        .filter_map(|(index, window)| (window == MARKER.as_slice()).then_some(index))
        .collect();

    if let Some(&first) = starts.first() {
        if first > 0 {
            log::debug!(
                "Skipping {first} bytes before first marker: {:02X?}",
                &stream[..first]
            );
        }
    }

    let ends = starts
        .iter()
        .skip(1)
        .copied()
        .chain(std::iter::once(stream.len()));
    let candidates: Vec<&[u8]> = starts
        .iter()
        .zip(ends)
        .map(|(&start, end)| &stream[start..end])
        .filter(|candidate| candidate.len() >= HEADER_LENGTH)
        .collect();

    if candidates.is_empty() {
        log::warn!("No frame found in {} bytes", stream.len());
        return Err(Error::NoFramesFound);
    }
    log::trace!("Found {} frame candidates", candidates.len());

    candidates.into_iter().map(Frame::parse).collect()
}

/// Configuration block (command 0x52). Registers start at R44.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct ConfigurationReading {
    #[cfg_attr(feature = "serde", serde(skip_serializing_if = "Option::is_none"))]
    pub rated_capacity_ah: Option<f32>,
    #[cfg_attr(feature = "serde", serde(skip_serializing_if = "Option::is_none"))]
    pub cell_count: Option<u16>,
    #[cfg_attr(feature = "serde", serde(skip_serializing_if = "Option::is_none"))]
    pub charge_enabled: Option<bool>,
    #[cfg_attr(feature = "serde", serde(skip_serializing_if = "Option::is_none"))]
    pub discharge_enabled: Option<bool>,
}

impl ConfigurationReading {
    /// Never fails: fields whose register is not part of the payload stay `None`.
    pub fn decode(payload: &[u8]) -> Self {
        let registers = decode_registers(payload);
        log::trace!("Configuration registers: {registers:?}");
        let register = |number: usize| {
            number
                .checked_sub(CONFIGURATION_REGISTER_OFFSET)
                .and_then(|index| registers.get(index))
                .copied()
        };
        let switches = register(64);
        let reading = Self {
            rated_capacity_ah: register(44).map(thousandths),
            cell_count: register(47),
            charge_enabled: switches.map(|value| read_bit!(value, 0)),
            discharge_enabled: switches.map(|value| read_bit!(value, 1)),
        };
        log::debug!(
            "Decoded configuration from {} registers: {reading:?}",
            registers.len()
        );
        reading
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub enum CurrentStatus {
    Charging,
    Discharging,
    Idle,
}

impl CurrentStatus {
    fn from_current(current: f32) -> Self {
        if current > CURRENT_IDLE_BAND {
            CurrentStatus::Charging
        } else if current < -CURRENT_IDLE_BAND {
            CurrentStatus::Discharging
        } else {
            CurrentStatus::Idle
        }
    }
}

/// Runtime block (command 0x7C).
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct RuntimeReading {
    /// Volts per 1-based cell index, unused cells (raw 0) are left out
    pub cell_voltages: BTreeMap<u8, f32>,
    pub max_cell_voltage: f32,
    pub min_cell_voltage: f32,
    pub delta_cell_voltage: f32,
    /// °C
    pub temperatures: [i32; TEMPERATURE_SENSORS],
    /// °C, `None` when the sensor reads 0
    pub mos_temperature: Option<i32>,
    pub total_voltage: f32,
    pub current: f32, // positive=charging, negative=discharging
    pub status: CurrentStatus,
    pub soc_percent: f32,
    pub cycle_count: u16,
    /// Alarm registers R58-R61 as 16 digit binary strings, MSB first
    pub alarm_registers: [String; 4],
    pub alarms: Vec<AlarmRecord>,
    #[cfg_attr(feature = "serde", serde(skip_serializing_if = "Option::is_none"))]
    pub warning: Option<String>,
}

impl RuntimeReading {
    pub fn decode(payload: &[u8]) -> Result<Self, Error> {
        let registers = decode_registers(payload);
        if registers.len() < RUNTIME_MIN_REGISTERS {
            log::warn!(
                "Insufficient runtime data - required={} received={}",
                RUNTIME_MIN_REGISTERS,
                registers.len()
            );
            return Err(Error::InsufficientData {
                registers: registers.len(),
                expected: RUNTIME_MIN_REGISTERS,
            });
        }
        log::trace!("Runtime registers: {registers:?}");

        let cells = &registers[CELL_REGISTERS];
        let cell_voltages = cells
            .iter()
            .enumerate()
            .filter(|(_, &raw)| raw > 0)
            .map(|(index, &raw)| ((index + 1) as u8, thousandths(raw)))
            .collect();
        // Range covers all 32 cells, unused ones included
        let highest = cells.iter().copied().max().unwrap_or(0);
        let lowest = cells.iter().copied().min().unwrap_or(0);

        let mut temperatures = [0; TEMPERATURE_SENSORS];
        for (temperature, &raw) in temperatures
            .iter_mut()
            .zip(&registers[TEMPERATURE_REGISTERS])
        {
            *temperature = raw as i32 - TEMPERATURE_OFFSET;
        }
        // No dedicated MOS register in a 62 register frame, T2 is the closest match
        let mos_temperature = match registers[MOS_TEMPERATURE_REGISTER] {
            0 => None,
            raw => Some(raw as i32 - TEMPERATURE_OFFSET),
        };

        let current = round_to(
            (registers[CURRENT_REGISTER] as i32 - CURRENT_OFFSET) as f32 / 10.0,
            2,
        );
        let alarm_values =
            ALARM_REGISTERS.map(|register| registers.get(register).copied().unwrap_or(0));

        let warning = (registers.len() == RUNTIME_MIN_REGISTERS).then(|| {
            format!(
                "Only {} registers (R0-R{}) received, data is truncated compared to the full register map (R0-R{})",
                RUNTIME_MIN_REGISTERS,
                RUNTIME_MIN_REGISTERS - 1,
                RUNTIME_FULL_REGISTERS - 1
            )
        });

        let reading = Self {
            cell_voltages,
            max_cell_voltage: thousandths(highest),
            min_cell_voltage: thousandths(lowest),
            delta_cell_voltage: thousandths(highest - lowest),
            temperatures,
            mos_temperature,
            total_voltage: round_to(registers[TOTAL_VOLTAGE_REGISTER] as f32 / 10.0, 3),
            current,
            status: CurrentStatus::from_current(current),
            soc_percent: round_to(registers[SOC_REGISTER] as f32 / 10.0, 1),
            cycle_count: cycle_count(payload),
            alarm_registers: alarm_values.map(|value| format!("{value:016b}")),
            alarms: decode_alarms(alarm_values),
            warning,
        };
        log::debug!(
            "Decoded runtime data from {} registers: {} V, {} A, {} %",
            registers.len(),
            reading.total_voltage,
            reading.current,
            reading.soc_percent
        );
        Ok(reading)
    }
}

/// The cycle counter lives in a trailing metadata block, not on a register boundary.
fn cycle_count(payload: &[u8]) -> u16 {
    let trailer = &payload[payload.len().saturating_sub(TRAILER_LENGTH)..];
    trailer
        .get(CYCLE_COUNT_OFFSET..CYCLE_COUNT_OFFSET + 2)
        .map(|bytes| u16::from_be_bytes([bytes[0], bytes[1]]))
        .unwrap_or(0)
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize), serde(tag = "command"))]
pub enum DecodedFrame {
    #[cfg_attr(feature = "serde", serde(rename = "SET_INFO (52)"))]
    Configuration(ConfigurationReading),
    #[cfg_attr(feature = "serde", serde(rename = "RUN_INFO (7C)"))]
    Runtime(RuntimeReading),
}

impl DecodedFrame {
    pub fn decode(frame: &Frame<'_>) -> Result<Self, Error> {
        match Command::try_from(frame.command)? {
            Command::SetInfo => Ok(DecodedFrame::Configuration(ConfigurationReading::decode(
                frame.payload,
            ))),
            Command::RunInfo => RuntimeReading::decode(frame.payload).map(DecodedFrame::Runtime),
        }
    }

    pub fn command(&self) -> Command {
        match self {
            DecodedFrame::Configuration(_) => Command::SetInfo,
            DecodedFrame::Runtime(_) => Command::RunInfo,
        }
    }
}

/// Frames and decodes one notification.
///
/// The outer error means no frames could be extracted at all, the inner
/// results are independent per frame.
pub fn decode_notification(stream: &[u8]) -> Result<Vec<Result<DecodedFrame, Error>>, Error> {
    Ok(split_frames(stream)?
        .iter()
        .map(DecodedFrame::decode)
        .collect())
}

pub const RESERVED: &str = "RESERVED";

/// Alarm messages for R58-R61, indexed by case (case 0 is bit 15).
///
/// R59 lists SOC Too Low with Stage 2 ahead of Stage 1.
pub const ALARM_TABLE: [[&str; 16]; 4] = [
    [
        "Cell Over Voltage (Stage 1)",
        "Cell Over Voltage (Stage 2)",
        "Cell Under Voltage (Stage 1)",
        "Cell Under Voltage (Stage 2)",
        "Total Voltage Too High (Stage 1)",
        "Total Voltage Too High (Stage 2)",
        "Total Voltage Too Low (Stage 1)",
        "Total Voltage Too Low (Stage 2)",
        "Charging Temp Too High (Stage 1)",
        "Charging Temp Too High (Stage 2)",
        "Charging Temp Too Low (Stage 1)",
        "Charging Temp Too Low (Stage 2)",
        "Discharge Temp Too High (Stage 1)",
        "Discharge Temp Too High (Stage 2)",
        "Discharge Temp Too Low (Stage 1)",
        "Discharge Temp Too Low (Stage 2)",
    ],
    [
        "Charge Over Current (Stage 1)",
        "Charge Over Current (Stage 2)",
        "Discharge Over Current (Stage 1)",
        "Discharge Over Current (Stage 2)",
        "SOC Too High (Stage 1)",
        "SOC Too High (Stage 2)",
        "Excessive Differential Voltage (Stage 1)",
        "Excessive Differential Voltage (Stage 2)",
        "SOC Too Low (Stage 2)",
        "SOC Too Low (Stage 1)",
        "Excessive Temperature Difference (Stage 1)",
        "Excessive Temperature Difference (Stage 2)",
        RESERVED,
        RESERVED,
        RESERVED,
        RESERVED,
    ],
    [
        "AFE Acquisition Chip Malfunction",
        "Single Cell Collection Drop Off",
        "Single Temperature Sensor Fault",
        "EEPROM Storage Failure",
        "RTC Clock Malfunction",
        "Precharge Failure",
        "Vehicle Communications Malfunction",
        "Intranet Communication Module Malfunction",
        "Charging MOS Over-temperature Warning",
        "Discharge MOS Over-temperature Warning",
        "Charging MOS Temperature Sensor Failure",
        "Discharge MOS Temperature Sensor Failure",
        "Charging MOS Adhesion Failure",
        "Discharge MOS Adhesion Failure",
        "Charging MOS Breaker Failure",
        "Discharge MOS Breaker Failure",
    ],
    [
        RESERVED,
        RESERVED,
        RESERVED,
        RESERVED,
        RESERVED,
        RESERVED,
        RESERVED,
        RESERVED,
        "Current Module Failure",
        "Main Pressure Detection Module Failure",
        "Short Circuit Protection Failure",
        "Low Voltage No Charging",
        RESERVED,
        RESERVED,
        RESERVED,
        RESERVED,
    ],
];

/// One set bit in an alarm register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct AlarmRecord {
    /// 1 = R58 ... 4 = R61
    pub register: u8,
    pub bit: u8,
    pub case: u8,
    pub message: &'static str,
}

impl AlarmRecord {
    pub fn is_reserved(&self) -> bool {
        self.message == RESERVED
    }
}

impl fmt::Display for AlarmRecord {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "R{} Bit {} (Case {}): {}",
            self.register, self.bit, self.case, self.message
        )
    }
}

/// Decodes the alarm registers R58-R61.
///
/// Records are ordered by register, then by ascending bit. Reserved slots are
/// reported like any other alarm.
pub fn decode_alarms(registers: [u16; 4]) -> Vec<AlarmRecord> {
    let mut result = Vec::new();
    for (index, (messages, value)) in ALARM_TABLE.iter().zip(registers).enumerate() {
        for bit in 0..16u8 {
            if read_bit!(value, bit) {
                let case = 15 - bit;
                let alarm = AlarmRecord {
                    register: index as u8 + 1,
                    bit,
                    case,
                    message: messages[case as usize],
                };
                log::trace!("Active alarm {alarm}");
                result.push(alarm);
            }
        }
    }
    result
}
