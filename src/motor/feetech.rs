// Feetech STS3215 serial protocol implementation
//
// Protocol is similar to Dynamixel Protocol 1.0:
// Packet format: [0xFF, 0xFF, ID, Length, Instruction, Params..., Checksum]

use serialport::{self, SerialPort};
use std::io::{Read, Write};
use std::time::Duration;
use tracing::debug;

use super::transport::{RegisterBus, Width};

/// Broadcast ID: every motor on the bus listens
pub const BROADCAST_ID: u8 = 0xFE;

/// Packet header bytes
const HEADER: [u8; 2] = [0xFF, 0xFF];

/// Instruction set
#[repr(u8)]
#[derive(Debug, Clone, Copy)]
pub enum Instruction {
    Ping = 0x01,
    Read = 0x02,
    Write = 0x03,
    SyncWrite = 0x83,
}

/// Register addresses for STS3215
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Register {
    // EEPROM area (persists across power cycles, writes need Lock = 0)
    ModelNumber = 3,       // 2 bytes, read-only
    Id = 5,                // 1 byte
    BaudRate = 6,          // 1 byte
    MinPositionLimit = 9,  // 2 bytes
    MaxPositionLimit = 11, // 2 bytes
    MaxVoltageLimit = 14,  // 1 byte, 0.1 V units
    MinVoltageLimit = 15,  // 1 byte, 0.1 V units
    MaxTorqueLimit = 16,   // 2 bytes, 0..1000
    PCoefficient = 21,     // 1 byte
    HomingOffset = 31,     // 2 bytes, sign bit 11
    OperatingMode = 33,    // 1 byte: 0=position, 1=velocity, 2=PWM, 3=step

    // RAM area (volatile)
    TorqueEnable = 40,    // 1 byte: 0=off, 1=on
    Acceleration = 41,    // 1 byte
    GoalPosition = 42,    // 2 bytes
    GoalVelocity = 46,    // 2 bytes (signed, velocity mode)
    TorqueLimit = 48,     // 2 bytes, 0..1000
    Lock = 55,            // 1 byte: 0=unlocked, 1=locked
    PresentPosition = 56, // 2 bytes, read-only
    PresentVelocity = 58, // 2 bytes, read-only (signed)
}

impl Register {
    pub fn addr(self) -> u8 {
        self as u8
    }

    pub fn width(self) -> Width {
        match self {
            Register::Id
            | Register::BaudRate
            | Register::MaxVoltageLimit
            | Register::MinVoltageLimit
            | Register::PCoefficient
            | Register::OperatingMode
            | Register::TorqueEnable
            | Register::Acceleration
            | Register::Lock => Width::Byte,
            _ => Width::Word,
        }
    }

    /// Registers below the torque switch live in EEPROM
    pub fn is_eeprom(self) -> bool {
        (self as u8) < Register::TorqueEnable as u8
    }
}

/// Error types for Feetech communication
#[derive(Debug, thiserror::Error)]
pub enum FeetechError {
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid response from motor {id}: {reason}")]
    InvalidResponse { id: u8, reason: String },

    #[error("Checksum mismatch for motor {id}")]
    ChecksumMismatch { id: u8 },

    #[error("Motor {id} returned error status: 0x{status:02X}")]
    MotorError { id: u8, status: u8 },

    #[error("Timeout waiting for response from motor {id}")]
    Timeout { id: u8 },

    #[error("Several motors answered as id {id} at once")]
    Collision { id: u8 },
}

pub type Result<T> = std::result::Result<T, FeetechError>;

/// Feetech motor bus - handles serial communication with motors
pub struct FeetechBus {
    port: Box<dyn SerialPort>,
}

impl FeetechBus {
    /// Open the bus adapter; `timeout` bounds each serial read
    pub fn open_with_timeout(port_name: &str, baudrate: u32, timeout: Duration) -> Result<Self> {
        let port = serialport::new(port_name, baudrate).timeout(timeout).open()?;
        debug!("Opened {} at {} baud", port_name, baudrate);
        Ok(Self { port })
    }

    /// Calculate checksum for a packet (excluding header)
    fn checksum(data: &[u8]) -> u8 {
        let sum: u16 = data.iter().map(|&b| b as u16).sum();
        (!sum & 0xFF) as u8
    }

    /// Build a packet with header and checksum
    fn build_packet(id: u8, instruction: Instruction, params: &[u8]) -> Vec<u8> {
        let length = (params.len() + 2) as u8; // params + instruction + checksum
        let mut packet = Vec::with_capacity(6 + params.len());

        packet.extend_from_slice(&HEADER);
        packet.push(id);
        packet.push(length);
        packet.push(instruction as u8);
        packet.extend_from_slice(params);

        // Checksum over id, length, instruction, params
        let checksum_data = &packet[2..]; // skip header
        packet.push(Self::checksum(checksum_data));

        packet
    }

    /// Sync write parameters:
    /// [start_addr, data_length, id1, data1..., id2, data2..., ...]
    fn sync_write_params(addr: u8, width: Width, data: &[(u8, u16)]) -> Vec<u8> {
        let mut params = vec![addr, width.bytes()];
        for &(id, value) in data {
            params.push(id);
            match width {
                Width::Byte => params.push((value & 0xFF) as u8),
                Width::Word => params.extend_from_slice(&value.to_le_bytes()),
            }
        }
        params
    }

    fn send_packet(&mut self, packet: &[u8]) -> Result<()> {
        // Drop stale bytes left over from a previous timed-out exchange
        self.port.clear(serialport::ClearBuffer::Input)?;
        self.port.write_all(packet)?;
        self.port.flush()?;
        Ok(())
    }

    fn read_exact_or_timeout(&mut self, buf: &mut [u8], id: u8) -> Result<()> {
        self.port.read_exact(buf).map_err(|e| {
            if e.kind() == std::io::ErrorKind::TimedOut {
                FeetechError::Timeout { id }
            } else {
                FeetechError::Io(e)
            }
        })
    }

    /// Read one status packet, returning the responder id and its parameters.
    ///
    /// `expected_id` is used for error reporting and, when it is not the
    /// broadcast id, to reject packets from the wrong motor.
    fn read_status(&mut self, expected_id: u8) -> Result<(u8, Vec<u8>)> {
        let mut header = [0u8; 2];
        self.read_exact_or_timeout(&mut header, expected_id)?;

        if header != HEADER {
            return Err(FeetechError::InvalidResponse {
                id: expected_id,
                reason: format!("Invalid header: {:02X?}", header),
            });
        }

        let mut id_length = [0u8; 2];
        self.read_exact_or_timeout(&mut id_length, expected_id)?;
        let id = id_length[0];
        let length = id_length[1] as usize;

        if expected_id != BROADCAST_ID && id != expected_id {
            return Err(FeetechError::InvalidResponse {
                id: expected_id,
                reason: format!("ID mismatch: expected {}, got {}", expected_id, id),
            });
        }
        if length < 2 {
            return Err(FeetechError::InvalidResponse {
                id,
                reason: format!("Length {} too short for a status packet", length),
            });
        }

        // Read remaining bytes (error + params + checksum = length bytes)
        let mut remaining = vec![0u8; length];
        self.read_exact_or_timeout(&mut remaining, id)?;

        // Verify checksum
        let mut checksum_data = vec![id, length as u8];
        checksum_data.extend_from_slice(&remaining[..remaining.len() - 1]);
        let expected_checksum = Self::checksum(&checksum_data);
        let received_checksum = remaining[remaining.len() - 1];

        if expected_checksum != received_checksum {
            return Err(FeetechError::ChecksumMismatch { id });
        }

        let error_status = remaining[0];
        if error_status != 0 {
            return Err(FeetechError::MotorError {
                id,
                status: error_status,
            });
        }

        Ok((id, remaining[1..remaining.len() - 1].to_vec()))
    }

    fn read_response(&mut self, expected_id: u8) -> Result<Vec<u8>> {
        self.read_status(expected_id).map(|(_, params)| params)
    }
}

impl RegisterBus for FeetechBus {
    fn ping(&mut self, id: u8) -> Result<bool> {
        let packet = Self::build_packet(id, Instruction::Ping, &[]);
        self.send_packet(&packet)?;

        match self.read_response(id) {
            Ok(_) => Ok(true),
            Err(FeetechError::Timeout { .. }) => Ok(false),
            // Overlapping replies from motors sharing an id garble the frame
            Err(FeetechError::ChecksumMismatch { .. })
            | Err(FeetechError::InvalidResponse { .. }) => Err(FeetechError::Collision { id }),
            Err(e) => Err(e),
        }
    }

    fn broadcast_ping(&mut self) -> Result<Vec<u8>> {
        let packet = Self::build_packet(BROADCAST_ID, Instruction::Ping, &[]);
        self.send_packet(&packet)?;

        let mut responders = Vec::new();
        loop {
            match self.read_status(BROADCAST_ID) {
                Ok((id, _)) => {
                    debug!("Broadcast ping answered by id {}", id);
                    responders.push(id);
                }
                Err(FeetechError::Timeout { .. }) => break,
                Err(FeetechError::ChecksumMismatch { .. })
                | Err(FeetechError::InvalidResponse { .. }) => {
                    return Err(FeetechError::Collision { id: BROADCAST_ID });
                }
                Err(e) => return Err(e),
            }
        }
        Ok(responders)
    }

    fn read(&mut self, id: u8, addr: u8, width: Width) -> Result<u16> {
        let params = [addr, width.bytes()];
        let packet = Self::build_packet(id, Instruction::Read, &params);
        self.send_packet(&packet)?;

        let response = self.read_response(id)?;
        match (width, response.as_slice()) {
            (Width::Byte, [value, ..]) => Ok(*value as u16),
            (Width::Word, [lo, hi, ..]) => Ok(u16::from_le_bytes([*lo, *hi])),
            _ => Err(FeetechError::InvalidResponse {
                id,
                reason: format!(
                    "Expected {} bytes, got {}",
                    width.bytes(),
                    response.len()
                ),
            }),
        }
    }

    fn write(&mut self, id: u8, addr: u8, width: Width, value: u16) -> Result<()> {
        let mut params = vec![addr];
        match width {
            Width::Byte => params.push((value & 0xFF) as u8),
            Width::Word => params.extend_from_slice(&value.to_le_bytes()),
        }
        let packet = Self::build_packet(id, Instruction::Write, &params);
        debug!("Write to motor {}: addr={}, value={}", id, addr, value);
        self.send_packet(&packet)?;

        // Broadcast writes are not acknowledged
        if id != BROADCAST_ID {
            // An id write may be acknowledged from the new id
            let responder = if addr == Register::Id.addr() {
                BROADCAST_ID
            } else {
                id
            };
            let _ = self.read_response(responder)?;
        }
        Ok(())
    }

    fn sync_write(&mut self, addr: u8, width: Width, data: &[(u8, u16)]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let params = Self::sync_write_params(addr, width, data);
        let packet = Self::build_packet(BROADCAST_ID, Instruction::SyncWrite, &params);
        debug!("Sync write to {} motors: addr={}", data.len(), addr);

        // Sync write has no response
        self.send_packet(&packet)
    }
}

/// Encode a signed value to sign-magnitude format with the sign at `sign_bit`
///
/// Velocity registers use bit 15, the homing offset uses bit 11.
pub fn encode_sign_magnitude(value: i16, sign_bit: u8) -> u16 {
    let max_magnitude = (1u16 << sign_bit) - 1;
    let magnitude = value.unsigned_abs().min(max_magnitude);
    if value >= 0 {
        magnitude
    } else {
        (1 << sign_bit) | magnitude
    }
}

/// Decode sign-magnitude format with the sign at `sign_bit`
pub fn decode_sign_magnitude(raw: u16, sign_bit: u8) -> i16 {
    let magnitude = (raw & ((1u16 << sign_bit) - 1)) as i16;
    if raw & (1 << sign_bit) != 0 {
        -magnitude
    } else {
        magnitude
    }
}
