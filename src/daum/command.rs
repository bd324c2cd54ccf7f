//! Command model and wire encoding for the Daum cockpit protocol.
//!
//! Every outgoing frame is two or three raw bytes: opcode, cockpit address,
//! optional payload. The one exception is the address handshake itself,
//! which is the bare opcode since no address is known yet.

use super::BusAddress;

/// Command opcodes, the first byte of every frame in either direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    CheckCockpit = 0x10,
    GetAddress = 0x11,
    SetProgram = 0x23,
    SetWattProfile = 0x24,
    GetPersonData = 0x36,
    RunData = 0x40,
    SetWatt = 0x51,
    SetGear = 0x53,
}

impl Opcode {
    pub fn byte(self) -> u8 {
        self as u8
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x10 => Some(Opcode::CheckCockpit),
            0x11 => Some(Opcode::GetAddress),
            0x23 => Some(Opcode::SetProgram),
            0x24 => Some(Opcode::SetWattProfile),
            0x36 => Some(Opcode::GetPersonData),
            0x40 => Some(Opcode::RunData),
            0x51 => Some(Opcode::SetWatt),
            0x53 => Some(Opcode::SetGear),
            _ => None,
        }
    }
}

/// Queue priority. Priorities do not reorder the queue; they decide how
/// persistently a command is retried after a missed acknowledgment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    Low,
    Medium,
    High,
}

/// A single outgoing command frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub opcode: Opcode,
    pub address: BusAddress,
    pub payload: Option<u8>,
}

impl Command {
    pub fn new(opcode: Opcode, address: BusAddress) -> Self {
        Self {
            opcode,
            address,
            payload: None,
        }
    }

    pub fn with_payload(opcode: Opcode, address: BusAddress, payload: u8) -> Self {
        Self {
            opcode,
            address,
            payload: Some(payload),
        }
    }

    /// Encode to the raw wire frame.
    pub fn encode(&self) -> Vec<u8> {
        if self.opcode == Opcode::GetAddress {
            return vec![self.opcode.byte()];
        }
        let mut frame = Vec::with_capacity(3);
        frame.push(self.opcode.byte());
        frame.push(self.address);
        if let Some(payload) = self.payload {
            frame.push(payload);
        }
        frame
    }

    /// Whether a response header belongs to this command.
    pub fn matches_header(&self, opcode: u8, address: BusAddress) -> bool {
        self.opcode.byte() == opcode && self.address == address
    }
}

/// The addressless handshake frame that discovers the cockpit address.
pub fn get_address_frame() -> [u8; 1] {
    [Opcode::GetAddress.byte()]
}
