use bilge::prelude::*;
use packbytes::{FromBytes, ToBytes};

use crate::pack_bilge;


/// address the master uses as source of every frame it sends
pub const MASTER_ADDRESS: u8 = 0;
/// destination reaching every device on the bus
pub const BROADCAST_ADDRESS: u8 = 0xff;

/// first byte of every frame
pub const START_BYTE: u8 = 0xbb;
/// second byte of every frame
pub const LEADIN_BYTE: u8 = 0x88;

/// frame header, following the start and leadin bytes
#[derive(Copy, Clone, FromBytes, ToBytes, Debug)]
pub struct Header {
    /// device address the frame is sent to
    pub destination: u8,
    /// device address the frame comes from, the master is always 0
    pub source: u8,
    /// command code and its flags
    pub command: CommandByte,
    /// number of data bytes following this header
    pub length: u8,
}

/// command byte of a frame
#[bitsize(8)]
#[derive(Copy, Clone, FromBits, DebugBits, PartialEq)]
pub struct CommandByte {
    /// command number, shared by a request and its response
    pub code: u6,
    /// set when this frame answers a request
    pub response: bool,
    /// set when the destination must answer this frame
    pub response_required: bool,
}
pack_bilge!(CommandByte);

impl CommandByte {
    /// command byte a device uses to answer this one: same code, response flag set, no response required
    pub fn answer(self) -> Self {
        let mut answer = self;
        answer.set_response(true);
        answer.set_response_required(false);
        answer
    }
}

/// commands reserved by the protocol
#[bitsize(8)]
#[derive(Copy, Clone, FromBits, Debug, PartialEq)]
pub enum Command {
    /// reset all devices, usually broadcasted
    Reset = 1,
    SetAddress = 3,
    SetName = 4,
    SetGroup = 5,
    SetConfig = 7,
    BacklightLevel = 8,
    BacklightPower = 9,
    LedLevel = 10,
    LedPower = 11,
    SetText = 12,
    ZeroStepper = 13,
    StepperTarget = 14,
    ServoValue = 15,
    ServoSetConfig = 16,
    StepperSetConfig = 18,

    InfoResponse = 66,
    GetConfigResponse = 70,
    ServoGetConfigResponse = 81,
    StepperGetConfigResponse = 83,
    PollResponse = 127,

    /// ask a device for its fixed 20 bytes description
    Info = 130,
    GetConfig = 134,
    ServoGetConfig = 145,
    StepperGetConfig = 147,
    /// ask a device for its current inputs state
    Poll = 191,

    /// any code not reserved by the protocol
    #[fallback]
    Unknown = 255,
}

impl Command {
    /// flags carried by this command
    pub fn byte(self) -> CommandByte {
        CommandByte::from(u8::from(self))
    }
    /// true when the destination device must answer
    pub fn is_response_required(self) -> bool {
        self.byte().response_required()
    }
}
