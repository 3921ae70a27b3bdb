/*!
    wire level packet exchanged on the bus

    a frame on the wire is `[0xBB][0x88][destination][source][command][length][data ...][checksum]`,
    the checksum being the 8 bit wrapping sum of destination, source, command, length and data
*/

use packbytes::ToBytes;

use crate::command::{Command, CommandByte, Header, START_BYTE, LEADIN_BYTE, MASTER_ADDRESS};


/// maximum number of data bytes in one packet
pub const MAX_DATA: usize = u8::MAX as usize;
/// bytes surrounding the data in a frame: start, leadin, 4 header bytes and checksum
pub const FRAME_OVERHEAD: usize = 7;
/// size of the biggest possible frame
pub const MAX_FRAME: usize = MAX_DATA + FRAME_OVERHEAD;

/// data payload of a packet
pub type Data = heapless::Vec<u8, MAX_DATA>;
/// fully encoded frame
pub type Frame = heapless::Vec<u8, MAX_FRAME>;


/// packet sent or received on the bus
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Packet {
    pub destination: u8,
    pub source: u8,
    pub command: u8,
    pub data: Data,
}

impl Packet {
    /// packet with no data and an arbitrary command byte
    pub fn new(destination: u8, command: u8) -> Self {
        Self {
            destination,
            source: MASTER_ADDRESS,
            command,
            data: Data::new(),
        }
    }
    /// packet with no data carrying a reserved command
    pub fn command(destination: u8, command: Command) -> Self {
        Self::new(destination, command.into())
    }
    /// response to the given request, with the request's code and the response flag set
    pub fn response(request: &Packet) -> Self {
        Self {
            destination: request.source,
            source: request.destination,
            command: request.flags().answer().into(),
            data: Data::new(),
        }
    }
    /// builder variant of [Self::push]
    pub fn with_data(mut self, data: &[u8]) -> Result<Self, &'static str> {
        self.push(data)?;
        Ok(self)
    }

    /// append bytes to the data payload
    pub fn push(&mut self, data: &[u8]) -> Result<(), &'static str> {
        self.data.extend_from_slice(data)
            .map_err(|_| "packet data exceeds 255 bytes")
    }
    pub fn push_u8(&mut self, value: u8) -> Result<(), &'static str> {
        self.push(&[value])
    }
    /// append a big endian 16 bit value
    pub fn push_u16(&mut self, value: u16) -> Result<(), &'static str> {
        self.push(&value.to_be_bytes())
    }
    /// append a big endian 32 bit value
    pub fn push_u32(&mut self, value: u32) -> Result<(), &'static str> {
        self.push(&value.to_be_bytes())
    }

    /// flags of the command byte
    pub fn flags(&self) -> CommandByte {
        CommandByte::from(self.command)
    }
    /// reserved command this packet carries, [Command::Unknown] if not reserved
    pub fn kind(&self) -> Command {
        Command::from(self.command)
    }
    /// true if this packet answers a request
    pub fn is_response(&self) -> bool {
        self.flags().response()
    }
    /// true if the destination must answer this packet
    pub fn is_response_required(&self) -> bool {
        self.flags().response_required()
    }

    /// header of this packet's frame
    pub fn header(&self) -> Header {
        Header {
            destination: self.destination,
            source: self.source,
            command: self.flags(),
            // data can never exceed 255 bytes
            length: self.data.len() as u8,
        }
    }
    /// checksum of the packet, recomputed on every call
    pub fn checksum(&self) -> u8 {
        self.header().to_be_bytes().iter()
            .chain(self.data.iter())
            .fold(0u8, |sum, &byte| sum.wrapping_add(byte))
    }
    /// full frame ready to be written on the bus
    pub fn encode(&self) -> Frame {
        let mut frame = Frame::new();
        // the frame buffer is sized for the biggest packet, none of these can overflow
        let _ = frame.extend_from_slice(&[START_BYTE, LEADIN_BYTE]);
        let _ = frame.extend_from_slice(&self.header().to_be_bytes());
        let _ = frame.extend_from_slice(&self.data);
        let _ = frame.push(self.checksum());
        frame
    }
}
