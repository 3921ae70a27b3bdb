/*!
    devices discovered on the bus

    a device describes itself in its answer to [Command::Info](crate::Command::Info) with a fixed [InfoRecord],
    and reports its inputs in its answers to [Command::Poll](crate::Command::Poll)
*/

use packbytes::{FromBytes, ToBytes, ByteArray};

use crate::{
    packet::Data,
    utils::ascii_field,
    };


/// polling error count after which a device is no longer polled
pub const MAX_POLLING_ERRORS: u8 = u8::MAX;

/// fixed layout of a device's answer to an info request
#[derive(Copy, Clone, Debug, Default, PartialEq, FromBytes, ToBytes)]
pub struct InfoRecord {
    /// ASCII name, NUL padded
    pub name: [u8; 8],
    /// ASCII firmware version
    pub firmware: [u8; 4],
    pub digital_inputs: u8,
    pub analog_inputs: u8,
    pub rotary_encoders: u8,
    pub led_outputs: u8,
    pub steppers: u8,
    pub servos: u8,
    pub displays: u8,
    /// group address the device also listens on
    pub group: u8,
}
/// size of [InfoRecord] on the wire
pub const INFO_SIZE: usize = <InfoRecord as FromBytes>::Bytes::SIZE;

/// device present on the bus, and the last state it reported
#[derive(Clone, Debug, PartialEq)]
pub struct Device {
    pub address: u8,
    pub group: u8,
    pub name: heapless::String<8>,
    pub firmware: heapless::String<4>,
    pub digital_inputs: u8,
    pub analog_inputs: u8,
    pub rotary_encoders: u8,
    pub led_outputs: u8,
    pub steppers: u8,
    pub servos: u8,
    pub displays: u8,
    /// consecutive polling failures, saturating at [MAX_POLLING_ERRORS]
    pub polling_errors: u8,
    /// raw payload of the last poll response
    pub state: Data,
}

impl Device {
    /// create a device from its address and the data of its info response
    pub fn from_info(address: u8, data: &[u8]) -> Result<Self, &'static str> {
        let bytes = data.get(.. INFO_SIZE)
            .and_then(|bytes| <InfoRecord as FromBytes>::Bytes::try_from(bytes).ok())
            .ok_or("info response shorter than 20 bytes")?;
        Ok(Self::new(address, InfoRecord::from_be_bytes(bytes)))
    }
    pub fn new(address: u8, info: InfoRecord) -> Self {
        Self {
            address,
            group: info.group,
            name: ascii_field(&info.name),
            firmware: ascii_field(&info.firmware),
            digital_inputs: info.digital_inputs,
            analog_inputs: info.analog_inputs,
            rotary_encoders: info.rotary_encoders,
            led_outputs: info.led_outputs,
            steppers: info.steppers,
            servos: info.servos,
            displays: info.displays,
            polling_errors: 0,
            state: Data::new(),
        }
    }

    /// replace the known state with the data of a poll response
    pub fn update_state(&mut self, data: &[u8]) {
        self.state.clear();
        // both are bounded by the same packet capacity
        let _ = self.state.extend_from_slice(data);
    }
    /// count a polling failure, returns true when this failure saturated the device
    pub fn record_polling_error(&mut self) -> bool {
        let saturated = self.is_saturated();
        self.polling_errors = self.polling_errors.saturating_add(1);
        ! saturated && self.is_saturated()
    }
    /// a saturated device is skipped by polling until the next rescan
    pub fn is_saturated(&self) -> bool {
        self.polling_errors >= MAX_POLLING_ERRORS
    }

    /// state of a digital input in the last poll response, false if unknown
    pub fn digital_state(&self, input: u8) -> bool {
        if input >= self.digital_inputs
            {return false}
        let mask = 1u8 << (input % 8);
        self.state.get(usize::from(input / 8))
            .is_some_and(|byte| byte & mask != 0)
    }
    /// value of an analog input in the last poll response, 0 if unknown
    pub fn analog_state(&self, input: u8) -> u16 {
        if input >= self.analog_inputs
            {return 0}
        // analog readings follow the packed digital bits
        let start = usize::from(self.digital_inputs).div_ceil(8) + 2 * usize::from(input);
        match self.state.get(start .. start + 2) {
            Some(&[high, low]) => u16::from_be_bytes([high, low]),
            _ => 0,
        }
    }
}
