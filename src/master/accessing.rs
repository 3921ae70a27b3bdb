use std::collections::HashMap;
use parking_lot::Mutex;
use packbytes::{FromBytes, ToBytes, ByteArray};

use crate::{
    command::Command,
    packet::{Packet, Data},
    device::Device,
    utils::ascii_field,
    };
use super::{
    Error,
    networking::Master,
    };


/// maximum number of characters sent to a display at once
pub const MAX_TEXT: usize = 248;
/// maximum length of a device name
pub const MAX_NAME: usize = 8;


/// device output whose updates are coalesced
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Property {
    BacklightLevel,
    BacklightPower,
    LedLevel(u8),
    LedPower(u8),
}
/// pending update of one property of one device
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Slot {
    pub address: u8,
    pub property: Property,
}

/**
    packets waiting in the transmit queue that can still be updated

    there is at most one pending packet per slot. Setting an occupied slot replaces its packet in place,
    so a burst of updates results in a single frame carrying the last value.
*/
#[derive(Default)]
pub struct Coalescer {
    pending: Mutex<HashMap<Slot, Packet>>,
}
impl Coalescer {
    /// store the packet for its slot, calling `enqueue` if the slot was empty
    pub fn set(&self, slot: Slot, packet: Packet, enqueue: impl FnOnce(Slot)) {
        let mut pending = self.pending.lock();
        // enqueue under the lock so the engine cannot take the slot before it is queued
        if pending.insert(slot, packet).is_none()
            {enqueue(slot)}
    }
    /// remove the pending packet of a slot, it is then considered sent
    pub fn take(&self, slot: Slot) -> Option<Packet> {
        self.pending.lock().remove(&slot)
    }
    pub fn is_pending(&self, slot: Slot) -> bool {
        self.pending.lock().contains_key(&slot)
    }
}


/// configuration of a servo output
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, FromBytes, ToBytes)]
pub struct ServoConfig {
    /// minimum signal in microseconds
    pub min: u16,
    /// maximum signal in microseconds
    pub max: u16,
    /// signal at power on, in microseconds
    pub default: u16,
}
/// configuration of a stepper output
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, FromBytes, ToBytes)]
pub struct StepperConfig {
    pub max_speed: u16,
    /// delay before the motor is powered down, in milliseconds
    pub idle_sleep: u32,
}

/// parse a configuration answer made of the output id followed by the packed configuration
fn output_config<T: FromBytes>(output: u8, response: &Packet) -> Result<T, Error> {
    let (&id, bytes) = response.data.split_first()
        .ok_or(Error::Master("empty configuration response"))?;
    if id != output
        {return Err(Error::Master("configuration response for another output"))}
    let bytes = bytes.get(.. T::Bytes::SIZE)
        .ok_or(Error::Master("configuration response too short"))?;
    let mut buffer = T::Bytes::zeroed();
    buffer.as_mut().copy_from_slice(bytes);
    Ok(T::from_be_bytes(buffer))
}


impl Master {
    /// handle to send commands to the device at the given address
    pub fn node(&self, address: u8) -> Node<'_> {
        Node::new(self, address)
    }
}

/**
    lightweight reference to [Master] for commanding one device

    commands without answer return as soon as they are queued, requests wait for the device answer.
    Errors are only possible when a payload does not fit a packet or a request fails.
*/
pub struct Node<'m> {
    master: &'m Master,
    address: u8,
}
impl<'m> Node<'m> {
    pub fn new(master: &'m Master, address: u8) -> Self {
        Self {master, address}
    }
    pub fn address(&self) -> u8 {self.address}
    /// last known record of this device, if it was discovered
    pub fn device(&self) -> Option<Device> {
        self.master.device(self.address)
    }
    /// ask the device for its description
    pub async fn info(&self) -> Result<Device, Error> {
        self.master.get_info(self.address).await
    }
    /// state of a digital input at the last poll
    pub fn digital_input(&self, input: u8) -> Result<bool, Error> {
        self.device()
            .map(|device| device.digital_state(input))
            .ok_or(Error::UnknownDevice(self.address))
    }
    /// value of an analog input at the last poll
    pub fn analog_input(&self, input: u8) -> Result<u16, Error> {
        self.device()
            .map(|device| device.analog_state(input))
            .ok_or(Error::UnknownDevice(self.address))
    }

    pub fn set_backlight_level(&self, level: u8) {
        self.coalesce(Property::BacklightLevel, Command::BacklightLevel, &[level]);
    }
    pub fn set_backlight_power(&self, on: bool) {
        self.coalesce(Property::BacklightPower, Command::BacklightPower, &[u8::from(on)]);
    }
    /// brightness of one LED output, ignored by outputs without dimming
    pub fn set_led_level(&self, led: u8, level: u8) {
        self.coalesce(Property::LedLevel(led), Command::LedLevel, &[led, level]);
    }
    pub fn set_led_power(&self, led: u8, on: bool) {
        self.coalesce(Property::LedPower(led), Command::LedPower, &[led, u8::from(on)]);
    }

    /// move a stepper to an absolute position
    pub fn set_stepper_target(&self, stepper: u8, position: i32) -> Result<(), Error> {
        let mut packet = Packet::command(self.address, Command::StepperTarget);
        packet.push_u8(stepper).map_err(Error::Master)?;
        packet.push_u32(position as u32).map_err(Error::Master)?;
        self.master.send_packet(packet);
        Ok(())
    }
    /// make the current stepper position its zero
    pub fn zero_stepper(&self, stepper: u8) -> Result<(), Error> {
        self.master.send_command(self.address, Command::ZeroStepper, &[stepper])
    }
    pub fn set_stepper_config(&self, stepper: u8, config: StepperConfig) -> Result<(), Error> {
        let mut packet = Packet::command(self.address, Command::StepperSetConfig);
        packet.push_u8(stepper).map_err(Error::Master)?;
        packet.push(&config.to_be_bytes()).map_err(Error::Master)?;
        self.master.send_packet(packet);
        Ok(())
    }
    pub async fn get_stepper_config(&self, stepper: u8) -> Result<StepperConfig, Error> {
        let request = Packet::command(self.address, Command::StepperGetConfig)
            .with_data(&[stepper]).map_err(Error::Master)?;
        output_config(stepper, &self.master.request(request).await?)
    }

    /// servo signal in microseconds
    pub fn set_servo_value(&self, servo: u8, value: u16) -> Result<(), Error> {
        let mut packet = Packet::command(self.address, Command::ServoValue);
        packet.push_u8(servo).map_err(Error::Master)?;
        packet.push_u16(value).map_err(Error::Master)?;
        self.master.send_packet(packet);
        Ok(())
    }
    pub fn set_servo_config(&self, servo: u8, config: ServoConfig) -> Result<(), Error> {
        let mut packet = Packet::command(self.address, Command::ServoSetConfig);
        packet.push_u8(servo).map_err(Error::Master)?;
        packet.push(&config.to_be_bytes()).map_err(Error::Master)?;
        self.master.send_packet(packet);
        Ok(())
    }
    pub async fn get_servo_config(&self, servo: u8) -> Result<ServoConfig, Error> {
        let request = Packet::command(self.address, Command::ServoGetConfig)
            .with_data(&[servo]).map_err(Error::Master)?;
        output_config(servo, &self.master.request(request).await?)
    }

    /// raw device configuration, its layout is device specific
    pub async fn get_config(&self) -> Result<Data, Error> {
        let request = Packet::command(self.address, Command::GetConfig);
        Ok(self.master.request(request).await?.data)
    }
    pub fn set_config(&self, config: &[u8]) -> Result<(), Error> {
        self.master.send_command(self.address, Command::SetConfig, config)
    }

    /// show text on a display, truncated to [MAX_TEXT] characters, non ASCII characters become `?`
    pub fn set_text(&self, display: u8, text: &str) -> Result<(), Error> {
        let text: heapless::String<MAX_TEXT> = ascii_field(text.as_bytes());
        let mut packet = Packet::command(self.address, Command::SetText);
        // at most 248 bytes of text
        packet.push(&[display, text.len() as u8]).map_err(Error::Master)?;
        packet.push(text.as_bytes()).map_err(Error::Master)?;
        self.master.send_packet(packet);
        Ok(())
    }

    /**
        change the address of this device

        the local record is updated immediately, before the device acknowledges anything, and this
        handle then addresses the device at its new address
    */
    pub fn set_address(&mut self, address: u8) -> Result<(), Error> {
        self.master.send_command(self.address, Command::SetAddress, &[address])?;
        self.master.update_device(self.address, |device| device.address = address);
        self.address = address;
        Ok(())
    }
    /// change the group address the device also listens on
    pub fn set_group(&self, group: u8) -> Result<(), Error> {
        self.master.send_command(self.address, Command::SetGroup, &[group])?;
        self.master.update_device(self.address, |device| device.group = group);
        Ok(())
    }
    /// change the name the device reports, truncated to [MAX_NAME] ASCII characters
    pub fn set_name(&self, name: &str) -> Result<(), Error> {
        let name: heapless::String<MAX_NAME> = ascii_field(name.as_bytes());
        self.master.send_command(self.address, Command::SetName, name.as_bytes())?;
        self.master.update_device(self.address, |device| device.name = name);
        Ok(())
    }

    fn coalesce(&self, property: Property, command: Command, data: &[u8]) {
        let mut packet = Packet::command(self.address, command);
        // these payloads are at most 2 bytes
        let _ = packet.push(data);
        self.master.send_coalesced(Slot {address: self.address, property}, packet);
    }
}
