use crate::device::Device;


/**
    devices known to the master, in discovery order

    the scan visits addresses in ascending order, so devices are sorted by address until one is re-addressed.
    Addresses are expected to be unique, a duplicate address is a bus configuration error that is not checked here.
*/
#[derive(Clone, Debug, Default)]
pub struct DeviceRegistry {
    devices: Vec<Device>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn insert(&mut self, device: Device) {
        self.devices.push(device);
    }
    pub fn clear(&mut self) {
        self.devices.clear();
    }
    pub fn len(&self) -> usize {
        self.devices.len()
    }
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
    pub fn iter(&self) -> impl Iterator<Item=&Device> {
        self.devices.iter()
    }
    /// device at the given rank in discovery order
    pub fn get(&self, index: usize) -> Option<&Device> {
        self.devices.get(index)
    }
    pub fn get_mut(&mut self, index: usize) -> Option<&mut Device> {
        self.devices.get_mut(index)
    }
    pub fn by_address(&self, address: u8) -> Option<&Device> {
        self.devices.iter().find(|device| device.address == address)
    }
    pub fn by_address_mut(&mut self, address: u8) -> Option<&mut Device> {
        self.devices.iter_mut().find(|device| device.address == address)
    }
    /**
        index of the next device to poll, starting the round at `start` and wrapping around

        saturated devices are skipped, `None` is returned when no device can be polled
    */
    pub fn next_pollable(&self, start: usize) -> Option<usize> {
        let count = self.devices.len();
        (0 .. count)
            .map(|offset| (start + offset) % count)
            .find(|&index| ! self.devices[index].is_saturated())
    }
    /// change the address of a known device, returns false if no device had the old address
    pub fn readdress(&mut self, old: u8, new: u8) -> bool {
        match self.by_address_mut(old) {
            Some(device) => {
                device.address = new;
                true
            },
            None => false,
        }
    }
}
