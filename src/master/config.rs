use std::time::Duration;


/// timing parameters of the bus master
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BusConfig {
    /// delay before checking the transmit queue or the end of a write
    pub transmit_check: Duration,
    /// time a device has to answer a request
    pub response_timeout: Duration,
    /// delay between a poll response and the next poll
    pub poll_interval: Duration,
    /// maximum gap between two bytes of the same frame
    pub frame_timeout: Duration,
    /// reset and scan the bus the first time it is connected
    pub scan_on_connect: bool,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            transmit_check: Duration::from_millis(5),
            response_timeout: Duration::from_millis(150),
            poll_interval: Duration::from_millis(100),
            frame_timeout: Duration::from_millis(150),
            scan_on_connect: true,
        }
    }
}

impl BusConfig {
    pub fn with_transmit_check(self, transmit_check: Duration) -> Self {
        Self {transmit_check, .. self}
    }
    pub fn with_response_timeout(self, response_timeout: Duration) -> Self {
        Self {response_timeout, .. self}
    }
    pub fn with_poll_interval(self, poll_interval: Duration) -> Self {
        Self {poll_interval, .. self}
    }
    pub fn with_frame_timeout(self, frame_timeout: Duration) -> Self {
        Self {frame_timeout, .. self}
    }
    pub fn with_scan_on_connect(self, scan_on_connect: bool) -> Self {
        Self {scan_on_connect, .. self}
    }
}
