/// counters of abnormal bus events since the last reset
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct BusStatistics {
    /// frames dropped by the codec, for timeout or checksum mismatch
    pub packet_errors: u64,
    /// receive buffer overruns reported by the transport
    pub overruns: u64,
    /// traffic received while no response was awaited
    pub collisions: u64,
    /// awaited responses that never came
    pub timeouts: u64,
}

impl BusStatistics {
    pub fn reset(&mut self) {
        *self = Self::default();
    }
    pub(crate) fn packet_error(&mut self) {
        self.packet_errors = self.packet_errors.saturating_add(1);
    }
    pub(crate) fn overrun(&mut self) {
        self.overruns = self.overruns.saturating_add(1);
    }
    pub(crate) fn collision(&mut self) {
        self.collisions = self.collisions.saturating_add(1);
    }
    pub(crate) fn timeout(&mut self) {
        self.timeouts = self.timeouts.saturating_add(1);
    }
}
