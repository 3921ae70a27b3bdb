/*!
    scheduling state machine of the bus master

    the engine owns everything that decides who talks on the bus: the transmit queue consumer, the
    response correlation, the scan and poll rotations, and the single timer driving them.
    It never waits by itself, every entry point receives the current instant and leaves a deadline at
    which [Engine::on_timer] must be called again.
*/

use std::{
    sync::Arc,
    time::Duration,
    };
use tokio::{
    sync::{mpsc, broadcast},
    time::Instant,
    };
use log::*;

use crate::{
    command::{Command, BROADCAST_ADDRESS, MASTER_ADDRESS},
    packet::Packet,
    device::Device,
    };
use super::{
    codec::{PacketCodec, FrameError},
    config::BusConfig,
    registry::DeviceRegistry,
    statistics::BusStatistics,
    transport::Transport,
    accessing::{Coalescer, Slot},
    };


/// highest address visited by a scan
pub const LAST_SCAN_ADDRESS: u8 = 31;

/// activity of the bus, as reported to subscribers
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BusState {
    /// devices are polled in turn
    Polling,
    /// addresses are probed for devices
    Scanning,
    /// a queued packet is being written
    Transmitting,
    /// a queued packet is waiting for its response
    WaitingResponse,
    /// nothing scheduled
    Idle,
}

/// progress of the exchange currently owning the bus
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum MasterState {
    Idle,
    Transmitting,
    WaitingResponse,
    /// a rescan will start as soon as the current exchange ends
    ClearingScan,
    /// a reset will be sent as soon as the current exchange ends
    ClearingReset,
}

/// device the master expects an answer from
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Awaiting {
    None,
    Address(u8),
}

/// notification sent to every [subscriber](super::Master::subscribe)
#[derive(Clone, Debug, PartialEq)]
pub enum BusEvent {
    /// any valid packet received
    PacketReceived(Packet),
    /// end of an exchange with a device, the packet is absent when the device did not answer in time
    Response {
        address: u8,
        /// command byte of the request
        request: u8,
        /// ticket of the queued request this exchange answers, none for polls and scan probes
        ticket: Option<Ticket>,
        packet: Option<Packet>,
    },
    /// a device answered a poll
    DeviceUpdated(Device),
    /// a scan completed and the device list was rebuilt
    BusReset,
    StateChanged(BusState),
    ConnectionChanged(bool),
}

/// identifies a queued request in its [BusEvent::Response]
pub type Ticket = u32;

/// item of the transmit queue
#[derive(Clone, Debug)]
pub(crate) enum Outbound {
    Packet(Packet),
    /// a packet whose sender waits for the response event carrying this ticket
    Request(Ticket, Packet),
    /// a coalesced packet, to be taken from the coalescer when dequeued
    Coalesced(Slot),
}


pub(crate) struct Engine {
    config: BusConfig,
    transport: Box<dyn Transport + Send>,
    codec: PacketCodec,

    master: MasterState,
    state: BusState,
    awaiting: Awaiting,
    /// command byte of the pending request
    request: u8,
    ticket: Option<Ticket>,
    /// a transmitted frame is not yet fully written
    writing: bool,
    /// poll devices when nothing else is to be done
    polling: bool,
    /// a complete scan happened since the last connection
    scanned: bool,
    connected: bool,
    scan_address: u8,
    poll_index: usize,
    deadline: Option<Instant>,

    queue: mpsc::UnboundedReceiver<Outbound>,
    coalesced: Arc<Coalescer>,
    events: broadcast::Sender<BusEvent>,

    registry: DeviceRegistry,
    statistics: BusStatistics,
}

impl Engine {
    pub fn new(
        transport: Box<dyn Transport + Send>,
        config: BusConfig,
        queue: mpsc::UnboundedReceiver<Outbound>,
        coalesced: Arc<Coalescer>,
        events: broadcast::Sender<BusEvent>,
    ) -> Self {
        Self {
            codec: PacketCodec::new(config.frame_timeout),
            config,
            transport,
            master: MasterState::Idle,
            state: BusState::Idle,
            awaiting: Awaiting::None,
            request: 0,
            ticket: None,
            writing: false,
            polling: true,
            scanned: false,
            connected: false,
            scan_address: 0,
            poll_index: 0,
            deadline: None,
            queue,
            coalesced,
            events,
            registry: DeviceRegistry::new(),
            statistics: BusStatistics::default(),
        }
    }

    pub fn state(&self) -> BusState {self.state}
    pub fn is_connected(&self) -> bool {self.connected}
    pub fn is_polling(&self) -> bool {self.polling}
    pub fn statistics(&self) -> BusStatistics {self.statistics}
    pub fn registry(&self) -> &DeviceRegistry {&self.registry}
    pub fn registry_mut(&mut self) -> &mut DeviceRegistry {&mut self.registry}
    #[cfg(test)]
    pub(crate) fn master_state(&self) -> MasterState {self.master}
    #[cfg(test)]
    pub(crate) fn awaiting(&self) -> Awaiting {self.awaiting}

    /// next instant [Self::on_timer] must be called at
    pub fn deadline(&self) -> Option<Instant> {
        match (self.deadline, self.codec.deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    pub fn connect(&mut self, now: Instant) {
        if self.connected
            {return}
        debug!("bus connected");
        self.connected = true;
        self.emit(BusEvent::ConnectionChanged(true));
        if self.config.scan_on_connect && ! self.scanned {
            self.reset(now);
            self.rescan(now);
        }
        else if self.master == MasterState::Idle {
            self.arm(now + self.config.transmit_check);
        }
    }
    pub fn disconnect(&mut self) {
        if ! self.connected
            {return}
        debug!("bus disconnected");
        self.connected = false;
        if let (Awaiting::Address(address), Some(ticket)) = (self.awaiting, self.ticket.take()) {
            self.emit(BusEvent::Response {address, request: self.request, ticket: Some(ticket), packet: None});
        }
        self.deadline = None;
        self.codec.reset();
        self.master = MasterState::Idle;
        self.awaiting = Awaiting::None;
        self.writing = false;
        self.set_state(BusState::Idle);
        self.emit(BusEvent::ConnectionChanged(false));
    }

    pub fn start_polling(&mut self, now: Instant) {
        self.polling = true;
        if self.state == BusState::Idle {
            self.set_state(BusState::Polling);
            if self.connected && self.master == MasterState::Idle
                {self.next_poll(now)}
        }
    }
    pub fn stop_polling(&mut self) {
        self.polling = false;
    }

    /// broadcast a reset to all devices and zero the statistics, deferred if the bus is busy
    pub fn reset(&mut self, now: Instant) {
        if self.master != MasterState::Idle {
            debug!("reset deferred");
            self.master = MasterState::ClearingReset;
            return;
        }
        self.statistics.reset();
        if self.state != BusState::Scanning
            {self.set_state(BusState::Transmitting)}
        self.transmit(Packet::command(BROADCAST_ADDRESS, Command::Reset), None, now);
    }
    /// forget all devices and scan the bus again, deferred if the bus is busy
    pub fn rescan(&mut self, now: Instant) {
        if self.master != MasterState::Idle {
            debug!("rescan deferred");
            self.master = MasterState::ClearingScan;
            return;
        }
        debug!("scanning");
        self.registry.clear();
        self.codec.reset();
        self.deadline = None;
        self.scanned = false;
        self.scan_address = 0;
        self.poll_index = 0;
        self.set_state(BusState::Scanning);
        self.next_scan(now);
    }

    /// a packet was put in the transmit queue
    pub fn on_enqueue(&mut self, now: Instant) {
        if ! self.connected || self.master != MasterState::Idle
            {return}
        let check = now + self.config.transmit_check;
        if self.deadline.is_none_or(|deadline| deadline > check)
            {self.arm(check)}
    }
    pub fn report_overrun(&mut self) {
        self.statistics.overrun();
    }

    /// timer expiry, does nothing if no deadline is reached
    pub fn on_timer(&mut self, now: Instant) {
        if let Some(error) = self.codec.expire(now)
            {self.frame_error(error, now)}
        match self.deadline {
            Some(deadline) if deadline <= now => {self.deadline = None},
            _ => return,
        }
        match self.master {
            MasterState::Idle => self.do_idle(now),
            MasterState::Transmitting => self.check_write(now),
            MasterState::WaitingResponse => self.fail_exchange(true, now),
            MasterState::ClearingScan | MasterState::ClearingReset => {
                if self.writing
                    {self.check_write(now)}
                else if self.awaiting != Awaiting::None
                    {self.fail_exchange(true, now)}
                else
                    {self.run_deferred(now)}
            },
        }
    }
    /// the transport reports the end of the current write
    pub fn on_write_complete(&mut self, now: Instant) {
        // a late completion of a previous frame must not end the current write
        if self.writing
            {self.check_write(now)}
    }
    /// bytes received from the transport
    pub fn on_bytes(&mut self, bytes: &[u8], now: Instant) {
        if ! self.connected
            {return}
        for &byte in bytes {
            match self.codec.feed_at(byte, now) {
                Ok(Some(packet)) => self.packet_received(packet, now),
                Ok(None) => {},
                Err(error) => self.frame_error(error, now),
            }
        }
    }

    fn check_write(&mut self, now: Instant) {
        if self.transport.is_writing()
            {self.arm(now + self.config.transmit_check)}
        else
            {self.write_finished(now)}
    }

    fn write_finished(&mut self, now: Instant) {
        self.writing = false;
        let awaiting = self.awaiting != Awaiting::None;
        match self.master {
            MasterState::Transmitting => {
                if awaiting {
                    if self.state == BusState::Transmitting
                        {self.set_state(BusState::WaitingResponse)}
                    self.master = MasterState::WaitingResponse;
                    self.arm(now + self.config.response_timeout);
                }
                else {
                    if self.state == BusState::Transmitting
                        {self.set_state(self.rotation_state())}
                    self.do_idle(now);
                }
            },
            MasterState::ClearingScan | MasterState::ClearingReset => {
                // the deferred action waits for the end of the exchange
                if awaiting
                    {self.arm(now + self.config.response_timeout)}
                else
                    {self.run_deferred(now)}
            },
            _ => {},
        }
    }

    fn packet_received(&mut self, packet: Packet, now: Instant) {
        trace!("received {:?}", packet);
        self.emit(BusEvent::PacketReceived(packet.clone()));
        if self.awaiting != Awaiting::Address(packet.source) {
            debug!("unexpected packet from {}", packet.source);
            self.statistics.collision();
            return;
        }
        if self.writing {
            // an answer cannot come before the request is fully on the wire
            if self.transport.is_writing() {
                self.statistics.collision();
                return;
            }
            self.writing = false;
            if self.master == MasterState::Transmitting {
                self.master = MasterState::WaitingResponse;
                if self.state == BusState::Transmitting
                    {self.set_state(BusState::WaitingResponse)}
            }
        }
        self.deadline = None;
        self.awaiting = Awaiting::None;
        let ticket = self.ticket.take();
        self.emit(BusEvent::Response {
            address: packet.source,
            request: self.request,
            ticket,
            packet: Some(packet.clone()),
            });

        match self.state {
            BusState::Polling => self.update_device(&packet),
            BusState::Scanning => self.register_device(&packet),
            _ => if packet.kind() == Command::PollResponse
                {self.update_device(&packet)},
        }
        if self.master != MasterState::WaitingResponse {
            self.run_deferred(now);
            return;
        }
        self.master = MasterState::Idle;
        match self.state {
            BusState::Polling => self.arm(now + self.poll_delay()),
            BusState::Scanning => self.next_scan(now),
            _ => {
                self.set_state(self.rotation_state());
                if self.polling
                    {self.arm(now + self.poll_delay())}
                else
                    {self.do_idle(now)}
            },
        }
    }

    fn frame_error(&mut self, error: FrameError, now: Instant) {
        debug!("frame dropped: {}", error);
        self.statistics.packet_error();
        match self.awaiting {
            Awaiting::None => self.statistics.collision(),
            // garbage instead of the awaited answer, no need to wait longer
            Awaiting::Address(_) => if ! self.writing
                {self.fail_exchange(false, now)},
        }
    }

    /// the awaited device did not answer, or answered garbage
    fn fail_exchange(&mut self, timed_out: bool, now: Instant) {
        let Awaiting::Address(address) = self.awaiting
            else {return};
        self.awaiting = Awaiting::None;
        self.deadline = None;
        self.writing = false;
        debug!("no valid response from {}", address);
        // silence is the normal answer of an empty address during a scan
        if timed_out && self.state != BusState::Scanning
            {self.statistics.timeout()}
        let ticket = self.ticket.take();
        self.emit(BusEvent::Response {address, request: self.request, ticket, packet: None});

        if self.state == BusState::Polling {
            if let Some(device) = self.registry.by_address_mut(address) {
                if device.record_polling_error()
                    {warn!("device {} ({}) does not answer polls anymore, it will no longer be polled", address, device.name)}
            }
        }
        match self.master {
            MasterState::ClearingScan | MasterState::ClearingReset => self.run_deferred(now),
            _ => self.do_idle(now),
        }
    }

    /// run the reset or rescan requested while the bus was busy
    fn run_deferred(&mut self, now: Instant) {
        let deferred = self.master;
        self.master = MasterState::Idle;
        self.awaiting = Awaiting::None;
        self.writing = false;
        self.deadline = None;
        match deferred {
            MasterState::ClearingScan => self.rescan(now),
            MasterState::ClearingReset => self.reset(now),
            _ => self.do_idle(now),
        }
    }

    /// choose what to do next now that the bus is free
    fn do_idle(&mut self, now: Instant) {
        self.master = MasterState::Idle;
        self.awaiting = Awaiting::None;
        self.deadline = None;
        if ! self.connected
            {return}

        // a scan owns the bus until it ends, queued packets wait
        if self.state != BusState::Scanning {
            if let Some((packet, ticket)) = self.dequeue() {
                self.set_state(BusState::Transmitting);
                self.transmit(packet, ticket, now);
                return;
            }
        }
        match self.state {
            BusState::Scanning => self.next_scan(now),
            BusState::Polling => {
                if self.polling
                    {self.next_poll(now)}
                else
                    {self.set_state(BusState::Idle)}
            },
            BusState::Idle => {
                if self.polling {
                    self.set_state(BusState::Polling);
                    self.next_poll(now);
                }
            },
            BusState::Transmitting | BusState::WaitingResponse => {
                self.set_state(self.rotation_state());
                if self.polling
                    {self.next_poll(now)}
            },
        }
    }

    fn dequeue(&mut self) -> Option<(Packet, Option<Ticket>)> {
        while let Ok(outbound) = self.queue.try_recv() {
            match outbound {
                Outbound::Packet(packet) => return Some((packet, None)),
                Outbound::Request(ticket, packet) => return Some((packet, Some(ticket))),
                Outbound::Coalesced(slot) => if let Some(packet) = self.coalesced.take(slot)
                    {return Some((packet, None))},
            }
        }
        None
    }

    fn next_scan(&mut self, now: Instant) {
        if self.scan_address < LAST_SCAN_ADDRESS {
            self.scan_address += 1;
            self.transmit(Packet::command(self.scan_address, Command::Info), None, now);
            return;
        }
        debug!("scan complete, {} devices found", self.registry.len());
        self.scanned = true;
        self.poll_index = 0;
        self.emit(BusEvent::BusReset);
        self.set_state(self.rotation_state());
        self.do_idle(now);
    }

    fn next_poll(&mut self, now: Instant) {
        // when no device can be polled, the bus stays idle until something is queued
        let Some(index) = self.registry.next_pollable(self.poll_index)
            else {return};
        self.poll_index = index + 1;
        if let Some(address) = self.registry.get(index).map(|device| device.address)
            {self.transmit(Packet::command(address, Command::Poll), None, now)}
    }

    fn transmit(&mut self, mut packet: Packet, ticket: Option<Ticket>, now: Instant) {
        packet.source = MASTER_ADDRESS;
        self.awaiting = if packet.is_response_required()
            {Awaiting::Address(packet.destination)}
            else {Awaiting::None};
        self.request = packet.command;
        self.ticket = ticket;
        self.master = MasterState::Transmitting;
        self.writing = true;
        trace!("transmit {:?}", packet);
        // a lost frame is recovered by the response timeout
        if let Err(error) = self.transport.transmit(&packet.encode())
            {warn!("failed to transmit to {}: {}", packet.destination, error)}
        self.arm(now + self.config.transmit_check);
    }

    fn update_device(&mut self, packet: &Packet) {
        // an empty answer carries no input state
        if packet.data.is_empty()
            {return}
        if let Some(device) = self.registry.by_address_mut(packet.source) {
            device.update_state(&packet.data);
            let snapshot = device.clone();
            self.emit(BusEvent::DeviceUpdated(snapshot));
        }
    }
    fn register_device(&mut self, packet: &Packet) {
        match Device::from_info(packet.source, &packet.data) {
            Ok(device) => {
                debug!("found device {} ({}) at {}", device.name, device.firmware, device.address);
                self.registry.insert(device);
            },
            Err(error) => warn!("ignoring device at {}: {}", packet.source, error),
        }
    }

    /// pause before the next poll, shortened when packets are waiting to be sent
    fn poll_delay(&self) -> Duration {
        if self.queue.is_empty() {self.config.poll_interval} else {self.config.transmit_check}
    }
    fn rotation_state(&self) -> BusState {
        if self.polling {BusState::Polling} else {BusState::Idle}
    }
    fn set_state(&mut self, state: BusState) {
        if self.state != state {
            debug!("bus state {:?} -> {:?}", self.state, state);
            self.state = state;
            self.emit(BusEvent::StateChanged(state));
        }
    }
    fn arm(&mut self, deadline: Instant) {
        self.deadline = Some(deadline);
    }
    fn emit(&self, event: BusEvent) {
        // nobody listening is fine
        let _ = self.events.send(event);
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        io,
        sync::{
            Mutex,
            atomic::{AtomicBool, Ordering},
            },
        };
    use crate::{
        device::{InfoRecord, MAX_POLLING_ERRORS},
        packet::Frame,
        };
    use super::super::accessing::Property;
    use packbytes::ToBytes;

    /// transport recording every frame, writing only while told so
    #[derive(Clone, Default)]
    struct Recorder {
        frames: Arc<Mutex<Vec<Frame>>>,
        writing: Arc<AtomicBool>,
    }
    impl Transport for Recorder {
        fn transmit(&mut self, frame: &[u8]) -> io::Result<()> {
            self.frames.lock().unwrap().push(Frame::from_slice(frame).unwrap());
            Ok(())
        }
        fn is_writing(&self) -> bool {
            self.writing.load(Ordering::Relaxed)
        }
    }

    struct Bench {
        engine: Engine,
        frames: Arc<Mutex<Vec<Frame>>>,
        writing: Arc<AtomicBool>,
        queue: mpsc::UnboundedSender<Outbound>,
        coalesced: Arc<Coalescer>,
        events: broadcast::Receiver<BusEvent>,
        now: Instant,
        /// frames already returned by next_frame
        seen: usize,
    }
    impl Bench {
        fn new(config: BusConfig) -> Self {
            let _ = env_logger::builder().is_test(true).try_init();
            let recorder = Recorder::default();
            let frames = recorder.frames.clone();
            let writing = recorder.writing.clone();
            let (queue, receive) = mpsc::unbounded_channel();
            let coalesced = Arc::new(Coalescer::default());
            let (events, listen) = broadcast::channel(4096);
            Self {
                engine: Engine::new(Box::new(recorder), config, receive, coalesced.clone(), events),
                frames,
                writing,
                queue,
                coalesced,
                events: listen,
                now: Instant::now(),
                seen: 0,
            }
        }
        /// bench with devices already registered, connected without scan
        fn with_devices(addresses: &[u8], polling: bool) -> Self {
            let mut bench = Self::new(BusConfig::default().with_scan_on_connect(false));
            for &address in addresses {
                bench.engine.registry_mut().insert(Device::new(address, info(address)));
            }
            if ! polling
                {bench.engine.stop_polling()}
            bench.engine.connect(bench.now);
            bench
        }
        /// jump to the next deadline and fire it
        fn fire(&mut self) {
            let deadline = self.engine.deadline().expect("no deadline armed");
            if deadline > self.now
                {self.now = deadline}
            self.engine.on_timer(self.now);
        }
        /// next transmitted frame not yet inspected, firing deadlines until there is one
        fn next_frame(&mut self) -> Packet {
            for _ in 0 .. 16 {
                if self.frames.lock().unwrap().len() > self.seen
                    {break}
                self.fire();
            }
            let packet = {
                let frames = self.frames.lock().unwrap();
                assert!(frames.len() > self.seen, "no frame transmitted");
                decode(&frames[self.seen])
            };
            self.seen += 1;
            packet
        }
        /// let the current write complete
        fn finish_write(&mut self) {
            self.now += Duration::from_millis(1);
            self.engine.on_write_complete(self.now);
        }
        fn reply(&mut self, packet: &Packet) {
            self.now += Duration::from_millis(2);
            self.engine.on_bytes(&packet.encode(), self.now);
        }
        fn enqueue(&mut self, packet: Packet) {
            self.queue.send(Outbound::Packet(packet)).unwrap();
            self.engine.on_enqueue(self.now);
        }
        fn enqueue_request(&mut self, ticket: Ticket, packet: Packet) {
            self.queue.send(Outbound::Request(ticket, packet)).unwrap();
            self.engine.on_enqueue(self.now);
        }
        fn responses(&mut self) -> Vec<(Option<Ticket>, Option<Packet>)> {
            self.drain_events().into_iter()
                .filter_map(|event| match event {
                    BusEvent::Response {ticket, packet, ..} => Some((ticket, packet)),
                    _ => None,
                })
                .collect()
        }
        fn drain_events(&mut self) -> Vec<BusEvent> {
            let mut events = Vec::new();
            while let Ok(event) = self.events.try_recv()
                {events.push(event)}
            events
        }
        fn transmitted(&self) -> Vec<Packet> {
            self.frames.lock().unwrap().iter().map(|frame| decode(frame)).collect()
        }
    }

    fn decode(frame: &[u8]) -> Packet {
        let mut codec = PacketCodec::new(Duration::from_millis(150));
        let mut out = Vec::new();
        codec.feed_buffer(frame, Instant::now(), |item| out.push(item.unwrap()));
        out.pop().expect("frame did not decode")
    }
    fn info(address: u8) -> InfoRecord {
        InfoRecord {
            name: *b"NODE\0\0\0\0",
            firmware: *b"0001",
            digital_inputs: 8,
            analog_inputs: 1,
            group: address,
            .. InfoRecord::default()
        }
    }
    fn answer(request: &Packet, data: &[u8]) -> Packet {
        Packet::response(request).with_data(data).unwrap()
    }

    #[test]
    fn scan_discovers_responders() {
        let mut bench = Bench::new(BusConfig::default());
        bench.engine.stop_polling();
        bench.engine.connect(bench.now);
        // the reset broadcast goes first
        let reset = bench.next_frame();
        assert_eq!(reset.destination, BROADCAST_ADDRESS);
        assert_eq!(reset.kind(), Command::Reset);

        let responders = [3, 7, 19];
        let mut probed = Vec::new();
        loop {
            let request = bench.next_frame();
            if request.kind() != Command::Info
                {panic!("unexpected frame {:?}", request)}
            probed.push(request.destination);
            bench.finish_write();
            if responders.contains(&request.destination)
                {bench.reply(&answer(&request, &info(request.destination).to_be_bytes()))}
            if request.destination == LAST_SCAN_ADDRESS {
                if ! responders.contains(&LAST_SCAN_ADDRESS)
                    {bench.fire()}
                break
            }
        }
        assert_eq!(probed, (1 ..= LAST_SCAN_ADDRESS).collect::<Vec<_>>());
        let found: Vec<u8> = bench.engine.registry().iter().map(|device| device.address).collect();
        assert_eq!(found, vec![3, 7, 19]);
        assert_eq!(bench.engine.state(), BusState::Idle);
        assert_eq!(bench.engine.master_state(), MasterState::Idle);

        let events = bench.drain_events();
        assert_eq!(events.iter().filter(|event| **event == BusEvent::BusReset).count(), 1);
        // silence during a scan is not an error
        assert_eq!(bench.engine.statistics().timeouts, 0);
        assert_eq!(bench.engine.statistics().collisions, 0);
    }

    #[test]
    fn silent_device_saturates_while_others_rotate() {
        let mut bench = Bench::with_devices(&[1, 2], true);
        let mut polls_to_1 = 0;
        for _ in 0 .. 2 * usize::from(MAX_POLLING_ERRORS) + 20 {
            let request = bench.next_frame();
            assert_eq!(request.kind(), Command::Poll);
            bench.finish_write();
            if request.destination == 1 {
                polls_to_1 += 1;
                bench.fire();
            }
            else {
                bench.reply(&answer(&request, &[0x01, 0x00, 0x10]));
            }
        }
        let silent = bench.engine.registry().by_address(1).unwrap();
        assert_eq!(silent.polling_errors, MAX_POLLING_ERRORS);
        assert!(silent.is_saturated());
        assert_eq!(polls_to_1, usize::from(MAX_POLLING_ERRORS));
        assert_eq!(bench.engine.statistics().timeouts, u64::from(MAX_POLLING_ERRORS));
        assert_eq!(bench.engine.registry().by_address(2).unwrap().polling_errors, 0);
        assert_eq!(bench.engine.state(), BusState::Polling);

        // only the live device is polled now
        for _ in 0 .. 5 {
            let request = bench.next_frame();
            assert_eq!(request.destination, 2);
            bench.finish_write();
            bench.reply(&answer(&request, &[0x01, 0x00, 0x10]));
        }
    }

    #[test]
    fn adhoc_request_during_polling() {
        let mut bench = Bench::with_devices(&[5], true);
        // first poll goes out and gets its answer
        let poll = bench.next_frame();
        bench.finish_write();
        bench.reply(&answer(&poll, &[0, 0, 0]));
        assert_eq!(bench.engine.master_state(), MasterState::Idle);
        bench.drain_events();

        let request = Packet::command(5, Command::Poll);
        bench.enqueue(request.clone());
        let sent = bench.next_frame();
        assert_eq!(sent, request);
        assert_eq!(bench.engine.state(), BusState::Transmitting);
        assert_eq!(bench.engine.awaiting(), Awaiting::Address(5));
        bench.finish_write();
        assert_eq!(bench.engine.state(), BusState::WaitingResponse);

        let response = answer(&request, &[0xff, 0x12, 0x34]);
        bench.reply(&response);
        let replied = bench.now;
        assert_eq!(bench.engine.state(), BusState::Polling);
        assert_eq!(bench.engine.registry().by_address(5).unwrap().state.as_slice(), &[0xff, 0x12, 0x34]);
        assert_eq!(bench.engine.deadline(), Some(replied + BusConfig::default().poll_interval));

        let events = bench.drain_events();
        assert_eq!(events, vec![
            BusEvent::StateChanged(BusState::Transmitting),
            BusEvent::StateChanged(BusState::WaitingResponse),
            BusEvent::PacketReceived(response.clone()),
            BusEvent::Response {address: 5, request: request.command, ticket: None, packet: Some(response.clone())},
            BusEvent::DeviceUpdated(bench.engine.registry().by_address(5).unwrap().clone()),
            BusEvent::StateChanged(BusState::Polling),
            ]);
    }

    #[test]
    fn queued_packet_without_response_returns_to_rotation() {
        let mut bench = Bench::with_devices(&[], false);
        bench.enqueue(Packet::command(4, Command::BacklightPower).with_data(&[1]).unwrap());
        let sent = bench.next_frame();
        assert_eq!(sent.kind(), Command::BacklightPower);
        assert_eq!(sent.source, MASTER_ADDRESS);
        assert_eq!(bench.engine.awaiting(), Awaiting::None);
        bench.finish_write();
        assert_eq!(bench.engine.state(), BusState::Idle);
        assert_eq!(bench.engine.master_state(), MasterState::Idle);
        assert_eq!(bench.engine.deadline(), None);
    }

    #[test]
    fn timer_detects_end_of_write() {
        let mut bench = Bench::with_devices(&[], false);
        let request = Packet::command(9, Command::Info);
        bench.enqueue(request.clone());
        bench.next_frame();
        // no completion reported, the transmit check finds the transport idle
        bench.fire();
        assert_eq!(bench.engine.state(), BusState::WaitingResponse);
        bench.fire();
        assert_eq!(bench.engine.state(), BusState::Idle);
        assert_eq!(bench.engine.statistics().timeouts, 1);
        assert!(bench.drain_events().contains(&BusEvent::Response {address: 9, request: request.command, ticket: None, packet: None}));
    }

    #[test]
    fn response_before_write_completion() {
        let mut bench = Bench::with_devices(&[], false);
        let request = Packet::command(9, Command::GetConfig);
        bench.enqueue(request.clone());
        bench.next_frame();
        assert_eq!(bench.engine.master_state(), MasterState::Transmitting);
        // the recorder never reports writing, so an early answer is accepted
        bench.reply(&answer(&request, &[1, 2]));
        assert_eq!(bench.engine.state(), BusState::Idle);
        assert_eq!(bench.engine.master_state(), MasterState::Idle);
        assert_eq!(bench.engine.statistics().collisions, 0);
    }

    #[test]
    fn reset_is_deferred_until_exchange_ends() {
        let mut bench = Bench::with_devices(&[5], true);
        let poll = bench.next_frame();
        bench.finish_write();
        bench.engine.reset(bench.now);
        assert_eq!(bench.engine.master_state(), MasterState::ClearingReset);
        assert_eq!(bench.transmitted().len(), 1);

        bench.reply(&answer(&poll, &[7]));
        // the answer is still accounted before the reset goes out
        assert_eq!(bench.engine.registry().by_address(5).unwrap().state.as_slice(), &[7]);
        let sent = bench.transmitted();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].kind(), Command::Reset);
        assert_eq!(sent[1].destination, BROADCAST_ADDRESS);
        assert_eq!(bench.engine.master_state(), MasterState::Transmitting);
    }

    #[test]
    fn rescan_is_deferred_until_timeout() {
        let mut bench = Bench::with_devices(&[5], true);
        bench.next_frame();
        bench.finish_write();
        bench.engine.rescan(bench.now);
        assert_eq!(bench.engine.master_state(), MasterState::ClearingScan);
        bench.fire();
        assert_eq!(bench.engine.state(), BusState::Scanning);
        assert!(bench.engine.registry().is_empty());
        let probe = bench.transmitted().pop().unwrap();
        assert_eq!(probe.kind(), Command::Info);
        assert_eq!(probe.destination, 1);
    }

    #[test]
    fn corrupt_frame_while_idle_is_a_collision() {
        let mut bench = Bench::with_devices(&[], false);
        let mut frame = Packet::command(0, Command::PollResponse).with_data(&[1, 2]).unwrap().encode();
        let last = frame.len() - 1;
        frame[last] ^= 0x55;
        bench.engine.on_bytes(&frame, bench.now);
        let stats = bench.engine.statistics();
        assert_eq!(stats.packet_errors, 1);
        assert_eq!(stats.collisions, 1);
        assert_eq!(bench.engine.state(), BusState::Idle);

        // a valid packet nobody asked for
        bench.reply(&Packet::command(0, Command::PollResponse));
        assert_eq!(bench.engine.statistics().collisions, 2);
    }

    #[test]
    fn corrupt_answer_fails_the_exchange_immediately() {
        let mut bench = Bench::with_devices(&[5], true);
        let poll = bench.next_frame();
        bench.finish_write();
        bench.drain_events();

        let mut frame = answer(&poll, &[1]).encode();
        let last = frame.len() - 1;
        frame[last] = frame[last].wrapping_add(1);
        bench.engine.on_bytes(&frame, bench.now);

        assert_eq!(bench.drain_events(), vec![BusEvent::Response {address: 5, request: poll.command, ticket: None, packet: None}]);
        let stats = bench.engine.statistics();
        assert_eq!(stats.packet_errors, 1);
        assert_eq!(stats.timeouts, 0);
        assert_eq!(stats.collisions, 0);
        assert_eq!(bench.engine.registry().by_address(5).unwrap().polling_errors, 1);
        // polling goes on right away
        assert_eq!(bench.transmitted().len(), 2);
    }

    #[test]
    fn truncated_answer_times_out_in_codec() {
        let mut bench = Bench::with_devices(&[5], false);
        let request = Packet::command(5, Command::Info);
        bench.enqueue(request.clone());
        bench.next_frame();
        bench.finish_write();
        let frame = answer(&request, &[1, 2, 3]).encode();
        bench.engine.on_bytes(&frame[.. 6], bench.now);
        // the partial frame expires with the response timeout, the frame error ends the exchange first
        bench.fire();
        let stats = bench.engine.statistics();
        assert_eq!(stats.packet_errors, 1);
        assert_eq!(stats.timeouts, 0);
        assert_eq!(bench.engine.awaiting(), Awaiting::None);
        assert_eq!(bench.engine.state(), BusState::Idle);
    }

    #[test]
    fn coalesced_sets_send_the_last_value_once() {
        let mut bench = Bench::with_devices(&[], false);
        let slot = Slot {address: 4, property: Property::BacklightLevel};
        for level in [10, 20, 30] {
            let packet = Packet::command(4, Command::BacklightLevel).with_data(&[level]).unwrap();
            let queue = bench.queue.clone();
            bench.coalesced.set(slot, packet, |slot| {let _ = queue.send(Outbound::Coalesced(slot));});
            bench.engine.on_enqueue(bench.now);
        }
        let sent = bench.next_frame();
        assert_eq!(sent.data.as_slice(), &[30]);
        bench.finish_write();
        assert_eq!(bench.transmitted().len(), 1);
        assert_eq!(bench.engine.deadline(), None);

        // once sent, the next set goes out again
        let packet = Packet::command(4, Command::BacklightLevel).with_data(&[40]).unwrap();
        let queue = bench.queue.clone();
        bench.coalesced.set(slot, packet, |slot| {let _ = queue.send(Outbound::Coalesced(slot));});
        bench.engine.on_enqueue(bench.now);
        assert_eq!(bench.next_frame().data.as_slice(), &[40]);
    }

    #[test]
    fn connection_events_fire_on_change() {
        let mut bench = Bench::new(BusConfig::default().with_scan_on_connect(false));
        bench.engine.connect(bench.now);
        bench.engine.connect(bench.now);
        bench.engine.disconnect();
        bench.engine.disconnect();
        let events = bench.drain_events();
        assert_eq!(events.iter().filter(|event| matches!(event, BusEvent::ConnectionChanged(_))).count(), 2);
        assert!(! bench.engine.is_connected());
        assert_eq!(bench.engine.deadline(), None);
    }

    #[test]
    fn reset_zeroes_statistics() {
        let mut bench = Bench::with_devices(&[], false);
        bench.engine.report_overrun();
        bench.engine.on_bytes(&[0xbb, 0x88, 1, 2, 3, 0, 0], bench.now);
        assert_ne!(bench.engine.statistics(), BusStatistics::default());
        bench.engine.reset(bench.now);
        assert_eq!(bench.engine.statistics(), BusStatistics::default());
        assert_eq!(bench.transmitted().pop().unwrap().kind(), Command::Reset);
    }

    #[test]
    fn queued_request_ignores_rotation_timeout() {
        let mut bench = Bench::with_devices(&[5], true);
        bench.next_frame();
        bench.finish_write();
        // same device and command as the rotation poll in flight
        let request = Packet::command(5, Command::Poll);
        bench.enqueue_request(7, request.clone());
        bench.drain_events();

        bench.fire();
        assert_eq!(bench.responses(), vec![(None, None)]);
        assert_eq!(bench.engine.registry().by_address(5).unwrap().polling_errors, 1);

        let sent = bench.next_frame();
        assert_eq!(sent, request);
        bench.finish_write();
        let response = answer(&sent, &[3]);
        bench.reply(&response);
        assert_eq!(bench.responses(), vec![(Some(7), Some(response))]);
    }

    #[test]
    fn disconnect_fails_pending_request() {
        let mut bench = Bench::with_devices(&[], false);
        bench.enqueue_request(3, Packet::command(8, Command::GetConfig));
        bench.next_frame();
        bench.finish_write();
        bench.drain_events();
        bench.engine.disconnect();
        assert_eq!(bench.responses(), vec![(Some(3), None)]);
    }

    #[test]
    fn late_write_completion_keeps_current_frame_writing() {
        let mut bench = Bench::with_devices(&[], false);
        bench.enqueue(Packet::command(4, Command::BacklightPower).with_data(&[1]).unwrap());
        bench.enqueue(Packet::command(9, Command::Info));
        assert_eq!(bench.next_frame().kind(), Command::BacklightPower);
        // the transmit check sees the first write done and sends the second frame
        bench.fire();
        assert_eq!(bench.next_frame().kind(), Command::Info);
        bench.writing.store(true, Ordering::Relaxed);

        // completion of the first frame reported late
        bench.finish_write();
        let config = BusConfig::default();
        assert_eq!(bench.engine.master_state(), MasterState::Transmitting);
        assert_eq!(bench.engine.state(), BusState::Transmitting);
        assert_eq!(bench.engine.deadline(), Some(bench.now + config.transmit_check));

        bench.writing.store(false, Ordering::Relaxed);
        bench.finish_write();
        assert_eq!(bench.engine.master_state(), MasterState::WaitingResponse);
        assert_eq!(bench.engine.deadline(), Some(bench.now + config.response_timeout));
    }

    #[test]
    fn empty_poll_answer_keeps_state() {
        let mut bench = Bench::with_devices(&[5], true);
        let poll = bench.next_frame();
        bench.finish_write();
        bench.reply(&answer(&poll, &[7]));
        bench.drain_events();

        let poll = bench.next_frame();
        assert_eq!(poll.kind(), Command::Poll);
        bench.finish_write();
        bench.reply(&answer(&poll, &[]));
        assert_eq!(bench.engine.registry().by_address(5).unwrap().state.as_slice(), &[7]);
        assert!(! bench.drain_events().iter().any(|event| matches!(event, BusEvent::DeviceUpdated(_))));
        // rotation goes on
        assert_eq!(bench.engine.state(), BusState::Polling);
        assert!(bench.engine.deadline().is_some());
    }

    #[test]
    fn scan_holds_queued_packets_until_done() {
        let mut bench = Bench::new(BusConfig::default());
        bench.engine.stop_polling();
        bench.engine.connect(bench.now);
        assert_eq!(bench.next_frame().kind(), Command::Reset);
        bench.enqueue(Packet::command(4, Command::BacklightPower).with_data(&[1]).unwrap());

        for address in 1 ..= LAST_SCAN_ADDRESS {
            let probe = bench.next_frame();
            assert_eq!((probe.kind(), probe.destination), (Command::Info, address));
            bench.finish_write();
        }
        bench.drain_events();
        // the last probe times out, the scan ends, then the queue drains
        let sent = bench.next_frame();
        assert_eq!(sent.kind(), Command::BacklightPower);
        let events = bench.drain_events();
        let end = events.iter().position(|event| *event == BusEvent::BusReset).unwrap();
        let transmit = events.iter().position(|event| *event == BusEvent::StateChanged(BusState::Transmitting)).unwrap();
        assert!(end < transmit);
        assert_eq!(bench.engine.statistics().timeouts, 0);
    }
}
