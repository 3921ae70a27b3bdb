use std::{
    future::pending,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU32, Ordering},
        },
    };
use parking_lot::Mutex;
use tokio::{
    sync::{mpsc, broadcast, Notify, broadcast::error::RecvError},
    time::{Instant, sleep_until},
    };
use log::*;

use crate::{
    command::Command,
    packet::Packet,
    device::Device,
    };
use super::{
    Error,
    config::BusConfig,
    engine::{Engine, Outbound, BusEvent, BusState},
    statistics::BusStatistics,
    transport::Transport,
    accessing::{Coalescer, Slot},
    };


/// number of events a slow subscriber can miss before lagging
const EVENTS_CAPACITY: usize = 256;

/**
    EOS bus master

    This handle is cheap to clone, all clones drive the same bus. Every trigger (received bytes, end of
    write, timer expiry, operator request) is serialized on one lock around the engine, while sending a
    packet only pushes to a queue and never waits for the engine.

    [Self::run] **must** be running for timers to fire, without it nothing is ever transmitted.
*/
#[derive(Clone)]
pub struct Master {
    shared: Arc<Shared>,
}
struct Shared {
    engine: Mutex<Engine>,
    queue: mpsc::UnboundedSender<Outbound>,
    coalesced: Arc<Coalescer>,
    events: broadcast::Sender<BusEvent>,
    /// wakes the timer coroutine when the deadline may have changed
    wake: Notify,
    /// packets were queued since the engine last looked
    enqueued: AtomicBool,
    /// next ticket handed to a request
    tickets: AtomicU32,
}

impl Master {
    /// create a disconnected master writing to the given transport
    pub fn new(transport: impl Transport + Send + 'static, config: BusConfig) -> Self {
        let (queue, receive) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENTS_CAPACITY);
        let coalesced = Arc::new(Coalescer::default());
        let engine = Engine::new(Box::new(transport), config, receive, coalesced.clone(), events.clone());
        Self {shared: Arc::new(Shared {
            engine: Mutex::new(engine),
            queue,
            coalesced,
            events,
            wake: Notify::new(),
            enqueued: AtomicBool::new(false),
            tickets: AtomicU32::new(0),
        })}
    }

    /**
        coroutine firing the engine timers

        it **must** be running in order to transmit anything. It never returns, drop it to stop the master
    */
    pub async fn run(&self) {
        loop {
            let deadline = self.shared.engine.lock().deadline();
            let expiry = async {
                match deadline {
                    Some(deadline) => sleep_until(deadline).await,
                    None => pending().await,
                }
            };
            tokio::select! {
                _ = expiry => {},
                _ = self.shared.wake.notified() => {},
            }
            let now = Instant::now();
            let mut engine = self.shared.engine.lock();
            if self.shared.enqueued.swap(false, Ordering::AcqRel)
                {engine.on_enqueue(now)}
            engine.on_timer(now);
        }
    }

    /// bytes received by the transport
    pub fn deliver(&self, bytes: &[u8]) {
        self.shared.engine.lock().on_bytes(bytes, Instant::now());
        self.shared.wake.notify_one();
    }
    /// the transport finished writing the last transmitted frame
    pub fn write_complete(&self) {
        self.shared.engine.lock().on_write_complete(Instant::now());
        self.shared.wake.notify_one();
    }
    /// the transport lost received bytes
    pub fn report_overrun(&self) {
        self.shared.engine.lock().report_overrun();
    }

    /// queue a packet for transmission, it is sent as soon as the bus is free
    pub fn send_packet(&self, packet: Packet) {
        self.enqueue(Outbound::Packet(packet));
    }
    /// queue a packet with the given command and data
    pub fn send_command(&self, address: u8, command: Command, data: &[u8]) -> Result<(), Error> {
        let packet = Packet::command(address, command).with_data(data).map_err(Error::Master)?;
        self.send_packet(packet);
        Ok(())
    }
    /// queue the answer to a request received from the bus
    pub fn send_response(&self, request: &Packet, data: &[u8]) -> Result<(), Error> {
        let packet = Packet::response(request).with_data(data).map_err(Error::Master)?;
        self.send_packet(packet);
        Ok(())
    }
    pub(crate) fn send_coalesced(&self, slot: Slot, packet: Packet) {
        self.shared.coalesced.set(slot, packet, |slot| self.enqueue(Outbound::Coalesced(slot)));
    }
    fn enqueue(&self, outbound: Outbound) {
        // the receiver lives as long as the engine, which lives as long as self
        if self.shared.queue.send(outbound).is_err()
            {return}
        self.shared.enqueued.store(true, Ordering::Release);
        self.shared.wake.notify_one();
    }

    /**
        send a packet requiring a response and wait for it

        the packet is queued with a fresh [Ticket], only the exchange carrying it ends the wait, so polls
        and other requests to the same device cannot be taken for its answer.
        If the device does not answer in time, [Error::ResponseTimeout] is returned.
    */
    pub async fn request(&self, packet: Packet) -> Result<Packet, Error> {
        if ! packet.is_response_required()
            {return Err(Error::Master("packet does not require a response"))}
        let address = packet.destination;
        let ticket = self.shared.tickets.fetch_add(1, Ordering::Relaxed);
        let mut events = self.subscribe();
        self.enqueue(Outbound::Request(ticket, packet));
        loop {
            match events.recv().await {
                Ok(BusEvent::Response {ticket: Some(answered), packet, ..})
                    if answered == ticket
                    => return packet.ok_or(Error::ResponseTimeout(address)),
                Ok(_) => {},
                Err(RecvError::Lagged(missed)) => warn!("request to {} missed {} bus events", address, missed),
                Err(RecvError::Closed) => return Err(Error::Closed),
            }
        }
    }
    /// ask a device for its description
    pub async fn get_info(&self, address: u8) -> Result<Device, Error> {
        let response = self.request(Packet::command(address, Command::Info)).await?;
        Device::from_info(address, &response.data).map_err(Error::Master)
    }

    /// start operating the bus, resetting and scanning it on first connection
    pub fn connect(&self) {
        self.shared.engine.lock().connect(Instant::now());
        self.shared.wake.notify_one();
    }
    /// stop all bus activity, queued packets are kept for the next connection
    pub fn disconnect(&self) {
        self.shared.engine.lock().disconnect();
        self.shared.wake.notify_one();
    }
    pub fn start_polling(&self) {
        self.shared.engine.lock().start_polling(Instant::now());
        self.shared.wake.notify_one();
    }
    pub fn stop_polling(&self) {
        self.shared.engine.lock().stop_polling();
    }
    /// broadcast a reset to all devices and zero the statistics, after the current exchange
    pub fn reset(&self) {
        self.shared.engine.lock().reset(Instant::now());
        self.shared.wake.notify_one();
    }
    /// forget all devices and scan the bus again, after the current exchange
    pub fn rescan(&self) {
        self.shared.engine.lock().rescan(Instant::now());
        self.shared.wake.notify_one();
    }

    pub fn state(&self) -> BusState {
        self.shared.engine.lock().state()
    }
    pub fn is_connected(&self) -> bool {
        self.shared.engine.lock().is_connected()
    }
    pub fn is_polling(&self) -> bool {
        self.shared.engine.lock().is_polling()
    }
    pub fn statistics(&self) -> BusStatistics {
        self.shared.engine.lock().statistics()
    }
    /// snapshot of the known devices, in discovery order
    pub fn devices(&self) -> Vec<Device> {
        self.shared.engine.lock().registry().iter().cloned().collect()
    }
    /// snapshot of the device at the given address
    pub fn device(&self, address: u8) -> Option<Device> {
        self.shared.engine.lock().registry().by_address(address).cloned()
    }
    pub(crate) fn update_device(&self, address: u8, update: impl FnOnce(&mut Device)) {
        if let Some(device) = self.shared.engine.lock().registry_mut().by_address_mut(address)
            {update(device)}
    }
    /// receive all bus events from now on
    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.shared.events.subscribe()
    }
}
