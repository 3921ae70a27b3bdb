/*!
    implement an asynchronous EOS bus master in `std` environment.

    The central resource is the [Master] struct which owns the bus: it discovers devices, polls them in
    turn, and interleaves the packets queued by the application between polls.

    - methods at [Master] level send raw packets, operate the bus and observe it
    - for commanding a specific device, use the [Node] struct which is a lightweight reference to [Master]
    - bytes reach the bus through a [Transport], [SerialTransport] being the usual one

    ```ignore
    let (transport, link) = SerialTransport::open("/dev/ttyUSB0", 250_000)?;
    let master = Master::new(transport, BusConfig::default());
    master.connect();
    tokio::join!(master.run(), link.run(&master));
    ```
*/

/// byte level frame assembly
mod codec;
/// timing parameters
mod config;
/// scheduling of the bus exchanges, this is the tricky part of the code
mod engine;
mod registry;
mod statistics;
/// byte sinks the master writes to
mod transport;
/// thread safe handle and timer coroutine around the engine
mod networking;
/// convenient methods to command devices
mod accessing;


pub use codec::{PacketCodec, FrameError};
pub use config::BusConfig;
pub use engine::{BusState, BusEvent, Awaiting, Ticket, LAST_SCAN_ADDRESS};
pub use registry::DeviceRegistry;
pub use statistics::BusStatistics;
pub use transport::{Transport, SerialTransport, SerialLink};
pub use networking::Master;
pub use accessing::*;


use thiserror::Error;

/// error regarding EOS bus communication
#[derive(Error, Debug)]
pub enum Error {
    #[error("problem with the bus transport")]
    Bus(#[from] std::io::Error),
    #[error("problem detected on master side: {0}")]
    Master(&'static str),
    #[error("device {0} did not answer in expected time")]
    ResponseTimeout(u8),
    #[error("no device known at address {0}")]
    UnknownDevice(u8),
    #[error("master was dropped")]
    Closed,
}
