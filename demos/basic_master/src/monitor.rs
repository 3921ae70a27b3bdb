use futures_concurrency::future::Race;
use eosbus::master::*;
use log::*;

/// print the inputs of every device each time it is polled
#[tokio::main]
async fn main() -> Result<(), Error> {
    pretty_env_logger::init();

    let (transport, link) = SerialTransport::open("/dev/ttyUSB0", 250_000)?;
    let master = Master::new(transport, BusConfig::default());

    let task = async {
        let mut events = master.subscribe();
        master.connect();
        master.start_polling();
        loop {
            match events.recv().await {
                Ok(BusEvent::DeviceUpdated(device)) => {
                    let digital: String = (0 .. device.digital_inputs)
                        .map(|input| if device.digital_state(input) {'1'} else {'0'})
                        .collect();
                    let analog: Vec<u16> = (0 .. device.analog_inputs)
                        .map(|input| device.analog_state(input))
                        .collect();
                    println!("{:>3} {:8} {} {:?}", device.address, device.name, digital, analog);
                },
                Ok(BusEvent::BusReset) => info!("{} devices on the bus", master.devices().len()),
                Ok(BusEvent::ConnectionChanged(false)) => return Ok::<(), Error>(()),
                Ok(_) => {},
                Err(error) => warn!("{}", error),
            }
        }
    };
    (
        task,
        async {master.run().await; Ok(())},
        async {link.run(&master).await.map_err(Error::from)},
    ).race().await
}
