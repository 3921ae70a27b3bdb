use std::time::Duration;
use futures_concurrency::future::Race;
use eosbus::master::*;

#[tokio::main]
async fn main() -> Result<(), Error> {
    pretty_env_logger::init();

    // possible baud rates
    // 115_200
    // 250_000
    // 500_000
    println!("creating master");
    let (transport, link) = SerialTransport::open("/dev/ttyUSB0", 250_000)?;
    let master = Master::new(transport, BusConfig::default());

    let task = async {
        let mut events = master.subscribe();
        master.connect();
        while events.recv().await.map_err(|_| Error::Closed)? != BusEvent::BusReset {}

        for device in master.devices() {
            println!("device {:>3}: {:8}  firmware {}  digital {}  analog {}  leds {}  servos {}  steppers {}  displays {}",
                device.address, device.name, device.firmware,
                device.digital_inputs, device.analog_inputs, device.led_outputs,
                device.servos, device.steppers, device.displays,
                );
        }

        // fade the backlight of every device, updates faster than the bus are merged
        for level in (0 ..= 255).chain((0 ..= 255).rev()) {
            for device in master.devices() {
                master.node(device.address).set_backlight_level(level);
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        for device in master.devices() {
            let node = master.node(device.address);
            if device.displays != 0
                {node.set_text(0, "EOS")?}
            for servo in 0 .. device.servos {
                println!("servo {} of {}: {:?}", servo, device.address, node.get_servo_config(servo).await?);
            }
        }
        println!("{:?}", master.statistics());
        Ok::<(), Error>(())
    };
    (
        task,
        async {master.run().await; Ok(())},
        async {link.run(&master).await.map_err(Error::from)},
    ).race().await
}
