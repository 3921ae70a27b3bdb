/*!
    EOS bus protocol: a half-duplex single master / multi slave protocol used to poll and command
    small peripheral controllers (leds, servos, steppers, displays, digital and analog inputs) on an RS-485 line.

    - the wire types ([packet], [command], [device]) are usable without `std`, so device firmwares can share them
    - the software bus master lives in [master], behind the `master` feature
*/
#![cfg_attr(not(any(test, feature = "std")), no_std)]

mod utils;

pub mod command;
pub mod packet;
pub mod device;
#[cfg(feature = "master")]
pub mod master;

pub use command::{Command, CommandByte};
pub use packet::Packet;
pub use device::{Device, InfoRecord};
