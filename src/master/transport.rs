use std::{
    io,
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
        },
    };
use serial2_tokio::{SerialPort, CharSize, StopBits, Parity};
use tokio::sync::mpsc;
use log::*;

use crate::packet::Frame;
use super::Master;


/**
    byte sink the master writes its frames to

    the end of a write is reported either through [Master::write_complete], or by [Self::is_writing]
    going back to false which the master checks periodically. Implementations must not call back into
    the master from [Self::transmit].
*/
pub trait Transport {
    /// start writing a frame on the bus
    fn transmit(&mut self, frame: &[u8]) -> io::Result<()>;
    /// true while a previously transmitted frame is still being written
    fn is_writing(&self) -> bool {false}
}


/**
    transport over a serial port

    frames given to the master are handed over to a [SerialLink], which must be running for anything
    to actually happen on the port
*/
pub struct SerialTransport {
    frames: mpsc::UnboundedSender<Frame>,
    pending: Arc<AtomicUsize>,
}
/// IO side of a [SerialTransport], owning the serial port
pub struct SerialLink {
    port: SerialPort,
    frames: mpsc::UnboundedReceiver<Frame>,
    pending: Arc<AtomicUsize>,
}

impl SerialTransport {
    /// open the serial port file with the given baud rate, 8 data bits, no parity, one stop bit
    pub fn open(path: impl AsRef<Path>, rate: u32) -> io::Result<(Self, SerialLink)> {
        let port = SerialPort::open(path, |mut settings: serial2_tokio::Settings| {
                settings.set_raw();
                settings.set_baud_rate(rate)?;
                settings.set_char_size(CharSize::Bits8);
                settings.set_stop_bits(StopBits::One);
                settings.set_parity(Parity::None);
                Ok(settings)
                })?;
        // line drivers of most RS-485 adapters are powered by these
        port.set_rts(true)?;
        port.set_dtr(true)?;

        let (send, receive) = mpsc::unbounded_channel();
        let pending = Arc::new(AtomicUsize::new(0));
        Ok((
            Self {frames: send, pending: pending.clone()},
            SerialLink {port, frames: receive, pending},
            ))
    }
}

impl Transport for SerialTransport {
    fn transmit(&mut self, frame: &[u8]) -> io::Result<()> {
        let frame = Frame::from_slice(frame)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "frame exceeds maximum size"))?;
        self.pending.fetch_add(1, Ordering::AcqRel);
        self.frames.send(frame).map_err(|_| {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            io::Error::new(io::ErrorKind::BrokenPipe, "serial link is not running")
        })
    }
    fn is_writing(&self) -> bool {
        self.pending.load(Ordering::Acquire) != 0
    }
}

impl SerialLink {
    /**
        coroutine moving bytes between the serial port and the master

        it **must** be running for the master to send or receive anything. It returns only on port failure
    */
    pub async fn run(self, master: &Master) -> io::Result<()> {
        let Self {port, frames, pending} = self;
        tokio::try_join!(
            receive(&port, master),
            send(&port, frames, &pending, master),
            )?;
        Ok(())
    }
}

async fn receive(port: &SerialPort, master: &Master) -> io::Result<()> {
    let mut buffer = [0u8; 256];
    loop {
        let received = port.read(&mut buffer).await?;
        if received == 0
            {return Err(io::ErrorKind::UnexpectedEof.into())}
        master.deliver(&buffer[.. received]);
    }
}

async fn send(port: &SerialPort, mut frames: mpsc::UnboundedReceiver<Frame>, pending: &AtomicUsize, master: &Master) -> io::Result<()> {
    while let Some(frame) = frames.recv().await {
        let written = port.write_all(&frame).await;
        pending.fetch_sub(1, Ordering::AcqRel);
        if let Err(error) = written {
            warn!("serial write failed: {}", error);
            return Err(error);
        }
        master.write_complete();
    }
    Ok(())
}
