//! The bus transport: an RS-485 adapter behind a tty

use han_comms::{BusSerial, Error};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_serial::{SerialPortBuilderExt, SerialStream};

use crate::error::DaemonError;

/// A [BusSerial] over a serial device
///
/// The adapter is expected to handle transmit enable by itself, so this is
/// a plain byte stream.
pub struct TtyBus {
    port: SerialStream,
    // One byte read early, to find out that the port was readable
    peeked: Option<u8>,
}

impl TtyBus {
    /// Open `tty` at `baud`, 8N1
    pub fn open(tty: &str, baud: u32) -> Result<Self, DaemonError> {
        let port = tokio_serial::new(tty, baud)
            .data_bits(tokio_serial::DataBits::Eight)
            .stop_bits(tokio_serial::StopBits::One)
            .parity(tokio_serial::Parity::None)
            .open_native_async()
            .map_err(|source| DaemonError::Transport {
                tty: tty.to_owned(),
                source,
            })?;
        log::info!("Opened bus transport {} at {} baud", tty, baud);
        Ok(Self { port, peeked: None })
    }
}

impl BusSerial for TtyBus {
    type SerError = std::io::Error;

    async fn write_all(&mut self, data: &[u8]) -> Result<(), Error<Self::SerError>> {
        self.port.write_all(data).await?;
        self.port.flush().await?;
        Ok(())
    }

    async fn read_byte(&mut self) -> Result<u8, Error<Self::SerError>> {
        if let Some(b) = self.peeked.take() {
            return Ok(b);
        }
        let mut byte = [0u8; 1];
        match self.port.read(&mut byte).await? {
            0 => Err(Error::Serial(std::io::ErrorKind::UnexpectedEof.into())),
            _ => Ok(byte[0]),
        }
    }

    async fn readable(&mut self) -> Result<(), Error<Self::SerError>> {
        if self.peeked.is_none() {
            let b = self.read_byte().await?;
            self.peeked = Some(b);
        }
        Ok(())
    }
}
