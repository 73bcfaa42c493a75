//! Serial transport abstractions for the acceptor controller board.
//!
//! The controller enumerates as a USB-CDC serial device. This module provides
//! the type-erased transport the read loop runs over, plus the async opener
//! applying the board's fixed line settings.
//!
//! # Types
//!
//! - [`SerialIo`]: trait alias combining `AsyncRead + AsyncWrite` for transports
//! - [`DynSerial`]: type-erased boxed transport
//!
//! Any type implementing the async I/O traits can stand in for the physical
//! port, which is how tests drive the pipeline over `tokio::io::DuplexStream`
//! instead of hardware.

use crate::config::SerialConfig;
use crate::error::{PulseError, PulseResult};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_serial::SerialPort;

/// Trait alias for async serial transport I/O.
///
/// Implemented by `tokio_serial::SerialStream` (real hardware) and
/// `tokio::io::DuplexStream` (tests), among others.
pub trait SerialIo: AsyncRead + AsyncWrite + Unpin + Send {}

// Blanket implementation for all types meeting the requirements
impl<T: AsyncRead + AsyncWrite + Unpin + Send> SerialIo for T {}

/// Type-erased boxed serial transport.
pub type DynSerial = Box<dyn SerialIo>;

/// Open the acceptor controller port asynchronously.
///
/// Opening is wrapped in `spawn_blocking` to avoid stalling the async runtime
/// during port initialization. The board's fixed line settings are applied:
/// 115200 baud (configurable), 8 data bits, no parity, 1 stop bit, no hardware
/// handshake, DTR and RTS asserted.
///
/// # Errors
///
/// Returns an error if the port cannot be opened or the control lines cannot
/// be asserted.
pub async fn open_acceptor_port(
    port_name: &str,
    config: &SerialConfig,
) -> PulseResult<tokio_serial::SerialStream> {
    use tokio_serial::SerialPortBuilderExt;

    let port_name = port_name.to_string();
    let baud_rate = config.baud_rate;
    let read_timeout = config.read_timeout;

    tokio::task::spawn_blocking(move || {
        let mut port = tokio_serial::new(&port_name, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .timeout(read_timeout)
            .open_native_async()?;

        // USB-CDC controllers gate their transmit path on the host control
        // lines; without these the board stays silent.
        port.write_data_terminal_ready(true)
            .map_err(tokio_serial::Error::from)?;
        port.write_request_to_send(true)
            .map_err(tokio_serial::Error::from)?;

        tracing::info!(port = %port_name, baud_rate, "opened acceptor controller port");
        Ok(port)
    })
    .await
    .map_err(|e| PulseError::Configuration(format!("serial open task failed: {e}")))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_duplex_stands_in_for_serial() {
        let (mut host, device) = tokio::io::duplex(64);
        let mut port: DynSerial = Box::new(device);

        host.write_all(b"pulse").await.unwrap();

        let mut buf = [0u8; 5];
        port.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pulse");
    }
}
