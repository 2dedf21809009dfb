//! Serial port plumbing.
//!
//! - [`SerialPortIO`]: anything byte-stream shaped that can stand in for the port
//! - [`DynSerial`]: type-erased port handed to the transport
//! - [`open_serial_async`]: open the instrument line (8N1, no flow control)
//! - [`drain_serial_buffer`]: discard stale bytes after opening
//! - [`list_ports`]: enumerate candidate ports
//!
//! Tests substitute `tokio::io::duplex` for the real device.

use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};

use crate::error::{Result, UlabError};

/// Trait alias for async serial port I/O.
///
/// Implemented for `tokio_serial::SerialStream`, `tokio::io::DuplexStream`
/// and any other `AsyncRead + AsyncWrite` mock.
pub trait SerialPortIO: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> SerialPortIO for T {}

/// Type-erased boxed serial port.
pub type DynSerial = Box<dyn SerialPortIO>;

/// Open `port_path` at `baud_rate`, 8 data bits, no parity, 1 stop bit.
///
/// Opening can block on some platforms, so it runs on the blocking pool.
pub async fn open_serial_async(port_path: &str, baud_rate: u32) -> Result<tokio_serial::SerialStream> {
    use tokio_serial::SerialPortBuilderExt;

    let path = port_path.to_string();
    tokio::task::spawn_blocking(move || {
        tokio_serial::new(&path, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|e| UlabError::Io(e.into()))
    })
    .await
    .map_err(|e| UlabError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?
}

/// Read and discard whatever is immediately available, for at most `timeout_ms`.
///
/// Returns the number of bytes discarded.
pub async fn drain_serial_buffer<R: AsyncRead + Unpin>(port: &mut R, timeout_ms: u64) -> usize {
    let mut discard = [0u8; 256];
    let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
    let mut total = 0usize;

    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }
        match tokio::time::timeout(remaining, port.read(&mut discard)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => total += n,
            Ok(Err(_)) | Err(_) => break,
        }
    }

    total
}

/// A serial port visible to the operating system.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortInfo {
    /// Path or name to pass to open.
    pub name: String,
    /// Short human description: USB product string, or the port kind.
    pub description: String,
}

/// Enumerate serial ports. Enumeration failures yield an empty list.
pub fn list_ports() -> Vec<PortInfo> {
    use serialport::SerialPortType;

    let ports = match serialport::available_ports() {
        Ok(ports) => ports,
        Err(e) => {
            tracing::warn!(error = %e, "could not enumerate serial ports");
            return Vec::new();
        }
    };

    ports
        .into_iter()
        .map(|p| {
            let description = match &p.port_type {
                SerialPortType::UsbPort(info) => match (&info.manufacturer, &info.product) {
                    (_, Some(product)) => format!("USB {:04x}:{:04x} {}", info.vid, info.pid, product),
                    (Some(vendor), None) => format!("USB {:04x}:{:04x} {}", info.vid, info.pid, vendor),
                    (None, None) => format!("USB {:04x}:{:04x}", info.vid, info.pid),
                },
                SerialPortType::PciPort => "PCI".to_string(),
                SerialPortType::BluetoothPort => "Bluetooth".to_string(),
                SerialPortType::Unknown => "unknown".to_string(),
            };
            PortInfo {
                name: p.port_name,
                description,
            }
        })
        .collect()
}
