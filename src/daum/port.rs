//! Serial port discovery, opening and response framing.
//!
//! The cockpit speaks RS232 behind a USB adapter. Responses carry no
//! delimiter at all; the only framing signal is silence between them, so
//! the reader groups bytes into windows whenever the line stays quiet for
//! the configured gap.

use std::time::Duration;

use serialport::SerialPortType;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_serial::{DataBits, Parity, SerialPortBuilderExt, SerialStream, StopBits};
use tracing::{debug, info, warn};

use crate::config::SerialConfig;

/// Hard cap on a single window; a healthy response is well under 40 bytes.
const MAX_WINDOW: usize = 256;

/// Find the port the ergometer is attached to. A configured path wins;
/// otherwise the first USB serial adapter is assumed to be the RS232
/// converter, since the cockpit itself carries no identifying ids.
pub fn discover(config: &SerialConfig) -> Option<String> {
    if let Some(path) = &config.port {
        return Some(path.clone());
    }

    let ports = match serialport::available_ports() {
        Ok(ports) => ports,
        Err(e) => {
            warn!("could not enumerate serial ports: {}", e);
            return None;
        }
    };

    for port in ports {
        if let SerialPortType::UsbPort(usb) = &port.port_type {
            info!(
                "ergometer adapter candidate on {} (vid {:04x}, pid {:04x})",
                port.port_name, usb.vid, usb.pid
            );
            return Some(port.port_name);
        }
    }
    None
}

/// Open the port with the configured line settings.
pub fn open(path: &str, config: &SerialConfig) -> tokio_serial::Result<SerialStream> {
    tokio_serial::new(path, config.baud_rate)
        .data_bits(data_bits(config.data_bits))
        .parity(parity(&config.parity))
        .stop_bits(stop_bits(config.stop_bits))
        .open_native_async()
}

fn data_bits(bits: u8) -> DataBits {
    match bits {
        5 => DataBits::Five,
        6 => DataBits::Six,
        7 => DataBits::Seven,
        _ => DataBits::Eight,
    }
}

fn parity(name: &str) -> Parity {
    match name.to_lowercase().as_str() {
        "even" => Parity::Even,
        "odd" => Parity::Odd,
        _ => Parity::None,
    }
}

fn stop_bits(bits: u8) -> StopBits {
    match bits {
        2 => StopBits::Two,
        _ => StopBits::One,
    }
}

/// Group the raw byte stream into response windows separated by at least
/// `gap` of silence, and push them into `windows`. Runs until the reader
/// ends, errors, or the receiver side goes away.
pub async fn read_windows<R>(mut reader: R, gap: Duration, windows: mpsc::Sender<Vec<u8>>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; 64];
    let mut window: Vec<u8> = Vec::new();

    loop {
        match timeout(gap, reader.read(&mut buf)).await {
            Ok(Ok(0)) => {
                if !window.is_empty() {
                    let _ = windows.send(std::mem::take(&mut window)).await;
                }
                debug!("serial stream ended");
                return;
            }
            Ok(Ok(n)) => {
                window.extend_from_slice(&buf[..n]);
                if window.len() >= MAX_WINDOW {
                    // noise storm; flush what we have rather than grow forever
                    warn!("window exceeded {} bytes, flushing", MAX_WINDOW);
                    if windows.send(std::mem::take(&mut window)).await.is_err() {
                        return;
                    }
                }
            }
            Ok(Err(e)) => {
                warn!("serial read error: {}", e);
                return;
            }
            Err(_) => {
                // the line went quiet, whatever accumulated is one window
                if !window.is_empty()
                    && windows.send(std::mem::take(&mut window)).await.is_err()
                {
                    return;
                }
            }
        }
    }
}
