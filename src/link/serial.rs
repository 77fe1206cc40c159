//! CR-framed stream link.
//!
//! Protocol framing for the ITC503 (and most Oxford Instruments controllers
//! of that generation):
//! - Terminator: CR only (`\r`) in both directions once `Q0` is in effect
//! - Serial: 9600 baud, 8 data bits, no parity, 2 stop bits, no flow control
//! - One reply line per command, except for `Q` which never answers
//!
//! The same framing is used over an Ethernet-GPIB bridge, so [`SerialLink`]
//! accepts any async byte stream rather than only a serial port.

use crate::error::{AppResult, DaqError};
use crate::link::InstrumentLink;
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tracing::{debug, instrument, trace};

/// Line terminator for both directions.
pub const TERMINATOR: u8 = b'\r';

/// Reply timeout used when none is configured.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);

/// Trait alias for async stream I/O.
///
/// Any type implementing `AsyncRead + AsyncWrite + Unpin + Send` can carry the link:
/// - `tokio_serial::SerialStream` (real hardware)
/// - `tokio::net::TcpStream` (GPIB-Ethernet bridge)
/// - `tokio::io::DuplexStream` (testing)
pub trait SerialPortIO: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> SerialPortIO for T {}

type DynSerial = Box<dyn SerialPortIO>;

/// Request/response link over a CR-terminated byte stream.
///
/// The stream sits behind a `tokio::sync::Mutex` so that a write and its reply
/// are never interleaved with another caller's exchange.
pub struct SerialLink {
    name: String,
    port: Mutex<BufReader<DynSerial>>,
    timeout: Duration,
}

impl std::fmt::Debug for SerialLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialLink")
            .field("name", &self.name)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl SerialLink {
    /// Wrap an already-open stream.
    pub fn new(name: impl Into<String>, port: impl SerialPortIO + 'static, timeout: Duration) -> Self {
        Self {
            name: name.into(),
            port: Mutex::new(BufReader::new(Box::new(port))),
            timeout,
        }
    }

    /// Open a serial port with the ITC503 line settings (8N2, no flow control).
    ///
    /// Opening happens on the blocking pool so the runtime is never stalled by the OS call.
    #[cfg(feature = "instrument_serial")]
    pub async fn open(port_path: &str, baud_rate: u32, timeout: Duration) -> AppResult<Self> {
        use tokio::task::spawn_blocking;
        use tokio_serial::SerialPortBuilderExt;

        let path = port_path.to_string();
        let stream = spawn_blocking(move || {
            tokio_serial::new(&path, baud_rate)
                .data_bits(tokio_serial::DataBits::Eight)
                .parity(tokio_serial::Parity::None)
                .stop_bits(tokio_serial::StopBits::Two)
                .flow_control(tokio_serial::FlowControl::None)
                .open_native_async()
        })
        .await
        .map_err(|e| {
            DaqError::communication(port_path, format!("serial open task failed: {e}"))
        })?
        .map_err(|e| DaqError::communication(port_path, format!("failed to open port: {e}")))?;

        tracing::info!(port = %port_path, baud_rate, "Opened serial link");
        Ok(Self::new(port_path, stream, timeout))
    }

    /// Connect to a GPIB-Ethernet bridge (or any TCP endpoint speaking the same framing).
    pub async fn connect_tcp(address: &str, timeout: Duration) -> AppResult<Self> {
        let stream = tokio::time::timeout(timeout, tokio::net::TcpStream::connect(address))
            .await
            .map_err(|_| {
                DaqError::communication(address, format!("connect timed out after {timeout:?}"))
            })?
            .map_err(|e| DaqError::communication(address, format!("connect failed: {e}")))?;
        stream.set_nodelay(true)?;

        tracing::info!(address = %address, "Connected TCP link");
        Ok(Self::new(address, stream, timeout))
    }

    /// Reply timeout applied to every exchange.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Throw away anything left over from an earlier exchange.
    ///
    /// Only data that is already available is discarded; this never waits.
    async fn drain_stale(&self, port: &mut BufReader<DynSerial>) -> usize {
        let mut discarded = 0usize;
        loop {
            let buffered = port.buffer().len();
            if buffered > 0 {
                port.consume(buffered);
                discarded += buffered;
            }
            match tokio::time::timeout(Duration::ZERO, port.fill_buf()).await {
                Ok(Ok(buf)) if !buf.is_empty() => continue,
                _ => break,
            }
        }
        if discarded > 0 {
            debug!(link = %self.name, discarded, "Discarded stale bytes before exchange");
        }
        discarded
    }

    async fn send_line(&self, port: &mut BufReader<DynSerial>, command: &str) -> AppResult<()> {
        let mut frame = Vec::with_capacity(command.len() + 1);
        frame.extend_from_slice(command.as_bytes());
        frame.push(TERMINATOR);

        let stream = port.get_mut();
        let write = async {
            stream.write_all(&frame).await?;
            stream.flush().await
        };
        match tokio::time::timeout(self.timeout, write).await {
            Ok(Ok(())) => {
                trace!(link = %self.name, command, "Sent command");
                Ok(())
            }
            Ok(Err(e)) => Err(DaqError::communication(
                &self.name,
                format!("write of '{command}' failed: {e}"),
            )),
            Err(_) => Err(DaqError::communication(
                &self.name,
                format!("write of '{command}' timed out after {:?}", self.timeout),
            )),
        }
    }

    async fn read_line(&self, port: &mut BufReader<DynSerial>, command: &str) -> AppResult<String> {
        let mut raw = Vec::new();
        match tokio::time::timeout(self.timeout, port.read_until(TERMINATOR, &mut raw)).await {
            Err(_) => Err(DaqError::communication(
                &self.name,
                format!(
                    "read timeout after {:?} waiting for reply to '{command}'",
                    self.timeout
                ),
            )),
            Ok(Err(e)) => Err(DaqError::communication(
                &self.name,
                format!("read error after '{command}': {e}"),
            )),
            Ok(Ok(0)) => Err(DaqError::communication(&self.name, "connection closed")),
            Ok(Ok(_)) if raw.last() != Some(&TERMINATOR) => Err(DaqError::communication(
                &self.name,
                "connection closed in the middle of a reply",
            )),
            Ok(Ok(_)) => {
                let reply = String::from_utf8_lossy(&raw).trim().to_string();
                trace!(link = %self.name, command, reply = %reply, "Received reply");
                Ok(reply)
            }
        }
    }
}

#[async_trait]
impl InstrumentLink for SerialLink {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip(self), fields(link = %self.name), err)]
    async fn query(&self, command: &str) -> AppResult<String> {
        let mut port = self.port.lock().await;
        self.drain_stale(&mut port).await;
        self.send_line(&mut port, command).await?;
        self.read_line(&mut port, command).await
    }

    #[instrument(skip(self), fields(link = %self.name), err)]
    async fn write(&self, command: &str) -> AppResult<()> {
        let mut port = self.port.lock().await;
        self.send_line(&mut port, command).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, DuplexStream};

    /// Read one CR-terminated command from the device side of a duplex pipe.
    async fn read_command(device: &mut DuplexStream) -> String {
        let mut line = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            let n = device.read(&mut byte).await.unwrap();
            if n == 0 || byte[0] == TERMINATOR {
                break;
            }
            line.push(byte[0]);
        }
        String::from_utf8(line).unwrap()
    }

    #[tokio::test]
    async fn test_query_frames_with_carriage_return() {
        let (host, mut device) = tokio::io::duplex(64);
        let link = SerialLink::new("duplex", host, Duration::from_millis(500));

        let responder = tokio::spawn(async move {
            let cmd = read_command(&mut device).await;
            assert_eq!(cmd, "V");
            device.write_all(b"ITC503\r").await.unwrap();
            device
        });

        let reply = link.query("V").await.unwrap();
        assert_eq!(reply, "ITC503");
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_write_sends_without_waiting() {
        let (host, mut device) = tokio::io::duplex(64);
        let link = SerialLink::new("duplex", host, Duration::from_millis(500));

        link.write("Q0").await.unwrap();

        let mut buf = [0u8; 3];
        device.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"Q0\r");
    }

    #[tokio::test]
    async fn test_query_timeout_is_communication_error() {
        let (host, _device) = tokio::io::duplex(64);
        let link = SerialLink::new("silent", host, Duration::from_millis(50));

        let err = link.query("R1").await.unwrap_err();
        assert!(matches!(err, DaqError::Communication { .. }), "{err:?}");
        assert!(err.to_string().contains("timeout"));
    }

    #[tokio::test]
    async fn test_closed_stream_is_communication_error() {
        let (host, device) = tokio::io::duplex(64);
        let link = SerialLink::new("closed", host, Duration::from_millis(200));
        drop(device);

        let err = link.query("R1").await.unwrap_err();
        assert!(matches!(err, DaqError::Communication { .. }), "{err:?}");
    }

    #[tokio::test]
    async fn test_stale_reply_is_discarded() {
        let (host, mut device) = tokio::io::duplex(64);
        let link = SerialLink::new("duplex", host, Duration::from_millis(500));

        // A late reply from an earlier exchange is already waiting in the pipe
        device.write_all(b"R+1.0\r").await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let responder = tokio::spawn(async move {
            let cmd = read_command(&mut device).await;
            assert_eq!(cmd, "R1");
            device.write_all(b"R+249.2\r").await.unwrap();
            device
        });

        let reply = link.query("R1").await.unwrap();
        assert_eq!(reply, "R+249.2");
        responder.await.unwrap();
    }
}
