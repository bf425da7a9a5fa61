//! Transport session for the RGA remote-command protocol.
//!
//! The instrument speaks CR-terminated ASCII commands over RS-232 (28800 baud,
//! 8N1, RTS/CTS) or over TCP through the Ethernet adapter. Most replies are
//! ASCII text, but the total-pressure query and every scan sample come back as
//! raw 4-byte little-endian signed integers, so the session exposes both text
//! and binary primitives.
//!
//! # Exclusive access
//!
//! [`Transport`] owns the byte stream behind a `tokio::sync::Mutex`. Single
//! round trips (`query_text`, `send`) take the lock for just that exchange.
//! Multi-step exchanges (a scan streaming hundreds of binary samples, the
//! binary total-pressure read) call [`Transport::lock`] and hold the returned
//! [`TransportGuard`] for the whole sequence, so no other command can interleave
//! and break byte alignment. The guard releases the stream when dropped, on
//! every exit path.
//!
//! # Example
//!
//! ```rust,ignore
//! let transport = Transport::open_serial("/dev/ttyUSB0", RGA_BAUD_RATE).await?;
//! let id = transport.query_text("ID?").await?;
//!
//! let mut guard = transport.lock().await;
//! guard.send("TP?").await?;
//! let current = guard.read_long().await?;
//! ```

use crate::config::{ConnectionConfig, RgaConfig, TimeoutConfig};
use crate::error::{RgaError, RgaResult};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, MutexGuard};
use tokio::task::spawn_blocking;
use tokio::time::timeout;

/// Command and reply terminator.
pub const TERMINATOR: u8 = b'\r';

/// Quiet interval that ends an unframed binary read.
const FRAME_GAP: Duration = Duration::from_millis(50);

// =============================================================================
// Stream Trait
// =============================================================================

/// Trait alias for the instrument byte stream.
///
/// Any type implementing `AsyncRead + AsyncWrite + Unpin + Send` can carry the
/// protocol:
/// - `tokio_serial::SerialStream` (RS-232)
/// - `tokio::net::TcpStream` (Ethernet adapter)
/// - `tokio::io::DuplexStream` (testing)
pub trait TransportIO: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> TransportIO for T {}

/// Type-erased boxed instrument stream.
pub type DynTransport = Box<dyn TransportIO>;

/// Short and long reply timeouts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportSettings {
    /// Timeout for ordinary queries
    pub timeout: Duration,
    /// Timeout for status-returning sets and binary reads
    pub long_timeout: Duration,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self::from(&TimeoutConfig::default())
    }
}

impl From<&TimeoutConfig> for TransportSettings {
    fn from(config: &TimeoutConfig) -> Self {
        Self {
            timeout: config.command(),
            long_timeout: config.long_command(),
        }
    }
}

// =============================================================================
// Transport
// =============================================================================

/// Exclusive-access session over one instrument byte stream.
pub struct Transport {
    stream: Mutex<BufReader<DynTransport>>,
    settings: TransportSettings,
    description: String,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("description", &self.description)
            .field("settings", &self.settings)
            .finish()
    }
}

impl Transport {
    /// Wrap an already-open stream.
    pub fn new(stream: DynTransport, description: impl Into<String>) -> Self {
        Self {
            stream: Mutex::new(BufReader::new(stream)),
            settings: TransportSettings::default(),
            description: description.into(),
        }
    }

    pub fn with_settings(mut self, settings: TransportSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn settings(&self) -> &TransportSettings {
        &self.settings
    }

    /// Human-readable endpoint, e.g. "/dev/ttyUSB0" or "192.168.1.10:818".
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Open the transport described by a session configuration.
    pub async fn open(config: &RgaConfig) -> RgaResult<Self> {
        let transport = match &config.connection {
            ConnectionConfig::Serial { port, baud_rate } => {
                Self::open_serial(port, *baud_rate).await?
            }
            ConnectionConfig::Tcp {
                host,
                port,
                user_id,
                password,
            } => Self::connect_tcp(host, *port, user_id, password).await?,
        };
        Ok(transport.with_settings(TransportSettings::from(&config.timeouts)))
    }

    /// Open the RS-232 port with spawn_blocking.
    ///
    /// 8N1 with RTS/CTS. Hardware flow control is re-applied after the port
    /// is open because some USB adapters silently drop it during open.
    pub async fn open_serial(port_path: &str, baud_rate: u32) -> RgaResult<Self> {
        use tokio_serial::{SerialPort, SerialPortBuilderExt};

        let port_path_owned = port_path.to_string();
        let port = spawn_blocking(move || {
            let mut port = tokio_serial::new(&port_path_owned, baud_rate)
                .data_bits(tokio_serial::DataBits::Eight)
                .parity(tokio_serial::Parity::None)
                .stop_bits(tokio_serial::StopBits::One)
                .flow_control(tokio_serial::FlowControl::Hardware)
                .open_native_async()
                .map_err(|e| {
                    RgaError::Communication(format!(
                        "Failed to open RGA serial port {}: {}",
                        port_path_owned, e
                    ))
                })?;
            port.set_flow_control(tokio_serial::FlowControl::Hardware)
                .map_err(|e| {
                    RgaError::Communication(format!(
                        "Failed to enable RTS/CTS on {}: {}",
                        port_path_owned, e
                    ))
                })?;
            Ok::<_, RgaError>(port)
        })
        .await
        .map_err(|e| {
            RgaError::Communication(format!("spawn_blocking for port opening failed: {}", e))
        })??;

        tracing::info!("Opened RGA serial port {} at {} baud", port_path, baud_rate);
        Ok(Self::new(Box::new(port), port_path))
    }

    /// Connect to the Ethernet adapter and log in.
    pub async fn connect_tcp(
        host: &str,
        port: u16,
        user_id: &str,
        password: &str,
    ) -> RgaResult<Self> {
        let address = format!("{}:{}", host, port);
        let stream = timeout(Duration::from_secs(5), TcpStream::connect(&address))
            .await
            .map_err(|_| RgaError::Communication(format!("Connection timeout to {}", address)))?
            .map_err(|e| {
                RgaError::Communication(format!("Failed to connect to {}: {}", address, e))
            })?;
        stream.set_nodelay(true)?;

        let transport = Self::new(Box::new(stream), address.clone());
        transport.login(user_id, password).await?;
        tracing::info!("Connected to RGA Ethernet adapter at {}", address);
        Ok(transport)
    }

    /// Send the credential pair and check the adapter's one-line verdict.
    async fn login(&self, user_id: &str, password: &str) -> RgaResult<()> {
        let mut guard = self.lock().await;
        guard.send(user_id).await?;
        guard.send_raw(password).await?;
        let timeout = guard.settings.timeout;
        let verdict = guard.read_text("login", timeout).await?;
        if verdict.to_lowercase().contains("fail") {
            return Err(RgaError::Communication(format!(
                "Login rejected by {}: {}",
                self.description, verdict
            )));
        }
        tracing::debug!("Login reply: {:?}", verdict);
        Ok(())
    }

    /// Acquire the exclusive scope for a multi-step exchange.
    pub async fn lock(&self) -> TransportGuard<'_> {
        TransportGuard {
            stream: self.stream.lock().await,
            settings: &self.settings,
        }
    }

    /// Send a command that produces no reply.
    pub async fn send(&self, command: &str) -> RgaResult<()> {
        self.lock().await.send(command).await
    }

    /// Send a command and read its text reply with the short timeout.
    pub async fn query_text(&self, command: &str) -> RgaResult<String> {
        let mut guard = self.lock().await;
        let timeout = guard.settings.timeout;
        guard.query_text(command, timeout).await
    }

    /// Send a command and read its text reply with the long timeout, or with
    /// `timeout_override` when given (degas, calibration).
    pub async fn query_text_with_long_timeout(
        &self,
        command: &str,
        timeout_override: Option<Duration>,
    ) -> RgaResult<String> {
        let mut guard = self.lock().await;
        let timeout = timeout_override.unwrap_or(guard.settings.long_timeout);
        guard.query_text(command, timeout).await
    }

    /// Discard stale input until the stream stays quiet for `quiet`.
    ///
    /// Returns the number of bytes discarded.
    pub async fn drain(&self, quiet: Duration) -> usize {
        let mut guard = self.lock().await;
        let mut discard = [0u8; 256];
        let mut total_discarded = 0usize;

        loop {
            match timeout(quiet, guard.stream.read(&mut discard)).await {
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => total_discarded += n,
                Ok(Err(e)) => {
                    tracing::debug!("Drain stopped on I/O error: {}", e);
                    break;
                }
                Err(_) => break,
            }
        }

        if total_discarded > 0 {
            tracing::debug!("Discarded {} stale bytes from {}", total_discarded, self.description);
        }
        total_discarded
    }
}

/// List serial ports that could host an RGA.
pub fn available_serial_ports() -> RgaResult<Vec<String>> {
    let ports = serialport::available_ports()
        .map_err(|e| RgaError::Communication(format!("Failed to enumerate serial ports: {}", e)))?;
    Ok(ports.into_iter().map(|p| p.port_name).collect())
}

/// Decode a 4-byte little-endian signed frame.
pub fn decode_long(frame: &[u8]) -> Option<i32> {
    let bytes: [u8; 4] = frame.try_into().ok()?;
    Some(i32::from_le_bytes(bytes))
}

// =============================================================================
// TransportGuard
// =============================================================================

/// Exclusive scope over the stream; released on drop.
pub struct TransportGuard<'a> {
    stream: MutexGuard<'a, BufReader<DynTransport>>,
    settings: &'a TransportSettings,
}

impl TransportGuard<'_> {
    /// Discard unread input, then write `command` followed by CR.
    pub async fn send(&mut self, command: &str) -> RgaResult<()> {
        let stale = self.stream.buffer().len();
        if stale > 0 {
            tracing::debug!("Discarding {} unread bytes before {:?}", stale, command);
            self.stream.consume(stale);
        }
        self.send_raw(command).await
    }

    async fn send_raw(&mut self, command: &str) -> RgaResult<()> {
        tracing::debug!("RGA write: {:?}", command);
        let stream = self.stream.get_mut();
        stream.write_all(command.as_bytes()).await?;
        stream.write_all(&[TERMINATOR]).await?;
        stream.flush().await?;
        Ok(())
    }

    /// Read one CR-terminated text reply, trimmed.
    pub async fn read_text(&mut self, command: &str, within: Duration) -> RgaResult<String> {
        let mut reply = Vec::new();
        match timeout(within, self.stream.read_until(TERMINATOR, &mut reply)).await {
            Ok(Ok(0)) => Err(RgaError::Disconnected),
            Ok(Ok(_)) => {
                let text = String::from_utf8_lossy(&reply).trim().to_string();
                tracing::debug!("RGA reply to {:?}: {:?}", command, text);
                Ok(text)
            }
            Ok(Err(e)) => Err(RgaError::Io(e)),
            Err(_) => Err(RgaError::timeout(command)),
        }
    }

    /// Send a command and read its text reply.
    pub async fn query_text(&mut self, command: &str, within: Duration) -> RgaResult<String> {
        self.send(command).await?;
        self.read_text(command, within).await
    }

    /// Read exactly `len` raw bytes within the long timeout.
    pub async fn read_binary(&mut self, len: usize) -> RgaResult<Vec<u8>> {
        let mut buf = vec![0u8; len];
        match timeout(self.settings.long_timeout, self.stream.read_exact(&mut buf)).await {
            Ok(Ok(_)) => Ok(buf),
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                Err(RgaError::Disconnected)
            }
            Ok(Err(e)) => Err(RgaError::Io(e)),
            Err(_) => Err(RgaError::Communication(format!(
                "timed out waiting for {} binary bytes",
                len
            ))),
        }
    }

    /// Read one 4-byte little-endian signed integer.
    pub async fn read_long(&mut self) -> RgaResult<i32> {
        let frame = self.read_binary(4).await?;
        decode_long(&frame).ok_or_else(|| {
            RgaError::Communication(format!("malformed binary frame of {} bytes", frame.len()))
        })
    }

    /// Read whatever the instrument sends next as one frame.
    ///
    /// Waits up to the long timeout for the first byte, then keeps reading
    /// until the stream has been quiet for a short gap. Used where the frame
    /// length itself carries information.
    pub async fn recv_frame(&mut self) -> RgaResult<Vec<u8>> {
        let mut frame = Vec::new();

        match timeout(self.settings.long_timeout, self.stream.fill_buf()).await {
            Ok(Ok(chunk)) if chunk.is_empty() => return Err(RgaError::Disconnected),
            Ok(Ok(chunk)) => frame.extend_from_slice(chunk),
            Ok(Err(e)) => return Err(RgaError::Io(e)),
            Err(_) => return Err(RgaError::timeout("trailing frame")),
        }
        self.stream.consume(frame.len());

        loop {
            let n = match timeout(FRAME_GAP, self.stream.fill_buf()).await {
                Ok(Ok(chunk)) if !chunk.is_empty() => {
                    frame.extend_from_slice(chunk);
                    chunk.len()
                }
                _ => break,
            };
            self.stream.consume(n);
        }

        Ok(frame)
    }
}
