//! SRS IP Configuration Protocol (SICP).
//!
//! Network-attached RGAs and RGA Ethernet adapters answer a UDP broadcast on
//! port 818 with a fixed 100-byte packet describing themselves. The same
//! packet, with its sequence number changed to SET or DHCP, reconfigures a
//! unit that is in configuration mode.
//!
//! Packet layout (multi-byte fields big-endian):
//!
//! | Offset | Size | Field                          |
//! |--------|------|--------------------------------|
//! | 0      | 4    | magic `SRS\0`                  |
//! | 4      | 2    | class id                       |
//! | 6      | 2    | device id                      |
//! | 8      | 2    | sequence number                |
//! | 10     | 4    | serial number                  |
//! | 14     | 6    | MAC address                    |
//! | 20     | 2    | device status bits             |
//! | 22     | 16   | device name, null-terminated   |
//! | 38     | 4    | IP address                     |
//! | 42     | 4    | subnet mask                    |
//! | 46     | 4    | gateway                        |
//! | 50     | 4    | DNS server                     |
//! | 54     | 6    | version, null-terminated       |
//! | 60     | 4    | password-reset control         |

use bytes::{Buf, BufMut};
use rga_core::config::DiscoveryConfig;
use rga_core::{RgaConfig, RgaError, RgaResult, RGA_TCP_PORT};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::{timeout, timeout_at, Instant};

pub const PACKET_SIZE: usize = 100;
pub const MAGIC: &[u8; 4] = b"SRS\0";
pub const SICP_PORT: u16 = RGA_TCP_PORT;

/// Call message answered by every RGA class.
pub const CALL_MSG_RGA_ALL: [u8; 10] = *b"SRS\x00\x00\x01\x00\xFF\x00\x01";
/// Call message answered by RGA Ethernet adapters only.
pub const CALL_MSG_RGA_REA: [u8; 10] = *b"SRS\x00\x00\x01\x00\x04\x00\x01";

const RECV_BUFFER_SIZE: usize = 128;

const NAME_OFFSET: usize = 22;
const NAME_LEN: usize = 16;
const IP_OFFSET: usize = 38;
const VERSION_OFFSET: usize = 54;
const VERSION_LEN: usize = 6;
const PASSWORD_RESET_OFFSET: usize = 60;

/// Device status bits.
pub mod status {
    /// TCP/IP port is occupied by a client
    pub const CONNECTED: u16 = 1 << 0;
    pub const CONFIG_ENABLED: u16 = 1 << 1;
    pub const DHCP_RUNNING: u16 = 1 << 2;
    pub const DHCP_SUCCESS: u16 = 1 << 3;
    pub const DHCP_FAILED: u16 = 1 << 4;
    pub const IP_CONFLICT: u16 = 1 << 5;
    pub const INVALID_LENGTH: u16 = 1 << 6;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceNumber {
    Call = 1,
    Reply = 2,
    Set = 3,
    Dhcp = 4,
}

/// One-word summary of a unit's state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShortStatus {
    Connected,
    Configurable,
    IpConflict,
    DhcpRunning,
    DhcpFailed,
    InvalidLength,
    Available,
}

impl fmt::Display for ShortStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ShortStatus::Connected => "Connected",
            ShortStatus::Configurable => "Configurable",
            ShortStatus::IpConflict => "IP_conflict",
            ShortStatus::DhcpRunning => "DHCP running",
            ShortStatus::DhcpFailed => "DHCP failed",
            ShortStatus::InvalidLength => "Error during SICP",
            ShortStatus::Available => "Available",
        };
        f.write_str(label)
    }
}

// =============================================================================
// Packet
// =============================================================================

/// A decoded SICP packet; keeps its raw bytes for resending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    data: [u8; PACKET_SIZE],
    class_id: i16,
    device_id: i16,
    sequence_number: i16,
    serial_number: i32,
    mac_address: [u8; 6],
    device_status: u16,
    device_name: String,
    ip_address: Ipv4Addr,
    subnet_mask: Ipv4Addr,
    gateway: Ipv4Addr,
    dns_server: Ipv4Addr,
    version: String,
}

impl Packet {
    /// Decode exactly 100 bytes starting with `SRS\0`.
    pub fn decode(bytes: &[u8]) -> RgaResult<Self> {
        let data: [u8; PACKET_SIZE] = bytes.try_into().map_err(|_| {
            RgaError::InvalidPacket(format!(
                "packet size is not {}, but {}",
                PACKET_SIZE,
                bytes.len()
            ))
        })?;
        if &data[..4] != MAGIC {
            return Err(RgaError::InvalidPacket(format!(
                "invalid header {:02x?}",
                &data[..4]
            )));
        }
        Ok(Self::parse(data))
    }

    /// Fields from a buffer whose header is already known to be valid.
    fn parse(data: [u8; PACKET_SIZE]) -> Self {
        let mut buf = &data[4..];
        let class_id = buf.get_i16();
        let device_id = buf.get_i16();
        let sequence_number = buf.get_i16();
        let serial_number = buf.get_i32();
        let mut mac_address = [0u8; 6];
        buf.copy_to_slice(&mut mac_address);
        let device_status = buf.get_u16();
        let device_name = null_terminated(&buf[..NAME_LEN]);
        buf.advance(NAME_LEN);
        let ip_address = Ipv4Addr::from(buf.get_u32());
        let subnet_mask = Ipv4Addr::from(buf.get_u32());
        let gateway = Ipv4Addr::from(buf.get_u32());
        let dns_server = Ipv4Addr::from(buf.get_u32());
        let version = null_terminated(&data[VERSION_OFFSET..VERSION_OFFSET + VERSION_LEN]);

        Self {
            data,
            class_id,
            device_id,
            sequence_number,
            serial_number,
            mac_address,
            device_status,
            device_name,
            ip_address,
            subnet_mask,
            gateway,
            dns_server,
            version,
        }
    }

    /// Header followed by zeros, for building configuration packets.
    pub fn blank() -> Self {
        let mut data = [0u8; PACKET_SIZE];
        data[..4].copy_from_slice(MAGIC);
        Self::parse(data)
    }

    /// Raw bytes, always 100 long.
    pub fn as_bytes(&self) -> &[u8; PACKET_SIZE] {
        &self.data
    }

    /// Mutators never touch the header, so re-parsing cannot fail.
    fn refresh(&mut self) {
        *self = Self::parse(self.data);
    }

    /// Store a device name of at most 15 bytes, null-terminated.
    pub fn set_name(&mut self, name: &str) {
        let bytes = name.as_bytes();
        let len = bytes.len().min(NAME_LEN - 1);
        let mut field = &mut self.data[NAME_OFFSET..NAME_OFFSET + NAME_LEN];
        field.put_slice(&bytes[..len]);
        field.put_bytes(0, NAME_LEN - len);
        self.refresh();
    }

    pub fn set_ip_address(&mut self, ip: &str) -> RgaResult<()> {
        let ip: Ipv4Addr = ip
            .parse()
            .map_err(|_| RgaError::InvalidParameter(format!("Invalid IP address string: {}", ip)))?;
        (&mut self.data[IP_OFFSET..IP_OFFSET + 4]).put_slice(&ip.octets());
        self.refresh();
        Ok(())
    }

    /// Request (or cancel) a password reset on the next SET.
    pub fn set_password_reset(&mut self, enable: bool) {
        if enable {
            self.data[PASSWORD_RESET_OFFSET..PASSWORD_RESET_OFFSET + 4]
                .copy_from_slice(&[0x01, 0x01, 0x01, 0xff]);
        } else {
            self.data[PASSWORD_RESET_OFFSET] = 0xff;
        }
    }

    /// Only SET and DHCP may be written into an outgoing packet.
    pub fn set_sequence_number(&mut self, number: SequenceNumber) -> RgaResult<()> {
        match number {
            SequenceNumber::Set | SequenceNumber::Dhcp => {
                (&mut self.data[8..10]).put_u16(number as u16);
                self.refresh();
                Ok(())
            }
            other => Err(RgaError::InvalidParameter(format!(
                "Invalid sequence number: {:?}",
                other
            ))),
        }
    }

    pub fn class_id(&self) -> i16 {
        self.class_id
    }

    pub fn device_id(&self) -> i16 {
        self.device_id
    }

    pub fn sequence_number(&self) -> i16 {
        self.sequence_number
    }

    pub fn serial_number(&self) -> i32 {
        self.serial_number
    }

    pub fn mac_address(&self) -> [u8; 6] {
        self.mac_address
    }

    pub fn device_status(&self) -> u16 {
        self.device_status
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub fn ip_address(&self) -> Ipv4Addr {
        self.ip_address
    }

    pub fn subnet_mask(&self) -> Ipv4Addr {
        self.subnet_mask
    }

    pub fn gateway(&self) -> Ipv4Addr {
        self.gateway
    }

    pub fn dns_server(&self) -> Ipv4Addr {
        self.dns_server
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// `aa-bb-cc-dd-ee-ff`
    pub fn mac_address_string(&self) -> String {
        self.mac_address
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect::<Vec<_>>()
            .join("-")
    }

    fn has(&self, bit: u16) -> bool {
        self.device_status & bit != 0
    }

    pub fn is_connected(&self) -> bool {
        self.has(status::CONNECTED)
    }

    pub fn is_configurable(&self) -> bool {
        self.has(status::CONFIG_ENABLED)
    }

    pub fn is_dhcp_running(&self) -> bool {
        self.has(status::DHCP_RUNNING)
    }

    pub fn is_dhcp_successful(&self) -> bool {
        self.has(status::DHCP_SUCCESS)
    }

    pub fn is_dhcp_failed(&self) -> bool {
        self.has(status::DHCP_FAILED)
    }

    pub fn is_ip_conflicted(&self) -> bool {
        self.has(status::IP_CONFLICT)
    }

    pub fn is_data_length_invalid(&self) -> bool {
        self.has(status::INVALID_LENGTH)
    }

    pub fn short_status(&self) -> ShortStatus {
        if self.is_connected() {
            ShortStatus::Connected
        } else if self.is_configurable() {
            ShortStatus::Configurable
        } else if self.is_ip_conflicted() {
            ShortStatus::IpConflict
        } else if self.is_dhcp_running() {
            ShortStatus::DhcpRunning
        } else if self.is_dhcp_failed() {
            ShortStatus::DhcpFailed
        } else if self.is_data_length_invalid() {
            ShortStatus::InvalidLength
        } else {
            ShortStatus::Available
        }
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Class ID     : {}", self.class_id)?;
        writeln!(f, "Device ID    : {}", self.device_id)?;
        writeln!(f, "SICP Seq. No.: {}", self.sequence_number)?;
        writeln!(f, "Serial No.   : {}", self.serial_number)?;
        writeln!(f, "MAC address  : {}", self.mac_address_string())?;
        writeln!(f, "Device name  : {}", self.device_name)?;
        writeln!(f, "IP address   : {}", self.ip_address)?;
        writeln!(f, "Subnet mask  : {}", self.subnet_mask)?;
        writeln!(f, "Gateway      : {}", self.gateway)?;
        writeln!(f, "DNS server   : {}", self.dns_server)?;
        writeln!(f, "Version      : {}", self.version)?;
        write!(
            f,
            "Status       : {} (0x{:04x})",
            self.short_status(),
            self.device_status
        )
    }
}

fn null_terminated(field: &[u8]) -> String {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}

// =============================================================================
// Protocol
// =============================================================================

/// Discovery client with its own UDP socket.
#[derive(Debug)]
pub struct Sicp {
    socket: UdpSocket,
    target: SocketAddr,
    /// Reply window for [`Sicp::discover`] and [`Sicp::send_configuration`].
    window: Duration,
    packets: Vec<Packet>,
}

impl Sicp {
    /// Broadcast to 255.255.255.255:818.
    pub async fn new() -> RgaResult<Self> {
        Self::with_target(SocketAddr::new(IpAddr::V4(Ipv4Addr::BROADCAST), SICP_PORT)).await
    }

    /// Broadcast with the reply window from `config.discovery`.
    pub async fn from_config(config: &RgaConfig) -> RgaResult<Self> {
        Ok(Self::new().await?.with_window(config.discovery.timeout()))
    }

    /// Send calls and configuration packets to `target` instead.
    pub async fn with_target(target: SocketAddr) -> RgaResult<Self> {
        let bind_addr = match target {
            SocketAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            SocketAddr::V6(_) => SocketAddr::new(IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED), 0),
        };
        let socket = UdpSocket::bind(bind_addr).await?;
        socket.set_broadcast(true)?;
        tracing::debug!("SICP socket bound to {:?}, target {}", socket.local_addr(), target);
        Ok(Self {
            socket,
            target,
            window: DiscoveryConfig::default().timeout(),
            packets: Vec::new(),
        })
    }

    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn local_addr(&self) -> RgaResult<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Packets collected by the last [`Sicp::find`].
    pub fn packets(&self) -> &[Packet] {
        &self.packets
    }

    /// [`Sicp::find`] over the configured reply window.
    pub async fn discover(&mut self) -> RgaResult<&[Packet]> {
        self.find(self.window).await
    }

    /// Broadcast the all-RGA call and collect replies for `window`.
    pub async fn find(&mut self, window: Duration) -> RgaResult<&[Packet]> {
        self.find_with(&CALL_MSG_RGA_ALL, window).await
    }

    /// Broadcast `call` and collect every decodable reply that arrives
    /// within `window`. Undecodable datagrams are dropped.
    pub async fn find_with(&mut self, call: &[u8], window: Duration) -> RgaResult<&[Packet]> {
        self.packets.clear();
        self.socket.send_to(call, self.target).await?;

        let deadline = Instant::now() + window;
        let mut buf = [0u8; RECV_BUFFER_SIZE];
        loop {
            match timeout_at(deadline, self.socket.recv_from(&mut buf)).await {
                Ok(Ok((len, from))) => match Packet::decode(&buf[..len]) {
                    Ok(packet) => {
                        tracing::debug!("SICP reply from {}: {}", from, packet.device_name());
                        self.packets.push(packet);
                    }
                    Err(e) => tracing::warn!("Dropping SICP datagram from {}: {}", from, e),
                },
                Ok(Err(e)) => {
                    tracing::debug!("SICP receive stopped: {}", e);
                    break;
                }
                Err(_) => break,
            }
        }

        tracing::info!("SICP found {} device(s)", self.packets.len());
        Ok(&self.packets)
    }

    /// [`Sicp::send_packet`] with the configured reply window.
    pub async fn send_configuration(&self, packet: &Packet) -> RgaResult<Packet> {
        self.send_packet(packet, self.window).await
    }

    /// Send a configuration packet and wait for the one reply.
    pub async fn send_packet(&self, packet: &Packet, within: Duration) -> RgaResult<Packet> {
        self.socket.send_to(packet.as_bytes(), self.target).await?;

        let mut buf = [0u8; RECV_BUFFER_SIZE];
        let (len, from) = timeout(within, self.socket.recv_from(&mut buf))
            .await
            .map_err(|_| {
                RgaError::Communication(format!("no SICP reply within {:?}", within))
            })??;
        tracing::debug!("SICP reply of {} bytes from {}", len, from);
        Packet::decode(&buf[..len])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_packet_decodes() {
        let packet = Packet::blank();
        assert!(!packet.is_connected());
        assert_eq!(packet.device_name(), "");
        assert_eq!(packet.ip_address(), Ipv4Addr::UNSPECIFIED);
        assert_eq!(packet.short_status(), ShortStatus::Available);
    }

    #[test]
    fn test_wrong_length_fails() {
        let mut data = vec![0u8; 99];
        data[..4].copy_from_slice(MAGIC);
        assert!(matches!(Packet::decode(&data), Err(RgaError::InvalidPacket(_))));
        data.resize(101, 0);
        assert!(Packet::decode(&data).is_err());
    }

    #[test]
    fn test_bad_header_fails() {
        let mut data = [0u8; PACKET_SIZE];
        data[..4].copy_from_slice(b"XXX\0");
        assert!(matches!(Packet::decode(&data), Err(RgaError::InvalidPacket(_))));
    }

    #[test]
    fn test_field_offsets() {
        let mut data = [0u8; PACKET_SIZE];
        data[..4].copy_from_slice(MAGIC);
        data[4..10].copy_from_slice(&[0x00, 0x01, 0x00, 0x04, 0x00, 0x02]);
        data[10..14].copy_from_slice(&19281i32.to_be_bytes());
        data[14..20].copy_from_slice(&[0x00, 0x19, 0xb3, 0x0a, 0x0b, 0xff]);
        data[20..22].copy_from_slice(&[0x00, 0x22]);
        data[22..28].copy_from_slice(b"REA01\0");
        data[38..42].copy_from_slice(&[192, 168, 1, 10]);
        data[42..46].copy_from_slice(&[255, 255, 255, 0]);
        data[46..50].copy_from_slice(&[192, 168, 1, 1]);
        data[50..54].copy_from_slice(&[8, 8, 8, 8]);
        data[54..60].copy_from_slice(b"1.02\0\0");

        let packet = Packet::decode(&data).unwrap();
        assert_eq!(packet.class_id(), 1);
        assert_eq!(packet.device_id(), 4);
        assert_eq!(packet.sequence_number(), SequenceNumber::Reply as i16);
        assert_eq!(packet.serial_number(), 19281);
        assert_eq!(packet.mac_address_string(), "00-19-b3-0a-0b-ff");
        assert_eq!(packet.device_name(), "REA01");
        assert_eq!(packet.ip_address().to_string(), "192.168.1.10");
        assert_eq!(packet.subnet_mask(), Ipv4Addr::new(255, 255, 255, 0));
        assert_eq!(packet.gateway(), Ipv4Addr::new(192, 168, 1, 1));
        assert_eq!(packet.dns_server(), Ipv4Addr::new(8, 8, 8, 8));
        assert_eq!(packet.version(), "1.02");
        assert!(packet.is_configurable());
        assert!(packet.is_ip_conflicted());
        assert_eq!(packet.short_status(), ShortStatus::Configurable);
    }

    #[test]
    fn test_short_status_priority() {
        let with_status = |bits: u16| {
            let mut data = *Packet::blank().as_bytes();
            data[20..22].copy_from_slice(&bits.to_be_bytes());
            Packet::decode(&data).unwrap().short_status()
        };
        assert_eq!(with_status(status::CONNECTED | status::CONFIG_ENABLED), ShortStatus::Connected);
        assert_eq!(with_status(status::DHCP_RUNNING | status::IP_CONFLICT), ShortStatus::IpConflict);
        assert_eq!(with_status(status::DHCP_FAILED | status::DHCP_RUNNING), ShortStatus::DhcpRunning);
        assert_eq!(with_status(status::INVALID_LENGTH | status::DHCP_FAILED), ShortStatus::DhcpFailed);
        assert_eq!(with_status(status::INVALID_LENGTH), ShortStatus::InvalidLength);
        assert_eq!(with_status(status::DHCP_SUCCESS), ShortStatus::Available);
        assert_eq!(ShortStatus::InvalidLength.to_string(), "Error during SICP");
    }

    #[test]
    fn test_mutators_keep_size_and_header() -> anyhow::Result<()> {
        let mut packet = Packet::blank();
        packet.set_name("a-very-long-device-name");
        packet.set_ip_address("10.0.0.42")?;
        packet.set_password_reset(true);
        packet.set_sequence_number(SequenceNumber::Set)?;

        let bytes = packet.as_bytes();
        assert_eq!(bytes.len(), PACKET_SIZE);
        assert_eq!(&bytes[..4], MAGIC);
        assert_eq!(packet.device_name(), "a-very-long-dev");
        assert_eq!(bytes[NAME_OFFSET + 15], 0);
        assert_eq!(packet.ip_address(), Ipv4Addr::new(10, 0, 0, 42));
        assert_eq!(&bytes[60..64], &[0x01, 0x01, 0x01, 0xff]);
        assert_eq!(&bytes[8..10], &[0x00, 0x03]);
        assert_eq!(packet.sequence_number(), 3);

        packet.set_password_reset(false);
        assert_eq!(packet.as_bytes()[60], 0xff);

        // A shorter name clears the old tail.
        packet.set_name("RGA");
        assert_eq!(packet.device_name(), "RGA");
        Ok(())
    }

    #[test]
    fn test_invalid_mutations_are_rejected() {
        let mut packet = Packet::blank();
        assert!(packet.set_ip_address("10.0.0").is_err());
        assert!(packet.set_sequence_number(SequenceNumber::Call).is_err());
        assert!(packet.set_sequence_number(SequenceNumber::Reply).is_err());
        assert_eq!(packet.sequence_number(), 0);
    }

    #[test]
    fn test_call_messages() {
        assert_eq!(&CALL_MSG_RGA_ALL[..4], MAGIC);
        assert_eq!(CALL_MSG_RGA_ALL[7], 0xff);
        assert_eq!(CALL_MSG_RGA_REA[7], 0x04);
    }

    #[test]
    fn test_display_summary() {
        let mut packet = Packet::blank();
        packet.set_name("RGA200");
        let text = packet.to_string();
        assert!(text.contains("Device name  : RGA200"));
        assert!(text.contains("IP address   : 0.0.0.0"));
        assert!(text.ends_with("Status       : Available (0x0000)"));
    }
}
