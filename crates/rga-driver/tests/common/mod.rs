//! Simulated RGA head for integration tests.
//!
//! Speaks the instrument's wire protocol over a `tokio::io::duplex` pipe:
//! CR-terminated commands in, `\n\r`-terminated text or 4-byte little-endian
//! binary frames out.

#![allow(dead_code)]

use rga_core::transport::TransportSettings;
use rga_core::Transport;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::task::JoinHandle;

pub const DEFAULT_ID: &str = "SRSRGA200VER0.24SN19281";

/// Mnemonics whose set form answers with a status byte.
const STATUS_SETS: [&str; 5] = ["EE", "IE", "VF", "FL", "HV"];

#[derive(Debug, Clone)]
pub struct SimulatedRga {
    /// Current value of every queryable mnemonic, as the wire text.
    pub values: HashMap<String, String>,
    /// Status byte returned by status-returning sets.
    pub set_status: i32,
    /// Whether `ID?` is answered at all.
    pub answer_id: bool,
    /// Sample values for `SC1`/`HS1`; index order. Missing points read as
    /// their index.
    pub samples: Vec<i32>,
    /// Bytes sent after the last analog sample.
    pub analog_trailer: Vec<u8>,
    /// Total ion current sent after the last histogram sample.
    pub histogram_total: i32,
    /// Close the stream after this many scan samples.
    pub drop_after_samples: Option<usize>,
    /// Raw total-pressure reading for `TP?`.
    pub total_pressure: i32,
    /// Close the stream without replying when a command starts with this.
    pub hang_up_on: Option<&'static str>,
    /// Pause before every 4-byte word of a scan reply.
    pub sample_delay: Option<Duration>,
}

impl Default for SimulatedRga {
    fn default() -> Self {
        let values = [
            ("ID", DEFAULT_ID),
            ("MI", "1"),
            ("MF", "65"),
            ("NF", "4"),
            ("SA", "10"),
            ("EE", "70"),
            ("IE", "1"),
            ("VF", "90"),
            ("FL", "0.00"),
            ("HV", "0"),
            ("MV", "1400.0"),
            ("MG", "1000.000"),
            ("SP", "0.1000"),
            ("ST", "0.0500"),
            ("RS", "1.0000"),
            ("RI", "0.0000"),
            ("DS", "1.0000"),
            ("DI", "0.0000"),
            ("ER", "0"),
            ("EP", "0"),
            ("ED", "0"),
            ("EQ", "0"),
            ("EM", "0"),
            ("EF", "0"),
            ("EC", "0"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        Self {
            values,
            set_status: 0,
            answer_id: true,
            samples: Vec::new(),
            analog_trailer: 12345i32.to_le_bytes().to_vec(),
            histogram_total: 54321,
            drop_after_samples: None,
            total_pressure: 1000,
            hang_up_on: None,
            sample_delay: None,
        }
    }
}

/// A running simulator and the log of every command it received.
pub struct Simulation {
    log: Arc<Mutex<Vec<String>>>,
    task: JoinHandle<()>,
}

impl Simulation {
    /// Commands received so far.
    pub fn commands(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    /// Wait for the simulator to see the client hang up, then return the log.
    pub async fn finish(self) -> Vec<String> {
        self.task.await.unwrap();
        self.log.lock().unwrap().clone()
    }
}

pub fn fast_settings() -> TransportSettings {
    TransportSettings {
        timeout: Duration::from_millis(200),
        long_timeout: Duration::from_millis(500),
    }
}

impl SimulatedRga {
    pub fn with_value(mut self, mnemonic: &str, value: &str) -> Self {
        self.values.insert(mnemonic.to_string(), value.to_string());
        self
    }

    /// Start serving; returns the client transport and the running simulation.
    pub fn spawn(self) -> (Transport, Simulation) {
        let (host, device) = tokio::io::duplex(64 * 1024);
        let log = Arc::new(Mutex::new(Vec::new()));
        let task = tokio::spawn(self.serve(host, log.clone()));
        let transport = Transport::new(Box::new(device), "simulated").with_settings(fast_settings());
        (transport, Simulation { log, task })
    }

    fn value(&self, mnemonic: &str) -> String {
        self.values.get(mnemonic).cloned().unwrap_or_else(|| "0".into())
    }

    fn number(&self, mnemonic: &str) -> i64 {
        self.value(mnemonic).trim().parse::<f64>().unwrap_or(0.0) as i64
    }

    fn analog_points(&self) -> usize {
        ((self.number("MF") - self.number("MI")) * self.number("SA") + 1).max(0) as usize
    }

    fn histogram_points(&self) -> usize {
        (self.number("MF") - self.number("MI") + 1).max(0) as usize
    }

    fn sample_bytes(&self, points: usize) -> (Vec<u8>, bool) {
        let sent = self.drop_after_samples.map_or(points, |n| n.min(points));
        let mut bytes = Vec::with_capacity(sent * 4);
        for i in 0..sent {
            let value = self.samples.get(i).copied().unwrap_or(i as i32);
            bytes.extend_from_slice(&value.to_le_bytes());
        }
        (bytes, sent < points)
    }

    async fn serve(mut self, host: DuplexStream, log: Arc<Mutex<Vec<String>>>) {
        let mut host = BufReader::new(host);
        loop {
            let mut raw = Vec::new();
            match host.read_until(b'\r', &mut raw).await {
                Ok(0) | Err(_) => return,
                Ok(_) => {}
            }
            let cmd = String::from_utf8_lossy(&raw).trim().to_string();
            if cmd.is_empty() {
                continue;
            }
            log.lock().unwrap().push(cmd.clone());

            let (reply, hang_up) = self.respond(&cmd);
            let paced = match self.sample_delay {
                Some(delay) if cmd.starts_with("SC") || cmd.starts_with("HS") => Some(delay),
                _ => None,
            };
            let written = match paced {
                Some(delay) => write_paced(host.get_mut(), &reply, delay).await,
                None if reply.is_empty() => Ok(()),
                None => host.get_mut().write_all(&reply).await,
            };
            if written.is_err() {
                return;
            }
            if hang_up {
                return;
            }
        }
    }

    fn respond(&mut self, cmd: &str) -> (Vec<u8>, bool) {
        let text = |s: String| (format!("{}\n\r", s).into_bytes(), false);
        let mnemonic = cmd.get(..2).unwrap_or(cmd).to_string();
        let argument = cmd.get(2..).unwrap_or("");

        if self.hang_up_on.is_some_and(|prefix| cmd.starts_with(prefix)) {
            return (Vec::new(), true);
        }

        if argument == "?" {
            return match mnemonic.as_str() {
                "ID" if !self.answer_id => (Vec::new(), false),
                "TP" => (self.total_pressure.to_le_bytes().to_vec(), false),
                "AP" => text(self.analog_points().to_string()),
                "HP" => text(self.histogram_points().to_string()),
                _ => text(self.value(&mnemonic)),
            };
        }

        match mnemonic.as_str() {
            "SC" => {
                let (mut bytes, dropped) = self.sample_bytes(self.analog_points());
                if !dropped {
                    bytes.extend_from_slice(&self.analog_trailer);
                }
                (bytes, dropped)
            }
            "HS" => {
                let (mut bytes, dropped) = self.sample_bytes(self.histogram_points());
                if !dropped {
                    bytes.extend_from_slice(&self.histogram_total.to_le_bytes());
                }
                (bytes, dropped)
            }
            "MR" => {
                let mass: i32 = argument.parse().unwrap_or(0);
                ((mass * 100).to_le_bytes().to_vec(), false)
            }
            "IN" | "CA" | "CL" | "DG" => text("0".into()),
            "ML" => (Vec::new(), false),
            m if STATUS_SETS.contains(&m) => {
                self.values.insert(mnemonic.clone(), argument.to_string());
                text(self.set_status.to_string())
            }
            _ => {
                self.values.insert(mnemonic.clone(), argument.to_string());
                (Vec::new(), false)
            }
        }
    }
}

async fn write_paced(host: &mut DuplexStream, reply: &[u8], delay: Duration) -> std::io::Result<()> {
    for word in reply.chunks(4) {
        tokio::time::sleep(delay).await;
        host.write_all(word).await?;
    }
    Ok(())
}
