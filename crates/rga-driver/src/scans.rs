//! Scan acquisition engine.
//!
//! # Scan kinds
//!
//! - **Analog** (`SC1`): every sub-AMU step between the initial and final
//!   mass, `resolution` points per AMU.
//! - **Histogram** (`HS1`): one point per integer AMU.
//! - **Single mass** (`MR<mass>`) and **multi mass** (one `MR` per mass).
//!
//! Analog and histogram scans hold the transport lock for the whole sample
//! loop and read every point as a 4-byte little-endian signed integer, in
//! index order. A trailing frame carries the total ion current.
//!
//! # Buffer-overrun defect
//!
//! Some units occasionally deliver more than 4 bytes after the last analog
//! sample. When that happens the total current is discarded (reported as 0)
//! and the instrument is reinitialised with `IN0`. The check is applied to
//! analog scans only.
//!
//! # Outcome
//!
//! [`Scans::state`] reports `Running` only while a scan future is alive. A
//! scan whose future is dropped before it completes (a `tokio::time::timeout`
//! elapsing, a losing `select!` branch, an aborted task) ends in `Aborted`,
//! and the next scan may start.
//!
//! # Progress
//!
//! Subscribers receive [`ScanEvent`]s over a `tokio::sync::broadcast`
//! channel: `Started`, throttled `Progress` (at most one per progress
//! period, plus one final event with `points_done == total_points`) and
//! `Finished`. A slow subscriber only loses events; it never delays the read
//! loop.

use crate::commands::{Command, ComponentCore};
use crate::components::defaults;
use parking_lot::Mutex;
use rga_core::transport::{decode_long, TransportGuard};
use rga_core::{RgaError, RgaResult, Transport};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tokio::time::Instant;
use tracing::instrument;

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Half-width of the peak search window in AMU.
const PEAK_WINDOW: f64 = 0.5;

/// Minimum number of points inside the window for a peak to count.
const PEAK_MIN_POINTS: usize = 5;

pub static SCAN_SPEED: Command<i64> = Command::new("NF", "", 0.0, 7.0, 1.0, 0, 4.0).plain();
pub static RESOLUTION: Command<i64> =
    Command::new("SA", "points/AMU", 10.0, 25.0, 1.0, 0, 10.0).plain();
pub static TOTAL_POINTS_ANALOG: Command<i64> = Command::query_only("AP", "points");
pub static TOTAL_POINTS_HISTOGRAM: Command<i64> = Command::query_only("HP", "points");

// =============================================================================
// Types
// =============================================================================

/// Highest mass the identified model can scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MaxMass {
    Rga100,
    Rga200,
    Rga300,
}

impl MaxMass {
    /// Model class for a mass reported by the identification string.
    pub fn from_reported(mass: i64) -> Self {
        if mass >= 300 {
            MaxMass::Rga300
        } else if mass >= 200 {
            MaxMass::Rga200
        } else {
            MaxMass::Rga100
        }
    }

    pub fn amu(self) -> i64 {
        match self {
            MaxMass::Rga100 => 100,
            MaxMass::Rga200 => 200,
            MaxMass::Rga300 => 300,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScanKind {
    Analog,
    Histogram,
    SingleMass,
    MultiMass,
}

/// Outcome of the most recent scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    Idle,
    Running(ScanKind),
    Finished(ScanKind),
    /// The transport closed mid-scan, or the scan future was dropped.
    Aborted(ScanKind),
    Error(ScanKind),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ScanEvent {
    Started {
        kind: ScanKind,
        total_points: usize,
    },
    Progress {
        kind: ScanKind,
        points_done: usize,
        total_points: usize,
    },
    Finished {
        kind: ScanKind,
        total_points: usize,
        total_ion_current: f64,
    },
}

/// Mass range and speed shared by analog and histogram scans.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanParameters {
    pub initial_mass: i64,
    pub final_mass: i64,
    /// 0 (slowest) to 7 (fastest)
    pub speed: i64,
    /// Steps per AMU for analog scans, 10 to 25
    pub resolution: i64,
}

impl Default for ScanParameters {
    fn default() -> Self {
        Self {
            initial_mass: defaults::INITIAL_MASS,
            final_mass: defaults::FINAL_MASS,
            speed: defaults::SCAN_SPEED,
            resolution: defaults::STEPS_PER_AMU,
        }
    }
}

/// Engine settings taken from configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanSettings {
    pub progress_period: Duration,
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self::from(&rga_core::config::ScanConfig::default())
    }
}

impl From<&rga_core::config::ScanConfig> for ScanSettings {
    fn from(config: &rga_core::config::ScanConfig) -> Self {
        Self {
            progress_period: config.progress_period(),
        }
    }
}

#[derive(Debug)]
struct ScanData {
    kind: Option<ScanKind>,
    mass_axis: Vec<f64>,
    spectrum: Vec<f64>,
    previous_spectrum: Vec<f64>,
    total_ion_current: f64,
}

// =============================================================================
// Scans
// =============================================================================

/// Scan setup and data acquisition.
#[derive(Debug)]
pub struct Scans {
    core: ComponentCore,
    max_mass: MaxMass,
    initial_mass: Command<i64>,
    final_mass: Command<i64>,
    progress_period_ms: AtomicU64,
    state: Mutex<ScanState>,
    data: RwLock<ScanData>,
    events: broadcast::Sender<ScanEvent>,
}

impl Scans {
    pub fn new(transport: Arc<Transport>, max_mass: MaxMass, settings: ScanSettings) -> Self {
        let max = max_mass.amu() as f64;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            core: ComponentCore::new(transport),
            max_mass,
            initial_mass: Command::new("MI", "AMU", 1.0, max, 1.0, 0, 1.0).plain(),
            final_mass: Command::new("MF", "AMU", 1.0, max, 1.0, 0, max).plain(),
            progress_period_ms: AtomicU64::new(duration_ms(settings.progress_period)),
            state: Mutex::new(ScanState::Idle),
            data: RwLock::new(ScanData {
                kind: None,
                mass_axis: Vec::new(),
                spectrum: Vec::new(),
                previous_spectrum: Vec::new(),
                total_ion_current: 0.0,
            }),
            events,
        }
    }

    pub fn max_mass(&self) -> MaxMass {
        self.max_mass
    }

    pub(crate) fn core(&self) -> &ComponentCore {
        &self.core
    }

    /// Descriptor of the initial mass, with the model's range.
    pub fn initial_mass_command(&self) -> &Command<i64> {
        &self.initial_mass
    }

    pub fn final_mass_command(&self) -> &Command<i64> {
        &self.final_mass
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ScanEvent> {
        self.events.subscribe()
    }

    pub fn progress_period(&self) -> Duration {
        Duration::from_millis(self.progress_period_ms.load(Ordering::Relaxed))
    }

    pub fn set_progress_period(&self, period: Duration) {
        self.progress_period_ms
            .store(duration_ms(period), Ordering::Relaxed);
    }

    // -------------------------------------------------------------------------
    // Parameters
    // -------------------------------------------------------------------------

    pub async fn initial_mass(&self) -> RgaResult<i64> {
        self.core.get(&self.initial_mass).await
    }

    pub async fn set_initial_mass(&self, mass: i64) -> RgaResult<()> {
        self.core.set(&self.initial_mass, mass).await.map(|_| ())
    }

    pub async fn final_mass(&self) -> RgaResult<i64> {
        self.core.get(&self.final_mass).await
    }

    pub async fn set_final_mass(&self, mass: i64) -> RgaResult<()> {
        self.core.set(&self.final_mass, mass).await.map(|_| ())
    }

    pub async fn speed(&self) -> RgaResult<i64> {
        self.core.get(&SCAN_SPEED).await
    }

    pub async fn set_speed(&self, speed: i64) -> RgaResult<()> {
        self.core.set(&SCAN_SPEED, speed).await.map(|_| ())
    }

    pub async fn resolution(&self) -> RgaResult<i64> {
        self.core.get(&RESOLUTION).await
    }

    pub async fn set_resolution(&self, steps_per_amu: i64) -> RgaResult<()> {
        self.core.set(&RESOLUTION, steps_per_amu).await.map(|_| ())
    }

    pub async fn get_parameters(&self) -> RgaResult<ScanParameters> {
        Ok(ScanParameters {
            initial_mass: self.initial_mass().await?,
            final_mass: self.final_mass().await?,
            speed: self.speed().await?,
            resolution: self.resolution().await?,
        })
    }

    #[instrument(skip(self))]
    pub async fn set_parameters(&self, parameters: ScanParameters) -> RgaResult<()> {
        self.set_initial_mass(parameters.initial_mass).await?;
        self.set_final_mass(parameters.final_mass).await?;
        // MF must settle before NF is accepted; the read-back paces it.
        self.final_mass().await?;
        self.set_speed(parameters.speed).await?;
        self.set_resolution(parameters.resolution).await
    }

    /// Number of points the instrument will send for an analog or histogram scan.
    pub async fn total_points(&self, kind: ScanKind) -> RgaResult<usize> {
        let command = match kind {
            ScanKind::Analog => &TOTAL_POINTS_ANALOG,
            ScanKind::Histogram => &TOTAL_POINTS_HISTOGRAM,
            other => {
                return Err(RgaError::InvalidParameter(format!(
                    "{:?} scans have no reported point count",
                    other
                )))
            }
        };
        let points = self.core.get(command).await?;
        usize::try_from(points).map_err(|_| RgaError::Query {
            command: command.query_string(),
            reason: format!("negative point count {}", points),
        })
    }

    /// Compute the mass axis from the instrument's current parameters and
    /// keep it for peak extraction.
    pub async fn mass_axis(&self, analog: bool) -> RgaResult<Vec<f64>> {
        let initial = self.initial_mass().await?;
        let final_mass = self.final_mass().await?;
        let step = if analog {
            let resolution = self.resolution().await?;
            if resolution <= 0 {
                return Err(RgaError::InvalidParameter(format!(
                    "resolution must be positive, got {}",
                    resolution
                )));
            }
            1.0 / resolution as f64
        } else {
            1.0
        };

        let axis = mass_axis(initial, final_mass, step);
        self.data.write().await.mass_axis = axis.clone();
        Ok(axis)
    }

    /// Fix the mass filter at one mass.
    pub async fn set_mass_lock(&self, mass: i64) -> RgaResult<()> {
        self.core.transport().send(&format!("ML{}", mass)).await
    }

    // -------------------------------------------------------------------------
    // Scans
    // -------------------------------------------------------------------------

    /// Run an analog scan with the parameters already on the instrument.
    #[instrument(skip(self))]
    pub async fn analog_scan(&self) -> RgaResult<Vec<f64>> {
        let run = self.begin(ScanKind::Analog).await?;
        let result = self.run_analog().await;
        run.conclude(result)
    }

    /// Run a histogram scan with the parameters already on the instrument.
    #[instrument(skip(self))]
    pub async fn histogram_scan(&self) -> RgaResult<Vec<f64>> {
        let run = self.begin(ScanKind::Histogram).await?;
        let result = self.run_histogram().await;
        run.conclude(result)
    }

    /// Ion current at one mass, in units of 1e-16 A.
    #[instrument(skip(self))]
    pub async fn single_mass_scan(&self, mass: i64) -> RgaResult<i32> {
        let run = self.begin(ScanKind::SingleMass).await?;
        self.emit(ScanEvent::Started {
            kind: ScanKind::SingleMass,
            total_points: 1,
        });
        let result = self.read_single_mass(mass).await;
        if let Ok(intensity) = result {
            self.emit(ScanEvent::Finished {
                kind: ScanKind::SingleMass,
                total_points: 1,
                total_ion_current: f64::from(intensity),
            });
        }
        run.conclude(result)
    }

    /// One single-mass read per requested mass, in order.
    #[instrument(skip(self))]
    pub async fn multi_mass_scan(&self, masses: &[i64]) -> RgaResult<Vec<f64>> {
        let run = self.begin(ScanKind::MultiMass).await?;
        let result = self.run_multi_mass(masses).await;
        run.conclude(result)
    }

    async fn run_analog(&self) -> RgaResult<Vec<f64>> {
        let kind = ScanKind::Analog;
        let total_points = self.probe_total_points(kind).await?;
        self.reset_spectrum(kind, total_points).await;

        let (spectrum, trailing) = {
            let mut guard = self.core.transport().lock().await;
            guard.send("SC1").await?;
            self.emit(ScanEvent::Started { kind, total_points });
            let spectrum = self.acquire(&mut guard, kind, total_points).await?;
            let trailing = guard.recv_frame().await?;
            (spectrum, trailing)
        };

        let total_ion_current = match trailing.len() {
            4 => decode_long(&trailing).map_or(0.0, f64::from),
            n if n > 4 => {
                tracing::warn!(
                    "Buffer overrun after analog scan: {} trailing bytes, reinitializing with IN0",
                    n
                );
                self.core.transport().query_text("IN0").await?;
                0.0
            }
            n => {
                tracing::warn!("Short trailing frame after analog scan: {} bytes", n);
                0.0
            }
        };

        self.finish(kind, spectrum, total_ion_current).await
    }

    async fn run_histogram(&self) -> RgaResult<Vec<f64>> {
        let kind = ScanKind::Histogram;
        let total_points = self.probe_total_points(kind).await?;
        self.reset_spectrum(kind, total_points).await;

        let (spectrum, total_ion_current) = {
            let mut guard = self.core.transport().lock().await;
            guard.send("HS1").await?;
            self.emit(ScanEvent::Started { kind, total_points });
            let spectrum = self.acquire(&mut guard, kind, total_points).await?;
            let total = guard.read_long().await?;
            (spectrum, f64::from(total))
        };

        self.finish(kind, spectrum, total_ion_current).await
    }

    async fn run_multi_mass(&self, masses: &[i64]) -> RgaResult<Vec<f64>> {
        let kind = ScanKind::MultiMass;
        let total_points = masses.len();
        self.reset_spectrum(kind, total_points).await;
        self.emit(ScanEvent::Started { kind, total_points });

        let mut spectrum = Vec::with_capacity(total_points);
        for &mass in masses {
            match self.read_single_mass(mass).await {
                Ok(intensity) => spectrum.push(f64::from(intensity)),
                Err(e) => {
                    self.store_partial(&spectrum).await;
                    return Err(e);
                }
            }
        }

        self.finish(kind, spectrum, 0.0).await
    }

    async fn read_single_mass(&self, mass: i64) -> RgaResult<i32> {
        let mut guard = self.core.transport().lock().await;
        guard.send(&format!("MR{}", mass)).await?;
        guard.read_long().await
    }

    /// Probe the instrument with `ID?`; reinitialise with `IN0` if it does not
    /// answer, then read the point count.
    async fn probe_total_points(&self, kind: ScanKind) -> RgaResult<usize> {
        if let Err(e) = self.core.transport().query_text("ID?").await {
            tracing::warn!("Identification probe failed before scan ({}), sending IN0", e);
            self.core.transport().query_text("IN0").await?;
        }
        self.total_points(kind).await
    }

    /// Read `total_points` samples in index order.
    async fn acquire(
        &self,
        guard: &mut TransportGuard<'_>,
        kind: ScanKind,
        total_points: usize,
    ) -> RgaResult<Vec<f64>> {
        let period = self.progress_period();
        let mut samples = Vec::with_capacity(total_points);
        let mut last_report = Instant::now();

        while samples.len() < total_points {
            match guard.read_long().await {
                Ok(sample) => samples.push(f64::from(sample)),
                Err(e) => {
                    tracing::debug!("Scan read failed after {} points", samples.len());
                    self.store_partial(&samples).await;
                    return Err(e);
                }
            }

            if last_report.elapsed() > period {
                self.store_partial(&samples).await;
                self.emit(ScanEvent::Progress {
                    kind,
                    points_done: samples.len(),
                    total_points,
                });
                last_report = Instant::now();
            }
        }

        self.emit(ScanEvent::Progress {
            kind,
            points_done: total_points,
            total_points,
        });
        Ok(samples)
    }

    // -------------------------------------------------------------------------
    // State bookkeeping
    // -------------------------------------------------------------------------

    /// Claim the engine for one scan. The returned guard leaves `Running`
    /// when it is concluded or dropped.
    async fn begin(&self, kind: ScanKind) -> RgaResult<ScanRun<'_>> {
        {
            let mut state = self.state.lock();
            if let ScanState::Running(_) = *state {
                return Err(RgaError::ScanInProgress);
            }
            *state = ScanState::Running(kind);
        }
        let run = ScanRun {
            state: &self.state,
            kind,
            armed: true,
        };
        self.data.write().await.kind = Some(kind);
        Ok(run)
    }

    async fn reset_spectrum(&self, kind: ScanKind, total_points: usize) {
        let mut data = self.data.write().await;
        data.kind = Some(kind);
        data.spectrum = vec![0.0; total_points];
    }

    async fn store_partial(&self, samples: &[f64]) {
        let mut data = self.data.write().await;
        let n = samples.len().min(data.spectrum.len());
        data.spectrum[..n].copy_from_slice(&samples[..n]);
    }

    async fn finish(
        &self,
        kind: ScanKind,
        spectrum: Vec<f64>,
        total_ion_current: f64,
    ) -> RgaResult<Vec<f64>> {
        let total_points = spectrum.len();
        {
            let mut data = self.data.write().await;
            data.spectrum = spectrum.clone();
            data.previous_spectrum = spectrum.clone();
            data.total_ion_current = total_ion_current;
        }
        self.emit(ScanEvent::Finished {
            kind,
            total_points,
            total_ion_current,
        });
        Ok(spectrum)
    }

    fn emit(&self, event: ScanEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    // -------------------------------------------------------------------------
    // Results
    // -------------------------------------------------------------------------

    pub async fn state(&self) -> ScanState {
        *self.state.lock()
    }

    pub async fn scan_kind(&self) -> Option<ScanKind> {
        self.data.read().await.kind
    }

    /// Current buffer; holds partial samples while a scan runs or after one fails.
    pub async fn spectrum(&self) -> Vec<f64> {
        self.data.read().await.spectrum.clone()
    }

    /// Last completed spectrum.
    pub async fn previous_spectrum(&self) -> Vec<f64> {
        self.data.read().await.previous_spectrum.clone()
    }

    pub async fn total_ion_current(&self) -> f64 {
        self.data.read().await.total_ion_current
    }

    /// Axis computed by the last call to [`Scans::mass_axis`].
    pub async fn stored_mass_axis(&self) -> Vec<f64> {
        self.data.read().await.mass_axis.clone()
    }

    /// Peak intensity near `mass` in the stored analog scan.
    pub async fn peak_from_analog_scan(&self, mass: f64, fit: bool) -> f64 {
        let data = self.data.read().await;
        peak_intensity(&data.mass_axis, &data.spectrum, mass, fit)
    }
}

/// Holds the engine in `Running` for one scan.
struct ScanRun<'a> {
    state: &'a Mutex<ScanState>,
    kind: ScanKind,
    armed: bool,
}

impl ScanRun<'_> {
    fn conclude<T>(mut self, result: RgaResult<T>) -> RgaResult<T> {
        let state = match &result {
            Ok(_) => ScanState::Finished(self.kind),
            Err(RgaError::Disconnected) => ScanState::Aborted(self.kind),
            Err(_) => ScanState::Error(self.kind),
        };
        if let Err(e) = &result {
            tracing::error!("{:?} scan failed: {}", self.kind, e);
        }
        *self.state.lock() = state;
        self.armed = false;
        result
    }
}

impl Drop for ScanRun<'_> {
    fn drop(&mut self) {
        if self.armed {
            tracing::warn!("{:?} scan cancelled before completion", self.kind);
            *self.state.lock() = ScanState::Aborted(self.kind);
        }
    }
}

fn duration_ms(period: Duration) -> u64 {
    u64::try_from(period.as_millis()).unwrap_or(u64::MAX)
}

// =============================================================================
// Axis and peak math
// =============================================================================

/// `initial + i * step` up to and including `final_mass`, with half a step of
/// tolerance at the end.
pub fn mass_axis(initial: i64, final_mass: i64, step: f64) -> Vec<f64> {
    if step <= 0.0 {
        return Vec::new();
    }
    let start = initial as f64;
    let stop = final_mass as f64 + step / 2.0;
    let count = ((stop - start) / step).ceil().max(0.0) as usize;
    (0..count).map(|i| start + i as f64 * step).collect()
}

/// Peak intensity within ±0.5 AMU of `mass`.
///
/// Fewer than 5 points in the window gives 0. Otherwise the maximum, or with
/// `fit` the vertex of a quadratic fitted through the 6 points around it.
pub fn peak_intensity(mass_axis: &[f64], spectrum: &[f64], mass: f64, fit: bool) -> f64 {
    let len = mass_axis.len().min(spectrum.len());
    let window: Vec<usize> = (0..len)
        .filter(|&i| mass_axis[i] > mass - PEAK_WINDOW && mass_axis[i] < mass + PEAK_WINDOW)
        .collect();
    if window.len() < PEAK_MIN_POINTS {
        return 0.0;
    }

    let mut arg = window[0];
    for &i in &window[1..] {
        if spectrum[i] > spectrum[arg] {
            arg = i;
        }
    }
    let peak = spectrum[arg];
    if !fit {
        return peak;
    }

    let lo = arg.saturating_sub(2);
    let hi = (arg + 4).min(len);
    fit_vertex(&mass_axis[lo..hi], &spectrum[lo..hi]).unwrap_or(peak)
}

/// Least-squares parabola through the points; value at its axis of symmetry.
fn fit_vertex(x: &[f64], y: &[f64]) -> Option<f64> {
    if x.len() < 3 {
        return None;
    }
    let n = x.len() as f64;
    let x0 = x.iter().sum::<f64>() / n;

    // Normal equations in u = x - x0 for y = a u^2 + b u + c.
    let mut s = [0.0f64; 5];
    let mut t = [0.0f64; 3];
    for (&xi, &yi) in x.iter().zip(y) {
        let u = xi - x0;
        let mut p = 1.0;
        for (k, sk) in s.iter_mut().enumerate() {
            *sk += p;
            if k < 3 {
                t[k] += p * yi;
            }
            p *= u;
        }
    }

    let m = [[s[4], s[3], s[2]], [s[3], s[2], s[1]], [s[2], s[1], s[0]]];
    let det = det3(&m);
    if det.abs() < f64::EPSILON {
        return None;
    }
    let rhs = [t[2], t[1], t[0]];
    let solve = |col: usize| {
        let mut mc = m;
        for (row, r) in mc.iter_mut().enumerate() {
            r[col] = rhs[row];
        }
        det3(&mc) / det
    };
    let (a, b, c) = (solve(0), solve(1), solve(2));
    if a == 0.0 {
        return None;
    }
    // The mean of the two roots is -b / 2a whether they are real or not.
    let u = -b / (2.0 * a);
    Some(a * u * u + b * u + c)
}

fn det3(m: &[[f64; 3]; 3]) -> f64 {
    m[0][0] * (m[1][1] * m[2][2] - m[1][2] * m[2][1])
        - m[0][1] * (m[1][0] * m[2][2] - m[1][2] * m[2][0])
        + m[0][2] * (m[1][0] * m[2][1] - m[1][1] * m[2][0])
}
