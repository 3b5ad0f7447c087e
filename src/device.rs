//! Device façade: the single object a protocol layer (or a test) talks to.
//!
//! The façade owns the shared state, the scan registry, and at most one
//! acquisition worker at a time. Foreground operations are cheap and
//! non-blocking except for the explicit stop/join calls, whose timeout
//! semantics the caller chooses.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tracing::{info, warn};

use crate::config::Settings;
use crate::engine::{self, EngineHandle};
use crate::error::{AppResult, RgaError};
use crate::gas::GasMixture;
use crate::report;
use crate::scan::{lock, trip, Detector, ScanInput, ScanOutput, ScanRegistry};

/// Name of the scan program selected at power-on.
pub const DEFAULT_SCAN: &str = "Ascans";

// ============================================================================
// Shared state
// ============================================================================

/// The output variables a sweep drives.
#[derive(Debug, Clone, Copy)]
pub struct Beam {
    pub mass: f64,
    pub energy: f64,
}

/// Acquisition parameters, snapshotted by the worker at start.
#[derive(Debug, Clone)]
pub struct AcqParams {
    pub dwell: u64,
    pub dwell_is_percent: bool,
    pub settle: u64,
    pub settle_is_percent: bool,
    pub default_dwell_ms: u64,
    pub default_settle_ms: u64,
    pub noise: f64,
    /// Number of sweep cycles; 0 means run until stopped.
    pub cycles: u32,
    /// Delay between consecutive cycles.
    pub interval_ms: u64,
}

impl AcqParams {
    fn from_settings(settings: &Settings) -> Self {
        Self {
            dwell: settings.default_dwell_ms,
            dwell_is_percent: false,
            settle: settings.default_settle_ms,
            settle_is_percent: false,
            default_dwell_ms: settings.default_dwell_ms,
            default_settle_ms: settings.default_settle_ms,
            noise: settings.noise,
            cycles: 1,
            interval_ms: 0,
        }
    }

    /// Effective per-point acquisition time.
    pub fn dwell_ms(&self) -> u64 {
        if self.dwell_is_percent {
            self.default_dwell_ms * self.dwell / 100
        } else {
            self.dwell
        }
    }

    /// Effective pre-point settling time.
    pub fn settle_ms(&self) -> u64 {
        if self.settle_is_percent {
            self.default_settle_ms * self.settle / 100
        } else {
            self.settle
        }
    }
}

/// Instantaneous health picture, serializable for status queries.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Health {
    pub filament_ok: bool,
    pub emission_ok: bool,
    pub pressure_trip: bool,
    pub overtemp: bool,
    pub inhibit: bool,
    pub total_pressure: f64,
}

/// Device lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ScanState {
    Idle,
    Running,
    Paused,
    Stopping,
    Aborting,
}

/// Everything the worker and the foreground both touch.
///
/// Locks are held only for plain reads/writes, never across an await. Flags
/// use SeqCst: trip visibility ordering matters more here than throughput.
#[derive(Debug)]
pub struct SharedState {
    mixture: Mutex<GasMixture>,
    beam: Mutex<Beam>,
    params: Mutex<AcqParams>,
    state: Mutex<ScanState>,
    paused: AtomicBool,
    filament_ok: AtomicBool,
    emission_ok: AtomicBool,
    pressure_trip: AtomicBool,
    overtemp: AtomicBool,
    inhibit: AtomicBool,
    trip_threshold: f64,
}

impl SharedState {
    fn new(settings: &Settings) -> Self {
        Self {
            mixture: Mutex::new(GasMixture::standard()),
            beam: Mutex::new(Beam {
                mass: settings.mass,
                energy: settings.electron_energy,
            }),
            params: Mutex::new(AcqParams::from_settings(settings)),
            state: Mutex::new(ScanState::Idle),
            paused: AtomicBool::new(false),
            filament_ok: AtomicBool::new(true),
            emission_ok: AtomicBool::new(true),
            pressure_trip: AtomicBool::new(false),
            overtemp: AtomicBool::new(false),
            inhibit: AtomicBool::new(false),
            trip_threshold: settings.pressure_trip_threshold,
        }
    }

    /// Clean (noise-free) mixture signal at a working point.
    pub fn signal(&self, mass: f64, energy: f64) -> f64 {
        lock(&self.mixture).signal(mass, energy)
    }

    pub fn beam_snapshot(&self) -> Beam {
        *lock(&self.beam)
    }

    pub fn restore_beam(&self, beam: Beam) {
        *lock(&self.beam) = beam;
    }

    /// Point the swept output variable at a new value.
    pub fn drive_output(&self, output: ScanOutput, value: f64) {
        let mut beam = lock(&self.beam);
        match output {
            ScanOutput::Mass => beam.mass = value,
            ScanOutput::Energy => beam.energy = value,
        }
    }

    pub fn params_snapshot(&self) -> AcqParams {
        lock(&self.params).clone()
    }

    pub fn update_params(&self, f: impl FnOnce(&mut AcqParams)) {
        f(&mut lock(&self.params));
    }

    pub fn scan_state(&self) -> ScanState {
        *lock(&self.state)
    }

    pub fn set_scan_state(&self, state: ScanState) {
        *lock(&self.state) = state;
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::SeqCst);
    }

    /// Highest-priority active trip condition, if any.
    ///
    /// Priority is fixed: external inhibit, then pressure, then filament,
    /// then emission, then overtemperature.
    pub fn first_trip(&self) -> Option<u8> {
        if self.inhibit.load(Ordering::SeqCst) {
            Some(trip::INHIBIT)
        } else if self.pressure_trip.load(Ordering::SeqCst) {
            Some(trip::PRESSURE)
        } else if !self.filament_ok.load(Ordering::SeqCst) {
            Some(trip::FILAMENT)
        } else if !self.emission_ok.load(Ordering::SeqCst) {
            Some(trip::EMISSION)
        } else if self.overtemp.load(Ordering::SeqCst) {
            Some(trip::OVERTEMP)
        } else {
            None
        }
    }

    pub fn health(&self) -> Health {
        Health {
            filament_ok: self.filament_ok.load(Ordering::SeqCst),
            emission_ok: self.emission_ok.load(Ordering::SeqCst),
            pressure_trip: self.pressure_trip.load(Ordering::SeqCst),
            overtemp: self.overtemp.load(Ordering::SeqCst),
            inhibit: self.inhibit.load(Ordering::SeqCst),
            total_pressure: lock(&self.mixture).total_pressure(),
        }
    }
}

// ============================================================================
// Device
// ============================================================================

/// The simulated instrument.
pub struct Device {
    settings: Settings,
    shared: Arc<SharedState>,
    registry: Arc<Mutex<ScanRegistry>>,
    worker: Option<EngineHandle>,
    /// Program the foreground edit operations target.
    current_scan: String,
    /// Program the last `start` launched; data polls stream this one.
    primary_scan: String,
    current_gas: Option<String>,
    terse: bool,
    points_per_poll: usize,
    mode: i32,
}

impl Device {
    pub fn new(settings: Settings) -> Self {
        let shared = Arc::new(SharedState::new(&settings));
        let points_per_poll = settings.points_per_poll;
        Self {
            settings,
            shared,
            registry: Arc::new(Mutex::new(ScanRegistry::default())),
            worker: None,
            current_scan: DEFAULT_SCAN.to_string(),
            primary_scan: DEFAULT_SCAN.to_string(),
            current_gas: None,
            terse: false,
            points_per_poll,
            mode: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.settings.instrument_name
    }

    pub fn scan_state(&self) -> ScanState {
        self.shared.scan_state()
    }

    pub fn is_scanning(&self) -> bool {
        self.worker.as_ref().is_some_and(|w| !w.is_finished())
    }

    // ------------------------------------------------------------------
    // Scan editing
    // ------------------------------------------------------------------

    /// Select (creating if necessary) the program subsequent edits target.
    pub fn select_scan(&mut self, name: &str) {
        lock(&self.registry).get_or_create(name);
        self.current_scan = name.to_string();
    }

    pub fn current_scan(&self) -> &str {
        &self.current_scan
    }

    pub fn set_row(&mut self, index: usize) {
        lock(&self.registry)
            .get_or_create(&self.current_scan)
            .select_row(index);
    }

    pub fn set_row_bounds(&mut self, start: f64, stop: f64, step: f64) {
        lock(&self.registry)
            .get_or_create(&self.current_scan)
            .set_row_bounds(start, stop, step);
    }

    pub fn set_report_mask(&mut self, mask: u8) {
        lock(&self.registry)
            .get_or_create(&self.current_scan)
            .report_mask = mask;
    }

    pub fn set_scan_input(&mut self, selector: &str) -> AppResult<()> {
        let input = ScanInput::parse(selector)?;
        lock(&self.registry).get_or_create(&self.current_scan).input = input;
        Ok(())
    }

    pub fn set_scan_output(&mut self, selector: &str) -> AppResult<()> {
        let output = ScanOutput::parse(selector)?;
        lock(&self.registry)
            .get_or_create(&self.current_scan)
            .output = output;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Acquisition parameters
    // ------------------------------------------------------------------

    pub fn set_cycles(&mut self, cycles: u32) {
        self.shared.update_params(|p| p.cycles = cycles);
    }

    pub fn set_interval(&mut self, interval_ms: u64) {
        self.shared.update_params(|p| p.interval_ms = interval_ms);
    }

    pub fn set_dwell(&mut self, value: u64, percent: bool) {
        self.shared.update_params(|p| {
            p.dwell = value;
            p.dwell_is_percent = percent;
        });
    }

    pub fn set_settle(&mut self, value: u64, percent: bool) {
        self.shared.update_params(|p| {
            p.settle = value;
            p.settle_is_percent = percent;
        });
    }

    pub fn set_noise(&mut self, noise: f64) {
        self.shared.update_params(|p| p.noise = noise);
    }

    pub fn set_points(&mut self, points: usize) {
        self.points_per_poll = points.max(1);
    }

    pub fn set_terse(&mut self, terse: bool) {
        self.terse = terse;
    }

    pub fn terse(&self) -> bool {
        self.terse
    }

    pub fn set_mode(&mut self, mode: i32) {
        self.mode = mode;
    }

    pub fn mode(&self) -> i32 {
        self.mode
    }

    pub fn set_electron_energy(&mut self, energy: f64) {
        self.shared.drive_output(ScanOutput::Energy, energy);
    }

    pub fn electron_energy(&self) -> f64 {
        self.shared.beam_snapshot().energy
    }

    pub fn set_mass(&mut self, mass: f64) {
        self.shared.drive_output(ScanOutput::Mass, mass);
    }

    pub fn mass(&self) -> f64 {
        self.shared.beam_snapshot().mass
    }

    // ------------------------------------------------------------------
    // Gas model
    // ------------------------------------------------------------------

    /// Set a species' partial pressure and run the trip threshold check.
    ///
    /// Crossing above the threshold engages the pressure trip, drops
    /// emission, and forces the current program back onto the default
    /// detector. Crossing back down only clears the trip flag; emission
    /// stays off until explicitly re-enabled.
    pub fn set_gas_pressure(&mut self, name: &str, pressure: f64) {
        let total = {
            let mut mixture = lock(&self.shared.mixture);
            mixture.set_pressure(name, pressure);
            mixture.total_pressure()
        };

        let above = total > self.shared.trip_threshold;
        let was_tripped = self.shared.pressure_trip.load(Ordering::SeqCst);
        if above && !was_tripped {
            warn!(total, "total pressure above trip threshold");
            self.shared.pressure_trip.store(true, Ordering::SeqCst);
            self.shared.emission_ok.store(false, Ordering::SeqCst);
            lock(&self.registry).get_or_create(&self.primary_scan).input =
                ScanInput::Detector(Detector::Faraday);
        } else if !above && was_tripped {
            info!(total, "total pressure back below trip threshold");
            self.shared.pressure_trip.store(false, Ordering::SeqCst);
        }
    }

    /// Select the species targeted by [`Device::set_selected_gas_pressure`].
    pub fn select_gas(&mut self, name: &str) -> AppResult<()> {
        if lock(&self.shared.mixture).gas(name).is_none() {
            return Err(RgaError::UnknownGas(name.to_string()));
        }
        self.current_gas = Some(name.to_string());
        Ok(())
    }

    pub fn selected_gas(&self) -> Option<&str> {
        self.current_gas.as_deref()
    }

    pub fn set_selected_gas_pressure(&mut self, pressure: f64) {
        let Some(name) = self.current_gas.clone() else {
            warn!("pressure set with no gas selected; ignoring");
            return;
        };
        self.set_gas_pressure(&name, pressure);
    }

    // ------------------------------------------------------------------
    // Health and fault injection
    // ------------------------------------------------------------------

    pub fn query_health(&self) -> Health {
        self.shared.health()
    }

    pub fn set_filament_ok(&mut self, ok: bool) {
        self.shared.filament_ok.store(ok, Ordering::SeqCst);
    }

    pub fn set_emission_ok(&mut self, ok: bool) {
        self.shared.emission_ok.store(ok, Ordering::SeqCst);
    }

    pub fn set_inhibit(&mut self, inhibit: bool) {
        self.shared.inhibit.store(inhibit, Ordering::SeqCst);
    }

    pub fn set_overtemp(&mut self, overtemp: bool) {
        self.shared.overtemp.store(overtemp, Ordering::SeqCst);
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Start acquiring the named program, creating it if need be.
    ///
    /// Any previous worker is aborted and joined first, so there is never
    /// more than one producer. Stale queue contents from an earlier run are
    /// dropped.
    pub async fn start(&mut self, name: &str) {
        if let Some(handle) = self.worker.as_ref() {
            handle.request_abort();
        }
        self.join_worker(None).await;

        self.primary_scan = name.to_string();
        {
            let mut registry = lock(&self.registry);
            registry.get_or_create(&self.primary_scan);
            registry.clear_queues();
        }
        self.shared.set_paused(false);
        self.shared.set_scan_state(ScanState::Running);
        self.worker = Some(engine::spawn(
            Arc::clone(&self.shared),
            Arc::clone(&self.registry),
            self.primary_scan.clone(),
        ));
    }

    /// Request a stop at the next cycle boundary and join with the given
    /// timeout semantics. Returns whether the worker was joined.
    pub async fn stop_graceful(&mut self, timeout: Option<Duration>) -> bool {
        if let Some(handle) = self.worker.as_ref() {
            handle.request_graceful();
            self.shared.set_scan_state(ScanState::Stopping);
        }
        self.join_worker(timeout).await
    }

    /// Request a stop before the next point and join with the given timeout
    /// semantics. Returns whether the worker was joined.
    pub async fn stop_abort(&mut self, timeout: Option<Duration>) -> bool {
        if let Some(handle) = self.worker.as_ref() {
            handle.request_abort();
            self.shared.set_scan_state(ScanState::Aborting);
        }
        self.join_worker(timeout).await
    }

    /// Join semantics: `Some(0)` polls, `Some(d)` waits up to `d`, `None`
    /// waits unboundedly. No worker counts as already joined.
    async fn join_worker(&mut self, timeout: Option<Duration>) -> bool {
        let Some(handle) = self.worker.as_mut() else {
            return true;
        };
        let joined = match timeout {
            Some(limit) if limit.is_zero() => handle.is_finished(),
            Some(limit) => tokio::time::timeout(limit, &mut handle.task)
                .await
                .is_ok(),
            None => {
                let _ = (&mut handle.task).await;
                true
            }
        };
        if joined {
            self.worker = None;
            self.shared.set_scan_state(ScanState::Idle);
        }
        joined
    }

    /// Hold acquisition at the next cycle boundary.
    pub fn pause(&mut self) {
        self.shared.set_paused(true);
    }

    pub fn resume(&mut self) {
        self.shared.set_paused(false);
    }

    /// Drain one page (or everything, with `all`) of the primary program's
    /// data. Side-channel lines for non-primary programs follow on their own
    /// lines.
    pub fn poll_data(&mut self, all: bool) -> String {
        let running = self.is_scanning();
        let output = {
            let mut registry = lock(&self.registry);
            report::poll(
                &mut registry,
                &self.primary_scan,
                running,
                self.points_per_poll,
                all,
            )
        };
        let mut text = output.primary;
        for line in output.side {
            text.push('\n');
            text.push_str(&line);
        }
        text
    }

    /// Queued sample count for a program. Diagnostic accessor.
    pub fn queued_samples(&self, name: &str) -> usize {
        lock(&self.registry)
            .get(name)
            .map_or(0, |p| p.queues().data_len())
    }

    /// Restore the power-on state: stop and join any worker, drop every
    /// program, and put all parameters, outputs, gas pressures, and health
    /// flags back to their defaults.
    pub async fn reset(&mut self) {
        if let Some(handle) = self.worker.as_ref() {
            handle.request_abort();
        }
        self.join_worker(None).await;

        lock(&self.registry).clear();
        *lock(&self.shared.mixture) = GasMixture::standard();
        *lock(&self.shared.beam) = Beam {
            mass: self.settings.mass,
            energy: self.settings.electron_energy,
        };
        *lock(&self.shared.params) = AcqParams::from_settings(&self.settings);
        self.shared.set_paused(false);
        self.shared.filament_ok.store(true, Ordering::SeqCst);
        self.shared.emission_ok.store(true, Ordering::SeqCst);
        self.shared.pressure_trip.store(false, Ordering::SeqCst);
        self.shared.overtemp.store(false, Ordering::SeqCst);
        self.shared.inhibit.store(false, Ordering::SeqCst);

        self.current_scan = DEFAULT_SCAN.to_string();
        self.primary_scan = DEFAULT_SCAN.to_string();
        self.current_gas = None;
        self.terse = false;
        self.points_per_poll = self.settings.points_per_poll;
        self.mode = 0;
        info!("device reset to power-on state");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device() -> Device {
        Device::new(Settings::default())
    }

    #[test]
    fn trip_priority_order() {
        let shared = SharedState::new(&Settings::default());
        assert_eq!(shared.first_trip(), None);

        shared.overtemp.store(true, Ordering::SeqCst);
        assert_eq!(shared.first_trip(), Some(trip::OVERTEMP));
        shared.emission_ok.store(false, Ordering::SeqCst);
        assert_eq!(shared.first_trip(), Some(trip::EMISSION));
        shared.filament_ok.store(false, Ordering::SeqCst);
        assert_eq!(shared.first_trip(), Some(trip::FILAMENT));
        shared.pressure_trip.store(true, Ordering::SeqCst);
        assert_eq!(shared.first_trip(), Some(trip::PRESSURE));
        shared.inhibit.store(true, Ordering::SeqCst);
        assert_eq!(shared.first_trip(), Some(trip::INHIBIT));
    }

    #[test]
    fn percent_dwell_scales_against_default() {
        let mut params = AcqParams::from_settings(&Settings::default());
        assert_eq!(params.dwell_ms(), 100);

        params.dwell = 50;
        params.dwell_is_percent = true;
        assert_eq!(params.dwell_ms(), 50);

        params.dwell = 200;
        assert_eq!(params.dwell_ms(), 200);

        params.settle = 10;
        params.settle_is_percent = true;
        assert_eq!(params.settle_ms(), 10);
    }

    #[test]
    fn pressure_trip_engages_and_clears_on_crossing() {
        let mut device = device();
        device.select_scan(DEFAULT_SCAN);
        device
            .set_scan_input("SEM")
            .expect("selector is valid");

        // Default threshold is 1e-4.
        device.set_gas_pressure("N2", 2e-4);
        let health = device.query_health();
        assert!(health.pressure_trip);
        assert!(!health.emission_ok);
        // Trip kicked the program back onto the default detector.
        let registry = lock(&device.registry);
        assert_eq!(
            registry.get(DEFAULT_SCAN).map(|p| p.input.clone()),
            Some(ScanInput::Detector(Detector::Faraday))
        );
        drop(registry);

        device.set_gas_pressure("N2", 1e-7);
        let health = device.query_health();
        assert!(!health.pressure_trip);
        // Emission does not come back by itself.
        assert!(!health.emission_ok);
        device.set_emission_ok(true);
        assert!(device.query_health().emission_ok);
    }

    #[test]
    fn select_gas_validates_name() {
        let mut device = device();
        assert!(device.select_gas("H2O").is_ok());
        assert!(matches!(
            device.select_gas("Kr"),
            Err(RgaError::UnknownGas(_))
        ));
        // Failed selection does not clobber the previous one.
        assert_eq!(device.selected_gas(), Some("H2O"));

        device.set_selected_gas_pressure(3e-7);
        assert!((device.query_health().total_pressure - 3e-7).abs() < 1e-18);
    }

    #[test]
    fn health_snapshot_serializes() {
        let device = device();
        let json = serde_json::to_string(&device.query_health()).expect("health serializes");
        assert!(json.contains("\"filament_ok\":true"));
        assert!(json.contains("\"total_pressure\":0.0"));
    }

    #[tokio::test]
    async fn reset_restores_power_on_state() {
        let mut device = device();
        device.select_scan("Bscans");
        device.set_points(5);
        device.set_terse(true);
        device.set_gas_pressure("He", 1e-6);
        device.set_inhibit(true);

        device.reset().await;

        assert_eq!(device.current_scan(), DEFAULT_SCAN);
        assert_eq!(device.points_per_poll, 70);
        assert!(!device.terse());
        assert_eq!(device.query_health().total_pressure, 0.0);
        assert!(!device.query_health().inhibit);
        assert!(lock(&device.registry).get("Bscans").is_none());
    }
}
