//! Scan programs, rows, and the sample queues.
//!
//! A scan *program* is a named table of sweep rows plus a few channel
//! settings (input detector, swept output variable, report mask). Programs
//! live in a [`ScanRegistry`] and are created lazily on first reference, the
//! way the instrument's front panel behaves.
//!
//! Each program owns a set of unbounded FIFO queues the acquisition worker
//! pushes into and the foreground report encoder drains from. The queues are
//! behind plain `Mutex`es: the worker holds them only for a push, the
//! foreground only for a pop, so contention is negligible.

use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::error::{AppResult, RgaError};

// ============================================================================
// Report mask bits
// ============================================================================

/// Report mask bit 0: include the measured value in each record.
pub const REPORT_VALUE: u8 = 1 << 0;
/// Report mask bit 2: include the scan-point tag in each record.
pub const REPORT_POINT: u8 = 1 << 2;
/// Report mask bit 4: emit elapsed-time markers.
pub const REPORT_TIME: u8 = 1 << 4;

/// Power-on report mask: point tags plus values.
pub const DEFAULT_REPORT_MASK: u8 = REPORT_VALUE | REPORT_POINT;

/// Reserved suffix marking a scan-input selector as a reference to another
/// program rather than a physical detector.
pub const CHAIN_SUFFIX: &str = "scans";

// ============================================================================
// Trip codes
// ============================================================================

/// Instrument trip codes, in priority order (lowest code wins when several
/// conditions hold at once).
pub mod trip {
    pub const INHIBIT: u8 = 30;
    pub const PRESSURE: u8 = 31;
    pub const FILAMENT: u8 = 32;
    pub const EMISSION: u8 = 33;
    pub const OVERTEMP: u8 = 34;
}

// ============================================================================
// Rows
// ============================================================================

/// One sweep row: an inclusive arithmetic progression over the swept output.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScanRow {
    pub start: f64,
    pub stop: f64,
    pub step: f64,
}

impl Default for ScanRow {
    fn default() -> Self {
        Self {
            start: 2.0,
            stop: 50.0,
            step: 1.0,
        }
    }
}

impl ScanRow {
    /// Number of points in the row.
    ///
    /// `round((stop - start) / step) + 1`, with two guards: a near-zero span
    /// (within a tolerance scaled by the stop magnitude) and a zero step both
    /// collapse to a single point instead of dividing by zero or looping
    /// forever.
    pub fn point_count(&self) -> usize {
        let tolerance = 1e-12 * self.stop.abs().max(1.0);
        let span = self.stop - self.start;
        if span.abs() < tolerance || self.step == 0.0 {
            return 1;
        }
        let count = (span / self.step).round() as i64 + 1;
        count.max(1) as usize
    }

    /// The swept value at index `i`.
    pub fn point(&self, i: usize) -> f64 {
        self.start + self.step * i as f64
    }
}

// ============================================================================
// Channel selectors
// ============================================================================

/// Physical input detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Detector {
    Faraday,
    Sem,
}

/// What a scan reads: a detector, or another program chained per point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanInput {
    Detector(Detector),
    Chained(String),
}

impl ScanInput {
    /// Parse a protocol-level input selector.
    pub fn parse(selector: &str) -> AppResult<Self> {
        match selector {
            "Faraday" => Ok(Self::Detector(Detector::Faraday)),
            "SEM" | "Multiplier" => Ok(Self::Detector(Detector::Sem)),
            other if other.ends_with(CHAIN_SUFFIX) => Ok(Self::Chained(other.to_string())),
            other => Err(RgaError::UnknownScanInput(other.to_string())),
        }
    }
}

/// Which output variable the row sweep drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanOutput {
    Mass,
    Energy,
}

impl ScanOutput {
    pub fn parse(selector: &str) -> AppResult<Self> {
        match selector {
            "mass" => Ok(Self::Mass),
            "energy" => Ok(Self::Energy),
            other => Err(RgaError::UnknownScanOutput(other.to_string())),
        }
    }
}

// ============================================================================
// Samples and queues
// ============================================================================

/// One entry in a program's data queue.
///
/// Trips travel through the same queue as readings so the encoder renders
/// them in stream order, exactly where acquisition stopped.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Sample {
    Reading { point: f64, value: f64 },
    Trip { point: f64, code: u8 },
}

/// Lock a mutex, recovering the guard if a panicking worker poisoned it.
/// Everything we guard is plain data that stays consistent under any
/// interleaving, so poisoning carries no information here.
pub(crate) fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// The per-program FIFO queues shared between the worker and the foreground.
#[derive(Debug, Default)]
pub struct ProgramQueues {
    data: Mutex<VecDeque<Sample>>,
    points: Mutex<VecDeque<f64>>,
    times: Mutex<VecDeque<u64>>,
}

impl ProgramQueues {
    pub fn push_sample(&self, sample: Sample) {
        lock(&self.data).push_back(sample);
    }

    pub fn pop_sample(&self) -> Option<Sample> {
        lock(&self.data).pop_front()
    }

    pub fn data_len(&self) -> usize {
        lock(&self.data).len()
    }

    pub fn push_point(&self, point: f64) {
        lock(&self.points).push_back(point);
    }

    pub fn pop_point(&self) -> Option<f64> {
        lock(&self.points).pop_front()
    }

    pub fn push_time(&self, elapsed_ms: u64) {
        lock(&self.times).push_back(elapsed_ms);
    }

    pub fn pop_time(&self) -> Option<u64> {
        lock(&self.times).pop_front()
    }

    pub fn clear_times(&self) {
        lock(&self.times).clear();
    }

    pub fn clear(&self) {
        lock(&self.data).clear();
        lock(&self.points).clear();
        lock(&self.times).clear();
    }
}

// ============================================================================
// Programs
// ============================================================================

/// A named scan program.
#[derive(Debug)]
pub struct ScanProgram {
    name: String,
    rows: Vec<ScanRow>,
    current_row: usize,
    pub input: ScanInput,
    pub output: ScanOutput,
    pub report_mask: u8,
    queues: Arc<ProgramQueues>,
    /// Encoder state: whether the next rendered record needs a leading comma.
    /// Persisted across paginated polls.
    pub needs_separator: bool,
}

impl ScanProgram {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            rows: vec![ScanRow::default()],
            current_row: 0,
            input: ScanInput::Detector(Detector::Faraday),
            output: ScanOutput::Mass,
            report_mask: DEFAULT_REPORT_MASK,
            queues: Arc::new(ProgramQueues::default()),
            needs_separator: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn rows(&self) -> &[ScanRow] {
        &self.rows
    }

    pub fn queues(&self) -> &Arc<ProgramQueues> {
        &self.queues
    }

    /// Select the addressed row, growing the table with default rows when the
    /// index is past the end. Out-of-range addressing is a silent extension,
    /// never an error.
    pub fn select_row(&mut self, index: usize) {
        if index >= self.rows.len() {
            self.rows.resize(index + 1, ScanRow::default());
        }
        self.current_row = index;
    }

    pub fn current_row(&self) -> usize {
        self.current_row
    }

    /// Update the bounds of the currently selected row.
    pub fn set_row_bounds(&mut self, start: f64, stop: f64, step: f64) {
        self.rows[self.current_row] = ScanRow { start, stop, step };
    }

    /// First swept value of the whole program (scan-start boundary).
    pub fn overall_start(&self) -> f64 {
        self.rows[0].start
    }

    /// Last row's stop value (scan-stop boundary).
    pub fn overall_stop(&self) -> f64 {
        self.rows[self.rows.len() - 1].stop
    }

    /// Immutable snapshot the worker runs against, so acquisition never holds
    /// a registry lock across an await.
    pub fn plan(&self) -> ScanPlan {
        ScanPlan {
            name: self.name.clone(),
            rows: self.rows.clone(),
            input: self.input.clone(),
            output: self.output,
            report_mask: self.report_mask,
            queues: Arc::clone(&self.queues),
        }
    }
}

/// A frozen copy of a program's sweep definition.
#[derive(Debug, Clone)]
pub struct ScanPlan {
    pub name: String,
    pub rows: Vec<ScanRow>,
    pub input: ScanInput,
    pub output: ScanOutput,
    pub report_mask: u8,
    pub queues: Arc<ProgramQueues>,
}

// ============================================================================
// Registry
// ============================================================================

/// All programs the device knows about, by name.
///
/// A `BTreeMap` keeps iteration order deterministic, which matters for the
/// side-channel lines the data poll appends.
#[derive(Debug, Default)]
pub struct ScanRegistry {
    programs: BTreeMap<String, ScanProgram>,
}

impl ScanRegistry {
    pub fn get_or_create(&mut self, name: &str) -> &mut ScanProgram {
        self.programs
            .entry(name.to_string())
            .or_insert_with(|| ScanProgram::new(name))
    }

    pub fn get(&self, name: &str) -> Option<&ScanProgram> {
        self.programs.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut ScanProgram> {
        self.programs.get_mut(name)
    }

    pub fn plan(&self, name: &str) -> Option<ScanPlan> {
        self.programs.get(name).map(ScanProgram::plan)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.programs.keys().map(String::as_str)
    }

    /// Drop every program (device reset).
    pub fn clear(&mut self) {
        self.programs.clear();
    }

    /// Empty every program's queues and reset encoder separator state
    /// (start of a new acquisition).
    pub fn clear_queues(&mut self) {
        for program in self.programs.values_mut() {
            program.queues.clear();
            program.needs_separator = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_point_count_inclusive() {
        let row = ScanRow {
            start: 1.0,
            stop: 10.0,
            step: 1.0,
        };
        assert_eq!(row.point_count(), 10);
        assert_eq!(row.point(0), 1.0);
        assert_eq!(row.point(9), 10.0);

        let row = ScanRow {
            start: 2.0,
            stop: 50.0,
            step: 1.0,
        };
        assert_eq!(row.point_count(), 49);
    }

    #[test]
    fn row_fractional_step_rounds() {
        let row = ScanRow {
            start: 0.0,
            stop: 1.0,
            step: 0.3,
        };
        // (1.0 / 0.3).round() = 3, plus one.
        assert_eq!(row.point_count(), 4);
    }

    #[test]
    fn degenerate_rows_yield_one_point() {
        let zero_span = ScanRow {
            start: 5.0,
            stop: 5.0,
            step: 1.0,
        };
        assert_eq!(zero_span.point_count(), 1);

        let zero_step = ScanRow {
            start: 1.0,
            stop: 10.0,
            step: 0.0,
        };
        assert_eq!(zero_step.point_count(), 1);

        // Span smaller than the scaled tolerance.
        let tiny = ScanRow {
            start: 100.0,
            stop: 100.0 + 1e-13,
            step: 1.0,
        };
        assert_eq!(tiny.point_count(), 1);
    }

    #[test]
    fn descending_row() {
        let row = ScanRow {
            start: 10.0,
            stop: 1.0,
            step: -1.0,
        };
        assert_eq!(row.point_count(), 10);
        assert_eq!(row.point(1), 9.0);
    }

    #[test]
    fn input_selector_parsing() {
        assert_eq!(
            ScanInput::parse("Faraday").unwrap(),
            ScanInput::Detector(Detector::Faraday)
        );
        assert_eq!(
            ScanInput::parse("SEM").unwrap(),
            ScanInput::Detector(Detector::Sem)
        );
        assert_eq!(
            ScanInput::parse("Multiplier").unwrap(),
            ScanInput::Detector(Detector::Sem)
        );
        assert_eq!(
            ScanInput::parse("Bscans").unwrap(),
            ScanInput::Chained("Bscans".to_string())
        );
        assert!(matches!(
            ScanInput::parse("bogus"),
            Err(RgaError::UnknownScanInput(_))
        ));
    }

    #[test]
    fn output_selector_parsing() {
        assert_eq!(ScanOutput::parse("mass").unwrap(), ScanOutput::Mass);
        assert_eq!(ScanOutput::parse("energy").unwrap(), ScanOutput::Energy);
        assert!(ScanOutput::parse("volume").is_err());
    }

    #[test]
    fn sparse_row_selection_grows_with_defaults() {
        let mut program = ScanProgram::new("Ascans");
        assert_eq!(program.rows().len(), 1);

        program.select_row(3);
        assert_eq!(program.rows().len(), 4);
        assert_eq!(program.rows()[2], ScanRow::default());

        program.set_row_bounds(1.0, 5.0, 1.0);
        assert_eq!(program.rows()[3].stop, 5.0);
        // Overall bounds span first row start to last row stop.
        assert_eq!(program.overall_start(), 2.0);
        assert_eq!(program.overall_stop(), 5.0);
    }

    #[test]
    fn registry_creates_on_first_reference() {
        let mut registry = ScanRegistry::default();
        assert!(registry.get("Ascans").is_none());
        registry.get_or_create("Ascans").select_row(0);
        assert!(registry.get("Ascans").is_some());

        let names: Vec<&str> = registry.names().collect();
        assert_eq!(names, vec!["Ascans"]);
    }

    #[test]
    fn queues_are_fifo_and_clearable() {
        let queues = ProgramQueues::default();
        queues.push_sample(Sample::Reading {
            point: 1.0,
            value: 2.0,
        });
        queues.push_sample(Sample::Trip {
            point: 2.0,
            code: trip::PRESSURE,
        });
        queues.push_point(1.0);
        queues.push_time(120);

        assert_eq!(queues.data_len(), 2);
        assert_eq!(
            queues.pop_sample(),
            Some(Sample::Reading {
                point: 1.0,
                value: 2.0
            })
        );
        assert_eq!(queues.pop_time(), Some(120));

        queues.clear();
        assert_eq!(queues.data_len(), 0);
        assert_eq!(queues.pop_point(), None);
    }
}
