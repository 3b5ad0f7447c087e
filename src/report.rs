//! Report encoder: renders queued samples into the instrument's ASCII
//! data-stream grammar.
//!
//! The stream a real controller expects looks like
//!
//! ```text
//! [{2: 1.234000e-9,3: 5.678000e-9,...,50: 9.999000e-10}]
//! ```
//!
//! with `[{` opening at the program's first swept value, `}]` closing at its
//! last, commas between records, and the report mask deciding which fields
//! each record carries. Separator state lives on the program so a page
//! boundary in the middle of a cycle never produces a malformed stream.
//!
//! When the primary queue is empty the poll answers with the end-of-data
//! sentinel if acquisition is over, or an empty string if the worker is still
//! producing.

use tracing::info;

use crate::scan::{Sample, ScanProgram, ScanRegistry, REPORT_POINT, REPORT_TIME, REPORT_VALUE};

/// Sentinel answering a data poll once acquisition has finished and the
/// queues are drained.
pub const END_OF_DATA: &str = "*C110*";

/// Result of one data poll.
#[derive(Debug, PartialEq, Eq)]
pub struct PollOutput {
    /// The primary program's rendered stream (or sentinel / empty marker).
    pub primary: String,
    /// One informational line per non-primary program that had pending data.
    pub side: Vec<String>,
}

/// Drain and render up to one page of the primary program's queued samples.
///
/// `running` reflects whether the worker task is still alive; it only matters
/// for the empty-queue answer. `limit` is the page size; `all` overrides it.
pub fn poll(
    registry: &mut ScanRegistry,
    primary: &str,
    running: bool,
    limit: usize,
    all: bool,
) -> PollOutput {
    let primary_text = match registry.get_mut(primary) {
        Some(program) if program.queues().data_len() > 0 => render_page(program, limit, all),
        _ => {
            if running {
                String::new()
            } else {
                END_OF_DATA.to_string()
            }
        }
    };

    PollOutput {
        primary: primary_text,
        side: drain_side_channels(registry, primary),
    }
}

fn render_page(program: &mut ScanProgram, limit: usize, all: bool) -> String {
    let mask = program.report_mask;
    let overall_start = program.overall_start();
    let overall_stop = program.overall_stop();
    let tolerance = 1e-9 * overall_stop.abs().max(1.0);
    let queues = std::sync::Arc::clone(program.queues());

    let mut out = String::new();
    let mut needs_separator = program.needs_separator;

    // Elapsed-time markers render ahead of the data records they precede.
    if mask & REPORT_TIME != 0 {
        while let Some(elapsed_ms) = queues.pop_time() {
            if needs_separator {
                out.push(',');
            }
            out.push_str(&format!("{elapsed_ms}ms"));
            needs_separator = true;
        }
    } else {
        queues.clear_times();
    }

    let available = queues.data_len();
    let take = if all { available } else { available.min(limit) };

    for _ in 0..take {
        let Some(sample) = queues.pop_sample() else {
            break;
        };
        match sample {
            Sample::Reading { point, value } => {
                // The point queue runs in lockstep with readings.
                let _ = queues.pop_point();
                if mask & (REPORT_VALUE | REPORT_POINT) == 0 {
                    continue;
                }
                if (point - overall_start).abs() <= tolerance {
                    out.push_str("[{");
                    needs_separator = false;
                } else if needs_separator {
                    out.push(',');
                }
                if mask & REPORT_POINT != 0 {
                    out.push_str(&fmt_point(point));
                    out.push(':');
                }
                if mask & REPORT_VALUE != 0 {
                    out.push_str(&fmt_value(value));
                }
                if (point - overall_stop).abs() <= tolerance {
                    out.push_str("}]");
                    needs_separator = false;
                } else {
                    needs_separator = true;
                }
            }
            Sample::Trip { code, .. } => {
                if needs_separator {
                    out.push(',');
                }
                out.push_str(&format!("*E{code}*"));
                needs_separator = true;
            }
        }
    }

    program.needs_separator = needs_separator;
    out
}

/// Non-primary programs never stream; their pending data collapses into one
/// informational line each so nothing sits in a queue forever.
fn drain_side_channels(registry: &mut ScanRegistry, primary: &str) -> Vec<String> {
    let names: Vec<String> = registry
        .names()
        .filter(|n| *n != primary)
        .map(str::to_string)
        .collect();

    let mut lines = Vec::new();
    for name in names {
        let Some(program) = registry.get_mut(&name) else {
            continue;
        };
        let pending = program.queues().data_len();
        if pending == 0 {
            continue;
        }
        program.queues().clear();
        program.needs_separator = false;
        info!(scan = %name, pending, "drained non-primary scan data");
        lines.push(format!("?{name},{pending}"));
    }
    lines
}

/// Swept-value tag: rounded to 1e-6, printed as an integer when whole.
fn fmt_point(point: f64) -> String {
    let rounded = (point * 1e6).round() / 1e6;
    if rounded.fract() == 0.0 {
        format!("{}", rounded as i64)
    } else {
        format!("{rounded}")
    }
}

/// Measured value in fixed scientific notation, space-padded in the sign
/// position when non-negative.
fn fmt_value(value: f64) -> String {
    if value >= 0.0 {
        format!(" {value:.6e}")
    } else {
        format!("{value:.6e}")
    }
}
