//! End-to-end acquisition lifecycle tests: start/stop semantics, chaining,
//! trips, and pausing, all against a live worker task.

use std::time::Duration;

use rga_sim::{Device, ScanState, Settings, END_OF_DATA};

fn quiet_device() -> Device {
    let settings = Settings {
        noise: 0.0,
        ..Settings::default()
    };
    let mut device = Device::new(settings);
    device.set_settle(0, false);
    device
}

/// Three-point mass sweep over 1..3.
fn configure_small_scan(device: &mut Device, dwell_ms: u64, cycles: u32) {
    device.select_scan("Ascans");
    device.set_row(0);
    device.set_row_bounds(1.0, 3.0, 1.0);
    device.set_dwell(dwell_ms, false);
    device.set_cycles(cycles);
}

#[tokio::test]
async fn graceful_stop_finishes_the_cycle() {
    let mut device = quiet_device();
    configure_small_scan(&mut device, 5, 0); // run forever

    device.start("Ascans").await;
    tokio::time::sleep(Duration::from_millis(40)).await;

    let joined = device.stop_graceful(None).await;
    assert!(joined);
    assert_eq!(device.scan_state(), ScanState::Idle);

    // A graceful stop never cuts a cycle short, so the sample count is a
    // whole number of three-point cycles.
    let queued = device.queued_samples("Ascans");
    assert!(queued > 0);
    assert_eq!(queued % 3, 0);
}

#[tokio::test]
async fn abort_cuts_the_row_short() {
    let mut device = quiet_device();
    configure_small_scan(&mut device, 50, 1);
    device.set_row_bounds(1.0, 50.0, 1.0); // 50 points at 50 ms each

    device.start("Ascans").await;
    tokio::time::sleep(Duration::from_millis(120)).await;

    let joined = device.stop_abort(None).await;
    assert!(joined);
    assert!(!device.is_scanning());

    let queued = device.queued_samples("Ascans");
    assert!(queued < 50, "abort should land mid-row, got {queued} samples");
}

#[tokio::test]
async fn zero_timeout_polls_and_bounded_timeout_waits() {
    let mut device = quiet_device();
    configure_small_scan(&mut device, 100, 0);

    device.start("Ascans").await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    // The worker is deep in a 300 ms cycle; a zero-timeout graceful stop
    // only polls and reports it still running.
    let joined = device.stop_graceful(Some(Duration::ZERO)).await;
    assert!(!joined);
    assert!(device.is_scanning());

    // A bounded abort join succeeds well inside its window.
    let joined = device.stop_abort(Some(Duration::from_secs(5))).await;
    assert!(joined);
    assert!(!device.is_scanning());
}

#[tokio::test]
async fn restart_drops_stale_data_and_replaces_the_worker() {
    let mut device = quiet_device();
    configure_small_scan(&mut device, 0, 1);

    device.start("Ascans").await;
    device.stop_graceful(None).await;
    assert_eq!(device.queued_samples("Ascans"), 3);

    // Starting again clears the previous run's queue before producing.
    device.start("Ascans").await;
    device.stop_graceful(None).await;
    assert_eq!(device.queued_samples("Ascans"), 3);
}

#[tokio::test]
async fn chained_input_runs_the_referenced_program_per_point() {
    let mut device = quiet_device();

    device.select_scan("Bscans");
    device.set_row(0);
    device.set_row_bounds(1.0, 3.0, 1.0);

    device.select_scan("Ascans");
    device.set_row(0);
    device.set_row_bounds(10.0, 30.0, 10.0);
    device
        .set_scan_output("energy")
        .expect("energy is a valid output");
    device
        .set_scan_input("Bscans")
        .expect("chain selector is valid");
    device.set_dwell(0, false);
    device.set_cycles(1);

    device.start("Ascans").await;
    let joined = tokio::time::timeout(Duration::from_secs(5), device.stop_graceful(None))
        .await
        .expect("chained scan must terminate");
    assert!(joined);

    // The chained program acquired three full passes, one per outer point,
    // and the outer program still emitted its own three samples.
    assert_eq!(device.queued_samples("Ascans"), 3);
    assert_eq!(device.queued_samples("Bscans"), 9);

    // The outer stream carries placeholder values; the chained data is
    // reported as a side-channel line.
    assert_eq!(
        device.poll_data(false),
        "[{10: 0.000000e0,20: 0.000000e0,30: 0.000000e0}]\n?Bscans,9"
    );
}

#[tokio::test]
async fn mutually_chained_programs_terminate() {
    let mut device = quiet_device();

    device.select_scan("Bscans");
    device.set_row(0);
    device.set_row_bounds(1.0, 2.0, 1.0);
    device
        .set_scan_input("Ascans")
        .expect("chain selector is valid");

    device.select_scan("Ascans");
    device.set_row(0);
    device.set_row_bounds(1.0, 2.0, 1.0);
    device
        .set_scan_input("Bscans")
        .expect("chain selector is valid");
    device.set_dwell(0, false);
    device.set_cycles(1);

    device.start("Ascans").await;
    let joined = tokio::time::timeout(Duration::from_secs(5), device.stop_graceful(None))
        .await
        .expect("cyclic chain must not hang");
    assert!(joined);

    // B's attempt to re-enter A is skipped, but both programs still emit
    // their own samples: two for A, and two per A point for B.
    assert_eq!(device.queued_samples("Ascans"), 2);
    assert_eq!(device.queued_samples("Bscans"), 4);
}

#[tokio::test]
async fn inhibit_trip_renders_error_token_and_idles() {
    let mut device = quiet_device();
    configure_small_scan(&mut device, 0, 1);
    device.set_inhibit(true);

    device.start("Ascans").await;
    device.stop_graceful(None).await;
    assert_eq!(device.scan_state(), ScanState::Idle);

    // The trip is the only queued sample; it renders as the error token.
    assert_eq!(device.poll_data(false), "*E30*");
    assert_eq!(device.poll_data(false), END_OF_DATA);
}

#[tokio::test]
async fn pressure_trip_aborts_a_running_scan() {
    let mut device = quiet_device();
    configure_small_scan(&mut device, 20, 0);

    device.start("Ascans").await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    device.set_gas_pressure("N2", 1.0); // far above the trip threshold

    let joined = tokio::time::timeout(Duration::from_secs(5), device.stop_graceful(None))
        .await
        .expect("tripped worker must exit on its own");
    assert!(joined);

    let page = device.poll_data(true);
    assert!(page.contains("*E31*"), "expected pressure trip in {page:?}");
    assert!(!device.query_health().emission_ok);
}

#[tokio::test]
async fn pause_holds_at_cycle_boundaries_only() {
    let mut device = quiet_device();
    configure_small_scan(&mut device, 5, 0);

    device.start("Ascans").await;
    tokio::time::sleep(Duration::from_millis(40)).await;
    device.pause();

    // Give the worker time to finish its in-flight cycle and park.
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(device.scan_state(), ScanState::Paused);
    let held = device.queued_samples("Ascans");
    assert_eq!(held % 3, 0, "pause must land on a cycle boundary");

    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(device.queued_samples("Ascans"), held);

    device.resume();
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert!(device.queued_samples("Ascans") > held);

    device.stop_abort(None).await;
}

#[tokio::test]
async fn empty_poll_distinguishes_running_from_done() {
    let mut device = quiet_device();
    configure_small_scan(&mut device, 100, 1);

    device.start("Ascans").await;
    // First point needs a full dwell; the queue is still empty.
    assert_eq!(device.poll_data(false), "");

    device.stop_abort(None).await;
    device.poll_data(true); // drain whatever landed
    assert_eq!(device.poll_data(false), END_OF_DATA);
}

#[tokio::test]
async fn sweep_restores_foreground_output_variables() {
    let mut device = quiet_device();
    configure_small_scan(&mut device, 0, 1);
    device.set_mass(7.5);
    device.set_electron_energy(42.0);

    device.start("Ascans").await;
    device.stop_graceful(None).await;

    // The sweep drove the mass output up to 3.0, but the foreground values
    // come back once the worker exits.
    assert_eq!(device.mass(), 7.5);
    assert_eq!(device.electron_energy(), 42.0);
}
