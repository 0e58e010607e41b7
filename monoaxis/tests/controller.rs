//! End-to-end controller runs against the software drive, with the real
//! realtime thread and cycle timer.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use monoaxis::bus::sim::SimBus;
use monoaxis::bus::AlState;
use monoaxis::trajectory::MotionPhase;
use monoaxis::{ControlMode, Controller, ControllerConfig, MotionCommand};
use monoaxis_shared::COUNTS_PER_DEGREE;

#[test]
fn full_move_completes_and_returns_the_bus_to_init() {
    let sim = SimBus::starting_at(0);
    let controller = Controller::new(sim, ControllerConfig::new(ControlMode::Position));
    let shared = controller.shared();

    // Stop the controller once the move has gone through a motion phase
    // and parked again.
    let watcher = thread::spawn({
        let shared = Arc::clone(&shared);
        move || {
            let mut seen_moving = false;
            let deadline = Instant::now() + Duration::from_secs(20);
            while Instant::now() < deadline {
                let phase = shared.motion_phase();
                if phase != MotionPhase::Idle {
                    seen_moving = true;
                } else if seen_moving {
                    break;
                }
                thread::sleep(Duration::from_millis(5));
            }
            shared.request_stop();
            seen_moving
        }
    });

    let target = (2.0 * COUNTS_PER_DEGREE) as i64;
    let bus = controller
        .run(MotionCommand::MoveTo {
            target_counts: target,
            max_velocity: 360.0 * COUNTS_PER_DEGREE,
            acceleration: 3600.0 * COUNTS_PER_DEGREE,
        })
        .expect("controller run");

    assert!(watcher.join().unwrap(), "move never left Idle");

    // Cooperative shutdown ends with an INIT request before the session
    // is dropped.
    assert_eq!(bus.al_state(), AlState::Init);

    // The simulated axis parks within half a cycle of travel of the
    // commanded target.
    let landed = bus.position() as i64;
    assert!(
        (landed - target).abs() < 1_000,
        "landed {landed}, target {target}"
    );

    assert!(shared.bus_operational());
    assert!(shared.drive_operational());
    assert!(!shared.fault_detected());
}

#[test]
fn stop_mid_move_exits_promptly_and_cleanly() {
    let sim = SimBus::starting_at(0);
    let controller = Controller::new(sim, ControllerConfig::new(ControlMode::Position));
    let shared = controller.shared();

    let watcher = thread::spawn({
        let shared = Arc::clone(&shared);
        move || {
            let deadline = Instant::now() + Duration::from_secs(20);
            while Instant::now() < deadline {
                if shared.motion_phase() == MotionPhase::Cruising {
                    break;
                }
                thread::sleep(Duration::from_millis(2));
            }
            let stop_requested_at = Instant::now();
            shared.request_stop();
            stop_requested_at
        }
    });

    // A long move: a full hour of cruising, far longer than the test.
    let bus = controller
        .run(MotionCommand::MoveTo {
            target_counts: (360_000.0 * COUNTS_PER_DEGREE) as i64,
            max_velocity: 100.0 * COUNTS_PER_DEGREE,
            acceleration: 3600.0 * COUNTS_PER_DEGREE,
        })
        .expect("controller run");

    let stop_requested_at = watcher.join().unwrap();

    // The realtime loop exits within a couple of cycles of the stop flag;
    // the supervisor needs at most one status period plus the join on top.
    assert!(stop_requested_at.elapsed() < Duration::from_secs(1));
    assert_eq!(bus.al_state(), AlState::Init);
}
