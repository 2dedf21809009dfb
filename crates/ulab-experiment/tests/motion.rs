//! Motion sequences against a simulated stage controller.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use ulab_core::{Completion, UlabError};
use ulab_experiment::{DirectedMove, MotionSequencer, MotionState, Well};
use ulab_hardware::{GridPos, Ulab};
use ulab_protocol::command::stage_op;
use ulab_protocol::{Axis, DeviceCode, Frame, FrameCodec};

/// Frames the controller received, in arrival order.
type Received = Arc<Mutex<Vec<Frame>>>;

fn stage_op_of(frame: &Frame) -> Option<(DeviceCode, Axis, u8)> {
    let device = DeviceCode::from_u8(frame.device_id()).filter(|d| d.is_stage())?;
    Axis::ALL.into_iter().find_map(|axis| {
        let offset = frame.opcode().checked_sub(axis.base())?;
        (offset < 8).then_some((device, axis, offset))
    })
}

/// Answers GetPosition with the last Goto target of the axis when
/// `responsive`, and stays silent otherwise.
async fn simulate(mut io: DuplexStream, received: Received, responsive: bool) {
    let mut codec = FrameCodec::new();
    let mut targets: HashMap<(DeviceCode, Axis), u16> = HashMap::new();
    let mut buf = [0u8; 256];
    loop {
        let n = match io.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        codec.extend(&buf[..n]);
        for frame in codec.drain_frames() {
            received.lock().unwrap().push(frame);
            let Some((device, axis, offset)) = stage_op_of(&frame) else {
                continue;
            };
            match offset {
                stage_op::GOTO => {
                    targets.insert((device, axis), frame.content());
                }
                stage_op::HOME => {
                    targets.insert((device, axis), 0);
                }
                stage_op::GET_POSITION if responsive => {
                    let position = targets.get(&(device, axis)).copied().unwrap_or(0);
                    let reply = Frame::with_content(frame.opcode(), frame.device_id(), position);
                    if io.write_all(reply.as_bytes()).await.is_err() {
                        return;
                    }
                }
                _ => {}
            }
        }
    }
}

fn instrument(responsive: bool) -> (Arc<Ulab>, Received) {
    let ulab = Arc::new(Ulab::default());
    let (controller, port) = tokio::io::duplex(4096);
    let received = Received::default();
    tokio::spawn(simulate(controller, Arc::clone(&received), responsive));
    ulab.attach("sim", port);
    (ulab, received)
}

fn gotos(received: &Received, axis: Axis) -> Vec<u16> {
    received
        .lock()
        .unwrap()
        .iter()
        .filter_map(|frame| match stage_op_of(frame) {
            Some((_, a, stage_op::GOTO)) if a == axis => Some(frame.content()),
            _ => None,
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn serpentine_visits_every_well_once() {
    let (ulab, received) = instrument(true);
    let motion = MotionSequencer::new(Arc::clone(&ulab));

    let report = motion
        .full_plate_traversal(DeviceCode::LowStage, Duration::from_millis(200))
        .await
        .unwrap();

    assert_eq!(report.completion, Completion::Finished);
    assert_eq!(report.visited.len(), 96);
    assert_eq!(report.visited.first(), Some(&Well::new(0, 0)));
    assert_eq!(report.visited.last().map(ToString::to_string).as_deref(), Some("H1"));
    let unique: HashSet<_> = report.visited.iter().collect();
    assert_eq!(unique.len(), 96);

    let row_b: Vec<u16> = report
        .visited
        .iter()
        .filter(|w| w.row == 1)
        .map(|w| w.col)
        .collect();
    assert_eq!(row_b, (0..12).rev().collect::<Vec<_>>());

    assert_eq!(ulab.position(DeviceCode::LowStage), GridPos::new(0, 7));
    assert_eq!(motion.state(), MotionState::Done);

    // A1 first, then one X move per row.
    let x = gotos(&received, Axis::X);
    assert_eq!(x.len(), 1 + 8);
    assert_eq!(x[0], 14_000);
    assert_eq!(x[8], 14_000 + 7 * 4500);
    let y = gotos(&received, Axis::Y);
    assert_eq!(y[0], 50_000);
    assert_eq!(y.len(), 96);

    ulab.close_port().await;
}

#[tokio::test(start_paused = true)]
async fn silent_controller_fails_a1_after_retries() {
    let (ulab, received) = instrument(false);
    let motion = MotionSequencer::new(Arc::clone(&ulab));

    let err = motion
        .full_plate_traversal(DeviceCode::HighStage, Duration::ZERO)
        .await
        .unwrap_err();
    match err {
        UlabError::PositionTimeout {
            device,
            axis,
            target_um,
            last_seen_um,
        } => {
            assert_eq!(device, DeviceCode::HighStage);
            assert_eq!(axis, Axis::X);
            assert_eq!(target_um, 10_000);
            assert_eq!(last_seen_um, None);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(motion.state(), MotionState::Aborted);
    assert_eq!(gotos(&received, Axis::X).len(), 3);
    assert_eq!(ulab.position(DeviceCode::HighStage), GridPos::UNSET);

    ulab.close_port().await;
}

#[tokio::test(start_paused = true)]
async fn emergency_stop_cancels_traversal() {
    let (ulab, _received) = instrument(true);
    let motion = Arc::new(MotionSequencer::new(Arc::clone(&ulab)));

    let runner = Arc::clone(&motion);
    let handle = tokio::spawn(async move {
        runner
            .full_plate_traversal(DeviceCode::LowStage, Duration::from_secs(2))
            .await
    });
    tokio::time::sleep(Duration::from_secs(30)).await;
    ulab.emergency_stop();

    let report = handle.await.unwrap().unwrap();
    assert_eq!(report.completion, Completion::Cancelled);
    assert!(!report.visited.is_empty());
    assert!(report.visited.len() < 96);
    assert_eq!(motion.state(), MotionState::Aborted);

    ulab.close_port().await;
}

#[tokio::test(start_paused = true)]
async fn directed_move_dips_z_at_each_cell() {
    let (ulab, received) = instrument(true);
    let motion = MotionSequencer::new(Arc::clone(&ulab));

    let completion = motion
        .directed_move(DirectedMove {
            device: DeviceCode::LowStage,
            start: GridPos::ORIGIN,
            axis: Axis::X,
            positive: true,
            steps: 2,
            dwell: Duration::from_millis(300),
        })
        .await
        .unwrap();
    assert_eq!(completion, Completion::Finished);
    assert_eq!(ulab.position(DeviceCode::LowStage), GridPos::new(2, 0));
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(gotos(&received, Axis::X), vec![4500, 9000]);
    assert_eq!(gotos(&received, Axis::Z), vec![30_000, 0, 30_000, 0]);
    assert!(gotos(&received, Axis::Y).is_empty());

    ulab.close_port().await;
}

#[tokio::test(start_paused = true)]
async fn directed_move_stops_at_plate_edge() {
    let (ulab, received) = instrument(true);
    let motion = MotionSequencer::new(Arc::clone(&ulab));

    let err = motion
        .directed_move(DirectedMove {
            device: DeviceCode::LowStage,
            start: GridPos::new(10, 3),
            axis: Axis::X,
            positive: true,
            steps: 3,
            dwell: Duration::ZERO,
        })
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        UlabError::OutOfBounds {
            col: 12,
            row: 3,
            ..
        }
    ));
    assert_eq!(ulab.position(DeviceCode::LowStage), GridPos::new(11, 3));
    tokio::time::sleep(Duration::from_secs(1)).await;

    // Calibration to (10,3), then a single successful step.
    assert_eq!(gotos(&received, Axis::X), vec![45_000, 49_500]);
    assert_eq!(gotos(&received, Axis::Y), vec![3 * 4500]);

    ulab.close_port().await;
}

#[tokio::test(start_paused = true)]
async fn stop_during_a1_confirmation_is_observed_promptly() {
    let (ulab, received) = instrument(false);
    let motion = Arc::new(MotionSequencer::new(Arc::clone(&ulab)));

    let runner = Arc::clone(&motion);
    let handle = tokio::spawn(async move {
        runner
            .full_plate_traversal(DeviceCode::LowStage, Duration::ZERO)
            .await
    });
    // Both A1 settles are over; the X confirmation is running.
    tokio::time::sleep(Duration::from_millis(10_500)).await;
    let stopped_at = tokio::time::Instant::now();
    let stopper = Arc::clone(&ulab);
    tokio::spawn(async move { stopper.stop_all_devices().await });

    let report = handle.await.unwrap().unwrap();
    assert!(stopped_at.elapsed() <= Duration::from_millis(200));
    assert_eq!(report.completion, Completion::Cancelled);
    assert!(report.visited.is_empty());
    assert_eq!(motion.state(), MotionState::Aborted);

    // Only the pump stops follow the stop; no more position polls.
    tokio::time::sleep(Duration::from_secs(2)).await;
    let after_stop: Vec<Frame> = {
        let frames = received.lock().unwrap();
        let last_stop = frames
            .iter()
            .rposition(|f| f.opcode() == ulab_protocol::op::PIPETTE_ROTATE)
            .unwrap();
        frames[last_stop + 1..].to_vec()
    };
    assert!(after_stop.is_empty());

    ulab.close_port().await;
}
