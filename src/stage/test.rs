use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use crate::{
    axis::Axis,
    backend::{Mock, MockStage, Transcript},
    error::*,
    stage::{Motion, Stage},
    transport::{Timing, Transport},
};

const TIMEOUT: Duration = Duration::from_secs(5);

fn open(backend: Mock, address: &str) -> Stage<Mock> {
    let timing = Timing {
        settle_delay: Duration::ZERO,
        response_timeout: Duration::from_millis(50),
    };
    let transport = Transport::open(backend, timing).unwrap();
    Stage::new(transport, address, Duration::from_millis(1))
}

fn connect(sim: &MockStage) -> (Stage<Mock>, Transcript) {
    let backend = sim.backend();
    let transcript = backend.transcript();
    (open(backend, "2H"), transcript)
}

#[test]
fn read_position_converts_and_caches() {
    let sim = MockStage::new();
    sim.set_position(Axis::X, 10.0);
    sim.set_position(Axis::Y, -3.25);
    let (stage, transcript) = connect(&sim);

    assert_eq!(stage.axis_state(Axis::X).position, None);
    assert_eq!(stage.read_position(Axis::X).unwrap(), 10.0);
    assert_eq!(stage.read_position(Axis::Y).unwrap(), -3.25);
    assert_eq!(transcript.commands(), ["2HW X", "2HW Y"]);
    assert_eq!(stage.axis_state(Axis::X).position, Some(10.0));
    assert_eq!(stage.axis_state(Axis::Y).position, Some(-3.25));
}

#[test]
fn read_position_rejects_garbage() {
    let mut mock = Mock::new();
    mock.push_reply(b":A lots\r\n\x03");
    let stage = open(mock, "2H");
    assert!(matches!(
        stage.read_position(Axis::X),
        Err(StageError::ProtocolViolation(_))
    ));
    assert_eq!(stage.axis_state(Axis::X).position, None);
}

#[test]
fn status_token() {
    let sim = MockStage::new();
    let (stage, transcript) = connect(&sim);
    sim.set_busy_polls(1);
    assert_eq!(stage.status().unwrap(), Motion::Busy);
    assert!(!stage.is_busy().unwrap());
    assert_eq!(transcript.commands(), ["2H/", "2H/"]);

    let mut mock = Mock::new();
    mock.push_reply(b"Q\r\n\x03");
    let stage = open(mock, "2H");
    assert!(matches!(
        stage.is_busy(),
        Err(StageError::ProtocolViolation(_))
    ));
}

#[test]
fn move_absolute_and_wait_end_to_end() {
    let sim = MockStage::new();
    sim.set_position(Axis::X, 10.0);
    sim.set_busy_polls_per_move(3);
    let (stage, transcript) = connect(&sim);

    stage.move_absolute_and_wait(Axis::X, 12.5, TIMEOUT).unwrap();
    assert_eq!(
        transcript.commands(),
        ["2HW X", "2HM X= 125000", "2H/", "2H/", "2H/", "2H/"]
    );
    assert_eq!(stage.axis_state(Axis::X).target, Some(12.5));
    assert_eq!(stage.read_position(Axis::X).unwrap(), 12.5);
}

#[test]
fn move_absolute_and_wait_is_idempotent() {
    let sim = MockStage::new();
    sim.set_position(Axis::Y, 1.0);
    let (stage, transcript) = connect(&sim);

    stage.move_absolute_and_wait(Axis::Y, 2.0, TIMEOUT).unwrap();
    assert_eq!(transcript.count_starting_with("2HM"), 1);
    transcript.clear();

    stage.move_absolute_and_wait(Axis::Y, 2.0, TIMEOUT).unwrap();
    // Within a tenth of a micrometre is the same target.
    stage.move_absolute_and_wait(Axis::Y, 2.000_01, TIMEOUT).unwrap();
    assert_eq!(transcript.commands(), ["2HW Y", "2HW Y"]);
}

#[test]
fn moves_apply_encoding_correction() {
    let sim = MockStage::new();
    let (stage, transcript) = connect(&sim);

    stage.move_absolute(Axis::X, 0.0003).unwrap();
    stage.move_relative(Axis::Y, -0.0013).unwrap();
    stage.move_relative(Axis::Y, 1.2343).unwrap();
    assert_eq!(
        transcript.commands(),
        ["2HM X= 4", "2HR Y=-12", "2HR Y=12344"]
    );
    assert_eq!(sim.units(Axis::X), 4);
    assert_eq!(sim.units(Axis::Y), 12_332);
}

#[test]
fn zero_relative_move_sends_nothing() {
    let sim = MockStage::new();
    let (stage, transcript) = connect(&sim);

    stage.move_relative(Axis::X, 0.0).unwrap();
    stage.move_relative_and_wait(Axis::X, 0.0, TIMEOUT).unwrap();
    stage.correct_backlash(Axis::X, 0.0, TIMEOUT).unwrap();
    // Less than half a device unit rounds to no move at all.
    stage.move_relative(Axis::X, 0.000_01).unwrap();
    stage.move_relative(Axis::Y, -0.000_04).unwrap();
    stage.move_relative_and_wait(Axis::X, 0.000_01, TIMEOUT).unwrap();
    stage.correct_backlash(Axis::X, 0.000_01, TIMEOUT).unwrap();
    assert!(transcript.is_empty());
    assert_eq!(stage.axis_state(Axis::X).target, None);
}

#[test]
fn unencodable_values_are_rejected_before_sending() {
    let sim = MockStage::new();
    sim.set_position(Axis::X, 1.0);
    let (stage, transcript) = connect(&sim);

    for value in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
        let results = [
            stage.move_absolute(Axis::X, value),
            stage.move_relative(Axis::X, value),
            stage.move_absolute_and_wait(Axis::X, value, TIMEOUT),
            stage.move_relative_and_wait(Axis::X, value, TIMEOUT),
            stage.correct_backlash(Axis::X, value, TIMEOUT),
            stage.set_speed(&[(Axis::X, value)]),
            stage.set_acceleration(&[(Axis::X, value)]),
            stage.set_backlash(&[(Axis::X, value)]),
            stage.set_soft_limits(&[(Axis::X, -1.0, value)]),
            stage.is_at(Axis::X, value).map(drop),
        ];
        for result in results {
            assert!(
                matches!(result, Err(StageError::InvalidArgument(_))),
                "{value}: {result:?}"
            );
        }
    }
    // Finite but too far to count in device units.
    let results = [
        stage.move_absolute(Axis::X, 1e300),
        stage.move_relative(Axis::X, -1e300),
        stage.set_backlash(&[(Axis::X, 1e300)]),
    ];
    for result in results {
        assert!(matches!(result, Err(StageError::InvalidArgument(_))), "{result:?}");
    }
    assert!(transcript.is_empty());
    assert_eq!(sim.units(Axis::X), 10_000);
    assert_eq!(stage.axis_state(Axis::X).target, None);
    assert_eq!(stage.axis_state(Axis::X).speed, None);
}

#[test]
fn move_relative_and_wait_polls_until_idle() {
    let sim = MockStage::new();
    sim.set_position(Axis::X, 1.0);
    sim.set_busy_polls_per_move(2);
    let (stage, transcript) = connect(&sim);

    stage.read_position(Axis::X).unwrap();
    stage
        .move_relative_and_wait(Axis::X, -0.5, TIMEOUT)
        .unwrap();
    assert_eq!(
        transcript.commands(),
        ["2HW X", "2HR X=-5000", "2H/", "2H/", "2H/"]
    );
    assert_eq!(sim.position(Axis::X), 0.5);
    assert_eq!(stage.axis_state(Axis::X).target, Some(0.5));
}

#[test]
fn wait_times_out_when_never_idle() {
    let sim = MockStage::new();
    let (stage, _) = connect(&sim);
    sim.set_busy_polls(u32::MAX);

    let err = stage.wait_until_idle(Duration::from_millis(20)).unwrap_err();
    assert!(err.is_timeout());
    let err = TimeoutError::try_from(err).unwrap();
    assert_eq!(err.waiting_for(), WaitingFor::Idle);
    assert_eq!(err.timeout(), Duration::from_millis(20));
}

#[test]
fn device_rejection_is_reported() {
    let sim = MockStage::new();
    let (stage, _) = connect(&sim);

    sim.reject_next(":AERR0");
    let err = stage.move_absolute(Axis::X, 5.0).unwrap_err();
    assert_eq!(
        DeviceProtocolError::try_from(err).unwrap().response(),
        ":AERR0"
    );
    assert_eq!(stage.axis_state(Axis::X).target, None);
    assert_eq!(sim.position(Axis::X), 0.0);
}

#[test]
fn halt_clears_targets() {
    let sim = MockStage::new();
    let (stage, transcript) = connect(&sim);
    sim.set_busy_polls_per_move(100);

    stage.move_absolute(Axis::X, 3.0).unwrap();
    assert!(stage.is_busy().unwrap());
    stage.halt().unwrap();
    assert!(!stage.is_busy().unwrap());
    assert_eq!(stage.axis_state(Axis::X).target, None);
    assert_eq!(transcript.count_starting_with("2HHALT"), 1);

    // Halting while idle is harmless.
    stage.halt().unwrap();
}

#[test]
fn home_zeroes_requested_axes() {
    let sim = MockStage::new();
    sim.set_position(Axis::X, 4.0);
    sim.set_position(Axis::Y, 5.0);
    sim.set_position(Axis::Z, 6.0);
    let (stage, transcript) = connect(&sim);

    stage.read_position(Axis::X).unwrap();
    stage.home(&[Axis::X, Axis::Y]).unwrap();
    stage.home(&[]).unwrap();
    assert_eq!(transcript.commands(), ["2HW X", "2HHOME X Y"]);
    assert_eq!(stage.axis_state(Axis::X).position, None);
    assert_eq!(sim.position(Axis::X), 0.0);
    assert_eq!(sim.position(Axis::Y), 0.0);
    assert_eq!(sim.position(Axis::Z), 6.0);
}

#[test]
fn parameter_setters() {
    let sim = MockStage::new();
    let (stage, transcript) = connect(&sim);

    stage.set_speed(&[(Axis::X, 5.0), (Axis::Y, 2.5)]).unwrap();
    stage.set_acceleration(&[(Axis::X, 50.0)]).unwrap();
    stage.set_backlash(&[(Axis::X, 0.0013), (Axis::Y, 0.0)]).unwrap();
    stage.set_speed(&[]).unwrap();
    assert_eq!(
        transcript.commands(),
        [
            "2HSPEED X=5.0000 Y=2.5000",
            "2HAC X=50.0000",
            "2HB X=0.0014 Y=0.0000",
        ]
    );

    assert_eq!(sim.speed(Axis::X), 5.0);
    assert_eq!(sim.speed(Axis::Y), 2.5);
    assert_eq!(sim.acceleration(Axis::X), 50.0);
    assert_eq!(sim.backlash(Axis::X), 0.0014);
    assert_eq!(sim.backlash(Axis::Y), 0.0);

    let state = stage.axis_state(Axis::X);
    assert_eq!(state.speed, Some(5.0));
    assert_eq!(state.acceleration, Some(50.0));
    assert_eq!(state.backlash, Some(0.0013));
    assert_eq!(stage.axis_state(Axis::Z).speed, None);
}

#[test]
fn soft_limits_send_lower_then_upper() {
    let sim = MockStage::new();
    let (stage, transcript) = connect(&sim);

    stage
        .set_soft_limits(&[(Axis::X, -50.0, 50.0), (Axis::Y, -20.0003, 30.0)])
        .unwrap();
    assert_eq!(
        transcript.commands(),
        [
            "2HSL X=-50.0000 Y=-20.0002",
            "2HSU X=50.0000 Y=30.0000",
        ]
    );
    assert_eq!(sim.limits(Axis::X), (-50.0, 50.0));
    assert_eq!(sim.limits(Axis::Y), (-20.0002, 30.0));
}

#[test]
fn query_speed_parses_reply() {
    let sim = MockStage::new();
    let (stage, transcript) = connect(&sim);
    stage.set_speed(&[(Axis::Y, 1.5)]).unwrap();

    let speeds = stage.query_speed(&[Axis::X, Axis::Y]).unwrap();
    assert_eq!(speeds, [(Axis::X, 7.0), (Axis::Y, 1.5)]);
    assert_eq!(transcript.commands()[1], "2HSPEED X? Y?");
    assert_eq!(stage.axis_state(Axis::X).speed, Some(7.0));

    let mut mock = Mock::new();
    mock.push_reply(b":A X=fast\r\n\x03");
    let stage = open(mock, "2H");
    assert!(matches!(
        stage.query_speed(&[Axis::X]),
        Err(StageError::ProtocolViolation(_))
    ));
}

#[test]
fn correct_backlash_moves_out_and_back() {
    let sim = MockStage::new();
    sim.set_position(Axis::X, 5.0);
    let (stage, transcript) = connect(&sim);

    stage.correct_backlash(Axis::X, 0.02, TIMEOUT).unwrap();
    assert_eq!(
        transcript.commands(),
        ["2HR X=-200", "2H/", "2HR X=200", "2H/"]
    );
    assert_eq!(sim.position(Axis::X), 5.0);
}

#[test]
fn correct_backlash_is_not_interleaved_with_other_threads() {
    let sim = MockStage::new();
    sim.set_position(Axis::X, 5.0);
    sim.set_busy_polls_per_move(2);
    let (stage, transcript) = connect(&sim);
    let stage = Arc::new(stage);
    let done = Arc::new(AtomicBool::new(false));

    let reader = {
        let stage = Arc::clone(&stage);
        let done = Arc::clone(&done);
        thread::spawn(move || {
            let mut reads = 0;
            while !done.load(Ordering::Relaxed) {
                stage.read_position(Axis::Y).unwrap();
                reads += 1;
            }
            reads
        })
    };
    while transcript.is_empty() {
        thread::yield_now();
    }
    stage.correct_backlash(Axis::X, 0.02, TIMEOUT).unwrap();
    done.store(true, Ordering::Relaxed);
    assert!(reader.join().unwrap() > 0);

    let commands = transcript.commands();
    let start = commands
        .iter()
        .position(|command| command == "2HR X=-200")
        .unwrap();
    assert_eq!(
        commands[start..start + 8],
        [
            "2HR X=-200",
            "2H/",
            "2H/",
            "2H/",
            "2HR X=200",
            "2H/",
            "2H/",
            "2H/",
        ]
    );
    assert!(!transcript.interleaved());
}

#[test]
fn custom_address() {
    let sim = MockStage::with_address("1H");
    sim.set_position(Axis::Z, 0.25);
    let backend = sim.backend();
    let transcript = backend.transcript();
    let stage = open(backend, "1H");

    assert_eq!(stage.address(), "1H");
    assert_eq!(stage.read_position(Axis::Z).unwrap(), 0.25);
    assert_eq!(transcript.commands(), ["1HW Z"]);
}
