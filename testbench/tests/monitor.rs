use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use seemon::layout::{dac, gen_conf};
use seemon::monitor::{FnRecovery, ImageProbe, ImageWrite, Recovery};
use seemon::{
    BitFlipMonitor, Chip, Image, MonitorConfig, MonitorEvent, PatternBuffer, Region,
    RegisterError, RegisterStore, Session, SessionConfig, SimulatedRegisterFile, StopReason,
    Transport, TransportError,
};
use testbench::{FlakyTransport, ScriptedTransport};

fn bounded(max_iterations: u64) -> MonitorConfig {
    MonitorConfig {
        interval: Duration::ZERO,
        max_iterations: Some(max_iterations),
        ..Default::default()
    }
}

fn bit_flips(events: &[MonitorEvent]) -> usize {
    events
        .iter()
        .filter(|event| matches!(event, MonitorEvent::BitFlip(_)))
        .count()
}

#[test]
fn set_then_serialize_places_value_at_field_address() {
    for layout in [gen_conf(), dac()] {
        let layout = Arc::new(layout);
        let mut store = RegisterStore::new(layout.clone());
        for field in layout.fields() {
            let address = field.addresses()[0];
            for value in 0..=field.max() {
                store.set(field.name(), value).unwrap();
                let bytes = store.serialize();
                let (_, byte) = bytes.iter().find(|&&(a, _)| a == address).unwrap();
                assert_eq!(u32::from(*byte), value, "{} = {value}", field.name());
            }
        }
    }
}

#[test]
fn out_of_range_values_are_rejected_without_mutation() {
    let mut store = RegisterStore::new(Arc::new(dac()));
    store.set("ITHR", 17).unwrap();
    let before = store.serialize();

    for field in dac().fields() {
        for value in [field.max() + 1, 0x1234, u32::MAX] {
            let err = store.set(field.name(), value).unwrap_err();
            assert!(matches!(err, RegisterError::ValueRange { .. }), "{err}");
            assert_eq!(store.serialize(), before);
        }
    }

    assert!(matches!(
        store.set("NOT_A_FIELD", 1),
        Err(RegisterError::InvalidField { .. })
    ));
    assert_eq!(store.serialize(), before);
}

#[test]
fn simulated_register_file_round_trip() {
    let mut regs = SimulatedRegisterFile::with_seed(0);
    for address in (0..=u16::MAX).step_by(97) {
        let value = (address as u8).wrapping_mul(31) ^ 0xA5;
        regs.write(address, value).unwrap();
        assert_eq!(regs.read(address).unwrap(), value);
    }
}

#[test]
fn certain_flip_changes_exactly_one_bit_reproducibly() {
    let observe = |seed| {
        let mut chip = Chip::with_seed(SimulatedRegisterFile::with_seed(0), seed);
        chip.write(0x0041, 52).unwrap();
        chip.set_flip_simulation(Some(1.0));
        let observed: Vec<u8> = (0..64).map(|_| chip.read(0x0041).unwrap()).collect();
        assert_eq!(chip.transport().get(0x0041), 52);
        observed
    };

    let first = observe(99);
    assert!(first.iter().all(|&value| (value ^ 52).count_ones() == 1));
    assert_eq!(first, observe(99));
}

#[test]
fn zero_probability_never_flips() {
    let mut regs = SimulatedRegisterFile::with_seed(4);
    regs.set(0x8040, 0x55);
    for _ in 0..1000 {
        assert_eq!(regs.read_observed(0x8040, true, 0.0), 0x55);
    }
    for _ in 0..100 {
        assert_ne!(regs.read_observed(0x8040, true, 1.0), 0x55);
    }
    assert_eq!(regs.get(0x8040), 0x55);
    assert_eq!(regs.injector().injected(), 100);
}

#[test]
fn single_transient_mismatch_reported_and_recovered_once() {
    const A: u16 = 0x00E0;
    let pattern = PatternBuffer::filled(Region::new("probe", vec![A]).unwrap(), 0x55);

    let transport = ScriptedTransport::new(SimulatedRegisterFile::with_seed(0));
    let mut chip = Chip::with_seed(transport, 0);
    chip.write_image(&pattern).unwrap();
    chip.transport_mut().script_reads(A, [0x57]);

    let calls = Rc::new(Cell::new(0));
    let counter = calls.clone();
    let reset = pattern.clone();
    let mut recoveries: Vec<Box<dyn Recovery<ScriptedTransport<SimulatedRegisterFile>>>> =
        vec![Box::new(FnRecovery::new(
            "reset",
            move |chip: &mut Chip<ScriptedTransport<SimulatedRegisterFile>>| -> seemon::Result<()> {
                counter.set(counter.get() + 1);
                chip.write_image(&reset)?;
                Ok(())
            },
        ))];

    let mut monitor = BitFlipMonitor::new(bounded(10));
    let mut events: Vec<MonitorEvent> = Vec::new();
    let report = monitor.start(
        &mut chip,
        &mut ImageProbe::new(pattern),
        &mut recoveries,
        &mut events,
    );

    assert_eq!(bit_flips(&events), 1);
    let summaries = events
        .iter()
        .filter(|event| matches!(event, MonitorEvent::Mismatch { .. }))
        .count();
    assert_eq!(summaries, 1);
    assert_eq!(calls.get(), 1);
    assert_eq!(report.recoveries, 1);
    assert_eq!(report.iterations, 10);
    let flip = events
        .iter()
        .find_map(|event| match event {
            MonitorEvent::BitFlip(flip) => Some(flip),
            _ => None,
        })
        .unwrap();
    assert_eq!((flip.iteration, flip.address), (1, A));
    assert_eq!((flip.expected, flip.observed), (0x55, 0x57));
    assert_eq!(flip.flipped_bits().collect::<Vec<_>>(), vec![1]);
    // initial pattern write plus one rewrite
    assert_eq!(chip.transport().writes(), 2);
    assert_eq!(chip.transport().inner().get(A), 0x55);
}

#[test]
fn failed_recovery_is_reported_and_later_recoveries_still_run() {
    type Regs = SimulatedRegisterFile;
    let pattern = PatternBuffer::filled(Region::contiguous("mon", 0x00E0, 4).unwrap(), 0x55);
    let mut chip = Chip::with_seed(SimulatedRegisterFile::with_seed(0), 0);
    chip.write_image(&pattern).unwrap();
    chip.transport_mut().upset(0x00E2, 0x80);

    let order = Rc::new(RefCell::new(Vec::new()));
    let failing = order.clone();
    let fixing = order.clone();
    let rewrite = pattern.clone();
    let mut recoveries: Vec<Box<dyn Recovery<Regs>>> = vec![
        Box::new(FnRecovery::new(
            "fail",
            move |_: &mut Chip<Regs>| -> seemon::Result<()> {
                failing.borrow_mut().push("fail");
                Err(TransportError::Protocol("bus stuck".into()).into())
            },
        )),
        Box::new(FnRecovery::new(
            "fix",
            move |chip: &mut Chip<Regs>| -> seemon::Result<()> {
                fixing.borrow_mut().push("fix");
                chip.write_image(&rewrite)?;
                Ok(())
            },
        )),
    ];

    let mut monitor = BitFlipMonitor::new(bounded(4));
    let mut events: Vec<MonitorEvent> = Vec::new();
    let report = monitor.start(
        &mut chip,
        &mut ImageProbe::new(pattern),
        &mut recoveries,
        &mut events,
    );

    assert_eq!(report.iterations, 4);
    assert_eq!(report.stop_reason, Some(StopReason::IterationLimit));
    assert_eq!(report.mismatched_iterations, 1);
    assert_eq!(report.recovery_failures, 1);
    assert_eq!(report.recoveries, 1);
    assert_eq!(*order.borrow(), vec!["fail", "fix"]);

    let outcomes: Vec<&MonitorEvent> = events
        .iter()
        .filter(|event| {
            matches!(
                event,
                MonitorEvent::Recovered { .. } | MonitorEvent::RecoveryFailed { .. }
            )
        })
        .collect();
    assert_eq!(outcomes.len(), 2);
    assert!(matches!(
        outcomes[0],
        MonitorEvent::RecoveryFailed { iteration: 1, recovery, error }
            if recovery == "fail" && error.contains("bus stuck")
    ));
    assert_eq!(
        outcomes[1],
        &MonitorEvent::Recovered {
            iteration: 1,
            recovery: "fix".into()
        }
    );
    assert_eq!(chip.transport().get(0x00E2), 0x55);
}

#[test]
fn transport_error_is_reported_and_loop_continues() {
    let pattern = PatternBuffer::filled(Region::contiguous("probe", 0x8040, 1).unwrap(), 0x55);
    let mut chip = Chip::with_seed(
        FlakyTransport::new(SimulatedRegisterFile::with_seed(0), [3]),
        0,
    );
    chip.write_image(&pattern).unwrap();

    let mut recoveries: Vec<Box<dyn Recovery<FlakyTransport<SimulatedRegisterFile>>>> =
        vec![Box::new(ImageWrite::new(pattern.clone()))];
    let mut monitor = BitFlipMonitor::new(bounded(6));
    let mut events: Vec<MonitorEvent> = Vec::new();
    let report = monitor.start(
        &mut chip,
        &mut ImageProbe::new(pattern),
        &mut recoveries,
        &mut events,
    );

    assert_eq!(report.iterations, 6);
    assert_eq!(report.read_failures, 1);
    assert_eq!(report.mismatched_iterations, 0);
    assert_eq!(report.recoveries, 0);
    assert_eq!(bit_flips(&events), 0);
    assert!(events.iter().any(|event| matches!(
        event,
        MonitorEvent::ReadFailed { iteration: 3, .. }
    )));
    assert_eq!(chip.transport().reads(), 6);
}

#[test]
fn failure_inside_multi_byte_read_skips_only_that_iteration() {
    let store = RegisterStore::new(Arc::new(dac()));
    // 15 reads per iteration, read 20 falls into iteration 2
    let mut chip = Chip::with_seed(
        FlakyTransport::new(SimulatedRegisterFile::with_seed(0), [20]),
        0,
    );
    chip.write_image(&store).unwrap();

    let mut monitor = BitFlipMonitor::new(bounded(4));
    let mut events: Vec<MonitorEvent> = Vec::new();
    let report = monitor.start(&mut chip, &mut ImageProbe::new(store), &mut [], &mut events);

    assert_eq!(report.read_failures, 1);
    assert_eq!(report.flips, 0);
    assert!(events.iter().any(|event| matches!(
        event,
        MonitorEvent::ReadFailed { iteration: 2, .. }
    )));
    assert_eq!(chip.transport().reads(), 15 + 5 + 15 + 15);
}

#[test]
fn bulk_writes_are_idempotent_across_sessions() {
    let configure = |seed: u64| {
        let config = SessionConfig::from_yaml(&format!(
            "bus: i2c\ntarget: mfe\npattern: 0x3C\nseed: {seed}\ndac: {{VCASN2: 90}}"
        ))
        .unwrap();
        let mut session = Session::new(config).unwrap();
        session.configure().unwrap();
        let first = session.chip().transport().regs().bytes().to_vec();
        session.configure().unwrap();
        assert_eq!(session.chip().transport().regs().bytes(), first.as_slice());
        first
    };

    assert_eq!(configure(1), configure(2));
}

#[test]
fn cancellation_from_another_thread_stops_session() {
    let config = SessionConfig::from_yaml("target: dac\ninterval_ms: 1\nseed: 8").unwrap();
    let mut session = Session::new(config).unwrap();
    session.configure().unwrap();

    let token = session.cancel_token();
    let canceller = thread::spawn(move || {
        thread::sleep(Duration::from_millis(30));
        token.cancel();
    });

    let report = session.run(&mut Vec::<MonitorEvent>::new());
    canceller.join().unwrap();

    assert_eq!(report.stop_reason, Some(StopReason::Cancelled));
    assert!(report.iterations > 0);
    assert_eq!(report.flips, 0);
}
