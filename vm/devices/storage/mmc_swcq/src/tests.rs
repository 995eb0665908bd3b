// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.


use crate::CommandError;
use crate::DeviceInfo;
use crate::Direction;
use crate::DisableError;
use crate::EnableError;
use crate::HistoryEvent;
use crate::Mode;
use crate::RecoveryState;
use crate::Request;
use crate::RequestError;
use crate::SoftwareQueue;
use crate::SubmitError;
use crate::SwcqConfig;
use crate::WaitIdleError;
use emulated_card::EmulatedCard;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;
use tracing::metadata::LevelFilter;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::prelude::*;

const BLOCKS: u16 = 8;

/// Initializes `tracing` once per test process.
fn init_tracing() {
    static ONCE: std::sync::Once = std::sync::Once::new();

    ONCE.call_once(|| {
        let targets = if let Ok(var) = std::env::var("RUST_LOG") {
            var.parse::<Targets>().unwrap()
        } else {
            Targets::new().with_default(LevelFilter::DEBUG)
        };
        tracing_subscriber::fmt()
            .with_ansi(false)
            .log_internal_errors(true)
            .with_test_writer()
            .with_max_level(LevelFilter::TRACE)
            .finish()
            .with(targets)
            .init();
    });
}

/// Never ticks the arbiter, so modes only change when a test forces them.
fn test_config() -> SwcqConfig {
    SwcqConfig {
        check_interval: Duration::from_secs(3600),
        stuck_threshold: Duration::from_secs(5),
        disable_timeout: Duration::from_millis(50),
        reset_settle_delay: Duration::ZERO,
        ..Default::default()
    }
}

/// Polls `condition` until it holds, failing the test after ten seconds.
fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(1));
    }
}

fn device(cmdq_depth: usize) -> DeviceInfo {
    DeviceInfo {
        rca: 1,
        cmdq_depth,
        block_addressed: true,
        part_config: 0,
        cmdq_enabled: false,
    }
}

type Completed = (u8, Result<(), RequestError>);

/// Collects request continuations.
struct Results {
    send: flume::Sender<Completed>,
    recv: flume::Receiver<Completed>,
}

impl Results {
    fn new() -> Self {
        let (send, recv) = flume::unbounded();
        Self { send, recv }
    }

    fn request(&self, tag: u8, direction: Direction, lba: u32) -> Request {
        let send = self.send.clone();
        Request::new(tag, direction, lba, BLOCKS, move |result| {
            send.send((tag, result)).unwrap();
        })
    }

    fn collect(&self, count: usize) -> BTreeMap<u8, Result<(), RequestError>> {
        let mut results = BTreeMap::new();
        for _ in 0..count {
            let (tag, result) = self
                .recv
                .recv_timeout(Duration::from_secs(30))
                .expect("request did not complete");
            assert!(
                results.insert(tag, result).is_none(),
                "tag {tag} completed twice"
            );
        }
        results
    }
}

fn assert_all_ok(results: &BTreeMap<u8, Result<(), RequestError>>) {
    for (tag, result) in results {
        assert!(result.is_ok(), "tag {tag} failed: {result:?}");
    }
}

struct Fixture {
    card: Arc<EmulatedCard>,
    queue: SoftwareQueue,
    results: Results,
}

impl Fixture {
    /// Creates a queue that has not been enabled.
    fn build(doorbell: bool, config: SwcqConfig) -> Self {
        init_tracing();
        let card = EmulatedCard::new(doorbell);
        let queue = SoftwareQueue::new(card.clone(), config).unwrap();
        Self {
            card,
            queue,
            results: Results::new(),
        }
    }

    fn new(doorbell: bool, config: SwcqConfig, device: DeviceInfo) -> Self {
        let fixture = Self::build(doorbell, config);
        fixture.queue.enable(Some(&device)).unwrap();
        fixture
    }

    fn hsq() -> Self {
        Self::new(true, test_config(), device(16))
    }

    fn cmdq() -> Self {
        let fixture = Self::hsq();
        assert!(fixture.queue.diagnostics().force_mode(Mode::Cmdq));
        fixture
    }

    fn submit(&self, tag: u8, direction: Direction, lba: u32) {
        self.queue
            .submit(self.results.request(tag, direction, lba))
            .unwrap();
    }

    fn collect(&self, count: usize) -> BTreeMap<u8, Result<(), RequestError>> {
        self.results.collect(count)
    }
}

#[test]
fn hsq_dispatches_in_arrival_order() {
    let fixture = Fixture::hsq();
    fixture.card.pause();
    for tag in [9, 3, 6, 1] {
        fixture.submit(tag, Direction::Write, u32::from(tag) * 100);
    }
    fixture.card.resume();
    assert_all_ok(&fixture.collect(4));

    let order: Vec<_> = fixture
        .card
        .executed()
        .iter()
        .map(|&(_, address)| address)
        .collect();
    assert_eq!(order, [900, 300, 600, 100]);

    let dispatched: Vec<_> = fixture
        .queue
        .diagnostics()
        .history()
        .iter()
        .filter(|entry| entry.event == HistoryEvent::HsqDispatch)
        .map(|entry| entry.tag)
        .collect();
    assert_eq!(dispatched, [Some(9), Some(3), Some(6), Some(1)]);
    assert!(!fixture.card.cmdq_enabled());
}

#[test]
fn cmdq_runs_more_requests_than_tasks() {
    let fixture = Fixture::cmdq();
    for tag in 0..20 {
        fixture.submit(tag, Direction::Read, u32::from(tag) * 64);
    }
    assert_all_ok(&fixture.collect(20));
    fixture.queue.wait_for_idle().unwrap();

    let diagnostics = fixture.queue.diagnostics();
    let snapshot = diagnostics.snapshot();
    assert_eq!(snapshot.device_mode, Mode::Cmdq);
    assert_eq!(snapshot.depth, 16);
    assert!(fixture.card.cmdq_enabled());
    assert_eq!(fixture.card.executed().len(), 20);
    assert_eq!(fixture.card.resets(), 0);

    let executes = diagnostics
        .history()
        .iter()
        .filter(|entry| matches!(entry.event, HistoryEvent::Execute { .. }))
        .count();
    assert_eq!(executes, 20);
}

#[test]
fn cmdq_uses_every_task_id() {
    let fixture = Fixture::new(true, test_config(), device(32));
    assert!(fixture.queue.diagnostics().force_mode(Mode::Cmdq));
    fixture.card.pause();
    for tag in 0..40 {
        fixture.submit(tag, Direction::Read, u32::from(tag) * 16);
    }
    let snapshot = fixture.queue.diagnostics().snapshot();
    assert_eq!(snapshot.tagged, 32);
    assert_eq!(snapshot.queued, 8);
    fixture.card.resume();
    assert_all_ok(&fixture.collect(40));
    fixture.queue.wait_for_idle().unwrap();
    assert_eq!(fixture.card.executed().len(), 40);
    assert_eq!(fixture.card.resets(), 0);
}

#[test]
fn arbiter_switches_modes_once_drained() {
    let fixture = Fixture::new(
        true,
        SwcqConfig {
            check_interval: Duration::from_millis(10),
            ..test_config()
        },
        device(16),
    );
    let diagnostics = fixture.queue.diagnostics();
    fixture.card.set_latency(Duration::from_millis(5));

    // Two interleaved sequential streams look random once sorted.
    for tag in 0..40 {
        let stream = if tag % 2 == 0 { 0 } else { 0x10000 };
        fixture.submit(tag, Direction::Read, stream + u32::from(tag / 2) * 8);
    }
    wait_until("command queue mode", || diagnostics.mode() == Mode::Cmdq);
    let to_cmdq = HistoryEvent::ModeChange {
        from: Mode::Hsq,
        to: Mode::Cmdq,
    };
    assert!(diagnostics
        .history()
        .iter()
        .any(|entry| entry.event == to_cmdq));
    assert_all_ok(&fixture.collect(40));
    fixture.queue.wait_for_idle().unwrap();
    assert!(fixture.card.mode_switches().iter().any(|switch| switch.enable));

    // Leave command queue mode while tasks are still on the card.
    assert!(diagnostics.force_mode(Mode::Cmdq));
    fixture.card.pause();
    for tag in 40..44 {
        fixture.submit(tag, Direction::Read, u32::from(tag) * 64);
    }
    assert_eq!(diagnostics.snapshot().tagged, 4);
    assert!(diagnostics.force_mode(Mode::Hsq));
    fixture.submit(44, Direction::Read, 0x20000);

    let snapshot = diagnostics.snapshot();
    assert_eq!(snapshot.mode, Mode::Hsq);
    assert_eq!(snapshot.device_mode, Mode::Cmdq);
    assert_eq!(snapshot.queued, 1);
    assert!(fixture.card.cmdq_enabled());

    fixture.card.resume();
    assert_all_ok(&fixture.collect(5));
    fixture.queue.wait_for_idle().unwrap();

    let snapshot = diagnostics.snapshot();
    assert_eq!(snapshot.device_mode, Mode::Hsq);
    assert_eq!(snapshot.tagged, 0);
    assert!(!snapshot.sequencer_active);
    assert!(!fixture.card.cmdq_enabled());
    assert_eq!(
        fixture.card.executed().last(),
        Some(&(Direction::Read, 0x20000))
    );

    // The card never saw a mode change with a transfer outstanding.
    let switches = fixture.card.mode_switches();
    assert_eq!(switches.last().map(|switch| switch.enable), Some(false));
    for switch in switches {
        assert_eq!(switch.in_flight, 0, "{switch:?}");
        assert_eq!(switch.tasks, 0, "{switch:?}");
    }
}

#[test]
fn cmdq_without_completion_doorbell() {
    let fixture = Fixture::new(false, test_config(), device(8));
    assert!(fixture.queue.diagnostics().force_mode(Mode::Cmdq));
    for tag in 0..12 {
        let direction = if tag % 3 == 0 {
            Direction::Write
        } else {
            Direction::Read
        };
        fixture.submit(tag, direction, u32::from(tag) * 1000);
    }
    assert_all_ok(&fixture.collect(12));
    assert_eq!(fixture.card.executed().len(), 12);
    assert_eq!(fixture.card.resets(), 0);
}

#[test]
fn data_error_recovers_with_one_reset() {
    let fixture = Fixture::cmdq();
    fixture.card.fail_address(100, 1);
    for tag in 0..8 {
        fixture.submit(tag, Direction::Read, u32::from(tag) * 50);
    }
    assert_all_ok(&fixture.collect(8));
    fixture.queue.wait_for_idle().unwrap();

    assert_eq!(fixture.card.resets(), 1);
    assert_eq!(fixture.card.discards(), 1);
    assert_eq!(fixture.card.executed_count(100), 2);
    assert_eq!(fixture.card.executed_count(150), 1);
    assert!(fixture.card.cmdq_enabled());

    let diagnostics = fixture.queue.diagnostics();
    let snapshot = diagnostics.snapshot();
    assert_eq!(snapshot.recovery, RecoveryState::Normal);
    assert_eq!(snapshot.device_mode, Mode::Cmdq);
    assert_eq!(snapshot.tagged, 0);
    let recoveries = diagnostics
        .history()
        .iter()
        .filter(|entry| entry.event == HistoryEvent::Recovery)
        .count();
    assert_eq!(recoveries, 1);
}

#[test]
fn hsq_error_recovers_without_discard() {
    let config = test_config();
    let fixture = Fixture::new(
        true,
        config,
        DeviceInfo {
            part_config: 0x49,
            ..device(16)
        },
    );
    fixture.card.set_part_config(0x49);
    fixture.card.fail_address(40, 1);
    for tag in 0..4 {
        fixture.submit(tag, Direction::Write, u32::from(tag) * 40);
    }
    assert_all_ok(&fixture.collect(4));
    fixture.queue.wait_for_idle().unwrap();

    assert_eq!(fixture.card.resets(), 1);
    assert_eq!(fixture.card.discards(), 0);
    assert_eq!(fixture.card.executed_count(40), 2);
    // The reset leaves the card on the user data area.
    assert_eq!(fixture.card.part_config(), 0x48);
}

#[test]
fn request_fails_once_retries_are_exhausted() {
    let fixture = Fixture::hsq();
    fixture.card.fail_address(100, u32::MAX);
    fixture.submit(4, Direction::Read, 100);
    let results = fixture.collect(1);
    match &results[&4] {
        Err(RequestError::Transfer {
            attempts: 3,
            source: CommandError::Data,
        }) => {}
        other => panic!("unexpected result {other:?}"),
    }
    assert_eq!(fixture.card.resets(), 3);
    assert_eq!(fixture.card.executed_count(100), 3);

    // The tag is free again once the queue is idle.
    fixture.queue.wait_for_idle().unwrap();
    fixture.submit(4, Direction::Read, 8);
    assert_all_ok(&fixture.collect(1));
}

#[test]
fn stuck_card_is_reset() {
    let config = SwcqConfig {
        stuck_threshold: Duration::from_millis(50),
        ..test_config()
    };
    let fixture = Fixture::new(true, config, device(16));
    assert!(fixture.queue.diagnostics().force_mode(Mode::Cmdq));
    fixture.card.stall_ready();
    fixture.submit(0, Direction::Read, 0);
    fixture.submit(1, Direction::Read, 512);
    assert_all_ok(&fixture.collect(2));

    assert_eq!(fixture.card.resets(), 1);
    assert_eq!(fixture.card.discards(), 1);
    assert_eq!(fixture.card.executed().len(), 2);
}

#[test]
fn refused_mode_switch_falls_back_to_hsq() {
    let fixture = Fixture::hsq();
    fixture.card.refuse_cmdq_enable();
    let diagnostics = fixture.queue.diagnostics();
    assert!(diagnostics.force_mode(Mode::Cmdq));
    fixture.submit(0, Direction::Read, 0);
    assert_all_ok(&fixture.collect(1));
    fixture.queue.wait_for_idle().unwrap();

    assert_eq!(diagnostics.mode(), Mode::Hsq);
    let snapshot = diagnostics.snapshot();
    assert_eq!(snapshot.device_mode, Mode::Hsq);
    assert!(!snapshot.transition_allowed);
    assert_eq!(fixture.card.resets(), 1);
    assert!(!fixture.card.cmdq_enabled());
}

#[test]
fn card_without_command_queue_stays_in_hsq() {
    let fixture = Fixture::new(true, test_config(), device(0));
    let diagnostics = fixture.queue.diagnostics();
    assert!(!diagnostics.force_mode(Mode::Cmdq));
    let snapshot = diagnostics.snapshot();
    assert_eq!(snapshot.depth, 0);
    assert!(!snapshot.transition_allowed);

    diagnostics.set_auto_switch(true);
    assert!(!diagnostics.snapshot().transition_allowed);

    fixture.submit(0, Direction::Write, 0);
    assert_all_ok(&fixture.collect(1));
    assert_eq!(diagnostics.mode(), Mode::Hsq);
}

#[test]
fn write_protect_violation_fails_only_that_write() {
    let fixture = Fixture::cmdq();
    fixture.card.write_protect(500);
    fixture.submit(1, Direction::Write, 500);
    fixture.submit(2, Direction::Write, 508);
    let results = fixture.collect(2);
    assert!(
        matches!(results[&1], Err(RequestError::WriteProtected)),
        "{:?}",
        results[&1]
    );
    assert!(results[&2].is_ok());
    assert_eq!(fixture.card.resets(), 0);
}

#[test]
fn byte_addressed_card() {
    let fixture = Fixture::new(
        true,
        test_config(),
        DeviceInfo {
            block_addressed: false,
            ..device(16)
        },
    );
    fixture.submit(0, Direction::Read, 3);
    assert_all_ok(&fixture.collect(1));
    fixture.queue.wait_for_idle().unwrap();

    assert!(fixture.queue.diagnostics().force_mode(Mode::Cmdq));
    fixture.submit(1, Direction::Read, 5);
    assert_all_ok(&fixture.collect(1));

    let addresses: Vec<_> = fixture
        .card
        .executed()
        .iter()
        .map(|&(_, address)| address)
        .collect();
    assert_eq!(addresses, [3 << 9, 5 << 9]);
}

#[test]
fn lifecycle() {
    let fixture = Fixture::build(true, test_config());
    let queue = &fixture.queue;
    let results = &fixture.results;

    let err = queue
        .submit(results.request(1, Direction::Read, 0))
        .unwrap_err();
    assert!(matches!(err, SubmitError::Shutdown(_)));
    assert_eq!(err.into_request().tag(), 1);
    let err = queue
        .submit(results.request(64, Direction::Read, 0))
        .unwrap_err();
    assert!(matches!(err, SubmitError::Shutdown(_)));
    assert!(matches!(queue.enable(None), Err(EnableError::NoDevice)));
    queue.enable(Some(&device(16))).unwrap();
    assert!(matches!(queue.enable(None), Err(EnableError::Busy)));

    queue.recovery_start();
    assert!(matches!(
        queue.submit(results.request(1, Direction::Read, 0)),
        Err(SubmitError::Busy(_))
    ));
    assert!(matches!(
        queue.wait_for_idle(),
        Err(WaitIdleError::RecoveryHalt)
    ));
    assert!(queue.diagnostics().snapshot().recovery_halt);
    queue.recovery_finish();

    fixture.card.pause();
    fixture.submit(1, Direction::Write, 8);
    assert!(matches!(
        queue.disable(),
        Err(DisableError::Timeout { outstanding: 1 })
    ));
    assert!(queue.diagnostics().snapshot().enabled);
    fixture.card.resume();
    assert_all_ok(&fixture.collect(1));
    queue.wait_for_idle().unwrap();

    queue.suspend().unwrap();
    let snapshot = queue.diagnostics().snapshot();
    assert!(!snapshot.enabled);
    assert!(!snapshot.timer_running);
    assert!(matches!(
        queue.submit(results.request(2, Direction::Read, 0)),
        Err(SubmitError::Shutdown(_))
    ));

    queue.resume().unwrap();
    fixture.submit(2, Direction::Read, 16);
    assert_all_ok(&fixture.collect(1));
    queue.disable().unwrap();
}

#[test]
fn tag_checks() {
    let fixture = Fixture::hsq();
    let err = fixture
        .queue
        .submit(fixture.results.request(64, Direction::Read, 0))
        .unwrap_err();
    assert!(matches!(err, SubmitError::InvalidTag(_)));
    assert!(!fixture.queue.finalize(3, Ok(())));

    fixture.card.pause();
    fixture.submit(5, Direction::Write, 0);
    // A completion for a transfer that is not active, such as one started
    // before a reset, is ignored.
    assert!(!fixture.queue.finalize(6, Err(CommandError::Data)));
    let err = fixture
        .queue
        .submit(fixture.results.request(5, Direction::Write, 8))
        .unwrap_err();
    assert!(matches!(err, SubmitError::TagInUse(_)));
    assert_eq!(err.into_request().lba(), 8);
    fixture.card.resume();

    let results = fixture.collect(1);
    assert_all_ok(&results);
    assert_eq!(fixture.card.executed(), [(Direction::Write, 0)]);
    assert_eq!(fixture.card.resets(), 0);
}

#[test]
fn queue_converges_to_idle() {
    let fixture = Fixture::cmdq();
    for tag in 0..40 {
        let lba = (u32::from(tag) * 7919) % 4096 * 8;
        fixture.submit(tag, Direction::Read, lba);
    }
    assert_all_ok(&fixture.collect(40));
    fixture.queue.wait_for_idle().unwrap();

    let snapshot = fixture.queue.diagnostics().snapshot();
    assert_eq!(snapshot.queued, 0);
    assert_eq!(snapshot.tagged, 0);
    assert_eq!(snapshot.command_queue_nodes, 0);
    assert_eq!(snapshot.data_queue_nodes, 0);
    assert!(!snapshot.sequencer_active);
    assert_eq!(snapshot.recovery, RecoveryState::Normal);
    assert!(!fixture.queue.is_congested());
}

#[test]
fn congestion_and_request_timeout() {
    let fixture = Fixture::hsq();
    fixture.card.pause();
    for tag in 0..12 {
        fixture.submit(tag, Direction::Read, u32::from(tag) * 8);
    }
    // Depth 16 with a margin of 4.
    assert!(!fixture.queue.is_congested());
    fixture.submit(12, Direction::Read, 96);
    assert!(fixture.queue.is_congested());

    assert!(!fixture.queue.on_request_timeout(12));
    fixture.queue.diagnostics().dump_history();

    fixture.card.resume();
    assert_all_ok(&fixture.collect(13));
    fixture.queue.wait_for_idle().unwrap();
    assert!(!fixture.queue.is_congested());
}

#[test]
fn drop_fails_outstanding_requests() {
    let Fixture {
        card,
        queue,
        results,
    } = Fixture::hsq();
    card.pause();
    queue
        .submit(results.request(7, Direction::Read, 0))
        .unwrap();
    queue
        .submit(results.request(8, Direction::Read, 8))
        .unwrap();
    drop(queue);

    let completed = results.collect(2);
    for tag in [7, 8] {
        assert!(
            matches!(completed[&tag], Err(RequestError::Shutdown)),
            "{:?}",
            completed[&tag]
        );
    }

    // The completion for the transfer the card still holds is ignored.
    card.resume();
    assert!(results
        .recv
        .recv_timeout(Duration::from_millis(100))
        .is_err());
}
