//! Fiber scheduling: wake, resume, yield
//!
//! TigerStyle: Cooperative switching observed only through its side effects.

mod common;

use common::{fiber, init, EventLog};
use serial_test::serial;
use softbus_core::{
    BusConfig, Error, ErrorCode, FiberConfig, GroupConfig, Message, MessageKind, ServiceConfig,
};
use softbus_runtime::{Fiber, FiberContext, MessageHandle, Outgoing, RunState, Service, ServiceContext};
use std::sync::Arc;

const RESUMER: u32 = 1;
const STEPPER: u32 = 10;
const REMOTE: u32 = 20;
const INTRUDER: u32 = 21;
const SINK: u32 = 40;
const DRAINER: u32 = 41;
const MSG_STEP: u32 = 3;
const MSG_WORK: u32 = 4;

// =============================================================================
// Test Fibers
// =============================================================================

/// Two yields per pass through `route`
struct Stepper {
    log: EventLog,
}

impl Fiber for Stepper {
    fn on_init(&self, ctx: &FiberContext) {
        self.log.push(format!("init:{}", ctx.fid()));
    }

    fn route(&self, ctx: &FiberContext) {
        self.log.push("step1");
        ctx.yield_now();
        self.log.push("step2");
        ctx.yield_now();
        self.log.push("done");
    }
}

/// Wakes itself before yielding, so one external wake runs it twice
struct SelfWaker {
    log: EventLog,
}

impl Fiber for SelfWaker {
    fn route(&self, ctx: &FiberContext) {
        self.log.push("a");
        ctx.bus().filber_wake(ctx.fid()).unwrap();
        ctx.yield_now();
        self.log.push("b");
    }
}

/// Resumes itself from inside its own `route`
struct Reentrant {
    log: EventLog,
}

impl Fiber for Reentrant {
    fn route(&self, ctx: &FiberContext) {
        self.log.push("entered");
        let _ = ctx.bus().filber_resume(ctx.fid());
        self.log.push("survived");
    }
}

/// Drives fiber `STEPPER` from a message handler
struct Resumer {
    log: EventLog,
}

impl Service for Resumer {
    fn message_handles(&self) -> Vec<MessageHandle> {
        vec![MessageHandle::request(MSG_STEP)]
    }

    fn on_init(&self, ctx: &ServiceContext) {
        let bus = ctx.bus();
        let unknown = bus.filber_resume(99).unwrap_err();
        self.log.push(format!("unknown:{}", unknown.code()));
        let remote = bus.filber_resume(REMOTE).unwrap_err();
        self.log.push(format!("remote:{}", remote.code()));
    }

    fn on_message(&self, ctx: &ServiceContext, _msg: &Message) {
        let status = ctx.bus().filber_resume(STEPPER).unwrap();
        self.log.push(format!("status:{:?}", status));
    }
}

/// Lives on the other group and tries to drive fiber `STEPPER`
struct Intruder {
    log: EventLog,
}

impl Service for Intruder {
    fn message_handles(&self) -> Vec<MessageHandle> {
        vec![MessageHandle::request(MSG_STEP)]
    }

    fn on_message(&self, ctx: &ServiceContext, _msg: &Message) {
        let bus = ctx.bus();
        let group = bus.current_group().unwrap_or(usize::MAX);
        let err = bus.filber_resume(STEPPER).unwrap_err();
        self.log.push(format!("intruder:{}:{}", group, err.code()));
    }
}

/// Records what dispatch hands it
struct Sink {
    log: EventLog,
}

impl Service for Sink {
    fn message_handles(&self) -> Vec<MessageHandle> {
        vec![MessageHandle::request(MSG_WORK)]
    }

    fn on_message(&self, _ctx: &ServiceContext, msg: &Message) {
        self.log.push(format!("dispatch:{}", msg.uuid()));
    }
}

/// Empties `SINK`'s queue from its own init, before the first dispatch pass
struct QueueDrainer {
    log: EventLog,
}

impl Fiber for QueueDrainer {
    fn on_init(&self, ctx: &FiberContext) {
        let bus = ctx.bus();
        let before = bus.service_stats(SINK).unwrap();
        self.log
            .push(format!("before:{:?}:{}", before.state, before.queued()));

        let drained = bus
            .recv_msg(SINK, MessageKind::Request, |msg| {
                self.log.push(format!("drained:{}", msg.uuid()));
            })
            .unwrap();

        let after = bus.service_stats(SINK).unwrap();
        self.log.push(format!(
            "after:{:?}:{}:{}",
            after.state,
            after.queued(),
            drained
        ));
    }

    fn route(&self, _ctx: &FiberContext) {}
}

fn config() -> BusConfig {
    BusConfig::new()
        .with_group(
            GroupConfig::new()
                .with_service(ServiceConfig::new(RESUMER))
                .with_fiber(fiber(STEPPER))
                .with_fiber(fiber(11)),
        )
        .with_group(GroupConfig::new().with_fiber(fiber(REMOTE)))
}

// =============================================================================
// Tests
// =============================================================================

#[test]
#[serial]
fn test_wake_resumes_fiber_where_it_yielded() {
    let log = EventLog::new();
    let mut bus = init(config());
    let handle = bus.handle();
    handle
        .register_filber(STEPPER, Arc::new(Stepper { log: log.clone() }))
        .unwrap();
    bus.load().unwrap();
    assert!(log.wait_for("init:10"));

    handle.filber_wake(STEPPER).unwrap();
    assert!(log.wait_for("step1"));
    handle.filber_wake(STEPPER).unwrap();
    assert!(log.wait_for("step2"));
    handle.filber_wake(STEPPER).unwrap();
    assert!(log.wait_for("done"));

    // route returned, the next resume starts it over
    handle.filber_wake(STEPPER).unwrap();
    assert!(log.wait_for_len(5));
    assert_eq!(log.snapshot(), vec!["init:10", "step1", "step2", "done", "step1"]);

    bus.exit().unwrap();
}

#[test]
#[serial]
fn test_wake_while_running_requeues_fiber() {
    let log = EventLog::new();
    let mut bus = init(config());
    let handle = bus.handle();
    handle
        .register_filber(11, Arc::new(SelfWaker { log: log.clone() }))
        .unwrap();
    bus.load().unwrap();

    handle.filber_wake(11).unwrap();
    assert!(log.wait_for("b"));
    assert_eq!(log.snapshot(), vec!["a", "b"]);

    bus.exit().unwrap();
}

#[test]
#[serial]
fn test_service_resumes_fiber_and_sees_status() {
    let log = EventLog::new();
    let mut bus = init(config());
    let handle = bus.handle();
    handle
        .register_service(RESUMER, Arc::new(Resumer { log: log.clone() }))
        .unwrap();
    handle
        .register_filber(STEPPER, Arc::new(Stepper { log: log.clone() }))
        .unwrap();
    bus.load().unwrap();

    for uuid in 0..3 {
        handle
            .send_msg(Outgoing::request(RESUMER, RESUMER, MSG_STEP, uuid).no_reply())
            .unwrap();
    }
    assert!(log.wait_for("status:Finished"));

    assert_eq!(
        log.snapshot(),
        vec![
            "unknown:no_mid",
            "remote:no_perm",
            "init:10",
            "step1",
            "status:Yielded",
            "step2",
            "status:Yielded",
            "done",
            "status:Finished",
        ]
    );

    bus.exit().unwrap();
}

#[test]
#[serial]
fn test_fiber_operations_rejected_off_group() {
    let log = EventLog::new();
    let mut bus = init(config());
    let handle = bus.handle();
    handle
        .register_filber(STEPPER, Arc::new(Stepper { log: log.clone() }))
        .unwrap();
    bus.load().unwrap();

    assert_eq!(handle.filber_resume(STEPPER).unwrap_err().code(), ErrorCode::NoPerm);
    assert_eq!(handle.filber_resume(99).unwrap_err().code(), ErrorCode::NoMid);
    assert_eq!(handle.filber_wake(99).unwrap_err().code(), ErrorCode::NoMid);
    assert_eq!(handle.filber_wake(11).unwrap_err().code(), ErrorCode::NoPerm);

    bus.exit().unwrap();
}

#[test]
#[serial]
fn test_caller_supplied_stack() {
    let log = EventLog::new();
    let buf = vec![0u8; 128 * 1024].into_boxed_slice();
    // SAFETY: Stepper only logs and yields, far below 128 KiB
    let with_buffer = unsafe { FiberConfig::new(30).with_stack(buf) };
    let config = BusConfig::new().with_group(GroupConfig::new().with_fiber(with_buffer));
    let mut bus = init(config);
    let handle = bus.handle();
    handle
        .register_filber(30, Arc::new(Stepper { log: log.clone() }))
        .unwrap();
    bus.load().unwrap();

    handle.filber_wake(30).unwrap();
    assert!(log.wait_for("step1"));

    // Still suspended inside route; exit unwinds it
    bus.exit().unwrap();
    assert!(!log.contains("step2"));
}

#[test]
#[serial]
fn test_resuming_running_fiber_kills_group() {
    let log = EventLog::new();
    let mut bus = init(config());
    let handle = bus.handle();
    handle
        .register_filber(STEPPER, Arc::new(Reentrant { log: log.clone() }))
        .unwrap();
    bus.load().unwrap();

    handle.filber_wake(STEPPER).unwrap();
    assert!(log.wait_for("entered"));

    let err = bus.exit().unwrap_err();
    assert!(matches!(err, Error::GroupPanicked { group: 0 }));
    assert!(!log.contains("survived"));
}

#[test]
#[serial]
fn test_service_on_other_group_cannot_resume_fiber() {
    let log = EventLog::new();
    let config = BusConfig::new()
        .with_group(GroupConfig::new().with_fiber(fiber(STEPPER)))
        .with_group(GroupConfig::new().with_service(ServiceConfig::new(INTRUDER)));
    let mut bus = init(config);
    let handle = bus.handle();
    handle
        .register_filber(STEPPER, Arc::new(Stepper { log: log.clone() }))
        .unwrap();
    handle
        .register_service(INTRUDER, Arc::new(Intruder { log: log.clone() }))
        .unwrap();
    bus.load().unwrap();
    assert!(log.wait_for("init:10"));

    handle
        .send_msg(Outgoing::request(INTRUDER, INTRUDER, MSG_STEP, 0).no_reply())
        .unwrap();
    assert!(log.wait_for("intruder:1:no_perm"));

    bus.exit().unwrap();
    assert_eq!(log.snapshot(), vec!["init:10", "intruder:1:no_perm"]);
}

#[test]
#[serial]
fn test_fiber_drain_leaves_service_idle_and_undispatched() {
    let log = EventLog::new();
    let config = BusConfig::new().with_group(
        GroupConfig::new()
            .with_service(ServiceConfig::new(SINK))
            .with_fiber(fiber(DRAINER)),
    );
    let mut bus = init(config);
    let handle = bus.handle();
    handle
        .register_service(SINK, Arc::new(Sink { log: log.clone() }))
        .unwrap();
    handle
        .register_filber(DRAINER, Arc::new(QueueDrainer { log: log.clone() }))
        .unwrap();

    for uuid in [1, 2] {
        handle
            .send_msg(Outgoing::request(SINK, SINK, MSG_WORK, uuid).no_reply())
            .unwrap();
    }
    let stats = handle.service_stats(SINK).unwrap();
    assert_eq!((stats.state, stats.queued()), (RunState::Busy, 2));

    bus.load().unwrap();
    assert!(log.wait_for("after:Idle:0:2"));

    let stats = handle.service_stats(SINK).unwrap();
    assert_eq!((stats.state, stats.queued()), (RunState::Idle, 0));
    assert_eq!(stats.processed_count, 2);

    // Anything dispatched for the drained messages would land before this one
    handle
        .send_msg(Outgoing::request(SINK, SINK, MSG_WORK, 99).no_reply())
        .unwrap();
    assert!(log.wait_for("dispatch:99"));

    bus.exit().unwrap();
    assert_eq!(
        log.snapshot(),
        vec!["before:Busy:2", "drained:1", "drained:2", "after:Idle:0:2", "dispatch:99"]
    );
}
