//! 双阶段关闭状态机的次序契约。

mod common;

use common::{active_channel, build_pipeline, recorder};
use conduit_core::test_stubs::{HandlerEvent, HandlerJournal, ManualEventLoop, RecordingHandler};
use conduit_core::{ChannelState, Direction};

fn shutdown_event(
    label: &'static str,
    direction: Direction,
    error_code: i32,
    free_scarce_resources: bool,
) -> HandlerEvent {
    HandlerEvent::ShutdownRequested {
        label,
        direction,
        error_code,
        free_scarce_resources,
    }
}

/// 三个 Handler 的完整关闭呼叫序列：先 READ 左→右，再 WRITE 右→左。
fn expected_sequence(error_code: i32, free_scarce_resources: bool) -> Vec<HandlerEvent> {
    vec![
        shutdown_event("h1", Direction::Read, error_code, free_scarce_resources),
        shutdown_event("h2", Direction::Read, error_code, free_scarce_resources),
        shutdown_event("h3", Direction::Read, error_code, free_scarce_resources),
        shutdown_event("h3", Direction::Write, error_code, free_scarce_resources),
        shutdown_event("h2", Direction::Write, error_code, free_scarce_resources),
        shutdown_event("h1", Direction::Write, error_code, free_scarce_resources),
    ]
}

fn pipeline(journal: &HandlerJournal) -> Vec<RecordingHandler> {
    vec![
        recorder(journal, "h1", 64),
        recorder(journal, "h2", 64),
        recorder(journal, "h3", 64),
    ]
}

#[test]
fn clean_shutdown_walks_read_then_write() {
    let event_loop = ManualEventLoop::new();
    let (channel, log) = active_channel(&event_loop);
    let journal = HandlerJournal::new();
    build_pipeline(&channel, pipeline(&journal));

    channel.shutdown(7);
    event_loop.run_ready();

    assert_eq!(journal.shutdown_sequence(), expected_sequence(7, false));
    assert_eq!(log.shutdown_codes(), vec![7]);
    assert_eq!(channel.state(), ChannelState::ShutDown);

    // Handler 的析构在销毁阶段发生：每个恰好一次，且在关闭序列之后。
    channel.destroy();
    let destroyed: Vec<&'static str> = journal
        .snapshot()
        .into_iter()
        .filter_map(|event| match event {
            HandlerEvent::Destroyed { label } => Some(label),
            _ => None,
        })
        .collect();
    assert_eq!(destroyed, vec!["h1", "h2", "h3"]);
}

#[test]
fn deferred_completions_preserve_the_same_order() {
    let event_loop = ManualEventLoop::new();
    let (channel, log) = active_channel(&event_loop);
    let journal = HandlerJournal::new();
    build_pipeline(
        &channel,
        vec![
            recorder(&journal, "h1", 64).deferring_shutdown_completion(),
            recorder(&journal, "h2", 64).deferring_shutdown_completion(),
            recorder(&journal, "h3", 64).deferring_shutdown_completion(),
        ],
    );

    channel.shutdown(7);
    event_loop.run_ready();

    assert_eq!(journal.shutdown_sequence(), expected_sequence(7, false));
    assert_eq!(log.shutdown_codes(), vec![7]);
}

#[test]
fn shutdown_is_idempotent_and_first_error_wins() {
    let event_loop = ManualEventLoop::new();
    let (channel, log) = active_channel(&event_loop);
    let journal = HandlerJournal::new();
    build_pipeline(&channel, pipeline(&journal));

    channel.shutdown(7);
    channel.shutdown(9);
    event_loop.run_ready();
    channel.shutdown(11);
    event_loop.run_ready();

    assert_eq!(log.shutdown_codes(), vec![7], "只有首个错误码生效");
    assert_eq!(journal.shutdown_sequence(), expected_sequence(7, false));
}

#[test]
fn failing_handler_does_not_stall_the_sequence() {
    let event_loop = ManualEventLoop::new();
    let (channel, log) = active_channel(&event_loop);
    let journal = HandlerJournal::new();
    build_pipeline(
        &channel,
        vec![
            recorder(&journal, "h1", 64),
            recorder(&journal, "h2", 64).failing_shutdown(),
            recorder(&journal, "h3", 64),
        ],
    );

    channel.shutdown(7);
    event_loop.run_ready();

    // h2 两个方向都报错，但内核代为推进，序列完整走完。
    assert_eq!(journal.shutdown_sequence(), expected_sequence(7, false));
    assert_eq!(log.shutdown_codes(), vec![7], "记录的仍是首个关闭原因");
    assert_eq!(channel.state(), ChannelState::ShutDown);
}

#[test]
fn urgent_shutdown_propagates_the_scarce_resource_flag() {
    let event_loop = ManualEventLoop::new();
    let (channel, log) = active_channel(&event_loop);
    let journal = HandlerJournal::new();
    build_pipeline(&channel, pipeline(&journal));

    channel.shutdown_with_urgency(3, true);
    event_loop.run_ready();

    assert_eq!(journal.shutdown_sequence(), expected_sequence(3, true));
    assert_eq!(log.shutdown_codes(), vec![3]);
}

#[test]
fn chain_mutation_is_rejected_during_shutdown() {
    let event_loop = ManualEventLoop::new();
    let (channel, _log) = active_channel(&event_loop);
    let journal = HandlerJournal::new();
    let slots = build_pipeline(
        &channel,
        vec![
            recorder(&journal, "h1", 64).deferring_shutdown_completion(),
            recorder(&journal, "h2", 64),
        ],
    );

    channel.shutdown(0);
    assert!(event_loop.run_one(), "执行关闭发起任务");
    assert_eq!(channel.state(), ChannelState::ShuttingDownRead);

    let err = slots[1].clone().remove().expect_err("关闭期间禁止摘除");
    assert_eq!(err.code(), conduit_core::codes::CHANNEL_INVALID_STATE);

    event_loop.run_ready();
    channel.destroy();
}

#[test]
fn handler_destroy_happens_after_both_directions() {
    let event_loop = ManualEventLoop::new();
    let (channel, _log) = active_channel(&event_loop);
    let journal = HandlerJournal::new();
    build_pipeline(&channel, pipeline(&journal));

    channel.shutdown(0);
    event_loop.run_ready();
    channel.destroy();

    let events = journal.snapshot();
    let last_shutdown = events
        .iter()
        .rposition(|event| matches!(event, HandlerEvent::ShutdownRequested { .. }))
        .expect("应有关闭记录");
    let first_destroy = events
        .iter()
        .position(|event| matches!(event, HandlerEvent::Destroyed { .. }))
        .expect("应有析构记录");
    assert!(
        last_shutdown < first_destroy,
        "析构必须晚于全部关闭回调"
    );
    let destroy_count = events
        .iter()
        .filter(|event| matches!(event, HandlerEvent::Destroyed { .. }))
        .count();
    assert_eq!(destroy_count, 3, "每个 Handler 恰好析构一次");
}
