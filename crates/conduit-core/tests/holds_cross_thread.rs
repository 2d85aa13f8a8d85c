//! 逻辑引用计数与跨线程入口的契约。

mod common;

use common::{active_channel, build_pipeline, recorder};
use conduit_core::test_stubs::{HandlerEvent, HandlerJournal, ManualEventLoop};
use conduit_core::{ChannelState, ChannelTask, Direction, TaskStatus};
use std::sync::{Arc, Mutex};

fn destroyed_labels(journal: &HandlerJournal) -> Vec<&'static str> {
    journal
        .snapshot()
        .into_iter()
        .filter_map(|event| match event {
            HandlerEvent::Destroyed { label } => Some(label),
            _ => None,
        })
        .collect()
}

#[test]
fn holds_keep_the_channel_alive_across_destroy() {
    let event_loop = ManualEventLoop::new();
    let (channel, log) = active_channel(&event_loop);
    let journal = HandlerJournal::new();
    build_pipeline(&channel, vec![recorder(&journal, "h1", 32)]);

    channel.shutdown(0);
    event_loop.run_ready();
    assert_eq!(log.shutdown_codes(), vec![0]);

    channel.acquire_hold();
    channel.acquire_hold();
    channel.destroy();
    assert!(
        destroyed_labels(&journal).is_empty(),
        "两个 hold 仍在：拆除必须推迟"
    );

    channel.release_hold();
    assert!(
        destroyed_labels(&journal).is_empty(),
        "还剩一个 hold：拆除仍要推迟"
    );

    channel.release_hold();
    assert_eq!(
        destroyed_labels(&journal),
        vec!["h1"],
        "最后一个 hold 释放后立即拆除"
    );
}

#[test]
fn hold_acquire_release_is_a_no_op_round_trip() {
    let event_loop = ManualEventLoop::new();
    let (channel, _log) = active_channel(&event_loop);
    let ran = Arc::new(Mutex::new(false));

    channel.acquire_hold();
    channel.release_hold();

    // 通道毫发无损，照常接受并执行任务。
    let flag = Arc::clone(&ran);
    channel.schedule_task_now(ChannelTask::new("probe", move |status| {
        assert_eq!(status, TaskStatus::RunReady);
        *flag.lock().expect("flag lock poisoned") = true;
    }));
    event_loop.run_ready();
    assert!(*ran.lock().expect("flag lock poisoned"));
}

#[test]
fn cross_thread_shutdown_executes_on_the_loop_thread() {
    let event_loop = ManualEventLoop::new();
    let (channel, log) = active_channel(&event_loop);
    let journal = HandlerJournal::new();
    build_pipeline(
        &channel,
        vec![
            recorder(&journal, "h1", 64),
            recorder(&journal, "h2", 64),
            recorder(&journal, "h3", 64),
        ],
    );

    let worker_channel = channel.clone();
    std::thread::spawn(move || {
        assert!(!worker_channel.thread_is_callers_thread());
        worker_channel.shutdown(5);
    })
    .join()
    .expect("工作线程不应恐慌");

    // 请求已入跨线程收件箱，完整序列在循环线程展开。
    assert!(log.shutdown_codes().is_empty());
    event_loop.run_ready();

    let sequence = journal.shutdown_sequence();
    let expected: Vec<HandlerEvent> = [
        ("h1", Direction::Read),
        ("h2", Direction::Read),
        ("h3", Direction::Read),
        ("h3", Direction::Write),
        ("h2", Direction::Write),
        ("h1", Direction::Write),
    ]
    .into_iter()
    .map(|(label, direction)| HandlerEvent::ShutdownRequested {
        label,
        direction,
        error_code: 5,
        free_scarce_resources: false,
    })
    .collect();
    assert_eq!(sequence, expected);
    assert_eq!(log.shutdown_codes(), vec![5]);
    assert_eq!(channel.state(), ChannelState::ShutDown);
    channel.destroy();
}

#[test]
fn cross_thread_release_defers_teardown_to_the_loop() {
    let event_loop = ManualEventLoop::new();
    let (channel, log) = active_channel(&event_loop);
    let journal = HandlerJournal::new();
    build_pipeline(&channel, vec![recorder(&journal, "h1", 32)]);

    channel.shutdown(0);
    event_loop.run_ready();
    assert_eq!(log.shutdown_codes(), vec![0]);

    channel.acquire_hold();
    channel.destroy();

    // 最后一个 hold 在别的线程释放：拆除作为任务回到循环线程执行。
    let worker_channel = channel.clone();
    std::thread::spawn(move || worker_channel.release_hold())
        .join()
        .expect("工作线程不应恐慌");
    assert!(
        destroyed_labels(&journal).is_empty(),
        "拆除任务尚未在循环线程执行"
    );

    event_loop.run_ready();
    assert_eq!(destroyed_labels(&journal), vec!["h1"]);
}
