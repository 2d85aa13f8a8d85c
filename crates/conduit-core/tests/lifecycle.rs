//! 通道生命周期契约：装配、链路组装、窗口初始化与空通道关闭。

mod common;

use common::{active_channel, build_pipeline, new_channel, recorder};
use conduit_core::test_stubs::{HandlerEvent, HandlerJournal, ManualEventLoop, RecordingHandler};
use conduit_core::{
    ChannelState, ERROR_CODE_CANCELED, ErrorKind, LocalObjectKey, MessageKind, codes,
};
use std::sync::Arc;

#[test]
fn setup_completes_once_and_activates_channel() {
    let event_loop = ManualEventLoop::new();
    let (channel, log) = new_channel(&event_loop);

    assert_eq!(channel.state(), ChannelState::Initializing);
    assert!(log.setup_codes().is_empty(), "装配任务尚未执行");

    event_loop.run_ready();
    assert_eq!(channel.state(), ChannelState::Active);
    assert_eq!(log.setup_codes(), vec![0]);

    // 继续泵送不会产生第二次装配通知。
    event_loop.run_ready();
    assert_eq!(log.setup_codes(), vec![0]);
    channel.destroy();
}

#[test]
fn canceled_setup_reports_error_and_channel_survives_until_destroy() {
    let event_loop = ManualEventLoop::new();
    let (channel, log) = new_channel(&event_loop);

    // 模拟循环在装配任务执行前关停。
    let canceled = event_loop.cancel_all();
    assert_eq!(canceled, 1);
    assert_eq!(log.setup_codes(), vec![ERROR_CODE_CANCELED]);
    assert_eq!(channel.state(), ChannelState::Initializing);
    assert!(log.shutdown_codes().is_empty(), "装配失败的通道没有关闭通知");

    // 通道仍需由调用方销毁。
    channel.destroy();
}

#[test]
fn two_handler_pipeline_initializes_windows_and_overheads() {
    let event_loop = ManualEventLoop::new();
    let (channel, _log) = active_channel(&event_loop);
    let journal = HandlerJournal::new();

    let slots = build_pipeline(
        &channel,
        vec![
            recorder(&journal, "h1", 1024),
            recorder(&journal, "h2", 512).with_overhead(8),
        ],
    );

    assert_eq!(slots[0].read_window(), 1024);
    assert_eq!(slots[1].read_window(), 512);
    assert_eq!(slots[1].upstream_message_overhead(), 0);
    assert_eq!(slots[0].downstream_read_window(), 512);
    // h2 挂载时，初始信用经窗口增量向左公告给 h1。
    assert!(journal.snapshot().contains(&HandlerEvent::WindowIncrement {
        label: "h1",
        size: 512,
    }));

    // 第三个插槽看到 h1 + h2 的累计开销。
    let slot3 = channel.new_slot();
    channel.slot_insert_end(&slot3).expect("链尾接入");
    slot3
        .set_handler(recorder(&journal, "h3", 256).boxed())
        .expect("挂载 h3");
    assert_eq!(slot3.upstream_message_overhead(), 8);
}

#[test]
fn set_handler_twice_is_rejected() {
    let event_loop = ManualEventLoop::new();
    let (channel, _log) = active_channel(&event_loop);
    let journal = HandlerJournal::new();

    let slot = channel.new_slot();
    slot.set_handler(recorder(&journal, "first", 16).boxed())
        .expect("首次挂载");
    let err = slot
        .set_handler(recorder(&journal, "second", 16).boxed())
        .expect_err("二次挂载必须被拒绝");
    assert_eq!(err.code(), codes::CHANNEL_SLOT_HANDLER_ALREADY_SET);
    assert_eq!(err.kind(), ErrorKind::State);
    assert_eq!(slot.read_window(), 16, "失败的挂载不得动摇既有窗口");
}

#[test]
fn empty_channel_shutdown_goes_straight_to_completion() {
    let event_loop = ManualEventLoop::new();
    let (channel, log) = active_channel(&event_loop);

    channel.shutdown(9);
    event_loop.run_ready();

    assert_eq!(channel.state(), ChannelState::ShutDown);
    assert_eq!(log.shutdown_codes(), vec![9]);
    channel.destroy();
}

#[test]
fn shutdown_before_setup_still_fires_setup_first() {
    let event_loop = ManualEventLoop::new();
    let (channel, log) = new_channel(&event_loop);

    // 装配任务尚未执行时就请求关闭。
    channel.shutdown(7);
    assert!(log.setup_codes().is_empty());

    event_loop.run_ready();

    // 装配通知携带关闭错误码，且先于关闭完成通知。
    assert_eq!(log.setup_codes(), vec![7]);
    assert_eq!(log.shutdown_codes(), vec![7]);
    assert_eq!(channel.state(), ChannelState::ShutDown);
    channel.destroy();
}

#[test]
fn pool_messages_are_clamped_by_fragment_size() {
    let event_loop = ManualEventLoop::new();
    let (channel, _log) = active_channel(&event_loop);

    let small = channel
        .acquire_message_from_pool(MessageKind::ApplicationData, 100)
        .expect("池申请");
    assert_eq!(small.capacity(), 100);
    assert_eq!(small.len(), 0);

    let oversized = channel
        .acquire_message_from_pool(MessageKind::ApplicationData, 1 << 20)
        .expect("池申请");
    assert_eq!(
        oversized.capacity(),
        conduit_core::max_fragment_size(),
        "超大请求按进程级分片上限裁剪"
    );
    assert_eq!(event_loop.acquired_messages(), 2);
}

#[test]
fn event_loop_passthroughs_round_trip() {
    let event_loop = ManualEventLoop::new();
    let (channel, _log) = active_channel(&event_loop);

    assert!(channel.thread_is_callers_thread());
    assert_eq!(channel.current_clock_time(), 0);
    event_loop.advance_clock_to(42);
    assert_eq!(channel.current_clock_time(), 42);

    let key = LocalObjectKey(7);
    channel
        .put_local_object(key, Arc::new(123_u32))
        .expect("写入本地存储");
    let duplicate = channel.put_local_object(key, Arc::new(456_u32));
    assert_eq!(
        duplicate.expect_err("键已占用").code(),
        codes::LOOP_LOCAL_OBJECT_EXISTS
    );
    let fetched = channel.fetch_local_object(key).expect("键应命中");
    assert_eq!(fetched.downcast_ref::<u32>(), Some(&123));
    assert!(channel.remove_local_object(key).is_some());
    assert!(channel.fetch_local_object(key).is_none());
}

#[test]
fn removed_slot_rejects_further_operations() {
    let event_loop = ManualEventLoop::new();
    let (channel, _log) = active_channel(&event_loop);
    let journal = HandlerJournal::new();

    let slots = build_pipeline(
        &channel,
        vec![recorder(&journal, "keep", 64), recorder(&journal, "gone", 64)],
    );
    let removed = slots[1].clone();
    removed.clone().remove().expect("摘除");

    assert!(journal.snapshot().contains(&HandlerEvent::Destroyed { label: "gone" }));
    let err = removed.increment_read_window(1).expect_err("已摘除");
    assert_eq!(err.code(), codes::CHANNEL_SLOT_DETACHED);
    assert_eq!(slots[0].downstream_read_window(), 0, "右邻居已不存在");
}

#[test]
fn replace_swaps_chain_position_and_destroys_old_handler() {
    let event_loop = ManualEventLoop::new();
    let (channel, _log) = active_channel(&event_loop);
    let journal = HandlerJournal::new();

    let slots = build_pipeline(
        &channel,
        vec![
            recorder(&journal, "left", 64),
            recorder(&journal, "old", 32).with_overhead(4),
            recorder(&journal, "right", 16),
        ],
    );

    let fresh = channel.new_slot();
    fresh
        .set_handler(
            RecordingHandler::new("new", &journal)
                .with_initial_window(48)
                .with_overhead(2)
                .boxed(),
        )
        .expect("挂载替换 Handler");
    slots[1].clone().replace(&fresh).expect("替换");

    assert!(journal.snapshot().contains(&HandlerEvent::Destroyed { label: "old" }));
    assert_eq!(slots[0].downstream_read_window(), 48);
    // 右侧插槽看到新 Handler 的开销。
    assert_eq!(slots[2].upstream_message_overhead(), 2);
}
