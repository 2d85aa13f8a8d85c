//! 场景测试共用的装配件。
#![allow(dead_code)]

use conduit_core::test_stubs::{HandlerJournal, ManualEventLoop, RecordingHandler};
use conduit_core::{Channel, ChannelCallbacks, Slot};
use std::sync::{Arc, Mutex};

/// 回调落点：记录每次装配/关闭通知携带的错误码。
pub struct CallbackLog {
    pub setup: Arc<Mutex<Vec<i32>>>,
    pub shutdown: Arc<Mutex<Vec<i32>>>,
}

impl CallbackLog {
    pub fn setup_codes(&self) -> Vec<i32> {
        self.setup.lock().expect("setup log lock poisoned").clone()
    }

    pub fn shutdown_codes(&self) -> Vec<i32> {
        self.shutdown
            .lock()
            .expect("shutdown log lock poisoned")
            .clone()
    }
}

/// 创建挂好记录回调的通道；不泵送循环，装配任务仍在队列中。
pub fn new_channel(event_loop: &Arc<ManualEventLoop>) -> (Channel, CallbackLog) {
    let setup = Arc::new(Mutex::new(Vec::new()));
    let shutdown = Arc::new(Mutex::new(Vec::new()));
    let callbacks = ChannelCallbacks::new()
        .on_setup({
            let setup = Arc::clone(&setup);
            move |_channel, code| setup.lock().expect("setup log lock poisoned").push(code)
        })
        .on_shutdown({
            let shutdown = Arc::clone(&shutdown);
            move |_channel, code| {
                shutdown
                    .lock()
                    .expect("shutdown log lock poisoned")
                    .push(code)
            }
        });
    let channel = Channel::new(
        Arc::clone(event_loop) as Arc<dyn conduit_core::EventLoop>,
        callbacks,
    );
    (channel, CallbackLog { setup, shutdown })
}

/// 创建并激活通道（装配任务已执行完毕）。
pub fn active_channel(event_loop: &Arc<ManualEventLoop>) -> (Channel, CallbackLog) {
    let (channel, log) = new_channel(event_loop);
    event_loop.run_ready();
    assert_eq!(log.setup_codes(), vec![0], "装配通知应恰好一次且成功");
    (channel, log)
}

/// 依序挂载一组 Handler，返回对应插槽。
pub fn build_pipeline(
    channel: &Channel,
    handlers: Vec<RecordingHandler>,
) -> Vec<Slot> {
    let mut slots = Vec::new();
    for handler in handlers {
        let slot = channel.new_slot();
        channel
            .slot_insert_end(&slot)
            .expect("链尾接入不应失败");
        slot.set_handler(handler.boxed()).expect("挂载不应失败");
        slots.push(slot);
    }
    slots
}

/// 便捷构造：共享日志上的带初始窗口的记录 Handler。
pub fn recorder(
    journal: &HandlerJournal,
    label: &'static str,
    initial_window: usize,
) -> RecordingHandler {
    RecordingHandler::new(label, journal).with_initial_window(initial_window)
}
