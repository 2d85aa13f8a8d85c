//! 官方测试替身：确定性事件循环与记录型 Handler。
//!
//! # 设计背景（Why）
//! - 内核契约大量依赖“单线程顺序执行 + 手动推进时间”的确定性环境才能
//!   逐步断言；让每个测试自造循环既重复又容易写出竞态。
//! - 这里的替身是框架官方维护的一部分：契约演进时单点更新，全部测试
//!   同步适配。
//!
//! # 组成（What）
//! - [`ManualEventLoop`]：手动泵送的 [`EventLoop`] 实现，虚拟单调时钟、
//!   FIFO 即时队列、按时间戳排序的未来队列、本地对象存储与一个简单的
//!   消息池。
//! - [`RecordingHandler`]：把每次回调写入共享 [`HandlerJournal`] 的
//!   Handler，可配置初始窗口、消息开销、窗口传播与异步关闭完成。

use crate::channel::Slot;
use crate::error::{CoreError, codes};
use crate::handler::{ChannelHandler, Direction};
use crate::message::{IoMessage, MessageKind};
use crate::runtime::{
    ChannelTask, EventLoop, LocalObject, LocalObjectKey, LoopTask, TaskStatus,
};
use std::boxed::Box;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};
use std::vec::Vec;

/// 手动泵送的确定性事件循环。
///
/// # 契约说明（What）
/// - 创建线程即“循环线程”；[`is_on_this_thread`](EventLoop::is_on_this_thread)
///   与真实 [`ThreadId`] 比对，跨线程场景用真实线程驱动。
/// - 任务不会自动执行：测试通过 [`run_ready`](Self::run_ready) 排空即时
///   队列，通过 [`advance_clock_to`](Self::advance_clock_to) 推进虚拟时钟
///   并执行到期的未来任务。
/// - [`cancel_all`](Self::cancel_all) 模拟循环关停：未执行任务逐一以
///   [`TaskStatus::Canceled`] 回调。
pub struct ManualEventLoop {
    state: Mutex<LoopState>,
    thread: Mutex<ThreadId>,
}

struct LoopState {
    now_nanos: u64,
    ready: VecDeque<LoopTask>,
    timed: BTreeMap<(u64, u64), LoopTask>,
    next_seq: u64,
    locals: BTreeMap<LocalObjectKey, LocalObject>,
    pool_message_limit: usize,
    acquired_messages: usize,
}

impl ManualEventLoop {
    /// 创建循环；当前线程成为循环线程。
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(LoopState {
                now_nanos: 0,
                ready: VecDeque::new(),
                timed: BTreeMap::new(),
                next_seq: 0,
                locals: BTreeMap::new(),
                pool_message_limit: crate::message::max_fragment_size(),
                acquired_messages: 0,
            }),
            thread: Mutex::new(thread::current().id()),
        })
    }

    /// 把循环线程改绑为当前线程。
    pub fn pin_to_current_thread(&self) {
        *self.thread.lock().expect("loop thread lock poisoned") = thread::current().id();
    }

    /// 排空即时队列（含执行过程中新投递的任务），返回执行的任务数。
    pub fn run_ready(&self) -> usize {
        let mut executed = 0;
        loop {
            let task = {
                let mut state = self.state.lock().expect("loop state lock poisoned");
                state.ready.pop_front()
            };
            // 锁外执行：任务会再入循环投递新任务。
            match task {
                Some(task) => {
                    task.run(TaskStatus::RunReady);
                    executed += 1;
                }
                None => return executed,
            }
        }
    }

    /// 仅执行即时队列中的下一个任务；队列为空时返回 `false`。
    ///
    /// 用于逐步推进并在中间状态上断言（例如关闭进行中的窗口语义）。
    pub fn run_one(&self) -> bool {
        let task = {
            let mut state = self.state.lock().expect("loop state lock poisoned");
            state.ready.pop_front()
        };
        match task {
            Some(task) => {
                task.run(TaskStatus::RunReady);
                true
            }
            None => false,
        }
    }

    /// 将虚拟时钟推进到 `nanos`，执行全部到期的未来任务与即时任务。
    pub fn advance_clock_to(&self, nanos: u64) -> usize {
        {
            let mut state = self.state.lock().expect("loop state lock poisoned");
            state.now_nanos = state.now_nanos.max(nanos);
            let due: Vec<(u64, u64)> = state
                .timed
                .range(..=(nanos, u64::MAX))
                .map(|(key, _)| *key)
                .collect();
            for key in due {
                if let Some(task) = state.timed.remove(&key) {
                    state.ready.push_back(task);
                }
            }
        }
        self.run_ready()
    }

    /// 以相对增量推进虚拟时钟。
    pub fn advance_clock_by(&self, delta_nanos: u64) -> usize {
        let target = {
            let state = self.state.lock().expect("loop state lock poisoned");
            state.now_nanos.saturating_add(delta_nanos)
        };
        self.advance_clock_to(target)
    }

    /// 模拟循环关停：所有未执行任务以取消状态回调，返回取消数量。
    pub fn cancel_all(&self) -> usize {
        let mut canceled = 0;
        loop {
            let task = {
                let mut state = self.state.lock().expect("loop state lock poisoned");
                state
                    .ready
                    .pop_front()
                    .or_else(|| state.timed.pop_first().map(|(_, task)| task))
            };
            match task {
                Some(task) => {
                    task.run(TaskStatus::Canceled);
                    canceled += 1;
                }
                None => return canceled,
            }
        }
    }

    /// 即时队列中等待执行的任务数。
    pub fn pending_now(&self) -> usize {
        self.state.lock().expect("loop state lock poisoned").ready.len()
    }

    /// 未来队列中等待到期的任务数。
    pub fn pending_timed(&self) -> usize {
        self.state.lock().expect("loop state lock poisoned").timed.len()
    }

    /// 迄今从池中租借的消息条数。
    pub fn acquired_messages(&self) -> usize {
        self.state
            .lock()
            .expect("loop state lock poisoned")
            .acquired_messages
    }

    /// 设置池的单消息容量上限。
    pub fn set_pool_message_limit(&self, limit: usize) {
        self.state
            .lock()
            .expect("loop state lock poisoned")
            .pool_message_limit = limit;
    }
}

impl EventLoop for ManualEventLoop {
    fn schedule_task_now(&self, task: LoopTask) {
        self.state
            .lock()
            .expect("loop state lock poisoned")
            .ready
            .push_back(task);
    }

    fn schedule_task_future(&self, task: LoopTask, run_at_nanos: u64) {
        let mut state = self.state.lock().expect("loop state lock poisoned");
        let seq = state.next_seq;
        state.next_seq += 1;
        state.timed.insert((run_at_nanos, seq), task);
    }

    fn current_clock_nanos(&self) -> u64 {
        self.state.lock().expect("loop state lock poisoned").now_nanos
    }

    fn is_on_this_thread(&self) -> bool {
        thread::current().id() == *self.thread.lock().expect("loop thread lock poisoned")
    }

    fn fetch_local_object(&self, key: LocalObjectKey) -> Option<LocalObject> {
        self.state
            .lock()
            .expect("loop state lock poisoned")
            .locals
            .get(&key)
            .cloned()
    }

    fn put_local_object(
        &self,
        key: LocalObjectKey,
        object: LocalObject,
    ) -> Result<(), CoreError> {
        let mut state = self.state.lock().expect("loop state lock poisoned");
        if state.locals.contains_key(&key) {
            return Err(CoreError::new(
                codes::LOOP_LOCAL_OBJECT_EXISTS,
                "local object key already occupied",
            ));
        }
        state.locals.insert(key, object);
        Ok(())
    }

    fn remove_local_object(&self, key: LocalObjectKey) -> Option<LocalObject> {
        self.state
            .lock()
            .expect("loop state lock poisoned")
            .locals
            .remove(&key)
    }

    fn acquire_message_from_pool(
        &self,
        kind: MessageKind,
        size_hint: usize,
    ) -> Result<IoMessage, CoreError> {
        let mut state = self.state.lock().expect("loop state lock poisoned");
        let capacity = size_hint.min(state.pool_message_limit);
        state.acquired_messages += 1;
        Ok(IoMessage::new(kind, capacity))
    }
}

/// Handler 回调的一次记录。
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HandlerEvent {
    /// 收到 READ 消息。
    ReadMessage { label: &'static str, len: usize },
    /// 收到 WRITE 消息。
    WriteMessage { label: &'static str, len: usize },
    /// 收到窗口增量。
    WindowIncrement { label: &'static str, size: usize },
    /// 被要求开始某方向的关闭。
    ShutdownRequested {
        label: &'static str,
        direction: Direction,
        error_code: i32,
        free_scarce_resources: bool,
    },
    /// Handler 被析构。
    Destroyed { label: &'static str },
}

/// 跨 Handler 共享的事件日志。
#[derive(Clone, Default)]
pub struct HandlerJournal {
    events: Arc<Mutex<Vec<HandlerEvent>>>,
}

impl HandlerJournal {
    /// 创建空日志。
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加一条记录；自定义测试 Handler 亦可直接使用。
    pub fn record(&self, event: HandlerEvent) {
        self.events.lock().expect("journal lock poisoned").push(event);
    }

    /// 复制当前全部记录。
    pub fn snapshot(&self) -> Vec<HandlerEvent> {
        self.events.lock().expect("journal lock poisoned").clone()
    }

    /// 仅保留关闭相关记录，便于断言关闭序列。
    pub fn shutdown_sequence(&self) -> Vec<HandlerEvent> {
        self.snapshot()
            .into_iter()
            .filter(|event| {
                matches!(
                    event,
                    HandlerEvent::ShutdownRequested { .. } | HandlerEvent::Destroyed { .. }
                )
            })
            .collect()
    }
}

/// 把每次回调写入共享日志的测试 Handler。
///
/// 默认行为：READ/WRITE 消息记录后就地释放（WRITE 以成功码触发完成
/// 回调），窗口增量只记录不传播，关闭请求同步完成。各维度均可经
/// builder 方法调整。
pub struct RecordingHandler {
    label: &'static str,
    journal: HandlerJournal,
    initial_window: usize,
    overhead: usize,
    propagate_window: bool,
    defer_shutdown_completion: bool,
    fail_shutdown: bool,
}

impl RecordingHandler {
    /// 以标签与共享日志构造 Handler。
    pub fn new(label: &'static str, journal: &HandlerJournal) -> Self {
        Self {
            label,
            journal: journal.clone(),
            initial_window: 0,
            overhead: 0,
            propagate_window: false,
            defer_shutdown_completion: false,
            fail_shutdown: false,
        }
    }

    /// 设定挂载时公告的初始读窗口。
    pub fn with_initial_window(mut self, size: usize) -> Self {
        self.initial_window = size;
        self
    }

    /// 设定单条消息开销。
    pub fn with_overhead(mut self, overhead: usize) -> Self {
        self.overhead = overhead;
        self
    }

    /// 让窗口增量继续经本槽向上游传播。
    pub fn propagating_window(mut self) -> Self {
        self.propagate_window = true;
        self
    }

    /// 关闭完成改为经调度任务异步宣告，模拟挂起的 Handler。
    pub fn deferring_shutdown_completion(mut self) -> Self {
        self.defer_shutdown_completion = true;
        self
    }

    /// 让 `shutdown` 回调返回错误，用于验证关闭序列不因 Handler 故障
    /// 停滞。
    pub fn failing_shutdown(mut self) -> Self {
        self.fail_shutdown = true;
        self
    }

    /// 装箱为可挂载的 Handler 对象。
    pub fn boxed(self) -> Box<dyn ChannelHandler> {
        Box::new(self)
    }
}

impl ChannelHandler for RecordingHandler {
    fn process_read_message(&self, _slot: &Slot, message: IoMessage) -> Result<(), CoreError> {
        self.journal.record(HandlerEvent::ReadMessage {
            label: self.label,
            len: message.len(),
        });
        Ok(())
    }

    fn process_write_message(&self, _slot: &Slot, message: IoMessage) -> Result<(), CoreError> {
        self.journal.record(HandlerEvent::WriteMessage {
            label: self.label,
            len: message.len(),
        });
        let mut message = message;
        message.complete(0);
        Ok(())
    }

    fn increment_read_window(&self, slot: &Slot, size: usize) -> Result<(), CoreError> {
        self.journal.record(HandlerEvent::WindowIncrement {
            label: self.label,
            size,
        });
        if self.propagate_window {
            slot.increment_read_window(size)
        } else {
            Ok(())
        }
    }

    fn shutdown(
        &self,
        slot: &Slot,
        direction: Direction,
        error_code: i32,
        free_scarce_resources: bool,
    ) -> Result<(), CoreError> {
        self.journal.record(HandlerEvent::ShutdownRequested {
            label: self.label,
            direction,
            error_code,
            free_scarce_resources,
        });
        if self.fail_shutdown {
            return Err(CoreError::new(
                codes::HANDLER_FAILURE,
                "handler configured to fail shutdown",
            ));
        }
        if self.defer_shutdown_completion {
            let pending = slot.clone();
            slot.channel().schedule_task_now(ChannelTask::new(
                "recording_handler_shutdown_complete",
                move |status| {
                    if status == TaskStatus::RunReady {
                        let _ = pending.on_handler_shutdown_complete(
                            direction,
                            error_code,
                            free_scarce_resources,
                        );
                    }
                },
            ));
            Ok(())
        } else {
            slot.on_handler_shutdown_complete(direction, error_code, free_scarce_resources)
        }
    }

    fn initial_window_size(&self) -> usize {
        self.initial_window
    }

    fn message_overhead(&self) -> usize {
        self.overhead
    }
}

impl Drop for RecordingHandler {
    fn drop(&mut self) {
        self.journal
            .record(HandlerEvent::Destroyed { label: self.label });
    }
}
