//! 通道：插槽链的所有者与生命周期状态机。
//!
//! # 模块架构（Why）
//! - 通道把四件耦合的事情收拢在一个所有者之下：插槽链的结构变更、消息
//!   与窗口信用的派发、严格有序的双阶段关闭，以及“外部观察者仍持引用
//!   时安全拆除”的生命周期管理。
//! - 所有业务回调都在绑定的事件循环线程顺序执行；跨线程进入通道的唯一
//!   入口是任务投递与少量原子操作（逻辑引用计数、首个关闭请求）。
//!
//! # 所有权策略（How）
//! - 通道独占持有全部插槽记录（id 索引的 arena），左右邻居以非拥有 id
//!   表达，杜绝循环强引用；Handler 由插槽条目持有，派发时克隆共享引用、
//!   先释放内部锁再调用，使沿链递归（向右投递、向上游补窗）天然合法。
//! - 内部锁从不跨越 Handler 回调持有，这是全模块的不变量。
//!
//! # 生命周期（What）
//! - 逻辑引用计数自 2 起步：一份自引用由 [`Channel::destroy`] 释放，一份
//!   由装配任务执行完毕时释放。计数归零时执行最终拆除：排空任务、析构
//!   Handler、清空插槽链。持有 [`Channel`] 克隆只保证内存安全，不阻止
//!   逻辑拆除；阻止拆除需要显式 [`Channel::acquire_hold`]。

mod slot;

pub use slot::Slot;

use crate::error::{CoreError, ERROR_CODE_CANCELED, codes};
use crate::handler::{ChannelHandler, Direction};
use crate::message::{IoMessage, MessageKind, max_fragment_size};
use crate::runtime::{ChannelTask, EventLoop, LocalObject, LocalObjectKey, LoopTask, TaskStatus};
use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::mem;
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use spin::Mutex;
use tracing::{debug, error, trace};

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// 通道生命周期状态机。
///
/// # 契约说明（What）
/// - `Initializing`：已分配，装配任务尚未在循环线程执行。
/// - `Active`：可进行全双工消息流转与链路变更。
/// - `ShuttingDownRead`：READ 方向自左向右逐槽关闭中。
/// - `ShuttingDownWrite`：WRITE 方向自右向左逐槽关闭中。
/// - `ShutDown`：终态；新任务一律以取消状态立即回调。
///
/// 枚举实现 `Ord`，便于以区间判断表达“已开始关闭”等谓词。
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[non_exhaustive]
pub enum ChannelState {
    Initializing,
    Active,
    ShuttingDownRead,
    ShuttingDownWrite,
    ShutDown,
}

/// 装配完成回调；`error_code` 为 `0` 表示装配成功。
pub type SetupCallback = Box<dyn FnOnce(&Channel, i32) + Send + 'static>;

/// 关闭完成回调；`error_code` 为首个关闭原因，`0` 表示正常关闭。
pub type ShutdownCallback = Box<dyn FnOnce(&Channel, i32) + Send + 'static>;

/// 通道创建回调集合。
///
/// # 契约说明（What）
/// - 每条通道恰好收到一次 `on_setup_completed`；若装配成功，之后恰好
///   收到一次 `on_shutdown_completed`。回调均在事件循环线程执行。
#[derive(Default)]
pub struct ChannelCallbacks {
    /// 装配完成通知。
    pub on_setup_completed: Option<SetupCallback>,
    /// 关闭完成通知。
    pub on_shutdown_completed: Option<ShutdownCallback>,
}

impl ChannelCallbacks {
    /// 构造空回调集合。
    pub fn new() -> Self {
        Self::default()
    }

    /// 挂载装配完成回调。
    pub fn on_setup(mut self, callback: impl FnOnce(&Channel, i32) + Send + 'static) -> Self {
        self.on_setup_completed = Some(Box::new(callback));
        self
    }

    /// 挂载关闭完成回调。
    pub fn on_shutdown(mut self, callback: impl FnOnce(&Channel, i32) + Send + 'static) -> Self {
        self.on_shutdown_completed = Some(Box::new(callback));
        self
    }
}

pub(crate) type SlotId = u64;

/// 单个插槽在关闭流程中的推进位置，仅用于断言与诊断。
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum SlotShutdownState {
    Idle,
    ReadPending,
    ReadDone,
    WritePending,
    WriteDone,
}

pub(crate) struct SlotRecord {
    pub(crate) left: Option<SlotId>,
    pub(crate) right: Option<SlotId>,
    pub(crate) handler: Option<Arc<dyn ChannelHandler>>,
    /// 挂载时缓存的单条消息开销，链路重算时无需再进入 Handler。
    pub(crate) handler_overhead: usize,
    pub(crate) window_size: usize,
    pub(crate) upstream_message_overhead: usize,
    pub(crate) shutdown_state: SlotShutdownState,
}

impl SlotRecord {
    fn detached() -> Self {
        Self {
            left: None,
            right: None,
            handler: None,
            handler_overhead: 0,
            window_size: 0,
            upstream_message_overhead: 0,
            shutdown_state: SlotShutdownState::Idle,
        }
    }
}

pub(crate) struct ChannelInner {
    pub(crate) state: ChannelState,
    pub(crate) slots: BTreeMap<SlotId, SlotRecord>,
    pub(crate) first: Option<SlotId>,
    next_slot_id: SlotId,
    /// 装配完成前在通道内部排队的任务，激活时统一冲洗到循环。
    pending: Vec<(ChannelTask, u64)>,
    /// 已交给循环、仍可被取消清扫命中的通道任务登记簿。
    registry: BTreeMap<u64, ChannelTask>,
    next_task_id: u64,
    on_setup_completed: Option<SetupCallback>,
    on_shutdown_completed: Option<ShutdownCallback>,
    torn_down: bool,
}

/// 允许从任意线程触碰的那部分状态，独立加锁以缩短临界区。
struct CrossThreadState {
    inbox: Vec<(ChannelTask, u64)>,
    drain_posted: bool,
    is_shut_down: bool,
    /// 首个关闭请求（错误码 + 稀缺资源立即释放标志）；先到者胜出。
    shutdown_request: Option<(i32, bool)>,
}

pub(crate) struct ChannelCore {
    pub(crate) id: u64,
    pub(crate) event_loop: Arc<dyn EventLoop>,
    pub(crate) inner: Mutex<ChannelInner>,
    cross: Mutex<CrossThreadState>,
    refcount: AtomicUsize,
}

/// 通道句柄。
///
/// # 契约说明（What）
/// - 句柄可自由克隆并跨线程传递；克隆仅保证底层内存可安全访问，不计入
///   逻辑引用计数。希望阻止逻辑拆除的外部观察者必须配对调用
///   [`acquire_hold`](Self::acquire_hold) / [`release_hold`](Self::release_hold)。
/// - 跨线程安全的操作仅限：任务投递、`shutdown`、hold 操作、`destroy`
///   与 [`thread_is_callers_thread`](Self::thread_is_callers_thread)；其余
///   操作要求调用方处于通道线程，调试构建下会断言。
#[derive(Clone)]
pub struct Channel {
    pub(crate) core: Arc<ChannelCore>,
}

impl Channel {
    /// 创建绑定到给定事件循环的通道。
    ///
    /// # 执行逻辑（How）
    /// 1. 逻辑引用计数置 2：一份自引用由 [`destroy`](Self::destroy) 释放，
    ///    一份由装配任务持有；
    /// 2. 立即向循环投递装配任务，该任务在循环线程将状态推进到
    ///    `Active`、冲洗待命任务并触发 `on_setup_completed`；
    /// 3. 若循环以取消状态交还装配任务，`on_setup_completed` 以非零码
    ///    通知，通道仍需由调用方 `destroy`。
    pub fn new(event_loop: Arc<dyn EventLoop>, callbacks: ChannelCallbacks) -> Channel {
        let id = NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed);
        let core = Arc::new(ChannelCore {
            id,
            event_loop,
            inner: Mutex::new(ChannelInner {
                state: ChannelState::Initializing,
                slots: BTreeMap::new(),
                first: None,
                next_slot_id: 1,
                pending: Vec::new(),
                registry: BTreeMap::new(),
                next_task_id: 1,
                on_setup_completed: callbacks.on_setup_completed,
                on_shutdown_completed: callbacks.on_shutdown_completed,
                torn_down: false,
            }),
            cross: Mutex::new(CrossThreadState {
                inbox: Vec::new(),
                drain_posted: false,
                is_shut_down: false,
                shutdown_request: None,
            }),
            refcount: AtomicUsize::new(2),
        });

        debug!(channel = id, "beginning creation and setup of new channel");
        let setup_core = Arc::clone(&core);
        core.event_loop.schedule_task_now(LoopTask::new(
            "channel_setup_complete",
            move |status| setup_complete(&setup_core, status),
        ));

        Channel { core }
    }

    /// 诊断用通道标识。
    pub fn id(&self) -> u64 {
        self.core.id
    }

    /// 当前生命周期状态。
    pub fn state(&self) -> ChannelState {
        self.core.inner.lock().state
    }

    /// 判定当前线程是否为通道的事件循环线程。可从任意线程调用。
    pub fn thread_is_callers_thread(&self) -> bool {
        self.core.event_loop.is_on_this_thread()
    }

    /// 读取事件循环的单调时钟（纳秒）。
    pub fn current_clock_time(&self) -> u64 {
        self.core.event_loop.current_clock_nanos()
    }

    /// 透传：按键读取事件循环本地存储。
    pub fn fetch_local_object(&self, key: LocalObjectKey) -> Option<LocalObject> {
        self.core.event_loop.fetch_local_object(key)
    }

    /// 透传：按键写入事件循环本地存储。
    pub fn put_local_object(
        &self,
        key: LocalObjectKey,
        object: LocalObject,
    ) -> Result<(), CoreError> {
        self.core.event_loop.put_local_object(key, object)
    }

    /// 透传：按键移除事件循环本地存储对象。
    pub fn remove_local_object(&self, key: LocalObjectKey) -> Option<LocalObject> {
        self.core.event_loop.remove_local_object(key)
    }

    /// 从循环消息池租借消息。
    ///
    /// # 契约说明（What）
    /// - `size_hint` 会先按 `max_fragment_size() - 头插槽上游开销` 裁剪，
    ///   使返回的消息在典型链路开销下无需分片即可穿过整条流水线；
    /// - 返回消息的实际容量可能小于请求值，调用方必须检查边界。
    pub fn acquire_message_from_pool(
        &self,
        kind: MessageKind,
        size_hint: usize,
    ) -> Result<IoMessage, CoreError> {
        self.debug_assert_on_channel_thread();
        let head_overhead = {
            let inner = self.core.inner.lock();
            inner
                .first
                .and_then(|id| inner.slots.get(&id))
                .map(|rec| rec.upstream_message_overhead)
                .unwrap_or(0)
        };
        let clamped = size_hint.min(max_fragment_size().saturating_sub(head_overhead));
        let message = self.core.event_loop.acquire_message_from_pool(kind, clamped)?;
        trace!(
            channel = self.core.id,
            requested = size_hint,
            granted = message.capacity(),
            "acquired message from pool"
        );
        Ok(message)
    }

    /// 返回头部插槽（若有）。
    pub fn first_slot(&self) -> Option<Slot> {
        let first = self.core.inner.lock().first;
        first.map(|id| Slot::from_parts(Arc::clone(&self.core), id))
    }

    /// 分配一个尚未挂载 Handler 的新插槽。
    ///
    /// 通道里第一个插槽自动成为链头；后续插槽需经
    /// [`Slot::insert_right`]、[`Slot::insert_left`] 或
    /// [`slot_insert_end`](Self::slot_insert_end) 接入链路。
    pub fn new_slot(&self) -> Slot {
        self.debug_assert_on_channel_thread();
        let mut inner = self.core.inner.lock();
        let id = inner.next_slot_id;
        inner.next_slot_id += 1;
        inner.slots.insert(id, SlotRecord::detached());
        if inner.first.is_none() {
            inner.first = Some(id);
        }
        trace!(channel = self.core.id, slot = id, "creating new slot");
        drop(inner);
        Slot::from_parts(Arc::clone(&self.core), id)
    }

    /// 尽快在通道线程执行任务。可从任意线程调用。
    pub fn schedule_task_now(&self, task: ChannelTask) {
        self.register_pending_task(task, 0);
    }

    /// 在单调时钟到达 `run_at_nanos` 时于通道线程执行任务。可从任意线程
    /// 调用；当前时刻经 [`current_clock_time`](Self::current_clock_time) 获取。
    pub fn schedule_task_future(&self, task: ChannelTask, run_at_nanos: u64) {
        self.register_pending_task(task, run_at_nanos);
    }

    /// 发起通道关闭。可从任意线程调用。
    ///
    /// # 契约说明（What）
    /// - 幂等：后续调用均为空操作，首个错误码胜出并最终经
    ///   `on_shutdown_completed` 交还；
    /// - 关闭自最左插槽沿 READ 方向推进到最右，再沿 WRITE 方向折返到
    ///   最左，全程在通道线程执行。
    pub fn shutdown(&self, error_code: i32) {
        self.shutdown_with_urgency(error_code, false);
    }

    /// 以“立即释放稀缺资源”语义发起关闭，用于对抗性场景（如上游拒绝
    /// 服务信号）：每个 Handler 必须在其 `shutdown` 返回前关闭系统句柄。
    pub fn shutdown_with_urgency(&self, error_code: i32, free_scarce_resources: bool) {
        let should_post = {
            let mut cross = self.core.cross.lock();
            if cross.shutdown_request.is_some() {
                false
            } else {
                cross.shutdown_request = Some((error_code, free_scarce_resources));
                true
            }
        };
        if !should_post {
            debug!(
                channel = self.core.id,
                "channel shutdown is already pending, not scheduling another"
            );
            return;
        }

        trace!(channel = self.core.id, error_code, "channel shutdown task is scheduled");
        let core = Arc::clone(&self.core);
        self.schedule_task_now(ChannelTask::new("channel_shutdown", move |_status| {
            run_shutdown_task(&core, error_code, free_scarce_resources);
        }));
    }

    /// 增加一次逻辑引用，阻止通道内存被拆除。可从任意线程调用。
    pub fn acquire_hold(&self) {
        let prev = self.core.refcount.fetch_add(1, Ordering::Relaxed);
        debug_assert!(prev != 0, "不允许复活已拆除的通道");
    }

    /// 释放一次逻辑引用；计数归零时执行最终拆除。可从任意线程调用。
    pub fn release_hold(&self) {
        let prev = self.core.refcount.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev != 0, "逻辑引用计数下溢");
        if prev == 1 {
            // 拆除始终落在通道线程：关闭流程已静默全部 Handler 活动。
            if self.thread_is_callers_thread() {
                final_deletion(&self.core);
            } else {
                let core = Arc::clone(&self.core);
                self.core.event_loop.schedule_task_now(LoopTask::new(
                    "channel_final_deletion",
                    move |_status| final_deletion(&core),
                ));
            }
        }
    }

    /// 标记通道销毁，释放创建时的自引用。
    ///
    /// # 契约说明（What）
    /// - 必须在关闭完成通知之后调用（空通道例外：从未装配 Handler 的
    ///   通道允许跳过关闭流程直接销毁）；
    /// - 恰好调用一次；内存何时真正拆除取决于尚存的 hold 数量。
    pub fn destroy(&self) {
        debug!(channel = self.core.id, "destroying channel");
        self.release_hold();
    }

    pub(crate) fn debug_assert_on_channel_thread(&self) {
        debug_assert!(
            self.thread_is_callers_thread(),
            "该操作仅允许在通道的事件循环线程调用"
        );
    }

    /// “now/future”两种投递共用的登记路径；`run_at_nanos == 0` 表示尽快。
    fn register_pending_task(&self, task: ChannelTask, run_at_nanos: u64) {
        if self.thread_is_callers_thread() {
            let staged: Result<StagedTask, ChannelTask> = {
                let mut inner = self.core.inner.lock();
                match inner.state {
                    ChannelState::ShutDown => Err(task),
                    ChannelState::Initializing => {
                        inner.pending.push((task, run_at_nanos));
                        return;
                    }
                    _ => Ok(stage_with_loop(&mut inner, &self.core, task, run_at_nanos)),
                }
            };
            match staged {
                Ok(staged) => dispatch_staged(&self.core, staged),
                Err(task) => {
                    debug!(
                        channel = self.core.id,
                        type_tag = task.type_tag(),
                        "running channel task immediately as canceled due to shut down channel"
                    );
                    task.run(TaskStatus::Canceled);
                }
            }
            return;
        }

        // 循环线程之外：进入跨线程收件箱，空转非空时补一个排水任务。
        let mut canceled_task = None;
        let mut post_drain = false;
        {
            let mut cross = self.core.cross.lock();
            if cross.is_shut_down {
                canceled_task = Some(task);
            } else {
                cross.inbox.push((task, run_at_nanos));
                if !cross.drain_posted {
                    cross.drain_posted = true;
                    post_drain = true;
                }
            }
        }
        // 取消回调在临界区外执行，避免用户代码再入造成死锁。
        if let Some(task) = canceled_task {
            task.run(TaskStatus::Canceled);
            return;
        }
        if post_drain {
            let core = Arc::clone(&self.core);
            self.core.event_loop.schedule_task_now(LoopTask::new(
                "channel_cross_thread_drain",
                move |status| drain_cross_thread(&core, status),
            ));
        }
    }
}

struct StagedTask {
    wrapper: LoopTask,
    run_at_nanos: u64,
}

/// 在持有内部锁的前提下把任务写入登记簿，返回交给循环的包装任务。
///
/// 包装任务执行时会再次核对通道状态：`ShutDown` 之后一律降格为取消。
fn stage_with_loop(
    inner: &mut ChannelInner,
    core: &Arc<ChannelCore>,
    task: ChannelTask,
    run_at_nanos: u64,
) -> StagedTask {
    let id = inner.next_task_id;
    inner.next_task_id += 1;
    let type_tag = task.type_tag();
    inner.registry.insert(id, task);
    let wrapper_core = Arc::clone(core);
    StagedTask {
        wrapper: LoopTask::new(type_tag, move |status| {
            run_registered_task(&wrapper_core, id, status);
        }),
        run_at_nanos,
    }
}

fn dispatch_staged(core: &Arc<ChannelCore>, staged: StagedTask) {
    trace!(
        channel = core.id,
        type_tag = staged.wrapper.type_tag(),
        run_at = staged.run_at_nanos,
        "scheduling channel task"
    );
    if staged.run_at_nanos == 0 {
        core.event_loop.schedule_task_now(staged.wrapper);
    } else {
        core.event_loop
            .schedule_task_future(staged.wrapper, staged.run_at_nanos);
    }
}

fn run_registered_task(core: &Arc<ChannelCore>, id: u64, status: TaskStatus) {
    let (task, status) = {
        let mut inner = core.inner.lock();
        let task = inner.registry.remove(&id);
        // 关闭完成后才轮到执行的任务一律视为已取消。
        let status = if inner.state == ChannelState::ShutDown {
            TaskStatus::Canceled
        } else {
            status
        };
        (task, status)
    };
    if let Some(task) = task {
        task.run(status);
    }
}

/// 跨线程收件箱的排水任务：`now` 任务就地执行，`future` 任务转登记簿。
fn drain_cross_thread(core: &Arc<ChannelCore>, status: TaskStatus) {
    let burst = {
        let mut cross = core.cross.lock();
        cross.drain_posted = false;
        mem::take(&mut cross.inbox)
    };
    let canceled =
        status == TaskStatus::Canceled || core.inner.lock().state == ChannelState::ShutDown;
    for (task, run_at_nanos) in burst {
        if canceled {
            task.run(TaskStatus::Canceled);
        } else if run_at_nanos == 0 {
            task.run(TaskStatus::RunReady);
        } else {
            let staged = {
                let mut inner = core.inner.lock();
                stage_with_loop(&mut inner, core, task, run_at_nanos)
            };
            dispatch_staged(core, staged);
        }
    }
}

/// 装配任务：在循环线程激活通道并通知调用方。
fn setup_complete(core: &Arc<ChannelCore>, status: TaskStatus) {
    let channel = Channel {
        core: Arc::clone(core),
    };

    if status == TaskStatus::Canceled {
        error!(channel = core.id, "setup task canceled before activation");
        let callback = core.inner.lock().on_setup_completed.take();
        if let Some(callback) = callback {
            callback(&channel, ERROR_CODE_CANCELED);
        }
        channel.release_hold();
        return;
    }

    // 激活前已有关闭请求时，装配通知携带该错误码。
    let setup_error = {
        let cross = core.cross.lock();
        cross.shutdown_request.map(|(code, _)| code).unwrap_or(0)
    };
    let (callback, flushed) = {
        let mut inner = core.inner.lock();
        inner.state = ChannelState::Active;
        let flushed = mem::take(&mut inner.pending);
        (inner.on_setup_completed.take(), flushed)
    };
    for (task, run_at_nanos) in flushed {
        let staged = {
            let mut inner = core.inner.lock();
            stage_with_loop(&mut inner, core, task, run_at_nanos)
        };
        dispatch_staged(core, staged);
    }
    debug!(channel = core.id, "setup complete, notifying caller");
    if let Some(callback) = callback {
        callback(&channel, setup_error);
    }
    channel.release_hold();
}

pub(crate) fn first_with_handler(inner: &ChannelInner) -> Option<SlotId> {
    let mut cursor = inner.first;
    while let Some(id) = cursor {
        let rec = inner.slots.get(&id)?;
        if rec.handler.is_some() {
            return Some(id);
        }
        cursor = rec.right;
    }
    None
}

pub(crate) fn next_right_with_handler(inner: &ChannelInner, from: SlotId) -> Option<SlotId> {
    let mut cursor = inner.slots.get(&from)?.right;
    while let Some(id) = cursor {
        let rec = inner.slots.get(&id)?;
        if rec.handler.is_some() {
            return Some(id);
        }
        cursor = rec.right;
    }
    None
}

pub(crate) fn next_left_with_handler(inner: &ChannelInner, from: SlotId) -> Option<SlotId> {
    let mut cursor = inner.slots.get(&from)?.left;
    while let Some(id) = cursor {
        let rec = inner.slots.get(&id)?;
        if rec.handler.is_some() {
            return Some(id);
        }
        cursor = rec.left;
    }
    None
}

/// 取出插槽当前的 Handler 共享引用；不存在或未挂载时返回 `State` 错误。
pub(crate) fn handler_of(
    core: &Arc<ChannelCore>,
    slot_id: SlotId,
) -> Result<Arc<dyn ChannelHandler>, CoreError> {
    let inner = core.inner.lock();
    inner
        .slots
        .get(&slot_id)
        .and_then(|rec| rec.handler.clone())
        .ok_or_else(|| {
            CoreError::new(
                codes::CHANNEL_SLOT_DETACHED,
                "slot has been removed or carries no handler",
            )
        })
}

/// 链路结构变化后自左向右重算每个插槽的上游消息开销。
pub(crate) fn recompute_upstream_overheads(inner: &mut ChannelInner) {
    let mut overhead = 0usize;
    let mut cursor = inner.first;
    while let Some(id) = cursor {
        let Some(rec) = inner.slots.get_mut(&id) else {
            break;
        };
        rec.upstream_message_overhead = overhead;
        if rec.handler.is_some() {
            overhead = overhead.saturating_add(rec.handler_overhead);
        }
        cursor = rec.right;
    }
}

/// 请求某个插槽的 Handler 开始一个方向的关闭。
///
/// Handler 返回错误不允许使关闭序列停滞：错误被记录后，内核代为推进
/// 完成通知，保证状态机继续行进。
pub(crate) fn shutdown_slot(
    core: &Arc<ChannelCore>,
    slot_id: SlotId,
    direction: Direction,
    error_code: i32,
    free_scarce_resources: bool,
) -> Result<(), CoreError> {
    trace!(
        channel = core.id,
        slot = slot_id,
        %direction,
        error_code,
        "shutting down slot"
    );
    let handler = handler_of(core, slot_id)?;
    let slot = Slot::from_parts(Arc::clone(core), slot_id);
    if let Err(handler_error) =
        handler.shutdown(&slot, direction, error_code, free_scarce_resources)
    {
        error!(
            channel = core.id,
            slot = slot_id,
            %direction,
            %handler_error,
            "handler failed to begin shutdown, advancing on its behalf"
        );
        return handle_shutdown_complete(core, slot_id, direction, error_code, free_scarce_resources);
    }
    Ok(())
}

/// 关闭状态机的推进入口：某插槽宣告一个方向已完成。
pub(crate) fn handle_shutdown_complete(
    core: &Arc<ChannelCore>,
    slot_id: SlotId,
    direction: Direction,
    error_code: i32,
    free_scarce_resources: bool,
) -> Result<(), CoreError> {
    let mut inner = core.inner.lock();
    if inner.state == ChannelState::ShutDown {
        return Ok(());
    }
    debug!(
        channel = core.id,
        slot = slot_id,
        %direction,
        "handler shutdown completed"
    );

    match direction {
        Direction::Read => {
            if let Some(rec) = inner.slots.get_mut(&slot_id) {
                debug_assert!(rec.shutdown_state <= SlotShutdownState::ReadPending);
                rec.shutdown_state = SlotShutdownState::ReadDone;
            }
            if let Some(right) = next_right_with_handler(&inner, slot_id) {
                if let Some(rec) = inner.slots.get_mut(&right) {
                    rec.shutdown_state = SlotShutdownState::ReadPending;
                }
                drop(inner);
                return shutdown_slot(core, right, direction, error_code, free_scarce_resources);
            }

            // READ 阶段在最右侧收尾；换向任务独立投递，避免 Handler 在
            // 自身调用帧尚未退出时经历拆除。
            inner.state = ChannelState::ShuttingDownWrite;
            drop(inner);
            let task_core = Arc::clone(core);
            core.event_loop.schedule_task_now(LoopTask::new(
                "channel_shutdown_write_direction",
                move |_status| {
                    {
                        let mut inner = task_core.inner.lock();
                        if inner.state != ChannelState::ShuttingDownWrite {
                            return;
                        }
                        match inner.slots.get_mut(&slot_id) {
                            Some(rec) => rec.shutdown_state = SlotShutdownState::WritePending,
                            None => return,
                        }
                    }
                    let _ = shutdown_slot(
                        &task_core,
                        slot_id,
                        Direction::Write,
                        error_code,
                        free_scarce_resources,
                    );
                },
            ));
            Ok(())
        }
        Direction::Write => {
            if let Some(rec) = inner.slots.get_mut(&slot_id) {
                debug_assert!(rec.shutdown_state <= SlotShutdownState::WritePending);
                rec.shutdown_state = SlotShutdownState::WriteDone;
            }
            if let Some(left) = next_left_with_handler(&inner, slot_id) {
                if let Some(rec) = inner.slots.get_mut(&left) {
                    rec.shutdown_state = SlotShutdownState::WritePending;
                }
                drop(inner);
                return shutdown_slot(core, left, direction, error_code, free_scarce_resources);
            }

            // 最左侧 WRITE 完成：整条通道关闭。
            inner.state = ChannelState::ShutDown;
            drop(inner);
            core.cross.lock().is_shut_down = true;
            post_completion(core, error_code);
            Ok(())
        }
    }
}

/// 关闭发起任务：在通道线程推进状态并启动 READ 方向的第一跳。
fn run_shutdown_task(core: &Arc<ChannelCore>, error_code: i32, free_scarce_resources: bool) {
    let target = {
        let mut inner = core.inner.lock();
        if inner.state >= ChannelState::ShuttingDownRead {
            return;
        }
        debug!(channel = core.id, error_code, "beginning shutdown process");
        match first_with_handler(&inner) {
            Some(id) => {
                inner.state = ChannelState::ShuttingDownRead;
                if let Some(rec) = inner.slots.get_mut(&id) {
                    rec.shutdown_state = SlotShutdownState::ReadPending;
                }
                Some(id)
            }
            None => {
                inner.state = ChannelState::ShutDown;
                None
            }
        }
    };

    match target {
        Some(first) => {
            trace!(
                channel = core.id,
                slot = first,
                "shutting down the first slot in the read direction"
            );
            let _ = shutdown_slot(core, first, Direction::Read, error_code, free_scarce_resources);
        }
        None => {
            // 没有任何已装配的 Handler：直达终态。
            core.cross.lock().is_shut_down = true;
            trace!(channel = core.id, "shutdown completed");
            post_completion(core, error_code);
        }
    }
}

/// 投递关闭完成通知任务。绕开可取消登记簿：该任务必须在取消清扫之后
/// 仍然执行。
fn post_completion(core: &Arc<ChannelCore>, error_code: i32) {
    let task_core = Arc::clone(core);
    core.event_loop.schedule_task_now(LoopTask::new(
        "channel_shutdown_notify",
        move |_status| completion_sweep(&task_core, error_code),
    ));
}

/// 关闭完成通知：先取消一切仍在排队的通道任务，再通知调用方。
fn completion_sweep(core: &Arc<ChannelCore>, error_code: i32) {
    let channel = Channel {
        core: Arc::clone(core),
    };
    let (canceled, callback) = {
        let mut inner = core.inner.lock();
        debug_assert!(inner.state == ChannelState::ShutDown);
        let mut canceled: Vec<ChannelTask> =
            mem::take(&mut inner.registry).into_values().collect();
        canceled.extend(mem::take(&mut inner.pending).into_iter().map(|(task, _)| task));
        (canceled, inner.on_shutdown_completed.take())
    };
    let stragglers = {
        let mut cross = core.cross.lock();
        mem::take(&mut cross.inbox)
    };
    for task in canceled.into_iter().chain(stragglers.into_iter().map(|(task, _)| task)) {
        debug!(
            channel = core.id,
            type_tag = task.type_tag(),
            "during shutdown, canceling task"
        );
        task.run(TaskStatus::Canceled);
    }
    debug!(channel = core.id, error_code, "shutdown completed, notifying caller");
    if let Some(callback) = callback {
        callback(&channel, error_code);
    }
}

/// 最终拆除：排空任务、析构 Handler、清空插槽链。
///
/// 仅当 `destroy` 已调用且全部 hold 释放（逻辑计数归零）时执行，运行在
/// 通道线程。
fn final_deletion(core: &Arc<ChannelCore>) {
    let (records, leftovers) = {
        let mut inner = core.inner.lock();
        if inner.torn_down {
            return;
        }
        if first_with_handler(&inner).is_none() {
            // 从未装配 Handler 的通道允许跳过关闭流程直接拆除。
            inner.state = ChannelState::ShutDown;
        }
        debug_assert!(
            inner.state == ChannelState::ShutDown,
            "destroy 必须发生在关闭完成之后"
        );
        inner.torn_down = true;
        inner.first = None;
        inner.on_setup_completed = None;
        inner.on_shutdown_completed = None;
        let records: Vec<SlotRecord> = mem::take(&mut inner.slots).into_values().collect();
        let mut leftovers: Vec<ChannelTask> =
            mem::take(&mut inner.registry).into_values().collect();
        leftovers.extend(mem::take(&mut inner.pending).into_iter().map(|(task, _)| task));
        (records, leftovers)
    };
    let stragglers = {
        let mut cross = core.cross.lock();
        cross.is_shut_down = true;
        mem::take(&mut cross.inbox)
    };
    for task in leftovers
        .into_iter()
        .chain(stragglers.into_iter().map(|(task, _)| task))
    {
        task.run(TaskStatus::Canceled);
    }
    // Handler 析构发生在这里：两个方向的关闭都已完成。
    drop(records);
    debug!(channel = core.id, "channel destroyed");
}
