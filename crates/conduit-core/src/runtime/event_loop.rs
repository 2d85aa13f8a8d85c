//! 事件循环能力契约。

use crate::error::CoreError;
use crate::message::{IoMessage, MessageKind};
use crate::runtime::task::TaskStatus;
use alloc::boxed::Box;
use alloc::sync::Arc;
use core::any::Any;
use core::fmt;

/// 事件循环本地存储的键。
///
/// 调用方自行保证键空间不冲突；惯例是取某个静态量的地址或集中登记的
/// 常量值。
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LocalObjectKey(pub u64);

/// 事件循环本地存储的值：任意可共享对象。
pub type LocalObject = Arc<dyn Any + Send + Sync + 'static>;

/// 直接交给事件循环执行的一次性任务。
///
/// # 设计背景（Why）
/// - 通道内部把用户的 [`ChannelTask`](crate::runtime::ChannelTask) 包装为
///   `LoopTask` 再投递，从而在执行点注入取消判定与登记簿清理；
/// - 状态机自身的推进任务（装配完成、读写换向、关闭通知）也以该形态
///   直接投递，绕开可取消的任务登记簿——关闭完成路径必须在取消清扫
///   之后仍能执行。
///
/// # 契约说明（What）
/// - 循环必须恰好执行一次任务函数：正常时机传 [`TaskStatus::RunReady`]，
///   循环自身关停时传 [`TaskStatus::Canceled`]。
pub struct LoopTask {
    type_tag: &'static str,
    task_fn: Box<dyn FnOnce(TaskStatus) + Send + 'static>,
}

impl LoopTask {
    /// 以诊断标签与任务函数构造循环任务。
    pub fn new(type_tag: &'static str, task_fn: impl FnOnce(TaskStatus) + Send + 'static) -> Self {
        Self {
            type_tag,
            task_fn: Box::new(task_fn),
        }
    }

    /// 诊断标签。
    pub fn type_tag(&self) -> &'static str {
        self.type_tag
    }

    /// 消费任务并以给定状态执行。由事件循环实现调用。
    pub fn run(self, status: TaskStatus) {
        (self.task_fn)(status);
    }
}

impl fmt::Debug for LoopTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopTask")
            .field("type_tag", &self.type_tag)
            .finish()
    }
}

/// 事件循环能力接口：通道生命周期内绑定的单线程任务执行者。
///
/// # 设计背景（Why）
/// - 内核不关心 I/O 多路复用与定时器的实现形态，仅依赖“单线程顺序执行
///   已调度任务”这一项保证；借此同一套内核可以运行在 epoll、kqueue、
///   完全虚拟化的测试循环之上。
///
/// # 契约说明（What）
/// - `schedule_task_now` / `schedule_task_future`：可从任意线程调用；循环
///   保证任务在其专属线程执行恰好一次，`now` 任务之间维持 FIFO。
/// - `current_clock_nanos`：单调时钟，供未来任务定时与超时推算。
/// - `is_on_this_thread`：判定调用方是否就是循环线程，可从任意线程调用。
/// - 本地存储三件套：循环线程内使用的键值缓存，供跨通道共享池类资源。
/// - `acquire_message_from_pool`：从循环拥有的消息池租借消息；`size_hint`
///   仅是提示，返回消息的容量可能更小，调用方必须检查边界。
///
/// # 前置/后置条件（Contract）
/// - **前置**：实现必须线程安全（`Send + Sync`）；任务执行期间不得并发
///   调度同一循环上的其他任务。
/// - **后置**：循环关停时，尚未执行的任务必须以 [`TaskStatus::Canceled`]
///   逐一回调，不得静默丢弃。
pub trait EventLoop: Send + Sync + 'static + crate::sealed::Sealed {
    /// 尽快在循环线程执行任务。
    fn schedule_task_now(&self, task: LoopTask);

    /// 在单调时钟到达 `run_at_nanos` 时执行任务。
    fn schedule_task_future(&self, task: LoopTask, run_at_nanos: u64);

    /// 读取循环的单调时钟（纳秒）。
    fn current_clock_nanos(&self) -> u64;

    /// 判定当前线程是否为循环线程。
    fn is_on_this_thread(&self) -> bool;

    /// 按键读取本地存储对象。
    fn fetch_local_object(&self, key: LocalObjectKey) -> Option<LocalObject>;

    /// 按键写入本地存储对象；键已占用时返回错误。
    fn put_local_object(&self, key: LocalObjectKey, object: LocalObject)
    -> Result<(), CoreError>;

    /// 按键移除本地存储对象，返回被移除的值。
    fn remove_local_object(&self, key: LocalObjectKey) -> Option<LocalObject>;

    /// 从循环的消息池租借一条消息。
    fn acquire_message_from_pool(
        &self,
        kind: MessageKind,
        size_hint: usize,
    ) -> Result<IoMessage, CoreError>;
}
