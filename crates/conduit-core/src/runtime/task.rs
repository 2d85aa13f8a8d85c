//! 通道任务：跨线程进入通道线程的最小可调度单元。

use alloc::boxed::Box;
use core::fmt;

/// 任务被执行时的最终状态。
///
/// # 契约说明（What）
/// - `RunReady`：任务在预期时机正常执行。
/// - `Canceled`：通道在任务执行前已拆除；任务函数仍会被调用恰好一次，
///   以便用户代码释放自身状态，但不得再访问通道的业务能力。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum TaskStatus {
    RunReady,
    Canceled,
}

/// 投递到通道线程执行的一次性任务。
///
/// # 设计背景（Why）
/// - 通道的全部业务回调都在其事件循环线程执行；任何线程想“进入”通道，
///   唯一合法方式就是提交一个 `ChannelTask`。
/// - `type_tag` 为诊断标签：任务在日志中以稳定名称出现，便于观测聚合。
///
/// # 契约说明（What）
/// - **前置条件**：闭包必须 `Send`，提交后所有权交给通道，调用方不再
///   访问。
/// - **后置条件**：闭包恰好执行一次——正常时机以 `RunReady`，通道拆除
///   时以 `Canceled`。
pub struct ChannelTask {
    type_tag: &'static str,
    task_fn: Box<dyn FnOnce(TaskStatus) + Send + 'static>,
}

impl ChannelTask {
    /// 以诊断标签与任务函数构造任务。
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

    /// 消费任务并以给定状态执行。
    pub(crate) fn run(self, status: TaskStatus) {
        (self.task_fn)(status);
    }
}

impl fmt::Debug for ChannelTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelTask")
            .field("type_tag", &self.type_tag)
            .finish()
    }
}
