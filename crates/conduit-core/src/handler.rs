//! Handler 能力契约：插槽上可插拔的协议阶段。

use crate::channel::Slot;
use crate::error::CoreError;
use crate::message::IoMessage;
use core::fmt;

/// 消息在插槽链上的流动方向。
///
/// # 契约说明（What）
/// - `Read`：自最左（I/O 侧）插槽流向最右（应用侧）插槽。
/// - `Write`：自最右插槽流向最左插槽。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Read => write!(f, "read"),
            Direction::Write => write!(f, "write"),
        }
    }
}

/// 协议阶段处理器的能力接口。
///
/// # 设计背景（Why）
/// - 汇总 Netty `ChannelHandler`、Envoy Filter 等分层协议栈的公共操作面，
///   将套接字、TLS、应用协议统一为“插槽里的一个阶段”。
/// - 方法以 `&self` 接收：派发路径沿链递归（向右投递、向上游补窗）时，
///   上游 Handler 的调用帧可能仍在栈上，独占借用会将这种合法再入拒之
///   门外。可变状态由实现自行以内部可变性管理；一条通道的全部回调在
///   同一事件循环线程顺序执行，实现内的锁永远无竞争。
///
/// # 契约说明（What）
/// - 所有回调都在通道的事件循环线程被调用，必须无阻塞；耗时工作通过
///   [`Channel::schedule_task_now`](crate::channel::Channel::schedule_task_now)
///   移交，再在任务中恢复——这是内核内唯一合法的异步形态。
/// - Handler 由其插槽独占持有，析构恰好一次，且必定发生在两个方向的
///   关闭都完成之后（或插槽被显式摘除/替换时）。
///
/// # 风险提示（Trade-offs）
/// - 请避免在 Handler 内部长期缓存 [`Slot`] 之外的通道引用；逻辑拆除后
///   这些引用只剩诊断价值。
pub trait ChannelHandler: Send + Sync + 'static + crate::sealed::Sealed {
    /// 处理来自左邻居的 READ 消息。
    ///
    /// 消息所有权随调用转移；本插槽的读窗口在回调前已按 `message.len()`
    /// 扣减，若希望继续收到数据，需在未来某时刻调用
    /// [`Slot::increment_read_window`]。典型实现转换载荷后经
    /// [`Slot::send_message`] 继续向右投递。
    fn process_read_message(&self, slot: &Slot, message: IoMessage) -> Result<(), CoreError>;

    /// 处理来自右邻居的 WRITE 消息。所有权随调用转移，典型实现向左转发。
    fn process_write_message(&self, slot: &Slot, message: IoMessage) -> Result<(), CoreError>;

    /// 下游发来窗口增量。
    ///
    /// 实现更新内部状态后，通常调用 [`Slot::increment_read_window`] 以
    /// （可能不同的）增量继续向上游传播。
    fn increment_read_window(&self, slot: &Slot, size: usize) -> Result<(), CoreError>;

    /// 按方向开始关闭本阶段。
    ///
    /// # 契约说明（What）
    /// - 可以同步完成，也可以经调度任务异步完成；无论哪种路径，最终都
    ///   **必须**调用 [`Slot::on_handler_shutdown_complete`]，否则整条
    ///   通道的关闭序列停滞（这是 Handler 缺陷，内核不代偿）。
    /// - `free_scarce_resources` 为真时，易受拒绝服务攻击的稀缺系统资源
    ///   （套接字、文件句柄）必须在本函数返回前释放，哪怕整体清理仍在
    ///   进行。
    fn shutdown(
        &self,
        slot: &Slot,
        direction: Direction,
        error_code: i32,
        free_scarce_resources: bool,
    ) -> Result<(), CoreError>;

    /// 挂载时向上游公告的初始读窗口。
    fn initial_window_size(&self) -> usize;

    /// 本阶段转发每条消息时新增的字节开销，用于下游避免分片。
    fn message_overhead(&self) -> usize;
}
