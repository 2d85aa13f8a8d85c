//! 契约化的运行时表面。
//!
//! # 契约声明
//! - **Contract-only**：本模块仅定义内核可消费的事件循环抽象 API，不落地
//!   任何具体执行器；实现由宿主运行时（或 [`crate::test_stubs`] 中的官方
//!   测试替身）在外部提供。
//! - **单线程执行保证**：事件循环承诺其上调度的任务在同一线程顺序执行，
//!   这是整条插槽链免锁推理的根基。
//! - **解耦外设**：接口以 `Send + Sync + 'static` 能力描述，对具体 I/O
//!   多路复用器、定时器实现完全解耦。

mod event_loop;
mod task;

pub use event_loop::{EventLoop, LocalObject, LocalObjectKey, LoopTask};
pub use task::{ChannelTask, TaskStatus};
