#![cfg_attr(not(feature = "std"), no_std)]
#![deny(unsafe_code)]
#![allow(private_bounds)]
#![doc = "conduit-core: 单线程通道流水线内核。"]
#![doc = ""]
#![doc = "通道在外部事件循环与分层协议 Handler 栈（套接字、TLS、ALPN、应用）之间搬运 I/O 消息，提供："]
#![doc = "1. 双向链接的插槽链，每个插槽承载一个 Handler；"]
#![doc = "2. 基于读窗口信用的消息流转与背压；"]
#![doc = "3. 先 READ（自左向右）后 WRITE（自右向左）的严格有序双阶段关闭状态机；"]
#![doc = "4. 允许外部观察者持引用期间安全拆除的生命周期管理。"]
#![doc = ""]
#![doc = "== 执行模型 =="]
#![doc = "一条通道的全部 Handler 回调、插槽变更与任务都在其绑定的事件循环线程顺序执行；不同通道可以并行运行在不同循环线程上。跨线程进入通道的唯一入口是任务投递与少量原子操作（`shutdown`、hold、`destroy`）。"]
#![doc = ""]
#![doc = "== 内存分配依赖 =="]
#![doc = "本 crate 定位于 `no_std + alloc` 场景：插槽 arena、任务队列与对象安全的能力接口依赖 [`alloc`] 中的 `Box`、`Arc`、`Vec` 等类型。默认开启的 `std` Feature 仅额外启用官方测试替身（[`test_stubs`]）与 `tracing` 的标准库集成。"]

extern crate alloc;

mod sealed;

pub mod channel;
pub mod error;
pub mod handler;
pub mod message;
pub mod runtime;

/// 测试桩命名空间，集中暴露官方维护的确定性替身，供集成测试与示例
/// 复用。
///
/// # 设计背景（Why）
/// - 统一维护常见桩对象（手动泵送的事件循环、记录型 Handler），避免在
///   各处重复定义；
/// - 当核心契约演进时，通过单点更新保证所有测试同步适配。
#[cfg(feature = "std")]
pub mod test_stubs;

pub use channel::{
    Channel, ChannelCallbacks, ChannelState, SetupCallback, ShutdownCallback, Slot,
};
pub use error::{
    CoreError, ERROR_CODE_CANCELED, Error, ErrorCause, ErrorKind, SendError, codes,
};
pub use handler::{ChannelHandler, Direction};
pub use message::{
    DEFAULT_MAX_FRAGMENT_SIZE, IoMessage, MessageCompletionFn, MessageKind, max_fragment_size,
    set_max_fragment_size,
};
pub use runtime::{ChannelTask, EventLoop, LocalObject, LocalObjectKey, LoopTask, TaskStatus};
