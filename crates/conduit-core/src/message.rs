//! 流水线消息体与进程级分片配置。
//!
//! # 模块职责（What）
//! - [`IoMessage`] 是在插槽链上流动的唯一载荷形态：一段带长度与容量的
//!   字节缓冲、消息类别、可选的复制标记与一次性写完成回调。
//! - [`max_fragment_size`] 暴露进程级“最大分片尺寸”调优项，向消息池
//!   申请载荷时结合链路开销裁剪容量，避免消息在链路中被迫分片。
//!
//! # 所有权共识（Contract）
//! - 消息在成功投递前由发送方持有；投递成功即整体转移给接收插槽的
//!   Handler，由其负责最终释放。释放即 `Drop`，Rust 所有权保证
//!   “恰好释放一次”在结构上成立。

use crate::error::ERROR_CODE_CANCELED;
use alloc::boxed::Box;
use bytes::BytesMut;
use core::fmt;
use core::sync::atomic::{AtomicUsize, Ordering};

/// 进程级最大分片尺寸默认值：16 KiB。
pub const DEFAULT_MAX_FRAGMENT_SIZE: usize = 16 * 1024;

static MAX_FRAGMENT_SIZE: AtomicUsize = AtomicUsize::new(DEFAULT_MAX_FRAGMENT_SIZE);

/// 读取进程级最大分片尺寸。
///
/// 该值在进程初始化后视为只读；运行中修改不影响已申请的消息。
pub fn max_fragment_size() -> usize {
    MAX_FRAGMENT_SIZE.load(Ordering::Relaxed)
}

/// 设置进程级最大分片尺寸。
///
/// # 契约说明（What）
/// - 仅应在进程初始化阶段、任何通道创建之前调用一次；
/// - 传入 `0` 会使后续池申请全部得到零容量消息，属于配置错误。
pub fn set_max_fragment_size(size: usize) {
    MAX_FRAGMENT_SIZE.store(size, Ordering::Relaxed);
}

/// 消息类别，指示载荷处于协议栈的哪一层形态。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum MessageKind {
    /// 应用数据（写方向的常规形态）。
    ApplicationData,
    /// 读方向上承载的应用数据。
    ApplicationDataRead,
    /// 未分类的原始字节。
    Raw,
}

/// 写完成回调：消息被最终写出（或随通道拆除而终止）时恰好调用一次。
///
/// 参数为诊断码：`0` 表示成功写出，非零表示消息未能送达（通道关闭时
/// 统一为 [`ERROR_CODE_CANCELED`]，或由 Handler 传入更具体的原因）。
pub type MessageCompletionFn = Box<dyn FnOnce(i32) + Send + 'static>;

/// 在插槽链上流动的 I/O 消息。
///
/// # 设计背景（Why）
/// - 载荷选用 [`BytesMut`]：同时表达长度与容量语义，并与异步生态的
///   零拷贝惯例对齐，免去手写缓冲结构。
/// - 复制标记（`copy_mark`）供增量消费的 Handler 记录“已处理到哪”，
///   语义由使用它的 Handler 自行约定。
///
/// # 契约说明（What）
/// - `complete` 至多生效一次；若消息被丢弃时回调仍未触发，`Drop` 会以
///   [`ERROR_CODE_CANCELED`] 通知，保证回调恰好执行一次、永不静默丢失。
pub struct IoMessage {
    kind: MessageKind,
    data: BytesMut,
    copy_mark: Option<usize>,
    on_completion: Option<MessageCompletionFn>,
}

impl IoMessage {
    /// 以给定类别与容量创建空消息。
    pub fn new(kind: MessageKind, capacity: usize) -> Self {
        Self {
            kind,
            data: BytesMut::with_capacity(capacity),
            copy_mark: None,
            on_completion: None,
        }
    }

    /// 以现成载荷构造消息，便于测试与回环传输。
    pub fn from_data(kind: MessageKind, data: impl Into<BytesMut>) -> Self {
        Self {
            kind,
            data: data.into(),
            copy_mark: None,
            on_completion: None,
        }
    }

    /// 消息类别。
    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    /// 当前载荷长度（字节）。读窗口按此值扣减。
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// 载荷是否为空。
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// 载荷容量上限。
    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    /// 只读访问载荷。
    pub fn data(&self) -> &BytesMut {
        &self.data
    }

    /// 可写访问载荷。
    pub fn data_mut(&mut self) -> &mut BytesMut {
        &mut self.data
    }

    /// 读取复制标记。
    pub fn copy_mark(&self) -> Option<usize> {
        self.copy_mark
    }

    /// 设置复制标记；传入 `None` 清除。
    pub fn set_copy_mark(&mut self, mark: Option<usize>) {
        self.copy_mark = mark;
    }

    /// 挂载写完成回调，覆盖之前的回调（旧回调被直接丢弃，不再触发）。
    pub fn set_on_completion(&mut self, completion: MessageCompletionFn) {
        self.on_completion = Some(completion);
    }

    /// 是否仍有未触发的完成回调。
    pub fn has_pending_completion(&self) -> bool {
        self.on_completion.is_some()
    }

    /// 触发写完成回调。
    ///
    /// # 契约说明（What）
    /// - 由最终写出该消息的 Handler 调用，`error_code` 为 `0` 表示成功；
    /// - 幂等：重复调用只有第一次生效。
    pub fn complete(&mut self, error_code: i32) {
        if let Some(completion) = self.on_completion.take() {
            completion(error_code);
        }
    }
}

impl fmt::Debug for IoMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoMessage")
            .field("kind", &self.kind)
            .field("len", &self.data.len())
            .field("capacity", &self.data.capacity())
            .field("copy_mark", &self.copy_mark)
            .field("has_completion", &self.on_completion.is_some())
            .finish()
    }
}

impl Drop for IoMessage {
    fn drop(&mut self) {
        // 未写出即被释放的消息仍要通知等待者。
        self.complete(ERROR_CODE_CANCELED);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::sync::Arc;
    use core::sync::atomic::{AtomicI32, AtomicUsize, Ordering};

    #[test]
    fn completion_fires_once_with_explicit_code() {
        let calls = Arc::new(AtomicUsize::new(0));
        let code = Arc::new(AtomicI32::new(i32::MIN));
        let mut msg = IoMessage::new(MessageKind::ApplicationData, 64);
        let (calls_cb, code_cb) = (Arc::clone(&calls), Arc::clone(&code));
        msg.set_on_completion(Box::new(move |err| {
            calls_cb.fetch_add(1, Ordering::SeqCst);
            code_cb.store(err, Ordering::SeqCst);
        }));

        msg.complete(0);
        msg.complete(7);
        drop(msg);

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(code.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn dropping_unsent_message_cancels_completion() {
        let code = Arc::new(AtomicI32::new(0));
        let mut msg = IoMessage::from_data(MessageKind::Raw, &b"abc"[..]);
        let code_cb = Arc::clone(&code);
        msg.set_on_completion(Box::new(move |err| {
            code_cb.store(err, Ordering::SeqCst);
        }));
        drop(msg);
        assert_eq!(code.load(Ordering::SeqCst), ERROR_CODE_CANCELED);
    }

    #[test]
    fn fragment_size_tunable_round_trips() {
        assert_eq!(max_fragment_size(), DEFAULT_MAX_FRAGMENT_SIZE);
        set_max_fragment_size(4096);
        assert_eq!(max_fragment_size(), 4096);
        set_max_fragment_size(DEFAULT_MAX_FRAGMENT_SIZE);
    }

    #[test]
    fn copy_mark_round_trips() {
        let mut msg = IoMessage::from_data(MessageKind::ApplicationDataRead, &b"hello"[..]);
        assert_eq!(msg.len(), 5);
        assert!(msg.copy_mark().is_none());
        msg.set_copy_mark(Some(3));
        assert_eq!(msg.copy_mark(), Some(3));
    }
}
