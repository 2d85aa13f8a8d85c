//! 通道内核的稳定错误域。
//!
//! # 设计背景（Why）
//! - 插槽链、任务调度与关闭状态机在不同层次产生的故障需要合流为统一的
//!   错误形态，以便日志与上层治理逻辑执行精确分类。
//! - 框架需兼容 `no_std + alloc` 场景，因此不依赖 `std::error::Error`，
//!   而是提供等价的轻量抽象。
//!
//! # 契约说明（What）
//! - 错误码 `code` 始终为 `'static` 字符串，遵循 `<域>.<语义>` 命名；
//!   [`codes`] 模块枚举了全部稳定码值。
//! - [`ErrorKind`] 将每个错误映射到五类处置语义：容量、状态、资源、
//!   Handler 与装配。
//! - 发送失败必须连同消息所有权一起返还调用方，见 [`SendError`]。

use crate::message::IoMessage;
use alloc::{borrow::Cow, boxed::Box};
use core::fmt;

/// 回调层使用的“已取消”诊断码。
///
/// # 契约说明（What）
/// - 关闭原因在用户回调之间以 `i32` 形式流转（`0` 表示无错误）；
/// - 当任务或未完成的消息因通道拆除而终止时，统一以该值通知回调，
///   避免与用户自定义的正数错误码冲突。
pub const ERROR_CODE_CANCELED: i32 = -1;

/// `conduit-core` 中所有错误链节点实现的 `no_std` 基础 Trait。
///
/// # 设计背景（Why）
/// - `std::error::Error` 在 `no_std` 环境不可用；该 Trait 作为错误类型的
///   最小公共接口，在 `alloc` 场景下完成跨模块错误传递。
///
/// # 契约说明（What）
/// - `source` 返回链路上游错误，语义与 `std::error::Error::source` 一致；
///   若底层错误不提供来源，错误链在此终止。
pub trait Error: fmt::Debug + fmt::Display + crate::sealed::Sealed {
    /// 返回当前错误的上游来源。
    fn source(&self) -> Option<&(dyn Error + 'static)>;
}

impl<E> Error for Box<E>
where
    E: Error + ?Sized,
{
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        (**self).source()
    }
}

/// 线程安全的错误链别名，供 [`CoreError::with_cause`] 使用。
pub type ErrorCause = Box<dyn Error + Send + Sync + 'static>;

/// 错误处置分类，对应内核对每类故障的标准反应。
///
/// # 契约说明（What）
/// - `Capacity`：消息超出下游窗口或池上限，调用方应等待信用或拆分消息。
/// - `State`：当前生命周期状态不允许该操作（如重复挂载 Handler）。
/// - `Resource`：资源申请失败（分配器、消息池）。
/// - `Handler`：Handler 回调主动返回的业务错误。
/// - `Setup`：通道装配阶段失败，经由 `on_setup_completed` 通知。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorKind {
    Capacity,
    State,
    Resource,
    Handler,
    Setup,
}

/// 稳定错误码表。
///
/// # 设计背景（Why）
/// - 错误码是日志、指标与自动化治理共同依赖的机读契约；集中登记可防止
///   调用点散落裸字符串导致命名漂移。
///
/// # 契约说明（What）
/// - 每个码值遵循 `<域>.<语义>` 约定，新增码值必须同步登记
///   [`kind_of`](self::kind_of) 的分类表。
pub mod codes {
    /// READ 方向消息长度超过下游插槽的剩余读窗口。
    pub const CHANNEL_READ_WOULD_EXCEED_WINDOW: &str = "channel.read_would_exceed_window";
    /// 目标方向上不存在可接收消息的相邻 Handler。
    pub const CHANNEL_MESSAGE_UNDELIVERABLE: &str = "channel.message_undeliverable";
    /// 操作与通道当前生命周期状态冲突。
    pub const CHANNEL_INVALID_STATE: &str = "channel.invalid_state";
    /// 插槽已挂载 Handler，拒绝二次挂载。
    pub const CHANNEL_SLOT_HANDLER_ALREADY_SET: &str = "channel.slot_handler_already_set";
    /// 插槽已从链上摘除，或其 Handler 正处于回调派发中不可重入。
    pub const CHANNEL_SLOT_DETACHED: &str = "channel.slot_detached";
    /// 通道装配任务未能在事件循环上完成。
    pub const CHANNEL_SETUP_FAILED: &str = "channel.setup_failed";
    /// Handler 回调返回了业务错误。
    pub const HANDLER_FAILURE: &str = "handler.failure";
    /// 消息池无法满足本次申请。
    pub const POOL_EXHAUSTED: &str = "pool.exhausted";
    /// 申请的消息尺寸超过池的单消息上限。
    pub const POOL_MESSAGE_TOO_LARGE: &str = "pool.message_too_large";
    /// 事件循环本地存储中已存在同键对象。
    pub const LOOP_LOCAL_OBJECT_EXISTS: &str = "event_loop.local_object_exists";
}

/// 按错误码查询默认处置分类。
///
/// 未登记的自定义码值回退为 [`ErrorKind::State`]，提醒扩展方补充分类。
pub fn kind_of(code: &str) -> ErrorKind {
    match code {
        codes::CHANNEL_READ_WOULD_EXCEED_WINDOW | codes::POOL_MESSAGE_TOO_LARGE => {
            ErrorKind::Capacity
        }
        codes::POOL_EXHAUSTED => ErrorKind::Resource,
        codes::HANDLER_FAILURE => ErrorKind::Handler,
        codes::CHANNEL_SETUP_FAILED => ErrorKind::Setup,
        _ => ErrorKind::State,
    }
}

/// `CoreError` 是内核全部可观察错误的最终形态。
///
/// # 设计背景（Why）
/// - 结构体以 Builder 风格方法叠加上下文信息（分类与底层原因），并通过
///   `source()` 暴露完整链路；`code` 承载稳定语义，`message` 面向排障人员。
///
/// # 契约说明（What）
/// - **前置条件**：调用方必须使用 [`codes`] 模块或遵循 `<域>.<语义>`
///   约定的自定义码值。
/// - **返回值**：构造函数返回拥有所有权的 `CoreError`，可安全跨线程移动。
/// - **后置条件**：除非显式调用 `with_*` 方法，错误不含额外上下文。
#[derive(Debug)]
pub struct CoreError {
    code: &'static str,
    message: Cow<'static, str>,
    kind: ErrorKind,
    cause: Option<ErrorCause>,
}

impl CoreError {
    /// 构造核心错误，分类按 [`kind_of`] 的登记表推导。
    pub fn new(code: &'static str, message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            code,
            message: message.into(),
            kind: kind_of(code),
            cause: None,
        }
    }

    /// 覆盖默认分类，供业务扩展精细化处置策略。
    pub fn with_kind(mut self, kind: ErrorKind) -> Self {
        self.kind = kind;
        self
    }

    /// 附带底层原因并返回新的核心错误。
    pub fn with_cause(mut self, cause: impl Error + Send + Sync + 'static) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// 获取稳定错误码。
    pub fn code(&self) -> &'static str {
        self.code
    }

    /// 获取面向排障人员的描述。
    pub fn message(&self) -> &str {
        &self.message
    }

    /// 获取处置分类。
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// 获取底层原因（若有）。
    pub fn cause(&self) -> Option<&(dyn Error + 'static)> {
        match &self.cause {
            Some(cause) => Some(&**cause),
            None => None,
        }
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl Error for CoreError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.cause()
    }
}

/// 消息发送失败的返回形态：错误与消息所有权一起回到调用方。
///
/// # 设计背景（Why）
/// - 发送语义约定“成功即转移所有权，失败则调用方继续持有”；在 Rust 中
///   这必须体现在类型上，否则失败路径会悄悄丢弃消息。
///
/// # 契约说明（What）
/// - `message`：未被接收方接管的原消息，调用方可重试、缓存或释放。
/// - `error`：拒收原因，窗口超限为 [`ErrorKind::Capacity`]，邻居缺失或
///   状态不符为 [`ErrorKind::State`]。
#[derive(Debug)]
pub struct SendError {
    /// 返还给调用方的消息。
    pub message: IoMessage,
    /// 拒收原因。
    pub error: CoreError,
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "message of {} bytes rejected: {}",
            self.message.len(),
            self.error
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_map_to_expected_kinds() {
        assert_eq!(
            kind_of(codes::CHANNEL_READ_WOULD_EXCEED_WINDOW),
            ErrorKind::Capacity
        );
        assert_eq!(kind_of(codes::POOL_EXHAUSTED), ErrorKind::Resource);
        assert_eq!(kind_of(codes::HANDLER_FAILURE), ErrorKind::Handler);
        assert_eq!(kind_of(codes::CHANNEL_SETUP_FAILED), ErrorKind::Setup);
        assert_eq!(kind_of(codes::CHANNEL_INVALID_STATE), ErrorKind::State);
        assert_eq!(kind_of("custom.unregistered"), ErrorKind::State);
    }

    #[test]
    fn display_carries_code_and_message() {
        let err = CoreError::new(codes::CHANNEL_INVALID_STATE, "channel is shut down");
        assert_eq!(
            alloc::format!("{err}"),
            "channel.invalid_state: channel is shut down"
        );
        assert!(err.cause().is_none(), "初始错误默认不含底层原因");
    }

    #[test]
    fn cause_chain_is_reachable_via_source() {
        let inner = CoreError::new(codes::POOL_EXHAUSTED, "pool dry");
        let outer =
            CoreError::new(codes::CHANNEL_SETUP_FAILED, "setup aborted").with_cause(inner);
        let source = outer.source().expect("来源错误应可见");
        assert_eq!(alloc::format!("{source}"), "pool.exhausted: pool dry");
    }
}
