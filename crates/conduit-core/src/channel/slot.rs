//! 插槽：Handler 链上的一个位置。
//!
//! # 设计背景（Why）
//! - 插槽把“链表节点”与“Handler 宿主”合二为一：持有左右邻居、本槽
//!   向上游公告的剩余读信用，以及左侧全部 Handler 的累计消息开销。
//! - 对外暴露的 [`Slot`] 是轻量句柄（通道共享引用 + 槽位 id），真正的
//!   记录存放在通道独占的 arena 中；句柄可被 Handler 自由克隆保存，
//!   不构成循环强引用。

use super::{
    Channel, ChannelCore, ChannelState, SlotId, handle_shutdown_complete, handler_of,
    recompute_upstream_overheads, shutdown_slot,
};
use crate::error::{CoreError, SendError, codes};
use crate::handler::{ChannelHandler, Direction};
use crate::message::IoMessage;
use alloc::boxed::Box;
use alloc::sync::Arc;
use core::fmt;
use tracing::{error, trace};

/// 插槽句柄。
///
/// 除非另行注明，全部操作要求调用方处于通道的事件循环线程（调试构建
/// 下断言）。句柄生命周期与底层记录解耦：记录被摘除后，句柄上的操作
/// 以 `State` 错误拒绝。
#[derive(Clone)]
pub struct Slot {
    core: Arc<ChannelCore>,
    id: SlotId,
}

impl Slot {
    pub(crate) fn from_parts(core: Arc<ChannelCore>, id: SlotId) -> Self {
        Self { core, id }
    }

    /// 诊断用槽位标识。
    pub fn id(&self) -> u64 {
        self.id
    }

    /// 返回所属通道的句柄。
    pub fn channel(&self) -> Channel {
        Channel {
            core: Arc::clone(&self.core),
        }
    }

    /// 为空插槽挂载 Handler。
    ///
    /// # 契约说明（What）
    /// - 已挂载过的插槽拒绝二次挂载；
    /// - 挂载时以 `initial_window_size()` 初始化本槽读窗口、重算整条链
    ///   的上游开销，并把初始信用经窗口增量向上游公告（没有左邻居时
    ///   公告步骤自然退化为空操作）。
    pub fn set_handler(&self, handler: Box<dyn ChannelHandler>) -> Result<(), CoreError> {
        self.channel().debug_assert_on_channel_thread();
        let initial_window = {
            let mut inner = self.core.inner.lock();
            let Some(rec) = inner.slots.get_mut(&self.id) else {
                return Err(slot_detached());
            };
            if rec.handler.is_some() {
                return Err(CoreError::new(
                    codes::CHANNEL_SLOT_HANDLER_ALREADY_SET,
                    "slot already hosts a handler",
                ));
            }
            let overhead = handler.message_overhead();
            let initial_window = handler.initial_window_size();
            rec.handler = Some(Arc::from(handler));
            rec.handler_overhead = overhead;
            recompute_upstream_overheads(&mut inner);
            initial_window
        };
        trace!(
            channel = self.core.id,
            slot = self.id,
            initial_window,
            "handler attached to slot"
        );
        self.increment_read_window(initial_window)
    }

    /// 将消息递交给 `direction` 方向上的相邻插槽。
    ///
    /// # 契约说明（What）
    /// - READ：若 `message.len()` 超过右邻居的剩余读窗口则拒收（这始终
    ///   是调用方的编程错误）；接受时先扣减窗口，再调用右邻 Handler。
    /// - WRITE：不做窗口检查——写方向的流控属于 Handler 业务。
    /// - `Ok(())` 意味着邻居已接管消息（即使其 Handler 稍后丢弃它）；
    ///   `Err` 则消息原封不动地随 [`SendError`] 返还调用方。
    /// - Handler 在接管消息之后报出的错误不再回传发送方（所有权已经
    ///   转移），内核记录日志，由出错方负责触发通道关闭。
    pub fn send_message(
        &self,
        message: IoMessage,
        direction: Direction,
    ) -> Result<(), SendError> {
        self.channel().debug_assert_on_channel_thread();
        match direction {
            Direction::Read => self.send_read(message),
            Direction::Write => self.send_write(message),
        }
    }

    fn send_read(&self, message: IoMessage) -> Result<(), SendError> {
        let (target, handler) = {
            let mut inner = self.core.inner.lock();
            if inner.state == ChannelState::ShutDown {
                return Err(reject(
                    message,
                    codes::CHANNEL_INVALID_STATE,
                    "channel is shut down",
                ));
            }
            let right = match inner.slots.get(&self.id) {
                Some(rec) => rec.right,
                None => return Err(reject(message, codes::CHANNEL_SLOT_DETACHED, "slot removed")),
            };
            let Some(right) = right else {
                return Err(reject(
                    message,
                    codes::CHANNEL_MESSAGE_UNDELIVERABLE,
                    "no slot to the right",
                ));
            };
            let Some(rec) = inner.slots.get_mut(&right) else {
                return Err(reject(
                    message,
                    codes::CHANNEL_MESSAGE_UNDELIVERABLE,
                    "right slot removed",
                ));
            };
            let Some(handler) = rec.handler.clone() else {
                return Err(reject(
                    message,
                    codes::CHANNEL_MESSAGE_UNDELIVERABLE,
                    "right slot carries no handler",
                ));
            };
            if message.len() > rec.window_size {
                let window = rec.window_size;
                drop(inner);
                error!(
                    channel = self.core.id,
                    from = self.id,
                    to = right,
                    len = message.len(),
                    window,
                    "read message would exceed the downstream read window, \
                     this is always a programming error"
                );
                return Err(reject(
                    message,
                    codes::CHANNEL_READ_WOULD_EXCEED_WINDOW,
                    "message exceeds downstream read window",
                ));
            }
            rec.window_size -= message.len();
            (right, handler)
        };

        trace!(
            channel = self.core.id,
            from = self.id,
            to = target,
            len = message.len(),
            "sending read message"
        );
        let slot = Slot::from_parts(Arc::clone(&self.core), target);
        if let Err(handler_error) = handler.process_read_message(&slot, message) {
            error!(
                channel = self.core.id,
                slot = target,
                %handler_error,
                "read handler failed after taking message ownership"
            );
        }
        Ok(())
    }

    fn send_write(&self, message: IoMessage) -> Result<(), SendError> {
        let (target, handler) = {
            let inner = self.core.inner.lock();
            if inner.state == ChannelState::ShutDown {
                return Err(reject(
                    message,
                    codes::CHANNEL_INVALID_STATE,
                    "channel is shut down",
                ));
            }
            let left = match inner.slots.get(&self.id) {
                Some(rec) => rec.left,
                None => return Err(reject(message, codes::CHANNEL_SLOT_DETACHED, "slot removed")),
            };
            let Some(left) = left else {
                return Err(reject(
                    message,
                    codes::CHANNEL_MESSAGE_UNDELIVERABLE,
                    "no slot to the left",
                ));
            };
            let Some(handler) = inner.slots.get(&left).and_then(|rec| rec.handler.clone())
            else {
                return Err(reject(
                    message,
                    codes::CHANNEL_MESSAGE_UNDELIVERABLE,
                    "left slot carries no handler",
                ));
            };
            (left, handler)
        };

        trace!(
            channel = self.core.id,
            from = self.id,
            to = target,
            len = message.len(),
            "sending write message"
        );
        let slot = Slot::from_parts(Arc::clone(&self.core), target);
        if let Err(handler_error) = handler.process_write_message(&slot, message) {
            error!(
                channel = self.core.id,
                slot = target,
                %handler_error,
                "write handler failed after taking message ownership"
            );
        }
        Ok(())
    }

    /// 向上游（左侧）发出窗口增量通知。
    ///
    /// 本槽窗口按饱和加法增长；随后通知左邻 Handler，由其决定是否继续
    /// 向上游传播。通道一旦开始关闭，窗口更新被静默忽略。
    pub fn increment_read_window(&self, size: usize) -> Result<(), CoreError> {
        self.channel().debug_assert_on_channel_thread();
        let upstream = {
            let mut inner = self.core.inner.lock();
            if inner.state >= ChannelState::ShuttingDownRead {
                return Ok(());
            }
            let Some(rec) = inner.slots.get_mut(&self.id) else {
                return Err(slot_detached());
            };
            rec.window_size = rec.window_size.saturating_add(size);
            let left = rec.left;
            left.and_then(|id| {
                inner
                    .slots
                    .get(&id)
                    .and_then(|rec| rec.handler.clone())
                    .map(|handler| (id, handler))
            })
        };

        if let Some((left, handler)) = upstream {
            trace!(
                channel = self.core.id,
                slot = self.id,
                upstream = left,
                size,
                "propagating read window increment"
            );
            let slot = Slot::from_parts(Arc::clone(&self.core), left);
            handler.increment_read_window(&slot, size)
        } else {
            Ok(())
        }
    }

    /// 右邻居当前的读窗口；没有右邻居时为 0。
    ///
    /// 调用 [`send_message`](Self::send_message) 发送 READ 消息前据此
    /// 判断可发送的最大长度。
    pub fn downstream_read_window(&self) -> usize {
        self.channel().debug_assert_on_channel_thread();
        let inner = self.core.inner.lock();
        inner
            .slots
            .get(&self.id)
            .and_then(|rec| rec.right)
            .and_then(|right| inner.slots.get(&right))
            .map(|rec| rec.window_size)
            .unwrap_or(0)
    }

    /// 本槽当前向上游公告的读窗口。
    pub fn read_window(&self) -> usize {
        let inner = self.core.inner.lock();
        inner
            .slots
            .get(&self.id)
            .map(|rec| rec.window_size)
            .unwrap_or(0)
    }

    /// 左侧全部 Handler 的累计消息开销，供发送方预留封装空间以避免
    /// 分片。
    pub fn upstream_message_overhead(&self) -> usize {
        let inner = self.core.inner.lock();
        inner
            .slots
            .get(&self.id)
            .map(|rec| rec.upstream_message_overhead)
            .unwrap_or(0)
    }

    /// Handler 宣告它在 `direction` 方向的关闭已完成。
    ///
    /// 内核据此推进关闭状态机：READ 方向继续向右，直到最右侧后换向；
    /// WRITE 方向继续向左，最左侧完成时整条通道进入终态并通知调用方。
    pub fn on_handler_shutdown_complete(
        &self,
        direction: Direction,
        error_code: i32,
        free_scarce_resources: bool,
    ) -> Result<(), CoreError> {
        self.channel().debug_assert_on_channel_thread();
        handle_shutdown_complete(
            &self.core,
            self.id,
            direction,
            error_code,
            free_scarce_resources,
        )
    }

    /// 请求本槽 Handler 开始一个方向的关闭。
    ///
    /// 主要由通道内部驱动；Handler 偶尔用它从链路中段主动发难。
    pub fn shutdown(
        &self,
        direction: Direction,
        error_code: i32,
        free_scarce_resources: bool,
    ) -> Result<(), CoreError> {
        self.channel().debug_assert_on_channel_thread();
        shutdown_slot(
            &self.core,
            self.id,
            direction,
            error_code,
            free_scarce_resources,
        )
    }

    /// 把游离插槽 `to_add` 接到本槽右侧。
    pub fn insert_right(&self, to_add: &Slot) -> Result<(), CoreError> {
        self.channel().debug_assert_on_channel_thread();
        ensure_same_channel(self, to_add)?;
        let mut inner = self.core.inner.lock();
        ensure_linkable(&inner, self.id, to_add.id)?;
        let old_right = match inner.slots.get_mut(&self.id) {
            Some(rec) => {
                let old = rec.right;
                rec.right = Some(to_add.id);
                old
            }
            None => return Err(slot_detached()),
        };
        if let Some(rec) = inner.slots.get_mut(&to_add.id) {
            rec.left = Some(self.id);
            rec.right = old_right;
        }
        if let Some(right) = old_right
            && let Some(rec) = inner.slots.get_mut(&right)
        {
            rec.left = Some(to_add.id);
        }
        recompute_upstream_overheads(&mut inner);
        trace!(
            channel = self.core.id,
            anchor = self.id,
            added = to_add.id,
            "slot inserted to the right"
        );
        Ok(())
    }

    /// 把游离插槽 `to_add` 接到本槽左侧；本槽若是链头，头部随之更新。
    pub fn insert_left(&self, to_add: &Slot) -> Result<(), CoreError> {
        self.channel().debug_assert_on_channel_thread();
        ensure_same_channel(self, to_add)?;
        let mut inner = self.core.inner.lock();
        ensure_linkable(&inner, self.id, to_add.id)?;
        let old_left = match inner.slots.get_mut(&self.id) {
            Some(rec) => {
                let old = rec.left;
                rec.left = Some(to_add.id);
                old
            }
            None => return Err(slot_detached()),
        };
        if let Some(rec) = inner.slots.get_mut(&to_add.id) {
            rec.right = Some(self.id);
            rec.left = old_left;
        }
        if let Some(left) = old_left
            && let Some(rec) = inner.slots.get_mut(&left)
        {
            rec.right = Some(to_add.id);
        }
        if inner.first == Some(self.id) {
            inner.first = Some(to_add.id);
        }
        recompute_upstream_overheads(&mut inner);
        trace!(
            channel = self.core.id,
            anchor = self.id,
            added = to_add.id,
            "slot inserted to the left"
        );
        Ok(())
    }

    /// 将本槽摘除出链路并析构其 Handler。
    ///
    /// 仅允许在通道 `Active` 时执行：关闭状态机按邻居关系巡链，中途
    /// 改链会使巡链失效。
    pub fn remove(self) -> Result<(), CoreError> {
        self.channel().debug_assert_on_channel_thread();
        let removed = {
            let mut inner = self.core.inner.lock();
            ensure_chain_mutable(inner.state)?;
            let Some(rec) = inner.slots.remove(&self.id) else {
                return Err(slot_detached());
            };
            if let Some(left) = rec.left
                && let Some(neighbor) = inner.slots.get_mut(&left)
            {
                neighbor.right = rec.right;
            }
            if let Some(right) = rec.right
                && let Some(neighbor) = inner.slots.get_mut(&right)
            {
                neighbor.left = rec.left;
            }
            if inner.first == Some(self.id) {
                inner.first = rec.right;
            }
            recompute_upstream_overheads(&mut inner);
            rec
        };
        trace!(channel = self.core.id, slot = self.id, "slot removed");
        // Handler 析构发生在锁外。
        drop(removed);
        Ok(())
    }

    /// 以 `new_slot` 原子地顶替本槽的链上位置，并析构本槽及其 Handler。
    pub fn replace(self, new_slot: &Slot) -> Result<(), CoreError> {
        self.channel().debug_assert_on_channel_thread();
        ensure_same_channel(&self, new_slot)?;
        let replaced = {
            let mut inner = self.core.inner.lock();
            ensure_chain_mutable(inner.state)?;
            ensure_linkable(&inner, self.id, new_slot.id)?;
            let Some(old) = inner.slots.remove(&self.id) else {
                return Err(slot_detached());
            };
            if let Some(rec) = inner.slots.get_mut(&new_slot.id) {
                rec.left = old.left;
                rec.right = old.right;
            }
            if let Some(left) = old.left
                && let Some(neighbor) = inner.slots.get_mut(&left)
            {
                neighbor.right = Some(new_slot.id);
            }
            if let Some(right) = old.right
                && let Some(neighbor) = inner.slots.get_mut(&right)
            {
                neighbor.left = Some(new_slot.id);
            }
            if inner.first == Some(self.id) {
                inner.first = Some(new_slot.id);
            }
            recompute_upstream_overheads(&mut inner);
            old
        };
        trace!(
            channel = self.core.id,
            replaced = self.id,
            with = new_slot.id,
            "slot replaced"
        );
        drop(replaced);
        Ok(())
    }

    /// 本槽当前是否挂有 Handler。
    pub fn has_handler(&self) -> bool {
        handler_of(&self.core, self.id).is_ok()
    }
}

impl fmt::Debug for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Slot")
            .field("channel", &self.core.id)
            .field("id", &self.id)
            .finish()
    }
}

impl Channel {
    /// 把游离插槽 `to_add` 接到链尾。
    ///
    /// 通道里第一个插槽在 [`new_slot`](Channel::new_slot) 时已隐式成为
    /// 链头，对它调用本方法是无害的空操作。
    pub fn slot_insert_end(&self, to_add: &Slot) -> Result<(), CoreError> {
        self.debug_assert_on_channel_thread();
        if !Arc::ptr_eq(&self.core, &to_add.core) {
            return Err(CoreError::new(
                codes::CHANNEL_INVALID_STATE,
                "slot belongs to another channel",
            ));
        }
        let tail = {
            let mut inner = self.core.inner.lock();
            match inner.first {
                None => {
                    inner.first = Some(to_add.id);
                    recompute_upstream_overheads(&mut inner);
                    return Ok(());
                }
                Some(first) if first == to_add.id => return Ok(()),
                Some(first) => {
                    let mut cursor = first;
                    while let Some(rec) = inner.slots.get(&cursor) {
                        match rec.right {
                            Some(next) => cursor = next,
                            None => break,
                        }
                    }
                    cursor
                }
            }
        };
        Slot::from_parts(Arc::clone(&self.core), tail).insert_right(to_add)
    }
}

fn slot_detached() -> CoreError {
    CoreError::new(
        codes::CHANNEL_SLOT_DETACHED,
        "slot has been removed from its channel",
    )
}

fn reject(message: IoMessage, code: &'static str, text: &'static str) -> SendError {
    SendError {
        message,
        error: CoreError::new(code, text),
    }
}

fn ensure_same_channel(a: &Slot, b: &Slot) -> Result<(), CoreError> {
    if Arc::ptr_eq(&a.core, &b.core) {
        Ok(())
    } else {
        Err(CoreError::new(
            codes::CHANNEL_INVALID_STATE,
            "slots belong to different channels",
        ))
    }
}

/// 链路结构变更仅允许在通道 `Active` 时进行。
fn ensure_chain_mutable(state: ChannelState) -> Result<(), CoreError> {
    if state == ChannelState::Active {
        Ok(())
    } else {
        Err(CoreError::new(
            codes::CHANNEL_INVALID_STATE,
            "slot chain may only be mutated while the channel is active",
        ))
    }
}

/// 校验待接入插槽存在且游离（无左右邻居）。
fn ensure_linkable(
    inner: &super::ChannelInner,
    anchor: SlotId,
    to_add: SlotId,
) -> Result<(), CoreError> {
    if anchor == to_add {
        return Err(CoreError::new(
            codes::CHANNEL_INVALID_STATE,
            "slot cannot be linked to itself",
        ));
    }
    match inner.slots.get(&to_add) {
        Some(rec) if rec.left.is_none() && rec.right.is_none() => Ok(()),
        Some(_) => Err(CoreError::new(
            codes::CHANNEL_INVALID_STATE,
            "slot is already linked into the chain",
        )),
        None => Err(slot_detached()),
    }
}
