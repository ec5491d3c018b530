//! 标识符契约：约束通道池各类 ID 的生成与使用纪律。
//!
//! # 设计动机（Why）
//! - 通道 ID 由池分配、进程生命周期内唯一且永不复用，与调用方自选的
//!   server id / source id 属于两个不相交的命名空间；用新类型把二者在
//!   类型层面隔开，杜绝“拿 source id 查通道”的一类错误。
//! - 调用方命名空间（server/source/clock id）保持裸 `u64`：它们是调用方
//!   的关联键，池只负责冲突检测，不负责生成。
//!
//! # 集成方式（How）
//! - 实现层以原子计数器分配 [`ChannelId`]；契约层不暴露任何构造捷径，
//!   `from_raw` 仅供实现层与测试使用。

use core::fmt;

/// 池分配的通道标识。
///
/// # 契约定义（What）
/// - **唯一性**：同一池生命周期内两两不同，销毁后不复用；
/// - **前置条件**：仅由池的分配器构造；调用方只能持有与回传，不应自造；
/// - **后置条件**：`Copy` 语义允许跨线程自由传递，回调收到的 ID 与
///   同步 API 返回的 ID 指向同一通道记录。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(u64);

impl ChannelId {
    /// 从原始计数值构造通道 ID。仅供池的分配器与测试替身使用。
    pub const fn from_raw(value: u64) -> Self {
        Self(value)
    }

    /// 返回底层计数值，用于日志与指标标签。
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "channel-{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_carries_raw_value() {
        let id = ChannelId::from_raw(42);
        assert_eq!(id.as_u64(), 42);
        assert_eq!(id.to_string(), "channel-42");
    }
}
