//! 传输前的空间检查

use crate::remote::RemoteError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 默认安全余量：1 GB
pub const DEFAULT_BUFFER_BYTES: i64 = 1_000_000_000;

/// 目标不报告剩余空间时的处理方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnknownCapacity {
    #[default]
    Reject,
    Accept,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdmissionError {
    #[error("空间不足: 需要 {requested} 字节, 可用 {available} 字节, 保留 {buffer} 字节")]
    InsufficientSpace {
        requested: u64,
        available: u64,
        buffer: i64,
    },
    #[error("无效的保留空间: {0}")]
    InvalidBuffer(i64),
    #[error("目标没有报告剩余空间, 需要 --force 才能继续")]
    UnknownCapacity,
    #[error("查询剩余空间失败: {0}")]
    CapacityQuery(#[source] RemoteError),
}

/// 判断能否开始传输，纯函数
///
/// `force` 时总是放行；否则保留空间不能为负，
/// 剩余空间未知时按 `unknown` 处理，已知时要求 `requested <= available - buffer`。
pub fn admit(
    requested: u64,
    available: Option<u64>,
    buffer: i64,
    force: bool,
    unknown: UnknownCapacity,
) -> Result<(), AdmissionError> {
    if force {
        return Ok(());
    }
    if buffer < 0 {
        return Err(AdmissionError::InvalidBuffer(buffer));
    }

    let Some(available) = available else {
        return match unknown {
            UnknownCapacity::Accept => Ok(()),
            UnknownCapacity::Reject => Err(AdmissionError::UnknownCapacity),
        };
    };

    // i128 避免 available - buffer 下溢
    if requested as i128 > available as i128 - buffer as i128 {
        return Err(AdmissionError::InsufficientSpace {
            requested,
            available,
            buffer,
        });
    }
    Ok(())
}

/// 空间检查配置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionPolicy {
    pub buffer: i64,
    pub force: bool,
    pub unknown: UnknownCapacity,
}

impl Default for AdmissionPolicy {
    fn default() -> Self {
        Self {
            buffer: DEFAULT_BUFFER_BYTES,
            force: false,
            unknown: UnknownCapacity::Reject,
        }
    }
}

impl AdmissionPolicy {
    pub fn admit(&self, requested: u64, available: Option<u64>) -> Result<(), AdmissionError> {
        admit(requested, available, self.buffer, self.force, self.unknown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_boundary() {
        assert_eq!(admit(1000, Some(1100), 100, false, UnknownCapacity::Reject), Ok(()));
        assert_eq!(
            admit(1001, Some(1100), 100, false, UnknownCapacity::Reject),
            Err(AdmissionError::InsufficientSpace {
                requested: 1001,
                available: 1100,
                buffer: 100
            })
        );
    }

    #[test]
    fn test_force_always_admits() {
        assert!(admit(u64::MAX, Some(0), -5, true, UnknownCapacity::Reject).is_ok());
        assert!(admit(10, None, 0, true, UnknownCapacity::Reject).is_ok());
    }

    #[test]
    fn test_negative_buffer() {
        assert_eq!(
            admit(1, Some(100), -1, false, UnknownCapacity::Accept),
            Err(AdmissionError::InvalidBuffer(-1))
        );
    }

    #[test]
    fn test_unknown_capacity_policy() {
        assert_eq!(
            admit(1, None, 0, false, UnknownCapacity::Reject),
            Err(AdmissionError::UnknownCapacity)
        );
        assert_eq!(admit(1, None, 0, false, UnknownCapacity::Accept), Ok(()));
    }

    #[test]
    fn test_buffer_larger_than_available() {
        // 保留空间大于剩余空间时连 0 字节都不能放行
        assert!(admit(0, Some(10), 20, false, UnknownCapacity::Reject).is_err());
        assert!(admit(0, Some(20), 20, false, UnknownCapacity::Reject).is_ok());
    }

    #[test]
    fn test_policy_defaults() {
        let policy = AdmissionPolicy::default();
        assert_eq!(policy.buffer, 1_000_000_000);
        assert!(policy.admit(10, Some(2_000_000_000)).is_ok());
        assert!(policy.admit(10, Some(500)).is_err());
    }
}
