// 解锁流程错误类型定义

use thiserror::Error;

use crate::ssh::SshError;

/// 解锁流程错误
///
/// 前五种是操作员可以处理的领域错误，进程以独立的退出码结束；
/// 其余视为程序或环境缺陷。
#[derive(Debug, Error)]
pub enum UnlockError {
    /// 在 connect-timeout 内无法识别预启动环境
    #[error("{0}")]
    SystemUnreachable(String),

    /// 操作员在可疑的检测结果后选择放弃
    #[error("{0}")]
    UnlockAborted(String),

    /// 在 boot-timeout 内没有观察到启动完成
    #[error("{0}")]
    BootTimeout(String),

    /// 预启动环境中找不到任何可用的口令投递方式
    #[error("{0}")]
    UnsupportedSystem(String),

    /// 连接配置缺失或格式错误
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// 传输层错误
    #[error(transparent)]
    Ssh(#[from] SshError),

    /// 其它错误（本地存储、终端交互等）
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// 失败类型（与终止状态一一对应）
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureKind {
    SystemUnreachable,
    UnlockAborted,
    BootTimeout,
    UnsupportedSystem,
    Configuration,
    Unexpected,
}

impl UnlockError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::SystemUnreachable(_) => FailureKind::SystemUnreachable,
            Self::UnlockAborted(_) => FailureKind::UnlockAborted,
            Self::BootTimeout(_) => FailureKind::BootTimeout,
            Self::UnsupportedSystem(_) => FailureKind::UnsupportedSystem,
            Self::Configuration(_) => FailureKind::Configuration,
            Self::Ssh(_) | Self::Other(_) => FailureKind::Unexpected,
        }
    }

    /// 是否为领域错误
    pub fn is_domain(&self) -> bool {
        self.kind() != FailureKind::Unexpected
    }

    /// 是否为 SSH 连接失败（例如远程主机正在重启）
    pub fn is_connect_failure(&self) -> bool {
        matches!(self, Self::Ssh(e) if e.is_connect_failure())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_domain_classification() {
        assert!(UnlockError::BootTimeout("late".into()).is_domain());
        assert!(UnlockError::Configuration("bad".into()).is_domain());
        assert!(!UnlockError::Other(anyhow::anyhow!("disk full")).is_domain());
        let dropped = UnlockError::from(SshError::ConnectFailed {
            target: "nas".into(),
            stderr: "Connection closed by remote host".into(),
        });
        assert!(!dropped.is_domain());
        assert!(dropped.is_connect_failure());
        assert_eq!(
            UnlockError::Configuration("missing pre-boot".into()).to_string(),
            "Configuration error: missing pre-boot"
        );
    }
}
