// SSH 错误类型定义

use thiserror::Error;

/// SSH 错误类型
#[derive(Debug, Error)]
pub enum SshError {
    /// 配置错误（连接表达式、选项等）
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO 错误（启动进程、网络连接等）
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// SSH 协议错误
    #[error("SSH protocol error: {0}")]
    Protocol(String),

    /// 密钥错误
    #[error("Key error: {0}")]
    Key(String),

    /// 连接超时
    #[error("Connection timeout after {0}s")]
    Timeout(u64),

    /// SSH 客户端报告连接失败（退出码 255）
    /// 重启过程中远程 SSH 服务消失时也会出现
    #[error("Failed to connect to {target}: {stderr}")]
    ConnectFailed { target: String, stderr: String },

    /// 远程命令返回非零退出码
    #[error("Command `{command}` failed with exit code {exit_code} on {target}")]
    CommandFailed {
        target: String,
        command: String,
        exit_code: i32,
        stderr: String,
    },
}

impl SshError {
    /// 是否为连接层面的失败（而不是命令本身失败）
    pub fn is_connect_failure(&self) -> bool {
        matches!(self, SshError::ConnectFailed { .. } | SshError::Timeout(_))
    }
}

impl From<russh::Error> for SshError {
    fn from(e: russh::Error) -> Self {
        SshError::Protocol(e.to_string())
    }
}

impl From<russh::keys::Error> for SshError {
    fn from(e: russh::keys::Error) -> Self {
        SshError::Key(e.to_string())
    }
}
