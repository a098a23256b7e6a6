// SSH 模块
//
// 模块结构:
// - config: 连接配置 (ConnectionProfile) 与扫描用的 russh 配置
// - error: 错误类型 (SshError)
// - handler: russh Handler 实现（只用于获取主机密钥）
// - context: 命令执行上下文 (ExecutionContext, LocalContext, SecureShellContext)
// - scanner: 服务端探测 (ServerScanner, KeyscanScanner, NativeScanner)

pub mod config;
pub mod context;
pub mod error;
pub mod handler;
pub mod scanner;

// 公开导出
pub use config::ConnectionProfile;
pub use context::{
    CommandOutput, ExecutionContext, HostKeyPolicy, LocalContext, RemoteCommand,
    SecureShellContext,
};
pub use error::SshError;
pub use scanner::{KeyscanScanner, NativeScanner, ServerScanner};
