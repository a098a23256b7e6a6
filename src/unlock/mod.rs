// 远程解锁
//
// 模块结构:
// - settings: 会话设置 (UnlockSettings)
// - detector: 启动阶段检测 (PhaseDetector)
// - delivery: 口令投递 (SecretDelivery)
// - session: 解锁流程与 watch 模式 (UnlockSession)
// - watch: 多主机监视（每台主机一个进程）
// - stage / error / prompt: 状态、错误、操作员交互

pub mod delivery;
pub mod detector;
pub mod error;
pub mod prompt;
pub mod session;
pub mod settings;
pub mod stage;
pub mod watch;

#[cfg(test)]
pub(crate) mod testing;

pub use delivery::{DeliveryMethod, SecretDelivery};
pub use detector::{PhaseDetector, PostBootStrategy, PreBootConfirmation};
pub use error::{FailureKind, UnlockError};
pub use prompt::{OperatorPrompt, TerminalPrompt};
pub use session::{unlock_remote_system, SessionMode, SessionParts, UnlockSession};
pub use settings::{PasswordSource, UnlockSettings};
pub use stage::UnlockStage;
pub use watch::watch_all_systems;
