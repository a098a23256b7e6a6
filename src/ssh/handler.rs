// 主机密钥扫描用的 russh Handler
// 只关心服务器在密钥交换时出示的公钥，拿到后立即拒绝，不进入认证阶段

use russh::keys::PublicKey;
use std::future::Future;
use tokio::sync::oneshot;
use tracing::trace;

/// 扫描 Handler
pub struct ScanHandler {
    /// 公钥发送器（只发送一次）
    key_sender: Option<oneshot::Sender<PublicKey>>,
    /// 目标地址（用于日志）
    address: String,
}

impl ScanHandler {
    /// 创建新的 Handler
    pub fn new(key_sender: oneshot::Sender<PublicKey>, address: String) -> Self {
        Self {
            key_sender: Some(key_sender),
            address,
        }
    }
}

impl russh::client::Handler for ScanHandler {
    type Error = russh::Error;

    /// 记录服务器公钥，然后拒绝它以结束握手
    fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> impl Future<Output = Result<bool, Self::Error>> + Send {
        trace!(
            "[Scan] {} offered {} key {}",
            self.address,
            server_public_key.algorithm(),
            server_public_key.fingerprint(russh::keys::ssh_key::HashAlg::Sha256)
        );
        if let Some(sender) = self.key_sender.take() {
            let _ = sender.send(server_public_key.clone());
        }
        async { Ok(false) }
    }
}
