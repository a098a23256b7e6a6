// SSH 服务端探测
//
// 探测只读取外部可观察的信息：版本横幅和主机密钥。
// - KeyscanScanner: 在控制端（或跳板机）上运行 ssh-keyscan
// - NativeScanner: 直接用 tokio + russh 完成同样的事情，不依赖外部程序
//
// 两者记录的主机密钥格式一致（OpenSSH 编码中的 base64 部分），可以互换。

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::keys::ssh_key::Algorithm;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::time::{timeout, Instant};
use tracing::{debug, trace};

use crate::models::ServerFingerprint;

use super::config::{scan_algorithms, scan_config, ConnectionProfile};
use super::context::{ExecutionContext, RemoteCommand};
use super::error::SshError;
use super::handler::ScanHandler;

/// 默认单次探测超时
pub const DEFAULT_SCAN_TIMEOUT: Duration = Duration::from_secs(5);

/// 服务端探测器
#[async_trait]
pub trait ServerScanner: Send + Sync {
    /// 探测一次；失败时返回空指纹，由调用方决定是否重试
    async fn scan(&self, profile: &ConnectionProfile) -> ServerFingerprint;
}

/// 解析 ssh-keyscan 标准输出中的主机密钥
/// 每行格式：`host key-type base64-key`
pub fn parse_keyscan_keys(stdout: &str) -> BTreeSet<String> {
    stdout
        .lines()
        .filter_map(|line| {
            let tokens: Vec<&str> = line.split_whitespace().collect();
            (tokens.len() >= 3 && !tokens[0].starts_with('#')).then(|| tokens[2].to_string())
        })
        .collect()
}

/// 解析 ssh-keyscan 标准错误中的版本横幅
/// 行格式：`# host:port SSH-2.0-...`
pub fn parse_keyscan_banner(stderr: &str) -> String {
    stderr
        .lines()
        .map(|line| line.split_whitespace().collect::<Vec<_>>())
        .find(|tokens| tokens.len() >= 3 && tokens[0] == "#")
        .map(|tokens| tokens[2].to_string())
        .unwrap_or_default()
}

/// 从服务端识别行中取出版本横幅（去掉空格后的注释部分，与 ssh-keyscan 一致）
pub fn parse_identification(line: &str) -> Option<String> {
    line.starts_with("SSH-")
        .then(|| line.split_whitespace().next())
        .flatten()
        .map(str::to_string)
}

/// 通过 ssh-keyscan 探测
pub struct KeyscanScanner {
    /// 运行 ssh-keyscan 的上下文（本机或跳板机）
    context: Arc<dyn ExecutionContext>,
    /// ssh-keyscan 的 -T 参数
    scan_timeout: Duration,
}

impl KeyscanScanner {
    pub fn new(context: Arc<dyn ExecutionContext>, scan_timeout: Duration) -> Self {
        Self {
            context,
            scan_timeout,
        }
    }
}

#[async_trait]
impl ServerScanner for KeyscanScanner {
    async fn scan(&self, profile: &ConnectionProfile) -> ServerFingerprint {
        let started = Instant::now();
        debug!(
            "[Scan] Using ssh-keyscan to scan {} from {} ..",
            profile.address(),
            self.context.describe()
        );
        let command = RemoteCommand::new([
            "ssh-keyscan".to_string(),
            "-p".to_string(),
            profile.port().to_string(),
            "-T".to_string(),
            self.scan_timeout.as_secs().max(1).to_string(),
            profile.hostname().to_string(),
        ])
        .silent()
        .tolerate_failure();

        let output = match self.context.execute(command).await {
            Ok(output) => output,
            Err(e) => {
                debug!("[Scan] ssh-keyscan of {} failed: {}", profile.address(), e);
                return ServerFingerprint::default();
            }
        };
        let fingerprint = ServerFingerprint::new(
            parse_keyscan_banner(&output.stderr_string()),
            parse_keyscan_keys(&output.stdout_string()),
        );
        debug!(
            "[Scan] Took {:.2}s to scan {} (banner {:?}, {} host keys)",
            started.elapsed().as_secs_f64(),
            profile.address(),
            fingerprint.banner(),
            fingerprint.host_keys().len()
        );
        fingerprint
    }
}

/// 直接通过 TCP + russh 探测
pub struct NativeScanner {
    scan_timeout: Duration,
}

impl NativeScanner {
    pub fn new(scan_timeout: Duration) -> Self {
        Self { scan_timeout }
    }

    async fn connect(&self, profile: &ConnectionProfile) -> Result<TcpStream, SshError> {
        timeout(
            self.scan_timeout,
            TcpStream::connect((profile.hostname(), profile.port())),
        )
        .await
        .map_err(|_| SshError::Timeout(self.scan_timeout.as_secs()))?
        .map_err(SshError::Io)
    }

    /// 读取服务端识别行（RFC 4253 允许之前有其它文本行）
    async fn read_banner(&self, profile: &ConnectionProfile) -> Result<String, SshError> {
        let stream = self.connect(profile).await?;
        let mut reader = BufReader::new(stream);
        for _ in 0..16 {
            let mut line = String::new();
            let read = timeout(self.scan_timeout, reader.read_line(&mut line))
                .await
                .map_err(|_| SshError::Timeout(self.scan_timeout.as_secs()))??;
            if read == 0 {
                break;
            }
            if let Some(banner) = parse_identification(&line) {
                return Ok(banner);
            }
        }
        Err(SshError::Protocol(format!(
            "No SSH identification line from {}",
            profile.address()
        )))
    }

    /// 用单一算法握手一次，取得服务器出示的主机密钥
    async fn fetch_host_key(
        &self,
        profile: &ConnectionProfile,
        algorithm: Algorithm,
    ) -> Result<Option<String>, SshError> {
        let (key_tx, mut key_rx) = oneshot::channel();
        let handler = ScanHandler::new(key_tx, profile.address());
        let config = Arc::new(scan_config(algorithm.clone(), self.scan_timeout));
        let stream = self.connect(profile).await?;

        // Handler 会拒绝公钥，所以这里的握手结果总是错误，忽略即可
        let result = timeout(
            self.scan_timeout,
            russh::client::connect_stream(config, stream, handler),
        )
        .await;
        if let Ok(Err(e)) = &result {
            trace!("[Scan] Handshake with {} ended: {}", profile.address(), e);
        }

        match key_rx.try_recv() {
            Ok(key) => {
                let encoded = key.to_openssh().map_err(|e| SshError::Key(e.to_string()))?;
                Ok(encoded.split_whitespace().nth(1).map(str::to_string))
            }
            Err(_) => {
                trace!(
                    "[Scan] {} offered no {} host key",
                    profile.address(),
                    algorithm
                );
                Ok(None)
            }
        }
    }
}

#[async_trait]
impl ServerScanner for NativeScanner {
    async fn scan(&self, profile: &ConnectionProfile) -> ServerFingerprint {
        let started = Instant::now();
        let banner = match self.read_banner(profile).await {
            Ok(banner) => banner,
            Err(e) => {
                debug!("[Scan] No banner from {}: {}", profile.address(), e);
                return ServerFingerprint::default();
            }
        };

        let mut host_keys = BTreeSet::new();
        for algorithm in scan_algorithms() {
            match self.fetch_host_key(profile, algorithm).await {
                Ok(Some(key)) => {
                    host_keys.insert(key);
                }
                Ok(None) => {}
                Err(e) => debug!("[Scan] Key exchange with {} failed: {}", profile.address(), e),
            }
        }

        debug!(
            "[Scan] Took {:.2}s to scan {} (banner {:?}, {} host keys)",
            started.elapsed().as_secs_f64(),
            profile.address(),
            banner,
            host_keys.len()
        );
        ServerFingerprint::new(banner, host_keys)
    }
}
