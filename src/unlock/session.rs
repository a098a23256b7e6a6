// 解锁会话
//
// 会话独占一个临时控制目录（OpenSSH ControlMaster 套接字），
// 创建会话时获取，close() 或析构时删除。

use std::collections::BTreeSet;
use std::convert::Infallible;
use std::path::Path;
use std::sync::Arc;

use humantime::format_duration;
use tempfile::TempDir;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

use crate::models::ServerFingerprint;
use crate::services::{HostKeyStore, Secret};
use crate::ssh::{ExecutionContext, KeyscanScanner, NativeScanner, SecureShellContext, ServerScanner};

use super::delivery::SecretDelivery;
use super::detector::{
    classify_pre_boot, PhaseDetector, PostBootProbe, PreBootConfirmation, PreBootEvidence,
    PreBootVerdict,
};
use super::error::UnlockError;
use super::prompt::{OperatorPrompt, TerminalPrompt};
use super::settings::UnlockSettings;
use super::stage::UnlockStage;

/// 会话使用的外部协作者
pub struct SessionParts {
    pub scanner: Arc<dyn ServerScanner>,
    /// 预启动环境
    pub pre_context: Arc<dyn ExecutionContext>,
    /// 启动后环境
    pub post_context: Arc<dyn ExecutionContext>,
}

impl SessionParts {
    /// 基于 OpenSSH 客户端的默认实现
    pub fn secure_shell(settings: &UnlockSettings, control_directory: &Path) -> Self {
        let timeout = settings.timing.scan_timeout;
        let mut pre_context = SecureShellContext::new(&settings.pre_boot)
            .with_control_directory(control_directory)
            .with_host_key_policy(settings.host_key_policy())
            .with_connect_timeout(timeout);

        let scanner: Arc<dyn ServerScanner> = match &settings.ssh_proxy {
            Some(proxy) => {
                pre_context = pre_context.with_proxy(proxy);
                let out_of_band: Arc<dyn ExecutionContext> =
                    Arc::new(SecureShellContext::alias(proxy.as_str()).with_connect_timeout(timeout));
                Arc::new(KeyscanScanner::new(out_of_band, timeout))
            }
            None => Arc::new(NativeScanner::new(timeout)),
        };

        Self {
            scanner,
            pre_context: Arc::new(pre_context),
            post_context: Arc::new(settings.post_context()),
        }
    }
}

/// 解锁会话
pub struct UnlockSession {
    settings: UnlockSettings,
    secret: Option<Secret>,
    /// 可以识别预启动环境的主机密钥
    known_keys: BTreeSet<String>,
    store: Option<HostKeyStore>,
    parts: SessionParts,
    prompt: Option<Arc<dyn OperatorPrompt>>,
    stage: UnlockStage,
    control_directory: Option<TempDir>,
}

impl UnlockSession {
    /// 创建会话；交互模式下有歧义时会询问操作员
    pub fn open(
        settings: UnlockSettings,
        secret: Option<Secret>,
        interactive: bool,
    ) -> Result<Self, UnlockError> {
        let prompt: Option<Arc<dyn OperatorPrompt>> =
            interactive.then(|| Arc::new(TerminalPrompt) as Arc<dyn OperatorPrompt>);
        Self::open_with(settings, secret, prompt, SessionParts::secure_shell)
    }

    /// 使用自定义协作者创建会话
    pub fn open_with<F>(
        settings: UnlockSettings,
        secret: Option<Secret>,
        prompt: Option<Arc<dyn OperatorPrompt>>,
        build: F,
    ) -> Result<Self, UnlockError>
    where
        F: FnOnce(&UnlockSettings, &Path) -> SessionParts,
    {
        let control_directory = tempfile::Builder::new()
            .prefix("unlock-remote-system-")
            .tempdir()
            .map_err(|e| UnlockError::Other(e.into()))?;
        debug!(
            "[Unlock] Using control directory {}",
            control_directory.path().display()
        );
        let parts = build(&settings, control_directory.path());
        Ok(Self {
            known_keys: settings.known_keys.clone(),
            settings,
            secret,
            store: None,
            parts,
            prompt,
            stage: UnlockStage::Idle,
            control_directory: Some(control_directory),
        })
    }

    /// 使用主机密钥存储：读取已知密钥，并在解锁后保存新密钥
    pub fn with_host_key_store(mut self, store: HostKeyStore) -> Result<Self, UnlockError> {
        self.store = Some(store);
        self.reload_known_keys()?;
        Ok(self)
    }

    pub fn settings(&self) -> &UnlockSettings {
        &self.settings
    }

    pub fn stage(&self) -> UnlockStage {
        self.stage
    }

    pub fn known_keys(&self) -> &BTreeSet<String> {
        &self.known_keys
    }

    pub fn control_directory(&self) -> Option<&Path> {
        self.control_directory.as_ref().map(TempDir::path)
    }

    /// 释放控制目录
    pub fn close(mut self) -> Result<(), UnlockError> {
        if let Some(directory) = self.control_directory.take() {
            debug!(
                "[Unlock] Removing control directory {}",
                directory.path().display()
            );
            directory.close().map_err(|e| UnlockError::Other(e.into()))?;
        }
        Ok(())
    }

    fn reload_known_keys(&mut self) -> Result<(), UnlockError> {
        let mut keys = self.settings.known_keys.clone();
        if let (Some(store), Some(section)) = (&self.store, &self.settings.config_section) {
            keys.extend(store.load(section)?);
        }
        self.known_keys = keys;
        Ok(())
    }

    fn enter(&mut self, stage: UnlockStage) {
        debug!(
            "[Unlock] {} -> {}",
            self.stage.label(),
            stage.label()
        );
        self.stage = stage;
    }

    /// 进入正常流程中的下一个状态
    fn advance(&mut self) {
        if let Some(next) = self.stage.next() {
            self.enter(next);
        }
    }

    fn detector(&self) -> PhaseDetector {
        PhaseDetector::new(self.parts.scanner.clone(), self.settings.timing.retry_interval)
            .with_prompt(self.prompt.clone())
    }

    /// 确认可以登录预启动环境
    pub async fn check_ssh_connection(&self) -> Result<(), UnlockError> {
        let profile = &self.settings.pre_boot;
        info!("[Unlock] Testing SSH connection to {} ..", profile);
        if self.parts.pre_context.test(&["test", "-e", "/"]).await? {
            info!("[Unlock] Successfully connected and authenticated over SSH.");
            return Ok(());
        }
        let mut message = format!("Failed to authenticate to {}!", profile);
        if self.settings.connects_as_root() {
            message.push_str(
                " Maybe you're accidentally connecting to the post-boot environment and you don't have 'root' access there?",
            );
        }
        Err(UnlockError::SystemUnreachable(message))
    }

    /// 完整的解锁流程
    pub async fn unlock(&mut self) -> Result<(), UnlockError> {
        self.run(None).await
    }

    async fn run(&mut self, confirmed: Option<PreBootConfirmation>) -> Result<(), UnlockError> {
        if self.stage.is_terminal() {
            self.enter(UnlockStage::Idle);
        }
        let result = self.run_stages(confirmed).await;
        if let Err(e) = &result {
            self.enter(UnlockStage::Failed(e.kind()));
        }
        result
    }

    async fn run_stages(&mut self, confirmed: Option<PreBootConfirmation>) -> Result<(), UnlockError> {
        let started = Instant::now();
        let detector = self.detector();
        let timing = self.settings.timing;

        self.advance();
        let pre_boot = match confirmed {
            Some(confirmation) => confirmation,
            None => {
                detector
                    .detect_pre_boot(&self.settings.pre_boot, &self.known_keys, timing.connect_timeout)
                    .await?
            }
        };

        self.advance();
        self.check_ssh_connection().await?;
        SecretDelivery::new(self.parts.pre_context.clone(), self.settings.paths.clone())
            .deliver(self.secret.as_ref().map(|s| s.as_str()))
            .await?;

        self.advance();
        let probe = PostBootProbe {
            pre_boot: &self.settings.pre_boot,
            post_boot: &self.settings.post_boot,
            context: self.parts.post_context.as_ref(),
        };
        let post_boot = detector
            .detect_post_boot(probe, &pre_boot.fingerprint, timing.boot_timeout)
            .await?;
        if let Some(post_boot) = post_boot {
            self.store_host_keys(&pre_boot, &post_boot)?;
        }

        self.advance();
        info!(
            "[Unlock] Successfully unlocked {} in {}.",
            self.settings.pre_boot.hostname(),
            format_duration(round_seconds(started.elapsed()))
        );
        Ok(())
    }

    fn store_host_keys(
        &self,
        pre_boot: &PreBootConfirmation,
        post_boot: &ServerFingerprint,
    ) -> Result<(), UnlockError> {
        let pre_keys = pre_boot.fingerprint.host_keys();
        if pre_boot.is_ambiguous() || pre_keys.is_empty() || post_boot.host_keys().is_empty() {
            return Ok(());
        }
        match (&self.store, &self.settings.config_section) {
            (Some(store), Some(section)) => {
                store.save(section, pre_keys, post_boot.host_keys())?;
            }
            _ => debug!("[HostKeys] Not storing SSH host keys (no configuration available)."),
        }
        Ok(())
    }

    /// 持续监视预启动环境，出现时自动解锁；直到进程被终止
    pub async fn watch(&mut self) -> Infallible {
        let profile = self.settings.pre_boot.clone();
        if self.known_keys.is_empty() {
            warn!(
                "[Watch] No known pre-boot SSH host keys for {}, watch mode can't detect the pre-boot environment!",
                profile
            );
        }
        info!("[Watch] Watching {} ..", profile);
        loop {
            let fingerprint = self.parts.scanner.scan(&profile).await;
            if classify_pre_boot(&fingerprint, &self.known_keys) == PreBootVerdict::KnownHostKeys {
                info!("[Watch] Detected pre-boot environment of {}, starting unlock sequence ..", profile);
                let confirmation = PreBootConfirmation {
                    fingerprint,
                    evidence: PreBootEvidence::KnownHostKeys,
                };
                if let Err(e) = self.run(Some(confirmation)).await {
                    error!("[Watch] Unlock attempt failed: {}", e);
                }
                if let Err(e) = self.reload_known_keys() {
                    error!("[Watch] Failed to reload known SSH host keys: {}", e);
                }
            } else if fingerprint.is_empty() {
                debug!("[Watch] {} is unreachable, going back to sleep ..", profile);
            } else {
                debug!("[Watch] {} is not in the pre-boot environment, going back to sleep ..", profile);
            }
            sleep(self.settings.timing.watch_interval).await;
        }
    }
}

/// 运行方式
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionMode {
    /// 解锁一次
    Unlock,
    /// 持续监视
    Watch,
}

/// 打开会话、运行、关闭；无论成败都会释放控制目录
pub async fn unlock_remote_system(
    settings: UnlockSettings,
    secret: Option<Secret>,
    interactive: bool,
    mode: SessionMode,
) -> Result<(), UnlockError> {
    let store = HostKeyStore::open_default()?;
    let mut session = UnlockSession::open(settings, secret, interactive)?.with_host_key_store(store)?;
    let result = match mode {
        SessionMode::Unlock => session.unlock().await,
        SessionMode::Watch => match session.watch().await {},
    };
    let closed = session.close();
    result?;
    closed
}

fn round_seconds(duration: std::time::Duration) -> std::time::Duration {
    std::time::Duration::from_secs(duration.as_secs())
}
