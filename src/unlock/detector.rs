// 启动阶段检测
//
// 只依靠外部可观察的信号判断远程主机处于哪个阶段：
// SSH 版本横幅、主机密钥、能否执行命令。

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use humantime::format_duration;
use tokio::time::{self, sleep, Instant};
use tracing::{debug, info, warn};

use crate::models::{ServerFingerprint, POST_BOOT_SERVER, PRE_BOOT_SERVER};
use crate::ssh::{ConnectionProfile, ExecutionContext, ServerScanner};

use super::error::UnlockError;
use super::prompt::OperatorPrompt;

/// 单次探测对预启动环境的判定
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PreBootVerdict {
    /// 主机密钥与已知密钥相交
    KnownHostKeys,
    /// 主机密钥全部未知（应答的是启动后的 SSH 服务）
    UnknownHostKeys,
    /// 横幅是预启动环境的 SSH 服务
    PreBootBanner,
    /// 横幅是完整系统的 SSH 服务
    PostBootBanner,
    /// 无法判定（无应答或横幅未知）
    Unclassified,
}

/// 根据指纹判定是否处于预启动环境
pub fn classify_pre_boot(fingerprint: &ServerFingerprint, known_keys: &BTreeSet<String>) -> PreBootVerdict {
    if !known_keys.is_empty() && !fingerprint.host_keys().is_empty() {
        if fingerprint.shares_keys_with(known_keys) {
            PreBootVerdict::KnownHostKeys
        } else {
            PreBootVerdict::UnknownHostKeys
        }
    } else if fingerprint.matches_banner(PRE_BOOT_SERVER) {
        PreBootVerdict::PreBootBanner
    } else if fingerprint.matches_banner(POST_BOOT_SERVER) {
        PreBootVerdict::PostBootBanner
    } else {
        PreBootVerdict::Unclassified
    }
}

/// 预启动环境的确认依据
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PreBootEvidence {
    KnownHostKeys,
    Banner,
    /// 看起来像启动后的环境，由操作员确认继续
    OperatorConsent,
}

/// 预启动环境检测结果
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PreBootConfirmation {
    /// 确认时观察到的指纹，作为等待启动完成的基准
    pub fingerprint: ServerFingerprint,
    pub evidence: PreBootEvidence,
}

impl PreBootConfirmation {
    /// 只有无歧义的确认才可以持久化主机密钥
    pub fn is_ambiguous(&self) -> bool {
        self.evidence == PreBootEvidence::OperatorConsent
    }
}

/// 等待启动完成的检测方式
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PostBootStrategy {
    /// 出现与基准不相交的主机密钥
    HostKeys,
    /// 同一端口上的横幅发生变化
    Banner,
    /// 启动后环境可以执行命令
    Reachability,
}

impl PostBootStrategy {
    /// 根据已有证据选择检测方式（每次等待只选一次）
    pub fn select(
        baseline: &ServerFingerprint,
        pre_boot: &ConnectionProfile,
        post_boot: &ConnectionProfile,
    ) -> Self {
        if !baseline.host_keys().is_empty() {
            Self::HostKeys
        } else if pre_boot.port() == post_boot.port() && !baseline.banner().is_empty() {
            Self::Banner
        } else {
            Self::Reachability
        }
    }

    pub fn describe(&self) -> &'static str {
        match self {
            Self::HostKeys => "SSH host keys",
            Self::Banner => "SSH server banner",
            Self::Reachability => "SSH connection test",
        }
    }

    /// 相对基准是否观察到了启动完成
    pub fn observes_transition(&self, baseline: &ServerFingerprint, current: &ServerFingerprint) -> bool {
        match self {
            Self::HostKeys => {
                !current.host_keys().is_empty()
                    && current.host_keys().is_disjoint(baseline.host_keys())
            }
            Self::Banner => {
                !baseline.banner().is_empty()
                    && !current.banner().is_empty()
                    && current.banner() != baseline.banner()
            }
            Self::Reachability => false,
        }
    }
}

/// 等待启动完成所需的连接信息
pub struct PostBootProbe<'a> {
    pub pre_boot: &'a ConnectionProfile,
    pub post_boot: &'a ConnectionProfile,
    /// 用于连接测试的启动后上下文
    pub context: &'a dyn ExecutionContext,
}

/// 启动阶段检测器
#[derive(Clone)]
pub struct PhaseDetector {
    scanner: Arc<dyn ServerScanner>,
    retry_interval: Duration,
    /// 仅在交互模式下存在
    prompt: Option<Arc<dyn OperatorPrompt>>,
}

impl PhaseDetector {
    pub fn new(scanner: Arc<dyn ServerScanner>, retry_interval: Duration) -> Self {
        Self {
            scanner,
            retry_interval,
            prompt: None,
        }
    }

    pub fn with_prompt(mut self, prompt: Option<Arc<dyn OperatorPrompt>>) -> Self {
        self.prompt = prompt;
        self
    }

    /// 等待预启动环境
    pub async fn detect_pre_boot(
        &self,
        profile: &ConnectionProfile,
        known_keys: &BTreeSet<String>,
        timeout: Duration,
    ) -> Result<PreBootConfirmation, UnlockError> {
        info!("[Detect] Waiting for pre-boot environment of {} ..", profile);
        let started = Instant::now();
        loop {
            let iteration = Instant::now();
            let fingerprint = self.scan(profile, self.probe_limit(started, timeout)).await;
            let evidence = match classify_pre_boot(&fingerprint, known_keys) {
                PreBootVerdict::KnownHostKeys => {
                    info!("[Detect] Detected pre-boot environment based on known SSH host keys.");
                    Some(PreBootEvidence::KnownHostKeys)
                }
                PreBootVerdict::PreBootBanner => {
                    info!(
                        "[Detect] Detected pre-boot environment based on SSH server banner ({}).",
                        fingerprint.banner()
                    );
                    Some(PreBootEvidence::Banner)
                }
                PreBootVerdict::UnknownHostKeys => {
                    warn!(
                        "[Detect] {} answers with unknown SSH host keys, probably the post-boot environment. Retrying ..",
                        profile
                    );
                    None
                }
                PreBootVerdict::PostBootBanner => {
                    Some(self.confirm_post_boot_banner(profile, &fingerprint).await?)
                }
                PreBootVerdict::Unclassified => {
                    debug!("[Detect] Pre-boot environment of {} not available yet.", profile);
                    None
                }
            };
            if let Some(evidence) = evidence {
                return Ok(PreBootConfirmation {
                    fingerprint,
                    evidence,
                });
            }
            if started.elapsed() >= timeout {
                return Err(UnlockError::SystemUnreachable(format!(
                    "Timed out waiting for pre-boot environment of {} to become available within {}!",
                    profile,
                    format_duration(timeout)
                )));
            }
            self.pause(started, iteration, timeout).await;
        }
    }

    async fn confirm_post_boot_banner(
        &self,
        profile: &ConnectionProfile,
        fingerprint: &ServerFingerprint,
    ) -> Result<PreBootEvidence, UnlockError> {
        warn!(
            "[Detect] Expected pre-boot environment on {} but found SSH server banner {}!",
            profile,
            fingerprint.banner()
        );
        let Some(prompt) = &self.prompt else {
            return Err(UnlockError::UnlockAborted(format!(
                "Unlock of {} aborted: found post-boot SSH server where the pre-boot environment was expected.",
                profile
            )));
        };
        if prompt
            .confirm("The system may already be booted. Continue connecting anyway?")
            .await?
        {
            info!("[Detect] Continuing unlock sequence with operator consent.");
            Ok(PreBootEvidence::OperatorConsent)
        } else {
            Err(UnlockError::UnlockAborted(format!(
                "Unlock of {} aborted by operator.",
                profile
            )))
        }
    }

    /// 等待启动完成；通过探测观察到时返回新的指纹
    pub async fn detect_post_boot(
        &self,
        probe: PostBootProbe<'_>,
        baseline: &ServerFingerprint,
        timeout: Duration,
    ) -> Result<Option<ServerFingerprint>, UnlockError> {
        let strategy = PostBootStrategy::select(baseline, probe.pre_boot, probe.post_boot);
        info!(
            "[Detect] Waiting for post-boot environment of {} based on {} ..",
            probe.post_boot,
            strategy.describe()
        );
        let started = Instant::now();
        loop {
            let iteration = Instant::now();
            match strategy {
                PostBootStrategy::HostKeys | PostBootStrategy::Banner => {
                    let current = self.scan(probe.post_boot, self.probe_limit(started, timeout)).await;
                    if strategy.observes_transition(baseline, &current) {
                        info!("[Detect] Detected post-boot environment based on {}.", strategy.describe());
                        return Ok(Some(current));
                    }
                }
                PostBootStrategy::Reachability => {
                    let limit = self.probe_limit(started, timeout);
                    match time::timeout(limit, probe.context.test(&["true"])).await {
                        Ok(reachable) => {
                            if reachable? {
                                info!("[Detect] Post-boot environment of {} is reachable.", probe.post_boot);
                                return Ok(None);
                            }
                        }
                        Err(_) => debug!(
                            "[Detect] Connection test of {} gave no answer within {}.",
                            probe.post_boot,
                            format_duration(limit)
                        ),
                    }
                }
            }
            if started.elapsed() >= timeout {
                return Err(UnlockError::BootTimeout(format!(
                    "Timed out waiting for post-boot environment of {} to come online within {}!",
                    probe.post_boot,
                    format_duration(timeout)
                )));
            }
            self.pause(started, iteration, timeout).await;
        }
    }

    /// 单次探测的时限：剩余等待时间，至少一个重试间隔
    fn probe_limit(&self, started: Instant, timeout: Duration) -> Duration {
        timeout
            .saturating_sub(started.elapsed())
            .max(self.retry_interval)
    }

    /// 超过时限的探测按无应答处理
    async fn scan(&self, profile: &ConnectionProfile, limit: Duration) -> ServerFingerprint {
        match time::timeout(limit, self.scanner.scan(profile)).await {
            Ok(fingerprint) => fingerprint,
            Err(_) => {
                debug!("[Detect] Scan of {} gave no answer within {}.", profile, format_duration(limit));
                ServerFingerprint::default()
            }
        }
    }

    /// 休眠到下一次探测；扣除本轮已用时间，且不越过总超时
    async fn pause(&self, started: Instant, iteration: Instant, timeout: Duration) {
        let remaining = timeout.saturating_sub(started.elapsed());
        let wait = self
            .retry_interval
            .saturating_sub(iteration.elapsed())
            .min(remaining);
        if !wait.is_zero() {
            sleep(wait).await;
        }
    }
}
