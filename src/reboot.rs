// 远程重启
//
// 重启远程主机并等待其重新上线；
// 主机有对应的配置节时，重启后自动解锁根文件系统。

use std::future::Future;
use std::time::Duration;

use humantime::format_duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, info};

use crate::services::ConfigLoader;
use crate::ssh::scanner::DEFAULT_SCAN_TIMEOUT;
use crate::ssh::{ExecutionContext, RemoteCommand, SecureShellContext};
use crate::unlock::settings::parse_profile;
use crate::unlock::UnlockError;

pub const CRYPTTAB_FILE: &str = "/etc/crypttab";

/// 重启中连接失败时的重试间隔
const RECONNECT_INTERVAL: Duration = Duration::from_millis(100);

/// 运行时间未变化时的重试间隔
const UPTIME_INTERVAL: Duration = Duration::from_secs(1);

/// /etc/crypttab 中的一项
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CrypttabEntry {
    pub target: String,
    pub source: String,
    pub key_file: Option<String>,
    pub options: Vec<String>,
}

impl CrypttabEntry {
    /// 源设备路径（UUID= / LABEL= / PARTUUID= 转换为 /dev/disk 下的链接）
    pub fn source_device(&self) -> String {
        for (prefix, directory) in [
            ("UUID=", "by-uuid"),
            ("LABEL=", "by-label"),
            ("PARTUUID=", "by-partuuid"),
        ] {
            if let Some(value) = self.source.strip_prefix(prefix) {
                return format!("/dev/disk/{}/{}", directory, value);
            }
        }
        self.source.clone()
    }
}

/// 解析 crypttab（忽略空行和注释）
pub fn parse_crypttab(contents: &str) -> Vec<CrypttabEntry> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let target = fields.next()?.to_string();
            let source = fields.next()?.to_string();
            let key_file = fields
                .next()
                .filter(|key| *key != "none" && *key != "-")
                .map(str::to_string);
            let options = fields
                .next()
                .map(|options| options.split(',').map(str::to_string).collect())
                .unwrap_or_default();
            Some(CrypttabEntry {
                target,
                source,
                key_file,
                options,
            })
        })
        .collect()
}

/// 远程主机的根文件系统是否加密
pub async fn is_encrypted(context: &dyn ExecutionContext) -> Result<bool, UnlockError> {
    info!("[Reboot] Checking root disk encryption on {} ..", context.describe());
    if !context.is_file(CRYPTTAB_FILE).await? {
        info!("[Reboot] No {} found, root disk encryption isn't used.", CRYPTTAB_FILE);
        return Ok(false);
    }
    let contents = context.read_file(CRYPTTAB_FILE).await?;
    for entry in parse_crypttab(&contents) {
        let device = entry.source_device();
        debug!("[Reboot] Checking if {} contains root filesystem ..", device);
        let listing = context.capture(&["lsblk", device.as_str()]).await?;
        if listing.split_whitespace().any(|token| token == "/") {
            info!("[Reboot] Yes it looks like the system is using root disk encryption.");
            return Ok(true);
        }
    }
    info!("[Reboot] No it doesn't look like the system is using root disk encryption.");
    Ok(false)
}

/// 远程主机的运行时间（秒）
pub async fn get_uptime(context: &dyn ExecutionContext) -> Result<f64, UnlockError> {
    let contents = context.capture(&["cat", "/proc/uptime"]).await?;
    contents
        .split_whitespace()
        .next()
        .and_then(|token| token.parse().ok())
        .ok_or_else(|| {
            UnlockError::Other(anyhow::anyhow!(
                "unexpected /proc/uptime contents: {:?}",
                contents
            ))
        })
}

/// 启动后环境的 SSH 上下文：配置节中的 post-boot，否则直接使用 SSH 别名
pub fn get_post_context(name: &str, loader: &ConfigLoader) -> Result<SecureShellContext, UnlockError> {
    if let Some(expression) = loader
        .get_options(name)
        .get("post-boot")
        .filter(|value| !value.trim().is_empty())
    {
        return Ok(SecureShellContext::new(&parse_profile(expression)?).with_connect_timeout(DEFAULT_SCAN_TIMEOUT));
    }
    Ok(SecureShellContext::alias(name).with_connect_timeout(DEFAULT_SCAN_TIMEOUT))
}

/// 执行 reboot；远程 SSH 服务关闭导致的断开是预期内的
async fn issue_reboot(context: &dyn ExecutionContext) -> Result<(), UnlockError> {
    let command = RemoteCommand::new(["reboot"]).sudo().silent();
    match context.execute(command).await {
        Ok(_) => Ok(()),
        Err(e) if e.is_connect_failure() => {
            info!("[Reboot] SSH client reported dropping the connection while issuing `reboot`, assuming the remote SSH server was shut down.");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// 等待运行时间变小（即主机已重启并可以登录）
async fn wait_for_lower_uptime(context: &dyn ExecutionContext, old_uptime: f64) -> Result<(), UnlockError> {
    info!("[Reboot] Waiting for {} to come back online ..", context.describe());
    loop {
        match get_uptime(context).await {
            Ok(uptime) if uptime < old_uptime => return Ok(()),
            Ok(_) => sleep(UPTIME_INTERVAL).await,
            Err(e) if e.is_connect_failure() => sleep(RECONNECT_INTERVAL).await,
            Err(e) => return Err(e),
        }
    }
}

/// 重启远程主机并等待其重新上线
///
/// `have_config` 表示存在同名配置节，此时重启后调用 `unlock` 解锁。
/// 根文件系统加密但没有配置节时拒绝重启，否则主机将无法重新上线。
pub async fn reboot_remote_system<F, Fut>(
    context: &dyn ExecutionContext,
    have_config: bool,
    unlock: F,
) -> Result<(), UnlockError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<(), UnlockError>>,
{
    let started = Instant::now();
    info!("[Reboot] Preparing to reboot {} ..", context.describe());
    if is_encrypted(context).await? && !have_config {
        return Err(UnlockError::Configuration(format!(
            "{} is using root disk encryption but there's no configuration defined for it! Refusing to reboot because we won't be able to unlock it.",
            context.describe()
        )));
    }

    let old_uptime = get_uptime(context).await?;
    info!(
        "[Reboot] Rebooting after {} of uptime ..",
        format_duration(Duration::from_secs(old_uptime as u64))
    );
    issue_reboot(context).await?;

    if have_config {
        unlock().await?;
    } else {
        debug!("[Reboot] No configuration section, not unlocking.");
    }

    // 解锁后 SSH 服务可能仍在拒绝登录（pam_nologin），因此总是等待运行时间变小
    wait_for_lower_uptime(context, old_uptime).await?;
    let elapsed = Duration::from_secs(started.elapsed().as_secs());
    info!("[Reboot] Took {} to reboot {}.", format_duration(elapsed), context.describe());
    Ok(())
}
