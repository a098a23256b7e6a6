// 解锁会话设置
//
// 来源有两种：配置文件中的配置节，或命令行给出的连接表达式。
// 命令行选项会覆盖配置节中的同名设置。

use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use tracing::debug;

use crate::models::host_keys::split_keys;
use crate::services::{expand_path, get_password_from_store, SectionOptions, Secret};
use crate::ssh::config::DEFAULT_USERNAME;
use crate::ssh::scanner::DEFAULT_SCAN_TIMEOUT;
use crate::ssh::{ConnectionProfile, HostKeyPolicy, SecureShellContext};

use super::error::UnlockError;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2 * 60);
pub const DEFAULT_BOOT_TIMEOUT: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_WATCH_INTERVAL: Duration = Duration::from_secs(60);

pub const DEFAULT_NAMED_PIPE: &str = "/lib/cryptsetup/passfifo";
pub const DEFAULT_CRYPTROOT_CONFIG: &str = "/conf/conf.d/cryptroot";
pub const DEFAULT_CRYPTROOT_PROGRAM: &str = "/scripts/local-top/cryptroot";
pub const DEFAULT_KEY_SCRIPT: &str = "/tmp/keyscript.sh";

/// 解析时间跨度（"2m"、"90s"；纯整数按秒计）
pub fn parse_timespan(value: &str) -> Result<Duration, UnlockError> {
    let value = value.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Ok(Duration::from_secs(seconds));
    }
    humantime::parse_duration(value)
        .map_err(|e| UnlockError::Configuration(format!("invalid timespan '{}': {}", value, e)))
}

/// 解析连接表达式，格式错误时返回配置错误
pub fn parse_profile(expression: &str) -> Result<ConnectionProfile, UnlockError> {
    ConnectionProfile::parse(expression).map_err(|e| UnlockError::Configuration(e.to_string()))
}

/// 当前本地用户名
pub fn find_local_username() -> Result<String, UnlockError> {
    ["USER", "LOGNAME"]
        .iter()
        .filter_map(|name| std::env::var(name).ok())
        .find(|value| !value.is_empty())
        .ok_or_else(|| UnlockError::Configuration("unable to determine local username".into()))
}

/// 等待与重试的时间设置
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Timing {
    /// 等待预启动环境的总时长
    pub connect_timeout: Duration,
    /// 等待启动完成的总时长
    pub boot_timeout: Duration,
    /// 两次探测之间的间隔
    pub retry_interval: Duration,
    /// watch 模式的探测间隔
    pub watch_interval: Duration,
    /// 单次探测超时
    pub scan_timeout: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            boot_timeout: DEFAULT_BOOT_TIMEOUT,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            watch_interval: DEFAULT_WATCH_INTERVAL,
            scan_timeout: DEFAULT_SCAN_TIMEOUT,
        }
    }
}

/// 预启动环境中的路径
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeliveryPaths {
    pub named_pipe: String,
    pub cryptroot_config: String,
    pub cryptroot_program: String,
    pub key_script: String,
}

impl Default for DeliveryPaths {
    fn default() -> Self {
        Self {
            named_pipe: DEFAULT_NAMED_PIPE.to_string(),
            cryptroot_config: DEFAULT_CRYPTROOT_CONFIG.to_string(),
            cryptroot_program: DEFAULT_CRYPTROOT_PROGRAM.to_string(),
            key_script: DEFAULT_KEY_SCRIPT.to_string(),
        }
    }
}

/// 口令来源
#[derive(Clone, Default)]
pub enum PasswordSource {
    #[default]
    None,
    /// 直接给出的口令
    Literal(Secret),
    /// pass 密码库中的条目
    Store { name: String, store: Option<String> },
}

// 不输出口令本身
impl fmt::Debug for PasswordSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "None"),
            Self::Literal(_) => write!(f, "Literal(..)"),
            Self::Store { name, store } => f
                .debug_struct("Store")
                .field("name", name)
                .field("store", store)
                .finish(),
        }
    }
}

impl PasswordSource {
    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }

    /// 取得口令
    pub async fn resolve(&self) -> Result<Option<Secret>, UnlockError> {
        match self {
            Self::None => Ok(None),
            Self::Literal(secret) => Ok(Some(secret.clone())),
            Self::Store { name, store } => {
                debug!("[Unlock] Looking up password '{}' in password store ..", name);
                Ok(get_password_from_store(name, store.as_deref()).await?)
            }
        }
    }
}

/// 解锁会话设置
#[derive(Clone, Debug)]
pub struct UnlockSettings {
    /// 配置节名称（用于持久化主机密钥）
    pub config_section: Option<String>,
    /// 预启动环境连接
    pub pre_boot: ConnectionProfile,
    /// 启动完成后的连接
    pub post_boot: ConnectionProfile,
    /// 经由哪个 SSH 别名访问远程主机
    pub ssh_proxy: Option<String>,
    /// 预启动环境使用的 known_hosts 文件；未设置时不校验主机密钥
    pub known_hosts_file: Option<PathBuf>,
    pub password: PasswordSource,
    pub paths: DeliveryPaths,
    pub timing: Timing,
    /// 配置中给出的预启动环境主机密钥
    pub known_keys: BTreeSet<String>,
}

impl UnlockSettings {
    pub fn new(pre_boot: ConnectionProfile, post_boot: ConnectionProfile) -> Self {
        Self {
            config_section: None,
            pre_boot,
            post_boot,
            ssh_proxy: None,
            known_hosts_file: None,
            password: PasswordSource::None,
            paths: DeliveryPaths::default(),
            timing: Timing::default(),
            known_keys: BTreeSet::new(),
        }
    }

    /// 从配置节构建
    pub fn from_section(name: &str, options: &SectionOptions) -> Result<Self, UnlockError> {
        let option = |key: &str| options.get(key).filter(|value| !value.trim().is_empty());

        let identity_file = option("identity-file").map(|path| expand_path(path));
        let pre_boot = parse_profile(option("pre-boot").map_or(name, String::as_str))?
            .with_identity_file(identity_file);
        let post_boot = parse_profile(option("post-boot").map_or(name, String::as_str))?;

        let mut settings = Self::new(pre_boot, post_boot);
        settings.config_section = Some(name.to_string());
        settings.ssh_proxy = option("ssh-proxy").cloned();
        settings.known_hosts_file = option("known-hosts-file").map(|path| expand_path(path));

        settings.password = if let Some(password) = option("password") {
            PasswordSource::Literal(Secret::new(password.clone()))
        } else if let Some(name) = option("password-name") {
            PasswordSource::Store {
                name: name.clone(),
                store: option("password-store").cloned(),
            }
        } else {
            PasswordSource::None
        };

        let paths = &mut settings.paths;
        for (key, target) in [
            ("named-pipe", &mut paths.named_pipe),
            ("cryptroot-config", &mut paths.cryptroot_config),
            ("cryptroot-program", &mut paths.cryptroot_program),
            ("key-script", &mut paths.key_script),
        ] {
            if let Some(value) = option(key) {
                *target = value.clone();
            }
        }

        let timing = &mut settings.timing;
        for (key, target) in [
            ("connect-timeout", &mut timing.connect_timeout),
            ("boot-timeout", &mut timing.boot_timeout),
            ("retry-interval", &mut timing.retry_interval),
            ("watch-interval", &mut timing.watch_interval),
            ("scan-timeout", &mut timing.scan_timeout),
        ] {
            if let Some(value) = option(key) {
                *target = parse_timespan(value)?;
            }
        }

        if let Some(keys) = option("pre-boot-host-keys") {
            settings.known_keys = split_keys(keys);
        }
        Ok(settings)
    }

    /// 是否以 root 身份连接预启动环境
    pub fn connects_as_root(&self) -> bool {
        self.pre_boot.username() == DEFAULT_USERNAME
    }

    /// 预启动环境主机密钥校验策略
    pub fn host_key_policy(&self) -> HostKeyPolicy {
        match &self.known_hosts_file {
            Some(path) => HostKeyPolicy::KnownHostsFile(path.clone()),
            None => HostKeyPolicy::Ignore,
        }
    }

    /// 启动完成后的 SSH 上下文
    pub fn post_context(&self) -> SecureShellContext {
        SecureShellContext::new(&self.post_boot).with_connect_timeout(self.timing.scan_timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(pairs: &[(&str, &str)]) -> SectionOptions {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_parse_timespan() {
        assert_eq!(parse_timespan("90").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_timespan("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_timespan(" 1s ").unwrap(), Duration::from_secs(1));
        assert_eq!(parse_timespan("1h 30m").unwrap(), Duration::from_secs(5400));
        assert!(matches!(
            parse_timespan("soon"),
            Err(UnlockError::Configuration(_))
        ));
    }

    #[test]
    fn test_section_defaults_to_its_name() {
        let settings = UnlockSettings::from_section("nas", &SectionOptions::new()).unwrap();
        assert_eq!(settings.config_section.as_deref(), Some("nas"));
        assert_eq!(settings.pre_boot.to_string(), "root@nas:22");
        assert_eq!(settings.post_boot.to_string(), "root@nas:22");
        assert_eq!(settings.timing, Timing::default());
        assert_eq!(settings.paths, DeliveryPaths::default());
        assert!(settings.password.is_none());
        assert!(settings.known_keys.is_empty());
        assert!(settings.connects_as_root());
        assert_eq!(settings.host_key_policy(), HostKeyPolicy::Ignore);
    }

    #[test]
    fn test_section_options() {
        let settings = UnlockSettings::from_section(
            "nas",
            &options(&[
                ("pre-boot", "nas.lan:2222"),
                ("post-boot", "peter@nas.lan"),
                ("identity-file", "/etc/keys/unlock"),
                ("ssh-proxy", "gateway"),
                ("password-name", "hosts/nas"),
                ("password-store", "~/.secrets"),
                ("named-pipe", "/run/passfifo"),
                ("boot-timeout", "10m"),
                ("retry-interval", "2"),
                ("pre-boot-host-keys", "KEY2\nKEY1"),
                ("known-hosts-file", "/etc/unlock/known_hosts"),
            ]),
        )
        .unwrap();

        assert_eq!(settings.pre_boot.to_string(), "root@nas.lan:2222");
        assert_eq!(
            settings.pre_boot.identity_file(),
            Some(&PathBuf::from("/etc/keys/unlock"))
        );
        assert_eq!(settings.post_boot.to_string(), "peter@nas.lan:22");
        assert_eq!(settings.ssh_proxy.as_deref(), Some("gateway"));
        assert!(matches!(
            &settings.password,
            PasswordSource::Store { name, store: Some(store) } if name == "hosts/nas" && store == "~/.secrets"
        ));
        assert_eq!(settings.paths.named_pipe, "/run/passfifo");
        assert_eq!(settings.paths.key_script, DEFAULT_KEY_SCRIPT);
        assert_eq!(settings.timing.boot_timeout, Duration::from_secs(600));
        assert_eq!(settings.timing.retry_interval, Duration::from_secs(2));
        assert_eq!(settings.timing.connect_timeout, DEFAULT_CONNECT_TIMEOUT);
        assert_eq!(settings.known_keys.len(), 2);
        assert_eq!(
            settings.host_key_policy(),
            HostKeyPolicy::KnownHostsFile(PathBuf::from("/etc/unlock/known_hosts"))
        );
    }

    #[test]
    fn test_literal_password_wins_over_store() {
        let settings = UnlockSettings::from_section(
            "nas",
            &options(&[("password", "hunter2"), ("password-name", "hosts/nas")]),
        )
        .unwrap();
        assert!(matches!(&settings.password, PasswordSource::Literal(s) if s.as_str() == "hunter2"));
        assert!(!format!("{:?}", settings).contains("hunter2"));
    }

    #[test]
    fn test_malformed_section_is_configuration_error() {
        let bad_port = UnlockSettings::from_section("nas", &options(&[("pre-boot", "nas:ssh")]));
        assert!(matches!(bad_port, Err(UnlockError::Configuration(_))));
        let bad_timeout =
            UnlockSettings::from_section("nas", &options(&[("connect-timeout", "forever")]));
        assert!(matches!(bad_timeout, Err(UnlockError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_literal_password_resolves() {
        let source = PasswordSource::Literal(Secret::new("correct-horse".into()));
        let secret = source.resolve().await.unwrap().unwrap();
        assert_eq!(secret.as_str(), "correct-horse");
        assert!(PasswordSource::None.resolve().await.unwrap().is_none());
    }
}
