// 本地数据持久化服务
//
// HostKeyStore 按配置节保存观察到的 SSH 主机密钥，
// 之后的运行可以据此识别启动阶段，而不需要操作员确认。
// 同一配置节不支持并发写入；watch 模式下每个进程只写自己的配置节。

use anyhow::{Context, Result};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::models::{HostKeyEntry, HostKeysConfig};

/// 程序名（配置文件、目录都以此命名）
pub const PROGRAM_NAME: &str = "unlock-remote-system";

/// 主机密钥文件名
pub const HOST_KEYS_FILE_NAME: &str = "known-hosts.json";

/// 获取用户配置目录路径
/// Linux: ~/.config
/// macOS: ~/Library/Application Support
pub fn get_config_dir() -> Result<PathBuf> {
    dirs::config_dir().context("无法获取系统配置目录")
}

/// 获取程序的配置片段目录（~/.config/unlock-remote-system.d）
pub fn get_program_config_dir() -> Result<PathBuf> {
    Ok(get_config_dir()?.join(format!("{}.d", PROGRAM_NAME)))
}

/// 获取主机密钥文件路径
pub fn get_host_keys_file() -> Result<PathBuf> {
    Ok(get_program_config_dir()?.join(HOST_KEYS_FILE_NAME))
}

/// 展开以 `~/` 开头的路径
pub fn expand_path(value: &str) -> PathBuf {
    match value.strip_prefix("~/") {
        Some(rest) => match dirs::home_dir() {
            Some(home) => home.join(rest),
            None => PathBuf::from(value),
        },
        None => PathBuf::from(value),
    }
}

/// 主机密钥存储
#[derive(Clone, Debug)]
pub struct HostKeyStore {
    path: PathBuf,
}

impl HostKeyStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// 使用默认路径
    pub fn open_default() -> Result<Self> {
        Ok(Self::new(get_host_keys_file()?))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 读取整个文件；文件不存在时返回空配置
    fn load_all(&self) -> Result<HostKeysConfig> {
        if !self.path.exists() {
            return Ok(HostKeysConfig::new());
        }
        let content = fs::read_to_string(&self.path).context("无法读取主机密钥文件")?;
        if content.trim().is_empty() {
            return Ok(HostKeysConfig::new());
        }
        let config: HostKeysConfig =
            serde_json::from_str(&content).context("无法解析主机密钥文件")?;
        Ok(config)
    }

    /// 读取某个配置节的记录
    pub fn entry(&self, section: &str) -> Result<Option<HostKeyEntry>> {
        Ok(self.load_all()?.remove(section))
    }

    /// 读取某个配置节已知的预启动环境主机密钥
    pub fn load(&self, section: &str) -> Result<BTreeSet<String>> {
        Ok(self
            .entry(section)?
            .map(|entry| entry.pre_boot_keys())
            .unwrap_or_default())
    }

    /// 保存主机密钥；内容未变化时不写文件，返回是否写入
    pub fn save(
        &self,
        section: &str,
        pre_boot: &BTreeSet<String>,
        post_boot: &BTreeSet<String>,
    ) -> Result<bool> {
        let mut config = self.load_all()?;
        let mut entry = HostKeyEntry::new(pre_boot, post_boot);

        if let Some(existing) = config.get(section) {
            if existing.same_keys(&entry) {
                debug!(
                    "[HostKeys] SSH host keys of '{}' unchanged, not writing {}",
                    section,
                    self.path.display()
                );
                return Ok(false);
            }
        }

        info!(
            "[HostKeys] Storing SSH host keys of '{}' in {} ..",
            section,
            self.path.display()
        );
        entry.updated_at = Some(chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string());
        config.insert(section.to_string(), entry);

        if let Some(parent) = self.path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent).context("无法创建配置目录")?;
            }
        }
        let content = serde_json::to_string_pretty(&config).context("无法序列化主机密钥")?;
        fs::write(&self.path, content).context("无法写入主机密钥文件")?;
        Ok(true)
    }
}
