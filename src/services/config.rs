// 用户配置加载
//
// 按顺序读取以下文件，后读取的同名配置节覆盖先前的同名键：
//   /etc/unlock-remote-system.toml
//   /etc/unlock-remote-system.d/*.toml
//   ~/.config/unlock-remote-system.toml
//   ~/.config/unlock-remote-system.d/*.toml
//
// 每个顶层表是一个配置节（通常对应一台主机），值一律按字符串处理。

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::storage::{get_config_dir, PROGRAM_NAME};

/// 单个配置节的选项
pub type SectionOptions = BTreeMap<String, String>;

/// 配置加载器
#[derive(Clone, Debug, Default)]
pub struct ConfigLoader {
    /// 实际读取到的文件
    files: Vec<PathBuf>,
    /// 合并后的配置节
    sections: BTreeMap<String, SectionOptions>,
}

impl ConfigLoader {
    /// 从默认位置加载
    pub fn new() -> Result<Self> {
        let mut directories = vec![PathBuf::from("/etc")];
        if let Ok(dir) = get_config_dir() {
            directories.push(dir);
        }
        Self::from_directories(&directories)
    }

    /// 从给定的基础目录加载（每个目录下的 PROGRAM.toml 与 PROGRAM.d/*.toml）
    pub fn from_directories(directories: &[PathBuf]) -> Result<Self> {
        let mut files = Vec::new();
        for directory in directories {
            let main_file = directory.join(format!("{}.toml", PROGRAM_NAME));
            if main_file.is_file() {
                files.push(main_file);
            }
            let fragments = directory.join(format!("{}.d", PROGRAM_NAME));
            if fragments.is_dir() {
                let mut entries: Vec<PathBuf> = fs::read_dir(&fragments)
                    .with_context(|| format!("无法读取配置目录 {}", fragments.display()))?
                    .filter_map(|entry| entry.ok().map(|e| e.path()))
                    .filter(|path| path.extension().map_or(false, |ext| ext == "toml"))
                    .collect();
                entries.sort();
                files.extend(entries);
            }
        }
        Self::from_files(files)
    }

    /// 从文件列表加载
    pub fn from_files(files: Vec<PathBuf>) -> Result<Self> {
        let mut loader = Self::default();
        for file in files {
            loader.merge_file(&file)?;
            loader.files.push(file);
        }
        Ok(loader)
    }

    fn merge_file(&mut self, path: &Path) -> Result<()> {
        debug!("[Config] Loading configuration file {} ..", path.display());
        let content = fs::read_to_string(path)
            .with_context(|| format!("无法读取配置文件 {}", path.display()))?;
        self.merge_str(&content, path)
    }

    fn merge_str(&mut self, content: &str, origin: &Path) -> Result<()> {
        let table: toml::Table = content
            .parse()
            .with_context(|| format!("无法解析配置文件 {}", origin.display()))?;

        for (name, value) in table {
            let toml::Value::Table(options) = value else {
                warn!(
                    "[Config] Ignoring top level key '{}' in {} (expected a section)",
                    name,
                    origin.display()
                );
                continue;
            };
            let section = self.sections.entry(name.clone()).or_default();
            for (key, value) in options {
                let text = match value {
                    toml::Value::String(s) => s,
                    toml::Value::Integer(i) => i.to_string(),
                    toml::Value::Float(f) => f.to_string(),
                    toml::Value::Boolean(b) => b.to_string(),
                    toml::Value::Datetime(d) => d.to_string(),
                    toml::Value::Array(_) | toml::Value::Table(_) => {
                        warn!(
                            "[Config] Ignoring nested value '{}.{}' in {}",
                            name,
                            key,
                            origin.display()
                        );
                        continue;
                    }
                };
                section.insert(key, text);
            }
        }
        Ok(())
    }

    /// 读取到的配置文件
    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    /// 所有配置节名称（已排序）
    pub fn section_names(&self) -> Vec<String> {
        self.sections.keys().cloned().collect()
    }

    pub fn has_section(&self, name: &str) -> bool {
        self.sections.contains_key(name)
    }

    /// 获取配置节选项；不存在时返回空表
    pub fn get_options(&self, name: &str) -> SectionOptions {
        self.sections.get(name).cloned().unwrap_or_default()
    }
}
