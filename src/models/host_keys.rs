// Known Hosts 数据模型
// 按配置节保存预启动 / 启动后环境的 SSH 主机密钥

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

/// 单个配置节的主机密钥记录
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct HostKeyEntry {
    /// 预启动环境的主机密钥（排序后换行拼接）
    #[serde(default)]
    pub pre_boot_host_keys: String,
    /// 启动后环境的主机密钥（排序后换行拼接）
    #[serde(default)]
    pub post_boot_host_keys: String,
    /// 最后一次写入时间
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

impl HostKeyEntry {
    pub fn new(pre_boot: &BTreeSet<String>, post_boot: &BTreeSet<String>) -> Self {
        Self {
            pre_boot_host_keys: join_keys(pre_boot),
            post_boot_host_keys: join_keys(post_boot),
            updated_at: None,
        }
    }

    pub fn pre_boot_keys(&self) -> BTreeSet<String> {
        split_keys(&self.pre_boot_host_keys)
    }

    pub fn post_boot_keys(&self) -> BTreeSet<String> {
        split_keys(&self.post_boot_host_keys)
    }

    /// 密钥内容是否相同（忽略时间戳）
    pub fn same_keys(&self, other: &HostKeyEntry) -> bool {
        self.pre_boot_host_keys == other.pre_boot_host_keys
            && self.post_boot_host_keys == other.post_boot_host_keys
    }
}

/// Known Hosts 文件内容（配置节名 -> 记录）
pub type HostKeysConfig = BTreeMap<String, HostKeyEntry>;

/// 排序后换行拼接
pub fn join_keys(keys: &BTreeSet<String>) -> String {
    keys.iter().map(String::as_str).collect::<Vec<_>>().join("\n")
}

/// 按空白拆分
pub fn split_keys(value: &str) -> BTreeSet<String> {
    value.split_whitespace().map(str::to_string).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_are_sorted_and_newline_joined() {
        let keys: BTreeSet<String> = ["BBB", "AAA"].iter().map(|s| s.to_string()).collect();
        let entry = HostKeyEntry::new(&keys, &BTreeSet::new());
        assert_eq!(entry.pre_boot_host_keys, "AAA\nBBB");
        assert_eq!(entry.post_boot_host_keys, "");
        assert_eq!(entry.pre_boot_keys(), keys);
        assert!(entry.post_boot_keys().is_empty());
    }

    #[test]
    fn test_serialized_field_names() {
        let entry = HostKeyEntry {
            pre_boot_host_keys: "AAA".to_string(),
            post_boot_host_keys: "BBB".to_string(),
            updated_at: None,
        };
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["pre-boot-host-keys"], "AAA");
        assert_eq!(json["post-boot-host-keys"], "BBB");
        assert!(json.get("updated-at").is_none());
    }
}
