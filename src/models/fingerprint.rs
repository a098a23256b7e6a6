// SSH 服务端身份快照
// 每次探测都会新建，用于判断远程主机处于哪个启动阶段

use std::collections::BTreeSet;

/// 预启动环境（initramfs）中 SSH 服务的特征
pub const PRE_BOOT_SERVER: &str = "dropbear";

/// 完整系统中 SSH 服务的特征
pub const POST_BOOT_SERVER: &str = "openssh";

/// SSH 服务端指纹：版本横幅 + 主机密钥集合
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ServerFingerprint {
    /// 服务端发送的第一行（例如 SSH-2.0-dropbear_2020.81）
    banner: String,
    /// 主机密钥（OpenSSH 编码中的 base64 部分）
    host_keys: BTreeSet<String>,
}

impl ServerFingerprint {
    pub fn new(banner: impl Into<String>, host_keys: BTreeSet<String>) -> Self {
        Self {
            banner: banner.into(),
            host_keys,
        }
    }

    pub fn banner(&self) -> &str {
        &self.banner
    }

    pub fn host_keys(&self) -> &BTreeSet<String> {
        &self.host_keys
    }

    /// 没有拿到任何信息（主机不可达）
    pub fn is_empty(&self) -> bool {
        self.banner.is_empty() && self.host_keys.is_empty()
    }

    /// 横幅是否包含指定子串（忽略大小写）
    pub fn matches_banner(&self, substring: &str) -> bool {
        !self.banner.is_empty()
            && self
                .banner
                .to_lowercase()
                .contains(&substring.to_lowercase())
    }

    /// 主机密钥是否与给定集合有交集
    pub fn shares_keys_with(&self, keys: &BTreeSet<String>) -> bool {
        !self.host_keys.is_disjoint(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_matches_banner_case_insensitive() {
        let fp = ServerFingerprint::new("SSH-2.0-dropbear_2020.81", BTreeSet::new());
        assert!(fp.matches_banner("Dropbear"));
        assert!(!fp.matches_banner(POST_BOOT_SERVER));
        assert!(!ServerFingerprint::default().matches_banner(""));
    }

    #[test]
    fn test_equality_requires_both_fields() {
        let a = ServerFingerprint::new("SSH-2.0-OpenSSH_8.9", keys(&["AAA"]));
        let b = ServerFingerprint::new("SSH-2.0-OpenSSH_8.9", keys(&["BBB"]));
        let c = ServerFingerprint::new("SSH-2.0-OpenSSH_9.6", keys(&["AAA"]));
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(a, a.clone());
    }

    #[test]
    fn test_shares_keys_with() {
        let fp = ServerFingerprint::new("", keys(&["AAA", "BBB"]));
        assert!(fp.shares_keys_with(&keys(&["BBB", "CCC"])));
        assert!(!fp.shares_keys_with(&keys(&["CCC"])));
        assert!(!fp.shares_keys_with(&BTreeSet::new()));
        assert!(!fp.is_empty());
        assert!(ServerFingerprint::default().is_empty());
    }
}
