// SSH 连接配置
//
// ConnectionProfile 描述一个 SSH 端点（用户、主机、端口、私钥），
// 可以从紧凑的 `user@host:port` 表达式解析得到。

use std::borrow::Cow;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use russh::keys::ssh_key::{Algorithm, EcdsaCurve, HashAlg};

use super::error::SshError;

/// 默认登录用户
pub const DEFAULT_USERNAME: &str = "root";

/// 默认 SSH 端口
pub const DEFAULT_PORT: u16 = 22;

/// SSH 连接配置（构造后不可变）
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionProfile {
    /// 用户名
    username: String,
    /// 主机名、IP 地址或 SSH 别名
    hostname: String,
    /// 端口
    port: u16,
    /// 私钥文件路径
    identity_file: Option<PathBuf>,
}

impl ConnectionProfile {
    /// 使用默认用户和端口创建配置
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            username: DEFAULT_USERNAME.to_string(),
            hostname: hostname.into(),
            port: DEFAULT_PORT,
            identity_file: None,
        }
    }

    /// 解析 `[user@]host[:port]` 表达式
    pub fn parse(expression: &str) -> Result<Self, SshError> {
        let expression = expression.trim();
        let (username, rest) = match expression.split_once('@') {
            Some((user, rest)) => {
                if user.is_empty() {
                    return Err(SshError::Config(format!(
                        "Empty username in connection profile expression {:?}",
                        expression
                    )));
                }
                (user.to_string(), rest)
            }
            None => (DEFAULT_USERNAME.to_string(), expression),
        };

        let (hostname, port) = match rest.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .ok()
                    .filter(|p| *p > 0 && port.chars().all(|c| c.is_ascii_digit()))
                    .ok_or_else(|| {
                        SshError::Config(format!(
                            "Invalid port number in connection profile expression {:?}",
                            expression
                        ))
                    })?;
                (host, port)
            }
            None => (rest, DEFAULT_PORT),
        };

        if hostname.is_empty() || hostname.contains('@') {
            return Err(SshError::Config(format!(
                "Failed to parse connection profile expression {:?}",
                expression
            )));
        }

        Ok(Self {
            username,
            hostname: hostname.to_string(),
            port,
            identity_file: None,
        })
    }

    /// 替换用户名
    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = username.into();
        self
    }

    /// 设置私钥文件
    pub fn with_identity_file(mut self, identity_file: Option<PathBuf>) -> Self {
        self.identity_file = identity_file;
        self
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn identity_file(&self) -> Option<&PathBuf> {
        self.identity_file.as_ref()
    }

    /// `host:port` 形式，用于日志和 ProxyCommand
    pub fn address(&self) -> String {
        format!("{}:{}", self.hostname, self.port)
    }
}

impl fmt::Display for ConnectionProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.username, self.hostname, self.port)
    }
}

impl FromStr for ConnectionProfile {
    type Err = SshError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// 扫描时依次请求的主机密钥算法
/// 每种算法单独握手一次，才能拿到服务器提供的全部主机密钥
pub fn scan_algorithms() -> Vec<Algorithm> {
    vec![
        Algorithm::Ed25519,
        Algorithm::Ecdsa {
            curve: EcdsaCurve::NistP256,
        },
        Algorithm::Rsa {
            hash: Some(HashAlg::Sha512),
        },
    ]
}

/// 构建只协商指定主机密钥算法的 russh 配置
pub fn scan_config(algorithm: Algorithm, scan_timeout: Duration) -> russh::client::Config {
    let mut config = russh::client::Config::default();
    // 握手期间服务器长时间无响应时断开
    config.inactivity_timeout = Some(scan_timeout);
    config.preferred = russh::Preferred {
        key: Cow::Owned(vec![algorithm]),
        ..russh::Preferred::default()
    };
    config
}
