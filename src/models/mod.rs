// 数据模型模块

pub mod fingerprint;
pub mod host_keys;

pub use fingerprint::{ServerFingerprint, POST_BOOT_SERVER, PRE_BOOT_SERVER};
pub use host_keys::{HostKeyEntry, HostKeysConfig};
