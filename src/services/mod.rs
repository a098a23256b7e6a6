// 本地服务：配置加载、主机密钥持久化、口令来源

pub mod config;
pub mod password;
pub mod storage;

pub use config::{ConfigLoader, SectionOptions};
pub use password::{get_password_from_store, prompt_for_password, Secret};
pub use storage::{expand_path, HostKeyStore};
