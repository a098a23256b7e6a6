// 磁盘加密口令来源
// - pass 密码库（`pass show NAME`）
// - 终端提示输入（不回显）

use std::process::Stdio;

use anyhow::{Context, Result};
use tokio::process::Command;
use tracing::warn;
use zeroize::Zeroizing;

use super::storage::expand_path;

/// 口令（离开作用域时清零）
pub type Secret = Zeroizing<String>;

/// 获取当前终端设备路径，供 gpg 的 pinentry 使用
async fn current_tty() -> Option<String> {
    let output = Command::new("tty")
        .stdin(Stdio::inherit())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .output()
        .await
        .ok()?;
    output
        .status
        .success()
        .then(|| String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// 通过 pass 程序读取口令（输出的第一行）
pub async fn get_password_from_store(name: &str, store: Option<&str>) -> Result<Option<Secret>> {
    let mut command = Command::new("pass");
    command.args(["show", name]);
    if let Some(tty) = current_tty().await {
        command.env("GPG_TTY", tty);
    }
    if let Some(store) = store {
        command.env("PASSWORD_STORE_DIR", expand_path(store));
    }

    let output = command
        .stdin(Stdio::inherit())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .output()
        .await
        .context("无法运行 pass 程序")?;
    if !output.status.success() {
        anyhow::bail!(
            "pass show {} failed with exit code {}",
            name,
            output.status.code().unwrap_or(-1)
        );
    }

    let stdout = Zeroizing::new(String::from_utf8_lossy(&output.stdout).into_owned());
    match first_line(&stdout) {
        Some(line) => Ok(Some(Zeroizing::new(line.to_string()))),
        None => {
            warn!("[Password] Failed to get disk encryption password using 'pass' program!");
            Ok(None)
        }
    }
}

/// 提示操作员输入口令（阻塞，需要终端）
pub fn prompt_for_password(hostname: &str) -> Result<Secret> {
    let prompt = format!("Enter disk encryption password for '{}': ", hostname);
    let password = rpassword::prompt_password(prompt).context("无法读取口令")?;
    Ok(Zeroizing::new(password))
}

fn first_line(text: &str) -> Option<&str> {
    text.lines().next().filter(|line| !line.is_empty())
}
