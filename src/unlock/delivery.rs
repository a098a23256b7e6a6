// 口令投递
//
// 三种方式按固定顺序尝试，由预启动环境中是否存在对应文件决定：
// 1. 命名管道（cryptsetup 的 passfifo）
// 2. 密钥脚本（改写 cryptroot 配置后重新运行 cryptroot）
// 3. 交互式运行 cryptroot

use std::sync::Arc;

use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::ssh::context::quote;
use crate::ssh::{ExecutionContext, RemoteCommand};

use super::error::UnlockError;
use super::settings::DeliveryPaths;

/// 紧急 shell 的程序名
const EMERGENCY_SHELL: &str = "/bin/sh";

/// 投递方式
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeliveryMethod {
    NamedPipe,
    KeyScript,
    Interactive,
}

/// 从 ps 输出中找出运行某个程序的进程（忽略 init）
pub fn parse_process_id(listing: &str, program: &str) -> Option<u32> {
    listing.lines().find_map(|line| {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.len() < 2 {
            return None;
        }
        let pid: u32 = tokens[0].parse().ok()?;
        (pid != 1 && tokens.contains(&program)).then_some(pid)
    })
}

/// 把 cryptroot 配置的每一项改为使用密钥脚本
pub fn annotate_cryptroot_config(contents: &str, key_script: &str) -> String {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| format!("{},keyscript={}\n", line, key_script))
        .collect()
}

/// 口令投递
pub struct SecretDelivery {
    /// 预启动环境
    context: Arc<dyn ExecutionContext>,
    paths: DeliveryPaths,
}

impl SecretDelivery {
    pub fn new(context: Arc<dyn ExecutionContext>, paths: DeliveryPaths) -> Self {
        Self { context, paths }
    }

    async fn have_named_pipe(&self) -> Result<bool, UnlockError> {
        Ok(self.context.test(&["test", "-p", self.paths.named_pipe.as_str()]).await?)
    }

    async fn have_cryptroot_config(&self) -> Result<bool, UnlockError> {
        Ok(self.context.is_file(&self.paths.cryptroot_config).await?)
    }

    async fn have_cryptroot_program(&self) -> Result<bool, UnlockError> {
        Ok(self.context.is_file(&self.paths.cryptroot_program).await?)
    }

    /// 选择投递方式；只做检查，不修改远程状态
    pub async fn select(&self, with_secret: bool) -> Result<DeliveryMethod, UnlockError> {
        if with_secret {
            if self.have_named_pipe().await? {
                return Ok(DeliveryMethod::NamedPipe);
            }
            if self.have_cryptroot_config().await? {
                return Ok(DeliveryMethod::KeyScript);
            }
            warn!(
                "[Deliver] The named pipe '{}' and the configuration file '{}' are both missing, unable to offer the password non-interactively.",
                self.paths.named_pipe, self.paths.cryptroot_config
            );
        } else {
            info!("[Deliver] No password was provided, unable to offer it non-interactively.");
        }
        if self.have_cryptroot_program().await? {
            return Ok(DeliveryMethod::Interactive);
        }
        Err(UnlockError::UnsupportedSystem(format!(
            "The named pipe '{}', configuration file '{}' and program file '{}' are all missing! Could it be that the system has already booted?",
            self.paths.named_pipe, self.paths.cryptroot_config, self.paths.cryptroot_program
        )))
    }

    /// 把口令交给预启动环境
    pub async fn deliver(&self, secret: Option<&str>) -> Result<DeliveryMethod, UnlockError> {
        let method = self.select(secret.is_some()).await?;
        match (method, secret) {
            (DeliveryMethod::NamedPipe, Some(secret)) => self.write_to_named_pipe(secret).await?,
            (DeliveryMethod::KeyScript, Some(secret)) => {
                self.kill_interactive_prompt().await?;
                self.create_key_script(secret).await?;
                self.run_cryptroot_program(false).await?;
                self.kill_emergency_shell().await?;
            }
            (DeliveryMethod::Interactive, _) | (_, None) => {
                info!("[Deliver] Opening an interactive prompt instead ..");
                self.kill_interactive_prompt().await?;
                self.run_cryptroot_program(true).await?;
                self.kill_emergency_shell().await?;
            }
        }
        Ok(method)
    }

    async fn write_to_named_pipe(&self, secret: &str) -> Result<(), UnlockError> {
        info!("[Deliver] Unlocking root filesystem using named pipe ..");
        self.context
            .write_file(&self.paths.named_pipe, secret.as_bytes())
            .await?;
        Ok(())
    }

    async fn create_key_script(&self, secret: &str) -> Result<(), UnlockError> {
        let key_script = &self.paths.key_script;
        info!("[Deliver] Creating key script: {}", key_script);
        let script = Zeroizing::new(format!("echo -n {}\n", quote(secret)));
        self.context.write_file(key_script, script.as_bytes()).await?;
        self.context
            .execute(RemoteCommand::new(["chmod", "700", key_script.as_str()]))
            .await?;

        let config = &self.paths.cryptroot_config;
        info!("[Deliver] Updating configuration file: {}", config);
        let contents = self.context.read_file(config).await?;
        let annotated = annotate_cryptroot_config(&contents, key_script);
        self.context.write_file(config, annotated.as_bytes()).await?;
        Ok(())
    }

    async fn run_cryptroot_program(&self, interactive: bool) -> Result<(), UnlockError> {
        info!("[Deliver] Restarting {} program ..", self.paths.cryptroot_program);
        let mut command = RemoteCommand::new([self.paths.cryptroot_program.as_str()]);
        if interactive {
            command = command.tty();
        }
        self.context.execute(command).await?;
        Ok(())
    }

    async fn find_process_id(&self, program: &str, tolerate_failure: bool) -> Result<Option<u32>, UnlockError> {
        debug!("[Deliver] Looking for process id of '{}' ..", program);
        let mut command = RemoteCommand::new(["ps"]).silent();
        if tolerate_failure {
            command = command.tolerate_failure();
        }
        let listing = self.context.execute(command).await?.stdout_string();
        let pid = parse_process_id(&listing, program);
        if let Some(pid) = pid {
            debug!("[Deliver] Matched process id {}.", pid);
        }
        Ok(pid)
    }

    async fn kill_interactive_prompt(&self) -> Result<(), UnlockError> {
        info!("[Deliver] Looking for '{}' process ..", self.paths.cryptroot_program);
        if let Some(pid) = self.find_process_id(&self.paths.cryptroot_program, false).await? {
            info!("[Deliver] Killing interactive prompt with process id {} ..", pid);
            let pid = pid.to_string();
            let command = RemoteCommand::new(["kill", "-9", pid.as_str()]).tolerate_failure();
            if self.context.execute(command).await?.is_success() {
                return Ok(());
            }
        }
        warn!("[Deliver] Failed to identify and kill the process responsible for the interactive prompt! The remote system may block on it and need manual intervention.");
        Ok(())
    }

    async fn kill_emergency_shell(&self) -> Result<(), UnlockError> {
        info!("[Deliver] Looking for emergency shell process ({} -i) ..", EMERGENCY_SHELL);
        if let Some(pid) = self.find_process_id(EMERGENCY_SHELL, true).await? {
            info!("[Deliver] Killing emergency shell with process id {} ..", pid);
            let pid = pid.to_string();
            match self
                .context
                .execute(RemoteCommand::new(["kill", "-9", pid.as_str()]))
                .await
            {
                Ok(_) => return Ok(()),
                Err(e) if e.is_connect_failure() => return Err(e.into()),
                Err(e) => debug!("[Deliver] Failed to kill emergency shell: {}", e),
            }
        }
        warn!("[Deliver] Failed to identify and kill the emergency shell process. Booting may block until it is terminated, in which case manual intervention is required.");
        Ok(())
    }
}
