// 命令执行上下文
//
// - ExecutionContext: 统一的“执行命令 / 捕获输出 / 判断路径”接口
// - LocalContext: 在控制端本机执行
// - SecureShellContext: 通过 OpenSSH 客户端在远程主机执行
//
// 预启动环境（initramfs）里只有 busybox 和 dropbear，
// 所以所有远程操作都落到最朴素的 sh 命令上。

use std::borrow::Cow;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, trace};
use zeroize::Zeroizing;

use super::config::ConnectionProfile;
use super::error::SshError;

/// OpenSSH 客户端程序名
pub const SSH_PROGRAM: &str = "ssh";

/// SSH 客户端用 255 表示连接失败
const SSH_CONNECT_FAILED: i32 = 255;

/// 一次命令调用及其选项
#[derive(Clone, Debug)]
pub struct RemoteCommand {
    argv: Vec<String>,
    sudo: bool,
    tty: bool,
    environment: Vec<(String, String)>,
    silent: bool,
    tolerate_failure: bool,
    input: Option<Zeroizing<Vec<u8>>>,
}

impl RemoteCommand {
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            sudo: false,
            tty: false,
            environment: Vec::new(),
            silent: false,
            tolerate_failure: false,
            input: None,
        }
    }

    /// 以 sudo 提权执行
    pub fn sudo(mut self) -> Self {
        self.sudo = true;
        self
    }

    /// 分配伪终端并接管本地终端
    pub fn tty(mut self) -> Self {
        self.tty = true;
        self
    }

    /// 追加环境变量
    pub fn env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.push((name.into(), value.into()));
        self
    }

    /// 不记录 info 级别日志
    pub fn silent(mut self) -> Self {
        self.silent = true;
        self
    }

    /// 非零退出码不视为错误
    pub fn tolerate_failure(mut self) -> Self {
        self.tolerate_failure = true;
        self
    }

    /// 通过标准输入传入数据（不会出现在日志或进程列表中）
    pub fn input(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.input = Some(Zeroizing::new(data.into()));
        self
    }

    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    pub fn is_sudo(&self) -> bool {
        self.sudo
    }

    pub fn is_tty(&self) -> bool {
        self.tty
    }

    pub fn is_silent(&self) -> bool {
        self.silent
    }

    pub fn tolerates_failure(&self) -> bool {
        self.tolerate_failure
    }

    pub fn environment(&self) -> &[(String, String)] {
        &self.environment
    }

    pub fn input_bytes(&self) -> Option<&[u8]> {
        self.input.as_ref().map(|data| data.as_slice())
    }

    /// 转成一条 shell 命令行（sudo / env 前缀 + 逐个转义的参数）
    pub fn to_shell(&self) -> String {
        let mut words: Vec<String> = Vec::new();
        if self.sudo {
            words.push("sudo".to_string());
        }
        if !self.environment.is_empty() {
            words.push("env".to_string());
            for (name, value) in &self.environment {
                words.push(quote(&format!("{}={}", name, value)));
            }
        }
        words.extend(self.argv.iter().map(|arg| quote(arg)));
        words.join(" ")
    }
}

/// 对单个参数做 POSIX shell 转义
pub fn quote(word: &str) -> String {
    shell_escape::unix::escape(Cow::Borrowed(word)).into_owned()
}

/// 命令输出
#[derive(Debug, Default)]
pub struct CommandOutput {
    /// 标准输出
    pub stdout: Vec<u8>,
    /// 标准错误
    pub stderr: Vec<u8>,
    /// 退出码（被信号终止时为 -1）
    pub exit_code: i32,
}

impl CommandOutput {
    /// 获取标准输出字符串
    pub fn stdout_string(&self) -> String {
        String::from_utf8_lossy(&self.stdout).to_string()
    }

    /// 获取标准错误字符串
    pub fn stderr_string(&self) -> String {
        String::from_utf8_lossy(&self.stderr).to_string()
    }

    /// 检查命令是否成功
    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }
}

/// 命令执行上下文
#[async_trait]
pub trait ExecutionContext: Send + Sync {
    /// 用于日志的描述
    fn describe(&self) -> String;

    /// 执行命令
    async fn execute(&self, command: RemoteCommand) -> Result<CommandOutput, SshError>;

    /// 执行命令并返回标准输出
    async fn capture(&self, argv: &[&str]) -> Result<String, SshError> {
        let output = self
            .execute(RemoteCommand::new(argv.iter().copied()).silent())
            .await?;
        Ok(output.stdout_string())
    }

    /// 执行命令并返回是否成功；连接失败也视为 false
    async fn test(&self, argv: &[&str]) -> Result<bool, SshError> {
        let command = RemoteCommand::new(argv.iter().copied())
            .silent()
            .tolerate_failure();
        match self.execute(command).await {
            Ok(output) => Ok(output.is_success()),
            Err(e) if e.is_connect_failure() => {
                debug!("[SSH] {} unreachable while testing: {}", self.describe(), e);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// 路径是否为普通文件
    async fn is_file(&self, path: &str) -> Result<bool, SshError> {
        self.test(&["test", "-f", path]).await
    }

    /// 读取文件内容
    async fn read_file(&self, path: &str) -> Result<String, SshError> {
        self.capture(&["cat", path]).await
    }

    /// 写入文件（内容经标准输入传递，不出现在命令行中）
    async fn write_file(&self, path: &str, contents: &[u8]) -> Result<(), SshError> {
        let script = format!("cat > {}", quote(path));
        self.execute(RemoteCommand::new(["sh", "-c", script.as_str()]).input(contents))
            .await?;
        Ok(())
    }
}

/// 运行一个本地进程并收集输出
async fn run_process(
    mut process: Command,
    command: &RemoteCommand,
) -> Result<CommandOutput, SshError> {
    if command.is_tty() {
        // 交互式：直接继承本地终端
        let status = process
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
            .await?;
        return Ok(CommandOutput {
            exit_code: status.code().unwrap_or(-1),
            ..Default::default()
        });
    }

    process.stdout(Stdio::piped()).stderr(Stdio::piped());
    process.stdin(if command.input_bytes().is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    });

    let mut child = process.spawn()?;
    if let Some(payload) = command.input_bytes() {
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(payload).await?;
            stdin.shutdown().await.ok();
        }
    }

    let output = child.wait_with_output().await?;
    Ok(CommandOutput {
        stdout: output.stdout,
        stderr: output.stderr,
        exit_code: output.status.code().unwrap_or(-1),
    })
}

fn log_command(target: &str, command: &RemoteCommand) {
    if command.is_silent() {
        trace!("[SSH] Executing on {}: {}", target, command.to_shell());
    } else {
        debug!("[SSH] Executing on {}: {}", target, command.to_shell());
    }
}

/// 本机执行上下文
#[derive(Clone, Debug, Default)]
pub struct LocalContext;

#[async_trait]
impl ExecutionContext for LocalContext {
    fn describe(&self) -> String {
        "local system".to_string()
    }

    async fn execute(&self, command: RemoteCommand) -> Result<CommandOutput, SshError> {
        log_command("local system", &command);

        let mut argv: Vec<&str> = Vec::new();
        if command.is_sudo() {
            argv.push("sudo");
        }
        argv.extend(command.argv().iter().map(String::as_str));
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| SshError::Config("Empty command line".to_string()))?;

        let mut process = Command::new(program);
        process.args(args);
        process.envs(command.environment().iter().map(|(k, v)| (k, v)));

        let output = run_process(process, &command).await?;
        if !output.is_success() && !command.tolerates_failure() {
            return Err(SshError::CommandFailed {
                target: self.describe(),
                command: command.to_shell(),
                exit_code: output.exit_code,
                stderr: output.stderr_string(),
            });
        }
        Ok(output)
    }
}

/// 主机密钥校验策略
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HostKeyPolicy {
    /// 使用 ~/.ssh/config 与默认 known_hosts
    Default,
    /// 使用指定的 known_hosts 文件
    KnownHostsFile(PathBuf),
    /// 不校验（预启动与启动后环境的主机密钥不同，默认 known_hosts 会冲突）
    Ignore,
}

/// 通过 OpenSSH 客户端执行命令的远程上下文
#[derive(Clone, Debug)]
pub struct SecureShellContext {
    /// 主机名或 SSH 别名
    host: String,
    /// 用户名（None 表示交给 ~/.ssh/config 决定）
    username: Option<String>,
    /// 端口（None 表示交给 ~/.ssh/config 决定）
    port: Option<u16>,
    /// 私钥文件
    identity_file: Option<PathBuf>,
    /// 主机密钥策略
    host_keys: HostKeyPolicy,
    /// TCP 连接超时（ConnectTimeout）
    connect_timeout: Option<Duration>,
    /// 额外的 `-o` 选项
    options: Vec<String>,
}

impl SecureShellContext {
    /// 按连接配置创建
    pub fn new(profile: &ConnectionProfile) -> Self {
        Self {
            host: profile.hostname().to_string(),
            username: Some(profile.username().to_string()),
            port: Some(profile.port()),
            identity_file: profile.identity_file().cloned(),
            host_keys: HostKeyPolicy::Default,
            connect_timeout: None,
            options: Vec::new(),
        }
    }

    /// 只用 SSH 别名创建（用户、端口等取自 ~/.ssh/config）
    pub fn alias(alias: impl Into<String>) -> Self {
        Self {
            host: alias.into(),
            username: None,
            port: None,
            identity_file: None,
            host_keys: HostKeyPolicy::Default,
            connect_timeout: None,
            options: Vec::new(),
        }
    }

    /// 在控制目录中复用连接（ControlMaster）
    pub fn with_control_directory(mut self, directory: &Path) -> Self {
        self.options.push("ControlMaster=auto".to_string());
        self.options.push("ControlPersist=60".to_string());
        self.options
            .push(format!("ControlPath={}/%r@%h:%p", directory.display()));
        self
    }

    /// 经由 SSH 跳板机连接
    pub fn with_proxy(mut self, proxy: &str) -> Self {
        let port = self.port.unwrap_or(super::config::DEFAULT_PORT);
        self.options.push(format!(
            "ProxyCommand=ssh {} -W {}:{}",
            quote(proxy),
            quote(&self.host),
            port
        ));
        self
    }

    pub fn with_host_key_policy(mut self, policy: HostKeyPolicy) -> Self {
        self.host_keys = policy;
        self
    }

    /// 限制建立连接的时间
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// 构建完整的本地 ssh 命令行
    pub fn ssh_command(&self, command: Option<&RemoteCommand>) -> Vec<String> {
        let mut argv = vec![SSH_PROGRAM.to_string()];
        let tty = command.map_or(true, RemoteCommand::is_tty);
        if tty {
            argv.push("-t".to_string());
        } else {
            argv.push("-o".to_string());
            argv.push("BatchMode=yes".to_string());
        }
        if let Some(username) = &self.username {
            argv.push("-l".to_string());
            argv.push(username.clone());
        }
        if let Some(port) = self.port {
            argv.push("-p".to_string());
            argv.push(port.to_string());
        }
        if let Some(identity_file) = &self.identity_file {
            argv.push("-i".to_string());
            argv.push(identity_file.display().to_string());
        }
        match &self.host_keys {
            HostKeyPolicy::Default => {}
            HostKeyPolicy::KnownHostsFile(path) => {
                argv.push("-o".to_string());
                argv.push(format!("UserKnownHostsFile={}", path.display()));
            }
            HostKeyPolicy::Ignore => {
                argv.push("-o".to_string());
                argv.push("StrictHostKeyChecking=no".to_string());
                argv.push("-o".to_string());
                argv.push("UserKnownHostsFile=/dev/null".to_string());
            }
        }
        if let Some(timeout) = self.connect_timeout {
            // OpenSSH 只接受整秒
            argv.push("-o".to_string());
            argv.push(format!("ConnectTimeout={}", timeout.as_secs().max(1)));
        }
        for option in &self.options {
            argv.push("-o".to_string());
            argv.push(option.clone());
        }
        argv.push(self.host.clone());
        if let Some(command) = command {
            argv.push(command.to_shell());
        }
        argv
    }

    /// 打开交互式 shell；退出码 130（Ctrl-C 后 Ctrl-D）被忽略
    pub async fn start_interactive_shell(&self) -> Result<(), SshError> {
        let argv = self.ssh_command(None);
        debug!("[SSH] Starting interactive shell: {}", argv.join(" "));
        let status = Command::new(&argv[0])
            .args(&argv[1..])
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
            .await?;
        match status.code() {
            Some(0) | Some(130) => Ok(()),
            Some(SSH_CONNECT_FAILED) => Err(SshError::ConnectFailed {
                target: self.describe(),
                stderr: String::new(),
            }),
            code => Err(SshError::CommandFailed {
                target: self.describe(),
                command: "interactive shell".to_string(),
                exit_code: code.unwrap_or(-1),
                stderr: String::new(),
            }),
        }
    }
}

#[async_trait]
impl ExecutionContext for SecureShellContext {
    fn describe(&self) -> String {
        match (&self.username, self.port) {
            (Some(user), Some(port)) => format!("{}@{}:{}", user, self.host, port),
            _ => self.host.clone(),
        }
    }

    async fn execute(&self, command: RemoteCommand) -> Result<CommandOutput, SshError> {
        let target = self.describe();
        log_command(&target, &command);

        let argv = self.ssh_command(Some(&command));
        let mut process = Command::new(&argv[0]);
        process.args(&argv[1..]);

        let output = run_process(process, &command).await?;
        if output.exit_code == SSH_CONNECT_FAILED {
            return Err(SshError::ConnectFailed {
                target,
                stderr: output.stderr_string().trim().to_string(),
            });
        }
        if !output.is_success() && !command.tolerates_failure() {
            return Err(SshError::CommandFailed {
                target,
                command: command.to_shell(),
                exit_code: output.exit_code,
                stderr: output.stderr_string(),
            });
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile() -> ConnectionProfile {
        ConnectionProfile::parse("root@nas.lan:2222")
            .unwrap()
            .with_identity_file(Some(PathBuf::from("/keys/unlock")))
    }

    #[test]
    fn test_to_shell_quotes_arguments() {
        let command = RemoteCommand::new(["sh", "-c", "cat > '/tmp/a b'"])
            .sudo()
            .env("GPG_TTY", "/dev/pts/1");
        assert_eq!(
            command.to_shell(),
            r#"sudo env GPG_TTY=/dev/pts/1 sh -c 'cat > '\''/tmp/a b'\'''"#
        );
    }

    #[test]
    fn test_ssh_command_for_pre_boot() {
        let context = SecureShellContext::new(&profile())
            .with_host_key_policy(HostKeyPolicy::Ignore)
            .with_connect_timeout(Duration::from_secs(10))
            .with_control_directory(Path::new("/tmp/ctl"))
            .with_proxy("jump");
        let argv = context.ssh_command(Some(&RemoteCommand::new(["test", "-e", "/"])));
        assert_eq!(
            argv,
            vec![
                "ssh",
                "-o",
                "BatchMode=yes",
                "-l",
                "root",
                "-p",
                "2222",
                "-i",
                "/keys/unlock",
                "-o",
                "StrictHostKeyChecking=no",
                "-o",
                "UserKnownHostsFile=/dev/null",
                "-o",
                "ConnectTimeout=10",
                "-o",
                "ControlMaster=auto",
                "-o",
                "ControlPersist=60",
                "-o",
                "ControlPath=/tmp/ctl/%r@%h:%p",
                "-o",
                "ProxyCommand=ssh jump -W nas.lan:2222",
                "nas.lan",
                "test -e /",
            ]
        );
    }

    #[test]
    fn test_ssh_command_tty_and_known_hosts() {
        let context = SecureShellContext::alias("server")
            .with_host_key_policy(HostKeyPolicy::KnownHostsFile(PathBuf::from("/kh")));
        let argv = context.ssh_command(Some(&RemoteCommand::new(["/scripts/local-top/cryptroot"]).tty()));
        assert_eq!(
            argv,
            vec![
                "ssh",
                "-t",
                "-o",
                "UserKnownHostsFile=/kh",
                "server",
                "/scripts/local-top/cryptroot",
            ]
        );
        assert_eq!(context.describe(), "server");
    }

    #[test]
    fn test_connect_timeout_rounds_to_whole_seconds() {
        let context = SecureShellContext::alias("server").with_connect_timeout(Duration::from_millis(200));
        let argv = context.ssh_command(Some(&RemoteCommand::new(["true"])));
        assert_eq!(argv, vec!["ssh", "-o", "BatchMode=yes", "-o", "ConnectTimeout=1", "server", "true"]);
    }

    #[test]
    fn test_command_output_helpers() {
        let output = CommandOutput {
            stdout: b"up\n".to_vec(),
            stderr: Vec::new(),
            exit_code: 0,
        };
        assert!(output.is_success());
        assert_eq!(output.stdout_string(), "up\n");
    }

    #[tokio::test]
    async fn test_local_context_feeds_input_and_reports_failure() {
        let context = LocalContext;
        let output = context
            .execute(RemoteCommand::new(["cat"]).input("correct-horse"))
            .await
            .unwrap();
        assert_eq!(output.stdout, b"correct-horse");

        assert!(!context.test(&["false"]).await.unwrap());
        let err = context
            .execute(RemoteCommand::new(["false"]))
            .await
            .unwrap_err();
        assert!(matches!(err, SshError::CommandFailed { .. }));
    }
}
