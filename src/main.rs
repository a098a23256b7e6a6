// unlock-remote-system
// 命令行入口

use std::io::IsTerminal;
use std::process::ExitCode;

use anyhow::Context;
use clap::{ArgAction, Parser};
use tracing::info;

use unlock_remote_system::cli::{argument_error, init_logging, parse_arguments, report, EXIT_ARGUMENT_ERROR};
use unlock_remote_system::services::{expand_path, prompt_for_password, ConfigLoader, Secret};
use unlock_remote_system::unlock::settings::{find_local_username, parse_profile};
use unlock_remote_system::unlock::{
    unlock_remote_system, watch_all_systems, PasswordSource, SessionMode, UnlockError,
    UnlockSettings,
};

/// Unlock the root disk encryption of a remote system over SSH.
///
/// PRE_BOOT is an SSH connection profile ([user@]host[:port]) for the
/// pre-boot environment or the name of a configuration section.
/// POST_BOOT defaults to PRE_BOOT with the local username.
#[derive(Parser, Debug)]
#[command(name = "unlock-remote-system", version)]
struct Cli {
    /// Pre-boot environment or configuration section
    #[arg(value_name = "PRE_BOOT")]
    pre_boot: Option<String>,

    /// Post-boot environment
    #[arg(value_name = "POST_BOOT")]
    post_boot: Option<String>,

    /// SSH private key used to connect to the pre-boot environment
    #[arg(short = 'i', long = "identity-file", value_name = "KEY_FILE")]
    identity_file: Option<String>,

    /// Known hosts file used to verify the pre-boot environment
    #[arg(short = 'k', long = "known-hosts", value_name = "HOSTS_FILE")]
    known_hosts: Option<String>,

    /// Get the disk encryption password from `pass`
    #[arg(short = 'p', long = "password", value_name = "NAME")]
    password: Option<String>,

    /// Connect to the remote system through this SSH alias
    #[arg(short = 'r', long = "remote-host", value_name = "SSH_ALIAS")]
    remote_host: Option<String>,

    /// Start an interactive shell after unlocking
    #[arg(short = 's', long)]
    shell: bool,

    /// Keep watching the remote system and unlock it whenever it reboots
    #[arg(short = 'w', long)]
    watch: bool,

    /// With --watch: watch every configured system
    #[arg(short = 'a', long)]
    all: bool,

    /// Increase logging verbosity (can be repeated)
    #[arg(short = 'v', long, action = ArgAction::Count)]
    verbose: u8,

    /// Decrease logging verbosity (can be repeated)
    #[arg(short = 'q', long, action = ArgAction::Count)]
    quiet: u8,
}

impl Cli {
    fn validate(&self) -> Result<(), &'static str> {
        if self.all && !self.watch {
            return Err("--all can only be used together with --watch");
        }
        if self.pre_boot.is_none() && !self.all {
            return Err("the pre-boot environment or a configuration section is required");
        }
        Ok(())
    }

    /// 构建会话设置；命令行选项覆盖配置节
    fn settings(&self, loader: &ConfigLoader, pre_boot: &str) -> Result<UnlockSettings, UnlockError> {
        let mut settings = if self.post_boot.is_none() && loader.has_section(pre_boot) {
            info!("Loading configuration section '{}' ..", pre_boot);
            UnlockSettings::from_section(pre_boot, &loader.get_options(pre_boot))?
        } else {
            let identity_file = self.identity_file.as_deref().map(expand_path);
            let pre = parse_profile(pre_boot)?.with_identity_file(identity_file);
            let post = match &self.post_boot {
                Some(expression) => parse_profile(expression)?,
                None => parse_profile(pre_boot)?.with_username(find_local_username()?),
            };
            UnlockSettings::new(pre, post)
        };
        if let Some(path) = &self.known_hosts {
            settings.known_hosts_file = Some(expand_path(path));
        }
        if let Some(name) = &self.password {
            settings.password = PasswordSource::Store {
                name: name.clone(),
                store: None,
            };
        }
        if let Some(alias) = &self.remote_host {
            settings.ssh_proxy = Some(alias.clone());
        }
        Ok(settings)
    }
}

/// 取得口令；命令行直接给出连接表达式且没有口令来源时提示操作员输入
async fn resolve_secret(settings: &UnlockSettings) -> anyhow::Result<Option<Secret>> {
    if settings.password.is_none() && settings.config_section.is_none() {
        let hostname = settings.pre_boot.hostname().to_string();
        let secret = tokio::task::spawn_blocking(move || prompt_for_password(&hostname))
            .await
            .context("口令输入任务异常结束")??;
        return Ok(Some(secret));
    }
    Ok(settings.password.resolve().await?)
}

async fn run(cli: Cli, settings: UnlockSettings, secret: Option<Secret>) -> anyhow::Result<()> {
    let interactive = std::io::stdin().is_terminal();
    let post_context = settings.post_context();
    let mode = if cli.watch {
        SessionMode::Watch
    } else {
        SessionMode::Unlock
    };
    unlock_remote_system(settings, secret, interactive, mode).await?;
    if cli.shell {
        post_context.start_interactive_shell().await?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli: Cli = match parse_arguments() {
        Ok(cli) => cli,
        Err(code) => return code,
    };
    if let Err(message) = cli.validate() {
        return argument_error::<Cli>(message);
    }
    init_logging(cli.verbose, cli.quiet);

    let loader = match ConfigLoader::new() {
        Ok(loader) => loader,
        Err(e) => return report(Err(e)),
    };

    if cli.watch && cli.all {
        let result = std::env::current_exe()
            .context("无法确定当前程序路径")
            .map(|program| (program, loader.section_names()));
        return report(match result {
            Ok((program, sections)) => {
                watch_all_systems(&program, &sections, cli.verbose, cli.quiet).await
            }
            Err(e) => Err(e),
        });
    }

    let Some(pre_boot) = cli.pre_boot.clone() else {
        return argument_error::<Cli>("the pre-boot environment or a configuration section is required");
    };
    let prepared = match cli.settings(&loader, &pre_boot) {
        Ok(settings) => resolve_secret(&settings).await.map(|secret| (settings, secret)),
        Err(e) => Err(e.into()),
    };
    let (settings, secret) = match prepared {
        Ok(prepared) => prepared,
        Err(e) => {
            tracing::warn!("Failed to parse command line arguments! ({})", e);
            return ExitCode::from(EXIT_ARGUMENT_ERROR);
        }
    };

    report(run(cli, settings, secret).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("unlock-remote-system").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_validate() {
        assert!(parse(&["nas"]).validate().is_ok());
        assert!(parse(&["-w", "-a"]).validate().is_ok());
        assert!(parse(&["-a", "nas"]).validate().is_err());
        assert!(parse(&[]).validate().is_err());
        assert!(Cli::try_parse_from(["unlock-remote-system", "a", "b", "c"]).is_err());
    }

    #[test]
    fn test_section_with_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("unlock-remote-system.toml");
        std::fs::write(&file, "[nas]\npre-boot = \"nas.lan:2222\"\npassword-name = \"hosts/nas\"\n").unwrap();
        let loader = ConfigLoader::from_files(vec![file]).unwrap();

        let cli = parse(&["-r", "gateway", "-k", "/etc/unlock/known_hosts", "nas"]);
        let settings = cli.settings(&loader, "nas").unwrap();
        assert_eq!(settings.config_section.as_deref(), Some("nas"));
        assert_eq!(settings.pre_boot.to_string(), "root@nas.lan:2222");
        assert_eq!(settings.ssh_proxy.as_deref(), Some("gateway"));
        assert!(settings.known_hosts_file.is_some());
        assert!(matches!(&settings.password, PasswordSource::Store { name, .. } if name == "hosts/nas"));
    }

    #[test]
    fn test_expressions_without_section() {
        let loader = ConfigLoader::default();
        let cli = parse(&["-i", "/keys/unlock", "nas.lan:2222", "peter@nas.lan"]);
        let settings = cli.settings(&loader, "nas.lan:2222").unwrap();
        assert!(settings.config_section.is_none());
        assert_eq!(settings.pre_boot.to_string(), "root@nas.lan:2222");
        assert!(settings.pre_boot.identity_file().is_some());
        assert_eq!(settings.post_boot.to_string(), "peter@nas.lan:22");

        let bad = parse(&["nas.lan:ssh"]).settings(&loader, "nas.lan:ssh");
        assert!(matches!(bad, Err(UnlockError::Configuration(_))));
    }
}
