// reboot-remote-system
// 重启远程主机并等待其重新上线；有同名配置节时自动解锁

use std::io::IsTerminal;
use std::process::ExitCode;

use clap::{ArgAction, Parser};

use unlock_remote_system::cli::{init_logging, parse_arguments, report};
use unlock_remote_system::reboot::{get_post_context, reboot_remote_system};
use unlock_remote_system::services::ConfigLoader;
use unlock_remote_system::unlock::{unlock_remote_system, SessionMode, UnlockError, UnlockSettings};

/// Reboot a remote system and wait for it to come back online.
///
/// If the SSH alias matches a section in the unlock-remote-system
/// configuration, the root disk encryption of the remote system is
/// unlocked after it is rebooted.
#[derive(Parser, Debug)]
#[command(name = "reboot-remote-system", version)]
struct Cli {
    /// SSH alias or configuration section of the remote system
    #[arg(value_name = "SSH_ALIAS")]
    name: String,

    /// Start an interactive shell after the system has finished booting
    #[arg(short = 's', long)]
    shell: bool,

    /// Increase logging verbosity (can be repeated)
    #[arg(short = 'v', long, action = ArgAction::Count)]
    verbose: u8,

    /// Decrease logging verbosity (can be repeated)
    #[arg(short = 'q', long, action = ArgAction::Count)]
    quiet: u8,
}

async fn unlock_section(loader: &ConfigLoader, name: &str) -> Result<(), UnlockError> {
    let settings = UnlockSettings::from_section(name, &loader.get_options(name))?;
    let secret = settings.password.resolve().await?;
    let interactive = std::io::stdin().is_terminal();
    unlock_remote_system(settings, secret, interactive, SessionMode::Unlock).await
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let loader = ConfigLoader::new()?;
    let context = get_post_context(&cli.name, &loader)?;
    let have_config = loader.has_section(&cli.name);
    reboot_remote_system(&context, have_config, || unlock_section(&loader, &cli.name)).await?;
    if cli.shell {
        context.start_interactive_shell().await?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli: Cli = match parse_arguments() {
        Ok(cli) => cli,
        Err(code) => return code,
    };
    init_logging(cli.verbose, cli.quiet);
    report(run(cli).await)
}
