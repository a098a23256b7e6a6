// 同时监视多台主机
//
// 每个配置节一个子进程（`<exe> --watch <section>`），
// 子进程之间互不影响，一个退出或卡住不会波及其它。

use std::path::Path;
use std::process::{ExitStatus, Stdio};

use anyhow::{bail, Context, Result};
use futures::future::join_all;
use tokio::process::{Child, Command};
use tracing::{error, info, warn};

/// 子进程的命令行参数
pub fn worker_arguments(section: &str, verbose: u8, quiet: u8) -> Vec<String> {
    let mut arguments = vec!["--watch".to_string()];
    arguments.extend((0..verbose).map(|_| "--verbose".to_string()));
    arguments.extend((0..quiet).map(|_| "--quiet".to_string()));
    arguments.push(section.to_string());
    arguments
}

fn spawn_worker(program: &Path, section: &str, verbose: u8, quiet: u8) -> Result<Child> {
    Command::new(program)
        .args(worker_arguments(section, verbose, quiet))
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("无法启动 '{}' 的监视进程", section))
}

async fn wait_worker(section: String, mut child: Child) -> Option<ExitStatus> {
    match child.wait().await {
        Ok(status) => {
            warn!("[Watch] Worker for '{}' exited with {}", section, status);
            Some(status)
        }
        Err(e) => {
            error!("[Watch] Failed to wait for worker of '{}': {}", section, e);
            None
        }
    }
}

/// 启动并等待所有子进程；启动失败的配置节只记录日志，不影响已启动的进程
async fn supervise<F>(sections: &[String], mut spawn: F) -> Result<Vec<(String, Option<ExitStatus>)>>
where
    F: FnMut(&str) -> Result<Child>,
{
    let mut names = Vec::with_capacity(sections.len());
    let mut workers = Vec::with_capacity(sections.len());
    for section in sections {
        match spawn(section) {
            Ok(child) => {
                info!(
                    "[Watch] Started worker {} for '{}'",
                    child.id().unwrap_or_default(),
                    section
                );
                names.push(section.clone());
                workers.push(wait_worker(section.clone(), child));
            }
            Err(e) => error!("[Watch] {:#}", e),
        }
    }
    if workers.is_empty() {
        bail!("没有任何监视进程启动成功");
    }
    Ok(names.into_iter().zip(join_all(workers).await).collect())
}

/// 为每个配置节启动一个监视进程，并等待全部结束
pub async fn watch_all_systems(
    program: &Path,
    sections: &[String],
    verbose: u8,
    quiet: u8,
) -> Result<()> {
    if sections.is_empty() {
        warn!("[Watch] No configuration sections found, nothing to watch.");
        return Ok(());
    }
    supervise(sections, |section| spawn_worker(program, section, verbose, quiet)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_arguments() {
        assert_eq!(worker_arguments("nas", 0, 0), vec!["--watch", "nas"]);
        assert_eq!(
            worker_arguments("router", 2, 1),
            vec!["--watch", "--verbose", "--verbose", "--quiet", "router"]
        );
    }

    #[tokio::test]
    async fn test_workers_are_independent() {
        // 用 true 代替真实程序：两个子进程各自退出，互不影响
        let sections = vec!["nas".to_string(), "router".to_string()];
        let started = std::time::Instant::now();
        watch_all_systems(Path::new("true"), &sections, 0, 0)
            .await
            .unwrap();
        assert!(started.elapsed() < std::time::Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_failed_spawn_leaves_other_workers_running() {
        let sections = vec!["nas".to_string(), "router".to_string()];
        let finished = supervise(&sections, |section| {
            if section == "router" {
                bail!("cannot start '{}'", section);
            }
            Ok(Command::new("sh")
                .args(["-c", "sleep 1; exit 7"])
                .kill_on_drop(true)
                .spawn()?)
        })
        .await
        .unwrap();

        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].0, "nas");
        // 被杀死的进程没有退出码
        assert_eq!(finished[0].1.and_then(|status| status.code()), Some(7));
    }

    #[tokio::test]
    async fn test_missing_program_is_an_error() {
        let sections = vec!["nas".to_string()];
        let result =
            watch_all_systems(Path::new("/nonexistent/unlock-remote-system"), &sections, 0, 0).await;
        assert!(result.is_err());
    }
}
