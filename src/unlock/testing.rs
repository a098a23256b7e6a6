// 测试用的内存实现：远程主机、探测器、操作员

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::models::ServerFingerprint;
use crate::ssh::{CommandOutput, ConnectionProfile, ExecutionContext, RemoteCommand, ServerScanner, SshError};

use super::error::UnlockError;
use super::prompt::OperatorPrompt;

pub fn keys(items: &[&str]) -> BTreeSet<String> {
    items.iter().map(|s| s.to_string()).collect()
}

pub fn fingerprint(banner: &str, host_keys: &[&str]) -> ServerFingerprint {
    ServerFingerprint::new(banner, keys(host_keys))
}

/// 被执行过的命令
#[derive(Clone, Debug)]
pub struct Recorded {
    pub argv: Vec<String>,
    pub tty: bool,
    pub input: Option<Vec<u8>>,
}

impl Recorded {
    pub fn line(&self) -> String {
        self.argv.join(" ")
    }
}

#[derive(Default)]
struct RemoteState {
    pipes: BTreeSet<String>,
    files: BTreeMap<String, String>,
    pipe_data: BTreeMap<String, Vec<u8>>,
    outputs: BTreeMap<String, String>,
    failing: BTreeSet<String>,
    disconnecting: BTreeSet<String>,
    unreachable: bool,
    log: Vec<Recorded>,
}

/// 内存中的远程主机
#[derive(Default)]
pub struct FakeRemote {
    state: Mutex<RemoteState>,
}

impl FakeRemote {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pipe(self, path: &str) -> Self {
        self.state.lock().unwrap().pipes.insert(path.to_string());
        self
    }

    pub fn with_file(self, path: &str, contents: &str) -> Self {
        self.state
            .lock()
            .unwrap()
            .files
            .insert(path.to_string(), contents.to_string());
        self
    }

    /// 命令（按空格连接的完整命令行）的标准输出
    pub fn with_output(self, line: &str, stdout: &str) -> Self {
        self.state
            .lock()
            .unwrap()
            .outputs
            .insert(line.to_string(), stdout.to_string());
        self
    }

    /// 该程序以退出码 1 结束
    pub fn with_failure(self, program: &str) -> Self {
        self.state.lock().unwrap().failing.insert(program.to_string());
        self
    }

    /// 该程序执行时连接断开
    pub fn with_disconnect(self, program: &str) -> Self {
        self.state
            .lock()
            .unwrap()
            .disconnecting
            .insert(program.to_string());
        self
    }

    pub fn unreachable(self) -> Self {
        self.state.lock().unwrap().unreachable = true;
        self
    }

    pub fn commands(&self) -> Vec<Recorded> {
        self.state.lock().unwrap().log.clone()
    }

    pub fn lines(&self) -> Vec<String> {
        self.commands().iter().map(Recorded::line).collect()
    }

    /// 是否执行过以该程序开头的命令
    pub fn ran(&self, program: &str) -> bool {
        self.commands()
            .iter()
            .any(|c| c.argv.first().map(String::as_str) == Some(program))
    }

    pub fn file(&self, path: &str) -> Option<String> {
        self.state.lock().unwrap().files.get(path).cloned()
    }

    pub fn pipe_data(&self, path: &str) -> Option<Vec<u8>> {
        self.state.lock().unwrap().pipe_data.get(path).cloned()
    }

    fn respond(state: &mut RemoteState, command: &RemoteCommand) -> (i32, String) {
        let argv: Vec<&str> = command.argv().iter().map(String::as_str).collect();
        if let Some(stdout) = state.outputs.get(&argv.join(" ")) {
            return (0, stdout.clone());
        }
        if argv.first().map_or(false, |p| state.failing.contains(*p)) {
            return (1, String::new());
        }
        match argv.as_slice() {
            ["test", "-p", path] => (i32::from(!state.pipes.contains(*path)), String::new()),
            ["test", "-f", path] => (i32::from(!state.files.contains_key(*path)), String::new()),
            ["cat", path] => match state.files.get(*path) {
                Some(contents) => (0, contents.clone()),
                None => (1, String::new()),
            },
            ["sh", "-c", script] if script.starts_with("cat > ") => {
                let path = script.trim_start_matches("cat > ").trim_matches('\'').to_string();
                let data = command.input_bytes().unwrap_or_default().to_vec();
                if state.pipes.contains(&path) {
                    state.pipe_data.insert(path, data);
                } else {
                    state
                        .files
                        .insert(path, String::from_utf8_lossy(&data).into_owned());
                }
                (0, String::new())
            }
            _ => (0, String::new()),
        }
    }
}

#[async_trait]
impl ExecutionContext for FakeRemote {
    fn describe(&self) -> String {
        "fake remote".to_string()
    }

    async fn execute(&self, command: RemoteCommand) -> Result<CommandOutput, SshError> {
        let mut state = self.state.lock().unwrap();
        state.log.push(Recorded {
            argv: command.argv().to_vec(),
            tty: command.is_tty(),
            input: command.input_bytes().map(<[u8]>::to_vec),
        });
        let program = command.argv().first().cloned().unwrap_or_default();
        if state.unreachable || state.disconnecting.contains(&program) {
            return Err(SshError::ConnectFailed {
                target: "fake remote".into(),
                stderr: "Connection closed by remote host".into(),
            });
        }
        let (exit_code, stdout) = Self::respond(&mut state, &command);
        if exit_code != 0 && !command.tolerates_failure() {
            return Err(SshError::CommandFailed {
                target: "fake remote".into(),
                command: command.argv().join(" "),
                exit_code,
                stderr: String::new(),
            });
        }
        Ok(CommandOutput {
            stdout: stdout.into_bytes(),
            stderr: Vec::new(),
            exit_code,
        })
    }
}

/// 依次返回预设指纹的探测器；预设用完后一直返回最后一个
#[derive(Default)]
pub struct ScriptedScanner {
    responses: Mutex<VecDeque<ServerFingerprint>>,
    last: Mutex<ServerFingerprint>,
    calls: AtomicUsize,
}

impl ScriptedScanner {
    pub fn new(responses: Vec<ServerFingerprint>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ServerScanner for ScriptedScanner {
    async fn scan(&self, _profile: &ConnectionProfile) -> ServerFingerprint {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut last = self.last.lock().unwrap();
        if let Some(next) = self.responses.lock().unwrap().pop_front() {
            *last = next;
        }
        last.clone()
    }
}

/// 固定回答的操作员
pub struct ScriptedPrompt {
    answer: bool,
    questions: Mutex<Vec<String>>,
}

impl ScriptedPrompt {
    pub fn answering(answer: bool) -> Self {
        Self {
            answer,
            questions: Mutex::new(Vec::new()),
        }
    }

    pub fn questions(&self) -> Vec<String> {
        self.questions.lock().unwrap().clone()
    }
}

#[async_trait]
impl OperatorPrompt for ScriptedPrompt {
    async fn confirm(&self, question: &str) -> Result<bool, UnlockError> {
        self.questions.lock().unwrap().push(question.to_string());
        Ok(self.answer)
    }
}
