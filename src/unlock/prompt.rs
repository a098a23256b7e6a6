// 操作员交互

use async_trait::async_trait;
use dialoguer::Confirm;

use super::error::UnlockError;

/// 向操作员确认是否继续
#[async_trait]
pub trait OperatorPrompt: Send + Sync {
    async fn confirm(&self, question: &str) -> Result<bool, UnlockError>;
}

/// 基于终端的确认提示
#[derive(Clone, Debug, Default)]
pub struct TerminalPrompt;

#[async_trait]
impl OperatorPrompt for TerminalPrompt {
    async fn confirm(&self, question: &str) -> Result<bool, UnlockError> {
        let question = question.to_string();
        let answer = tokio::task::spawn_blocking(move || {
            Confirm::new()
                .with_prompt(question)
                .default(false)
                .interact()
        })
        .await
        .map_err(|e| UnlockError::Other(e.into()))?
        .map_err(|e| UnlockError::Other(e.into()))?;
        Ok(answer)
    }
}
