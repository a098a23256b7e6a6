// 解锁流程状态

use super::error::FailureKind;

/// 解锁流程状态
/// idle → awaiting-pre-boot → delivering-secret → awaiting-post-boot → done
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnlockStage {
    /// 尚未开始
    Idle,
    /// 等待预启动环境
    AwaitingPreBoot,
    /// 投递口令
    DeliveringSecret,
    /// 等待系统启动完成
    AwaitingPostBoot,
    /// 完成
    Done,
    /// 失败（终止状态）
    Failed(FailureKind),
}

impl UnlockStage {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::AwaitingPreBoot => "awaiting-pre-boot",
            Self::DeliveringSecret => "delivering-secret",
            Self::AwaitingPostBoot => "awaiting-post-boot",
            Self::Done => "done",
            Self::Failed(_) => "failed",
        }
    }

    /// 正常流程中的下一个状态
    pub fn next(&self) -> Option<Self> {
        match self {
            Self::Idle => Some(Self::AwaitingPreBoot),
            Self::AwaitingPreBoot => Some(Self::DeliveringSecret),
            Self::DeliveringSecret => Some(Self::AwaitingPostBoot),
            Self::AwaitingPostBoot => Some(Self::Done),
            Self::Done | Self::Failed(_) => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_order() {
        let mut stage = UnlockStage::Idle;
        let mut labels = vec![stage.label()];
        while let Some(next) = stage.next() {
            stage = next;
            labels.push(stage.label());
        }
        assert_eq!(
            labels,
            vec![
                "idle",
                "awaiting-pre-boot",
                "delivering-secret",
                "awaiting-post-boot",
                "done"
            ]
        );
        assert!(stage.is_terminal());
        assert!(UnlockStage::Failed(FailureKind::BootTimeout).is_terminal());
        assert!(!UnlockStage::DeliveringSecret.is_terminal());
    }
}
