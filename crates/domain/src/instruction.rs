use std::fmt;

use serde::{Deserialize, Serialize};

/// 作业执行结束后，存储层需要对触发器做的处理
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CompletedExecutionInstruction {
    /// 按调度规则继续
    Noop,
    /// 立即重新执行（在执行外壳内部处理，不回到存储层）
    ReExecuteJob,
    DeleteTrigger,
    SetTriggerComplete,
    SetTriggerError,
    SetAllJobTriggersComplete,
    SetAllJobTriggersError,
}

impl CompletedExecutionInstruction {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompletedExecutionInstruction::Noop => "NOOP",
            CompletedExecutionInstruction::ReExecuteJob => "RE_EXECUTE_JOB",
            CompletedExecutionInstruction::DeleteTrigger => "DELETE_TRIGGER",
            CompletedExecutionInstruction::SetTriggerComplete => "SET_TRIGGER_COMPLETE",
            CompletedExecutionInstruction::SetTriggerError => "SET_TRIGGER_ERROR",
            CompletedExecutionInstruction::SetAllJobTriggersComplete => {
                "SET_ALL_JOB_TRIGGERS_COMPLETE"
            }
            CompletedExecutionInstruction::SetAllJobTriggersError => "SET_ALL_JOB_TRIGGERS_ERROR",
        }
    }

    /// 是否作用于作业的全部触发器
    pub fn affects_all_job_triggers(&self) -> bool {
        matches!(
            self,
            CompletedExecutionInstruction::SetAllJobTriggersComplete
                | CompletedExecutionInstruction::SetAllJobTriggersError
        )
    }
}

impl fmt::Display for CompletedExecutionInstruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
