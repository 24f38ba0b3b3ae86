use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Compile/load pipeline status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    Idle,
    Building,
    Importing,
    Running,
    Error,
}

/// Authoring state of a single unit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitState {
    Checking,
    Authoring,
    Ready,
    Error,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasoningStatus {
    #[default]
    Idle,
    Reasoning,
    Done,
    Error,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MutationOutcome {
    Swap,
    Remount,
    CrashRecovery,
    Rollback,
}

/// Debounce class for dependency-driven reasoning.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Latency {
    Immediate,
    #[default]
    Normal,
    Background,
}

impl Latency {
    /// Compiled default delays; settings may override them.
    pub fn default_delay(self) -> Duration {
        match self {
            Self::Immediate => Duration::ZERO,
            Self::Normal => Duration::from_millis(300),
            Self::Background => Duration::from_millis(1500),
        }
    }
}

macro_rules! display_as_snake {
    ($name:ident { $($variant:ident => $text:expr),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

display_as_snake!(PipelineStatus {
    Idle => "idle",
    Building => "building",
    Importing => "importing",
    Running => "running",
    Error => "error",
});

display_as_snake!(UnitState {
    Checking => "checking",
    Authoring => "authoring",
    Ready => "ready",
    Error => "error",
});

display_as_snake!(ReasoningStatus {
    Idle => "idle",
    Reasoning => "reasoning",
    Done => "done",
    Error => "error",
});

display_as_snake!(MutationOutcome {
    Swap => "swap",
    Remount => "remount",
    CrashRecovery => "crash-recovery",
    Rollback => "rollback",
});
