//! CLI argument and command definitions.

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use ward_core::{Config, InspectorMode, RiskLevel, RuleDecision};
use ward_sandbox::PermissionMode;

#[derive(Parser)]
#[command(name = "ward", version, about = "Permission and sandbox policy engine for agent tool calls")]
pub struct Cli {
    /// Config file (defaults to ~/.ward/config.json).
    #[arg(long, global = true, env = "WARD_CONFIG")]
    pub config: Option<PathBuf>,

    /// Base inspector mode, overriding the config file.
    #[arg(long, global = true, value_enum)]
    pub mode: Option<ModeArg>,

    /// Session permission mode, overriding the config file.
    #[arg(long, global = true, value_enum)]
    pub permission_mode: Option<PermissionModeArg>,

    /// Run shell commands inside the sandbox.
    #[arg(long, global = true)]
    pub sandbox: bool,

    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Evaluate a single tool call and print the verdict.
    Check {
        /// Tool name.
        tool: String,

        /// Tool arguments as a JSON object.
        #[arg(default_value = "{}")]
        args: String,

        /// Print the full response as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Manage persisted permission rules.
    Rules {
        #[command(subcommand)]
        action: RulesAction,
    },

    /// Load an execution plan from a JSON file and run it.
    Plan {
        /// Path to the plan file.
        file: PathBuf,

        /// Approve the plan without prompting.
        #[arg(short = 'y', long)]
        yes: bool,

        /// Run independent steps concurrently.
        #[arg(long)]
        parallel: bool,

        /// Print the finished plan as JSON.
        #[arg(long)]
        json: bool,
    },

    /// List registered tools, or show one tool's details.
    Tools {
        /// Tool to describe.
        name: Option<String>,
    },

    /// Inspect or initialize the config file.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
pub enum RulesAction {
    /// List rules in evaluation order.
    List,
    /// Add a rule (replaces any rule with the same pattern).
    Add {
        /// Tool name pattern (`*` and `?` wildcards).
        pattern: String,

        #[arg(value_enum)]
        decision: DecisionArg,

        /// Risk tier reported when the rule matches.
        #[arg(long, value_enum)]
        risk: Option<RiskArg>,

        /// Free-form note.
        #[arg(long, default_value = "")]
        note: String,
    },
    /// Remove the rule with this exact pattern.
    Remove { pattern: String },
    /// Drop expired rules.
    Prune,
}

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Print the effective config.
    Show,
    /// Write the default config if none exists.
    Init {
        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ModeArg {
    Auto,
    Smart,
    Ask,
}

impl From<ModeArg> for InspectorMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Auto => InspectorMode::AutoApprove,
            ModeArg::Smart => InspectorMode::SmartApprove,
            ModeArg::Ask => InspectorMode::AlwaysAsk,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum PermissionModeArg {
    Default,
    AcceptEdits,
    Bypass,
    Plan,
}

impl From<PermissionModeArg> for PermissionMode {
    fn from(mode: PermissionModeArg) -> Self {
        match mode {
            PermissionModeArg::Default => PermissionMode::Default,
            PermissionModeArg::AcceptEdits => PermissionMode::AcceptEdits,
            PermissionModeArg::Bypass => PermissionMode::Bypass,
            PermissionModeArg::Plan => PermissionMode::Plan,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DecisionArg {
    Allow,
    Deny,
    AllowAlways,
    DenyAlways,
}

impl From<DecisionArg> for RuleDecision {
    fn from(decision: DecisionArg) -> Self {
        match decision {
            DecisionArg::Allow => RuleDecision::Allow,
            DecisionArg::Deny => RuleDecision::Deny,
            DecisionArg::AllowAlways => RuleDecision::AllowAlways,
            DecisionArg::DenyAlways => RuleDecision::DenyAlways,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum RiskArg {
    Low,
    Medium,
    High,
}

impl From<RiskArg> for RiskLevel {
    fn from(risk: RiskArg) -> Self {
        match risk {
            RiskArg::Low => RiskLevel::Low,
            RiskArg::Medium => RiskLevel::Medium,
            RiskArg::High => RiskLevel::High,
        }
    }
}

impl Cli {
    /// Apply command-line overrides on top of the loaded config.
    pub fn apply_overrides(&self, config: &mut Config) {
        if let Some(mode) = self.mode {
            config.mode = mode.into();
        }
        if let Some(mode) = self.permission_mode {
            config.sandbox.permission_mode = mode.into();
        }
        if self.sandbox {
            config.sandbox.settings.enabled = true;
        }
    }
}
