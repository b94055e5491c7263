use clap::Parser;
use std::path::PathBuf;

/// Secure shell-replacement runtime for AI-driven code execution.
#[derive(Debug, Parser)]
#[command(name = "desh", version)]
pub struct Cli {
    #[command(subcommand)]
    pub subcommand: Subcommand,
}

#[derive(Debug, clap::Subcommand)]
pub enum Subcommand {
    /// Run a code snippet under the sandbox.
    #[clap(visible_alias = "r")]
    Run(RunArgs),

    /// Answer a deny-with-retry prompt and re-drive the blocked script.
    Retry(RetryArgs),

    /// Run a task declared in the project config.
    #[clap(visible_alias = "t")]
    Task(TaskArgs),
}

#[derive(Debug, Parser)]
pub struct RunArgs {
    /// Evaluate the given code instead of reading a file.
    #[arg(long = "eval", short = 'e', value_name = "CODE")]
    pub eval: Option<String>,

    /// Script file to run; `-` (or nothing) reads from stdin.
    pub file: Option<PathBuf>,

    /// Working directory for the session.
    #[arg(long = "cwd", short = 'C', value_name = "DIR")]
    pub cwd: Option<PathBuf>,

    /// Project directory (location of safesh.toml).
    #[arg(long = "project", short = 'p', value_name = "DIR")]
    pub project_dir: Option<PathBuf>,

    /// Preset to apply on top of the config files.
    #[arg(long = "preset", value_enum)]
    pub preset: Option<PresetArg>,
}

#[derive(Debug, Parser)]
pub struct RetryArgs {
    /// Script id from the BLOCKED prompt.
    #[arg(long = "id", value_name = "SCRIPT_ID")]
    pub id: String,

    /// The user's choice, 1-4.
    #[arg(long = "choice", value_name = "1-4")]
    pub choice: u8,

    /// Working directory for the session.
    #[arg(long = "cwd", short = 'C', value_name = "DIR")]
    pub cwd: Option<PathBuf>,

    /// Project directory (location of safesh.toml).
    #[arg(long = "project", short = 'p', value_name = "DIR")]
    pub project_dir: Option<PathBuf>,
}

#[derive(Debug, Parser)]
pub struct TaskArgs {
    /// Task name from the `[tasks]` config table.
    pub name: String,

    /// Working directory for the session.
    #[arg(long = "cwd", short = 'C', value_name = "DIR")]
    pub cwd: Option<PathBuf>,

    /// Project directory (location of safesh.toml).
    #[arg(long = "project", short = 'p', value_name = "DIR")]
    pub project_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
#[value(rename_all = "kebab-case")]
pub enum PresetArg {
    Strict,
    Standard,
    Permissive,
}

impl From<PresetArg> for safesh_core::config_types::Preset {
    fn from(value: PresetArg) -> Self {
        match value {
            PresetArg::Strict => Self::Strict,
            PresetArg::Standard => Self::Standard,
            PresetArg::Permissive => Self::Permissive,
        }
    }
}
