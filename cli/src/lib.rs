mod cli;

use std::io::IsTerminal;
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;

use anyhow::Context;
use anyhow::bail;
pub use cli::Cli;
pub use cli::PresetArg;
pub use cli::RetryArgs;
pub use cli::RunArgs;
pub use cli::Subcommand;
pub use cli::TaskArgs;
use safesh_core::Command;
use safesh_core::PolicyStore;
use safesh_core::Session;
use safesh_core::command_policy;
use safesh_core::command_policy::CommandDecision;
use safesh_core::command_policy::DenyReason;
use safesh_core::config_types::ConfigToml;
use safesh_core::executor::Executor;
use safesh_core::executor::RunResult;
use safesh_core::retry::DenyRetryProtocol;
use safesh_core::retry::RetryOutcome;
use safesh_protocol::RetryChoice;
use tracing_subscriber::EnvFilter;

pub async fn run_main(cli: Cli) -> anyhow::Result<i32> {
    let default_level = "error";
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .or_else(|_| EnvFilter::try_new(default_level))
                .unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .try_init();

    match cli.subcommand {
        Subcommand::Run(args) => run_snippet(args).await,
        Subcommand::Retry(args) => run_retry(args).await,
        Subcommand::Task(args) => run_task(args).await,
    }
}

fn open_session(
    cwd: Option<PathBuf>,
    project_dir: Option<PathBuf>,
    preset: Option<PresetArg>,
) -> anyhow::Result<Arc<Mutex<Session>>> {
    let cwd = match cwd {
        Some(dir) => dir.canonicalize().context("resolving --cwd")?,
        None => std::env::current_dir()?,
    };
    let session_layer = preset.map(|preset| ConfigToml {
        preset: Some(preset.into()),
        ..Default::default()
    });
    let project_dir = project_dir.or_else(|| Some(cwd.clone()));
    let policy = PolicyStore::load(&cwd, project_dir.as_deref(), session_layer)
        .context("loading policy")?;
    tracing::debug!(
        "session policy: preset {:?}, {} allowed commands",
        policy.preset,
        policy.allowed_commands.len()
    );
    Ok(Arc::new(Mutex::new(Session::new(Arc::new(policy), cwd))))
}

async fn run_snippet(args: RunArgs) -> anyhow::Result<i32> {
    let RunArgs {
        eval,
        file,
        cwd,
        project_dir,
        preset,
    } = args;

    let code = match (eval, file) {
        (Some(code), _) => code,
        (None, Some(path)) if path.as_os_str() != "-" => std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?,
        (None, maybe_dash) => {
            if std::io::stdin().is_terminal() && maybe_dash.is_none() {
                bail!("no code provided; pass a file, `-e CODE`, or pipe code on stdin");
            }
            let mut buffer = String::new();
            std::io::stdin().read_to_string(&mut buffer)?;
            if buffer.trim().is_empty() {
                bail!("no code provided on stdin");
            }
            buffer
        }
    };

    let session = open_session(cwd, project_dir, preset)?;
    let executor = Executor::default();
    let result = executor.run(&session, &code).await?;
    render_result(&result);
    Ok(result.exit_code)
}

async fn run_retry(args: RetryArgs) -> anyhow::Result<i32> {
    let RetryArgs {
        id,
        choice,
        cwd,
        project_dir,
    } = args;
    let Some(choice) = RetryChoice::from_prompt_digit(choice) else {
        bail!("--choice must be 1-4");
    };

    let session = open_session(cwd, project_dir, None)?;
    let executor = Executor::default();
    match DenyRetryProtocol::retry(&executor, &session, &id, choice).await? {
        RetryOutcome::Denied { commands } => {
            eprintln!("denied: {}", commands.join(", "));
            Ok(1)
        }
        RetryOutcome::Reran(result) => {
            render_result(&result);
            Ok(result.exit_code)
        }
    }
}

async fn run_task(args: TaskArgs) -> anyhow::Result<i32> {
    let TaskArgs {
        name,
        cwd,
        project_dir,
    } = args;
    let session = open_session(cwd, project_dir, None)?;
    let (ctx, task_cmd) = {
        let session = session.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let policy = session.policy();
        let Some(task) = policy.tasks.get(&name) else {
            bail!("unknown task: {name}");
        };
        (session.context(), task.cmd.clone())
    };

    let Some(argv) = shlex::split(&task_cmd) else {
        bail!("task {name} has an unparseable command: {task_cmd}");
    };
    let Some((program, task_args)) = argv.split_first() else {
        bail!("task {name} has an empty command");
    };

    // Surface a precise denial before the runner would.
    match command_policy::check(program, &ctx.policy, &ctx.cwd) {
        CommandDecision::Denied(DenyReason::NotAllowed(evaluated)) => {
            bail!("task {name} uses a command not allowed by policy: {evaluated}");
        }
        CommandDecision::Denied(DenyReason::NotFound(reference)) => {
            bail!("task {name} uses a command that does not exist: {reference}");
        }
        _ => {}
    }

    let result = Command::new(program.as_str())
        .args(task_args.iter().cloned())
        .exec(&ctx)
        .await?;
    print!("{}", result.stdout);
    eprint!("{}", result.stderr);
    Ok(result.exit_code)
}

fn render_result(result: &RunResult) {
    print!("{}", result.stdout);
    eprint!("{}", result.stderr);
    if let Some(deny_retry) = &result.deny_retry {
        eprint!("{}", deny_retry.render_prompt());
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use clap::Parser;
    use pretty_assertions::assert_eq;

    #[test]
    fn retry_invocation_matches_the_prompt_wording() {
        // The BLOCKED prompt tells the agent to run
        // `desh retry --id=<id> --choice=<n>`; that exact spelling must
        // parse.
        let cli = Cli::parse_from(["desh", "retry", "--id=script-ab12-7", "--choice=3"]);
        match cli.subcommand {
            Subcommand::Retry(args) => {
                assert_eq!(args.id, "script-ab12-7");
                assert_eq!(args.choice, 3);
            }
            other => panic!("expected retry, got {other:?}"),
        }
    }

    #[test]
    fn run_accepts_eval_and_file_forms() {
        let cli = Cli::parse_from(["desh", "run", "-e", "console.log(1)"]);
        match cli.subcommand {
            Subcommand::Run(args) => assert_eq!(args.eval.as_deref(), Some("console.log(1)")),
            other => panic!("expected run, got {other:?}"),
        }

        let cli = Cli::parse_from(["desh", "run", "script.ts", "--preset", "strict"]);
        match cli.subcommand {
            Subcommand::Run(args) => {
                assert_eq!(args.file, Some(PathBuf::from("script.ts")));
                assert_eq!(args.preset, Some(PresetArg::Strict));
            }
            other => panic!("expected run, got {other:?}"),
        }
    }
}
