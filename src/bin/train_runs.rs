//! train_runs - Run a matrix of PaddleDetection trainings one after another.
//!
//! Each run writes `output/<name>/train.log`, a pid file while it is alive
//! and a `DONE` flag on success. Finished runs are skipped, so the command
//! can simply be started again after an interruption. Results are appended
//! to the matrix summary CSV.

use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;

use mousedet_ops::config::OpsConfig;
use mousedet_ops::launcher::{
    read_summary, render_summary_table, PlanStatus, RunMatrix, RunOutcome, Supervisor,
};

#[derive(Parser, Debug)]
#[command(name = "train_runs", about = "Sequential multi-run training launcher")]
struct Args {
    /// Built-in matrix: yolov3 or lightweight
    #[arg(long, default_value = "yolov3", conflicts_with = "plan")]
    matrix: String,

    /// TOML run matrix instead of a built-in one
    #[arg(long, value_name = "PATH")]
    plan: Option<PathBuf>,

    /// Start from this run id; earlier runs are skipped
    #[arg(long, value_name = "ID")]
    from: Option<String>,

    /// Run tools/eval.py after each successful training run
    #[arg(long)]
    post_eval: bool,

    /// Print the plan and exit
    #[arg(long)]
    dry_run: bool,

    /// Print the summary table and exit
    #[arg(long)]
    summary: bool,

    /// PaddleDetection checkout (overrides MOUSEDET_PADDLE_ROOT)
    #[arg(long, value_name = "DIR")]
    paddle_root: Option<PathBuf>,

    /// Python interpreter (overrides MOUSEDET_PYTHON)
    #[arg(long)]
    python: Option<String>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = OpsConfig::load()?;
    if let Some(root) = args.paddle_root {
        config.paddle_root = root;
    }
    if let Some(python) = args.python {
        config.python = python;
    }

    let matrix = match &args.plan {
        Some(path) => RunMatrix::from_toml_file(path)?,
        None => RunMatrix::builtin(&args.matrix)
            .ok_or_else(|| anyhow!("unknown matrix '{}' (yolov3|lightweight)", args.matrix))?,
    };
    let supervisor =
        Supervisor::new(config.workspace(), config.python.clone()).with_post_eval(args.post_eval);
    let summary_path = supervisor.summary_path(&matrix);

    if args.summary {
        print_summary(&summary_path)?;
        return Ok(());
    }

    println!("{}", "=".repeat(60));
    println!("  {}", matrix.title);
    println!("  workspace: {}", supervisor.workspace().root().display());
    println!("  summary:   {}", summary_path.display());
    println!("{}", "=".repeat(60));
    for planned in supervisor.plan(&matrix, args.from.as_deref())? {
        let status = match planned.status {
            PlanStatus::SkippedByFrom => "skip",
            PlanStatus::Done => "done",
            PlanStatus::Pending => "todo",
        };
        println!("  [{status}] {:<4} {}", planned.id, planned.desc);
    }
    if args.dry_run {
        return Ok(());
    }
    println!();

    let outcomes = supervisor.run_matrix(&matrix, args.from.as_deref())?;
    println!();
    print_summary(&summary_path)?;

    let failed: Vec<&str> = outcomes
        .iter()
        .filter(|(_, outcome)| outcome.is_failure())
        .map(|(id, _)| id.as_str())
        .collect();
    let completed = outcomes
        .iter()
        .filter(|(_, outcome)| matches!(outcome, RunOutcome::Completed(_)))
        .count();
    println!("{completed} run(s) completed this session");
    if !failed.is_empty() {
        return Err(anyhow!("run {} failed", failed.join(", ")));
    }
    Ok(())
}

fn print_summary(path: &std::path::Path) -> Result<()> {
    if !path.exists() {
        println!("no results yet ({} missing)", path.display());
        return Ok(());
    }
    let rows = read_summary(path)?;
    print!("{}", render_summary_table(&rows));
    Ok(())
}
