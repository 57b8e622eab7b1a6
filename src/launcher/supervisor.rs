use anyhow::{anyhow, Context, Result};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Instant;

use super::command::{eval_command, train_command, CommandLine};
use super::metrics::{extract_metrics, RunMetrics};
use super::summary::{append_summary, SummaryRow, TIMESTAMP_FORMAT};
use super::{RunMatrix, RunSpec};
use crate::config::Workspace;

pub const DONE_FLAG: &str = "DONE";
pub const TRAIN_LOG: &str = "train.log";
pub const EVAL_LOG: &str = "eval.log";
pub const PID_FILE: &str = "train.pid";

/// What happened to a finished (or skipped) run.
#[derive(Clone, Debug, PartialEq)]
pub struct RunRecord {
    pub metrics: RunMetrics,
    pub duration_h: f64,
    pub exit_code: i32,
}

#[derive(Clone, Debug, PartialEq)]
pub enum RunOutcome {
    /// The run's DONE flag already exists.
    AlreadyDone,
    /// Skipped because it comes before `--from`.
    SkippedByFrom,
    Completed(RunRecord),
    Failed(RunRecord),
}

impl RunOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, RunOutcome::Failed(_))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlanStatus {
    SkippedByFrom,
    Done,
    Pending,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlannedRun {
    pub id: String,
    pub desc: String,
    pub status: PlanStatus,
}

/// Runs training jobs of a matrix one at a time inside a PaddleDetection checkout.
#[derive(Clone, Debug)]
pub struct Supervisor {
    workspace: Workspace,
    python: String,
    post_eval: bool,
}

impl Supervisor {
    pub fn new(workspace: Workspace, python: impl Into<String>) -> Self {
        Self {
            workspace,
            python: python.into(),
            post_eval: false,
        }
    }

    /// Also run `tools/eval.py` after every successful training run.
    pub fn with_post_eval(mut self, enabled: bool) -> Self {
        self.post_eval = enabled;
        self
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    pub fn done_flag(&self, run: &RunSpec) -> PathBuf {
        self.workspace.run_dir(&run.name).join(DONE_FLAG)
    }

    pub fn summary_path(&self, matrix: &RunMatrix) -> PathBuf {
        self.workspace.root().join(&matrix.summary_file)
    }

    /// Verifies the matrix prerequisite and returns its path and line count.
    pub fn check_prerequisite(&self, matrix: &RunMatrix) -> Result<Option<(PathBuf, usize)>> {
        let Some(rel) = &matrix.prerequisite else {
            return Ok(None);
        };
        let path = self.workspace.root().join(rel);
        if !path.exists() {
            return Err(anyhow!(
                "prerequisite {} is missing; prepare the dataset first",
                path.display()
            ));
        }
        let lines = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?
            .lines()
            .count();
        Ok(Some((path, lines)))
    }

    /// Index of the first run to execute; runs before `from` are skipped.
    fn start_index(matrix: &RunMatrix, from: Option<&str>) -> Result<usize> {
        match from {
            None => Ok(0),
            Some(id) => matrix.position(id).ok_or_else(|| {
                anyhow!(
                    "unknown run id '{}'; expected one of {}",
                    id,
                    matrix.ids().join(", ")
                )
            }),
        }
    }

    pub fn plan(&self, matrix: &RunMatrix, from: Option<&str>) -> Result<Vec<PlannedRun>> {
        let start = Self::start_index(matrix, from)?;
        Ok(matrix
            .runs
            .iter()
            .enumerate()
            .map(|(idx, run)| PlannedRun {
                id: run.id.clone(),
                desc: run.desc.clone(),
                status: if idx < start {
                    PlanStatus::SkippedByFrom
                } else if self.done_flag(run).exists() {
                    PlanStatus::Done
                } else {
                    PlanStatus::Pending
                },
            })
            .collect())
    }

    /// Runs the matrix in order, stopping at the first failed run.
    pub fn run_matrix(
        &self,
        matrix: &RunMatrix,
        from: Option<&str>,
    ) -> Result<Vec<(String, RunOutcome)>> {
        matrix.validate()?;
        let start = Self::start_index(matrix, from)?;
        if let Some((path, lines)) = self.check_prerequisite(matrix)? {
            log::info!("prerequisite {} ready ({} lines)", path.display(), lines);
        }

        let mut outcomes = Vec::new();
        for (idx, run) in matrix.runs.iter().enumerate() {
            if idx < start {
                log::info!("[SKIP] {} (before --from)", run.name);
                outcomes.push((run.id.clone(), RunOutcome::SkippedByFrom));
                continue;
            }
            let outcome = self.run_one(matrix, run)?;
            let failed = outcome.is_failure();
            outcomes.push((run.id.clone(), outcome));
            if failed {
                log::error!("{} failed; remaining runs are not started", run.name);
                break;
            }
        }
        Ok(outcomes)
    }

    /// Trains a single run unless its DONE flag exists.
    pub fn run_one(&self, matrix: &RunMatrix, run: &RunSpec) -> Result<RunOutcome> {
        let run_dir = self.workspace.run_dir(&run.name);
        let done_flag = run_dir.join(DONE_FLAG);
        if done_flag.exists() {
            log::info!(
                "[SKIP] {} already finished (remove {} to run it again)",
                run.name,
                done_flag.display()
            );
            return Ok(RunOutcome::AlreadyDone);
        }

        std::fs::create_dir_all(&run_dir)
            .with_context(|| format!("failed to create {}", run_dir.display()))?;
        let log_path = run_dir.join(TRAIN_LOG);
        let cmd = train_command(&self.python, run);

        log::info!("[START] {} ({})", run.name, run.desc);
        log::info!("  config: {}  gpus: {}  data: {}", run.config, run.gpus, run.dataset);
        log::info!("  follow: tail -f {}", log_path.display());

        let started = Instant::now();
        let mut log_file = File::create(&log_path)
            .with_context(|| format!("failed to create {}", log_path.display()))?;
        write_log_header(&mut log_file, run, &cmd)?;

        let status = self.spawn_and_wait(&cmd, log_file, Some(&run_dir.join(PID_FILE)))?;
        let duration_h = started.elapsed().as_secs_f64() / 3600.0;
        let exit_code = exit_code(&status);

        let mut metrics =
            extract_metrics(&[log_path.clone(), self.workspace.worker_log()])?;
        if exit_code == 0 && self.post_eval {
            if let Some(fps) = self.evaluate(run, &run_dir)? {
                metrics.fps.get_or_insert(fps);
            }
        }

        let row = SummaryRow {
            run_id: run.id.clone(),
            name: run.name.clone(),
            model: matrix.model.clone(),
            dataset: run.dataset.clone(),
            distributed: run.distributed,
            desc: run.desc.clone(),
            best_map_50: metrics.best_map(),
            eval_fps: metrics.fps,
            train_duration_h: (duration_h * 100.0).round() / 100.0,
            exit_code,
            timestamp: chrono::Local::now().format(TIMESTAMP_FORMAT).to_string(),
        };
        append_summary(&self.summary_path(matrix), &row)?;

        let record = RunRecord {
            metrics,
            duration_h,
            exit_code,
        };
        if exit_code == 0 {
            File::create(&done_flag)
                .with_context(|| format!("failed to create {}", done_flag.display()))?;
            log::info!(
                "[DONE] {} mAP@0.5={:?} FPS={:?} {:.2}h",
                run.name,
                record.metrics.best_map(),
                record.metrics.fps,
                duration_h
            );
            Ok(RunOutcome::Completed(record))
        } else {
            log::error!(
                "[FAIL] {} exit_code={} after {:.2}h; see tail -n 40 {}",
                run.name,
                exit_code,
                duration_h,
                log_path.display()
            );
            Ok(RunOutcome::Failed(record))
        }
    }

    /// Runs the eval command into `eval.log` and returns the FPS it reports.
    fn evaluate(&self, run: &RunSpec, run_dir: &Path) -> Result<Option<f64>> {
        let cmd = eval_command(&self.python, run);
        let eval_log = run_dir.join(EVAL_LOG);
        let mut log_file = File::create(&eval_log)
            .with_context(|| format!("failed to create {}", eval_log.display()))?;
        writeln!(log_file, "# command: {cmd}")?;
        log::info!("[EVAL] {}", run.name);
        let status = self.spawn_and_wait(&cmd, log_file, None)?;
        if !status.success() {
            log::warn!("eval for {} exited with {}", run.name, exit_code(&status));
        }
        Ok(extract_metrics(&[eval_log])?.fps)
    }

    /// Spawns `cmd` in its own session with stdout and stderr going to `log_file`.
    fn spawn_and_wait(
        &self,
        cmd: &CommandLine,
        log_file: File,
        pid_path: Option<&Path>,
    ) -> Result<ExitStatus> {
        let stderr = log_file.try_clone()?;
        let mut command = cmd.to_command(self.workspace.root());
        command.stdin(Stdio::null()).stdout(log_file).stderr(stderr);
        #[cfg(target_os = "linux")]
        {
            use std::os::unix::process::CommandExt;
            // New session without a controlling terminal: survives the
            // launcher being killed or its terminal closing.
            unsafe {
                command.pre_exec(|| {
                    if libc::setsid() == -1 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }
        #[cfg(all(unix, not(target_os = "linux")))]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }
        let mut child = command
            .spawn()
            .with_context(|| format!("failed to spawn {}", cmd.program))?;
        if let Some(pid_path) = pid_path {
            std::fs::write(pid_path, child.id().to_string())
                .with_context(|| format!("failed to write {}", pid_path.display()))?;
            log::info!("  pid: {} (stop with: kill {})", child.id(), child.id());
        }
        Ok(child.wait()?)
    }
}

fn write_log_header(out: &mut File, run: &RunSpec, cmd: &CommandLine) -> Result<()> {
    let started = chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.6f");
    writeln!(out, "# started:     {started}")?;
    writeln!(out, "# run:         {}", run.name)?;
    writeln!(out, "# description: {}", run.desc)?;
    writeln!(out, "# command:     {cmd}")?;
    writeln!(out, "# {}", "=".repeat(58))?;
    writeln!(out)?;
    out.flush()?;
    Ok(())
}

/// Exit code, or `-signal` when the process was killed.
fn exit_code(status: &ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return -signal;
        }
    }
    -1
}
