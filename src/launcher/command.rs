use std::fmt;
use std::path::Path;
use std::process::Command;

use super::RunSpec;

/// A program invocation that can be displayed, logged and spawned.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandLine {
    pub program: String,
    pub args: Vec<String>,
    /// Added on top of the inherited environment.
    pub env: Vec<(String, String)>,
}

impl CommandLine {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn to_command(&self, cwd: &Path) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args).current_dir(cwd);
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        cmd
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// `tools/train.py` with evaluation and VisualDL logging into `output/<name>/vdl_log`.
///
/// Multi-card runs go through `paddle.distributed.launch`.
pub fn train_command(python: &str, run: &RunSpec) -> CommandLine {
    let mut cmd = CommandLine::new(python);
    if run.distributed {
        cmd = cmd.args(["-m", "paddle.distributed.launch", "--gpus", run.gpus.as_str()]);
    }
    cmd.args(["tools/train.py", "-c", run.config.as_str(), "--eval", "--use_vdl=true"])
        .arg(format!("--vdl_log_dir=output/{}/vdl_log", run.name))
        .env("CUDA_VISIBLE_DEVICES", run.gpus.as_str())
        .env("NCCL_IB_DISABLE", "1")
}

/// `tools/eval.py` against the run's best checkpoint, with per-class AP.
pub fn eval_command(python: &str, run: &RunSpec) -> CommandLine {
    CommandLine::new(python)
        .args(["tools/eval.py", "-c", run.config.as_str(), "-o"])
        .arg(format!("weights=output/{}/best_model.pdparams", run.name))
        .arg("--classwise")
        .env("CUDA_VISIBLE_DEVICES", run.gpus.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launcher::RunMatrix;

    #[test]
    fn single_card_train_command() {
        let matrix = RunMatrix::yolov3();
        let cmd = train_command("python", &matrix.runs[0]);
        assert_eq!(
            cmd.to_string(),
            "python tools/train.py -c configs/yolov3/runs/Y1_yolov3_1of3_1gpu.yml --eval \
             --use_vdl=true --vdl_log_dir=output/Y1_yolov3_1of3_1gpu/vdl_log"
        );
        assert!(cmd
            .env
            .contains(&("CUDA_VISIBLE_DEVICES".to_string(), "0".to_string())));
        assert!(cmd
            .env
            .contains(&("NCCL_IB_DISABLE".to_string(), "1".to_string())));
    }

    #[test]
    fn distributed_train_command_uses_launcher() {
        let matrix = RunMatrix::lightweight();
        let cmd = train_command("/usr/bin/python3", &matrix.runs[1]);
        assert_eq!(
            &cmd.args[..5],
            ["-m", "paddle.distributed.launch", "--gpus", "0,1", "tools/train.py"]
        );
    }

    #[test]
    fn eval_command_points_at_best_model() {
        let matrix = RunMatrix::lightweight();
        let cmd = eval_command("python", &matrix.runs[3]);
        assert_eq!(
            cmd.to_string(),
            "python tools/eval.py -c configs/picodet/runs/L4_picodet_600e.yml -o \
             weights=output/L4_picodet_600e/best_model.pdparams --classwise"
        );
    }
}
