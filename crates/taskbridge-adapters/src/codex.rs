//! Code-generation tool runner.
//!
//! Drives the external tool (`<bin> exec -`, prompt on stdin) inside a
//! repository, keeps its full output in a per-task log file, then runs the
//! task's test command through `bash -lc`.  Neither operation fails: every
//! problem is recorded on the [`RunResult`] and surfaces in the report.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use taskbridge_intent::Task;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::process::{CapturedOutput, run_captured, truncate_output};

/// Time limit for the test command.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(20 * 60);

/// Default cap on captured output kept in memory and in the report.
pub const DEFAULT_MAX_OUTPUT: usize = 12_000;

/// Outcome of one tool run plus the follow-up test run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunResult {
    /// The prompt sent on stdin.
    pub prompt: String,
    /// Tool output, truncated to the runner's byte cap.
    pub output: String,
    /// Full untruncated output, when it could be written.
    pub log_path: Option<PathBuf>,
    pub duration: Duration,
    pub timed_out: bool,
    /// Why the tool did not exit cleanly.
    pub exit_error: Option<String>,
    pub test_output: String,
    pub test_error: Option<String>,
}

impl RunResult {
    /// The tool exited cleanly in time and the tests passed.
    pub fn succeeded(&self) -> bool {
        !self.timed_out && self.exit_error.is_none() && self.test_error.is_none()
    }

    /// Whether the test command should be run after the tool.
    pub fn should_run_tests(&self) -> bool {
        !self.timed_out && self.exit_error.is_none()
    }
}

/// Captured output of the test command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TestRun {
    pub output: String,
    pub error: Option<String>,
}

/// Runs the code-generation tool and test commands for tasks.
#[derive(Debug, Clone)]
pub struct CodexRunner {
    bin: String,
    log_dir: PathBuf,
    timeout: Duration,
    max_output: usize,
}

impl CodexRunner {
    pub fn new(
        bin: impl Into<String>,
        log_dir: impl Into<PathBuf>,
        timeout: Duration,
        max_output: usize,
    ) -> Self {
        Self {
            bin: bin.into(),
            log_dir: log_dir.into(),
            timeout,
            max_output,
        }
    }

    /// Pipe the task prompt into `<bin> exec -` with `repo_path` as the
    /// working directory.
    pub async fn execute(
        &self,
        task: &Task,
        repo_path: &Path,
        cancel: &CancellationToken,
    ) -> RunResult {
        let started = Instant::now();
        let mut result = RunResult {
            prompt: build_prompt(task),
            ..RunResult::default()
        };

        if let Err(e) = tokio::fs::create_dir_all(&self.log_dir).await {
            warn!(dir = %self.log_dir.display(), error = %e, "cannot create log directory");
            result.exit_error = Some(format!(
                "create log directory {}: {e}",
                self.log_dir.display()
            ));
            result.duration = started.elapsed();
            return result;
        }

        info!(task_id = %task.id, bin = %self.bin, repo = %task.repo, "starting code generation");
        let captured = run_captured(
            &self.bin,
            &["exec", "-"],
            repo_path,
            Some(result.prompt.as_bytes()),
            self.timeout,
            cancel,
        )
        .await;

        match captured {
            Ok(captured) => {
                result.timed_out = captured.timed_out();
                result.exit_error = captured.failure();
                result.output = truncate_output(&captured.combined, self.max_output);
                result.log_path = self.write_log(&task.id, &captured).await;
            }
            Err(e) => result.exit_error = Some(e.to_string()),
        }
        result.duration = started.elapsed();

        info!(
            task_id = %task.id,
            elapsed_ms = result.duration.as_millis() as u64,
            timed_out = result.timed_out,
            failed = result.exit_error.is_some(),
            "code generation finished"
        );
        result
    }

    /// Run the task's test command via `bash -lc` in `repo_path`.
    pub async fn run_tests(
        &self,
        task: &Task,
        repo_path: &Path,
        cancel: &CancellationToken,
    ) -> TestRun {
        info!(task_id = %task.id, test_cmd = %task.test_cmd, "running tests");
        match run_captured(
            "bash",
            &["-lc", &task.test_cmd],
            repo_path,
            None,
            TEST_TIMEOUT,
            cancel,
        )
        .await
        {
            Ok(captured) => TestRun {
                output: truncate_output(&captured.combined, self.max_output),
                error: captured.failure(),
            },
            Err(e) => TestRun {
                output: String::new(),
                error: Some(e.to_string()),
            },
        }
    }

    async fn write_log(&self, task_id: &str, captured: &CapturedOutput) -> Option<PathBuf> {
        let path = self.log_dir.join(format!("task-{task_id}.log"));
        match tokio::fs::write(&path, &captured.combined).await {
            Ok(()) => Some(path),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to write task log");
                None
            }
        }
    }
}

/// The prompt handed to the tool.  Its wording is what the tool's users
/// have come to expect and must stay as is.
pub fn build_prompt(task: &Task) -> String {
    format!(
        "你正在一个 Go 项目仓库中工作。
只做完成任务所需的最小改动。
不要做大规模重构，除非任务要求。
修改后必须运行测试：{test_cmd}
输出：
1. 改动摘要（要点）
2. 涉及文件列表
3. 如何验证（包含测试命令与结果）
4. 若失败，给出下一步建议

任务模式：{mode}
用户任务：{instruction}
",
        test_cmd = task.test_cmd,
        mode = task.mode,
        instruction = task.instruction,
    )
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
