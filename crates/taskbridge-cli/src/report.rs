//! Chat replies sent back to the requester.

use std::time::Duration;

use taskbridge_adapters::RunResult;
use taskbridge_intent::Task;

pub const UNAUTHORIZED: &str = "⛔ 无权限触发 runner";

/// Acknowledgement sent once a task passed parsing and the safety filter.
pub fn accepted(task: &Task) -> String {
    format!(
        "✅ 任务已接收\ntask_id={}\nrepo={} branch={}",
        task.id,
        task.repo,
        task.branch_label()
    )
}

pub fn parse_failed(err: &dyn std::fmt::Display) -> String {
    format!("⚠️ 指令解析失败: {err}")
}

pub fn rejected(err: &dyn std::fmt::Display) -> String {
    format!("⛔ 任务被拒绝: {err}")
}

pub fn repo_invalid(err: &dyn std::fmt::Display) -> String {
    format!("⛔ Repo 校验失败: {err}")
}

pub fn repo_not_ready(err: &dyn std::fmt::Display) -> String {
    format!("⛔ Repo 状态不满足执行条件: {err}")
}

/// The final report for a task that reached the tool.
pub fn final_report(task: &Task, run: &RunResult, diff_stat: &str, diff_snippet: &str) -> String {
    let status = if run.timed_out {
        "❌ 超时"
    } else if run.exit_error.is_some() || run.test_error.is_some() {
        "❌ 失败"
    } else {
        "✅ 成功"
    };

    let mut parts = vec![
        status.to_string(),
        format!("task_id={}", task.id),
        format!("耗时={}", format_duration(run.duration)),
        format!("\n[Codex 输出摘要]\n{}", truncate_lines(&run.output, 40)),
        format!("\n[Diff Stat]\n{}", truncate_lines(diff_stat, 30)),
        format!("\n[Diff 摘要]\n{}", truncate_lines(diff_snippet, 60)),
    ];
    if !run.test_output.is_empty() {
        parts.push(format!("\n[测试输出]\n{}", truncate_lines(&run.test_output, 40)));
    }
    if let Some(path) = &run.log_path {
        parts.push(format!("\n完整日志: {}", path.display()));
    }
    if let Some(err) = &run.exit_error {
        parts.push(format!("\nCodex 执行错误: {err}"));
    }
    if let Some(err) = &run.test_error {
        parts.push(format!("\n测试错误: {err}"));
    }
    parts.join("\n")
}

/// Keep at most `max` lines of `s` (outer whitespace trimmed), marking the
/// cut with `... (truncated)`.
pub fn truncate_lines(s: &str, max: usize) -> String {
    let trimmed = s.trim();
    let lines: Vec<&str> = trimmed.split('\n').collect();
    if lines.len() <= max {
        return trimmed.to_string();
    }
    format!("{}\n... (truncated)", lines[..max].join("\n"))
}

/// Round to whole seconds and render as `1h2m3s`, `4m5s` or `6s`.
pub fn format_duration(d: Duration) -> String {
    let secs = (d.as_millis() + 500) / 1000;
    let (h, m, s) = (secs / 3600, secs / 60 % 60, secs % 60);
    if h > 0 {
        format!("{h}h{m}m{s}s")
    } else if m > 0 {
        format!("{m}m{s}s")
    } else {
        format!("{s}s")
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::path::PathBuf;

    fn task(branch: &str) -> Task {
        Task {
            id: "a1b2c3d4e5f6".into(),
            repo: "aoi-service".into(),
            branch: branch.into(),
            test_cmd: "go test ./...".into(),
            mode: "implement".into(),
            instruction: "add jwt middleware".into(),
            requester_id: "ou_1".into(),
            chat_id: "oc_1".into(),
            message_id: "om_1".into(),
            received_at: Utc::now(),
            raw_text: String::new(),
        }
    }

    #[test]
    fn accepted_names_task_repo_and_branch() {
        assert_eq!(
            accepted(&task("feat/jwt")),
            "✅ 任务已接收\ntask_id=a1b2c3d4e5f6\nrepo=aoi-service branch=feat/jwt"
        );
        assert!(accepted(&task(" ")).ends_with("branch=(default)"));
    }

    #[test]
    fn truncate_lines_caps_line_count() {
        let s = "a\n".repeat(10);
        assert_eq!(truncate_lines(&s, 3), "a\na\na\n... (truncated)");
        assert_eq!(truncate_lines("  x\ny \n", 2), "x\ny");
        assert_eq!(truncate_lines("", 3), "");
    }

    #[test]
    fn truncate_lines_is_idempotent() {
        let inputs = [
            String::new(),
            "one".to_string(),
            "a\nb\nc\nd\ne".to_string(),
            "\n\n  padded\nlines \n\n".to_string(),
            "x\n".repeat(100),
        ];
        for s in &inputs {
            for n in 1..8 {
                let once = truncate_lines(s, n);
                assert_eq!(truncate_lines(&once, n), once, "s={s:?} n={n}");
            }
        }
    }

    #[test]
    fn format_duration_matches_clock_style() {
        assert_eq!(format_duration(Duration::ZERO), "0s");
        assert_eq!(format_duration(Duration::from_millis(499)), "0s");
        assert_eq!(format_duration(Duration::from_millis(41_500)), "42s");
        assert_eq!(format_duration(Duration::from_secs(65)), "1m5s");
        assert_eq!(format_duration(Duration::from_secs(3600)), "1h0m0s");
        assert_eq!(format_duration(Duration::from_secs(3723)), "1h2m3s");
    }

    #[test]
    fn success_report_layout() {
        let run = RunResult {
            output: "done".into(),
            duration: Duration::from_secs(42),
            log_path: Some(PathBuf::from("/w/logs/task-a1b2c3d4e5f6.log")),
            test_output: "ok  \tpkg\n".into(),
            ..RunResult::default()
        };
        let report = final_report(&task(""), &run, " main.go | 1 +\n", "+x\n");
        assert_eq!(
            report,
            "✅ 成功\ntask_id=a1b2c3d4e5f6\n耗时=42s\n\
             \n[Codex 输出摘要]\ndone\n\
             \n[Diff Stat]\nmain.go | 1 +\n\
             \n[Diff 摘要]\n+x\n\
             \n[测试输出]\nok  \tpkg\n\
             \n完整日志: /w/logs/task-a1b2c3d4e5f6.log"
        );
    }

    #[test]
    fn failure_report_lists_errors() {
        let run = RunResult {
            exit_error: Some("exit status: 1".into()),
            ..RunResult::default()
        };
        let report = final_report(&task(""), &run, "(no changes)", "");
        assert!(report.starts_with("❌ 失败\n"));
        assert!(report.ends_with("\nCodex 执行错误: exit status: 1"));
        assert!(!report.contains("[测试输出]"));
        assert!(!report.contains("完整日志"));

        let run = RunResult {
            test_error: Some("exit status: 2".into()),
            ..RunResult::default()
        };
        let report = final_report(&task(""), &run, "", "");
        assert!(report.starts_with("❌ 失败\n"));
        assert!(report.ends_with("\n测试错误: exit status: 2"));
    }

    #[test]
    fn timeout_overrides_failure() {
        let run = RunResult {
            timed_out: true,
            exit_error: Some("timed out after 1800s".into()),
            ..RunResult::default()
        };
        assert!(final_report(&task(""), &run, "", "").starts_with("❌ 超时\n"));
    }

    #[test]
    fn error_reply_prefixes() {
        assert_eq!(parse_failed(&"repo is required"), "⚠️ 指令解析失败: repo is required");
        assert_eq!(rejected(&"x"), "⛔ 任务被拒绝: x");
        assert_eq!(repo_invalid(&"repo a not found"), "⛔ Repo 校验失败: repo a not found");
        assert_eq!(repo_not_ready(&"dirty"), "⛔ Repo 状态不满足执行条件: dirty");
    }
}
