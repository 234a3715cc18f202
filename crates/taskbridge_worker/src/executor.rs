//! Child-process executor for the assistant CLI.
//!
//! Spawns the CLI as a one-shot (stdin closed), feeds stdout through the
//! stream parser, supervises termination (SIGTERM, then SIGKILL after the
//! grace period), enforces the worker-side task timeout, and classifies the
//! exit into a terminal report.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, info, warn};

use taskbridge_protocol::defaults::{KILL_GRACE_MS, TASK_TIMEOUT_MS};
use taskbridge_protocol::error::codes;
use taskbridge_protocol::types::{AttachmentMeta, PermissionMode, StreamEvent, TokenUsage};

use crate::parser::StreamParser;

/// Keep at most this much trailing stderr for error reporting.
const STDERR_CAP: usize = 16 * 1024;

/// What one CLI invocation needs.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub task_id: String,
    pub prompt: String,
    pub cwd: PathBuf,
    pub permission_mode: PermissionMode,
    pub session_id: Option<String>,
    pub attachments: Vec<AttachmentMeta>,
}

/// Events the executor reports up to the worker loop.
#[derive(Debug)]
pub enum ExecutorEvent {
    Stream(StreamEvent),
    /// The assistant asked the user something out-of-band.
    Question(String),
    Completed {
        result_text: String,
        session_id: Option<String>,
        usage: TokenUsage,
    },
    Failed {
        code: String,
        message: String,
        partial_result: Option<String>,
        usage: TokenUsage,
    },
}

/// Run the assistant CLI for one task, reporting progress on `events` until
/// a terminal `Completed`/`Failed`. `kill_rx` aborts the run (cancel).
pub async fn execute(
    cli_command: &str,
    request: ExecutionRequest,
    events: mpsc::UnboundedSender<ExecutorEvent>,
    mut kill_rx: oneshot::Receiver<String>,
) {
    if !request.cwd.is_dir() {
        let _ = events.send(ExecutorEvent::Failed {
            code: codes::SPAWN_ERROR.to_string(),
            message: format!("working directory does not exist: {}", request.cwd.display()),
            partial_result: None,
            usage: TokenUsage::default(),
        });
        return;
    }

    let prompt = prompt_with_attachments(&request.prompt, &request.attachments);
    let args = build_args(&prompt, request.permission_mode, request.session_id.as_deref());

    let mut command = Command::new(cli_command);
    command
        .args(&args)
        .current_dir(&request.cwd)
        // One-shot contract: the CLI never gets an interactive stdin; replies
        // arrive as session-continuation follow-up tasks.
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    for key in leaked_env_keys() {
        command.env_remove(key);
    }

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            let _ = events.send(ExecutorEvent::Failed {
                code: codes::SPAWN_ERROR.to_string(),
                message: format!("failed to spawn {}: {}", cli_command, e),
                partial_result: None,
                usage: TokenUsage::default(),
            });
            return;
        }
    };
    info!("Task {} spawned {} ({} args)", request.task_id, cli_command, args.len());

    let mut stdout = child.stdout.take().expect("stdout was piped");
    let stderr = child.stderr.take().expect("stderr was piped");
    let stderr_task = tokio::spawn(async move {
        let mut reader = stderr;
        let mut collected: Vec<u8> = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    collected.extend_from_slice(&buf[..n]);
                    if collected.len() > STDERR_CAP {
                        let excess = collected.len() - STDERR_CAP;
                        collected.drain(..excess);
                    }
                }
            }
        }
        String::from_utf8_lossy(&collected).into_owned()
    });

    // Worker-side safety net; the coordinator arms the same timeout.
    let deadline = Instant::now() + Duration::from_millis(TASK_TIMEOUT_MS);

    let mut parser = StreamParser::new();
    let mut assistant_text = String::new();
    let mut final_result: Option<String> = None;
    let mut session_id: Option<String> = None;
    let mut usage = TokenUsage::default();
    let mut stream_error: Option<String> = None;
    let mut timed_out = false;
    let mut cancelled = false;

    let mut buf = [0u8; 8192];
    loop {
        tokio::select! {
            read = stdout.read(&mut buf) => {
                match read {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        for event in parser.parse(&buf[..n]) {
                            match &event {
                                StreamEvent::AssistantMessage { text } => {
                                    assistant_text.push_str(text);
                                }
                                StreamEvent::ToolUseBegin { tool, summary }
                                    if tool == "AskUserQuestion" =>
                                {
                                    let _ = events.send(ExecutorEvent::Question(summary.clone()));
                                }
                                StreamEvent::Result { text, session_id: sid } => {
                                    final_result = Some(text.clone());
                                    if sid.is_some() {
                                        session_id = sid.clone();
                                    }
                                }
                                StreamEvent::TokenUsage { usage: latest } => {
                                    // Cumulative counters: keep the latest.
                                    usage = *latest;
                                }
                                StreamEvent::Error { message } => {
                                    stream_error = Some(message.clone());
                                }
                                _ => {}
                            }
                            let _ = events.send(ExecutorEvent::Stream(event));
                        }
                    }
                }
            }
            reason = &mut kill_rx => {
                let reason = reason.unwrap_or_else(|_| "cancelled".to_string());
                info!("Task {} killing CLI: {}", request.task_id, reason);
                cancelled = true;
                kill_child(&mut child).await;
                break;
            }
            _ = sleep_until(deadline) => {
                warn!("Task {} hit the worker-side timeout", request.task_id);
                timed_out = true;
                kill_child(&mut child).await;
                break;
            }
        }
    }

    // Drain trailing output before classifying the exit: stderr written just
    // before death still reaches the error message.
    let status = child.wait().await;
    let stderr_text = stderr_task.await.unwrap_or_default();

    let partial = final_result.clone().unwrap_or_else(|| assistant_text.clone());
    let partial = if partial.is_empty() { None } else { Some(partial) };

    if timed_out {
        let _ = events.send(ExecutorEvent::Failed {
            code: codes::TIMEOUT.to_string(),
            message: format!("task exceeded the {} ms timeout", TASK_TIMEOUT_MS),
            partial_result: partial,
            usage,
        });
        return;
    }

    let status = match status {
        Ok(status) => status,
        Err(e) => {
            let _ = events.send(ExecutorEvent::Failed {
                code: codes::SPAWN_ERROR.to_string(),
                message: format!("failed to reap CLI process: {}", e),
                partial_result: partial,
                usage,
            });
            return;
        }
    };

    if status.success() && !cancelled {
        let _ = events.send(ExecutorEvent::Completed {
            result_text: final_result.unwrap_or(assistant_text),
            session_id,
            usage,
        });
        return;
    }

    let code = exit_code_for(&status);
    let message = stream_error
        .or_else(|| {
            let trimmed = stderr_text.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        })
        .unwrap_or_else(|| format!("assistant CLI exited abnormally ({})", code));
    debug!("Task {} CLI exit: {}", request.task_id, code);
    let _ = events.send(ExecutorEvent::Failed {
        code,
        message,
        partial_result: partial,
        usage,
    });
}

/// Argument vector for the CLI invocation.
pub fn build_args(prompt: &str, mode: PermissionMode, session_id: Option<&str>) -> Vec<String> {
    let mut args = vec![
        "-p".to_string(),
        prompt.to_string(),
        "--output-format".to_string(),
        "stream-json".to_string(),
        "--verbose".to_string(),
    ];
    if mode == PermissionMode::Auto {
        args.push("--dangerouslySkipPermissions".to_string());
    }
    if let Some(session) = session_id {
        // The CLI receives both the resume handle and the prompt; how it
        // merges them is its own contract.
        args.push("--resume".to_string());
        args.push(session.to_string());
    }
    args
}

/// Inject staged attachments into the prompt text, one line per file after
/// a blank line. Files that never made it to local disk are referenced by
/// URL instead.
pub fn prompt_with_attachments(prompt: &str, attachments: &[AttachmentMeta]) -> String {
    if attachments.is_empty() {
        return prompt.to_string();
    }
    let mut out = String::from(prompt);
    out.push_str("\n\n");
    for (index, attachment) in attachments.iter().enumerate() {
        if index > 0 {
            out.push('\n');
        }
        let location = attachment
            .local_path
            .as_deref()
            .unwrap_or(attachment.url.as_str());
        out.push_str(&format!("[Attached file: {}]", location));
    }
    out
}

/// Environment keys that would leak assistant configuration from the worker
/// process into the child.
fn leaked_env_keys() -> Vec<String> {
    std::env::vars()
        .map(|(key, _)| key)
        .filter(|key| key.starts_with("CLAUDE"))
        .collect()
}

/// SIGTERM, then SIGKILL once the grace period lapses.
async fn kill_child(child: &mut Child) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            let pid = nix::unistd::Pid::from_raw(pid as i32);
            if let Err(e) = nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGTERM) {
                debug!("SIGTERM failed: {}", e);
            }
            if timeout(Duration::from_millis(KILL_GRACE_MS), child.wait())
                .await
                .is_ok()
            {
                return;
            }
            warn!("CLI ignored SIGTERM; sending SIGKILL");
        }
    }
    let _ = child.start_kill();
}

/// `EXIT_<n>` for a status exit, `EXIT_<signal>` for a signal death.
fn exit_code_for(status: &std::process::ExitStatus) -> String {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return codes::exit_code(None, Some(signal_name(signal)));
        }
    }
    codes::exit_code(status.code(), None)
}

#[cfg(unix)]
fn signal_name(signal: i32) -> &'static str {
    match signal {
        1 => "SIGHUP",
        2 => "SIGINT",
        6 => "SIGABRT",
        9 => "SIGKILL",
        13 => "SIGPIPE",
        15 => "SIGTERM",
        _ => "SIGNAL",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_args_base() {
        let args = build_args("hello", PermissionMode::Confirm, None);
        assert_eq!(
            args,
            vec!["-p", "hello", "--output-format", "stream-json", "--verbose"]
        );
    }

    #[test]
    fn test_build_args_auto_skips_permissions() {
        let args = build_args("x", PermissionMode::Auto, None);
        assert!(args.contains(&"--dangerouslySkipPermissions".to_string()));
        let args = build_args("x", PermissionMode::AcceptEdits, None);
        assert!(!args.contains(&"--dangerouslySkipPermissions".to_string()));
    }

    #[test]
    fn test_build_args_resume() {
        let args = build_args("x", PermissionMode::Confirm, Some("s1"));
        let resume = args.iter().position(|a| a == "--resume").unwrap();
        assert_eq!(args[resume + 1], "s1");
    }

    #[test]
    fn test_prompt_attachment_injection() {
        let attachments = vec![
            AttachmentMeta {
                file_name: "a.txt".to_string(),
                mime_type: "text/plain".to_string(),
                size_bytes: 1,
                url: "https://example.test/a.txt".to_string(),
                local_path: Some("/tmp/task-1/a.txt".to_string()),
            },
            AttachmentMeta {
                file_name: "b.png".to_string(),
                mime_type: "image/png".to_string(),
                size_bytes: 1,
                url: "https://example.test/b.png".to_string(),
                local_path: None,
            },
        ];
        let prompt = prompt_with_attachments("look at these", &attachments);
        assert_eq!(
            prompt,
            "look at these\n\n[Attached file: /tmp/task-1/a.txt]\n[Attached file: https://example.test/b.png]"
        );
        assert_eq!(prompt_with_attachments("plain", &[]), "plain");
    }

    #[cfg(unix)]
    mod process_tests {
        use super::*;
        use std::io::Write;
        use std::os::unix::fs::PermissionsExt;

        fn fake_cli(dir: &std::path::Path, body: &str) -> PathBuf {
            let path = dir.join("fake-cli.sh");
            let mut file = std::fs::File::create(&path).unwrap();
            writeln!(file, "#!/bin/sh").unwrap();
            writeln!(file, "{}", body).unwrap();
            let mut perms = file.metadata().unwrap().permissions();
            perms.set_mode(0o755);
            std::fs::set_permissions(&path, perms).unwrap();
            path
        }

        fn request(dir: &std::path::Path) -> ExecutionRequest {
            ExecutionRequest {
                task_id: "task-1".to_string(),
                prompt: "hello".to_string(),
                cwd: dir.to_path_buf(),
                permission_mode: PermissionMode::AcceptEdits,
                session_id: None,
                attachments: Vec::new(),
            }
        }

        async fn collect(
            cli: &std::path::Path,
            req: ExecutionRequest,
        ) -> Vec<ExecutorEvent> {
            let (tx, mut rx) = mpsc::unbounded_channel();
            let (_kill_tx, kill_rx) = oneshot::channel();
            execute(cli.to_str().unwrap(), req, tx, kill_rx).await;
            let mut out = Vec::new();
            while let Ok(event) = rx.try_recv() {
                out.push(event);
            }
            out
        }

        #[tokio::test]
        async fn test_successful_run_reports_result_and_tokens() {
            let dir = tempfile::tempdir().unwrap();
            let cli = fake_cli(
                dir.path(),
                concat!(
                    r#"echo '{"type":"assistant","content":[{"type":"text","text":"Hi"}]}'"#,
                    "\n",
                    r#"echo '{"type":"result","result":"Hi","session_id":"s1","usage":{"input_tokens":10,"output_tokens":2}}'"#,
                ),
            );
            let events = collect(&cli, request(dir.path())).await;

            let terminal = events.last().expect("terminal event");
            match terminal {
                ExecutorEvent::Completed { result_text, session_id, usage } => {
                    assert_eq!(result_text, "Hi");
                    assert_eq!(session_id.as_deref(), Some("s1"));
                    assert_eq!(usage.input, 10);
                    assert_eq!(usage.output, 2);
                }
                other => panic!("expected Completed, got {:?}", other),
            }
            assert!(events
                .iter()
                .any(|e| matches!(e, ExecutorEvent::Stream(StreamEvent::AssistantMessage { .. }))));
        }

        #[tokio::test]
        async fn test_nonzero_exit_uses_stderr_as_message() {
            let dir = tempfile::tempdir().unwrap();
            let cli = fake_cli(
                dir.path(),
                "echo 'model quota exhausted' >&2\nexit 3",
            );
            let events = collect(&cli, request(dir.path())).await;
            match events.last().unwrap() {
                ExecutorEvent::Failed { code, message, .. } => {
                    assert_eq!(code, "EXIT_3");
                    assert!(message.contains("model quota exhausted"));
                }
                other => panic!("expected Failed, got {:?}", other),
            }
        }

        #[tokio::test]
        async fn test_missing_cwd_is_spawn_error() {
            let dir = tempfile::tempdir().unwrap();
            let cli = fake_cli(dir.path(), "exit 0");
            let mut req = request(dir.path());
            req.cwd = dir.path().join("does-not-exist");
            let events = collect(&cli, req).await;
            match events.last().unwrap() {
                ExecutorEvent::Failed { code, .. } => assert_eq!(code, "SPAWN_ERROR"),
                other => panic!("expected Failed, got {:?}", other),
            }
        }

        #[tokio::test]
        async fn test_kill_signal_terminates_run() {
            let dir = tempfile::tempdir().unwrap();
            let cli = fake_cli(dir.path(), "sleep 30");
            let (tx, mut rx) = mpsc::unbounded_channel();
            let (kill_tx, kill_rx) = oneshot::channel();
            let req = request(dir.path());

            let run = tokio::spawn(async move {
                execute(cli.to_str().unwrap(), req, tx, kill_rx).await;
            });
            tokio::time::sleep(Duration::from_millis(200)).await;
            kill_tx.send("cancelled by user".to_string()).unwrap();
            run.await.unwrap();

            let mut events = Vec::new();
            while let Ok(event) = rx.try_recv() {
                events.push(event);
            }
            match events.last().unwrap() {
                ExecutorEvent::Failed { code, .. } => {
                    assert!(code.starts_with("EXIT_"), "code was {}", code);
                }
                other => panic!("expected Failed, got {:?}", other),
            }
        }

        #[tokio::test]
        async fn test_question_event_from_ask_user_tool() {
            let dir = tempfile::tempdir().unwrap();
            let cli = fake_cli(
                dir.path(),
                concat!(
                    r#"echo '{"type":"tool_use","name":"AskUserQuestion","input":{"question":"Proceed?"}}'"#,
                    "\n",
                    r#"echo '{"type":"result","result":"waiting"}'"#,
                ),
            );
            let events = collect(&cli, request(dir.path())).await;
            assert!(events
                .iter()
                .any(|e| matches!(e, ExecutorEvent::Question(q) if q == "Proceed?")));
        }
    }
}
