//! File- and process-backed collaborators for the session core
//!
//! - `JsonWorkStore`: outstanding work from a JSON file, usage appended as JSON lines
//! - `DirWorkerFactory`: one fresh state directory per worker
//! - `CommandProcessor`: runs the booking adapter as a child process

use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::Stdio;
use std::time::Duration;

use account_pool::Account;
use serde::Deserialize;
use session::{
    Error, MissionContext, Result, TaskOutcome, TaskProcessor, UsageRecord, WorkItem,
    WorkRepository, Worker, WorkerContext, WorkerFactory,
};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Exit codes of the processor command.
const EXIT_SUCCESS: i32 = 0;
const EXIT_NO_CAPACITY: i32 = 10;
const EXIT_TERMINAL: i32 = 20;

/// Longest stderr excerpt carried into outcomes and usage records.
const MAX_REASON_LEN: usize = 500;

#[derive(Deserialize)]
struct WorkEntry {
    #[serde(flatten)]
    item: WorkItem,
    #[serde(default = "default_active")]
    active: bool,
}

fn default_active() -> bool {
    true
}

/// Work items from a JSON array file, re-read every session.
pub struct JsonWorkStore {
    work_file: PathBuf,
    usage_log: PathBuf,
    append_lock: Mutex<()>,
}

impl JsonWorkStore {
    pub fn new(work_file: impl Into<PathBuf>, usage_log: impl Into<PathBuf>) -> Self {
        Self {
            work_file: work_file.into(),
            usage_log: usage_log.into(),
            append_lock: Mutex::new(()),
        }
    }
}

impl WorkRepository for JsonWorkStore {
    fn get_active_work_grouped_by_mission(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<BTreeMap<String, Vec<WorkItem>>>> + Send + '_>> {
        Box::pin(async move {
            let contents = match tokio::fs::read_to_string(&self.work_file).await {
                Ok(contents) => contents,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    debug!(path = %self.work_file.display(), "Work file missing, nothing to do");
                    return Ok(BTreeMap::new());
                }
                Err(e) => {
                    return Err(Error::WorkRepository(format!(
                        "failed to read {}: {e}",
                        self.work_file.display()
                    )));
                }
            };
            let entries: Vec<WorkEntry> = serde_json::from_str(&contents).map_err(|e| {
                Error::WorkRepository(format!(
                    "invalid work file {}: {e}",
                    self.work_file.display()
                ))
            })?;

            let mut groups: BTreeMap<String, Vec<WorkItem>> = BTreeMap::new();
            for entry in entries.into_iter().filter(|e| e.active) {
                groups
                    .entry(entry.item.mission_key.clone())
                    .or_default()
                    .push(entry.item);
            }
            Ok(groups)
        })
    }

    fn log_usage(
        &self,
        record: UsageRecord,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            let mut line = serde_json::to_string(&record)
                .map_err(|e| Error::WorkRepository(format!("failed to encode usage: {e}")))?;
            line.push('\n');

            let _guard = self.append_lock.lock().await;
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.usage_log)
                .await
                .map_err(|e| {
                    Error::WorkRepository(format!(
                        "failed to open {}: {e}",
                        self.usage_log.display()
                    ))
                })?;
            file.write_all(line.as_bytes())
                .await
                .map_err(|e| Error::WorkRepository(format!("failed to append usage: {e}")))?;
            Ok(())
        })
    }
}

/// Hands out workers that each own a private state directory under `root`.
pub struct DirWorkerFactory {
    root: PathBuf,
}

impl DirWorkerFactory {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

fn sanitize(key: &str) -> String {
    key.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

impl WorkerFactory for DirWorkerFactory {
    fn create<'a>(
        &'a self,
        mission: &'a MissionContext,
    ) -> Pin<Box<dyn Future<Output = Result<Box<dyn Worker>>> + Send + 'a>> {
        Box::pin(async move {
            let id = uuid::Uuid::new_v4().as_simple().to_string();
            let state_dir = self
                .root
                .join(format!("{}-{id}", sanitize(&mission.mission_key)));
            Ok(Box::new(DirWorker {
                context: WorkerContext {
                    id,
                    mission_key: mission.mission_key.clone(),
                    state_dir: Some(state_dir),
                },
            }) as Box<dyn Worker>)
        })
    }
}

struct DirWorker {
    context: WorkerContext,
}

impl DirWorker {
    fn dir(&self) -> Result<&Path> {
        self.context
            .state_dir
            .as_deref()
            .ok_or_else(|| Error::Worker("worker has no state directory".into()))
    }
}

impl Worker for DirWorker {
    fn context(&self) -> &WorkerContext {
        &self.context
    }

    fn start(&mut self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            let dir = self.dir()?;
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| Error::Worker(format!("failed to create {}: {e}", dir.display())))
        })
    }

    fn close(&mut self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            let dir = self.dir()?;
            match tokio::fs::remove_dir_all(dir).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(Error::Worker(format!(
                    "failed to remove {}: {e}",
                    dir.display()
                ))),
            }
        })
    }
}

/// Runs the booking adapter once per mission.
///
/// Items go to stdin as a JSON array; account and worker context go in
/// `BOT_*` environment variables. The exit code is the outcome.
pub struct CommandProcessor {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandProcessor {
    /// `command` is the program followed by its arguments.
    pub fn new(command: &[String], timeout: Duration) -> Result<Self> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| Error::Processor("empty processor command".into()))?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
            timeout,
        })
    }
}

fn stderr_reason(stderr: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(stderr);
    let line = text.lines().rev().find(|l| !l.trim().is_empty())?.trim();
    Some(line.chars().take(MAX_REASON_LEN).collect())
}

impl TaskProcessor for CommandProcessor {
    fn process<'a>(
        &'a self,
        worker: &'a mut dyn Worker,
        account: &'a Account,
        items: &'a [WorkItem],
    ) -> Pin<Box<dyn Future<Output = Result<TaskOutcome>> + Send + 'a>> {
        Box::pin(async move {
            let input = serde_json::to_vec(items)
                .map_err(|e| Error::Processor(format!("failed to encode items: {e}")))?;
            let context = worker.context();

            let mut command = tokio::process::Command::new(&self.program);
            command
                .args(&self.args)
                .env("BOT_ACCOUNT_ID", &account.id)
                .env("BOT_CREDENTIAL_REF", account.credential_ref.expose())
                .env("BOT_WORKER_ID", &context.id)
                .env("BOT_MISSION_KEY", &context.mission_key)
                .stdin(Stdio::piped())
                .stdout(Stdio::null())
                .stderr(Stdio::piped())
                .kill_on_drop(true);
            if let Some(dir) = &context.state_dir {
                command.env("BOT_STATE_DIR", dir);
            }

            let mut child = command
                .spawn()
                .map_err(|e| Error::Processor(format!("failed to spawn {}: {e}", self.program)))?;
            let mut stdin = child.stdin.take();

            let run = async move {
                if let Some(stdin) = stdin.as_mut()
                    && let Err(e) = stdin.write_all(&input).await
                {
                    debug!(error = %e, "Processor closed stdin early");
                }
                drop(stdin);
                child.wait_with_output().await
            };

            let output = match tokio::time::timeout(self.timeout, run).await {
                Ok(Ok(output)) => output,
                Ok(Err(e)) => return Err(Error::Processor(format!("processor failed: {e}"))),
                Err(_) => {
                    warn!(
                        mission = %context.mission_key,
                        account_id = %account.id,
                        timeout_secs = self.timeout.as_secs(),
                        "Processor timed out"
                    );
                    return Ok(TaskOutcome::RecoverableFailure(format!(
                        "processor timed out after {}s",
                        self.timeout.as_secs()
                    )));
                }
            };

            let reason = stderr_reason(&output.stderr);
            let outcome = match output.status.code() {
                Some(EXIT_SUCCESS) => TaskOutcome::Success,
                Some(EXIT_NO_CAPACITY) => TaskOutcome::NoCapacity,
                Some(EXIT_TERMINAL) => TaskOutcome::TerminalFailure(
                    reason.unwrap_or_else(|| "account rejected".to_string()),
                ),
                Some(code) => TaskOutcome::RecoverableFailure(match reason {
                    Some(reason) => format!("exit code {code}: {reason}"),
                    None => format!("exit code {code}"),
                }),
                None => TaskOutcome::RecoverableFailure("processor killed by signal".into()),
            };
            Ok(outcome)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(id: &str, mission: &str) -> WorkItem {
        WorkItem {
            id: id.into(),
            mission_key: mission.into(),
            payload: serde_json::json!({"applicant": id}),
        }
    }

    #[tokio::test]
    async fn work_store_groups_active_items_by_mission() {
        let dir = tempfile::tempdir().unwrap();
        let work = dir.path().join("work.json");
        std::fs::write(
            &work,
            r#"[
                {"id": "w1", "mission_key": "porto", "payload": {"applicant": "a"}},
                {"id": "w2", "mission_key": "lisbon"},
                {"id": "w3", "mission_key": "porto"},
                {"id": "w4", "mission_key": "faro", "active": false}
            ]"#,
        )
        .unwrap();
        let store = JsonWorkStore::new(&work, dir.path().join("usage.jsonl"));

        let groups = store.get_active_work_grouped_by_mission().await.unwrap();

        let keys: Vec<_> = groups.keys().map(String::as_str).collect();
        assert_eq!(keys, ["lisbon", "porto"]);
        let porto: Vec<_> = groups["porto"].iter().map(|i| i.id.as_str()).collect();
        assert_eq!(porto, ["w1", "w3"]);
        assert_eq!(groups["porto"][0].payload["applicant"], "a");
    }

    #[tokio::test]
    async fn work_store_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonWorkStore::new(dir.path().join("absent.json"), dir.path().join("u"));
        assert!(store.get_active_work_grouped_by_mission().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn work_store_rejects_malformed_file() {
        let dir = tempfile::tempdir().unwrap();
        let work = dir.path().join("work.json");
        std::fs::write(&work, "{not json").unwrap();
        let store = JsonWorkStore::new(&work, dir.path().join("u"));

        let err = store.get_active_work_grouped_by_mission().await.unwrap_err();
        assert!(matches!(err, Error::WorkRepository(_)));
    }

    #[tokio::test]
    async fn usage_log_appends_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let usage = dir.path().join("usage.jsonl");
        let store = JsonWorkStore::new(dir.path().join("work.json"), &usage);

        for (n, outcome) in [(1, "success"), (2, "no_capacity")] {
            store
                .log_usage(UsageRecord {
                    account_id: "acct-1".into(),
                    mission_key: "porto".into(),
                    session_number: n,
                    outcome: outcome.into(),
                    started_at: 1_000,
                    completed_at: 2_000,
                    item_ids: vec!["w1".into()],
                    error: None,
                })
                .await
                .unwrap();
        }

        let contents = std::fs::read_to_string(&usage).unwrap();
        let lines: Vec<serde_json::Value> = contents
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["outcome"], "success");
        assert_eq!(lines[1]["session_number"], 2);
    }

    fn mission(key: &str) -> MissionContext {
        MissionContext {
            mission_key: key.into(),
            session_number: 1,
            item_count: 1,
        }
    }

    #[tokio::test]
    async fn dir_workers_are_isolated_and_cleaned_up() {
        let root = tempfile::tempdir().unwrap();
        let factory = DirWorkerFactory::new(root.path());
        let ctx = mission("lisbon/consulate");

        let mut first = factory.create(&ctx).await.unwrap();
        let mut second = factory.create(&ctx).await.unwrap();
        first.start().await.unwrap();
        second.start().await.unwrap();

        let a = first.context().state_dir.clone().unwrap();
        let b = second.context().state_dir.clone().unwrap();
        assert_ne!(a, b);
        assert_ne!(first.context().id, second.context().id);
        assert!(a.is_dir() && b.is_dir());
        assert_eq!(a.parent().unwrap(), root.path());
        let name = a.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("lisbon_consulate-"), "got {name}");

        std::fs::write(a.join("cookies.txt"), "session=abc").unwrap();
        first.close().await.unwrap();
        assert!(!a.exists());
        assert!(b.is_dir());

        second.close().await.unwrap();
        // Closing twice is harmless.
        second.close().await.unwrap();
    }

    #[cfg(unix)]
    mod command {
        use super::*;
        use account_pool::Account;

        fn processor(script: &str, timeout: Duration) -> CommandProcessor {
            let command = vec!["sh".to_string(), "-c".to_string(), script.to_string()];
            CommandProcessor::new(&command, timeout).unwrap()
        }

        async fn run(script: &str, timeout: Duration) -> Result<TaskOutcome> {
            let root = tempfile::tempdir().unwrap();
            let factory = DirWorkerFactory::new(root.path());
            let mut worker = factory.create(&mission("porto")).await.unwrap();
            worker.start().await.unwrap();
            let account = Account::new("acct-1", "vault://acct-1");
            let items = vec![item("w1", "porto"), item("w2", "porto")];
            let outcome = processor(script, timeout)
                .process(worker.as_mut(), &account, &items)
                .await;
            worker.close().await.unwrap();
            outcome
        }

        const LONG: Duration = Duration::from_secs(30);

        #[tokio::test]
        async fn exit_codes_map_to_outcomes() {
            assert_eq!(run("exit 0", LONG).await.unwrap(), TaskOutcome::Success);
            assert_eq!(run("exit 10", LONG).await.unwrap(), TaskOutcome::NoCapacity);
            assert_eq!(
                run("echo 'account locked' >&2; exit 20", LONG).await.unwrap(),
                TaskOutcome::TerminalFailure("account locked".into())
            );
            assert_eq!(
                run("echo 'captcha' >&2; exit 3", LONG).await.unwrap(),
                TaskOutcome::RecoverableFailure("exit code 3: captcha".into())
            );
        }

        #[tokio::test]
        async fn items_arrive_on_stdin() {
            let script = r#"input=$(cat); case "$input" in *w2*) exit 0;; *) exit 3;; esac"#;
            let outcome = run(script, LONG).await.unwrap();
            assert_eq!(outcome, TaskOutcome::Success);
        }

        #[tokio::test]
        async fn context_passed_in_environment() {
            let script = r#"test "$BOT_ACCOUNT_ID" = acct-1 \
                && test "$BOT_CREDENTIAL_REF" = vault://acct-1 \
                && test "$BOT_MISSION_KEY" = porto \
                && test -d "$BOT_STATE_DIR" \
                && test -n "$BOT_WORKER_ID""#;
            assert_eq!(run(script, LONG).await.unwrap(), TaskOutcome::Success);
        }

        #[tokio::test]
        async fn timeout_is_recoverable() {
            let outcome = run("sleep 10", Duration::from_millis(200)).await.unwrap();
            assert!(matches!(
                outcome,
                TaskOutcome::RecoverableFailure(ref r) if r.contains("timed out")
            ));
        }

        #[tokio::test]
        async fn missing_program_is_an_error() {
            let command = vec!["/nonexistent/booking-adapter".to_string()];
            let p = CommandProcessor::new(&command, LONG).unwrap();
            let root = tempfile::tempdir().unwrap();
            let mut worker = DirWorkerFactory::new(root.path())
                .create(&mission("porto"))
                .await
                .unwrap();
            let account = Account::new("acct-1", "vault://acct-1");
            let err = p.process(worker.as_mut(), &account, &[]).await.unwrap_err();
            assert!(matches!(err, Error::Processor(_)));
        }

        #[test]
        fn empty_command_rejected() {
            assert!(CommandProcessor::new(&[], LONG).is_err());
        }
    }
}
