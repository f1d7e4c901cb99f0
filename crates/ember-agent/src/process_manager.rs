use std::{collections::HashMap, path::PathBuf, process::ExitStatus, sync::Arc, time::Duration};

use ember_process::{LogLine, ProfileId, ProfilePatch, ServerProfile, ServerStatus};
use tokio::{
    io::AsyncWriteExt,
    process::{Child, ChildStdin},
    sync::{Mutex, Notify, watch},
    task::JoinHandle,
};

use crate::{
    config::{AgentConfig, SUPPORTED_JAVA_MAJOR},
    error::{ManagerError, Result},
    events::{EventBus, LOG_CHANNEL_CAPACITY, Subscription},
    java_runtime::JavaRuntime,
    log_mux::{self, StreamKind},
    minecraft_launch::LaunchSpec,
    registry_store::ProfileStore,
};

pub const SYSTEM_PREFIX: &str = "[SYSTEM]";

/// Upper bound on waiting for the output pumps after the child exited.
/// Grandchildren can keep a pipe open past the exit.
const PUMP_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

fn system_line(msg: impl AsRef<str>) -> String {
    format!("{SYSTEM_PREFIX} {}", msg.as_ref())
}

/// `code 0`, or `code null, signal 9` for a signal death.
fn describe_exit(status: &ExitStatus) -> String {
    let code = status
        .code()
        .map(|c| c.to_string())
        .unwrap_or_else(|| "null".to_string());

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(sig) = status.signal() {
            return format!("code {code}, signal {sig}");
        }
    }
    format!("code {code}")
}

#[derive(Debug)]
struct ServerHandle {
    pid: Option<u32>,
    stdin: Arc<Mutex<ChildStdin>>,
    exited: watch::Receiver<bool>,
    kill: Arc<Notify>,
}

#[derive(Debug)]
enum Entry {
    /// Slot reserved by an in-flight `start`.
    Starting,
    Running(ServerHandle),
}

/// Registry of running servers, at most one per profile id.
///
/// The map only holds live processes. Persisted profile status is a cache
/// that this type keeps in sync on start, stop and exit.
#[derive(Clone)]
pub struct ServerManager {
    inner: Arc<Mutex<HashMap<ProfileId, Entry>>>,
    store: Arc<dyn ProfileStore>,
    runtime: Arc<JavaRuntime>,
    logs: EventBus<LogLine>,
    stop_timeout: Duration,
    kill_grace: Duration,
}

impl ServerManager {
    pub fn new(
        store: Arc<dyn ProfileStore>,
        runtime: Arc<JavaRuntime>,
        config: &AgentConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
            store,
            runtime,
            logs: EventBus::new(LOG_CHANNEL_CAPACITY),
            stop_timeout: config.stop_timeout,
            kill_grace: config.kill_grace,
        }
    }

    pub fn subscribe_logs(&self) -> Subscription<LogLine> {
        self.logs.subscribe()
    }

    fn emit(&self, id: &ProfileId, line: String) {
        self.logs.publish(LogLine {
            profile_id: id.clone(),
            line,
        });
    }

    /// `Running` iff a live process handle exists.
    pub async fn status(&self, id: &ProfileId) -> ServerStatus {
        match self.inner.lock().await.get(id) {
            Some(Entry::Running(_)) => ServerStatus::Running,
            _ => ServerStatus::Stopped,
        }
    }

    pub async fn pid(&self, id: &ProfileId) -> Option<u32> {
        match self.inner.lock().await.get(id) {
            Some(Entry::Running(h)) => h.pid,
            _ => None,
        }
    }

    pub async fn start(&self, id: &ProfileId) -> Result<ServerProfile> {
        {
            let mut map = self.inner.lock().await;
            if map.contains_key(id) {
                return Err(ManagerError::AlreadyRunning(id.to_string()));
            }
            map.insert(id.clone(), Entry::Starting);
        }

        let res = self.launch(id).await;
        if res.is_err() {
            let mut map = self.inner.lock().await;
            if matches!(map.get(id), Some(Entry::Starting)) {
                map.remove(id);
            }
        }
        res
    }

    /// Cached runtime path if it still probes, else (re)provision and persist.
    async fn resolve_java(&self, profile: &ServerProfile) -> Result<PathBuf> {
        if let Some(cached) = &profile.runtime_java_path
            && self.runtime.check_java(cached).await
        {
            return Ok(cached.clone());
        }

        let java = self.runtime.ensure_java(SUPPORTED_JAVA_MAJOR).await?;
        if profile.runtime_java_path.as_deref() != Some(java.as_path()) {
            let patch = ProfilePatch {
                runtime_java_path: Some(java.clone()),
                ..ProfilePatch::default()
            };
            self.store.update(&profile.id, patch).await?;
        }
        Ok(java)
    }

    async fn launch(&self, id: &ProfileId) -> Result<ServerProfile> {
        let profile = self.store.get(id).await?;
        let java = self.resolve_java(&profile).await?;
        let spec = LaunchSpec::for_profile(&profile, &java);

        tracing::info!(
            profile_id = %id,
            exec = %spec.exec.display(),
            args = %spec.args.join(" "),
            cwd = %spec.cwd.display(),
            "starting server"
        );

        let mut child = match spec.command().spawn() {
            Ok(c) => c,
            Err(err) => {
                let msg = format!("{}: {err}", spec.exec.display());
                self.emit(id, system_line(format!("Server error: {err}")));
                return Err(ManagerError::SpawnFailed(msg));
            }
        };

        let pid = child.id();
        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            force_kill(&mut child, pid);
            let _ = child.wait().await;
            return Err(ManagerError::SpawnFailed(
                "child stdio was not captured".to_string(),
            ));
        };

        let (exited_tx, exited_rx) = watch::channel(false);
        let kill = Arc::new(Notify::new());
        self.inner.lock().await.insert(
            id.clone(),
            Entry::Running(ServerHandle {
                pid,
                stdin: Arc::new(Mutex::new(stdin)),
                exited: exited_rx,
                kill: kill.clone(),
            }),
        );

        let refreshed = match self.store.set_status(id, ServerStatus::Running).await {
            Ok(p) => p,
            Err(err) => {
                force_kill(&mut child, pid);
                let _ = child.wait().await;
                self.inner.lock().await.remove(id);
                return Err(err);
            }
        };

        self.emit(id, system_line("Server starting..."));

        let pumps = vec![
            tokio::spawn(log_mux::pump(
                stdout,
                id.clone(),
                StreamKind::Stdout,
                self.logs.clone(),
            )),
            tokio::spawn(log_mux::pump(
                stderr,
                id.clone(),
                StreamKind::Stderr,
                self.logs.clone(),
            )),
        ];

        self.spawn_exit_watcher(id.clone(), child, pid, pumps, kill, exited_tx);

        tracing::info!(profile_id = %id, pid = ?pid, "server started");
        Ok(refreshed)
    }

    /// Waits for the child, then persists `stopped`, deregisters it and
    /// reports the exit. Nothing here is propagated to a caller.
    fn spawn_exit_watcher(
        &self,
        id: ProfileId,
        mut child: Child,
        pid: Option<u32>,
        pumps: Vec<JoinHandle<()>>,
        kill: Arc<Notify>,
        exited_tx: watch::Sender<bool>,
    ) {
        let inner = self.inner.clone();
        let store = self.store.clone();
        let logs = self.logs.clone();

        tokio::spawn(async move {
            let outcome = tokio::select! {
                res = child.wait() => res,
                _ = kill.notified() => {
                    force_kill(&mut child, pid);
                    child.wait().await
                }
            };

            let _ = tokio::time::timeout(PUMP_DRAIN_TIMEOUT, async {
                for p in pumps {
                    let _ = p.await;
                }
            })
            .await;

            // Persist before deregistering: a `start` admitted after removal
            // must not have its `running` overwritten.
            if let Err(err) = store.set_status(&id, ServerStatus::Stopped).await {
                tracing::warn!(profile_id = %id, error = %err, "failed to persist stopped status");
            }
            inner.lock().await.remove(&id);

            let line = match outcome {
                Ok(status) => {
                    tracing::info!(profile_id = %id, %status, "server exited");
                    system_line(format!("Server stopped ({}).", describe_exit(&status)))
                }
                Err(err) => {
                    tracing::warn!(profile_id = %id, error = %err, "waiting on server failed");
                    system_line(format!("Server error: {err}"))
                }
            };
            logs.publish(LogLine {
                profile_id: id,
                line,
            });

            let _ = exited_tx.send(true);
        });
    }

    /// Ask the server to stop via its console, then kill it after the stop
    /// timeout. Returns the refreshed profile.
    pub async fn stop(&self, id: &ProfileId) -> Result<ServerProfile> {
        let handle = match self.inner.lock().await.get(id) {
            Some(Entry::Running(h)) => Some((h.stdin.clone(), h.exited.clone(), h.kill.clone())),
            _ => None,
        };
        let Some((stdin, mut exited, kill)) = handle else {
            return self.store.set_status(id, ServerStatus::Stopped).await;
        };

        self.emit(id, system_line("Stopping server..."));
        if let Err(err) = write_line(&stdin, "stop").await {
            tracing::debug!(profile_id = %id, %err, "failed to send stop command");
        }

        if tokio::time::timeout(self.stop_timeout, wait_exited(&mut exited))
            .await
            .is_err()
        {
            tracing::warn!(
                profile_id = %id,
                timeout_ms = self.stop_timeout.as_millis() as u64,
                "server did not stop in time; killing"
            );
            kill.notify_one();
            if tokio::time::timeout(self.kill_grace, wait_exited(&mut exited))
                .await
                .is_err()
            {
                tracing::warn!(profile_id = %id, "server still running after kill");
            }
        }

        self.store.set_status(id, ServerStatus::Stopped).await
    }

    /// Write `text` (trimmed, newline-terminated) to the server console.
    pub async fn send_command(&self, id: &ProfileId, text: &str) -> Result<()> {
        let stdin = match self.inner.lock().await.get(id) {
            Some(Entry::Running(h)) => h.stdin.clone(),
            _ => return Err(ManagerError::NotRunning(id.to_string())),
        };

        let cmd = text.trim();
        if cmd.is_empty() {
            return Ok(());
        }
        write_line(&stdin, cmd).await?;
        Ok(())
    }

    pub async fn delete(&self, id: &ProfileId, delete_files: bool) -> Result<()> {
        if self.inner.lock().await.contains_key(id) {
            return Err(ManagerError::PreconditionFailed(
                "server is running; stop it before deleting".to_string(),
            ));
        }
        self.store.delete(id, delete_files).await
    }

    /// All profiles, with status taken from the live registry.
    pub async fn list(&self) -> Result<Vec<ServerProfile>> {
        let mut profiles = self.store.list().await?;
        let map = self.inner.lock().await;
        for p in &mut profiles {
            p.status = match map.get(&p.id) {
                Some(Entry::Running(_)) => ServerStatus::Running,
                _ => ServerStatus::Stopped,
            };
        }
        Ok(profiles)
    }

    /// Reset persisted `running` entries that have no live process. Returns
    /// how many were reset; a profile that fails to persist is skipped.
    pub async fn reconcile(&self) -> Result<usize> {
        let profiles = self.store.list().await?;
        let mut reset = 0;
        for p in profiles {
            if p.status != ServerStatus::Running
                || self.inner.lock().await.contains_key(&p.id)
            {
                continue;
            }
            if let Err(err) = self.store.set_status(&p.id, ServerStatus::Stopped).await {
                tracing::warn!(profile_id = %p.id, error = %err, "failed to reset stale running status");
                continue;
            }
            tracing::info!(profile_id = %p.id, "reset stale running status");
            reset += 1;
        }
        Ok(reset)
    }

    /// Stop every running server concurrently.
    pub async fn stop_all(&self) {
        let ids: Vec<ProfileId> = self
            .inner
            .lock()
            .await
            .iter()
            .filter(|(_, e)| matches!(e, Entry::Running(_)))
            .map(|(id, _)| id.clone())
            .collect();

        let results = futures_util::future::join_all(ids.iter().map(|id| self.stop(id))).await;
        for (id, res) in ids.iter().zip(results) {
            if let Err(err) = res {
                tracing::warn!(profile_id = %id, error = %err, "failed to stop server");
            }
        }
    }
}

async fn write_line(stdin: &Mutex<ChildStdin>, text: &str) -> std::io::Result<()> {
    let mut stdin = stdin.lock().await;
    stdin.write_all(format!("{text}\n").as_bytes()).await?;
    stdin.flush().await
}

async fn wait_exited(rx: &mut watch::Receiver<bool>) {
    // A dropped sender also means the watcher is done.
    let _ = rx.wait_for(|v| *v).await;
}

/// SIGKILL the whole process group on Unix, then the child itself.
fn force_kill(child: &mut Child, pid: Option<u32>) {
    #[cfg(unix)]
    if let Some(pgid) = pid.map(|p| p as i32) {
        unsafe {
            libc::kill(-pgid, libc::SIGKILL);
        }
    }
    #[cfg(not(unix))]
    let _ = pid;

    let _ = child.start_kill();
}

#[cfg(all(test, unix))]
mod tests {
    use std::{os::unix::fs::PermissionsExt, path::Path};

    use ember_process::CoreType;
    use tempfile::TempDir;

    use super::*;
    use crate::{
        java_runtime::test_support::FileExistsProbe,
        registry_store::{JsonProfileStore, NewProfile},
    };

    const ECHO_UNTIL_STOP: &str = r#"#!/bin/sh
echo "Done (0.42s)! For help, type \"help\""
while read line; do
  if [ "$line" = "stop" ]; then
    echo "Stopping the server"
    exit 0
  fi
  echo "got $line"
done
"#;

    struct Fixture {
        _tmp: TempDir,
        store: Arc<JsonProfileStore>,
        manager: ServerManager,
        profile: ServerProfile,
    }

    fn write_script(path: &Path, body: &str, mode: u32) {
        std::fs::write(path, body).unwrap();
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).unwrap();
    }

    async fn fixture_with_mode(script: &str, mode: u32) -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let mut cfg = AgentConfig::new(tmp.path());
        cfg.stop_timeout = Duration::from_millis(500);
        cfg.kill_grace = Duration::from_secs(5);
        cfg.java_download_url = "http://127.0.0.1:9/unreachable".to_string();

        let java = tmp.path().join("fake-java");
        write_script(&java, script, mode);

        let store = Arc::new(JsonProfileStore::from_config(&cfg));
        let created = store
            .create(NewProfile {
                display_name: "Test".to_string(),
                core_type: CoreType::Vanilla,
                mc_version: "1.21.1".to_string(),
            })
            .await
            .unwrap();
        let profile = store
            .update(
                &created.id,
                ProfilePatch {
                    runtime_java_path: Some(java),
                    ..ProfilePatch::default()
                },
            )
            .await
            .unwrap();

        let runtime = Arc::new(
            JavaRuntime::new(&cfg)
                .unwrap()
                .with_probe(Arc::new(FileExistsProbe)),
        );
        let manager = ServerManager::new(store.clone(), runtime, &cfg);
        Fixture {
            _tmp: tmp,
            store,
            manager,
            profile,
        }
    }

    async fn fixture(script: &str) -> Fixture {
        fixture_with_mode(script, 0o755).await
    }

    /// Collect lines until one contains `needle`.
    async fn lines_until(sub: &mut Subscription<LogLine>, needle: &str) -> Vec<String> {
        let mut out = Vec::new();
        tokio::time::timeout(Duration::from_secs(10), async {
            while let Some(l) = sub.recv().await {
                let done = l.line.contains(needle);
                out.push(l.line);
                if done {
                    return;
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("no line containing {needle:?}; got {out:?}"));
        out
    }

    #[test]
    fn exit_descriptions() {
        use std::os::unix::process::ExitStatusExt;
        assert_eq!(describe_exit(&ExitStatus::from_raw(0)), "code 0");
        assert_eq!(describe_exit(&ExitStatus::from_raw(3 << 8)), "code 3");
        assert_eq!(describe_exit(&ExitStatus::from_raw(9)), "code null, signal 9");
    }

    #[tokio::test]
    async fn natural_exit_marks_profile_stopped() {
        let fx = fixture("#!/bin/sh\necho \"Done!\"\nexit 0\n").await;
        let id = fx.profile.id.clone();
        let mut logs = fx.manager.subscribe_logs();

        let started = fx.manager.start(&id).await.unwrap();
        assert_eq!(started.status, ServerStatus::Running);

        let lines = lines_until(&mut logs, "stopped (code 0").await;
        assert_eq!(lines.first().map(String::as_str), Some("[SYSTEM] Server starting..."));
        assert!(lines.iter().any(|l| l == "Done!"));
        assert_eq!(lines.last().map(String::as_str), Some("[SYSTEM] Server stopped (code 0)."));

        assert_eq!(fx.manager.status(&id).await, ServerStatus::Stopped);
        assert_eq!(fx.store.get(&id).await.unwrap().status, ServerStatus::Stopped);
    }

    #[tokio::test]
    async fn restart_after_exit_stays_running() {
        let fx = fixture(ECHO_UNTIL_STOP).await;
        let id = fx.profile.id.clone();

        fx.manager.start(&id).await.unwrap();
        fx.manager.send_command(&id, "stop").await.unwrap();

        // Once the handle is gone the stopped status must already be on disk.
        tokio::time::timeout(Duration::from_secs(10), async {
            while fx.manager.status(&id).await == ServerStatus::Running {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert_eq!(fx.store.get(&id).await.unwrap().status, ServerStatus::Stopped);

        let mut logs = fx.manager.subscribe_logs();
        fx.manager.start(&id).await.unwrap();
        lines_until(&mut logs, "Done").await;
        assert_eq!(fx.manager.status(&id).await, ServerStatus::Running);
        assert_eq!(fx.store.get(&id).await.unwrap().status, ServerStatus::Running);

        fx.manager.stop(&id).await.unwrap();
    }

    #[tokio::test]
    async fn second_start_is_rejected_while_running() {
        let fx = fixture(ECHO_UNTIL_STOP).await;
        let id = fx.profile.id.clone();

        fx.manager.start(&id).await.unwrap();
        let err = fx.manager.start(&id).await.unwrap_err();
        assert!(matches!(err, ManagerError::AlreadyRunning(_)));
        assert_eq!(fx.manager.status(&id).await, ServerStatus::Running);
        assert_eq!(fx.store.get(&id).await.unwrap().status, ServerStatus::Running);
        assert!(fx.manager.pid(&id).await.is_some());

        fx.manager.stop(&id).await.unwrap();
    }

    #[tokio::test]
    async fn concurrent_starts_admit_exactly_one() {
        let fx = fixture(ECHO_UNTIL_STOP).await;
        let id = fx.profile.id.clone();

        let (a, b) = tokio::join!(fx.manager.start(&id), fx.manager.start(&id));
        let oks = [a.is_ok(), b.is_ok()].iter().filter(|v| **v).count();
        assert_eq!(oks, 1);
        let err = a.err().or(b.err()).unwrap();
        assert_eq!(err.code(), "already_running");

        fx.manager.stop(&id).await.unwrap();
    }

    #[tokio::test]
    async fn commands_reach_the_console_and_stop_is_graceful() {
        let fx = fixture(ECHO_UNTIL_STOP).await;
        let id = fx.profile.id.clone();
        let mut logs = fx.manager.subscribe_logs();
        fx.manager.start(&id).await.unwrap();

        fx.manager.send_command(&id, "").await.unwrap();
        fx.manager.send_command(&id, "   ").await.unwrap();
        fx.manager.send_command(&id, "  say hi  ").await.unwrap();
        let lines = lines_until(&mut logs, "got ").await;
        assert_eq!(lines.last().map(String::as_str), Some("got say hi"));

        let stopped = fx.manager.stop(&id).await.unwrap();
        assert_eq!(stopped.status, ServerStatus::Stopped);
        assert_eq!(fx.manager.status(&id).await, ServerStatus::Stopped);
        assert_eq!(fx.store.get(&id).await.unwrap().status, ServerStatus::Stopped);

        let lines = lines_until(&mut logs, "Server stopped").await;
        assert!(lines.contains(&"[SYSTEM] Stopping server...".to_string()));
        assert!(lines.contains(&"Stopping the server".to_string()));
        assert_eq!(lines.last().map(String::as_str), Some("[SYSTEM] Server stopped (code 0)."));
    }

    #[tokio::test]
    async fn stop_kills_after_timeout() {
        let fx = fixture("#!/bin/sh\nexec sleep 30\n").await;
        let id = fx.profile.id.clone();
        let mut logs = fx.manager.subscribe_logs();
        fx.manager.start(&id).await.unwrap();

        let begin = tokio::time::Instant::now();
        let stopped = fx.manager.stop(&id).await.unwrap();
        assert!(begin.elapsed() >= Duration::from_millis(500));
        assert!(begin.elapsed() < Duration::from_secs(5));

        assert_eq!(stopped.status, ServerStatus::Stopped);
        assert_eq!(fx.manager.status(&id).await, ServerStatus::Stopped);
        let lines = lines_until(&mut logs, "Server stopped").await;
        assert_eq!(
            lines.last().map(String::as_str),
            Some("[SYSTEM] Server stopped (code null, signal 9).")
        );
    }

    #[tokio::test]
    async fn stderr_is_prefixed_and_exit_code_reported() {
        let fx = fixture("#!/bin/sh\necho oops 1>&2\nexit 3\n").await;
        let id = fx.profile.id.clone();
        let mut logs = fx.manager.subscribe_logs();
        fx.manager.start(&id).await.unwrap();

        let lines = lines_until(&mut logs, "Server stopped").await;
        assert!(lines.contains(&"[ERR] oops".to_string()));
        assert_eq!(lines.last().map(String::as_str), Some("[SYSTEM] Server stopped (code 3)."));
    }

    #[tokio::test]
    async fn commands_and_stop_without_a_process() {
        let fx = fixture(ECHO_UNTIL_STOP).await;
        let id = fx.profile.id.clone();

        let err = fx.manager.send_command(&id, "list").await.unwrap_err();
        assert!(matches!(err, ManagerError::NotRunning(_)));

        fx.store.set_status(&id, ServerStatus::Running).await.unwrap();
        let p = fx.manager.stop(&id).await.unwrap();
        assert_eq!(p.status, ServerStatus::Stopped);
        assert_eq!(p.display_name, fx.profile.display_name);
    }

    #[tokio::test]
    async fn spawn_failure_releases_the_slot() {
        // Readable but not executable: the probe passes, exec fails.
        let fx = fixture_with_mode(ECHO_UNTIL_STOP, 0o644).await;
        let id = fx.profile.id.clone();
        let mut logs = fx.manager.subscribe_logs();

        let err = fx.manager.start(&id).await.unwrap_err();
        assert_eq!(err.code(), "spawn_failed");
        let lines = lines_until(&mut logs, "Server error").await;
        assert!(lines[0].starts_with("[SYSTEM] Server error: "));

        assert_eq!(fx.manager.status(&id).await, ServerStatus::Stopped);
        assert_eq!(fx.store.get(&id).await.unwrap().status, ServerStatus::Stopped);
        // Not AlreadyRunning: the reservation is gone.
        assert_eq!(fx.manager.start(&id).await.unwrap_err().code(), "spawn_failed");
    }

    #[tokio::test]
    async fn unknown_profile_is_not_found() {
        let fx = fixture(ECHO_UNTIL_STOP).await;
        let err = fx.manager.start(&ProfileId::from("missing")).await.unwrap_err();
        assert!(matches!(err, ManagerError::NotFound(_)));
    }

    #[tokio::test]
    async fn delete_requires_a_stopped_server() {
        let fx = fixture(ECHO_UNTIL_STOP).await;
        let id = fx.profile.id.clone();
        fx.manager.start(&id).await.unwrap();

        let err = fx.manager.delete(&id, true).await.unwrap_err();
        assert!(matches!(err, ManagerError::PreconditionFailed(_)));

        fx.manager.stop(&id).await.unwrap();
        fx.manager.delete(&id, true).await.unwrap();
        assert!(!fx.profile.root_path.exists());
    }

    #[tokio::test]
    async fn unusable_cached_runtime_is_replaced_by_installed_one() {
        let fx = fixture(ECHO_UNTIL_STOP).await;
        let id = fx.profile.id.clone();
        let stale = fx._tmp.path().join("gone/bin/java");
        fx.store
            .update(
                &id,
                ProfilePatch {
                    runtime_java_path: Some(stale),
                    ..ProfilePatch::default()
                },
            )
            .await
            .unwrap();

        let install_dir = AgentConfig::new(fx._tmp.path()).runtime_paths().install_dir;
        std::fs::create_dir_all(install_dir.join("bin")).unwrap();
        let installed = install_dir.join("bin").join("java");
        write_script(&installed, "#!/bin/sh\necho \"exec=$0\"\nexit 0\n", 0o755);

        let mut logs = fx.manager.subscribe_logs();
        fx.manager.start(&id).await.unwrap();
        let lines = lines_until(&mut logs, "Server stopped").await;
        assert!(lines.contains(&format!("exec={}", installed.display())));

        let p = fx.store.get(&id).await.unwrap();
        assert_eq!(p.runtime_java_path, Some(installed));
        assert_eq!(p.status, ServerStatus::Stopped);
    }

    /// Delegates to a JSON store but refuses status writes for one id.
    struct StatusRejectingStore {
        inner: Arc<JsonProfileStore>,
        reject: ProfileId,
    }

    #[async_trait::async_trait]
    impl ProfileStore for StatusRejectingStore {
        async fn get(&self, id: &ProfileId) -> Result<ServerProfile> {
            self.inner.get(id).await
        }

        async fn update(&self, id: &ProfileId, patch: ProfilePatch) -> Result<ServerProfile> {
            if id == &self.reject && patch.status.is_some() {
                return Err(ManagerError::Io(std::io::Error::other("disk full")));
            }
            self.inner.update(id, patch).await
        }

        async fn list(&self) -> Result<Vec<ServerProfile>> {
            self.inner.list().await
        }

        async fn delete(&self, id: &ProfileId, delete_files: bool) -> Result<()> {
            self.inner.delete(id, delete_files).await
        }
    }

    #[tokio::test]
    async fn reconcile_skips_profiles_that_fail_to_persist() {
        let fx = fixture(ECHO_UNTIL_STOP).await;
        let other = fx
            .store
            .create(NewProfile {
                display_name: "Other".to_string(),
                core_type: CoreType::Paper,
                mc_version: "1.21.1".to_string(),
            })
            .await
            .unwrap();
        for id in [&fx.profile.id, &other.id] {
            fx.store.set_status(id, ServerStatus::Running).await.unwrap();
        }

        let cfg = AgentConfig::new(fx._tmp.path());
        let store = Arc::new(StatusRejectingStore {
            inner: fx.store.clone(),
            reject: fx.profile.id.clone(),
        });
        let runtime = Arc::new(JavaRuntime::new(&cfg).unwrap());
        let manager = ServerManager::new(store, runtime, &cfg);

        assert_eq!(manager.reconcile().await.unwrap(), 1);
        assert_eq!(fx.store.get(&other.id).await.unwrap().status, ServerStatus::Stopped);
        assert_eq!(fx.store.get(&fx.profile.id).await.unwrap().status, ServerStatus::Running);
    }

    #[tokio::test]
    async fn list_overlays_live_status_and_reconcile_resets_stale() {
        let fx = fixture(ECHO_UNTIL_STOP).await;
        let id = fx.profile.id.clone();

        fx.store.set_status(&id, ServerStatus::Running).await.unwrap();
        let listed = fx.manager.list().await.unwrap();
        assert_eq!(listed[0].status, ServerStatus::Stopped);

        assert_eq!(fx.manager.reconcile().await.unwrap(), 1);
        assert_eq!(fx.store.get(&id).await.unwrap().status, ServerStatus::Stopped);
        assert_eq!(fx.manager.reconcile().await.unwrap(), 0);

        fx.manager.start(&id).await.unwrap();
        assert_eq!(fx.manager.list().await.unwrap()[0].status, ServerStatus::Running);
        assert_eq!(fx.manager.reconcile().await.unwrap(), 0);

        fx.manager.stop_all().await;
        assert_eq!(fx.manager.status(&id).await, ServerStatus::Stopped);
        assert_eq!(fx.store.get(&id).await.unwrap().status, ServerStatus::Stopped);
    }
}
