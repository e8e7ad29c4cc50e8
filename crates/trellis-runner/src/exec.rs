//! `exec` runtime: runners as external OS processes
//!
//! Each process is spawned in its own process group so that signals reach any
//! children it forks. The serialized [`RunnerInfo`] is written to its stdin
//! followed by a newline. A runner declaring an `api` endpoint is not
//! considered started until that endpoint accepts connections.

use crate::info::RunnerInfo;
use crate::runtype::TypeHandler;
use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use trellis_bridge::{wait_for_endpoint, Endpoint, ReverseProxy};
use trellis_config::Config;
use trellis_core::{Error, Result, SharedHandler};

/// A spawned runner process
#[derive(Debug)]
pub struct ExecProcess {
    id: String,
    pgid: Pid,
    stopping: AtomicBool,
    exited: watch::Receiver<Option<ExitStatus>>,
    last_error: Mutex<Option<String>>,
}

impl ExecProcess {
    async fn spawn(info: &RunnerInfo, cmd: &[String]) -> Result<Arc<Self>> {
        let id = info.id();

        let mut command = Command::new(&cmd[0]);
        command
            .args(&cmd[1..])
            .current_dir(&info.plugin_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .process_group(0);

        let mut child = command.spawn().map_err(|e| Error::spawn(&id, e))?;
        let pid = child
            .id()
            .ok_or_else(|| Error::spawn(&id, "process exited before it was tracked"))?;
        let stdin = child.stdin.take();

        let (tx, rx) = watch::channel(None);
        let process = Arc::new(Self {
            id: id.clone(),
            pgid: Pid::from_raw(pid as i32),
            stopping: AtomicBool::new(false),
            exited: rx,
            last_error: Mutex::new(None),
        });

        // the only task that reaps the child and completes the exit signal
        tokio::spawn({
            let process = Arc::clone(&process);
            async move {
                let status = match child.wait().await {
                    Ok(status) => status,
                    Err(e) => {
                        error!(runner = %process.id, error = %e, "Failed to wait on process");
                        *process.last_error.lock() = Some(e.to_string());
                        // status unknown, reported as exit code 1
                        ExitStatus::from_raw(1 << 8)
                    }
                };

                if process.stopping.load(Ordering::SeqCst) {
                    debug!(runner = %process.id, status = %status, "Process stopped");
                } else if status.success() {
                    info!(runner = %process.id, "Process exited");
                } else {
                    warn!(runner = %process.id, status = %status, "Process exited unexpectedly");
                    *process.last_error.lock() = Some(format!("exited with {status}"));
                }
                tx.send_replace(Some(status));
            }
        });

        let mut line = serde_json::to_vec(info)?;
        line.push(b'\n');
        let written = match stdin {
            Some(mut stdin) => match stdin.write_all(&line).await {
                Ok(()) => stdin.shutdown().await,
                Err(e) => Err(e),
            },
            None => Ok(()),
        };
        if let Err(e) = written {
            process.kill();
            process.wait().await;
            return Err(Error::spawn(&id, format!("failed to write runner info: {e}")));
        }

        info!(runner = %id, pid, "Process started");
        Ok(process)
    }

    /// Wait for the process to exit
    pub async fn wait(&self) -> Option<ExitStatus> {
        let mut rx = self.exited.clone();
        let status = rx.wait_for(|s| s.is_some()).await.ok()?;
        *status
    }

    /// Exit signal, `Some` once the process has exited
    pub fn exited(&self) -> watch::Receiver<Option<ExitStatus>> {
        self.exited.clone()
    }

    /// Last error observed for this process
    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }

    fn signal(&self, signal: Signal) {
        match killpg(self.pgid, signal) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => warn!(runner = %self.id, signal = %signal, error = %e, "Failed to signal process group"),
        }
    }

    /// Send SIGKILL to the process group
    pub fn kill(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        self.signal(Signal::SIGKILL);
    }

    /// Interrupt the process group, killing it if it has not exited within
    /// `timeout`
    pub async fn stop(&self, timeout: Duration) {
        self.stopping.store(true, Ordering::SeqCst);
        self.signal(Signal::SIGINT);

        if tokio::time::timeout(timeout, self.wait()).await.is_err() {
            warn!(runner = %self.id, timeout = ?timeout, "Process did not stop in time, killing");
            self.signal(Signal::SIGKILL);
            self.wait().await;
        }
    }
}

/// Handler for `exec` runners
#[derive(Debug)]
pub struct ExecHandler {
    run_timeout: Duration,
    endpoint_timeout: Duration,
    verbose: bool,
    processes: Mutex<HashMap<String, Arc<ExecProcess>>>,
}

impl ExecHandler {
    /// Create a handler using the timeouts from `config`
    pub fn new(config: &Config) -> Self {
        Self {
            run_timeout: config.run_timeout,
            endpoint_timeout: config.endpoint_timeout,
            verbose: config.verbose,
            processes: Mutex::new(HashMap::new()),
        }
    }

    /// The live process for an api key
    pub fn process(&self, api_key: &str) -> Option<Arc<ExecProcess>> {
        self.processes.lock().get(api_key).cloned()
    }

    async fn launch(&self, info: &RunnerInfo) -> Result<(Arc<ExecProcess>, Option<SharedHandler>)> {
        let cmd = command(info)?;
        let api = match info.run.config.get("api") {
            None => None,
            Some(serde_json::Value::String(api)) => Some(api.clone()),
            Some(_) => {
                return Err(Error::config(format!("{}: api must be a string", info.id())));
            }
        };

        // proxy and endpoint are resolved before anything is spawned
        let target = match &api {
            Some(api) => Some((
                ReverseProxy::new(&info.data_dir, api)?.with_verbose(self.verbose),
                Endpoint::parse(&info.data_dir, api)?,
            )),
            None => None,
        };

        let process = ExecProcess::spawn(info, &cmd).await?;
        self.processes
            .lock()
            .insert(info.api_key.clone(), Arc::clone(&process));

        let Some((proxy, endpoint)) = target else {
            return Ok((process, None));
        };

        debug!(runner = %info.id(), endpoint = %endpoint, "Waiting for endpoint");
        if let Err(e) = wait_for_endpoint(&endpoint, self.endpoint_timeout, process.exited()).await
        {
            error!(runner = %info.id(), error = %e, "Runner endpoint never opened, killing");
            self.processes.lock().remove(&info.api_key);
            process.kill();
            process.wait().await;
            return Err(e);
        }

        Ok((process, Some(Arc::new(proxy) as SharedHandler)))
    }
}

fn command(info: &RunnerInfo) -> Result<Vec<String>> {
    let invalid = || Error::config(format!("{}: cmd must be a non-empty array of strings", info.id()));

    let cmd = info
        .run
        .config
        .get("cmd")
        .and_then(|c| c.as_array())
        .ok_or_else(invalid)?;
    let cmd = cmd
        .iter()
        .map(|c| c.as_str().map(str::to_string))
        .collect::<Option<Vec<_>>>()
        .ok_or_else(invalid)?;
    if cmd.is_empty() {
        return Err(invalid());
    }
    Ok(cmd)
}

#[async_trait]
impl TypeHandler for ExecHandler {
    async fn start(&self, info: Arc<RunnerInfo>) -> Result<Option<SharedHandler>> {
        let (_process, handler) = self.launch(&info).await?;
        Ok(handler)
    }

    async fn run(&self, info: Arc<RunnerInfo>) -> Result<()> {
        let (process, _handler) = self.launch(&info).await?;
        let status = process.wait().await;

        // only forget the process if a concurrent stop has not already
        let mut processes = self.processes.lock();
        if processes
            .get(&info.api_key)
            .is_some_and(|p| Arc::ptr_eq(p, &process))
        {
            processes.remove(&info.api_key);
        }
        drop(processes);

        match status {
            Some(status) if status.success() => Ok(()),
            Some(status) => Err(Error::ProcessExited(format!("{} exited with {status}", info.id()))),
            None => Err(Error::ProcessExited(format!("{} was lost", info.id()))),
        }
    }

    async fn stop(&self, api_key: &str) -> Result<()> {
        let Some(process) = self.processes.lock().remove(api_key) else {
            return Ok(());
        };
        process.stop(self.run_timeout).await;
        Ok(())
    }

    async fn kill(&self, api_key: &str) -> Result<()> {
        if let Some(process) = self.processes.lock().remove(api_key) {
            process.kill();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::signal::kill;
    use std::path::Path;
    use std::time::Instant;
    use trellis_config::RunConfig;

    fn handler(endpoint_timeout: Duration) -> ExecHandler {
        let config = Config {
            run_timeout: Duration::from_millis(300),
            endpoint_timeout,
            ..Default::default()
        };
        ExecHandler::new(&config)
    }

    fn info(dir: &Path, script: &str, api: Option<&str>) -> Arc<RunnerInfo> {
        let mut run = RunConfig::default();
        run.config.insert(
            "cmd".into(),
            serde_json::json!(["/bin/sh", "-c", script]),
        );
        if let Some(api) = api {
            run.config.insert("api".into(), api.into());
        }
        Arc::new(RunnerInfo {
            plugin: "test".into(),
            name: "proc".into(),
            api_key: crate::info::generate_api_key(),
            run,
            root_dir: dir.to_path_buf(),
            data_dir: dir.to_path_buf(),
            plugin_dir: dir.to_path_buf(),
            config: serde_json::Value::Null,
        })
    }

    async fn wait_for_file(path: &Path) -> String {
        for _ in 0..100 {
            if let Ok(s) = std::fs::read_to_string(path) {
                if s.ends_with('\n') {
                    return s;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("{} never written", path.display());
    }

    fn is_alive(pid: i32) -> bool {
        kill(Pid::from_raw(pid), None).is_ok()
    }

    #[tokio::test]
    async fn test_runner_info_on_stdin() {
        let dir = tempfile::tempdir().unwrap();
        let handler = handler(Duration::from_secs(5));
        let info = info(dir.path(), "read line; echo \"$line\" > info.json; exec sleep 30", None);

        assert!(handler.start(Arc::clone(&info)).await.unwrap().is_none());

        let written = wait_for_file(&dir.path().join("info.json")).await;
        let received: RunnerInfo = serde_json::from_str(written.trim()).unwrap();
        assert_eq!(received, *info);

        let process = handler.process(&info.api_key).unwrap();
        handler.stop(&info.api_key).await.unwrap();
        assert!(process.exited().borrow().is_some());
        assert!(handler.process(&info.api_key).is_none());
    }

    #[tokio::test]
    async fn test_stop_escalates_to_kill() {
        let dir = tempfile::tempdir().unwrap();
        let handler = handler(Duration::from_secs(5));
        let info = info(dir.path(), "trap '' INT; echo $$ > pid; sleep 30", None);

        handler.start(Arc::clone(&info)).await.unwrap();
        let pid: i32 = wait_for_file(&dir.path().join("pid")).await.trim().parse().unwrap();

        let started = Instant::now();
        handler.stop(&info.api_key).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(300));
        assert!(!is_alive(pid));
    }

    #[tokio::test]
    async fn test_endpoint_timeout_kills_process() {
        let dir = tempfile::tempdir().unwrap();
        let handler = handler(Duration::from_millis(500));
        let info = info(
            dir.path(),
            "echo $$ > pid; exec sleep 30",
            Some("unix://never.sock"),
        );

        let err = handler.start(Arc::clone(&info)).await.unwrap_err();
        assert!(matches!(err, Error::EndpointTimeout { .. }));

        let pid: i32 = wait_for_file(&dir.path().join("pid")).await.trim().parse().unwrap();
        assert!(!is_alive(pid));
        assert!(handler.process(&info.api_key).is_none());
    }

    #[tokio::test]
    async fn test_exit_before_endpoint_opens() {
        let dir = tempfile::tempdir().unwrap();
        let handler = handler(Duration::from_secs(30));
        let info = info(dir.path(), "exit 3", Some("unix://never.sock"));

        let started = Instant::now();
        let err = handler.start(info).await.unwrap_err();
        assert!(matches!(err, Error::ProcessExited(_)));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_ready_endpoint_returns_proxy() {
        let dir = tempfile::tempdir().unwrap();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let api = format!("http://{}", listener.local_addr().unwrap());

        let handler = handler(Duration::from_secs(5));
        let info = info(dir.path(), "exec sleep 30", Some(&api));

        assert!(handler.start(Arc::clone(&info)).await.unwrap().is_some());
        handler.kill(&info.api_key).await.unwrap();
    }

    #[tokio::test]
    async fn test_run_reports_exit_status() {
        let dir = tempfile::tempdir().unwrap();
        let handler = handler(Duration::from_secs(5));

        handler.run(info(dir.path(), "exit 0", None)).await.unwrap();

        let err = handler.run(info(dir.path(), "exit 2", None)).await.unwrap_err();
        assert!(matches!(err, Error::ProcessExited(_)));
    }

    #[tokio::test]
    async fn test_invalid_commands() {
        let dir = tempfile::tempdir().unwrap();
        let handler = handler(Duration::from_secs(5));

        let mut bad = (*info(dir.path(), "true", None)).clone();
        bad.run.config.insert("cmd".into(), serde_json::json!([]));
        assert!(matches!(
            handler.start(Arc::new(bad.clone())).await,
            Err(Error::Config(_))
        ));

        bad.run.config.insert("cmd".into(), serde_json::json!(["/nonexistent/binary"]));
        assert!(matches!(
            handler.start(Arc::new(bad)).await,
            Err(Error::ProcessSpawn { .. })
        ));
    }
}
