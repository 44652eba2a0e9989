use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use thiserror::Error;
use tracing::{debug, warn};

/// How often a running command is polled for completion, timeout and cancellation.
const POLL_INTERVAL: Duration = Duration::from_millis(50);
/// Upper bound for exporting the pristine source tree out of an image.
const EXPORT_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Error, Debug)]
pub enum EnvironmentError {
    #[error("Failed to spawn command '{command}': {reason}")]
    Spawn { command: String, reason: String },

    #[error("Environment I/O error: {0}")]
    Io(String),

    #[error("Failed to export program source: {0}")]
    Export(String),
}

impl From<std::io::Error> for EnvironmentError {
    fn from(err: std::io::Error) -> Self {
        EnvironmentError::Io(err.to_string())
    }
}

/// Cooperative cancellation flag.
///
/// Child tokens observe their own flag and every ancestor's, so cancelling a
/// parent stops all work derived from it while a child can be cancelled alone.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    ancestors: Vec<Arc<AtomicBool>>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn child(&self) -> Self {
        let mut ancestors = self.ancestors.clone();
        ancestors.push(Arc::clone(&self.flag));
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            ancestors,
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst) || self.ancestors.iter().any(|a| a.load(Ordering::SeqCst))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandStatus {
    Exited(i32),
    /// Terminated by a signal (no exit code).
    Signaled,
    TimedOut,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub status: CommandStatus,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == CommandStatus::Exited(0)
    }
}

fn spawn_reader<R: Read + Send + 'static>(source: Option<R>) -> Option<JoinHandle<Vec<u8>>> {
    source.map(|mut stream| {
        std::thread::spawn(move || {
            let mut buffer = Vec::new();
            let _ = stream.read_to_end(&mut buffer);
            buffer
        })
    })
}

fn collect_reader(handle: Option<JoinHandle<Vec<u8>>>) -> String {
    handle
        .and_then(|h| h.join().ok())
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .unwrap_or_default()
}

/// Kills the child and everything in its process group.
fn kill_tree(child: &mut Child) {
    #[cfg(unix)]
    {
        let group = format!("-{}", child.id());
        let _ = Command::new("kill")
            .args(["-KILL", "--", &group])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
    }
    if let Err(e) = child.kill() {
        debug!("kill after group kill reported: {e}");
    }
    let _ = child.wait();
}

/// Runs `command` to completion, killing it when `timeout` elapses or
/// `cancel` fires. Stdout and stderr are captured in full.
pub fn run_with_timeout(
    mut command: Command,
    timeout: Duration,
    cancel: &CancelToken,
) -> Result<CommandOutput, EnvironmentError> {
    let description = format!("{command:?}");
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        command.process_group(0);
    }

    let start_time = Instant::now();
    let mut child = command.spawn().map_err(|e| EnvironmentError::Spawn {
        command: description.clone(),
        reason: e.to_string(),
    })?;
    let stdout = spawn_reader(child.stdout.take());
    let stderr = spawn_reader(child.stderr.take());

    let status = loop {
        match child.try_wait() {
            Ok(Some(exit)) => break exit.code().map_or(CommandStatus::Signaled, CommandStatus::Exited),
            Ok(None) => {
                if cancel.is_cancelled() {
                    debug!("cancelling {description}");
                    kill_tree(&mut child);
                    break CommandStatus::Cancelled;
                }
                if start_time.elapsed() > timeout {
                    debug!("{description} timed out after {timeout:?}, killing");
                    kill_tree(&mut child);
                    break CommandStatus::TimedOut;
                }
                std::thread::sleep(POLL_INTERVAL);
            }
            Err(e) => {
                kill_tree(&mut child);
                return Err(EnvironmentError::Io(format!(
                    "Error waiting for {description}: {e}"
                )));
            }
        }
    };

    Ok(CommandOutput {
        status,
        stdout: collect_reader(stdout),
        stderr: collect_reader(stderr),
        duration: start_time.elapsed(),
    })
}

/// An isolated place where the program is built and exercised.
pub trait Environment: Send + Sync {
    fn name(&self) -> &'static str;

    /// Runs a shell command against the source tree at `workdir`.
    fn execute(
        &self,
        command: &str,
        workdir: &Path,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<CommandOutput, EnvironmentError>;

    /// Copies the unmodified program source into `destination` (an existing, empty directory).
    fn export_source(&self, destination: &Path) -> Result<(), EnvironmentError>;
}

/// Runs commands with `/bin/sh` on the host, inside the scratch tree.
#[derive(Debug, Clone)]
pub struct HostEnvironment {
    source_directory: PathBuf,
}

impl HostEnvironment {
    pub fn new(source_directory: PathBuf) -> Self {
        Self { source_directory }
    }
}

impl Environment for HostEnvironment {
    fn name(&self) -> &'static str {
        "host"
    }

    fn execute(
        &self,
        command: &str,
        workdir: &Path,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<CommandOutput, EnvironmentError> {
        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c").arg(command).current_dir(workdir);
        run_with_timeout(cmd, timeout, cancel)
    }

    fn export_source(&self, destination: &Path) -> Result<(), EnvironmentError> {
        if !self.source_directory.is_dir() {
            return Err(EnvironmentError::Export(format!(
                "source directory {:?} does not exist",
                self.source_directory
            )));
        }
        copy_tree(&self.source_directory, destination)
    }
}

/// Runs commands in throwaway containers of a program image, with the
/// scratch tree bind-mounted over the image's source directory.
#[derive(Debug)]
pub struct ContainerEnvironment {
    image: String,
    source_directory: String,
    launched: AtomicU64,
}

impl ContainerEnvironment {
    pub fn new(image: String, source_directory: String) -> Self {
        Self {
            image,
            source_directory,
            launched: AtomicU64::new(0),
        }
    }

    fn unique_name(&self) -> String {
        let n = self.launched.fetch_add(1, Ordering::Relaxed);
        format!("mender-{}-{n}", std::process::id())
    }

    fn remove_container(name: &str) {
        let mut cmd = Command::new("docker");
        cmd.args(["rm", "-f", name]);
        if let Err(e) = run_with_timeout(cmd, Duration::from_secs(30), &CancelToken::new()) {
            warn!("failed to remove container {name}: {e}");
        }
    }
}

impl Environment for ContainerEnvironment {
    fn name(&self) -> &'static str {
        "container"
    }

    fn execute(
        &self,
        command: &str,
        workdir: &Path,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<CommandOutput, EnvironmentError> {
        let name = self.unique_name();
        let mount = format!("{}:{}", workdir.display(), self.source_directory);
        let mut cmd = Command::new("docker");
        cmd.args([
            "run",
            "--rm",
            "--init",
            "--name",
            &name,
            "-v",
            &mount,
            "-w",
            &self.source_directory,
            &self.image,
            "/bin/sh",
            "-c",
            command,
        ]);
        let output = run_with_timeout(cmd, timeout, cancel)?;
        if matches!(
            output.status,
            CommandStatus::TimedOut | CommandStatus::Cancelled
        ) {
            Self::remove_container(&name);
        }
        Ok(output)
    }

    fn export_source(&self, destination: &Path) -> Result<(), EnvironmentError> {
        let never = CancelToken::new();
        let name = self.unique_name();

        let mut create = Command::new("docker");
        create.args(["create", "--name", &name, &self.image]);
        let created = run_with_timeout(create, EXPORT_TIMEOUT, &never)?;
        if !created.success() {
            return Err(EnvironmentError::Export(format!(
                "docker create {} failed: {}",
                self.image,
                created.stderr.trim()
            )));
        }

        let mut copy = Command::new("docker");
        copy.arg("cp")
            .arg(format!("{name}:{}/.", self.source_directory))
            .arg(destination);
        let copied = run_with_timeout(copy, EXPORT_TIMEOUT, &never);
        Self::remove_container(&name);

        let copied = copied?;
        if !copied.success() {
            return Err(EnvironmentError::Export(format!(
                "docker cp from {} failed: {}",
                self.image,
                copied.stderr.trim()
            )));
        }
        Ok(())
    }
}

/// Recursively copies the contents of `from` into `to`, preserving symlinks.
pub fn copy_tree(from: &Path, to: &Path) -> Result<(), EnvironmentError> {
    std::fs::create_dir_all(to)?;
    for entry in std::fs::read_dir(from)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let target = to.join(entry.file_name());
        if file_type.is_dir() {
            copy_tree(&entry.path(), &target)?;
        } else if file_type.is_symlink() {
            #[cfg(unix)]
            std::os::unix::fs::symlink(std::fs::read_link(entry.path())?, &target)?;
            #[cfg(not(unix))]
            std::fs::copy(entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Scratch copies of the program source, one per slot.
///
/// The pristine export is never modified; each slot starts as a copy of it and
/// must be returned to that state (see [`ScratchArena::restore_file`]) after
/// every candidate, so that no candidate observes another's edits.
#[derive(Debug)]
pub struct ScratchArena {
    pristine: TempDir,
    slots: Vec<TempDir>,
}

impl ScratchArena {
    pub fn new(env: &dyn Environment) -> Result<Self, EnvironmentError> {
        let pristine = tempfile::Builder::new().prefix("mender-pristine-").tempdir()?;
        env.export_source(pristine.path())?;
        debug!("exported program source to {:?}", pristine.path());
        Ok(Self {
            pristine,
            slots: Vec::new(),
        })
    }

    /// Adds a fresh copy of the pristine tree and returns its slot index.
    pub fn add_slot(&mut self) -> Result<usize, EnvironmentError> {
        let slot = tempfile::Builder::new().prefix("mender-slot-").tempdir()?;
        copy_tree(self.pristine.path(), slot.path())?;
        self.slots.push(slot);
        Ok(self.slots.len() - 1)
    }

    pub fn pristine(&self) -> &Path {
        self.pristine.path()
    }

    pub fn slot(&self, index: usize) -> Option<&Path> {
        self.slots.get(index).map(TempDir::path)
    }

    pub fn read_pristine(&self, relative: &str) -> Result<String, EnvironmentError> {
        Ok(std::fs::read_to_string(self.pristine.path().join(relative))?)
    }

    pub fn write_file(&self, slot: usize, relative: &str, content: &str) -> Result<(), EnvironmentError> {
        let root = self
            .slot(slot)
            .ok_or_else(|| EnvironmentError::Io(format!("no scratch slot {slot}")))?;
        std::fs::write(root.join(relative), content)?;
        Ok(())
    }

    pub fn restore_file(&self, slot: usize, relative: &str) -> Result<(), EnvironmentError> {
        let root = self
            .slot(slot)
            .ok_or_else(|| EnvironmentError::Io(format!("no scratch slot {slot}")))?;
        std::fs::copy(self.pristine.path().join(relative), root.join(relative))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host(dir: &Path) -> HostEnvironment {
        HostEnvironment::new(dir.to_path_buf())
    }

    #[test]
    fn host_execute_captures_output_and_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let env = host(dir.path());
        let output = env
            .execute(
                "echo out; echo err >&2; exit 3",
                dir.path(),
                Duration::from_secs(5),
                &CancelToken::new(),
            )
            .unwrap();
        assert_eq!(output.status, CommandStatus::Exited(3));
        assert_eq!(output.stdout.trim(), "out");
        assert_eq!(output.stderr.trim(), "err");
        assert!(!output.success());
    }

    #[test]
    fn host_execute_runs_in_workdir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("marker"), "x").unwrap();
        let env = host(dir.path());
        let output = env
            .execute("test -f marker", dir.path(), Duration::from_secs(5), &CancelToken::new())
            .unwrap();
        assert!(output.success());
    }

    #[test]
    fn execute_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let env = host(dir.path());
        let start = Instant::now();
        let output = env
            .execute("sleep 5", dir.path(), Duration::from_millis(100), &CancelToken::new())
            .unwrap();
        assert_eq!(output.status, CommandStatus::TimedOut);
        assert!(start.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn execute_observes_cancellation_of_an_ancestor() {
        let dir = tempfile::tempdir().unwrap();
        let env = host(dir.path());
        let parent = CancelToken::new();
        let child = parent.child();
        parent.cancel();
        let output = env
            .execute("sleep 5", dir.path(), Duration::from_secs(10), &child)
            .unwrap();
        assert_eq!(output.status, CommandStatus::Cancelled);
    }

    #[test]
    fn cancelling_a_child_leaves_the_parent_alone() {
        let parent = CancelToken::new();
        let child = parent.child();
        child.cancel();
        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());
    }

    #[test]
    fn arena_slots_are_isolated_and_restorable() {
        let source = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(source.path().join("src")).unwrap();
        std::fs::write(source.path().join("src/main.c"), "int main() { return 0; }\n").unwrap();

        let env = host(source.path());
        let mut arena = ScratchArena::new(&env).unwrap();
        let a = arena.add_slot().unwrap();
        let b = arena.add_slot().unwrap();
        assert_eq!((a, b), (0, 1));
        assert!(arena.slot(2).is_none());

        arena.write_file(a, "src/main.c", "broken").unwrap();
        let in_b = std::fs::read_to_string(arena.slot(b).unwrap().join("src/main.c")).unwrap();
        assert_eq!(in_b, "int main() { return 0; }\n");
        assert_eq!(
            arena.read_pristine("src/main.c").unwrap(),
            "int main() { return 0; }\n"
        );

        arena.restore_file(a, "src/main.c").unwrap();
        let in_a = std::fs::read_to_string(arena.slot(a).unwrap().join("src/main.c")).unwrap();
        assert_eq!(in_a, "int main() { return 0; }\n");
    }

    #[test]
    fn export_of_missing_host_directory_fails() {
        let env = HostEnvironment::new(PathBuf::from("/this/path/does/not/exist/12345"));
        assert!(matches!(
            ScratchArena::new(&env),
            Err(EnvironmentError::Export(_))
        ));
    }
}
