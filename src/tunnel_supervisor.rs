use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio::time;

use crate::config::JumpHostConfig;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Idle,
    Starting,
    Running,
    Exited,
    Stopped,
}

// Keeps an SSH local-forward child process alive for one upstream whose
// endpoint is localhost:local_port, forwarding it to
// target_server.host:target_server.port via sshd.host:sshd.port.
pub struct TunnelSupervisor {
    jump_host: Arc<JumpHostConfig>,
    local_port: u16,
    state: Arc<Mutex<TunnelState>>,
    shutdown: Arc<AtomicBool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl TunnelSupervisor {
    pub fn new(jump_host: Arc<JumpHostConfig>, local_port: u16) -> Self {
        Self {
            jump_host,
            local_port,
            state: Arc::new(Mutex::new(TunnelState::Idle)),
            shutdown: Arc::new(AtomicBool::new(false)),
            task: Mutex::new(None),
        }
    }

    pub fn state(&self) -> TunnelState {
        *self.state.lock()
    }

    // Spawns the background respawn loop. Never blocks the caller, the
    // dispatcher must not wait on tunnel connectivity. The child is
    // built with kill_on_drop(true), so aborting this task (on
    // shutdown()) kills whatever ssh process is currently running.
    pub fn start(&self) {
        let jump_host = Arc::clone(&self.jump_host);
        let local_port = self.local_port;
        let state = Arc::clone(&self.state);
        let shutdown = Arc::clone(&self.shutdown);

        *state.lock() = TunnelState::Starting;

        let handle = tokio::spawn(async move {
            let mut backoff = INITIAL_BACKOFF;
            loop {
                if shutdown.load(Ordering::SeqCst) {
                    break;
                }

                let mut cmd = build_ssh_command(&jump_host, local_port);
                info!(
                    "starting jump-host tunnel: localhost:{} -> {} via {}",
                    local_port, jump_host.target_server, jump_host.sshd
                );

                match cmd.spawn() {
                    Ok(mut child) => {
                        *state.lock() = TunnelState::Running;
                        backoff = INITIAL_BACKOFF;

                        if let Some(stdout) = child.stdout.take() {
                            tokio::spawn(log_lines(stdout, local_port, "stdout"));
                        }
                        if let Some(stderr) = child.stderr.take() {
                            tokio::spawn(log_lines(stderr, local_port, "stderr"));
                        }

                        match child.wait().await {
                            Ok(status) => {
                                warn!("jump-host tunnel for port {} exited: {}", local_port, status);
                            }
                            Err(e) => {
                                error!("jump-host tunnel for port {} wait failed: {}", local_port, e);
                            }
                        }
                    }
                    Err(e) => {
                        error!("failed to spawn ssh for port {}: {}", local_port, e);
                    }
                }

                *state.lock() = TunnelState::Exited;
                if shutdown.load(Ordering::SeqCst) {
                    break;
                }

                warn!(
                    "respawning jump-host tunnel for port {} in {:?}",
                    local_port, backoff
                );
                time::sleep(backoff).await;
                backoff = std::cmp::min(backoff * 2, MAX_BACKOFF);
            }
        });

        *self.task.lock() = Some(handle);
    }

    // Stops future respawns and kills whatever child is currently
    // running by aborting the supervising task (its Child is dropped
    // with kill_on_drop(true) set). Transitions to the terminal Stopped
    // state; start() is not idempotent after this without constructing
    // a new supervisor.
    pub async fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            handle.abort();
        }
        *self.state.lock() = TunnelState::Stopped;
    }
}

async fn log_lines(pipe: impl tokio::io::AsyncRead + Unpin, local_port: u16, stream: &'static str) {
    let mut lines = BufReader::new(pipe).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!("[ssh:{} {}] {}", local_port, stream, line);
    }
}

// Assembles the ssh argv in a fixed, tested order.
fn build_ssh_command(jump_host: &JumpHostConfig, local_port: u16) -> Command {
    let binary = jump_host.ssh_binary.as_deref().unwrap_or("ssh");
    let mut cmd = Command::new(binary);

    if let Some(creds) = &jump_host.credentials_file {
        cmd.arg("-i").arg(creds);
    }

    cmd.arg("-n").arg("-N");

    let bind = if jump_host.open_all_interfaces {
        format!("*:{}", local_port)
    } else {
        local_port.to_string()
    };
    cmd.arg("-L").arg(format!(
        "{}:{}:{}",
        bind, jump_host.target_server.host, jump_host.target_server.port
    ));

    if let Some(user) = &jump_host.user {
        cmd.arg("-l").arg(user);
    }

    if jump_host.sshd.port != -1 {
        cmd.arg("-p").arg(jump_host.sshd.port.to_string());
    }

    if jump_host.compression {
        cmd.arg("-C");
    }

    if let Some(ciphers) = &jump_host.ciphers {
        cmd.arg("-c").arg(ciphers);
    }

    cmd.arg(&jump_host.sshd.host);
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);
    cmd
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::Endpoint;

    fn jump_host() -> JumpHostConfig {
        JumpHostConfig {
            sshd: Endpoint::new("bastion.example.com", 2222),
            target_server: Endpoint::new("internal.example.com", 80),
            user: Some("deploy".to_string()),
            credentials_file: Some("/key".into()),
            compression: true,
            ciphers: Some("aes256-ctr".to_string()),
            ssh_binary: None,
            open_all_interfaces: false,
        }
    }

    fn args_of(cmd: &Command) -> Vec<String> {
        cmd.as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn command_order_is_fixed() {
        let jh = jump_host();
        let cmd = build_ssh_command(&jh, 9000);
        let args = args_of(&cmd);
        assert_eq!(
            args,
            vec![
                "-i",
                "/key",
                "-n",
                "-N",
                "-L",
                "9000:internal.example.com:80",
                "-l",
                "deploy",
                "-p",
                "2222",
                "-C",
                "-c",
                "aes256-ctr",
                "bastion.example.com",
            ]
        );
    }

    #[test]
    fn open_all_interfaces_binds_star() {
        let mut jh = jump_host();
        jh.open_all_interfaces = true;
        let cmd = build_ssh_command(&jh, 9000);
        let args = args_of(&cmd);
        assert!(args.contains(&"*:9000:internal.example.com:80".to_string()));
    }

    #[test]
    fn default_sshd_port_omits_dash_p() {
        let mut jh = jump_host();
        jh.sshd.port = -1;
        let cmd = build_ssh_command(&jh, 9000);
        let args = args_of(&cmd);
        assert!(!args.contains(&"-p".to_string()));
    }

    #[tokio::test]
    async fn new_supervisor_starts_idle() {
        let sup = TunnelSupervisor::new(Arc::new(jump_host()), 9000);
        assert_eq!(sup.state(), TunnelState::Idle);
    }
}
