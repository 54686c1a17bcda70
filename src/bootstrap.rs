// Bootstrap
//
// Drives fresh machines from "launched" to "reachable as root over SSH".
// Provider-specific steps (waiting for the running state, resolving the
// address) live in the backends; the shared SSH wait and root fix-up live
// here.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::TimingConfig;
use crate::error::{Error, Result};
use crate::exec::{RemoteExec, SshTarget};
use crate::fanout::{fan_out, DEFAULT_PARALLELISM};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapState {
    Launching,
    WaitingForRunningState,
    WaitingForAddress,
    WaitingForSsh,
    PostBootFix,
    Ready,
}

impl fmt::Display for BootstrapState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Launching => "launching",
            Self::WaitingForRunningState => "waiting-for-running",
            Self::WaitingForAddress => "waiting-for-address",
            Self::WaitingForSsh => "waiting-for-ssh",
            Self::PostBootFix => "post-boot-fix",
            Self::Ready => "ready",
        };
        f.write_str(s)
    }
}

/// Log a state change for one node
pub fn transition(cluster: &str, node: u32, state: BootstrapState) {
    debug!(cluster, node, state = %state, "bootstrap transition");
}

/// Commands that let root log in with the login user's key
pub fn post_boot_steps(login_user: &str) -> Vec<String> {
    vec![
        "sudo mkdir -p /root/.ssh".to_string(),
        "sudo chown root:root /root/.ssh".to_string(),
        "sudo chmod 750 /root/.ssh".to_string(),
        format!("sudo cp /home/{}/.ssh/authorized_keys /root/.ssh/", login_user),
        "sudo chmod 640 /root/.ssh/authorized_keys".to_string(),
    ]
}

/// Sleep unless cancelled first
pub async fn sleep_or_cancel(
    duration: Duration,
    cancel: &CancellationToken,
    what: &str,
) -> Result<()> {
    tokio::select! {
        _ = cancel.cancelled() => Err(Error::Cancelled(what.to_string())),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}

/// Call `probe` until it yields a value, at most `attempts` times,
/// `interval` apart. `Ok(None)` means the attempts ran out.
pub async fn poll_attempts<T, F, Fut>(
    attempts: u32,
    interval: Duration,
    cancel: &CancellationToken,
    what: &str,
    mut probe: F,
) -> Result<Option<T>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
{
    for attempt in 1..=attempts {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled(what.to_string()));
        }
        if let Some(value) = probe().await? {
            return Ok(Some(value));
        }
        if attempt < attempts {
            sleep_or_cancel(interval, cancel, what).await?;
        }
    }
    Ok(None)
}

/// One node waiting for SSH
#[derive(Debug, Clone)]
pub struct SshWaitTarget {
    pub node: u32,
    pub target: SshTarget,
}

pub struct Bootstrapper {
    remote: Arc<dyn RemoteExec>,
    budget: Duration,
    poll_interval: Duration,
    parallelism: usize,
}

impl Bootstrapper {
    pub fn new(remote: Arc<dyn RemoteExec>, timing: &TimingConfig) -> Self {
        Self {
            remote,
            budget: timing.ssh_budget(),
            poll_interval: timing.ssh_poll_interval(),
            parallelism: DEFAULT_PARALLELISM,
        }
    }

    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }

    /// Poll `ls` on every target until all answer. One deadline covers the
    /// whole batch.
    pub async fn wait_for_ssh(
        &self,
        cluster: &str,
        targets: &[SshWaitTarget],
        cancel: &CancellationToken,
    ) -> Result<()> {
        let deadline = Instant::now() + self.budget;
        let mut pending: Vec<SshWaitTarget> = targets.to_vec();
        let mut ready: Vec<u32> = Vec::new();

        for t in &pending {
            transition(cluster, t.node, BootstrapState::WaitingForSsh);
        }

        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled(format!("ssh wait for cluster {}", cluster)));
            }

            let nodes: Vec<u32> = pending.iter().map(|t| t.node).collect();
            let results = fan_out(&nodes, self.parallelism, |node| {
                let remote = Arc::clone(&self.remote);
                let target = pending
                    .iter()
                    .find(|t| t.node == node)
                    .map(|t| t.target.clone());
                async move {
                    match target {
                        Some(target) => remote.exec(&target, "ls").await.map(|_| ()),
                        None => Err(Error::not_found(format!("node {}", node))),
                    }
                }
            })
            .await;

            let mut still_pending = Vec::new();
            for (wait, outcome) in pending.into_iter().zip(results) {
                match outcome.result {
                    Ok(()) => ready.push(wait.node),
                    Err(e) => {
                        debug!(cluster, node = wait.node, error = %e, "ssh not ready");
                        still_pending.push(wait);
                    }
                }
            }
            pending = still_pending;

            if pending.is_empty() {
                info!(cluster, nodes = ready.len(), "all nodes reachable over ssh");
                return Ok(());
            }

            let now = Instant::now();
            if now >= deadline {
                ready.sort_unstable();
                let mut not_ready: Vec<u32> = pending.iter().map(|t| t.node).collect();
                not_ready.sort_unstable();
                warn!(cluster, ?not_ready, "ssh wait budget exhausted");
                return Err(Error::BootstrapTimeout {
                    cluster: cluster.to_string(),
                    ready,
                    not_ready,
                    budget_secs: self.budget.as_secs(),
                });
            }

            let pause = self.poll_interval.min(deadline - now);
            sleep_or_cancel(pause, cancel, "ssh wait").await?;
        }
    }

    /// Make root reachable with the login user's key. Each step gets one
    /// retry.
    pub async fn post_boot_fix(
        &self,
        cluster: &str,
        node: u32,
        login: &SshTarget,
        cancel: &CancellationToken,
    ) -> Result<()> {
        transition(cluster, node, BootstrapState::PostBootFix);
        for step in post_boot_steps(&login.user) {
            if let Err(first) = self.remote.exec(login, &step).await {
                warn!(cluster, node, step = %step, error = %first, "post-boot step failed, retrying");
                sleep_or_cancel(self.poll_interval, cancel, "post-boot fix").await?;
                self.remote.exec(login, &step).await?;
            }
        }
        transition(cluster, node, BootstrapState::Ready);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeRemote;
    use std::path::Path;

    fn bootstrapper(remote: Arc<FakeRemote>, budget: Duration) -> Bootstrapper {
        let timing = TimingConfig {
            ssh_poll_interval_ms: 5,
            ..TimingConfig::default()
        };
        let mut b = Bootstrapper::new(remote, &timing);
        b.budget = budget;
        b
    }

    fn wait_target(node: u32, host: &str) -> SshWaitTarget {
        SshWaitTarget {
            node,
            target: SshTarget::new("root", host, Path::new("/keys/k")),
        }
    }

    #[tokio::test]
    async fn test_ssh_wait_succeeds_when_all_reachable() {
        let remote = Arc::new(FakeRemote::new());
        let b = bootstrapper(remote.clone(), Duration::from_secs(5));
        let targets = vec![wait_target(1, "10.0.0.1"), wait_target(2, "10.0.0.2")];

        b.wait_for_ssh("mydc", &targets, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(remote.commands_on("10.0.0.1"), vec!["ls"]);
        assert_eq!(remote.commands_on("10.0.0.2"), vec!["ls"]);
    }

    #[tokio::test]
    async fn test_ssh_wait_times_out_naming_stuck_node() {
        let remote = Arc::new(FakeRemote::new());
        remote.set_unreachable("10.0.0.2");
        let b = bootstrapper(remote.clone(), Duration::from_millis(40));
        let targets = vec![wait_target(1, "10.0.0.1"), wait_target(2, "10.0.0.2")];

        let err = b
            .wait_for_ssh("mydc", &targets, &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            Error::BootstrapTimeout { ready, not_ready, cluster, .. } => {
                assert_eq!(cluster, "mydc");
                assert_eq!(ready, vec![1]);
                assert_eq!(not_ready, vec![2]);
            }
            other => panic!("unexpected error: {}", other),
        }
        // Reachable nodes are not polled again
        assert_eq!(remote.commands_on("10.0.0.1").len(), 1);
        assert!(remote.commands_on("10.0.0.2").len() > 1);
    }

    #[tokio::test]
    async fn test_ssh_wait_recovers_when_node_comes_up() {
        let remote = Arc::new(FakeRemote::new());
        remote.flake_command("ls", 2);
        let b = bootstrapper(remote.clone(), Duration::from_secs(5));

        b.wait_for_ssh("mydc", &[wait_target(1, "10.0.0.1")], &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(remote.commands_on("10.0.0.1").len(), 3);
    }

    #[tokio::test]
    async fn test_ssh_wait_observes_cancellation() {
        let remote = Arc::new(FakeRemote::new());
        remote.set_unreachable("10.0.0.1");
        let b = bootstrapper(remote, Duration::from_secs(60));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = b
            .wait_for_ssh("mydc", &[wait_target(1, "10.0.0.1")], &cancel)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn test_post_boot_fix_retries_each_step_once() {
        let remote = Arc::new(FakeRemote::new());
        remote.flake_command("chmod 750", 1);
        let b = bootstrapper(remote.clone(), Duration::from_secs(5));
        let login = SshTarget::new("ubuntu", "10.0.0.1", Path::new("/keys/k"));

        b.post_boot_fix("mydc", 1, &login, &CancellationToken::new())
            .await
            .unwrap();

        let commands = remote.commands_on("10.0.0.1");
        assert_eq!(commands.len(), 6);
        assert_eq!(commands[2], "sudo chmod 750 /root/.ssh");
        assert_eq!(commands[3], "sudo chmod 750 /root/.ssh");
        assert_eq!(
            commands[4],
            "sudo cp /home/ubuntu/.ssh/authorized_keys /root/.ssh/"
        );
    }

    #[tokio::test]
    async fn test_post_boot_fix_aborts_after_second_failure() {
        let remote = Arc::new(FakeRemote::new());
        remote.fail_command("10.0.0.1", "chown");
        let b = bootstrapper(remote.clone(), Duration::from_secs(5));
        let login = SshTarget::new("ubuntu", "10.0.0.1", Path::new("/keys/k"));

        let err = b
            .post_boot_fix("mydc", 1, &login, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Exec { .. }));
        // mkdir, chown, chown retry; nothing after
        assert_eq!(remote.commands_on("10.0.0.1").len(), 3);
    }

    #[tokio::test]
    async fn test_poll_attempts_gives_up() {
        let cancel = CancellationToken::new();
        let mut calls = 0;
        let found: Option<u32> = poll_attempts(3, Duration::from_millis(1), &cancel, "ip", || {
            calls += 1;
            async { Ok(None) }
        })
        .await
        .unwrap();
        assert!(found.is_none());
        assert_eq!(calls, 3);

        let found = poll_attempts(3, Duration::from_millis(1), &cancel, "ip", || async {
            Ok(Some("10.0.3.4"))
        })
        .await
        .unwrap();
        assert_eq!(found, Some("10.0.3.4"));
    }
}
