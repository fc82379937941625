//! Network discovery of a freshly provisioned host.
//!
//! Polls an authenticated SSH reachability probe against the host's
//! assigned address until it answers or the wait budget is exhausted.
//! Success registers the host in the SSH configuration so `ssh <name>`
//! works from then on.

use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::process::{Cmd, Runner};
use crate::sshconf::Registry;

/// One discovery attempt sequence for a provisioned host.
#[derive(Debug, Clone)]
pub struct DiscoverySpec {
    pub hostname: String,
    pub target_ip: String,
    pub user: String,
    pub key_path: PathBuf,
    pub poll_interval: Duration,
    pub max_wait: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Waiting,
    Reachable,
}

/// Poll until the host answers the SSH probe, then update its registry
/// entry.
///
/// The number of polls is `max(1, max_wait / poll_interval)`; the final
/// failed poll returns [`Error::UnreachableHost`] without sleeping again.
pub fn discover(runner: &dyn Runner, registry: &Registry, spec: &DiscoverySpec) -> Result<()> {
    log::info!(
        "waiting for host `{}` to come up at {}...",
        spec.hostname,
        spec.target_ip
    );

    let max_attempts = max_attempts(spec);
    let mut state = State::Waiting;

    for attempt in 1..=max_attempts {
        if probe(runner, spec)? {
            state = State::Reachable;
            log::info!(
                "host `{}` reachable on attempt {attempt}/{max_attempts}",
                spec.hostname
            );
            break;
        }
        if attempt < max_attempts {
            thread::sleep(spec.poll_interval);
        }
    }

    match state {
        State::Reachable => {
            registry.update_ssh_config(
                &spec.hostname,
                &spec.target_ip,
                &spec.user,
                &spec.key_path,
            )?;
            Ok(())
        }
        State::Waiting => Err(Error::UnreachableHost {
            hostname: spec.hostname.clone(),
            ip: spec.target_ip.clone(),
            waited: spec.max_wait,
        }),
    }
}

fn max_attempts(spec: &DiscoverySpec) -> u64 {
    let interval = spec.poll_interval.as_millis().max(1);
    (spec.max_wait.as_millis() / interval).max(1) as u64
}

/// One non-interactive authenticated connectivity check.
fn probe(runner: &dyn Runner, spec: &DiscoverySpec) -> Result<bool> {
    let out = runner.run(
        &Cmd::new("ssh")
            .arg("-i")
            .arg_path(&spec.key_path)
            .args([
                "-o",
                "BatchMode=yes",
                "-o",
                "ConnectTimeout=5",
                "-o",
                "StrictHostKeyChecking=no",
            ])
            .arg(format!("{}@{}", spec.user, spec.target_ip))
            .arg("true")
            .allow_fail(),
    )?;
    Ok(out.success)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::fake::FakeRunner;
    use crate::process::CmdOutput;
    use anyhow::Result as AnyResult;
    use std::cell::Cell;
    use tempfile::TempDir;

    fn spec() -> DiscoverySpec {
        DiscoverySpec {
            hostname: "alpha".to_string(),
            target_ip: "10.10.0.2".to_string(),
            user: "tower".to_string(),
            key_path: PathBuf::from("/keys/alpha"),
            poll_interval: Duration::from_millis(10),
            max_wait: Duration::from_millis(50),
        }
    }

    /// Succeeds from the `reachable_after`-th probe onward.
    struct FlakyProbe {
        reachable_after: u32,
        probes: Cell<u32>,
    }

    impl Runner for FlakyProbe {
        fn run(&self, _cmd: &Cmd) -> AnyResult<CmdOutput> {
            self.probes.set(self.probes.get() + 1);
            Ok(CmdOutput {
                success: self.probes.get() >= self.reachable_after,
                stdout: String::new(),
                stderr: String::new(),
            })
        }
    }

    #[test]
    fn discover_succeeds_on_kth_attempt_and_registers_host() {
        let tmp = TempDir::new().unwrap();
        let registry = Registry::new(tmp.path().to_path_buf());
        let runner = FlakyProbe {
            reachable_after: 3,
            probes: Cell::new(0),
        };

        discover(&runner, &registry, &spec()).unwrap();
        assert_eq!(runner.probes.get(), 3);

        let config = std::fs::read_to_string(registry.ssh_dir().join("config")).unwrap();
        assert!(config.contains("Host alpha"));
        assert!(config.contains("HostName 10.10.0.2"));
    }

    #[test]
    fn discover_exhausts_after_exactly_max_attempts() {
        let tmp = TempDir::new().unwrap();
        let registry = Registry::new(tmp.path().to_path_buf());
        let fake = FakeRunner::new();
        fake.fail_program("ssh");

        let err = discover(&fake, &registry, &spec()).unwrap_err();
        assert!(matches!(err, Error::UnreachableHost { .. }));
        // 50ms budget at 10ms interval: exactly 5 polls
        assert_eq!(fake.calls_of("ssh").len(), 5);
        // no registry entry for an unreachable host
        assert!(!registry.ssh_dir().join("config").exists());
    }

    #[test]
    fn probe_uses_batch_mode_and_identity() {
        let fake = FakeRunner::new();
        probe(&fake, &spec()).unwrap();
        let call = &fake.calls_of("ssh")[0];
        assert!(call.contains("-i /keys/alpha"));
        assert!(call.contains("BatchMode=yes"));
        assert!(call.contains("tower@10.10.0.2 true"));
    }
}
