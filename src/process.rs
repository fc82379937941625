//! External command invocation.
//!
//! Everything the pipeline shells out to (parted, mkfs, losetup, dd, ssh)
//! goes through the [`Runner`] capability so tests can substitute a fake
//! and simulate partition/format/probe failures deterministically.

use anyhow::{bail, Context, Result};
use std::fmt::Write as _;
use std::io::Write as _;
use std::path::Path;
use std::process::{Command, Stdio};

/// Builder for one external command invocation.
#[derive(Debug, Clone)]
pub struct Cmd {
    program: String,
    args: Vec<String>,
    stdin: Option<String>,
    error_msg: Option<String>,
    allow_fail: bool,
    privileged: bool,
}

impl Cmd {
    pub fn new(program: &str) -> Self {
        Self {
            program: program.to_string(),
            args: Vec::new(),
            stdin: None,
            error_msg: None,
            allow_fail: false,
            privileged: false,
        }
    }

    pub fn arg(mut self, arg: impl AsRef<str>) -> Self {
        self.args.push(arg.as_ref().to_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for a in args {
            self.args.push(a.as_ref().to_string());
        }
        self
    }

    pub fn arg_path(mut self, path: &Path) -> Self {
        self.args.push(path.display().to_string());
        self
    }

    /// Feed this string to the child's stdin.
    pub fn stdin(mut self, input: &str) -> Self {
        self.stdin = Some(input.to_string());
        self
    }

    /// Message used instead of the generic one when the command fails.
    pub fn error_msg(mut self, msg: &str) -> Self {
        self.error_msg = Some(msg.to_string());
        self
    }

    /// A non-zero exit is reported in the output instead of erroring.
    pub fn allow_fail(mut self) -> Self {
        self.allow_fail = true;
        self
    }

    /// Run under `sudo` when the current process is not already root.
    pub fn privileged(mut self) -> Self {
        self.privileged = true;
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Rendered `program arg arg ...` form, used for logs and the fake
    /// runner's ledger.
    pub fn rendered(&self) -> String {
        let mut s = self.program.clone();
        for a in &self.args {
            let _ = write!(s, " {}", a);
        }
        s
    }
}

/// Captured result of a command run.
#[derive(Debug, Clone, Default)]
pub struct CmdOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

impl CmdOutput {
    pub fn stdout_trimmed(&self) -> &str {
        self.stdout.trim()
    }
}

/// Capability for running external commands.
///
/// The pipeline holds `&dyn Runner`; production uses [`SystemRunner`],
/// tests use the scripted fake in [`fake`].
pub trait Runner {
    fn run(&self, cmd: &Cmd) -> Result<CmdOutput>;
}

/// Spawns real processes, escalating privileged commands through `sudo`
/// when the current user is not root.
pub struct SystemRunner {
    needs_sudo: bool,
}

impl SystemRunner {
    pub fn new() -> Self {
        // Safety: geteuid has no preconditions.
        let euid = unsafe { libc::geteuid() };
        Self {
            needs_sudo: euid != 0,
        }
    }
}

impl Default for SystemRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl Runner for SystemRunner {
    fn run(&self, cmd: &Cmd) -> Result<CmdOutput> {
        log::debug!("running: {}", cmd.rendered());

        let mut command = if cmd.privileged && self.needs_sudo {
            let mut c = Command::new("sudo");
            c.arg(&cmd.program);
            c
        } else {
            Command::new(&cmd.program)
        };
        command.args(&cmd.args);
        command.stdout(Stdio::piped()).stderr(Stdio::piped());
        if cmd.stdin.is_some() {
            command.stdin(Stdio::piped());
        }

        let mut child = command
            .spawn()
            .with_context(|| format!("failed to spawn `{}`", cmd.program))?;

        if let Some(input) = &cmd.stdin {
            if let Some(mut stdin) = child.stdin.take() {
                stdin.write_all(input.as_bytes())?;
            }
        }

        let output = child
            .wait_with_output()
            .with_context(|| format!("failed to wait for `{}`", cmd.program))?;

        let result = CmdOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };

        if !result.success && !cmd.allow_fail {
            let detail = result.stderr.trim();
            match &cmd.error_msg {
                Some(msg) if detail.is_empty() => bail!("{}", msg),
                Some(msg) => bail!("{}: {}", msg, detail),
                None => bail!("`{}` failed: {}", cmd.rendered(), detail),
            }
        }

        Ok(result)
    }
}

#[cfg(test)]
pub(crate) mod fake {
    //! Scripted runner for tests: records every invocation and replays
    //! queued responses per program name.

    use super::*;
    use std::cell::RefCell;
    use std::collections::{HashMap, HashSet, VecDeque};

    #[derive(Default)]
    pub struct FakeRunner {
        pub calls: RefCell<Vec<String>>,
        stdouts: RefCell<HashMap<String, VecDeque<String>>>,
        failing: RefCell<HashSet<String>>,
    }

    impl FakeRunner {
        pub fn new() -> Self {
            Self::default()
        }

        /// Queue stdout responses for a program. The last entry repeats
        /// once the queue is drained.
        pub fn queue_stdout(&self, program: &str, outputs: &[&str]) {
            self.stdouts.borrow_mut().insert(
                program.to_string(),
                outputs.iter().map(|s| s.to_string()).collect(),
            );
        }

        /// Every invocation of `program` fails from now on.
        pub fn fail_program(&self, program: &str) {
            self.failing.borrow_mut().insert(program.to_string());
        }

        pub fn calls_of(&self, program: &str) -> Vec<String> {
            self.calls
                .borrow()
                .iter()
                .filter(|c| c.split_whitespace().next() == Some(program))
                .cloned()
                .collect()
        }
    }

    impl Runner for FakeRunner {
        fn run(&self, cmd: &Cmd) -> Result<CmdOutput> {
            self.calls.borrow_mut().push(cmd.rendered());

            if self.failing.borrow().contains(cmd.program()) {
                if cmd.allow_fail {
                    return Ok(CmdOutput {
                        success: false,
                        stdout: String::new(),
                        stderr: format!("{} scripted failure", cmd.program()),
                    });
                }
                bail!("{} scripted failure", cmd.program());
            }

            let stdout = {
                let mut stdouts = self.stdouts.borrow_mut();
                match stdouts.get_mut(cmd.program()) {
                    Some(queue) if queue.len() > 1 => queue.pop_front().unwrap_or_default(),
                    Some(queue) => queue.front().cloned().unwrap_or_default(),
                    None => String::new(),
                }
            };

            Ok(CmdOutput {
                success: true,
                stdout,
                stderr: String::new(),
            })
        }
    }
}
