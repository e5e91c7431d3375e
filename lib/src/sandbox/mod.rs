//! The sandbox execution engine (spec.md §4.2): run a shell command line
//! inside a distribution root filesystem, in fresh mount/pid/user
//! namespaces, with the invoking user mapped to uid 0 inside the sandbox.
//!
//! The namespace/mount syscalls are Linux-specific and are encapsulated
//! behind the single [`SandboxEngine::exec`] entry point, per spec.md §9's
//! design note, so the rest of the orchestrator stays portable in
//! principle. [`FakeSandbox`] is a test double recording the calls it would
//! have made, so the assembler/orchestrator can be exercised without root
//! or a real Linux kernel (spec.md's Testable Properties require this: the
//! sandbox itself needs privilege the test environment may not have).

mod linux;

use std::io::Write;
use std::process::ExitStatus;

use camino::Utf8PathBuf;

use crate::error::{ChariotError, Result};

pub use linux::LinuxSandbox;

/// One bind mount: `from_host` is bound onto `root_dir.join(to_inside)`
/// before pivot (spec.md §4.2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub to_inside: Utf8PathBuf,
    pub from_host: Utf8PathBuf,
}

impl Mount {
    pub fn new(to_inside: impl Into<Utf8PathBuf>, from_host: impl Into<Utf8PathBuf>) -> Self {
        Self {
            to_inside: to_inside.into(),
            from_host: from_host.into(),
        }
    }
}

/// A single sandboxed invocation: `sh -c <cmd>`, run at `cwd` inside
/// `root_dir`, with `mounts` bound in beforehand.
#[derive(Debug, Clone)]
pub struct SandboxRequest {
    pub root_dir: Utf8PathBuf,
    pub cmd: String,
    pub cwd: Utf8PathBuf,
    pub mounts: Vec<Mount>,
    /// Stream the child's stdout/stderr live, rather than only surfacing it
    /// on failure (the CLI's `--verbose` flag, spec.md §6).
    pub verbose: bool,
}

/// The environment the child sees is a constant, not stateful (spec.md §4.2
/// / §8 property 5).
pub const SANDBOX_ENV: &[&str] = &[
    "LANG=en_US.UTF-8",
    "LC_COLLATE=C",
    "PATH=/usr/local/sbin:/usr/local/bin:/usr/bin:/usr/bin/core_perl",
];

/// Contract of spec.md §4.2: `exec(root_dir, cmd, cwd, mounts[], stdout,
/// stderr) -> Result<exit_status>`.
pub trait SandboxEngine: std::fmt::Debug {
    fn exec(&self, request: &SandboxRequest, stdout: &mut dyn Write, stderr: &mut dyn Write) -> Result<ExitStatus>;
}

/// Run `request` and turn a nonzero/failed exit into a [`ChariotError`],
/// matching §7's `BuildCommand`/`SandboxSetup` policy. Callers that need the
/// raw exit status (e.g. to distinguish signal death) use
/// [`SandboxEngine::exec`] directly.
pub fn run_checked(
    engine: &dyn SandboxEngine,
    request: &SandboxRequest,
    tag: &crate::tag::Tag,
    stdout: &mut dyn Write,
    stderr: &mut dyn Write,
) -> Result<()> {
    let status = engine.exec(request, stdout, stderr)?;
    if !status.success() {
        return Err(ChariotError::BuildCommand {
            tag: tag.clone(),
            reason: format!("`{}` exited with {status}", request.cmd),
        });
    }
    Ok(())
}

#[cfg(test)]
pub mod fake;
