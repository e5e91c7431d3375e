//! The real Linux sandbox: fresh user+mount+pid namespaces, the invoking
//! user mapped to uid 0 inside them, bind mounts from the mount plan, and a
//! `pivot_root` into the assembled tree (spec.md §4.2's nine-step isolation
//! protocol).
//!
//! Grounded in `bootc-lib::hostexec`'s use of `nix::sched` (there: `setns`
//! into an *existing* namespace; here: `unshare` into a fresh one) and
//! `examples/other_examples/...run_in_container/src/main.rs`'s
//! unshare/fork/pivot_root sequence, generalized from overlayfs layering to
//! a flat bind-mount plan. Mount/unmount syscalls go through `rustix`
//! (the teacher's choice, `mount` feature); namespace/process syscalls with
//! no safe `rustix` wrapper (`unshare`, `fork`, `pivot_root`) go through
//! `nix`, matching `bootc-lib`'s existing dependency on it.
#![allow(unsafe_code)]

use std::fs;
use std::io::Write;
use std::os::fd::IntoRawFd;
use std::os::unix::fs::DirBuilderExt;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::process::{Command, ExitStatus, Stdio};
use std::thread;

use camino::Utf8Path;
use nix::sched::{unshare, CloneFlags};
use nix::sys::wait::{waitpid as nix_waitpid, WaitStatus};
use nix::unistd::{chdir, close, dup2, fork, getegid, geteuid, pipe, pivot_root, ForkResult, Pid};
use rustix::mount::{mount, mount_bind, mount_change, unmount, MountFlags, MountPropagationFlags, UnmountFlags};

use super::{SandboxEngine, SandboxRequest, SANDBOX_ENV};
use crate::error::{ChariotError, Result};

/// The real (as opposed to [`super::fake::FakeSandbox`]) sandbox engine.
/// Stateless: every field it needs travels in the [`SandboxRequest`].
#[derive(Debug, Default)]
pub struct LinuxSandbox;

impl SandboxEngine for LinuxSandbox {
    fn exec(
        &self,
        request: &SandboxRequest,
        stdout: &mut dyn Write,
        stderr: &mut dyn Write,
    ) -> Result<ExitStatus> {
        run_isolated(request, stdout, stderr)
    }
}

/// Runs `request` in fresh namespaces, relaying captured output into
/// `stdout`/`stderr` once the sandboxed command has exited.
///
/// Three processes are involved: the caller, a first child that does the
/// namespace/mount setup, and a grandchild that becomes pid 1 of the new PID
/// namespace and execs the requested command. Two forks are required
/// because `unshare(CLONE_NEWPID)` only takes effect for the *next* process
/// the caller forks, never for the calling process itself — so the mount
/// setup (which still needs the host filesystem reachable) happens in the
/// first child, before that second unshare.
fn run_isolated(
    request: &SandboxRequest,
    stdout: &mut dyn Write,
    stderr: &mut dyn Write,
) -> Result<ExitStatus> {
    let (out_read, out_write) =
        pipe().map_err(|e| ChariotError::SandboxSetup(format!("pipe(2) failed: {e}")))?;
    let (err_read, err_write) =
        pipe().map_err(|e| ChariotError::SandboxSetup(format!("pipe(2) failed: {e}")))?;

    // spec.md §4.2 step 1 maps the *effective* uid/gid to 0 inside the new
    // user namespace, matching the original's `os.Geteuid()`/`os.Getegid()`
    // (container/container.go).
    let uid = geteuid().as_raw();
    let gid = getegid().as_raw();

    // SAFETY: the orchestrator dispatches sandboxed units one at a time from
    // a single-threaded driver (spec.md §5), which is fork()'s soundness
    // precondition.
    match unsafe { fork() }.map_err(|e| ChariotError::SandboxSetup(format!("fork failed: {e}")))? {
        ForkResult::Parent { child } => {
            // `into_raw_fd()` hands exclusive ownership of each descriptor to
            // whatever closes/reads it next; letting the `OwnedFd` values
            // themselves drop here too would double-close these numbers.
            let _ = close(out_write.into_raw_fd());
            let _ = close(err_write.into_raw_fd());

            let out_read_fd = out_read.into_raw_fd();
            let err_read_fd = err_read.into_raw_fd();
            let out_handle = thread::spawn(move || drain_fd(out_read_fd));
            let err_handle = thread::spawn(move || drain_fd(err_read_fd));

            let status = wait_for_raw_status(child)?;

            let out_buf = out_handle.join().unwrap_or_default();
            let err_buf = err_handle.join().unwrap_or_default();
            stdout
                .write_all(&out_buf)
                .map_err(|e| ChariotError::io("<sandbox stdout>", e))?;
            stderr
                .write_all(&err_buf)
                .map_err(|e| ChariotError::io("<sandbox stderr>", e))?;
            Ok(status)
        }
        ForkResult::Child => {
            let _ = close(out_read.into_raw_fd());
            let _ = close(err_read.into_raw_fd());
            match setup_namespaces_and_fork(request, uid, gid, out_write.into_raw_fd(), err_write.into_raw_fd()) {
                Ok(grandchild) => {
                    let code = match nix_waitpid(grandchild, None) {
                        Ok(WaitStatus::Exited(_, code)) => code,
                        Ok(WaitStatus::Signaled(_, sig, _)) => 128 + sig as i32,
                        _ => 126,
                    };
                    std::process::exit(code);
                }
                Err(e) => {
                    let _ = writeln!(std::io::stderr(), "chariot: sandbox setup failed: {e}");
                    std::process::exit(127);
                }
            }
        }
    }
}

fn drain_fd(fd: std::os::fd::RawFd) -> Vec<u8> {
    use std::io::Read;
    // SAFETY: `fd` is an open pipe read end owned by this process for the
    // duration of this thread; wrapping it in a `File` only to read it.
    let mut file = unsafe { <std::fs::File as std::os::fd::FromRawFd>::from_raw_fd(fd) };
    let mut buf = Vec::new();
    let _ = file.read_to_end(&mut buf);
    buf
}

fn wait_for_raw_status(pid: Pid) -> Result<ExitStatus> {
    let mut raw_status: libc::c_int = 0;
    // SAFETY: `pid` is our own direct child; `waitpid(2)` with a valid
    // out-pointer and no flags is a plain blocking wait.
    let res = unsafe { libc::waitpid(pid.as_raw(), &mut raw_status, 0) };
    if res < 0 {
        return Err(ChariotError::SandboxSetup(format!(
            "waitpid failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(ExitStatus::from_raw(raw_status))
}

/// Runs inside the first forked child: steps 1-5 of spec.md §4.2's
/// isolation protocol (namespaces, uid/gid map, dev/resolv.conf/devpts/shm/
/// tmp/run mounts, user mount plan), then creates the PID namespace and
/// forks again. Returns the pid of the grandchild that will mount proc and
/// perform the pivot and exec (steps 6-9). On failure, the caller
/// exits the child process directly — there is no stack to unwind into a
/// forked child must never propagate a panic or error back into code shared
/// with the parent.
fn setup_namespaces_and_fork(
    request: &SandboxRequest,
    uid: u32,
    gid: u32,
    out_write: std::os::fd::RawFd,
    err_write: std::os::fd::RawFd,
) -> Result<Pid> {
    unshare(CloneFlags::CLONE_NEWUSER | CloneFlags::CLONE_NEWNS)
        .map_err(|e| ChariotError::SandboxSetup(format!("unshare(USER|NS) failed: {e}")))?;

    // Map the invoking user to uid/gid 0 inside the new user namespace
    // before doing anything privileged, matching the original's
    // `SysProcAttr.UidMappings`/`GidMappings` (container/container.go).
    fs::write("/proc/self/setgroups", "deny")
        .map_err(|e| ChariotError::io("/proc/self/setgroups", e))?;
    fs::write("/proc/self/uid_map", format!("0 {uid} 1\n"))
        .map_err(|e| ChariotError::io("/proc/self/uid_map", e))?;
    fs::write("/proc/self/gid_map", format!("0 {gid} 1\n"))
        .map_err(|e| ChariotError::io("/proc/self/gid_map", e))?;

    prepare_mounts(request)?;

    unshare(CloneFlags::CLONE_NEWPID)
        .map_err(|e| ChariotError::SandboxSetup(format!("unshare(PID) failed: {e}")))?;

    // SAFETY: see `run_isolated`; still single-threaded at this point.
    match unsafe { fork() }.map_err(|e| ChariotError::SandboxSetup(format!("fork failed: {e}")))? {
        ForkResult::Parent { child } => Ok(child),
        ForkResult::Child => {
            // Never returns on success; any error here exits the process
            // directly rather than unwinding.
            if let Err(e) = pivot_and_exec(request, out_write, err_write) {
                let _ = writeln!(std::io::stderr(), "chariot: sandbox exec failed: {e}");
                std::process::exit(127);
            }
            unreachable!("pivot_and_exec only returns via exec or process::exit");
        }
    }
}

/// Steps 2-5 of the isolation protocol: every mount that references the
/// host filesystem or a fresh virtual filesystem, all performed while the
/// host's paths are still reachable (i.e. before `pivot_root`).
fn prepare_mounts(request: &SandboxRequest) -> Result<()> {
    let root = &request.root_dir;

    // Step 2: /dev, recursive, as a slave mount (receive host device
    // additions, never propagate sandbox-side changes back to the host).
    let dev_target = root.join("dev");
    ensure_dir(&dev_target)?;
    bind(std::path::Path::new("/dev"), dev_target.as_std_path(), true)?;
    make_slave(dev_target.as_std_path())?;

    // Step 3: resolv.conf, the sole network configuration leak.
    let resolv_src = std::path::Path::new("/etc/resolv.conf");
    if resolv_src.exists() {
        let etc = root.join("etc");
        ensure_dir(&etc)?;
        let resolv_dst = etc.join("resolv.conf");
        if !resolv_dst.exists() {
            fs::File::create(&resolv_dst).map_err(|e| ChariotError::io(resolv_dst.to_string(), e))?;
        }
        bind(resolv_src, resolv_dst.as_std_path(), false)?;
    }

    // Step 4: fresh filesystems, in order. `proc` is deliberately not mounted
    // here: this runs before `unshare(CLONE_NEWPID)`, still in the host PID
    // namespace, and a procfs instance is bound to the PID namespace of its
    // mounting process. It is mounted later, from the grandchild that is
    // actually pid 1 of the new namespace (see `pivot_and_exec`).
    mount_fresh(&root.join("dev/pts"), "devpts", MountFlags::empty())?;
    mount_fresh(&root.join("dev/shm"), "tmpfs", MountFlags::empty())?;
    mount_fresh(&root.join("tmp"), "tmpfs", MountFlags::empty())?;
    mount_fresh(&root.join("run"), "tmpfs", MountFlags::empty())?;

    // Step 5: the per-unit user mount plan built by the assembler.
    for m in &request.mounts {
        let target = root.join(&m.to_inside);
        ensure_dir(&target)?;
        bind(m.from_host.as_std_path(), target.as_std_path(), true)?;
    }

    Ok(())
}

fn ensure_dir(path: &Utf8Path) -> Result<()> {
    fs::DirBuilder::new()
        .recursive(true)
        .mode(0o755)
        .create(path)
        .map_err(|e| ChariotError::io(path.to_string(), e))
}

fn mount_fresh(target: &Utf8Path, fstype: &str, flags: MountFlags) -> Result<()> {
    ensure_dir(target)?;
    mount(fstype, target.as_std_path(), fstype, flags, "").map_err(|e| {
        ChariotError::SandboxSetup(format!("mount {fstype} at {target}: {e}"))
    })
}

fn bind(src: &std::path::Path, dst: &std::path::Path, recursive: bool) -> Result<()> {
    let result = if recursive {
        mount(src, dst, "", MountFlags::BIND | MountFlags::REC, "")
    } else {
        mount_bind(src, dst)
    };
    result.map_err(|e| {
        ChariotError::SandboxSetup(format!("bind mount {} -> {}: {e}", src.display(), dst.display()))
    })
}

/// Marks `target` (recursively) slave so mount events propagate from the
/// host into the sandbox (new devices appearing under `/dev`) but never
/// back out. Propagation changes are a distinct syscall mode from `mount`'s
/// usual data/fstype/flags form, hence the separate `mount_change` call.
fn make_slave(target: &std::path::Path) -> Result<()> {
    mount_change(target, MountPropagationFlags::SLAVE | MountPropagationFlags::REC)
        .map_err(|e| ChariotError::SandboxSetup(format!("mount --make-rslave {}: {e}", target.display())))
}

/// Runs inside the grandchild, which is pid 1 of the new PID namespace:
/// mounts proc (the tail of step 4, deferred from `prepare_mounts` so it
/// binds to this namespace), then steps 6-9 — pivots into `request.root_dir`
/// and execs the requested shell command. Never returns on success.
fn pivot_and_exec(
    request: &SandboxRequest,
    out_write: std::os::fd::RawFd,
    err_write: std::os::fd::RawFd,
) -> Result<()> {
    let root: &Utf8Path = &request.root_dir;

    // Step 4 (cont'd): proc is bound to the PID namespace of whoever mounts
    // it, so it must be mounted here, from the grandchild that is actually
    // pid 1 of the new PID namespace, rather than in `prepare_mounts` where
    // the process is still in the host's.
    mount_fresh(&root.join("proc"), "proc", MountFlags::empty())?;

    // Step 6: pivot_root requires the new root to be a mount point distinct
    // from its parent; bind-mounting it onto itself achieves that cheaply.
    bind(root.as_std_path(), root.as_std_path(), true)?;

    // Step 7.
    let old_root = root.join(".temp-pivot");
    fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(&old_root)
        .map_err(|e| ChariotError::io(old_root.to_string(), e))?;

    chdir(root.as_std_path()).map_err(|e| ChariotError::SandboxSetup(format!("chdir: {e}")))?;
    pivot_root(".", ".temp-pivot").map_err(|e| ChariotError::SandboxSetup(format!("pivot_root: {e}")))?;
    chdir("/").map_err(|e| ChariotError::SandboxSetup(format!("chdir(/): {e}")))?;

    // Step 8.
    unmount("/.temp-pivot", UnmountFlags::DETACH)
        .map_err(|e| ChariotError::SandboxSetup(format!("unmount(/.temp-pivot): {e}")))?;
    let _ = fs::remove_dir("/.temp-pivot");

    // Step 9.
    dup2(out_write, 1).map_err(|e| ChariotError::SandboxSetup(format!("dup2(stdout): {e}")))?;
    dup2(err_write, 2).map_err(|e| ChariotError::SandboxSetup(format!("dup2(stderr): {e}")))?;
    let _ = close(out_write);
    let _ = close(err_write);

    let mut cmd = Command::new("/bin/sh");
    cmd.arg("-c")
        .arg(&request.cmd)
        .current_dir(request.cwd.as_std_path())
        .env_clear()
        .stdin(Stdio::null());
    for kv in SANDBOX_ENV {
        if let Some((k, v)) = kv.split_once('=') {
            cmd.env(k, v);
        }
    }

    // `exec` replaces this process image; on success it never returns.
    let err = cmd.exec();
    Err(ChariotError::SandboxSetup(format!("exec /bin/sh failed: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sandbox_env_parses() {
        for kv in SANDBOX_ENV {
            assert!(kv.contains('='), "{kv} should be KEY=VALUE");
        }
    }
}
