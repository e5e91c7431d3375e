//! A non-namespacing test double recording what it would have run, so the
//! assembler and orchestrator can be unit-tested without root or a real
//! Linux kernel.

use std::cell::RefCell;
use std::io::Write;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;

use crate::error::Result;

use super::{SandboxEngine, SandboxRequest};

#[derive(Debug, Default)]
pub struct FakeSandbox {
    pub calls: RefCell<Vec<SandboxRequest>>,
    /// Exit status to report for every call; defaults to success.
    pub exit_code: i32,
}

impl FakeSandbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(exit_code: i32) -> Self {
        Self {
            calls: RefCell::new(Vec::new()),
            exit_code,
        }
    }

    pub fn calls(&self) -> Vec<SandboxRequest> {
        self.calls.borrow().clone()
    }
}

impl SandboxEngine for FakeSandbox {
    fn exec(
        &self,
        request: &SandboxRequest,
        stdout: &mut dyn Write,
        _stderr: &mut dyn Write,
    ) -> Result<ExitStatus> {
        let _ = writeln!(stdout, "fake-sandbox: {}", request.cmd);
        self.calls.borrow_mut().push(request.clone());
        Ok(ExitStatus::from_raw(self.exit_code << 8))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::Mount;
    use camino::Utf8PathBuf;

    #[test]
    fn test_records_calls() {
        let fake = FakeSandbox::new();
        let request = SandboxRequest {
            root_dir: Utf8PathBuf::from("/cache/root"),
            cmd: "make install".to_string(),
            cwd: Utf8PathBuf::from("/build"),
            mounts: vec![Mount::new("/build", "/cache/build/app")],
            verbose: false,
        };
        let mut out = Vec::new();
        let mut err = Vec::new();
        let status = fake.exec(&request, &mut out, &mut err).unwrap();
        assert!(status.success());
        assert_eq!(fake.calls().len(), 1);
        assert_eq!(fake.calls()[0].cmd, "make install");
    }

    #[test]
    fn test_failing_reports_nonzero() {
        let fake = FakeSandbox::failing(1);
        let request = SandboxRequest {
            root_dir: Utf8PathBuf::from("/cache/root"),
            cmd: "false".to_string(),
            cwd: Utf8PathBuf::from("/"),
            mounts: vec![],
            verbose: false,
        };
        let mut out = Vec::new();
        let mut err = Vec::new();
        let status = fake.exec(&request, &mut out, &mut err).unwrap();
        assert!(!status.success());
    }
}
