//! The top-level driver (spec.md §4.4): container bootstrap, per-unit
//! action dispatch, and rollback-on-failure cache cleanup. Shells out to
//! `wget`/`bsdtar`/`cp`/`patch` via [`crate::task::Task`], exactly as the
//! teacher's own `Task` shells out to `findmnt`/`mount`.

use std::collections::HashSet;
use std::fs;
use std::io::Write;

use camino::Utf8Path;

use crate::assembler::{self, SubstitutionContext};
use crate::cache::CacheLayout;
use crate::error::{ChariotError, Result};
use crate::graph::{Graph, NodeIndex, UnitPayload};
use crate::manifest::{Manifest, ModifierType, SourceType};
use crate::sandbox::{run_checked, SandboxEngine, SandboxRequest};
use crate::tag::{Tag, TagKind};
use crate::task::Task;

/// Default bootstrap package set. A policy decision of the default image,
/// not hard requirement of the manifest format (spec.md §9's open
/// question); no CLI flag overrides it, since §6's flag table is closed.
const BOOTSTRAP_PACKAGES: &[&str] = &["base-devel", "gcc", "gcc-fortran"];

const BOOTSTRAP_MIRROR: &str = "https://geo.mirror.pkgbuild.com/iso/latest/archlinux-bootstrap-x86_64.tar.gz";

#[derive(Debug)]
pub struct Orchestrator<'a> {
    pub cache: CacheLayout,
    pub sandbox: &'a dyn SandboxEngine,
    pub threads: u32,
    pub verbose: bool,
    pub quiet: bool,
    pub refetch_sources: HashSet<String>,
}

impl<'a> Orchestrator<'a> {
    pub fn new(cache: CacheLayout, sandbox: &'a dyn SandboxEngine) -> Self {
        Self {
            cache,
            sandbox,
            threads: 8,
            verbose: false,
            quiet: false,
            refetch_sources: HashSet::new(),
        }
    }

    /// Ensures the distro root filesystem exists, downloading and
    /// initializing it if needed (spec.md §4.2's bootstrap paragraph).
    /// `reset` wipes an existing one first.
    pub fn bootstrap(&self, reset: bool) -> Result<()> {
        let container = self.cache.container();
        if reset && container.exists() {
            reset_tree_permissions(&container)?;
            fs::remove_dir_all(&container).map_err(|e| ChariotError::io(container.to_string(), e))?;
        }
        if container.exists() {
            return Ok(());
        }

        let archive = self.cache.bootstrap_archive("archlinux-bootstrap-x86_64.tar.gz");
        self.task("downloading bootstrap archive", "wget")
            .args(["-q", "-O", archive.as_str(), BOOTSTRAP_MIRROR])
            .run()
            .map_err(|e| ChariotError::Io {
                path: archive.to_string(),
                source: std::io::Error::other(e.to_string()),
            })?;

        self.task("extracting bootstrap archive", "bsdtar")
            .args(["-zxf", archive.as_str(), "-C", self.cache.root().as_str()])
            .run()
            .map_err(|e| ChariotError::Io {
                path: archive.to_string(),
                source: std::io::Error::other(e.to_string()),
            })?;

        // Arch's bootstrap tarballs extract a single top-level `root.<arch>`
        // directory; normalize it to our deterministic `container/` name.
        let extracted = self.cache.root().join("root.x86_64");
        fs::rename(&extracted, &container).map_err(|e| ChariotError::io(container.to_string(), e))?;

        normalize_zero_mode_files(&container)?;
        self.run_pacman_init()?;
        Ok(())
    }

    fn run_pacman_init(&self) -> Result<()> {
        let container = self.cache.container();
        let mirrorlist = container.join("etc/pacman.d/mirrorlist");
        let locale_gen = container.join("etc/locale.gen");
        fs::write(&mirrorlist, "Server = https://geo.mirror.pkgbuild.com/$repo/os/$arch\n")
            .map_err(|e| ChariotError::io(mirrorlist.to_string(), e))?;
        fs::write(&locale_gen, "en_US.UTF-8 UTF-8\n").map_err(|e| ChariotError::io(locale_gen.to_string(), e))?;

        let commands = [
            "locale-gen".to_string(),
            "pacman-key --init && pacman-key --populate archlinux".to_string(),
            format!("pacman -Syu --noconfirm --needed {}", BOOTSTRAP_PACKAGES.join(" ")),
        ];
        for cmd in commands {
            self.run_in_container(&container, &cmd, "/")?;
        }
        Ok(())
    }

    fn run_in_container(&self, root_dir: &Utf8Path, cmd: &str, cwd: &str) -> Result<()> {
        let request = SandboxRequest {
            root_dir: root_dir.to_owned(),
            cmd: cmd.to_string(),
            cwd: cwd.into(),
            mounts: Vec::new(),
            verbose: self.verbose,
        };
        let tag = Tag::standard("bootstrap");
        let (mut out, mut err) = self.output_sinks();
        run_checked(self.sandbox, &request, &tag, out.as_mut(), err.as_mut())
    }

    fn output_sinks(&self) -> (Box<dyn Write>, Box<dyn Write>) {
        let out: Box<dyn Write> = if self.verbose {
            Box::new(std::io::stdout())
        } else {
            Box::new(std::io::sink())
        };
        let err: Box<dyn Write> = if self.quiet {
            Box::new(std::io::sink())
        } else {
            Box::new(std::io::stderr())
        };
        (out, err)
    }

    fn task(&self, description: impl AsRef<str>, exe: impl AsRef<str>) -> Task {
        let mut t = Task::new(description, exe);
        if !self.verbose {
            t = t.quiet_output();
        }
        if self.quiet {
            t = t.quiet();
        }
        t
    }

    /// Builds the graph and executes every requested tag's transitive
    /// dependency closure in post-order (spec.md §4.1's traversal).
    /// Independent top-level tags are each attempted even if an earlier one
    /// fails (spec.md §7's "best-effort across independent requests");
    /// the first error per root tag is returned to the caller for logging.
    pub fn run(&self, manifest: &Manifest, requested: &[Tag], redo: &[Tag]) -> Vec<(Tag, Result<()>)> {
        let mut graph = match Graph::build(manifest) {
            Ok(g) => g,
            Err(e) => return requested.iter().map(|t| (t.clone(), Err(clone_error(&e)))).collect(),
        };
        self.seed_built_state(&mut graph);

        let mut results = Vec::new();
        for tag in requested {
            let outcome = graph.traverse(std::slice::from_ref(tag), redo, |g, idx| self.execute(g, idx));
            results.push((tag.clone(), outcome));
        }
        results
    }

    /// Marks every node whose cache output already exists on disk as built,
    /// so a fresh process run skips already-done work (spec.md §6: presence
    /// of `built/<id>`/`host-built/<id>`/`sources/<id>` is the sole "done"
    /// signal, since the in-memory graph is rebuilt from scratch each run).
    /// Sources named via `--refetch-sources` are deliberately left unseeded.
    fn seed_built_state(&self, graph: &mut Graph) {
        let indices: Vec<NodeIndex> = graph.node_indices().collect();
        for idx in indices {
            let tag = graph.node(idx).tag.clone();
            let done = match tag.kind {
                TagKind::Source => !self.refetch_sources.contains(&tag.id) && self.cache.sources(&tag.id).exists(),
                TagKind::Host => self.cache.host_built(&tag.id).exists(),
                TagKind::Standard => self.cache.built(&tag.id).exists(),
            };
            if done {
                graph.node_mut(idx).built = true;
            }
        }
    }

    fn execute(&self, graph: &mut Graph, idx: NodeIndex) -> Result<()> {
        let tag = graph.node(idx).tag.clone();
        let unit = graph.node(idx).unit.clone();
        tracing::info!(%tag, "building");
        match unit {
            UnitPayload::Source(src) => self.execute_source(graph, idx, &tag, &src),
            UnitPayload::Host(_) => self.execute_target(graph, idx, &tag, TagKind::Host),
            UnitPayload::Standard(_) => self.execute_target(graph, idx, &tag, TagKind::Standard),
        }
    }

    fn source_ids_of(&self, graph: &Graph, idx: NodeIndex) -> HashSet<String> {
        graph
            .node(idx)
            .dependencies
            .iter()
            .map(|&d| graph.node(d))
            .filter(|n| n.tag.kind == TagKind::Source)
            .map(|n| n.tag.id.clone())
            .collect()
    }

    fn execute_source(
        &self,
        graph: &mut Graph,
        idx: NodeIndex,
        tag: &Tag,
        src: &crate::manifest::SourceUnit,
    ) -> Result<()> {
        let dir = self.cache.sources(&tag.id);
        let needs_fetch = self.refetch_sources.contains(&tag.id) || !dir.exists();

        if needs_fetch {
            if dir.exists() {
                fs::remove_dir_all(&dir).map_err(|e| ChariotError::io(dir.to_string(), e))?;
            }
            fs::create_dir_all(&dir).map_err(|e| ChariotError::io(dir.to_string(), e))?;
            if let Err(e) = self.fetch_source(tag, src, &dir) {
                let _ = fs::remove_dir_all(&dir);
                return Err(e);
            }
        }

        for modifier in &src.modifiers {
            if let Err(e) = self.apply_modifier(graph, idx, tag, modifier, &dir) {
                let _ = fs::remove_dir_all(&dir);
                return Err(e);
            }
        }
        Ok(())
    }

    fn fetch_source(&self, tag: &Tag, src: &crate::manifest::SourceUnit, dir: &Utf8Path) -> Result<()> {
        let result = match src.kind {
            SourceType::Tar => self
                .task(format!("fetching {tag}"), "sh")
                .args([
                    "-c".to_string(),
                    format!("wget -qO- '{}' | bsdtar -xf - --strip-components 1 -C '{dir}'", src.url),
                ])
                .run(),
            SourceType::Local => self
                .task(format!("fetching {tag}"), "cp")
                .args(["-rT", src.url.as_str(), dir.as_str()])
                .run(),
        };
        result.map_err(|e| ChariotError::FetchFailed {
            tag: tag.clone(),
            reason: e.to_string(),
        })
    }

    fn apply_modifier(
        &self,
        graph: &mut Graph,
        idx: NodeIndex,
        tag: &Tag,
        modifier: &crate::manifest::Modifier,
        source_dir: &Utf8Path,
    ) -> Result<()> {
        match modifier.kind {
            ModifierType::Patch => {
                let file = modifier.file.as_deref().unwrap_or_default();
                let modifier_source = modifier.source.as_deref().unwrap_or_default();
                let patch_file = self.cache.sources(modifier_source).join(file);
                self.task(format!("patching {tag}"), "patch")
                    .args(["-p1", "-i", patch_file.as_str()])
                    .cwd(source_dir.as_std_path())
                    .run()
                    .map_err(|e| ChariotError::ModifierFailed {
                        tag: tag.clone(),
                        reason: e.to_string(),
                    })
            }
            ModifierType::Merge => {
                let modifier_source = modifier.source.as_deref().unwrap_or_default();
                let merge_src = self.cache.sources(modifier_source);
                let merge_spec = format!("{merge_src}/.");
                self.task(format!("merging into {tag}"), "cp")
                    .args(["-r", merge_spec.as_str(), "."])
                    .cwd(source_dir.as_std_path())
                    .run()
                    .map_err(|e| ChariotError::ModifierFailed {
                        tag: tag.clone(),
                        reason: e.to_string(),
                    })
            }
            ModifierType::Exec => {
                let cmd = modifier.cmd.clone().unwrap_or_default();
                assembler::prepare_workspace(&self.cache, graph, idx)?;
                let plan = assembler::mount_plan_for_source_exec(&self.cache, &tag.id);
                let ctx = SubstitutionContext {
                    threads: self.threads,
                    source_ids: self.source_ids_of(graph, idx),
                };
                let request = SandboxRequest {
                    root_dir: self.cache.container(),
                    cmd: assembler::substitute(&cmd, &ctx),
                    cwd: plan.cwd,
                    mounts: plan.mounts,
                    verbose: self.verbose,
                };
                let (mut out, mut err) = self.output_sinks();
                run_checked(self.sandbox, &request, tag, out.as_mut(), err.as_mut())
            }
        }
    }

    fn execute_target(&self, graph: &mut Graph, idx: NodeIndex, tag: &Tag, kind: TagKind) -> Result<()> {
        let id = &tag.id;
        let (build_dir, install_dir, commands) = {
            let node = graph.node(idx);
            let (configure, build, install) = match &node.unit {
                UnitPayload::Host(h) => (h.configure.clone(), h.build.clone(), h.install.clone()),
                UnitPayload::Standard(t) => (t.configure.clone(), t.build.clone(), t.install.clone()),
                UnitPayload::Source(_) => unreachable!("execute_target is never called for a source unit"),
            };
            let (build_dir, install_dir) = match kind {
                TagKind::Host => (self.cache.host_build(id), self.cache.host_built(id)),
                TagKind::Standard => (self.cache.build(id), self.cache.built(id)),
                TagKind::Source => unreachable!(),
            };
            let commands: Vec<String> = configure.into_iter().chain(build).chain(install).collect();
            (build_dir, install_dir, commands)
        };

        fs::create_dir_all(&build_dir).map_err(|e| ChariotError::io(build_dir.to_string(), e))?;
        fs::create_dir_all(&install_dir).map_err(|e| ChariotError::io(install_dir.to_string(), e))?;

        if let Err(e) = self.run_unit_commands(graph, idx, tag, kind, &commands) {
            let _ = fs::remove_dir_all(&build_dir);
            let _ = fs::remove_dir_all(&install_dir);
            return Err(e);
        }
        Ok(())
    }

    fn run_unit_commands(
        &self,
        graph: &mut Graph,
        idx: NodeIndex,
        tag: &Tag,
        kind: TagKind,
        commands: &[String],
    ) -> Result<()> {
        if commands.is_empty() {
            return Ok(());
        }
        assembler::prepare_workspace(&self.cache, graph, idx)?;
        let ctx = SubstitutionContext {
            threads: self.threads,
            source_ids: self.source_ids_of(graph, idx),
        };
        let plan = assembler::mount_plan_for_target(&self.cache, &tag.id, kind);

        for cmd in commands {
            let request = SandboxRequest {
                root_dir: self.cache.container(),
                cmd: assembler::substitute(cmd, &ctx),
                cwd: plan.cwd.clone(),
                mounts: plan.mounts.clone(),
                verbose: self.verbose,
            };
            let (mut out, mut err) = self.output_sinks();
            run_checked(self.sandbox, &request, tag, out.as_mut(), err.as_mut())?;
        }
        Ok(())
    }
}

/// Walks `path`, making every directory mode 0777 before the caller removes
/// it, to defeat read-only directories left behind by the distro image
/// (spec.md §4.2's reset-container paragraph).
fn reset_tree_permissions(path: &Utf8Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let meta = fs::symlink_metadata(path).map_err(|e| ChariotError::io(path.to_string(), e))?;
    if meta.is_dir() && !meta.file_type().is_symlink() {
        fs::set_permissions(path, fs::Permissions::from_mode(0o777))
            .map_err(|e| ChariotError::io(path.to_string(), e))?;
        let entries = fs::read_dir(path).map_err(|e| ChariotError::io(path.to_string(), e))?;
        for entry in entries {
            let entry = entry.map_err(|e| ChariotError::io(path.to_string(), e))?;
            let child = Utf8Path::from_path(&entry.path())
                .map(|p| p.to_owned())
                .unwrap_or_else(|| panic!("non-utf8 path under {path}"));
            reset_tree_permissions(&child)?;
        }
    }
    Ok(())
}

/// Bootstrap tarballs sometimes ship files with mode 000; normalize them to
/// 0755 so they are at least readable/executable by their owner.
fn normalize_zero_mode_files(path: &Utf8Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let meta = fs::symlink_metadata(path).map_err(|e| ChariotError::io(path.to_string(), e))?;
    if meta.file_type().is_symlink() {
        return Ok(());
    }
    if meta.is_dir() {
        let entries = fs::read_dir(path).map_err(|e| ChariotError::io(path.to_string(), e))?;
        for entry in entries {
            let entry = entry.map_err(|e| ChariotError::io(path.to_string(), e))?;
            let child = Utf8Path::from_path(&entry.path())
                .map(|p| p.to_owned())
                .unwrap_or_else(|| panic!("non-utf8 path under {path}"));
            normalize_zero_mode_files(&child)?;
        }
    }
    if meta.permissions().mode() & 0o777 == 0 {
        fs::set_permissions(path, fs::Permissions::from_mode(0o755))
            .map_err(|e| ChariotError::io(path.to_string(), e))?;
    }
    Ok(())
}

fn clone_error(e: &ChariotError) -> ChariotError {
    // `ChariotError` deliberately does not derive `Clone` (it wraps
    // `std::io::Error`); graph-construction failures are reported once per
    // requested root tag, so render to a string and re-wrap.
    ChariotError::ManifestSchema(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::fake::FakeSandbox;

    fn layout(dir: &camino::Utf8Path) -> CacheLayout {
        CacheLayout::new(dir.to_owned())
    }

    #[test]
    fn test_fetches_local_source() {
        let src_dir = tempfile::tempdir().unwrap();
        std::fs::write(src_dir.path().join("file.txt"), b"hi").unwrap();
        let src_path = camino::Utf8Path::from_path(src_dir.path()).unwrap();

        let manifest = Manifest::parse(&format!(
            r#"
            [project]
            name = "t"

            [source.hello]
            type = "local"
            url = "{src_path}"
            "#
        ))
        .unwrap();

        let cache_dir = tempfile::tempdir().unwrap();
        let cache = layout(camino::Utf8Path::from_path(cache_dir.path()).unwrap());
        let sandbox = FakeSandbox::new();
        let orchestrator = Orchestrator::new(cache.clone(), &sandbox);

        let results = orchestrator.run(&manifest, &[Tag::source("hello")], &[]);
        assert_eq!(results.len(), 1);
        assert!(results[0].1.is_ok(), "{:?}", results[0].1);
        assert!(cache.sources("hello").join("file.txt").exists());
    }

    #[test]
    fn test_rollback_on_build_failure() {
        let manifest = Manifest::parse(
            r#"
            [project]
            name = "t"

            [target.app]
            build = ["make"]
            "#,
        )
        .unwrap();

        let cache_dir = tempfile::tempdir().unwrap();
        let cache = layout(camino::Utf8Path::from_path(cache_dir.path()).unwrap());
        let sandbox = FakeSandbox::failing(1);
        let orchestrator = Orchestrator::new(cache.clone(), &sandbox);

        let results = orchestrator.run(&manifest, &[Tag::standard("app")], &[]);
        assert!(results[0].1.is_err());
        assert!(!cache.build("app").exists());
        assert!(!cache.built("app").exists());
    }

    #[test]
    fn test_skips_already_built_unit_on_second_run() {
        let manifest = Manifest::parse(
            r#"
            [project]
            name = "t"

            [target.app]
            build = ["make"]
            "#,
        )
        .unwrap();

        let cache_dir = tempfile::tempdir().unwrap();
        let cache = layout(camino::Utf8Path::from_path(cache_dir.path()).unwrap());
        let sandbox = FakeSandbox::new();
        let orchestrator = Orchestrator::new(cache.clone(), &sandbox);

        let first = orchestrator.run(&manifest, &[Tag::standard("app")], &[]);
        assert!(first[0].1.is_ok(), "{:?}", first[0].1);
        assert_eq!(sandbox.calls().len(), 1);

        let second = orchestrator.run(&manifest, &[Tag::standard("app")], &[]);
        assert!(second[0].1.is_ok());
        assert_eq!(sandbox.calls().len(), 1, "no child process should run for an already-built unit");
    }
}
