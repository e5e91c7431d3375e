//! Build-tree assembler (spec.md §4.3): workspace preparation, dependency
//! output materialization into the ephemeral `hostroot/`/`root/` staging
//! directories, the per-unit sandbox mount plan, and `$NAME` command
//! substitution.

use std::collections::HashSet;

use camino::{Utf8Path, Utf8PathBuf};

use crate::cache::CacheLayout;
use crate::error::{ChariotError, Result};
use crate::graph::{Graph, NodeIndex};
use crate::sandbox::Mount;
use crate::tag::TagKind;

/// Remove and re-create `hostroot/` and `root/`, then copy in every
/// dependency's (and transitive runtime-dependency's) materialized output.
/// Idempotent: running it twice in a row for the same node produces the
/// same file set both times (spec.md §8's round-trip property).
pub fn prepare_workspace(cache: &CacheLayout, graph: &Graph, idx: NodeIndex) -> Result<()> {
    reset_dir(&cache.hostroot())?;
    reset_dir(&cache.sysroot())?;

    let node = graph.node(idx);
    let mut deps = node.dependencies.clone();
    deps.extend(node.runtime_dependencies.iter().copied());

    let mut visited = HashSet::new();
    for dep in deps {
        materialize(cache, graph, dep, &mut visited)?;
    }
    Ok(())
}

fn reset_dir(path: &Utf8Path) -> Result<()> {
    if path.exists() {
        std::fs::remove_dir_all(path).map_err(|e| ChariotError::io(path.to_string(), e))?;
    }
    std::fs::create_dir_all(path).map_err(|e| ChariotError::io(path.to_string(), e))?;
    Ok(())
}

/// Copies one dependency's output per spec.md §4.3's table, then recurses
/// into its own `runtime_dependencies` (transitive runtime materialization).
/// `visited` prevents redundant copies when a unit is reachable through more
/// than one path.
fn materialize(cache: &CacheLayout, graph: &Graph, idx: NodeIndex, visited: &mut HashSet<NodeIndex>) -> Result<()> {
    if !visited.insert(idx) {
        return Ok(());
    }
    let node = graph.node(idx);

    match node.tag.kind {
        TagKind::Host => {
            require_built(node, &cache.host_built(&node.tag.id))?;
            let src = cache.host_built(&node.tag.id).join("usr/local");
            if src.exists() {
                copy_into(&src, &cache.hostroot())?;
            }
        }
        TagKind::Standard => {
            let built = cache.built(&node.tag.id);
            require_built(node, &built)?;
            copy_into(&built, &cache.sysroot())?;
        }
        TagKind::Source => {
            // Sources are exposed to commands via bind mount, not copied.
        }
    }

    let runtime_deps: Vec<NodeIndex> = node.runtime_dependencies.clone();
    for dep in runtime_deps {
        materialize(cache, graph, dep, visited)?;
    }
    Ok(())
}

/// Per spec.md §9's open question: a runtime-only predecessor that has not
/// actually completed is a hard error, not the original's silent copy from
/// an absent/empty directory.
fn require_built(node: &crate::graph::Node, built_dir: &Utf8Path) -> Result<()> {
    if !node.built || !built_dir.exists() {
        return Err(ChariotError::io(
            built_dir.to_string(),
            std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{} has not been built; cannot materialize its output", node.tag),
            ),
        ));
    }
    Ok(())
}

fn copy_into(src: &Utf8Path, dst: &Utf8Path) -> Result<()> {
    chariot_utils::copy_tree(src.as_std_path(), dst.as_std_path())
        .map_err(|e| ChariotError::io(format!("{src} -> {dst}"), std::io::Error::other(e.to_string())))
}

/// The directory a command runs in, and the bind-mount plan for it, per
/// spec.md §4.3's mount-plan table. `cwd` is always a path inside the
/// sandbox (`/chariot/...`).
#[derive(Debug)]
pub struct MountPlan {
    pub cwd: Utf8PathBuf,
    pub mounts: Vec<Mount>,
}

fn shared_mounts(cache: &CacheLayout) -> Vec<Mount> {
    vec![
        Mount::new("usr/local", cache.hostroot()),
        Mount::new("chariot/root", cache.sysroot()),
        Mount::new("chariot/sources", cache.root().join("sources")),
    ]
}

/// Mount plan for a source unit's `exec` modifier.
pub fn mount_plan_for_source_exec(cache: &CacheLayout, source_id: &str) -> MountPlan {
    let mut mounts = shared_mounts(cache);
    mounts.push(Mount::new("chariot/source", cache.sources(source_id)));
    MountPlan {
        cwd: Utf8PathBuf::from("/chariot/source"),
        mounts,
    }
}

/// Mount plan for a host or standard target's configure/build/install
/// commands; the only difference between the two kinds is which cache
/// subtree `/chariot/build` and `/chariot/install` resolve to.
pub fn mount_plan_for_target(cache: &CacheLayout, id: &str, kind: TagKind) -> MountPlan {
    let (build_dir, install_dir) = match kind {
        TagKind::Host => (cache.host_build(id), cache.host_built(id)),
        TagKind::Standard => (cache.build(id), cache.built(id)),
        TagKind::Source => unreachable!("mount_plan_for_target is never called for a source unit"),
    };
    let mut mounts = shared_mounts(cache);
    mounts.push(Mount::new("chariot/build", build_dir));
    mounts.push(Mount::new("chariot/install", install_dir));
    MountPlan {
        cwd: Utf8PathBuf::from("/chariot/build"),
        mounts,
    }
}

/// The `$NAME` substitution environment for one unit's commands (spec.md
/// §4.3 "Variable substitution").
#[derive(Debug)]
pub struct SubstitutionContext {
    pub threads: u32,
    /// Source ids reachable (as a direct dependency or modifier source) from
    /// the current unit; any other `$SOURCE:x` is left verbatim.
    pub source_ids: HashSet<String>,
}

/// A tokenizing substitutor, not a naive string replace, so that `$BUILDER`
/// is never mis-substituted by a `$BUILD` prefix match (spec.md §9).
pub fn substitute(cmd: &str, ctx: &SubstitutionContext) -> String {
    let mut out = String::with_capacity(cmd.len());
    let mut i = 0;
    while i < cmd.len() {
        let ch = cmd[i..].chars().next().expect("i is a char boundary");
        if ch == '$' {
            let rest = &cmd[i + 1..];
            let (name, sub) = scan_token(rest);
            if !name.is_empty() {
                if let Some(sub_id) = sub {
                    if let Some(replacement) = resolve(name, Some(sub_id), ctx) {
                        out.push_str(&replacement);
                        i += 1 + name.len() + 1 + sub_id.len();
                        continue;
                    }
                }
                if let Some(replacement) = resolve(name, None, ctx) {
                    out.push_str(&replacement);
                    i += 1 + name.len();
                    continue;
                }
            }
        }
        out.push(ch);
        i += ch.len_utf8();
    }
    out
}

/// Scans a `NAME` (`[A-Za-z_]+`) optionally followed by `:sub`
/// (`[a-z0-9-]+`) from the start of `rest`. Returns empty strings for a
/// non-match; the caller is responsible for leaving unmatched input as-is.
fn scan_token(rest: &str) -> (&str, Option<&str>) {
    let name_end = rest
        .char_indices()
        .take_while(|(_, c)| c.is_ascii_alphanumeric() || *c == '_')
        .last()
        .map(|(pos, c)| pos + c.len_utf8())
        .unwrap_or(0);
    if name_end == 0 {
        return ("", None);
    }
    let name = &rest[..name_end];
    if let Some(after_colon) = rest[name_end..].strip_prefix(':') {
        let sub_end = after_colon
            .char_indices()
            .take_while(|(_, c)| c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '-')
            .last()
            .map(|(pos, c)| pos + c.len_utf8())
            .unwrap_or(0);
        if sub_end > 0 {
            return (name, Some(&after_colon[..sub_end]));
        }
    }
    (name, None)
}

fn resolve(name: &str, sub: Option<&str>, ctx: &SubstitutionContext) -> Option<String> {
    match (name, sub) {
        ("THREADS", None) => Some(ctx.threads.to_string()),
        ("PREFIX", None) => Some("/usr/local".to_string()),
        ("ROOT", None) => Some("/chariot/root".to_string()),
        ("BUILD", None) => Some("/chariot/build".to_string()),
        ("INSTALL", None) => Some("/chariot/install".to_string()),
        ("SOURCE", Some(id)) if ctx.source_ids.contains(id) => Some(format!("/chariot/sources/{id}")),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> SubstitutionContext {
        SubstitutionContext {
            threads: 4,
            source_ids: ["app-src".to_string()].into_iter().collect(),
        }
    }

    #[test]
    fn test_substitutes_known_names() {
        let ctx = ctx();
        assert_eq!(substitute("make -j$THREADS", &ctx), "make -j4");
        assert_eq!(substitute("./configure --prefix=$PREFIX", &ctx), "./configure --prefix=/usr/local");
        assert_eq!(substitute("cmake $SOURCE:app-src", &ctx), "cmake /chariot/sources/app-src");
    }

    #[test]
    fn test_does_not_eat_longer_identifier() {
        let ctx = ctx();
        assert_eq!(substitute("echo $BUILDER", &ctx), "echo $BUILDER");
        assert_eq!(substitute("echo $BUILD", &ctx), "echo /chariot/build");
    }

    #[test]
    fn test_unknown_source_id_preserved_verbatim() {
        let ctx = ctx();
        assert_eq!(substitute("cmake $SOURCE:missing", &ctx), "cmake $SOURCE:missing");
    }

    #[test]
    fn test_plain_dollar_sign_untouched() {
        let ctx = ctx();
        assert_eq!(substitute("echo $5 and $", &ctx), "echo $5 and $");
    }
}
