//! The `chariot` command line surface (spec.md §6's flag table).

use std::path::PathBuf;

use camino::Utf8PathBuf;
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};

use crate::manifest::Manifest;
use crate::orchestrator::Orchestrator;
use crate::sandbox::LinuxSandbox;
use crate::tag::Tag;

#[derive(Parser, Debug)]
#[command(name = "chariot", version, about = "A from-scratch cross-compilation bootstrap orchestrator")]
pub struct Opts {
    /// Manifest path.
    #[arg(long, default_value = "chariot.toml")]
    pub config: PathBuf,

    /// Cache root.
    #[arg(long, default_value = ".chariot-cache")]
    pub cache: PathBuf,

    /// Wipe and rebuild the distro root before running.
    #[arg(long)]
    pub reset_container: bool,

    /// Re-fetch the named sources even if already cached.
    #[arg(long)]
    pub refetch_sources: bool,

    /// Stream child stdout to the UI.
    #[arg(long)]
    pub verbose: bool,

    /// Suppress child stderr.
    #[arg(long)]
    pub quiet: bool,

    /// Value substituted for `$THREADS`.
    #[arg(long, default_value_t = 8)]
    pub threads: u32,

    /// Tags to build: bare (`foo`), `host:foo`, or `source:foo`.
    #[arg(required = true)]
    pub tags: Vec<String>,
}

/// Parses `args` as a `chariot` invocation and runs it to completion,
/// matching `std::env::args()`'s usual argv[0]-included shape.
pub fn run<I, T>(args: I) -> anyhow::Result<()>
where
    I: IntoIterator<Item = T>,
    T: Into<std::ffi::OsString> + Clone,
{
    let opts = Opts::parse_from(args);
    run_opts(opts)
}

fn run_opts(opts: Opts) -> anyhow::Result<()> {
    let config_path = Utf8PathBuf::from_path_buf(opts.config.clone())
        .map_err(|p| anyhow::anyhow!("manifest path {p:?} is not valid UTF-8"))?;
    let manifest = Manifest::load(&config_path)?;

    let cache_root = Utf8PathBuf::from_path_buf(opts.cache.clone())
        .map_err(|p| anyhow::anyhow!("cache path {p:?} is not valid UTF-8"))?;
    std::fs::create_dir_all(&cache_root)?;
    let cache = crate::cache::CacheLayout::new(cache_root);

    let _lock = crate::cache::CacheLock::acquire(&cache)?;

    let sandbox = LinuxSandbox;
    let mut orchestrator = Orchestrator::new(cache, &sandbox);
    orchestrator.threads = opts.threads;
    orchestrator.verbose = opts.verbose;
    orchestrator.quiet = opts.quiet;

    let spinner = ProgressBar::new_spinner();
    spinner.set_style(ProgressStyle::with_template("{spinner} {msg}").expect("static template"));
    spinner.enable_steady_tick(std::time::Duration::from_millis(120));
    spinner.set_message("bootstrapping container");
    orchestrator.bootstrap(opts.reset_container)?;
    spinner.finish_and_clear();

    let mut requested = Vec::with_capacity(opts.tags.len());
    for raw in &opts.tags {
        match raw.parse::<Tag>() {
            Ok(tag) => requested.push(tag),
            Err(e) => eprintln!("chariot: warning: skipping {raw:?}: {e}"),
        }
    }
    if requested.is_empty() {
        anyhow::bail!("no valid tags requested");
    }

    if opts.refetch_sources {
        orchestrator.refetch_sources = requested
            .iter()
            .filter(|t| t.kind == crate::tag::TagKind::Source)
            .map(|t| t.id.clone())
            .collect();
    }

    let results = orchestrator.run(&manifest, &requested, &[]);
    let mut failed = false;
    for (tag, result) in results {
        if let Err(e) = result {
            eprintln!("chariot: {tag} failed: {e}");
            failed = true;
        }
    }
    if failed {
        anyhow::bail!("one or more requested tags failed to build");
    }
    Ok(())
}
