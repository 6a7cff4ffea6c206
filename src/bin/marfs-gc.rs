//! Trash garbage collection front-end.
//!
//! Scans every namespace's trash, deletes orphaned objects through the
//! configured data backends, and prints the run tally. `--dry-run` logs
//! what would be deleted without touching anything.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Error};
use clap::Parser;

use marfs::config::MarfsConfig;
use marfs::dal::{Dal, PosixDal};
use marfs::gc::{GarbageCollector, GcOptions};
use marfs::mdal::PosixMdal;

#[derive(Parser)]
#[command(name = "marfs-gc", about = "Reclaim objects behind trashed MarFS files")]
struct Args {
    /// Engine configuration (JSON).
    #[arg(short, long)]
    config: PathBuf,

    /// Root directory of the semi-direct object store.
    #[arg(short, long)]
    object_root: PathBuf,

    /// Minimum age (seconds) before a trash entry qualifies.
    #[arg(short = 't', long, default_value_t = 86400)]
    age_threshold: u64,

    /// Log deletions instead of performing them.
    #[arg(short = 'n', long)]
    dry_run: bool,

    /// Delete worker threads.
    #[arg(short, long, default_value_t = 4)]
    workers: usize,
}

fn main() -> Result<(), Error> {
    env_logger::init();
    let args = Args::parse();

    let config = MarfsConfig::load(&args.config)?;
    if args.workers == 0 {
        bail!("need at least one worker");
    }

    // All non-direct repos are served by the semi-direct backend here;
    // S3/sproxyd deployments swap in their wire adapters. Object-IDs
    // lead with their bucket, so one root serves every repo.
    let mut dals: HashMap<String, Arc<dyn Dal>> = HashMap::new();
    for repo in config.repos().filter(|r| !r.is_direct()) {
        dals.insert(
            repo.name.clone(),
            Arc::new(PosixDal::new(&args.object_root)),
        );
    }

    let gc = GarbageCollector::new(
        config,
        Arc::new(PosixMdal::new()),
        dals,
        GcOptions {
            age_threshold_s: args.age_threshold,
            dry_run: args.dry_run,
            workers: args.workers,
        },
    );
    let report = gc.run()?;

    let t = &report.tally;
    println!(
        "scanned {} entries, {} candidates: {} objects deleted, {} missing, \
         {} MD files removed, {} failures",
        t.scanned, t.candidates, t.objects_deleted, t.objects_missing, t.md_files_removed, t.failures
    );
    if args.dry_run {
        println!("dry-run: {} deletions identified, nothing touched", t.would_delete);
    }
    for candidate in &report.repack_candidates {
        println!(
            "repack candidate in '{}': {} ({} of {} members trashed)",
            candidate.ns, candidate.objid, candidate.observed, candidate.declared
        );
    }
    if t.failures > 0 {
        bail!("{} failures during collection", t.failures);
    }
    Ok(())
}
