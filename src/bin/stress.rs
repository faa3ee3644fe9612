//! Bundled stress harness: hammers a throwaway (or caller-supplied)
//! database directory with primitive appends and source→list inserts,
//! checkpointing periodically, until the requested operation count is
//! reached or the process is interrupted.
//!
//! Exit codes follow `sysexits.h`: 0 success, 64 (`EX_USAGE`) on a bad
//! argument, 70 (`EX_SOFTWARE`) on an internal store error, 75
//! (`EX_TEMPFAIL`) if a signal interrupted the run before it finished.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use rand::Rng;
use tracing::{error, info};

use gdb_store::index::OnDuplicate;
use gdb_store::{Database, StoreConfig};

const EX_USAGE: i32 = 64;
const EX_SOFTWARE: i32 = 70;
const EX_TEMPFAIL: i32 = 75;

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_sigint(_: libc::c_int) {
    INTERRUPTED.store(true, Ordering::SeqCst);
}

struct Args {
    dir: PathBuf,
    ops: u64,
    checkpoint_every: u64,
    sabotage: Option<(u64, i32)>,
}

fn parse_args() -> Result<Args, String> {
    let mut dir = None;
    let mut ops = 10_000u64;
    let mut checkpoint_every = 500u64;
    let mut sabotage = None;

    let mut it = std::env::args().skip(1);
    while let Some(flag) = it.next() {
        match flag.as_str() {
            "--dir" => {
                let v = it.next().ok_or("--dir requires a path")?;
                dir = Some(PathBuf::from(v));
            }
            "--ops" => {
                let v = it.next().ok_or("--ops requires a count")?;
                ops = v.parse().map_err(|_| format!("invalid --ops value: {v}"))?;
            }
            "--checkpoint-every" => {
                let v = it.next().ok_or("--checkpoint-every requires a count")?;
                checkpoint_every = v.parse().map_err(|_| format!("invalid --checkpoint-every value: {v}"))?;
            }
            "--sabotage" => {
                let v = it.next().ok_or("--sabotage requires countdown:errno")?;
                let (c, e) = v.split_once(':').ok_or("--sabotage must be countdown:errno")?;
                let countdown: u64 = c.parse().map_err(|_| format!("invalid sabotage countdown: {c}"))?;
                let errno: i32 = e.parse().map_err(|_| format!("invalid sabotage errno: {e}"))?;
                sabotage = Some((countdown, errno));
            }
            other => return Err(format!("unrecognized argument: {other}")),
        }
    }

    let dir = match dir {
        Some(d) => d,
        None => std::env::temp_dir().join(format!("gdb-stress-{}", std::process::id())),
    };
    Ok(Args { dir, ops, checkpoint_every, sabotage })
}

fn print_banner() {
    println!("gdb-store stress harness v{}", gdb_store::VERSION);
}

fn run(args: &Args) -> gdb_store::Result<()> {
    std::fs::create_dir_all(&args.dir)?;
    let mut config = StoreConfig::default();
    if let Some((countdown, errno)) = args.sabotage {
        config.sabotage = Some(std::sync::Arc::new(gdb_store::sabotage::Sabotage::new(countdown, errno)));
        info!(countdown, errno, "sabotage armed for this run");
    }
    let mut db = Database::open(&args.dir, &config)?;

    let mut rng = rand::rng();
    let mut last_id = None;
    for op in 0..args.ops {
        if INTERRUPTED.load(Ordering::SeqCst) {
            info!(completed = op, requested = args.ops, "interrupted");
            return Err(gdb_store::StoreError::database("interrupted"));
        }

        let payload: [u8; 16] = rng.random();
        let id = db.primitives().append(&payload)?;
        if let Some(prev) = last_id {
            if id > prev {
                let _ = db.index("stress").unwrap().add(prev, id, OnDuplicate::Ignore);
            }
        }
        last_id = Some(id);

        if op % args.checkpoint_every == 0 && op > 0 {
            let horizon = db.primitives().next_id();
            db.checkpoint(horizon)?;
            info!(op, horizon, "checkpoint");
        }
    }

    let horizon = db.primitives().next_id();
    db.checkpoint(horizon)?;
    db.close()?;
    info!(ops = args.ops, dir = %args.dir.display(), "stress run complete");
    Ok(())
}

fn main() {
    tracing_subscriber::fmt().with_target(false).with_level(true).init();
    print_banner();

    // SAFETY: installs a process-wide SIGINT handler once at startup;
    // `on_sigint` only touches an `AtomicBool`, which is async-signal-safe.
    unsafe {
        libc::signal(libc::SIGINT, on_sigint as usize);
    }

    let args = match parse_args() {
        Ok(a) => a,
        Err(msg) => {
            eprintln!("usage error: {msg}");
            std::process::exit(EX_USAGE);
        }
    };

    match run(&args) {
        Ok(()) => std::process::exit(0),
        Err(e) if INTERRUPTED.load(Ordering::SeqCst) => {
            error!(error = %e, "stress run interrupted");
            std::process::exit(EX_TEMPFAIL);
        }
        Err(e) => {
            error!(error = %e, "stress run failed");
            std::process::exit(EX_SOFTWARE);
        }
    }
}

