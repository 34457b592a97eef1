//! Throughput benchmark for the skip-list set under the four reclamation
//! schemes. Worker 0 prefills the set, everyone synchronises on a barrier,
//! then all workers hammer the set until the stop flag flips; the report
//! compares the observed size against the replayed expected size.

use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use clap::Parser;
use colored::*;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use stacktrack::skiplist::{SkipList, MAX_KEY};
use stacktrack::stacktrack::{StThread, ST_MAX_FREE_LIST, ST_MAX_THREADS};
use stacktrack::AlgType;

/// Command-line arguments, mirroring the original benchmark's flag set.
#[derive(Parser, Debug)]
#[command(name = "bench", about = "Concurrent skip-list set benchmark", long_about = None)]
struct Args {
    /// Reclamation scheme: 0 pure, 1 hazard pointers, 2 stack-track, 3 forkscan
    #[arg(short = 'p', long = "alg-type", default_value_t = 0)]
    alg_type: i32,

    /// Ceiling for the adaptive segment length
    #[arg(short = 'l', long = "max-segment-length", default_value_t = 50)]
    max_segment_length: i32,

    /// Deferred frees a thread batches before scanning
    #[arg(short = 'f', long = "free-batch-size", default_value_t = 100)]
    free_batch_size: usize,

    /// Do not alternate insertions and removals
    #[arg(short = 'a', long = "do-not-alternate")]
    do_not_alternate: bool,

    /// Test duration in milliseconds (0 = run until SIGTERM/SIGINT)
    #[arg(short = 'd', long = "duration", default_value_t = 10000)]
    duration: u64,

    /// Number of elements to insert before the test
    #[arg(short = 'i', long = "initial-size", default_value_t = 256)]
    initial_size: usize,

    /// Number of worker threads
    #[arg(short = 'n', long = "num-threads", default_value_t = 1)]
    num_threads: usize,

    /// Range of integer values inserted in the set (default: twice the
    /// initial size)
    #[arg(short = 'r', long = "range")]
    range: Option<i32>,

    /// RNG seed (0 = time-based)
    #[arg(short = 's', long = "seed", default_value_t = 0)]
    seed: u64,

    /// Percentage of operations that are updates
    #[arg(short = 'u', long = "update-rate", default_value_t = 20)]
    update_rate: u32,
}

#[derive(Debug, Default, Clone, Copy)]
struct WorkerReport {
    nb_add: u64,
    nb_remove: u64,
    nb_contains: u64,
    nb_found: u64,
    diff: i64,
}

#[derive(Debug, Clone, Copy)]
struct WorkerConfig {
    alg: AlgType,
    max_segment_length: i32,
    free_batch_size: usize,
    initial: usize,
    range: i32,
    update: u32,
    alternate: bool,
    seed: u64,
}

fn set_contains(alg: AlgType, list: &SkipList, st: &StThread, key: i32) -> bool {
    match alg {
        AlgType::Pure => list.contains_pure(key),
        AlgType::HazardPointers => list.contains_hp(st, key),
        AlgType::StackTrack => list.contains_stacktrack(st, key),
        AlgType::Forkscan => list.contains_forkscan(key),
    }
}

fn set_add(alg: AlgType, list: &SkipList, st: &StThread, rng: &mut SmallRng, key: i32) -> bool {
    match alg {
        AlgType::Pure => list.insert_pure(st, rng, key),
        AlgType::HazardPointers => list.insert_hp(st, rng, key),
        AlgType::StackTrack => list.insert_stacktrack(st, rng, key),
        AlgType::Forkscan => list.insert_forkscan(st, rng, key),
    }
}

fn set_remove(alg: AlgType, list: &SkipList, st: &StThread, key: i32) -> bool {
    match alg {
        AlgType::Pure => list.remove_pure(st, key),
        AlgType::HazardPointers => list.remove_hp(st, key),
        AlgType::StackTrack => list.remove_stacktrack(st, key),
        AlgType::Forkscan => list.remove_forkscan(st, key),
    }
}

fn worker(
    cfg: WorkerConfig,
    list: Arc<SkipList>,
    barrier: Arc<Barrier>,
    stop: Arc<AtomicBool>,
) -> WorkerReport {
    let st = StThread::register(cfg.max_segment_length, cfg.free_batch_size);
    let mut rng = SmallRng::seed_from_u64(cfg.seed);
    let mut report = WorkerReport::default();

    if st.uniq_id() == 0 {
        println!("[0] Init: adding {} entries to set.", cfg.initial);
        let mut added = 0;
        while added < cfg.initial {
            let key = rng.random_range(0..cfg.range) + 1;
            if set_add(cfg.alg, &list, st, &mut rng, key) {
                added += 1;
            }
        }
        println!("[0] Init: done.");
    }

    barrier.wait();

    // Alternate mode removes the key it just inserted; otherwise the low bit
    // of the roll picks between insert and remove.
    let mut last: Option<i32> = None;

    while !stop.load(Ordering::Relaxed) {
        let op = rng.random_range(0..100u32);

        if op < cfg.update {
            if cfg.alternate {
                match last {
                    None => {
                        let key = rng.random_range(0..cfg.range) + 1;
                        if set_add(cfg.alg, &list, st, &mut rng, key) {
                            report.diff += 1;
                            last = Some(key);
                        }
                        report.nb_add += 1;
                    }
                    Some(key) => {
                        if set_remove(cfg.alg, &list, st, key) {
                            report.diff -= 1;
                        }
                        report.nb_remove += 1;
                        last = None;
                    }
                }
            } else {
                let key = rng.random_range(0..cfg.range) + 1;
                if op & 0x01 == 0 {
                    if set_add(cfg.alg, &list, st, &mut rng, key) {
                        report.diff += 1;
                    }
                    report.nb_add += 1;
                } else {
                    if set_remove(cfg.alg, &list, st, key) {
                        report.diff -= 1;
                    }
                    report.nb_remove += 1;
                }
            }
        } else {
            let key = rng.random_range(0..cfg.range) + 1;
            if set_contains(cfg.alg, &list, st, key) {
                report.nb_found += 1;
            }
            report.nb_contains += 1;
        }
    }

    st.thread_finish();
    report
}

#[cfg(unix)]
fn block_termination_signals() {
    unsafe {
        let mut set: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut set);
        libc::sigaddset(&mut set, libc::SIGTERM);
        libc::sigaddset(&mut set, libc::SIGINT);
        libc::pthread_sigmask(libc::SIG_BLOCK, &set, std::ptr::null_mut());
    }
}

#[cfg(unix)]
fn wait_for_termination_signal() {
    unsafe {
        let mut set: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut set);
        libc::sigaddset(&mut set, libc::SIGTERM);
        libc::sigaddset(&mut set, libc::SIGINT);
        let mut sig: libc::c_int = 0;
        libc::sigwait(&set, &mut sig);
    }
}

#[cfg(not(unix))]
fn block_termination_signals() {}

#[cfg(not(unix))]
fn wait_for_termination_signal() {
    loop {
        thread::park();
    }
}

fn validate(args: &Args) -> (AlgType, i32) {
    let alg = AlgType::from_code(args.alg_type).unwrap_or_else(|| {
        eprintln!(
            "ERROR: protocol type must be 0 (pure) or 1 (hazard pointers) \
             or 2 (stack track) or 3 (forkscan)."
        );
        process::exit(1);
    });

    if args.free_batch_size == 0 || args.free_batch_size > ST_MAX_FREE_LIST {
        eprintln!(
            "ERROR: free batch size must be between 1 and {ST_MAX_FREE_LIST}"
        );
        process::exit(1);
    }

    if args.num_threads == 0 || args.num_threads > ST_MAX_THREADS {
        eprintln!("ERROR: thread count must be between 1 and {ST_MAX_THREADS}");
        process::exit(1);
    }

    if args.update_rate > 100 {
        eprintln!("ERROR: update rate is a percentage");
        process::exit(1);
    }

    let range = args
        .range
        .unwrap_or_else(|| (args.initial_size as i32).saturating_mul(2));
    if range <= 0 || (range as usize) < args.initial_size || range >= MAX_KEY {
        eprintln!(
            "ERROR: range must satisfy initial-size <= range < {MAX_KEY}"
        );
        process::exit(1);
    }

    (alg, range)
}

fn main() {
    let args = Args::parse();
    let (alg, range) = validate(&args);
    let alternate = !args.do_not_alternate;

    let seed = if args.seed == 0 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(1)
    } else {
        args.seed
    };

    println!(
        "{}",
        format!("Set type           : skip-list [** {} **]", alg.label())
            .green()
            .bold()
    );
    println!("Max segment length : {}", args.max_segment_length);
    println!("Max free list      : {}", args.free_batch_size);
    println!("Duration           : {}", args.duration);
    println!("Initial size       : {}", args.initial_size);
    println!("Nb threads         : {}", args.num_threads);
    println!("Value range        : {}", range);
    println!("Seed               : {}", seed);
    println!("Update rate        : {}", args.update_rate);
    println!("Alternate          : {}", alternate);

    if !alternate && range != (args.initial_size as i32) * 2 {
        println!(
            "{}",
            "WARNING: range is not twice the initial set size".yellow()
        );
    }

    let list = Arc::new(SkipList::new());
    let stop = Arc::new(AtomicBool::new(false));
    let barrier = Arc::new(Barrier::new(args.num_threads + 1));

    let mut master_rng = SmallRng::seed_from_u64(seed);

    if args.duration == 0 {
        // Workers inherit the mask, so only the sigwait below sees the
        // termination signal.
        block_termination_signals();
    }

    let mut handles = Vec::with_capacity(args.num_threads);
    for i in 0..args.num_threads {
        println!("Creating thread {i}");

        let cfg = WorkerConfig {
            alg,
            max_segment_length: args.max_segment_length,
            free_batch_size: args.free_batch_size,
            initial: args.initial_size,
            range,
            update: args.update_rate,
            alternate,
            seed: master_rng.random::<u64>(),
        };
        let list = Arc::clone(&list);
        let barrier = Arc::clone(&barrier);
        let stop = Arc::clone(&stop);

        let handle = thread::Builder::new()
            .name(format!("worker-{i}"))
            .spawn(move || worker(cfg, list, barrier, stop));
        match handle {
            Ok(h) => handles.push(h),
            Err(e) => {
                eprintln!("Error creating thread: {e}");
                process::exit(1);
            }
        }
    }

    barrier.wait();

    println!("{}", "STARTING...".yellow().bold());
    let start = Instant::now();
    if args.duration > 0 {
        thread::sleep(Duration::from_millis(args.duration));
    } else {
        wait_for_termination_signal();
    }
    stop.store(true, Ordering::SeqCst);
    let elapsed = start.elapsed();
    println!("{}", "STOPPING...".yellow().bold());

    let mut reports = Vec::with_capacity(handles.len());
    for h in handles {
        match h.join() {
            Ok(report) => reports.push(report),
            Err(_) => {
                eprintln!("Error waiting for thread completion");
                process::exit(1);
            }
        }
    }

    let mut reads = 0u64;
    let mut updates = 0u64;
    let mut expected = args.initial_size as i64;
    for (i, r) in reports.iter().enumerate() {
        println!("Thread {i}");
        println!("  #add        : {}", r.nb_add);
        println!("  #remove     : {}", r.nb_remove);
        println!("  #contains   : {}", r.nb_contains);
        println!("  #found      : {}", r.nb_found);
        reads += r.nb_contains;
        updates += r.nb_add + r.nb_remove;
        expected += r.diff;
    }

    let cur_size = list.size() as i64;
    let ms = elapsed.as_millis().max(1) as f64;
    let total = reads + updates;

    println!("Set size       : {cur_size} (expected: {expected})");
    println!("Duration       : {} (ms)", elapsed.as_millis());
    println!("#ops           : {} ({:.2} / s)", total, total as f64 * 1000.0 / ms);
    println!("#read ops      : {} ({:.2} / s)", reads, reads as f64 * 1000.0 / ms);
    println!(
        "#update ops    : {} ({:.2} / s)",
        updates,
        updates as f64 * 1000.0 / ms
    );

    println!();
    list.print_stats();
    println!();

    if cur_size != expected {
        println!("{}", "----------------------------".red());
        println!(
            "{}",
            format!("WARNING: The set size [{cur_size}] is not as expected [{expected}]")
                .red()
                .bold()
        );
        println!("{}", "----------------------------".red());
    }

    process::exit(0);
}
