use num_format::{Locale, ToFormattedString};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const REPORT_INTERVAL: Duration = Duration::from_secs(5);
const BATCH_SIZE: u64 = 1000;

static STOP: AtomicBool = AtomicBool::new(false);

// Padded to a cache line so workers don't contend on the counters.
#[repr(C)]
#[derive(Default)]
struct WorkerStats {
    count: AtomicU64,
    sampled: AtomicU64,
    padding: [u64; 14],
}

/// Run `func` on every physical core but one until Ctrl-C, reporting the
/// number of calls per second and the share of calls returning `true`.
pub fn test_throughput<F>(func: F)
where
    F: Fn() -> bool + Sync + Send + 'static,
{
    ctrlc::set_handler(move || {
        STOP.store(true, Ordering::SeqCst);
    })
    .expect("Error setting Ctrl-C handler");

    let num_threads = num_cpus::get_physical().max(2);
    println!("Number of threads: {}", num_threads);
    let func = Arc::new(func);
    let stats: Arc<Vec<WorkerStats>> =
        Arc::new((0..num_threads).map(|_| WorkerStats::default()).collect());
    let mut handles = Vec::with_capacity(num_threads);

    let monitor_stats = Arc::clone(&stats);
    handles.push(thread::spawn(move || {
        let mut last_report = Instant::now();
        let (mut last_count, mut last_sampled) = (0u64, 0u64);
        while !STOP.load(Ordering::SeqCst) {
            thread::sleep(REPORT_INTERVAL);

            let count: u64 = monitor_stats
                .iter()
                .map(|s| s.count.load(Ordering::Relaxed))
                .sum();
            let sampled: u64 = monitor_stats
                .iter()
                .map(|s| s.sampled.load(Ordering::Relaxed))
                .sum();
            let elapsed = last_report.elapsed().as_secs_f64();
            let window = count - last_count;
            let ratio = if window == 0 {
                0.0
            } else {
                (sampled - last_sampled) as f64 / window as f64
            };
            println!(
                "Throughput: {} decisions/sec, sampled: {:.2}%",
                ((window as f64 / elapsed) as u64).to_formatted_string(&Locale::en),
                ratio * 100.0
            );

            last_report = Instant::now();
            last_count = count;
            last_sampled = sampled;
        }
    }));

    for thread_index in 0..num_threads - 1 {
        let stats = Arc::clone(&stats);
        let func = Arc::clone(&func);
        handles.push(thread::spawn(move || {
            while !STOP.load(Ordering::SeqCst) {
                let mut sampled = 0;
                for _ in 0..BATCH_SIZE {
                    if func() {
                        sampled += 1;
                    }
                }
                stats[thread_index]
                    .count
                    .fetch_add(BATCH_SIZE, Ordering::Relaxed);
                stats[thread_index]
                    .sampled
                    .fetch_add(sampled, Ordering::Relaxed);
            }
        }));
    }

    for handle in handles {
        handle.join().unwrap();
    }
}
