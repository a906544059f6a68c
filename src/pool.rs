use rayon::prelude::*;
use tracing::warn;

/// Apply `f` to every item on a pool of `parallelism` threads.
///
/// Results come back in input order. A failing item only shows up in its own
/// result slot. With `parallelism <= 1`, or when the pool cannot be built,
/// items are processed sequentially on the calling thread.
pub fn run_all<T, R, F>(items: &[T], parallelism: usize, f: F) -> Vec<R>
where
    T: Sync,
    R: Send,
    F: Fn(&T) -> R + Sync,
{
    if parallelism <= 1 || items.len() <= 1 {
        return items.iter().map(&f).collect();
    }

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(parallelism)
        .thread_name(|idx| format!("kira-acquire-{idx}"))
        .build();
    match pool {
        Ok(pool) => pool.install(|| items.par_iter().map(&f).collect()),
        Err(err) => {
            warn!(error = %err, "worker pool unavailable; running sequentially");
            items.iter().map(&f).collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    use super::*;

    #[test]
    fn keeps_input_order() {
        let items: Vec<u64> = (0..32).collect();
        let out = run_all(&items, 4, |n| {
            thread::sleep(Duration::from_millis(32 - n));
            n * 10
        });
        assert_eq!(out, items.iter().map(|n| n * 10).collect::<Vec<_>>());
    }

    #[test]
    fn never_exceeds_parallelism() {
        let active = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);
        let items: Vec<usize> = (0..12).collect();
        run_all(&items, 3, |_| {
            let now = active.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(20));
            active.fetch_sub(1, Ordering::SeqCst);
        });
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[test]
    fn failures_stay_in_their_slot() {
        let items = vec![1, 2, 3];
        let out: Vec<Result<i32, String>> = run_all(&items, 1, |n| {
            if *n == 2 {
                Err("boom".to_string())
            } else {
                Ok(*n)
            }
        });
        assert_eq!(out, vec![Ok(1), Err("boom".to_string()), Ok(3)]);
    }
}
