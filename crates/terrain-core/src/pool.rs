use std::thread;

use crossbeam_channel::bounded;

use crate::cancel::CancelToken;

/// Buffer size for the bounded channels between a feeder and its workers.
pub const CHANNEL_CAP: usize = 128;

/// Run `work` over `items` on a bounded pool of scoped worker threads.
///
/// One feeder thread fills a bounded channel, `workers` threads drain it,
/// and the calling thread collects the outputs as they arrive. Output
/// order is not preserved. Cancellation stops feeding and lets in-flight
/// work drain.
pub fn run_bounded<T, R, F>(
    items: Vec<T>,
    workers: usize,
    cancel: &CancelToken,
    work: F,
) -> Vec<R>
where
    T: Send,
    R: Send,
    F: Fn(T) -> R + Sync,
{
    if items.is_empty() || cancel.is_cancelled() {
        return Vec::new();
    }
    let workers = workers.clamp(1, items.len());

    thread::scope(|scope| {
        let (item_tx, item_rx) = bounded::<T>(CHANNEL_CAP);
        let (out_tx, out_rx) = bounded::<R>(CHANNEL_CAP);

        let feeder_cancel = cancel.clone();
        scope.spawn(move || {
            for item in items {
                if feeder_cancel.is_cancelled() || item_tx.send(item).is_err() {
                    break;
                }
            }
            // channel closes when item_tx drops
        });

        let work = &work;
        for _ in 0..workers {
            let item_rx = item_rx.clone();
            let out_tx = out_tx.clone();
            let cancel = cancel.clone();
            scope.spawn(move || {
                for item in item_rx.iter() {
                    if cancel.is_cancelled() {
                        break;
                    }
                    if out_tx.send(work(item)).is_err() {
                        break;
                    }
                }
            });
        }
        drop(item_rx);
        drop(out_tx);

        out_rx.iter().collect()
    })
}
