//! Deferred reclamation for parameter snapshots
//!
//! The audio thread holds `basedrop::Shared<ParameterSnapshot>` references.
//! When it swaps to a newer snapshot and drops the last reference to the old
//! one, `basedrop` only enqueues the pointer; the memory is freed here, on a
//! dedicated `param-gc` thread, so the callback never enters the allocator.

use basedrop::{Collector, Handle};
use std::io;
use std::sync::mpsc;
use std::sync::OnceLock;
use std::thread;
use std::time::Duration;

/// Global handle for creating `Shared<T>` allocations
static GC_HANDLE: OnceLock<Handle> = OnceLock::new();

/// How often queued drops are reclaimed
const COLLECT_INTERVAL: Duration = Duration::from_millis(50);

/// Spawn the collector thread and wait for its handle
fn spawn_collector() -> io::Result<Handle> {
    let (tx, rx) = mpsc::channel();

    thread::Builder::new()
        .name("param-gc".to_string())
        .spawn(move || {
            // Collector is !Sync, so it is created and kept on this thread
            let mut collector = Collector::new();
            if tx.send(collector.handle()).is_err() {
                return;
            }
            log::info!("Parameter GC thread started");

            loop {
                collector.collect();
                thread::sleep(COLLECT_INTERVAL);
            }
        })?;

    rx.recv()
        .map_err(|_| io::Error::new(io::ErrorKind::Other, "parameter GC thread exited before handing out its handle"))
}

/// Handle of the process-wide parameter collector, started on first use
pub fn gc_handle() -> io::Result<Handle> {
    if let Some(handle) = GC_HANDLE.get() {
        return Ok(handle.clone());
    }
    let handle = spawn_collector()?;
    // A concurrent first call may have won; its collector serves everyone
    // and ours just idles.
    Ok(GC_HANDLE.get_or_init(|| handle).clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use basedrop::Shared;

    #[test]
    fn test_handle_is_reused() {
        let first = gc_handle().unwrap();
        let second = gc_handle().unwrap();
        let a = Shared::new(&first, [1.0_f32; 16]);
        let b = Shared::new(&second, 7u64);
        assert_eq!(a[3], 1.0);
        assert_eq!(*b, 7);
    }
}
