// CallbackInvoker
//
// Runs every harvested callback exactly once, in list order. Each node is unlinked before its callback runs, so
// the callback owns (and is free to drop) everything the node carried.
//
// NOTE: there is no protection against a callback which blocks or panics. A callback that never returns stalls all
// reclamation from then on, and a panic unwinds straight out of tick().

use mem::CallbackList;

use crate::stats::BatchStats;

pub(crate) fn drain(pending: &mut CallbackList, stats: &BatchStats) -> usize {
    let mut invoked = 0;
    while let Some(node) = pending.pop_front() {
        node.invoke();
        stats.record_invoked();
        invoked += 1;
    }
    invoked
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use mem::CallbackNode;
    use std::sync::{Arc, Mutex};

    #[test]
    fn drain_runs_each_once_in_order() {
        let stats = BatchStats::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut pending = CallbackList::new();

        for tag in 0..4 {
            let log = log.clone();
            stats.record_submit();
            pending.push_back(CallbackNode::new(move || log.lock().unwrap().push(tag)));
        }

        assert_eq!(drain(&mut pending, &stats), 4);
        assert!(pending.is_empty());
        // A second drain finds nothing to run
        assert_eq!(drain(&mut pending, &stats), 0);

        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2, 3]);
        let snap = stats.snapshot();
        assert_eq!(snap.invoked, 4);
        assert_eq!(snap.outstanding, 0);
    }
}
