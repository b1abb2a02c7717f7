use kernel_sync::{FreeListLink, TaggedFreeList};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

#[derive(Default)]
struct Slot {
    link: AtomicU32,
    owned: AtomicBool,
}

impl FreeListLink for Slot {
    fn free_link(&self) -> &AtomicU32 {
        &self.link
    }
}

struct Shared {
    slab: Vec<Slot>,
    list: TaggedFreeList,
}

fn shared(slots: usize) -> Arc<Shared> {
    let slab: Vec<Slot> = (0..slots).map(|_| Slot::default()).collect();
    let list = TaggedFreeList::new();
    for i in 0..slots {
        list.push(&slab, i);
    }
    Arc::new(Shared { slab, list })
}

#[test]
fn slots_are_never_handed_out_twice() {
    let threads = 8;
    let iters = 20_000;
    let s = shared(4); // fewer slots than threads forces heavy reuse
    let start = Arc::new(Barrier::new(threads));

    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let s = Arc::clone(&s);
            let start = Arc::clone(&start);
            thread::spawn(move || {
                start.wait();
                let mut got = 0usize;
                for _ in 0..iters {
                    let Some(i) = s.list.try_pop(&s.slab) else {
                        thread::yield_now();
                        continue;
                    };
                    assert!(
                        !s.slab[i].owned.swap(true, Ordering::SeqCst),
                        "slot {i} handed out twice"
                    );
                    got += 1;
                    s.slab[i].owned.store(false, Ordering::SeqCst);
                    s.list.push(&s.slab, i);
                }
                got
            })
        })
        .collect();

    let total: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
    assert!(total > 0);

    // Conservation: every slot is back on the list exactly once.
    let mut seen = vec![false; s.slab.len()];
    while let Some(i) = s.list.try_pop(&s.slab) {
        assert!(!seen[i], "slot {i} on the list twice");
        seen[i] = true;
    }
    assert!(seen.iter().all(|&b| b));
    assert!(s.list.is_empty());
}

#[test]
fn holding_slots_across_pops_keeps_the_list_consistent() {
    let threads = 4;
    let hold = 3;
    let s = shared(threads * hold);
    let start = Arc::new(Barrier::new(threads));

    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let s = Arc::clone(&s);
            let start = Arc::clone(&start);
            thread::spawn(move || {
                start.wait();
                for _ in 0..5_000 {
                    let mut held = Vec::with_capacity(hold);
                    while held.len() < hold {
                        if let Some(i) = s.list.try_pop(&s.slab) {
                            assert!(!s.slab[i].owned.swap(true, Ordering::SeqCst));
                            held.push(i);
                        }
                    }
                    // release in a different order than acquired
                    for i in held.into_iter().rev() {
                        s.slab[i].owned.store(false, Ordering::SeqCst);
                        s.list.push(&s.slab, i);
                    }
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    let mut count = 0;
    while s.list.try_pop(&s.slab).is_some() {
        count += 1;
    }
    assert_eq!(count, threads * hold);
}
