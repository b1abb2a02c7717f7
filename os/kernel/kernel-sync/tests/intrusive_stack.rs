use kernel_sync::{IntrusiveStack, StackNode};
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

struct Item {
    producer: usize,
    seq: usize,
    next: AtomicPtr<Item>,
}

impl StackNode for Item {
    fn next_link(&self) -> &AtomicPtr<Self> {
        &self.next
    }
}

/// Items are leaked so they outlive every thread; the test is short-lived.
fn make_items(producer: usize, count: usize) -> &'static [Item] {
    let items: Vec<Item> = (0..count)
        .map(|seq| Item {
            producer,
            seq,
            next: AtomicPtr::new(ptr::null_mut()),
        })
        .collect();
    Box::leak(items.into_boxed_slice())
}

#[test]
fn concurrent_producers_preserve_per_producer_order() {
    let producers = 4;
    let per_producer = 5_000;

    let stack: Arc<IntrusiveStack<Item>> = Arc::new(IntrusiveStack::new());
    let start = Arc::new(Barrier::new(producers + 1));
    let done = Arc::new(AtomicUsize::new(0));
    let empty_transitions = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::with_capacity(producers);
    for p in 0..producers {
        let stack = Arc::clone(&stack);
        let start = Arc::clone(&start);
        let done = Arc::clone(&done);
        let empty_transitions = Arc::clone(&empty_transitions);
        let items = make_items(p, per_producer);
        handles.push(thread::spawn(move || {
            start.wait();
            for item in items {
                if unsafe { stack.push(NonNull::from(item)) } {
                    empty_transitions.fetch_add(1, Ordering::Relaxed);
                }
            }
            done.fetch_add(1, Ordering::Release);
        }));
    }

    start.wait();
    let mut next_expected = vec![0usize; producers];
    let mut batches = 0usize;
    loop {
        let finished = done.load(Ordering::Acquire) == producers;
        let chain = stack.take_all();
        if !chain.is_empty() {
            batches += 1;
        }
        for node in chain.reverse() {
            let item = unsafe { node.as_ref() };
            assert_eq!(
                item.seq, next_expected[item.producer],
                "producer {} delivered out of order",
                item.producer
            );
            next_expected[item.producer] += 1;
        }
        if finished {
            break;
        }
        thread::yield_now();
    }

    for h in handles {
        h.join().unwrap();
    }

    assert!(next_expected.iter().all(|&n| n == per_producer));
    // Every non-empty batch began with exactly one push that saw an empty stack.
    assert_eq!(empty_transitions.load(Ordering::Relaxed), batches);
}

#[test]
fn exactly_one_pusher_sees_empty() {
    let threads = 8;
    for _ in 0..200 {
        let stack: Arc<IntrusiveStack<Item>> = Arc::new(IntrusiveStack::new());
        let start = Arc::new(Barrier::new(threads));
        let saw_empty = Arc::new(AtomicBool::new(false));

        let handles: Vec<_> = (0..threads)
            .map(|p| {
                let stack = Arc::clone(&stack);
                let start = Arc::clone(&start);
                let saw_empty = Arc::clone(&saw_empty);
                let item = &make_items(p, 1)[0];
                thread::spawn(move || {
                    start.wait();
                    if unsafe { stack.push(NonNull::from(item)) } {
                        assert!(
                            !saw_empty.swap(true, Ordering::SeqCst),
                            "two pushers observed an empty stack"
                        );
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert!(saw_empty.load(Ordering::SeqCst));
        assert_eq!(stack.take_all().count(), threads);
    }
}
