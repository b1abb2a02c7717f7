use core::{
    iter::FusedIterator,
    marker::PhantomData,
    ptr::{self, NonNull},
    sync::atomic::{AtomicPtr, Ordering},
};

/// A node that can be linked into an [`IntrusiveStack`].
///
/// The link is owned by whichever stack the node is currently pushed onto; a
/// node must never be a member of two stacks through the same link at once.
pub trait StackNode: Sized {
    /// The node's `next` link.
    fn next_link(&self) -> &AtomicPtr<Self>;
}

/// A multi-producer, single-consumer lock-free intrusive stack.
///
/// Any number of threads may [`push`](Self::push) concurrently. The consumer
/// detaches the whole chain at once with [`take_all`](Self::take_all); there
/// is no single-element pop, which sidesteps the ABA problem entirely (the
/// head is only ever replaced, never compared against a node that could have
/// been recycled in between).
///
/// ```text
///  push(C)           take_all()            reverse()
///  head ─► C ─► B ─► A    chain: C ─► B ─► A    A ─► B ─► C
/// ```
///
/// Producers publish with `Release`, the consumer detaches with `Acquire`, so
/// everything a producer wrote into a node before pushing it is visible to
/// the consumer that takes it.
pub struct IntrusiveStack<N: StackNode> {
    head: AtomicPtr<N>,
}

// Safety: the stack only moves raw node pointers between threads.
unsafe impl<N: StackNode + Sync> Sync for IntrusiveStack<N> {}
unsafe impl<N: StackNode + Sync> Send for IntrusiveStack<N> {}

impl<N: StackNode> Default for IntrusiveStack<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<N: StackNode> IntrusiveStack<N> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Pushes `node` and returns `true` if the stack was empty before.
    ///
    /// The "was empty" answer is what the caller uses to decide whether the
    /// consumer needs a wake-up: a non-empty stack already has one pending.
    ///
    /// # Safety
    ///
    /// `node` must stay valid (and must not be pushed again) until the
    /// consumer has taken it off the stack with [`take_all`](Self::take_all)
    /// and finished walking past it.
    #[inline]
    pub unsafe fn push(&self, node: NonNull<N>) -> bool {
        // SAFETY: caller guarantees the node is live.
        let link = unsafe { node.as_ref() }.next_link();
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            link.store(head, Ordering::Relaxed);
            match self.head.compare_exchange_weak(
                head,
                node.as_ptr(),
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return head.is_null(),
                Err(actual) => head = actual,
            }
        }
    }

    /// Detaches every node at once, newest first.
    #[inline]
    #[must_use]
    pub fn take_all(&self) -> Chain<N> {
        Chain {
            head: self.head.swap(ptr::null_mut(), Ordering::AcqRel),
            _nodes: PhantomData,
        }
    }

    /// A racy snapshot; only meaningful to the consumer.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Relaxed).is_null()
    }
}

/// A detached chain of nodes, owned by the consumer that took it.
///
/// Iteration reads a node's `next` link *before* yielding the node, so the
/// caller may hand the yielded node back to its producers right away.
pub struct Chain<N: StackNode> {
    head: *mut N,
    _nodes: PhantomData<NonNull<N>>,
}

impl<N: StackNode> Default for Chain<N> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<N: StackNode> Chain<N> {
    /// A chain with no nodes.
    #[inline]
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            head: ptr::null_mut(),
            _nodes: PhantomData,
        }
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.head.is_null()
    }

    /// Reverses the chain in place, turning push order (LIFO) back into
    /// submission order (FIFO).
    #[must_use]
    pub fn reverse(mut self) -> Self {
        let mut reversed: *mut N = ptr::null_mut();
        while let Some(node) = NonNull::new(self.head) {
            // SAFETY: nodes of a detached chain are exclusively ours.
            let link = unsafe { node.as_ref() }.next_link();
            self.head = link.load(Ordering::Relaxed);
            link.store(reversed, Ordering::Relaxed);
            reversed = node.as_ptr();
        }
        self.head = reversed;
        self
    }
}

impl<N: StackNode> Iterator for Chain<N> {
    type Item = NonNull<N>;

    fn next(&mut self) -> Option<Self::Item> {
        let node = NonNull::new(self.head)?;
        // SAFETY: nodes of a detached chain are exclusively ours.
        self.head = unsafe { node.as_ref() }.next_link().load(Ordering::Relaxed);
        Some(node)
    }
}

impl<N: StackNode> FusedIterator for Chain<N> {}
