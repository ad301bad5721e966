use std::cell::RefCell;

/// Size of one scratch chunk. Large enough for a rendered log line or a
/// rewritten header block.
pub(crate) const SCRATCH_SIZE: usize = 16384;

thread_local! {
    static SCRATCH: RefCell<ScratchArena> = RefCell::new(ScratchArena::new());
}

/// A per-thread scratch arena handed out in chunks and reset wholesale at
/// task entry. Chunks must not be held across suspension points; resetting
/// invalidates all previously returned chunks.
pub(crate) struct ScratchArena {
    chunks: Vec<Vec<u8>>,
    next: usize,
}

impl ScratchArena {
    fn new() -> ScratchArena {
        ScratchArena {
            chunks: Vec::new(),
            next: 0,
        }
    }
}

/// Resets the calling thread's arena. Called once at task entry.
pub(crate) fn reset() {
    SCRATCH.with(|s| s.borrow_mut().next = 0);
}

/// Takes the next free chunk out of the arena, allocating on first use.
/// The chunk comes back empty with `SCRATCH_SIZE` capacity and is returned
/// to the arena by `put_chunk`.
pub(crate) fn take_chunk() -> Vec<u8> {
    SCRATCH.with(|s| {
        let mut arena = s.borrow_mut();
        let idx = arena.next;
        arena.next += 1;
        if idx < arena.chunks.len() {
            let mut chunk = std::mem::take(&mut arena.chunks[idx]);
            chunk.clear();
            chunk
        } else {
            Vec::with_capacity(SCRATCH_SIZE)
        }
    })
}

/// Hands a chunk back so the allocation is reused by the next taker.
pub(crate) fn put_chunk(chunk: Vec<u8>) {
    SCRATCH.with(|s| {
        let mut arena = s.borrow_mut();
        if arena.next > 0 {
            arena.next -= 1;
        }
        let idx = arena.next;
        if idx < arena.chunks.len() {
            arena.chunks[idx] = chunk;
        } else {
            arena.chunks.push(chunk);
        }
    })
}
