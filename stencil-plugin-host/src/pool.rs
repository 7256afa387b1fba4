//! Process-wide byte buffer pool
//!
//! Generation is buffer-heavy: every file's content passes through at least
//! one scratch buffer. Buffers are reused across invocations; a buffer must
//! not be touched after it has been returned to the pool.

use std::sync::Mutex;

static POOL: Mutex<Vec<Vec<u8>>> = Mutex::new(Vec::new());

/// Fetch a cleared buffer from the pool, allocating if the pool is empty.
pub fn get_buffer() -> Vec<u8> {
    let mut pool = POOL.lock().unwrap_or_else(|e| e.into_inner());
    let mut buf = pool.pop().unwrap_or_default();
    buf.clear();
    buf
}

/// Return a buffer to the pool.
pub fn put_buffer(buf: Vec<u8>) {
    let mut pool = POOL.lock().unwrap_or_else(|e| e.into_inner());
    pool.push(buf);
}
