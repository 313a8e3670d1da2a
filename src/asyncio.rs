//! Asynchronous serial I/O: two independent dispatch-queue-backed workers (rx and tx),
//! each with its own buffer pool, layered over pluggable blocking read/write callbacks.
//!
//! The rx loop issues exactly one `reader.read(buf, timeout)` call per message and hands
//! whatever bytes come back to the receive callback; the tx path issues exactly one
//! `writer.write(buf, timeout)` call per send and decides success solely by comparing
//! the returned byte count against the requested length. Neither side invents its own
//! additional framing call — that's left entirely to the caller's `Rd`/`Wr`
//! implementation, matching the original's single-call read/write contract.
//!
//! The lifecycle atomic mirrors the original's `Uninitialized -> Initializing ->
//! Initialized -> Uninitializing -> Uninitialized` cycle via compare-and-swap, so
//! concurrent `start`/`stop` callers get a clear rejection rather than racing.

use crate::dispatch::DispatchQueue;
use crate::error::{ FluxError, Result };
use crate::platform::EventFlag;
use crate::pool::{ Pool, PoolRef };
use std::sync::atomic::{ AtomicBool, AtomicU8, Ordering };
use std::sync::Arc;
use std::time::Duration;

const STARTED_BIT: u32 = 1 << 0;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LifecycleState {
    Uninitialized = 0,
    Initializing = 1,
    Initialized = 2,
    Uninitializing = 3,
}

struct Lifecycle(AtomicU8);

impl Lifecycle {
    fn new() -> Self {
        Self(AtomicU8::new(LifecycleState::Uninitialized as u8))
    }

    fn get(&self) -> LifecycleState {
        match self.0.load(Ordering::Acquire) {
            0 => LifecycleState::Uninitialized,
            1 => LifecycleState::Initializing,
            2 => LifecycleState::Initialized,
            3 => LifecycleState::Uninitializing,
            _ => unreachable!("lifecycle state corrupted"),
        }
    }

    fn set(&self, state: LifecycleState) {
        self.0.store(state as u8, Ordering::Release);
    }

    fn cas(&self, from: LifecycleState, to: LifecycleState) -> bool {
        self.0.compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire).is_ok()
    }
}

/// A blocking read of up to `buf.len()` bytes, bounded by `timeout`. The rx loop calls
/// this exactly once per message.
pub trait BlockingRead: Send + Sync {
    fn read(&self, buf: &mut [u8], timeout: Duration) -> std::io::Result<usize>;
}

/// A blocking write of `buf`, bounded by `timeout`. The tx path calls this exactly once
/// per send; success is `bytes_written == buf.len()`.
pub trait BlockingWrite: Send + Sync {
    fn write(&self, buf: &[u8], timeout: Duration) -> std::io::Result<usize>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    Success,
    /// The write call failed, timed out, or wrote fewer bytes than requested.
    SendMessageFail,
    /// The underlying interface is already in an error state and will not accept writes.
    InterfaceInError,
}

/// A fixed-size rx/tx buffer.
pub struct Buffer {
    pub data: Vec<u8>,
    pub len: usize,
}

impl Buffer {
    fn new(capacity: usize) -> Self {
        Self { data: vec![0u8; capacity], len: 0 }
    }
}

/// A handle to a tx buffer allocated via `allocate_tx_token`, sized to the instance's
/// `max_chunk_size`; the payload area is `token.data[..]`.
pub type TxToken = PoolRef<Buffer>;

struct Shared<Rd, Wr> {
    rx_worker: DispatchQueue,
    tx_worker: DispatchQueue,
    rx_pool: Pool<Buffer>,
    tx_pool: Pool<Buffer>,
    reader: Rd,
    writer: Wr,
    lifecycle: Lifecycle,
    started: EventFlag,
    is_in_error: AtomicBool,
    on_receive: Box<dyn Fn(&[u8]) + Send + Sync>,
    max_chunk_size: usize,
    rx_read_timeout: Duration,
    tx_write_timeout: Duration,
}

/// An asynchronous I/O instance: owns rx and tx workers and drives messages over the
/// supplied blocking read/write implementations.
pub struct AsyncIo<Rd, Wr> {
    shared: Arc<Shared<Rd, Wr>>,
}

impl<Rd, Wr> AsyncIo<Rd, Wr> where Rd: BlockingRead + 'static, Wr: BlockingWrite + 'static {
    /// `rx_read_timeout`/`tx_write_timeout` bound each single read/write call (the
    /// original's per-call `1000ms` rx timeout and configurable `tx_write_timeout_ms`).
    pub fn new(
        buffer_capacity: usize,
        pool_capacity: usize,
        max_chunk_size: usize,
        rx_read_timeout: Duration,
        tx_write_timeout: Duration,
        reader: Rd,
        writer: Wr,
        on_receive: impl Fn(&[u8]) + Send + Sync + 'static
    ) -> Result<Self> {
        if max_chunk_size == 0 || max_chunk_size > buffer_capacity {
            return Err(FluxError::config("max_chunk_size must be non-zero and <= buffer_capacity"));
        }
        let rx_worker = DispatchQueue::new(pool_capacity.next_power_of_two())?;
        let tx_worker = DispatchQueue::new(pool_capacity.next_power_of_two())?;
        let rx_pool = Pool::new(pool_capacity, move || Buffer::new(buffer_capacity))?;
        let tx_pool = Pool::new(pool_capacity, move || Buffer::new(buffer_capacity))?;

        Ok(Self {
            shared: Arc::new(Shared {
                rx_worker,
                tx_worker,
                rx_pool,
                tx_pool,
                reader,
                writer,
                lifecycle: Lifecycle::new(),
                started: EventFlag::new(),
                is_in_error: AtomicBool::new(false),
                on_receive: Box::new(on_receive),
                max_chunk_size,
                rx_read_timeout,
                tx_write_timeout,
            }),
        })
    }

    /// Transition `Uninitialized -> Initializing -> Initialized` and start the rx loop.
    /// Returns an error if the instance is not currently `Uninitialized`.
    pub fn start(&self) -> Result<()> {
        if !self.shared.lifecycle.cas(LifecycleState::Uninitialized, LifecycleState::Initializing) {
            return Err(FluxError::config("asyncio instance is not in the Uninitialized state"));
        }
        let shared = self.shared.clone();
        let submitted = self.shared.rx_worker.async_submit(move || {
            shared.lifecycle.set(LifecycleState::Initialized);
            shared.started.send(STARTED_BIT);
            rx_loop(shared);
        });
        if !submitted {
            self.shared.lifecycle.set(LifecycleState::Uninitialized);
            return Err(FluxError::unexpected("failed to submit rx loop to dispatch queue"));
        }
        self.shared.started.wait(STARTED_BIT, crate::platform::WaitMode::Any, false, Some(Duration::from_secs(5)));
        Ok(())
    }

    /// Transition `Initialized -> Uninitializing -> Uninitialized`, stop accepting new
    /// rx dispatches, and join both workers.
    pub fn stop(&self) -> Result<()> {
        if !self.shared.lifecycle.cas(LifecycleState::Initialized, LifecycleState::Uninitializing) {
            return Err(FluxError::config("asyncio instance is not in the Initialized state"));
        }
        self.shared.rx_worker.shutdown();
        self.shared.tx_worker.shutdown();
        self.shared.lifecycle.set(LifecycleState::Uninitialized);
        Ok(())
    }

    pub fn is_in_error(&self) -> bool {
        self.shared.is_in_error.load(Ordering::Acquire)
    }

    /// Allocate a tx token sized to carry up to `max_chunk_size` bytes of payload.
    pub fn allocate_tx_token(&self) -> Result<TxToken> {
        self.shared.tx_pool.try_alloc()
    }

    pub fn tx_token_max_data_size(&self) -> usize {
        self.shared.max_chunk_size
    }

    /// Fire-and-forget send of the first `len` bytes of `token`'s buffer: the actual
    /// write happens on the tx dispatch thread, and `completion` is invoked exactly once
    /// with the outcome, whether the send was attempted or rejected up front. The caller
    /// supplies whatever context it needs by capturing it in `completion` — the Rust
    /// closure already carries what the original passed as a separate `private` pointer.
    pub fn send_buffer(&self, mut token: TxToken, len: usize, completion: impl FnOnce(SendStatus) + Send + 'static) {
        if self.shared.is_in_error.load(Ordering::Acquire) {
            completion(SendStatus::InterfaceInError);
            return;
        }
        if len > token.data.len() {
            completion(SendStatus::SendMessageFail);
            return;
        }
        token.len = len;
        let shared = self.shared.clone();
        let submitted = self.shared.tx_worker.async_submit(move || {
            let status = match shared.writer.write(&token.data[..token.len], shared.tx_write_timeout) {
                Ok(n) if n == token.len => SendStatus::Success,
                Ok(_) => SendStatus::SendMessageFail,
                Err(_) => {
                    shared.is_in_error.store(true, Ordering::Release);
                    SendStatus::SendMessageFail
                }
            };
            completion(status);
        });
        if !submitted {
            completion(SendStatus::SendMessageFail);
        }
    }
}

fn rx_loop<Rd: BlockingRead + 'static, Wr: BlockingWrite + 'static>(shared: Arc<Shared<Rd, Wr>>) {
    if shared.lifecycle.get() != LifecycleState::Initialized {
        return;
    }
    if let Some(mut buffer) = shared.rx_pool.alloc(Some(Duration::from_millis(100))) {
        match shared.reader.read(&mut buffer.data, shared.rx_read_timeout) {
            Ok(0) => {}
            Ok(n) => {
                buffer.len = n;
                (shared.on_receive)(&buffer.data[..n]);
            }
            Err(_) => {
                shared.is_in_error.store(true, Ordering::Release);
            }
        }
    }
    // Re-dispatch self onto the rx worker for the next message, matching the original's
    // self-rescheduling rx loop, as long as we're still running.
    if shared.lifecycle.get() == LifecycleState::Initialized {
        let shared = shared.clone();
        shared.rx_worker.async_submit(move || rx_loop(shared));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::sync::Mutex as StdMutex;

    struct LoopbackReader {
        frames: StdMutex<std::collections::VecDeque<u8>>,
    }
    impl BlockingRead for LoopbackReader {
        fn read(&self, buf: &mut [u8], _timeout: Duration) -> std::io::Result<usize> {
            let mut frames = self.frames.lock().unwrap();
            let n = buf.len().min(frames.len());
            for slot in buf.iter_mut().take(n) {
                *slot = frames.pop_front().unwrap();
            }
            if n == 0 {
                std::thread::sleep(Duration::from_millis(5));
            }
            Ok(n)
        }
    }

    struct NullWriter;
    impl BlockingWrite for NullWriter {
        fn write(&self, buf: &[u8], _timeout: Duration) -> std::io::Result<usize> {
            Ok(buf.len())
        }
    }

    fn io(reader: LoopbackReader) -> AsyncIo<LoopbackReader, NullWriter> {
        AsyncIo::new(
            64,
            4,
            32,
            Duration::from_millis(1000),
            Duration::from_millis(1000),
            reader,
            NullWriter,
            |_| {}
        ).unwrap()
    }

    #[test]
    fn start_rejects_double_start() {
        let io = io(LoopbackReader { frames: StdMutex::new(Default::default()) });
        io.start().unwrap();
        assert!(io.start().is_err());
        io.stop().unwrap();
    }

    #[test]
    fn send_buffer_succeeds_against_a_healthy_writer() {
        let io = io(LoopbackReader { frames: StdMutex::new(Default::default()) });
        io.start().unwrap();
        let mut token = io.allocate_tx_token().unwrap();
        token.data[..5].copy_from_slice(b"hello");
        let (tx, rx) = mpsc::channel();
        io.send_buffer(token, 5, move |status| {
            let _ = tx.send(status);
        });
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), SendStatus::Success);
        io.stop().unwrap();
    }

    #[test]
    fn send_buffer_rejects_oversized_length_without_touching_the_writer() {
        let io = io(LoopbackReader { frames: StdMutex::new(Default::default()) });
        io.start().unwrap();
        let token = io.allocate_tx_token().unwrap();
        let (tx, rx) = mpsc::channel();
        io.send_buffer(token, 9999, move |status| {
            let _ = tx.send(status);
        });
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), SendStatus::SendMessageFail);
        io.stop().unwrap();
    }

    #[test]
    fn stop_before_start_is_rejected() {
        let io = io(LoopbackReader { frames: StdMutex::new(Default::default()) });
        assert!(io.stop().is_err());
    }
}
