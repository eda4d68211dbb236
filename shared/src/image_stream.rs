//! Published image stream.
//!
//! A named, fixed-shape 2-D buffer with a single writer and any number of
//! readers. A write holds the buffer lock for the whole update (the lock is
//! the write marker), advances the write counter and only notifies waiting
//! readers after the lock is released, so a reader never observes a partially
//! updated buffer.

use ndarray::{Array2, ArrayViewMut2};
use std::error::Error;
use std::fmt;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Error type for stream read operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamReadError {
    /// Timeout waiting for a new write
    Timeout,
}

impl fmt::Display for StreamReadError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            StreamReadError::Timeout => write!(f, "Timeout waiting for stream update"),
        }
    }
}

impl Error for StreamReadError {}

/// Result type for stream read operations
pub type StreamReadResult<T> = Result<T, StreamReadError>;

/// Error type for stream write operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamWriteError {
    /// Replacement buffer does not have the stream's shape
    ShapeMismatch {
        expected: (usize, usize),
        actual: (usize, usize),
    },
}

impl fmt::Display for StreamWriteError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            StreamWriteError::ShapeMismatch { expected, actual } => write!(
                f,
                "Buffer shape {actual:?} does not match stream shape {expected:?}"
            ),
        }
    }
}

impl Error for StreamWriteError {}

#[derive(Debug)]
struct StreamState<T> {
    data: Array2<T>,
    counter: u64,
}

/// Single-writer, multi-reader image buffer
#[derive(Debug)]
pub struct ImageStream<T> {
    name: String,
    state: Mutex<StreamState<T>>,
    updated: Condvar,
}

impl<T: Clone + num_traits::Zero> ImageStream<T> {
    /// Create a zero-filled stream of shape (rows, cols)
    pub fn new(name: impl Into<String>, rows: usize, cols: usize) -> Self {
        Self::from_array(name, Array2::zeros((rows, cols)))
    }
}

impl<T: Clone> ImageStream<T> {
    /// Create a stream holding an initial image
    pub fn from_array(name: impl Into<String>, data: Array2<T>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(StreamState {
                data,
                counter: 0,
            }),
            updated: Condvar::new(),
        }
    }

    /// Stream name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Buffer dimensions as (rows, cols)
    pub fn dim(&self) -> (usize, usize) {
        self.lock().data.dim()
    }

    /// Number of completed writes
    pub fn counter(&self) -> u64 {
        self.lock().counter
    }

    /// Update the buffer in place and notify readers.
    ///
    /// The closure gets a mutable view, so the shape is fixed for the
    /// lifetime of the stream.
    ///
    /// # Returns
    /// The write counter after this update
    pub fn write<R>(&self, update: impl FnOnce(ArrayViewMut2<'_, T>) -> R) -> (R, u64) {
        let mut state = self.lock();
        let result = update(state.data.view_mut());
        let counter = self.publish(state);
        (result, counter)
    }

    /// Swap `data` with the published buffer and notify readers.
    ///
    /// On return `data` holds the previous image. A buffer of another shape
    /// is rejected and both buffers are left untouched.
    ///
    /// # Returns
    /// The write counter after this update
    pub fn exchange(&self, data: &mut Array2<T>) -> Result<u64, StreamWriteError> {
        let mut state = self.lock();
        if data.dim() != state.data.dim() {
            return Err(StreamWriteError::ShapeMismatch {
                expected: state.data.dim(),
                actual: data.dim(),
            });
        }
        std::mem::swap(&mut state.data, data);
        Ok(self.publish(state))
    }

    fn publish(&self, mut state: MutexGuard<'_, StreamState<T>>) -> u64 {
        state.counter = state.counter.wrapping_add(1);
        let counter = state.counter;
        drop(state);

        self.updated.notify_all();
        counter
    }

    /// Copy of the current buffer together with the counter it belongs to
    pub fn snapshot(&self) -> (Array2<T>, u64) {
        let state = self.lock();
        (state.data.clone(), state.counter)
    }

    /// Read the current buffer through a closure without copying it
    pub fn read<R>(&self, view: impl FnOnce(&Array2<T>, u64) -> R) -> R {
        let state = self.lock();
        view(&state.data, state.counter)
    }

    /// Wait until the write counter moves past `last_seen`
    ///
    /// # Arguments
    /// * `last_seen` - Counter value the caller has already consumed
    /// * `timeout` - Maximum duration to wait
    ///
    /// # Returns
    /// * `Ok(counter)` - The new counter value
    /// * `Err(StreamReadError::Timeout)` - No new write before the timeout
    pub fn wait_for_update(&self, last_seen: u64, timeout: Duration) -> StreamReadResult<u64> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();

        while state.counter == last_seen {
            let now = Instant::now();
            if now >= deadline {
                return Err(StreamReadError::Timeout);
            }
            let (guard, _) = self
                .updated
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            state = guard;
        }

        Ok(state.counter)
    }

    fn lock(&self) -> MutexGuard<'_, StreamState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_stream_creation() {
        let stream = ImageStream::<f32>::new("slopes", 4, 8);
        assert_eq!(stream.name(), "slopes");
        assert_eq!(stream.dim(), (4, 8));
        assert_eq!(stream.counter(), 0);
    }

    #[test]
    fn test_write_bumps_counter_and_updates_data() {
        let stream = ImageStream::<f32>::new("flux", 2, 2);

        let ((), counter) = stream.write(|mut buf| buf[[1, 1]] = 42.0);
        assert_eq!(counter, 1);

        let (data, counter) = stream.snapshot();
        assert_eq!(counter, 1);
        assert_eq!(data[[1, 1]], 42.0);
    }

    #[test]
    fn test_exchange_swaps_buffers() {
        let stream = ImageStream::<f32>::new("corrected", 2, 3);
        let mut next = Array2::from_elem((2, 3), 7.0);

        assert_eq!(stream.exchange(&mut next), Ok(1));
        assert!(next.iter().all(|&v| v == 0.0));
        let (data, counter) = stream.snapshot();
        assert_eq!(counter, 1);
        assert!(data.iter().all(|&v| v == 7.0));
    }

    #[test]
    fn test_exchange_rejects_other_shape() {
        let stream = ImageStream::<f32>::new("corrected", 2, 3);
        let mut wrong = Array2::from_elem((3, 2), 7.0);

        let err = stream.exchange(&mut wrong).unwrap_err();
        assert_eq!(
            err,
            StreamWriteError::ShapeMismatch {
                expected: (2, 3),
                actual: (3, 2),
            }
        );
        assert_eq!(stream.dim(), (2, 3));
        assert_eq!(stream.counter(), 0);
        assert!(wrong.iter().all(|&v| v == 7.0));
    }

    #[test]
    fn test_wait_times_out_without_writer() {
        let stream = ImageStream::<f32>::new("corrected", 2, 2);
        let err = stream
            .wait_for_update(0, Duration::from_millis(10))
            .unwrap_err();
        assert_eq!(err, StreamReadError::Timeout);
    }

    #[test]
    fn test_wait_returns_immediately_when_behind() {
        let stream = ImageStream::<f32>::new("corrected", 2, 2);
        stream.write(|_| ());
        stream.write(|_| ());
        assert_eq!(stream.wait_for_update(0, Duration::ZERO), Ok(2));
    }

    #[test]
    fn test_reader_wakes_on_write() {
        let stream = Arc::new(ImageStream::<f32>::new("corrected", 2, 2));
        let reader = {
            let stream = stream.clone();
            thread::spawn(move || stream.wait_for_update(0, Duration::from_secs(5)))
        };

        thread::sleep(Duration::from_millis(20));
        stream.write(|mut buf| buf.fill(1.0));

        assert_eq!(reader.join().unwrap(), Ok(1));
        stream.read(|data, counter| {
            assert_eq!(counter, 1);
            assert!(data.iter().all(|&v| v == 1.0));
        });
    }
}
