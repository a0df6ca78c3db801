//! Scripted in-memory backend for exercising the acquisition cycle
//! without hardware.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::ptr::{self, NonNull};
use std::rc::Rc;
use std::time::Duration;

use v4l::buffer::Flags as BufFlags;

use crate::traits::{BufferSlot, CaptureBackend, Format, Frame, PixelFormat};

fn scripted_failure(what: &str) -> io::Error {
    io::Error::other(format!("scripted {what} failure"))
}

/// Observable driver activity, shared between a [`MockBackend`] and the
/// test that configured it.
#[derive(Debug, Default)]
pub struct MockLog {
    /// Regions handed out by `map_buffer`.
    pub mapped: u32,
    /// Regions released through `unmap_buffer`.
    pub unmapped: u32,
    /// Slot indices submitted to the incoming queue, in order.
    pub enqueued: Vec<u32>,
    /// Completed dequeue calls.
    pub dequeued: u32,
    /// Successful stream starts.
    pub stream_on: u32,
    /// Successful stream stops.
    pub stream_off: u32,
}

/// In-memory driver with configurable failure injection.
///
/// Buffers are heap allocations standing in for device memory; dequeuing
/// fills each region with the current cycle number so tests can observe
/// that captured bytes landed in place.
pub struct MockBackend {
    buffer_len: usize,
    grant: Option<u32>,
    fail_query_at: Option<u32>,
    fail_map_at: Option<u32>,
    fail_enqueue_at: Option<u32>,
    fail_dequeue_at: Option<u32>,
    corrupt: Vec<u32>,
    time_out: bool,
    fail_stream_on: bool,
    fail_stream_off: bool,
    cycle: u8,
    regions: Vec<Option<(NonNull<u8>, usize)>>,
    pending: VecDeque<u32>,
    log: Rc<RefCell<MockLog>>,
}

impl MockBackend {
    /// Create a backend whose buffers are all `buffer_len` bytes.
    #[must_use]
    pub fn new(buffer_len: usize) -> Self {
        Self {
            buffer_len,
            grant: None,
            fail_query_at: None,
            fail_map_at: None,
            fail_enqueue_at: None,
            fail_dequeue_at: None,
            corrupt: Vec::new(),
            time_out: false,
            fail_stream_on: false,
            fail_stream_off: false,
            cycle: 0,
            regions: Vec::new(),
            pending: VecDeque::new(),
            log: Rc::new(RefCell::new(MockLog::default())),
        }
    }

    /// Cap the number of buffers granted regardless of the request.
    #[must_use]
    pub fn with_grant(mut self, granted: u32) -> Self {
        self.grant = Some(granted);
        self
    }

    /// Fail the descriptor query for the given buffer index.
    #[must_use]
    pub fn with_query_failure(mut self, index: u32) -> Self {
        self.fail_query_at = Some(index);
        self
    }

    /// Fail the mapping of the given buffer index.
    #[must_use]
    pub fn with_map_failure(mut self, index: u32) -> Self {
        self.fail_map_at = Some(index);
        self
    }

    /// Fail the enqueue of the given slot index.
    #[must_use]
    pub fn with_enqueue_failure(mut self, index: u32) -> Self {
        self.fail_enqueue_at = Some(index);
        self
    }

    /// Fail the nth dequeue call (zero-based).
    #[must_use]
    pub fn with_dequeue_failure(mut self, nth: u32) -> Self {
        self.fail_dequeue_at = Some(nth);
        self
    }

    /// Mark the given slot indices as corrupted on every cycle.
    #[must_use]
    pub fn with_corrupt_slots(mut self, slots: &[u32]) -> Self {
        self.corrupt = slots.to_vec();
        self
    }

    /// Never signal readiness; every wait expires.
    #[must_use]
    pub fn with_timeout(mut self) -> Self {
        self.time_out = true;
        self
    }

    /// Fail the stream start.
    #[must_use]
    pub fn with_stream_on_failure(mut self) -> Self {
        self.fail_stream_on = true;
        self
    }

    /// Fail the stream stop.
    #[must_use]
    pub fn with_stream_off_failure(mut self) -> Self {
        self.fail_stream_off = true;
        self
    }

    /// Shared view of the activity counters.
    #[must_use]
    pub fn log(&self) -> Rc<RefCell<MockLog>> {
        Rc::clone(&self.log)
    }

    fn allocate_region(&mut self, index: u32, len: usize) -> NonNull<u8> {
        let raw = Box::into_raw(vec![0u8; len].into_boxed_slice());
        let ptr = NonNull::new(raw.cast::<u8>()).expect("boxed slice is never null");
        if self.regions.len() <= index as usize {
            self.regions.resize_with(index as usize + 1, || None);
        }
        self.regions[index as usize] = Some((ptr, len));
        ptr
    }
}

impl CaptureBackend for MockBackend {
    fn apply_format(&mut self, width: u32, height: u32, pixel: PixelFormat) -> io::Result<Format> {
        Ok(Format {
            width,
            height,
            pixel,
            stride: width,
            size: self.buffer_len as u32,
        })
    }

    fn request_buffers(&mut self, count: u32) -> io::Result<u32> {
        Ok(self.grant.unwrap_or(count))
    }

    fn query_buffer(&mut self, index: u32) -> io::Result<BufferSlot> {
        if self.fail_query_at == Some(index) {
            return Err(scripted_failure("query"));
        }
        Ok(BufferSlot {
            index,
            length: self.buffer_len as u32,
            offset: index * self.buffer_len as u32,
            flags: 0,
            bytes_used: 0,
        })
    }

    fn map_buffer(&mut self, slot: &BufferSlot) -> io::Result<Frame> {
        if self.fail_map_at == Some(slot.index) {
            return Err(scripted_failure("map"));
        }
        let len = slot.length as usize;
        let ptr = self.allocate_region(slot.index, len);
        self.log.borrow_mut().mapped += 1;
        Ok(Frame::from_raw(ptr, len))
    }

    fn unmap_buffer(&mut self, frame: &Frame) {
        let needle = frame.as_ptr();
        for region in &mut self.regions {
            if region.is_some_and(|(ptr, _)| ptr.as_ptr() == needle) {
                if let Some((ptr, len)) = region.take() {
                    unsafe {
                        drop(Box::from_raw(ptr::slice_from_raw_parts_mut(
                            ptr.as_ptr(),
                            len,
                        )));
                    }
                    self.log.borrow_mut().unmapped += 1;
                }
                return;
            }
        }
    }

    fn enqueue(&mut self, slot: &mut BufferSlot) -> io::Result<()> {
        if self.fail_enqueue_at == Some(slot.index) {
            return Err(scripted_failure("enqueue"));
        }
        if self.corrupt.contains(&slot.index) {
            slot.flags |= BufFlags::ERROR.bits();
        }
        self.pending.push_back(slot.index);
        self.log.borrow_mut().enqueued.push(slot.index);
        Ok(())
    }

    fn wait_ready(&mut self, _timeout: Duration) -> io::Result<bool> {
        if self.time_out {
            return Ok(false);
        }
        self.cycle = self.cycle.wrapping_add(1);
        Ok(true)
    }

    fn dequeue(&mut self, slot: &mut BufferSlot) -> io::Result<()> {
        if self.fail_dequeue_at == Some(self.log.borrow().dequeued) {
            return Err(scripted_failure("dequeue"));
        }
        let index = self
            .pending
            .pop_front()
            .ok_or_else(|| scripted_failure("empty-queue dequeue"))?;
        let (ptr, len) = self
            .regions
            .get(index as usize)
            .copied()
            .flatten()
            .ok_or_else(|| scripted_failure("unmapped dequeue"))?;

        unsafe {
            ptr::write_bytes(ptr.as_ptr(), self.cycle, len);
        }
        slot.index = index;
        slot.length = len as u32;
        slot.bytes_used = len as u32;
        slot.flags = 0;
        self.log.borrow_mut().dequeued += 1;
        Ok(())
    }

    fn stream_on(&mut self) -> io::Result<()> {
        if self.fail_stream_on {
            return Err(scripted_failure("stream-on"));
        }
        self.log.borrow_mut().stream_on += 1;
        Ok(())
    }

    fn stream_off(&mut self) -> io::Result<()> {
        if self.fail_stream_off {
            return Err(scripted_failure("stream-off"));
        }
        self.log.borrow_mut().stream_off += 1;
        Ok(())
    }
}

impl Drop for MockBackend {
    fn drop(&mut self) {
        // Free anything the handle under test failed to unmap.
        for region in &mut self.regions {
            if let Some((ptr, len)) = region.take() {
                unsafe {
                    drop(Box::from_raw(ptr::slice_from_raw_parts_mut(
                        ptr.as_ptr(),
                        len,
                    )));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_and_unmap_balance() {
        let mut backend = MockBackend::new(64);
        let log = backend.log();

        let slot = backend.query_buffer(0).expect("query should succeed");
        let frame = backend.map_buffer(&slot).expect("map should succeed");
        assert_eq!(frame.len(), 64);
        assert_eq!(log.borrow().mapped, 1);

        backend.unmap_buffer(&frame);
        assert_eq!(log.borrow().unmapped, 1);

        // A second unmap of the same region is ignored.
        backend.unmap_buffer(&frame);
        assert_eq!(log.borrow().unmapped, 1);
    }

    #[test]
    fn corrupt_slot_gets_error_flag_on_enqueue() {
        let mut backend = MockBackend::new(64).with_corrupt_slots(&[1]);

        let mut clean = backend.query_buffer(0).expect("query should succeed");
        let mut tainted = backend.query_buffer(1).expect("query should succeed");
        backend.map_buffer(&clean).expect("map should succeed");
        backend.map_buffer(&tainted).expect("map should succeed");

        backend.enqueue(&mut clean).expect("enqueue should succeed");
        backend.enqueue(&mut tainted).expect("enqueue should succeed");

        assert!(!clean.corrupted());
        assert!(tainted.corrupted());
    }

    #[test]
    fn dequeue_fills_regions_with_cycle_byte() {
        let mut backend = MockBackend::new(16);
        let mut slot = backend.query_buffer(0).expect("query should succeed");
        let frame = backend.map_buffer(&slot).expect("map should succeed");

        backend.enqueue(&mut slot).expect("enqueue should succeed");
        assert!(backend
            .wait_ready(Duration::from_secs(2))
            .expect("wait should succeed"));
        backend.dequeue(&mut slot).expect("dequeue should succeed");

        assert!(frame.data().iter().all(|&byte| byte == 1));
        assert_eq!(slot.bytes_used, 16);
    }

    #[test]
    fn scripted_timeout_never_signals_readiness() {
        let mut backend = MockBackend::new(16).with_timeout();
        assert!(!backend
            .wait_ready(Duration::from_secs(2))
            .expect("wait should not error"));
    }
}
