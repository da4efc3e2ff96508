use std::{
    hint,
    sync::{
        atomic::{AtomicU32, AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use common::config::channel::{BACKOFF_MAX, BACKOFF_MIN, MAGIC, SPIN_LIMIT, VERSION};
use thiserror::Error;

use crate::shmem::ShmRegion;

/// distinguished tag marking the end of a result batch
pub const TAG_BATCH_DONE: u64 = u64::MAX;

// header field offsets, data area starts at HEADER_SIZE
const OFFSET_MAGIC: usize = 0;
const OFFSET_VERSION: usize = 8;
const OFFSET_CAPACITY: usize = 16;
const OFFSET_WRITE_POS: usize = 24;
const OFFSET_EOS: usize = 32;
const HEADER_SIZE: usize = 64;

// record frame: tag u64 LE + len u32 LE + payload
const FRAME_SIZE: usize = 12;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChannelError {
    #[error("insufficient space in channel")]
    Full,
    #[error("channel corrupt: {0}")]
    Corrupt(&'static str),
    #[error("channel peer is gone")]
    Closed,
    #[error("timed out waiting for channel data")]
    TimedOut,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blob {
    pub tag: u64,
    pub data: Vec<u8>,
}

/// Append-only sequence of tagged, length-prefixed records in a shared
/// memory region. Single writer, single reader; the reader keeps a local
/// cursor and never trusts a length field before bounds-checking it, since
/// the peer process may have corrupted the region.
pub struct BlobChannel {
    region: Arc<ShmRegion>,
    capacity: usize,
    read_pos: usize,
}

impl BlobChannel {
    /// initialize the header in a fresh region (creator side)
    pub fn create(region: Arc<ShmRegion>) -> Result<Self, ChannelError> {
        if region.len() <= HEADER_SIZE {
            return Err(ChannelError::Corrupt("region smaller than header"));
        }
        let capacity = region.len() - HEADER_SIZE;

        let channel = Self {
            region,
            capacity,
            read_pos: 0,
        };
        channel.write_pos().store(0, Ordering::Relaxed);
        channel.eos().store(0, Ordering::Relaxed);
        channel.header_u64(OFFSET_CAPACITY).store(capacity as u64, Ordering::Relaxed);
        channel.header_u64(OFFSET_MAGIC).store(MAGIC, Ordering::Relaxed);
        channel
            .header_u32(OFFSET_VERSION)
            .store(VERSION, Ordering::Release);

        Ok(channel)
    }

    /// attach to a header initialized by the peer, validating it first
    pub fn attach(region: Arc<ShmRegion>) -> Result<Self, ChannelError> {
        if region.len() <= HEADER_SIZE {
            return Err(ChannelError::Corrupt("region smaller than header"));
        }

        let channel = Self {
            capacity: region.len() - HEADER_SIZE,
            region,
            read_pos: 0,
        };

        if channel.header_u64(OFFSET_MAGIC).load(Ordering::Acquire) != MAGIC {
            return Err(ChannelError::Corrupt("bad magic"));
        }
        if channel.header_u32(OFFSET_VERSION).load(Ordering::Acquire) != VERSION {
            return Err(ChannelError::Corrupt("version mismatch"));
        }
        let capacity = channel.header_u64(OFFSET_CAPACITY).load(Ordering::Acquire) as usize;
        if capacity != channel.capacity {
            return Err(ChannelError::Corrupt("capacity mismatch"));
        }

        Ok(channel)
    }

    fn header_u64(&self, offset: usize) -> &AtomicU64 {
        // header offsets are 8-byte aligned within the mapping
        unsafe { &*(self.region.as_ptr().add(offset) as *const AtomicU64) }
    }

    fn header_u32(&self, offset: usize) -> &AtomicU32 {
        unsafe { &*(self.region.as_ptr().add(offset) as *const AtomicU32) }
    }

    fn write_pos(&self) -> &AtomicU64 {
        self.header_u64(OFFSET_WRITE_POS)
    }

    fn eos(&self) -> &AtomicU32 {
        self.header_u32(OFFSET_EOS)
    }

    fn data_ptr(&self, offset: usize) -> *mut u8 {
        // callers bounds-check offset against capacity
        unsafe { self.region.as_ptr().add(HEADER_SIZE + offset) }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// append one tagged record, `Full` leaves prior records intact
    pub fn write(&self, tag: u64, data: &[u8]) -> Result<(), ChannelError> {
        let pos = self.write_pos().load(Ordering::Relaxed) as usize;
        if pos > self.capacity {
            return Err(ChannelError::Corrupt("write cursor out of bounds"));
        }

        let total = FRAME_SIZE
            .checked_add(data.len())
            .ok_or(ChannelError::Corrupt("record size overflow"))?;
        if total > self.capacity - pos {
            return Err(ChannelError::Full);
        }

        unsafe {
            let dst = self.data_ptr(pos);
            dst.copy_from_nonoverlapping(tag.to_le_bytes().as_ptr(), 8);
            dst.add(8)
                .copy_from_nonoverlapping((data.len() as u32).to_le_bytes().as_ptr(), 4);
            dst.add(FRAME_SIZE)
                .copy_from_nonoverlapping(data.as_ptr(), data.len());
        }

        // publish the record after its bytes are in place
        self.write_pos()
            .store((pos + total) as u64, Ordering::Release);

        Ok(())
    }

    /// signal that no more records will be written
    pub fn finish(&self) {
        self.eos().store(1, Ordering::Release);
    }

    fn stream_ended(&self) -> bool {
        self.eos().load(Ordering::Acquire) != 0
    }

    /// next record if one is available, `None` when the channel is drained
    /// (use `read_blocking` to distinguish empty-now from end-of-stream)
    pub fn try_read(&mut self) -> Result<Option<Blob>, ChannelError> {
        let write_pos = self.write_pos().load(Ordering::Acquire) as usize;
        if write_pos > self.capacity {
            return Err(ChannelError::Corrupt("write cursor out of bounds"));
        }
        if self.read_pos >= write_pos {
            return Ok(None);
        }

        let available = write_pos - self.read_pos;
        if available < FRAME_SIZE {
            return Err(ChannelError::Corrupt("truncated record frame"));
        }

        let mut tag = [0u8; 8];
        let mut len = [0u8; 4];
        unsafe {
            let src = self.data_ptr(self.read_pos);
            tag.as_mut_ptr().copy_from_nonoverlapping(src, 8);
            len.as_mut_ptr().copy_from_nonoverlapping(src.add(8), 4);
        }
        let tag = u64::from_le_bytes(tag);
        let len = u32::from_le_bytes(len) as usize;

        // never trust the length field before checking it against the
        // published write cursor
        if len > available - FRAME_SIZE {
            return Err(ChannelError::Corrupt("record length out of bounds"));
        }

        let mut data = vec![0u8; len];
        unsafe {
            data.as_mut_ptr()
                .copy_from_nonoverlapping(self.data_ptr(self.read_pos + FRAME_SIZE), len);
        }
        self.read_pos += FRAME_SIZE + len;

        Ok(Some(Blob { tag, data }))
    }

    /// blocking read with bounded busy-wait backoff; `Ok(None)` means the
    /// peer signaled end-of-stream, `Closed` that the watchdog declared the
    /// peer dead, `TimedOut` that the deadline elapsed
    pub fn read_blocking<F: FnMut() -> bool>(
        &mut self,
        timeout: Duration,
        mut peer_alive: F,
    ) -> Result<Option<Blob>, ChannelError> {
        let deadline = Instant::now() + timeout;
        let mut backoff = BACKOFF_MIN;
        let mut spins = 0usize;

        loop {
            if let Some(blob) = self.try_read()? {
                return Ok(Some(blob));
            }

            // check end-of-stream only after draining pending records
            if self.stream_ended() && self.try_read()?.is_none() {
                return Ok(None);
            }

            if !peer_alive() {
                return Err(ChannelError::Closed);
            }
            if Instant::now() >= deadline {
                return Err(ChannelError::TimedOut);
            }

            if spins < SPIN_LIMIT {
                spins += 1;
                hint::spin_loop();
            } else {
                std::thread::sleep(backoff);
                backoff = (backoff * 2).min(BACKOFF_MAX);
            }
        }
    }

    /// rewind both cursors for the next batch; only valid while the peer is
    /// quiescent (waiting for the next "go" signal)
    pub fn reset(&mut self) {
        self.read_pos = 0;
        self.eos().store(0, Ordering::Relaxed);
        self.write_pos().store(0, Ordering::Release);
    }
}
