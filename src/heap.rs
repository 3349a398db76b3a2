//! Heap accounting for the memory profile.
//!
//! [`TrackingAllocator`] wraps the system allocator and keeps running totals.
//! Install it with `#[global_allocator]` in the binary; [`stats`] then reports
//! exact live figures at any point, and [`write_profile`] serializes them as a
//! gzip'd pprof `Profile`.

use std::alloc::{GlobalAlloc, Layout, System};
use std::io::{self, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use flate2::write::GzEncoder;
use flate2::Compression;
use prost::Message;

static ALLOCATIONS: AtomicU64 = AtomicU64::new(0);
static DEALLOCATIONS: AtomicU64 = AtomicU64::new(0);
static ALLOCATED_BYTES: AtomicU64 = AtomicU64::new(0);
static DEALLOCATED_BYTES: AtomicU64 = AtomicU64::new(0);

/// Counting wrapper around [`System`]
#[derive(Debug, Default)]
pub struct TrackingAllocator;

impl TrackingAllocator {
    pub const fn new() -> Self {
        TrackingAllocator
    }
}

unsafe impl GlobalAlloc for TrackingAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let ptr = System.alloc(layout);
        if !ptr.is_null() {
            record_alloc(layout.size());
        }
        ptr
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let ptr = System.alloc_zeroed(layout);
        if !ptr.is_null() {
            record_alloc(layout.size());
        }
        ptr
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        System.dealloc(ptr, layout);
        record_dealloc(layout.size());
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let new_ptr = System.realloc(ptr, layout, new_size);
        if !new_ptr.is_null() {
            // same object, only its size moves
            let old_size = layout.size();
            if new_size > old_size {
                ALLOCATED_BYTES.fetch_add((new_size - old_size) as u64, Ordering::Relaxed);
            } else {
                DEALLOCATED_BYTES.fetch_add((old_size - new_size) as u64, Ordering::Relaxed);
            }
        }
        new_ptr
    }
}

fn record_alloc(size: usize) {
    ALLOCATIONS.fetch_add(1, Ordering::Relaxed);
    ALLOCATED_BYTES.fetch_add(size as u64, Ordering::Relaxed);
}

fn record_dealloc(size: usize) {
    DEALLOCATIONS.fetch_add(1, Ordering::Relaxed);
    DEALLOCATED_BYTES.fetch_add(size as u64, Ordering::Relaxed);
}

/// Allocation totals since process start
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeapStats {
    pub allocations: u64,
    pub deallocations: u64,
    pub allocated_bytes: u64,
    pub deallocated_bytes: u64,
}

impl HeapStats {
    pub fn live_objects(&self) -> u64 {
        self.allocations.saturating_sub(self.deallocations)
    }

    pub fn live_bytes(&self) -> u64 {
        self.allocated_bytes.saturating_sub(self.deallocated_bytes)
    }
}

/// Current totals. All zero unless [`TrackingAllocator`] is the global allocator.
pub fn stats() -> HeapStats {
    HeapStats {
        allocations: ALLOCATIONS.load(Ordering::Relaxed),
        deallocations: DEALLOCATIONS.load(Ordering::Relaxed),
        allocated_bytes: ALLOCATED_BYTES.load(Ordering::Relaxed),
        deallocated_bytes: DEALLOCATED_BYTES.load(Ordering::Relaxed),
    }
}

// ====== pprof wire format ======
// Subset of perftools.profiles.Profile, field tags match profile.proto.

#[derive(Clone, PartialEq, Message)]
struct Profile {
    #[prost(message, repeated, tag = "1")]
    sample_type: Vec<ValueType>,
    #[prost(message, repeated, tag = "2")]
    sample: Vec<Sample>,
    #[prost(string, repeated, tag = "6")]
    string_table: Vec<String>,
    #[prost(int64, tag = "9")]
    time_nanos: i64,
    #[prost(message, optional, tag = "11")]
    period_type: Option<ValueType>,
    #[prost(int64, tag = "12")]
    period: i64,
}

#[derive(Clone, PartialEq, Message)]
struct ValueType {
    #[prost(int64, tag = "1")]
    kind: i64,
    #[prost(int64, tag = "2")]
    unit: i64,
}

#[derive(Clone, PartialEq, Message)]
struct Sample {
    #[prost(uint64, repeated, tag = "1")]
    location_id: Vec<u64>,
    #[prost(int64, repeated, tag = "2")]
    value: Vec<i64>,
}

/// Interns strings; index 0 is always the empty string.
struct StringTable(Vec<String>);

impl StringTable {
    fn new() -> Self {
        StringTable(vec![String::new()])
    }

    fn intern(&mut self, s: &str) -> i64 {
        let idx = match self.0.iter().position(|existing| existing == s) {
            Some(idx) => idx,
            None => {
                self.0.push(s.to_owned());
                self.0.len() - 1
            }
        };
        idx as i64
    }

    fn value_type(&mut self, kind: &str, unit: &str) -> ValueType {
        ValueType {
            kind: self.intern(kind),
            unit: self.intern(unit),
        }
    }
}

fn to_i64(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

fn build_profile(stats: &HeapStats) -> Profile {
    let mut strings = StringTable::new();
    let sample_type = vec![
        strings.value_type("alloc_objects", "count"),
        strings.value_type("alloc_space", "bytes"),
        strings.value_type("inuse_objects", "count"),
        strings.value_type("inuse_space", "bytes"),
    ];
    let period_type = strings.value_type("space", "bytes");
    let sample = Sample {
        location_id: vec![],
        value: vec![
            to_i64(stats.allocations),
            to_i64(stats.allocated_bytes),
            to_i64(stats.live_objects()),
            to_i64(stats.live_bytes()),
        ],
    };
    let time_nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_nanos()).unwrap_or(i64::MAX))
        .unwrap_or_default();

    Profile {
        sample_type,
        sample: vec![sample],
        string_table: strings.0,
        time_nanos,
        period_type: Some(period_type),
        period: 1,
    }
}

/// Write `stats` as a gzip'd pprof heap profile
pub fn write_profile<W: Write>(stats: &HeapStats, writer: W) -> io::Result<()> {
    let encoded = build_profile(stats).encode_to_vec();

    let mut encoder = GzEncoder::new(writer, Compression::default());
    encoder.write_all(&encoded)?;
    encoder.finish()?.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use std::io::Read;

    #[test]
    fn live_figures_saturate() {
        let stats = HeapStats {
            allocations: 10,
            deallocations: 4,
            allocated_bytes: 1024,
            deallocated_bytes: 2048,
        };
        assert_eq!(stats.live_objects(), 6);
        assert_eq!(stats.live_bytes(), 0);
    }

    #[test]
    fn string_table_interns() {
        let mut strings = StringTable::new();
        assert_eq!(strings.intern(""), 0);
        assert_eq!(strings.intern("count"), 1);
        assert_eq!(strings.intern("bytes"), 2);
        assert_eq!(strings.intern("count"), 1);
    }

    #[test]
    fn profile_is_gzipped_pprof() {
        let stats = HeapStats {
            allocations: 3,
            deallocations: 1,
            allocated_bytes: 300,
            deallocated_bytes: 100,
        };
        let mut out = Vec::new();
        write_profile(&stats, &mut out).unwrap();

        let mut raw = Vec::new();
        GzDecoder::new(out.as_slice()).read_to_end(&mut raw).unwrap();
        let profile = Profile::decode(raw.as_slice()).unwrap();

        assert_eq!(profile.sample.len(), 1);
        assert_eq!(profile.sample[0].value, vec![3, 300, 2, 200]);
        let names: Vec<_> = profile
            .sample_type
            .iter()
            .map(|t| profile.string_table[t.kind as usize].as_str())
            .collect();
        assert_eq!(
            names,
            ["alloc_objects", "alloc_space", "inuse_objects", "inuse_space"]
        );
    }

    #[test]
    fn tracking_allocator_counts() {
        let small = Layout::from_size_align(64, 8).unwrap();
        let large = Layout::from_size_align(128, 8).unwrap();
        let before = stats();
        unsafe {
            let ptr = TrackingAllocator.alloc(small);
            assert!(!ptr.is_null());
            let ptr = TrackingAllocator.realloc(ptr, small, 128);
            assert!(!ptr.is_null());
            let ptr = TrackingAllocator.realloc(ptr, large, 64);
            assert!(!ptr.is_null());
            TrackingAllocator.dealloc(ptr, small);
        }
        let after = stats();

        // resizing keeps one live object and moves only the byte totals
        assert_eq!(after.allocations - before.allocations, 1);
        assert_eq!(after.deallocations - before.deallocations, 1);
        assert_eq!(after.allocated_bytes - before.allocated_bytes, 128);
        assert_eq!(after.deallocated_bytes - before.deallocated_bytes, 128);
    }
}
