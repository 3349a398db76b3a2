//! CPU and heap profiling around a command invocation.
//!
//! Profiling is opt-in: without a directory the hook stays [`ProfilingState::Idle`]
//! and never touches the filesystem. With one, [`Profiling::start`] opens
//! `profile_cpu.pb.gz` and starts the sampler, and [`Profiling::stop`] flushes the
//! CPU profile and writes `profile_heap.pb.gz`.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use flate2::write::GzEncoder;
use flate2::Compression;
use pprof::protos::Message;
use pprof::{ProfilerGuard, ProfilerGuardBuilder};

use crate::bootstrap::{Hook, Session};
use crate::heap::{self, HeapStats};
use crate::utils::prelude::*;

pub const CPU_PROFILE: &str = "profile_cpu.pb.gz";
pub const HEAP_PROFILE: &str = "profile_heap.pb.gz";

/// Samples per second
const CPU_FREQUENCY: i32 = 100;
const BLOCKLIST: [&str; 4] = ["libc", "libgcc", "pthread", "vdso"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfilingState {
    Idle,
    CpuRunning,
    Stopped,
}

/// The sampler and the file it will be flushed into
struct CpuProfile {
    file: File,
    guard: ProfilerGuard<'static>,
}

pub struct Profiling {
    dir: Option<PathBuf>,
    cpu: Option<CpuProfile>,
    state: ProfilingState,
}

impl Profiling {
    pub fn new(dir: Option<PathBuf>) -> Self {
        Self {
            dir,
            cpu: None,
            state: ProfilingState::Idle,
        }
    }

    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    pub fn state(&self) -> ProfilingState {
        self.state
    }

    /// Whether a CPU profile file is currently held open
    pub fn is_running(&self) -> bool {
        self.cpu.is_some()
    }

    pub fn start(&mut self) -> Result<()> {
        let dir = match (&self.dir, self.state) {
            (Some(dir), ProfilingState::Idle) => dir,
            _ => return Ok(()),
        };

        let path = dir.join(CPU_PROFILE);
        let file = File::create(&path).map_err(Fatal::CpuProfileCreate)?;
        let guard = ProfilerGuardBuilder::default()
            .frequency(CPU_FREQUENCY)
            .blocklist(&BLOCKLIST)
            .build()
            .map_err(Fatal::CpuProfileStart)?;

        debug!(path = %path.display(), "CPU profiling started");
        self.cpu = Some(CpuProfile { file, guard });
        self.state = ProfilingState::CpuRunning;
        Ok(())
    }

    pub fn stop(&mut self) -> Result<()> {
        let dir = match (&self.dir, self.state) {
            (Some(dir), ProfilingState::Idle) | (Some(dir), ProfilingState::CpuRunning) => dir.clone(),
            _ => return Ok(()),
        };
        self.state = ProfilingState::Stopped;

        if let Some(cpu) = self.cpu.take() {
            stop_cpu_profile(cpu)?;
        }

        let stats = heap::stats();
        let path = dir.join(HEAP_PROFILE);
        let file = File::create(&path).map_err(Fatal::HeapProfileCreate)?;
        write_heap_profile(file, &stats)?;

        debug!(
            dir = %dir.display(),
            live_bytes = stats.live_bytes(),
            live_objects = stats.live_objects(),
            "Profiles written"
        );
        Ok(())
    }
}

impl Hook for Profiling {
    fn name(&self) -> &'static str {
        "profiling"
    }

    fn before(&mut self, _session: &mut Session<'_>) -> Result<()> {
        self.start()
    }

    fn after(&mut self, _session: &mut Session<'_>) -> Result<()> {
        self.stop()
    }
}

/// Stop sampling, flush the report and close the file.
fn stop_cpu_profile(cpu: CpuProfile) -> Result<()> {
    let CpuProfile { mut file, guard } = cpu;

    let report = guard.report().build();
    drop(guard);

    let written = report
        .map_err(anyhow::Error::from)
        .and_then(|report| encode_cpu_profile(&report, &mut file));

    if let Err(err) = file.sync_all() {
        warn!(error = %err, "could not close CPU profile");
    }
    drop(file);

    written.map_err(|err| Fatal::CpuProfileWrite(err).into())
}

fn encode_cpu_profile(report: &pprof::Report, file: &mut File) -> anyhow::Result<()> {
    let profile = report.pprof()?;

    let mut encoder = GzEncoder::new(file, Compression::default());
    encoder.write_all(&profile.encode_to_vec())?;
    encoder.finish()?.flush()?;
    Ok(())
}

/// Write the heap snapshot, closing `file` before any error is handed back.
fn write_heap_profile<W: Write>(mut file: W, stats: &HeapStats) -> Result<()> {
    let written = heap::write_profile(stats, &mut file);
    drop(file);

    written.map_err(|err| Fatal::HeapProfileWrite(err).into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::{Arc, Mutex};

    /// Fails every write and logs when it gets dropped
    struct BrokenWriter {
        events: Arc<Mutex<Vec<&'static str>>>,
    }

    impl Write for BrokenWriter {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            self.events.lock().unwrap().push("write");
            Err(io::Error::new(io::ErrorKind::Other, "disk full"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Drop for BrokenWriter {
        fn drop(&mut self) {
            self.events.lock().unwrap().push("closed");
        }
    }

    #[test]
    fn idle_without_dir() {
        let mut profiling = Profiling::new(None);
        profiling.start().unwrap();
        assert_eq!(profiling.state(), ProfilingState::Idle);
        assert!(!profiling.is_running());

        profiling.stop().unwrap();
        assert_eq!(profiling.state(), ProfilingState::Idle);
    }

    #[test]
    fn unwritable_dir_is_fatal_at_start() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("does").join("not").join("exist");

        let mut profiling = Profiling::new(Some(missing.clone()));
        let err = profiling.start().unwrap_err();

        assert!(err.is_fatal());
        assert!(matches!(
            err,
            Error::ConfigurationFatal(Fatal::CpuProfileCreate(_))
        ));
        assert_eq!(profiling.state(), ProfilingState::Idle);
        assert!(!profiling.is_running());
        assert!(!missing.exists());
    }

    #[test]
    fn start_then_stop_writes_both_profiles() {
        let dir = tempfile::tempdir().unwrap();
        let mut profiling = Profiling::new(Some(dir.path().to_owned()));

        profiling.start().unwrap();
        assert_eq!(profiling.state(), ProfilingState::CpuRunning);
        assert!(profiling.is_running());
        assert!(dir.path().join(CPU_PROFILE).exists());

        // something to sample
        let mut acc = 0u64;
        for i in 0..2_000_000u64 {
            acc = acc.wrapping_mul(31).wrapping_add(i);
        }
        assert_ne!(acc, 1);

        profiling.stop().unwrap();
        assert_eq!(profiling.state(), ProfilingState::Stopped);
        assert!(!profiling.is_running());

        for name in [CPU_PROFILE, HEAP_PROFILE] {
            let len = std::fs::metadata(dir.path().join(name)).unwrap().len();
            assert!(len > 0, "{} is empty", name);
        }

        // a second stop is a no-op
        std::fs::remove_file(dir.path().join(HEAP_PROFILE)).unwrap();
        profiling.stop().unwrap();
        assert!(!dir.path().join(HEAP_PROFILE).exists());
    }

    #[test]
    fn heap_file_closed_before_error() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let writer = BrokenWriter {
            events: events.clone(),
        };

        let err = write_heap_profile(writer, &HeapStats::default()).unwrap_err();

        assert!(matches!(
            err,
            Error::ConfigurationFatal(Fatal::HeapProfileWrite(_))
        ));
        let events = events.lock().unwrap();
        assert_eq!(events.first(), Some(&"write"));
        assert_eq!(events.last(), Some(&"closed"));
        assert_eq!(events.iter().filter(|e| **e == "closed").count(), 1);
    }
}
