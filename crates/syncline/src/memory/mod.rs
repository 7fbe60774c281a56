//! Process-wide memory accounting with spill-to-disk: reservation tracking
//! against a configurable ceiling, small-block pooling, threshold callbacks
//! and an owned spill directory cleaned up on teardown.

use std::{
    collections::HashMap,
    fs,
    io::{Read, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard, RwLock},
};

use tracing::{debug, error, info, warn};

use crate::config::MemoryConfig;

/// Blocks at or below this size are pooled for reuse.
const POOL_BLOCK_LIMIT: usize = 4096;

#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    #[error("memory limit exceeded: {requested} requested, {current} in use, {max} max")]
    LimitExceeded {
        requested: u64,
        current: u64,
        max: u64,
    },
    #[error("spill is not enabled")]
    SpillDisabled,
    #[error("spill I/O failed: {0}")]
    SpillIo(#[from] std::io::Error),
    #[error("memory manager state poisoned")]
    Poisoned,
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct MemoryStats {
    pub current_usage: u64,
    pub peak_usage: u64,
    pub total_allocated: u64,
    pub total_freed: u64,
    pub allocation_count: u64,
    pub free_count: u64,
    pub spill_count: u64,
    pub spill_bytes: u64,
    pub average_allocation_size: f64,
}

type ThresholdCallback = Box<dyn Fn(u64, u64) + Send + Sync>;

struct Inner {
    stats: MemoryStats,
    context_usage: HashMap<String, u64>,
    pools: HashMap<usize, Vec<Vec<u8>>>,
    spill_files: Vec<PathBuf>,
    warning_fired: bool,
    critical_fired: bool,
    spill_seq: u64,
}

/// Tracks reservations against the configured ceiling. Shared process-wide
/// behind an `Arc`; counters are mutex-protected.
pub struct MemoryManager {
    config: RwLock<MemoryConfig>,
    inner: Mutex<Inner>,
    on_warning: Mutex<Option<ThresholdCallback>>,
    on_critical: Mutex<Option<ThresholdCallback>>,
}

impl std::fmt::Debug for MemoryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryManager")
            .field("config", &self.limits())
            .finish_non_exhaustive()
    }
}

/// RAII reservation; releases its bytes on drop.
#[derive(Debug)]
pub struct MemoryReservation {
    manager: Arc<MemoryManager>,
    size: u64,
    context: Option<String>,
}

impl MemoryReservation {
    pub fn size(&self) -> u64 {
        self.size
    }
}

impl Drop for MemoryReservation {
    fn drop(&mut self) {
        self.manager.release(self.size, self.context.as_deref());
    }
}

impl MemoryManager {
    pub fn new(mut config: MemoryConfig) -> Arc<Self> {
        if config.warning_threshold_pct == 0 {
            config.warning_threshold_pct = 75;
        }
        if config.critical_threshold_pct == 0 {
            config.critical_threshold_pct = 90;
        }
        if config.enable_spill {
            if let Err(e) = fs::create_dir_all(&config.spill_directory) {
                warn!(dir = %config.spill_directory.display(), error = %e, "failed to create spill directory");
            }
        }
        info!(
            max_bytes = config.max_bytes,
            spill = config.enable_spill,
            "memory manager initialized"
        );
        Arc::new(Self {
            config: RwLock::new(config),
            inner: Mutex::new(Inner {
                stats: MemoryStats::default(),
                context_usage: HashMap::new(),
                pools: HashMap::new(),
                spill_files: Vec::new(),
                warning_fired: false,
                critical_fired: false,
                spill_seq: 0,
            }),
            on_warning: Mutex::new(None),
            on_critical: Mutex::new(None),
        })
    }

    pub fn on_warning(&self, callback: impl Fn(u64, u64) + Send + Sync + 'static) {
        if let Ok(mut slot) = self.on_warning.lock() {
            *slot = Some(Box::new(callback));
        }
    }

    pub fn on_critical(&self, callback: impl Fn(u64, u64) + Send + Sync + 'static) {
        if let Ok(mut slot) = self.on_critical.lock() {
            *slot = Some(Box::new(callback));
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, MemoryError> {
        self.inner.lock().map_err(|_| MemoryError::Poisoned)
    }

    fn limits(&self) -> MemoryConfig {
        self.config
            .read()
            .map(|c| c.clone())
            .unwrap_or_default()
    }

    /// Swap the limit configuration at runtime; the spill directory is
    /// created eagerly when spill is enabled.
    pub fn set_limit(&self, mut config: MemoryConfig) {
        if config.warning_threshold_pct == 0 {
            config.warning_threshold_pct = 75;
        }
        if config.critical_threshold_pct == 0 {
            config.critical_threshold_pct = 90;
        }
        if config.enable_spill {
            if let Err(e) = fs::create_dir_all(&config.spill_directory) {
                warn!(dir = %config.spill_directory.display(), error = %e, "failed to create spill directory");
            }
        }
        info!(max_bytes = config.max_bytes, "memory limit updated");
        if let Ok(mut slot) = self.config.write() {
            *slot = config;
        }
    }

    /// Reserve `size` bytes. Over the ceiling: with spill enabled the
    /// reservation succeeds and the threshold callbacks fire so the caller
    /// can spill; with spill disabled it fails.
    pub fn reserve(
        self: &Arc<Self>,
        size: u64,
        context: Option<&str>,
    ) -> Result<MemoryReservation, MemoryError> {
        let limits = self.limits();
        let fired = {
            let mut inner = self.lock()?;
            let max = limits.max_bytes;
            if max > 0 && inner.stats.current_usage + size > max && !limits.enable_spill {
                error!(
                    requested = size,
                    current = inner.stats.current_usage,
                    max,
                    "memory limit exceeded"
                );
                return Err(MemoryError::LimitExceeded {
                    requested: size,
                    current: inner.stats.current_usage,
                    max,
                });
            }

            inner.stats.current_usage += size;
            inner.stats.total_allocated += size;
            inner.stats.allocation_count += 1;
            if inner.stats.current_usage > inner.stats.peak_usage {
                inner.stats.peak_usage = inner.stats.current_usage;
            }
            inner.stats.average_allocation_size =
                inner.stats.total_allocated as f64 / inner.stats.allocation_count as f64;
            if let Some(context) = context {
                *inner.context_usage.entry(context.to_string()).or_default() += size;
            }
            self.check_thresholds(&limits, &mut inner)
        };
        self.fire(&limits, fired);

        Ok(MemoryReservation {
            manager: self.clone(),
            size,
            context: context.map(str::to_string),
        })
    }

    pub fn has_available(&self, size: u64) -> bool {
        let limits = self.limits();
        if limits.max_bytes == 0 {
            return true;
        }
        self.lock()
            .map(|inner| inner.stats.current_usage + size <= limits.max_bytes)
            .unwrap_or(false)
    }

    pub fn current_usage(&self) -> u64 {
        self.lock().map(|i| i.stats.current_usage).unwrap_or(0)
    }

    pub fn stats(&self) -> MemoryStats {
        self.lock().map(|i| i.stats.clone()).unwrap_or_default()
    }

    fn release(&self, size: u64, context: Option<&str>) {
        let limits = self.limits();
        if let Ok(mut inner) = self.lock() {
            inner.stats.current_usage = inner.stats.current_usage.saturating_sub(size);
            inner.stats.total_freed += size;
            inner.stats.free_count += 1;
            if let Some(context) = context {
                if let Some(usage) = inner.context_usage.get_mut(context) {
                    *usage = usage.saturating_sub(size);
                }
            }
            let max = limits.max_bytes;
            if max > 0 {
                let pct = inner.stats.current_usage * 100 / max;
                if pct < u64::from(limits.warning_threshold_pct) {
                    inner.warning_fired = false;
                }
                if pct < u64::from(limits.critical_threshold_pct) {
                    inner.critical_fired = false;
                }
            }
        }
    }

    /// Which callbacks to fire for the current usage; each fires once per
    /// threshold crossing and re-arms when usage falls back below.
    fn check_thresholds(&self, limits: &MemoryConfig, inner: &mut Inner) -> (bool, bool) {
        let max = limits.max_bytes;
        if max == 0 {
            return (false, false);
        }
        let pct = inner.stats.current_usage * 100 / max;
        let mut fire_warning = false;
        let mut fire_critical = false;
        if pct >= u64::from(limits.critical_threshold_pct) && !inner.critical_fired {
            inner.critical_fired = true;
            fire_critical = true;
            error!(pct, usage = inner.stats.current_usage, max, "memory usage critical");
        } else if pct >= u64::from(limits.warning_threshold_pct) && !inner.warning_fired {
            inner.warning_fired = true;
            fire_warning = true;
            warn!(pct, usage = inner.stats.current_usage, max, "memory usage warning");
        }
        (fire_warning, fire_critical)
    }

    fn fire(&self, limits: &MemoryConfig, (warning, critical): (bool, bool)) {
        let usage = self.current_usage();
        if warning {
            if let Ok(slot) = self.on_warning.lock() {
                if let Some(callback) = slot.as_ref() {
                    callback(usage, limits.max_bytes);
                }
            }
        }
        if critical {
            if let Ok(slot) = self.on_critical.lock() {
                if let Some(callback) = slot.as_ref() {
                    callback(usage, limits.max_bytes);
                }
            }
        }
    }

    /// Pooled buffer acquisition for small blocks; larger sizes allocate
    /// fresh.
    pub fn acquire_block(&self, size: usize) -> Vec<u8> {
        if size <= POOL_BLOCK_LIMIT {
            if let Ok(mut inner) = self.lock() {
                if let Some(pool) = inner.pools.get_mut(&size) {
                    if let Some(block) = pool.pop() {
                        return block;
                    }
                }
            }
        }
        vec![0; size]
    }

    /// Return a block to its pool. Oversized blocks are simply dropped.
    pub fn release_block(&self, block: Vec<u8>) {
        let size = block.len();
        if size == 0 || size > POOL_BLOCK_LIMIT {
            return;
        }
        if let Ok(mut inner) = self.lock() {
            inner.pools.entry(size).or_default().push(block);
        }
    }

    /// Write bytes to a new spill file and track it for teardown removal.
    pub fn spill(&self, data: &[u8], prefix: &str) -> Result<PathBuf, MemoryError> {
        let limits = self.limits();
        if !limits.enable_spill {
            return Err(MemoryError::SpillDisabled);
        }
        let path = {
            let mut inner = self.lock()?;
            inner.spill_seq += 1;
            let path = limits
                .spill_directory
                .join(format!("{prefix}_{:08}.spill", inner.spill_seq));
            inner.spill_files.push(path.clone());
            inner.stats.spill_count += 1;
            inner.stats.spill_bytes += data.len() as u64;
            path
        };
        let mut file = fs::File::create(&path)?;
        file.write_all(data)?;
        info!(bytes = data.len(), path = %path.display(), "spilled to disk");
        Ok(path)
    }

    /// Read a spill file back.
    pub fn load(&self, path: &Path) -> Result<Vec<u8>, MemoryError> {
        let mut file = fs::File::open(path)?;
        let mut buffer = Vec::new();
        file.read_to_end(&mut buffer)?;
        debug!(bytes = buffer.len(), path = %path.display(), "loaded spill file");
        Ok(buffer)
    }

    /// Drop empty pools and stale context accounting.
    pub fn gc(&self) {
        if let Ok(mut inner) = self.lock() {
            inner.pools.retain(|_, pool| !pool.is_empty());
            inner.context_usage.retain(|_, usage| *usage > 0);
        }
    }

    fn cleanup_spill_files(&self) {
        if let Ok(mut inner) = self.lock() {
            for path in inner.spill_files.drain(..) {
                if path.exists() {
                    if let Err(e) = fs::remove_file(&path) {
                        warn!(path = %path.display(), error = %e, "failed to remove spill file");
                    }
                }
            }
        }
    }
}

impl Drop for MemoryManager {
    fn drop(&mut self) {
        self.cleanup_spill_files();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn config(max: u64, spill: bool, dir: &Path) -> MemoryConfig {
        MemoryConfig {
            max_bytes: max,
            warning_threshold_pct: 75,
            critical_threshold_pct: 90,
            enable_spill: spill,
            spill_directory: dir.to_path_buf(),
        }
    }

    #[test]
    fn test_reserve_release_accounting() {
        let dir = tempfile::tempdir().unwrap();
        let manager = MemoryManager::new(config(1000, false, dir.path()));
        let reservation = manager.reserve(400, Some("join")).unwrap();
        assert_eq!(manager.current_usage(), 400);
        drop(reservation);
        assert_eq!(manager.current_usage(), 0);

        let stats = manager.stats();
        assert_eq!(stats.peak_usage, 400);
        assert_eq!(stats.total_allocated, 400);
        assert_eq!(stats.total_freed, 400);
        assert_eq!(stats.allocation_count, 1);
        assert!((stats.average_allocation_size - 400.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_limit_exceeded_without_spill() {
        let dir = tempfile::tempdir().unwrap();
        let manager = MemoryManager::new(config(100, false, dir.path()));
        let _held = manager.reserve(80, None).unwrap();
        let result = manager.reserve(50, None);
        assert!(matches!(result, Err(MemoryError::LimitExceeded { .. })));
        assert!(!manager.has_available(50));
        assert!(manager.has_available(20));
    }

    #[test]
    fn test_over_limit_succeeds_with_spill_enabled() {
        let dir = tempfile::tempdir().unwrap();
        let manager = MemoryManager::new(config(100, true, dir.path()));
        let _a = manager.reserve(80, None).unwrap();
        let _b = manager.reserve(50, None).unwrap();
        assert_eq!(manager.current_usage(), 130);
    }

    #[test]
    fn test_threshold_callbacks_fire_once_per_crossing() {
        let dir = tempfile::tempdir().unwrap();
        let manager = MemoryManager::new(config(100, true, dir.path()));
        static WARNINGS: AtomicU32 = AtomicU32::new(0);
        static CRITICALS: AtomicU32 = AtomicU32::new(0);
        WARNINGS.store(0, Ordering::SeqCst);
        CRITICALS.store(0, Ordering::SeqCst);
        manager.on_warning(|_, _| {
            WARNINGS.fetch_add(1, Ordering::SeqCst);
        });
        manager.on_critical(|_, _| {
            CRITICALS.fetch_add(1, Ordering::SeqCst);
        });

        let warn_hold = manager.reserve(80, None).unwrap();
        let _more = manager.reserve(5, None).unwrap();
        assert_eq!(WARNINGS.load(Ordering::SeqCst), 1);

        let _critical = manager.reserve(10, None).unwrap();
        assert_eq!(CRITICALS.load(Ordering::SeqCst), 1);

        // Fall back below the warning threshold, then cross again.
        drop(warn_hold);
        let _again = manager.reserve(70, None).unwrap();
        assert_eq!(WARNINGS.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_set_limit_takes_effect() {
        let dir = tempfile::tempdir().unwrap();
        let manager = MemoryManager::new(config(100, false, dir.path()));
        let _held = manager.reserve(80, None).unwrap();
        assert!(manager.reserve(50, None).is_err());

        manager.set_limit(config(1000, false, dir.path()));
        assert!(manager.reserve(50, None).is_ok());
    }

    #[test]
    fn test_spill_round_trip_and_teardown() {
        let dir = tempfile::tempdir().unwrap();
        let path;
        {
            let manager = MemoryManager::new(config(0, true, dir.path()));
            path = manager.spill(b"spilled rows", "join").unwrap();
            assert_eq!(manager.load(&path).unwrap(), b"spilled rows");
            let stats = manager.stats();
            assert_eq!(stats.spill_count, 1);
            assert_eq!(stats.spill_bytes, 12);
        }
        // Manager teardown removes its spill files.
        assert!(!path.exists());
    }

    #[test]
    fn test_spill_disabled_errors() {
        let dir = tempfile::tempdir().unwrap();
        let manager = MemoryManager::new(config(0, false, dir.path()));
        assert!(matches!(
            manager.spill(b"x", "p"),
            Err(MemoryError::SpillDisabled)
        ));
    }

    #[test]
    fn test_block_pool_reuse() {
        let dir = tempfile::tempdir().unwrap();
        let manager = MemoryManager::new(config(0, false, dir.path()));
        let block = manager.acquire_block(1024);
        manager.release_block(block);
        let again = manager.acquire_block(1024);
        assert_eq!(again.len(), 1024);
        // Oversized blocks bypass the pool.
        manager.release_block(vec![0; POOL_BLOCK_LIMIT + 1]);
        manager.gc();
    }
}
