// Copyright Braid Project Contributors - SPDX Identifier: Apache-2.0

//! Process-wide model table and back-end lifecycle. One registry serves every
//! transport handle in the process: back-ends load lazily on first use, stay
//! loaded while any handle holds a charge on them, and unload when the last
//! charge is released. A single reader/writer lock guards all of it, and the
//! lock is held across each transform so a back-end can never unload while a
//! packet is being processed with it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use logger_core::{log_debug, log_error, log_warn};
use once_cell::sync::Lazy;

use super::backends::{CompressOps, SessionState};
use super::{CompressionError, MAX_COMPRESS_METHODS};

#[cfg(feature = "bzip2")]
use super::backends::bzip2_backend;
#[cfg(feature = "lz4")]
use super::backends::lz4_backend;
#[cfg(feature = "lzma")]
use super::backends::lzma_backend;
#[cfg(feature = "zlib")]
use super::backends::zlib_backend;
#[cfg(feature = "zstd")]
use super::backends::zstd_backend;

/// How long decompress-path load attempts stay parked after a load failure.
/// Without this, a remote peer could force an expensive load attempt per
/// received packet just by tagging packets with a model whose library is
/// missing or broken.
pub(crate) const LOAD_FAILURE_BACKOFF: Duration = Duration::from_secs(10);

pub(crate) type LoaderFn = fn() -> Result<Box<dyn CompressOps>, CompressionError>;

/// One row of the model table. The wire id is the contract: once published it
/// is never reused, so rows whose codec is compiled out stay in the table as
/// placeholders with `built_in = false`.
pub(crate) struct ModelDescriptor {
    pub(crate) name: &'static str,
    pub(crate) model_id: u8,
    pub(crate) built_in: bool,
    pub(crate) loader: Option<LoaderFn>,
}

/// Defines a codec row: built in with its loader when the feature is on, a
/// placeholder keeping the wire id when it is off.
macro_rules! codec_row {
    ($row:ident, $name:literal, $id:literal, $feature:literal, $loader:expr) => {
        #[cfg(feature = $feature)]
        const $row: ModelDescriptor = ModelDescriptor {
            name: $name,
            model_id: $id,
            built_in: true,
            loader: Some($loader),
        };
        #[cfg(not(feature = $feature))]
        const $row: ModelDescriptor = ModelDescriptor {
            name: $name,
            model_id: $id,
            built_in: false,
            loader: None,
        };
    };
}

const NONE_ROW: ModelDescriptor = ModelDescriptor {
    name: "none",
    model_id: 0,
    built_in: true,
    loader: None,
};

codec_row!(ZLIB_ROW, "zlib", 1, "zlib", zlib_backend::load);
codec_row!(LZ4_ROW, "lz4", 2, "lz4", lz4_backend::load);
codec_row!(LZ4HC_ROW, "lz4hc", 3, "lz4", lz4_backend::load_hc);

// No lzo2 binding is linked; the row pins wire id 4.
const LZO2_ROW: ModelDescriptor = ModelDescriptor {
    name: "lzo2",
    model_id: 4,
    built_in: false,
    loader: None,
};

codec_row!(LZMA_ROW, "lzma", 5, "lzma", lzma_backend::load);
codec_row!(BZIP2_ROW, "bzip2", 6, "bzip2", bzip2_backend::load);
codec_row!(ZSTD_ROW, "zstd", 7, "zstd", zstd_backend::load);

/// The model table, in wire-id order. Append-only: new codecs take the next
/// free id, and removed codecs leave a placeholder row behind.
pub(crate) const BUILTIN_MODELS: &[ModelDescriptor] = &[
    NONE_ROW, ZLIB_ROW, LZ4_ROW, LZ4HC_ROW, LZO2_ROW, LZMA_ROW, BZIP2_ROW, ZSTD_ROW,
];

const _: () = assert!(BUILTIN_MODELS.len() <= MAX_COMPRESS_METHODS);

/// Identifies one transport handle to the registry. Allocated once per
/// [`super::Compressor`] and never reused within a process.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub(crate) struct HandleId(u64);

impl HandleId {
    pub(crate) fn next() -> HandleId {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        HandleId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// What a handle holds against one model. Presence of a slot is the charge;
/// `Ready` additionally carries the codec's per-handle state.
pub(crate) enum SessionSlot {
    Charged,
    Ready(SessionState),
}

struct RowState {
    loaded: bool,
    libref: u32,
    ops: Option<Box<dyn CompressOps>>,
}

struct RegistryState {
    rows: Vec<RowState>,
    sessions: HashMap<(HandleId, u8), SessionSlot>,
    last_load_failure: Option<Instant>,
}

pub(crate) struct CompressRegistry {
    table: &'static [ModelDescriptor],
    max_model: u8,
    state: RwLock<RegistryState>,
}

static REGISTRY: Lazy<Arc<CompressRegistry>> = Lazy::new(|| Arc::new(CompressRegistry::new()));

/// The registry every [`super::Compressor`] built through the public API
/// shares.
pub(crate) fn global() -> Arc<CompressRegistry> {
    REGISTRY.clone()
}

/// Lock guard handed back by [`CompressRegistry::ensure_ready`]. It keeps the
/// registry lock held (read mode when the fast path hit, write mode when a
/// load or init ran) so the back-end cannot be unloaded until the caller is
/// done transforming; dropping the guard releases the lock.
pub(crate) struct OpsGuard<'a> {
    mode: GuardMode<'a>,
    handle: HandleId,
    model_id: u8,
    newly_charged: bool,
}

impl std::fmt::Debug for OpsGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpsGuard")
            .field("handle", &self.handle)
            .field("model_id", &self.model_id)
            .field("newly_charged", &self.newly_charged)
            .finish()
    }
}

enum GuardMode<'a> {
    Read(RwLockReadGuard<'a, RegistryState>),
    Write(RwLockWriteGuard<'a, RegistryState>),
}

impl OpsGuard<'_> {
    fn state(&self) -> &RegistryState {
        match &self.mode {
            GuardMode::Read(guard) => guard,
            GuardMode::Write(guard) => guard,
        }
    }

    pub(crate) fn ops(&self) -> &dyn CompressOps {
        self.state().rows[self.model_id as usize]
            .ops
            .as_deref()
            .expect("guard always refers to a loaded row")
    }

    /// Per-handle codec state, when the back-end keeps any.
    pub(crate) fn session(&self) -> Option<&SessionState> {
        match self.state().sessions.get(&(self.handle, self.model_id)) {
            Some(SessionSlot::Ready(state)) => Some(state),
            _ => None,
        }
    }

}

impl CompressRegistry {
    pub(crate) fn new() -> CompressRegistry {
        CompressRegistry::with_table(BUILTIN_MODELS)
    }

    fn with_table(table: &'static [ModelDescriptor]) -> CompressRegistry {
        let max_model = table.iter().map(|desc| desc.model_id).max().unwrap_or(0);
        let rows = (0..=max_model)
            .map(|_| RowState {
                loaded: false,
                libref: 0,
                ops: None,
            })
            .collect();
        CompressRegistry {
            table,
            max_model,
            state: RwLock::new(RegistryState {
                rows,
                sessions: HashMap::new(),
                last_load_failure: None,
            }),
        }
    }

    pub(crate) fn max_model(&self) -> u8 {
        self.max_model
    }

    pub(crate) fn descriptor(&self, model_id: u8) -> Option<&'static ModelDescriptor> {
        self.table.iter().find(|desc| desc.model_id == model_id)
    }

    pub(crate) fn descriptor_by_name(&self, name: &str) -> Option<&'static ModelDescriptor> {
        self.table.iter().find(|desc| desc.name == name)
    }

    fn read_lock(&self) -> Result<RwLockReadGuard<'_, RegistryState>, CompressionError> {
        self.state.read().map_err(|_| {
            log_error("compression", "compression registry lock is poisoned");
            CompressionError::LockFailure
        })
    }

    fn write_lock(&self) -> Result<RwLockWriteGuard<'_, RegistryState>, CompressionError> {
        self.state.write().map_err(|_| {
            log_error("compression", "compression registry lock is poisoned");
            CompressionError::LockFailure
        })
    }

    /// Makes `model_id`'s back-end ready for `handle` and returns a guard that
    /// keeps it that way until dropped.
    ///
    /// The fast path takes only the read lock: the back-end is loaded and this
    /// handle already holds a charge. Otherwise the write lock is taken to
    /// load and charge, with decompress-path callers (`rate_limit`) turned
    /// away for [`LOAD_FAILURE_BACKOFF`] after any load failure. The refcount
    /// is charged at most once per (handle, model) pair, and only once load
    /// and init have both succeeded.
    pub(crate) fn ensure_ready(
        &self,
        handle: HandleId,
        model_id: u8,
        rate_limit: bool,
    ) -> Result<OpsGuard<'_>, CompressionError> {
        let desc = self.descriptor(model_id).ok_or_else(|| {
            CompressionError::invalid_argument(format!("unknown compression model id {model_id}"))
        })?;
        let key = (handle, model_id);

        let recent_failure = {
            let state = self.read_lock()?;
            let row = &state.rows[model_id as usize];
            if row.loaded && state.sessions.contains_key(&key) {
                return Ok(OpsGuard {
                    mode: GuardMode::Read(state),
                    handle,
                    model_id,
                    newly_charged: false,
                });
            }
            state.last_load_failure
        };

        if rate_limit
            && let Some(failed_at) = recent_failure
            && failed_at.elapsed() < LOAD_FAILURE_BACKOFF
        {
            log_debug(
                "compression",
                format!(
                    "deferring load of compression model `{}`: a library load failed less than {}s ago",
                    desc.name,
                    LOAD_FAILURE_BACKOFF.as_secs()
                ),
            );
            return Err(CompressionError::RateLimited);
        }

        let mut state = self.write_lock()?;
        if !state.rows[model_id as usize].loaded {
            let Some(loader) = desc.loader else {
                return Err(CompressionError::invalid_argument(format!(
                    "compression model `{}` has no loadable back-end",
                    desc.name
                )));
            };
            match loader() {
                Ok(ops) => {
                    let row = &mut state.rows[model_id as usize];
                    row.ops = Some(ops);
                    row.loaded = true;
                    log_debug(
                        "compression",
                        format!("loaded compression model `{}` (id {})", desc.name, model_id),
                    );
                }
                Err(err) => {
                    state.last_load_failure = Some(Instant::now());
                    log_warn(
                        "compression",
                        format!("failed to load compression model `{}`: {err}", desc.name),
                    );
                    return Err(err);
                }
            }
        }

        let newly_charged = !state.sessions.contains_key(&key);
        if newly_charged {
            let slot = {
                let ops = state.rows[model_id as usize]
                    .ops
                    .as_deref()
                    .expect("loaded row always has ops");
                if ops.stateful() {
                    SessionSlot::Ready(ops.init()?)
                } else {
                    SessionSlot::Charged
                }
            };
            state.sessions.insert(key, slot);
            state.rows[model_id as usize].libref += 1;
        }

        Ok(OpsGuard {
            mode: GuardMode::Write(state),
            handle,
            model_id,
            newly_charged,
        })
    }

    /// Undoes the charge a failed configure made through `guard`, if that
    /// call made one. No-op for guards that hit the fast path, so an earlier
    /// successful configuration is never uncharged by a later failed one.
    pub(crate) fn release_charge(&self, guard: OpsGuard<'_>) {
        if !guard.newly_charged {
            return;
        }
        let OpsGuard {
            mode,
            handle,
            model_id,
            ..
        } = guard;
        // A new charge is only ever made on the write path.
        let GuardMode::Write(mut state) = mode else {
            return;
        };
        release_one(&mut state, handle, model_id);
    }

    /// Handle teardown: releases every charge `handle` made, unloading any
    /// back-end whose refcount reaches zero. Best-effort; an unusable lock is
    /// logged and the charges leak until process exit.
    pub(crate) fn release_handle(&self, handle: HandleId) {
        let Ok(mut state) = self.state.write() else {
            log_error(
                "compression",
                "compression registry lock is poisoned: leaking handle charges",
            );
            return;
        };
        for desc in self.table.iter().take(MAX_COMPRESS_METHODS) {
            if !desc.built_in {
                continue;
            }
            release_one(&mut state, handle, desc.model_id);
        }
    }

    #[cfg(test)]
    pub(crate) fn libref(&self, model_id: u8) -> u32 {
        self.state.read().unwrap().rows[model_id as usize].libref
    }

    #[cfg(test)]
    pub(crate) fn is_loaded(&self, model_id: u8) -> bool {
        self.state.read().unwrap().rows[model_id as usize].loaded
    }

    #[cfg(test)]
    pub(crate) fn has_session(&self, handle: HandleId, model_id: u8) -> bool {
        self.state
            .read()
            .unwrap()
            .sessions
            .contains_key(&(handle, model_id))
    }

    /// Shifts the recorded load failure into the past so tests can cross the
    /// backoff window without sleeping.
    #[cfg(test)]
    pub(crate) fn backdate_last_load_failure(&self, by: Duration) {
        let mut state = self.state.write().unwrap();
        state.last_load_failure = state.last_load_failure.and_then(|at| at.checked_sub(by));
    }
}

fn release_one(state: &mut RegistryState, handle: HandleId, model_id: u8) {
    let Some(slot) = state.sessions.remove(&(handle, model_id)) else {
        return;
    };
    if let SessionSlot::Ready(session) = slot
        && let Some(ops) = state.rows[model_id as usize].ops.as_deref()
    {
        ops.fini(session);
    }
    let row = &mut state.rows[model_id as usize];
    row.libref = row.libref.saturating_sub(1);
    if row.libref == 0 && row.loaded {
        row.ops = None;
        row.loaded = false;
        log_debug(
            "compression",
            format!("unloaded compression model id {model_id}: no remaining users"),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct MockOps {
        name: &'static str,
        stateful: bool,
        init_fail: bool,
        init_calls: &'static AtomicUsize,
        fini_calls: &'static AtomicUsize,
        drops: &'static AtomicUsize,
    }

    impl CompressOps for MockOps {
        fn val_level(&self, level: i32) -> Result<(), CompressionError> {
            if level < 0 {
                return Err(CompressionError::invalid_argument(format!(
                    "{} compression level {level} is out of valid range",
                    self.name
                )));
            }
            Ok(())
        }

        fn compress(
            &self,
            src: &[u8],
            _level: i32,
            session: Option<&SessionState>,
        ) -> Result<Vec<u8>, CompressionError> {
            assert_eq!(self.stateful, session.is_some());
            Ok(src.iter().rev().copied().collect())
        }

        fn decompress(
            &self,
            src: &[u8],
            _max_out: usize,
            session: Option<&SessionState>,
        ) -> Result<Vec<u8>, CompressionError> {
            assert_eq!(self.stateful, session.is_some());
            Ok(src.iter().rev().copied().collect())
        }

        fn stateful(&self) -> bool {
            self.stateful
        }

        fn init(&self) -> Result<SessionState, CompressionError> {
            self.init_calls.fetch_add(1, Ordering::SeqCst);
            if self.init_fail {
                return Err(CompressionError::InitFailure {
                    model: self.name,
                    reason: "mock init failure".into(),
                });
            }
            Ok(Box::new(0u32))
        }

        fn fini(&self, _state: SessionState) {
            self.fini_calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl Drop for MockOps {
        fn drop(&mut self) {
            self.drops.fetch_add(1, Ordering::SeqCst);
        }
    }

    // Each test gets its own mock module (and table) so the counters stay
    // independent while the test binary runs in parallel.
    macro_rules! mock_backend {
        ($mod_name:ident, $name:literal, stateful: $stateful:expr, init_fail: $init_fail:expr) => {
            mod $mod_name {
                use super::*;

                pub(super) static LOAD_CALLS: AtomicUsize = AtomicUsize::new(0);
                pub(super) static INIT_CALLS: AtomicUsize = AtomicUsize::new(0);
                pub(super) static FINI_CALLS: AtomicUsize = AtomicUsize::new(0);
                pub(super) static DROPS: AtomicUsize = AtomicUsize::new(0);

                pub(super) fn load() -> Result<Box<dyn CompressOps>, CompressionError> {
                    LOAD_CALLS.fetch_add(1, Ordering::SeqCst);
                    Ok(Box::new(MockOps {
                        name: $name,
                        stateful: $stateful,
                        init_fail: $init_fail,
                        init_calls: &INIT_CALLS,
                        fini_calls: &FINI_CALLS,
                        drops: &DROPS,
                    }))
                }
            }
        };
    }

    macro_rules! failing_backend {
        ($mod_name:ident, $name:literal) => {
            mod $mod_name {
                use super::*;

                pub(super) static LOAD_ATTEMPTS: AtomicUsize = AtomicUsize::new(0);

                pub(super) fn load() -> Result<Box<dyn CompressOps>, CompressionError> {
                    LOAD_ATTEMPTS.fetch_add(1, Ordering::SeqCst);
                    Err(CompressionError::LoadFailure {
                        model: $name,
                        reason: "shared library missing".into(),
                    })
                }
            }
        };
    }

    mock_backend!(once, "once", stateful: false, init_fail: false);
    const ONCE_TABLE: &[ModelDescriptor] = &[
        NONE_ROW,
        ModelDescriptor {
            name: "once",
            model_id: 1,
            built_in: true,
            loader: Some(once::load),
        },
    ];

    #[test]
    fn charge_is_made_once_per_handle() {
        let registry = CompressRegistry::with_table(ONCE_TABLE);
        let handle = HandleId::next();

        let guard = registry.ensure_ready(handle, 1, false).unwrap();
        assert!(guard.newly_charged);
        assert_eq!(guard.ops().compress(b"abc", 1, guard.session()).unwrap(), b"cba");
        drop(guard);

        for _ in 0..3 {
            let guard = registry.ensure_ready(handle, 1, false).unwrap();
            assert!(!guard.newly_charged);
        }

        assert_eq!(once::LOAD_CALLS.load(Ordering::SeqCst), 1);
        assert_eq!(registry.libref(1), 1);
        assert!(registry.is_loaded(1));
    }

    mock_backend!(shared, "shared", stateful: false, init_fail: false);
    const SHARED_TABLE: &[ModelDescriptor] = &[
        NONE_ROW,
        ModelDescriptor {
            name: "shared",
            model_id: 1,
            built_in: true,
            loader: Some(shared::load),
        },
    ];

    #[test]
    fn refcount_lifecycle_across_handles() {
        let registry = CompressRegistry::with_table(SHARED_TABLE);
        let first = HandleId::next();
        let second = HandleId::next();

        drop(registry.ensure_ready(first, 1, false).unwrap());
        drop(registry.ensure_ready(second, 1, false).unwrap());
        assert_eq!(registry.libref(1), 2);
        assert!(registry.is_loaded(1));
        assert_eq!(shared::LOAD_CALLS.load(Ordering::SeqCst), 1);

        registry.release_handle(first);
        assert_eq!(registry.libref(1), 1);
        assert!(registry.is_loaded(1));
        assert_eq!(shared::DROPS.load(Ordering::SeqCst), 0);

        registry.release_handle(second);
        assert_eq!(registry.libref(1), 0);
        assert!(!registry.is_loaded(1));
        assert_eq!(shared::DROPS.load(Ordering::SeqCst), 1);
    }

    mock_backend!(stateful_ok, "stateful-ok", stateful: true, init_fail: false);
    const STATEFUL_TABLE: &[ModelDescriptor] = &[
        NONE_ROW,
        ModelDescriptor {
            name: "stateful-ok",
            model_id: 1,
            built_in: true,
            loader: Some(stateful_ok::load),
        },
    ];

    #[test]
    fn stateful_backend_init_and_fini_run_once_per_handle() {
        let registry = CompressRegistry::with_table(STATEFUL_TABLE);
        let handle = HandleId::next();

        let guard = registry.ensure_ready(handle, 1, false).unwrap();
        assert!(guard.session().is_some());
        drop(guard);
        drop(registry.ensure_ready(handle, 1, false).unwrap());
        assert_eq!(stateful_ok::INIT_CALLS.load(Ordering::SeqCst), 1);

        registry.release_handle(handle);
        assert_eq!(stateful_ok::FINI_CALLS.load(Ordering::SeqCst), 1);
        assert!(!registry.has_session(handle, 1));
        assert_eq!(registry.libref(1), 0);
        assert!(!registry.is_loaded(1));
    }

    mock_backend!(bad_init, "bad-init", stateful: true, init_fail: true);
    const BAD_INIT_TABLE: &[ModelDescriptor] = &[
        NONE_ROW,
        ModelDescriptor {
            name: "bad-init",
            model_id: 1,
            built_in: true,
            loader: Some(bad_init::load),
        },
    ];

    #[test]
    fn init_failure_leaves_no_charge() {
        let registry = CompressRegistry::with_table(BAD_INIT_TABLE);
        let handle = HandleId::next();

        let err = registry.ensure_ready(handle, 1, false).unwrap_err();
        assert!(matches!(err, CompressionError::InitFailure { .. }));
        // The library itself loaded fine; only the per-handle charge is off.
        assert!(registry.is_loaded(1));
        assert_eq!(registry.libref(1), 0);
        assert!(!registry.has_session(handle, 1));
    }

    failing_backend!(flaky, "flaky");
    const FLAKY_TABLE: &[ModelDescriptor] = &[
        NONE_ROW,
        ModelDescriptor {
            name: "flaky",
            model_id: 1,
            built_in: true,
            loader: Some(flaky::load),
        },
    ];

    #[test]
    fn load_failure_rate_limits_the_decompress_path() {
        let registry = CompressRegistry::with_table(FLAKY_TABLE);
        let handle = HandleId::next();

        let err = registry.ensure_ready(handle, 1, true).unwrap_err();
        assert!(matches!(err, CompressionError::LoadFailure { .. }));
        assert_eq!(flaky::LOAD_ATTEMPTS.load(Ordering::SeqCst), 1);

        // Within the backoff window the load is not even attempted.
        let err = registry.ensure_ready(handle, 1, true).unwrap_err();
        assert!(matches!(err, CompressionError::RateLimited));
        assert_eq!(flaky::LOAD_ATTEMPTS.load(Ordering::SeqCst), 1);

        registry.backdate_last_load_failure(LOAD_FAILURE_BACKOFF + Duration::from_secs(1));
        let err = registry.ensure_ready(handle, 1, true).unwrap_err();
        assert!(matches!(err, CompressionError::LoadFailure { .. }));
        assert_eq!(flaky::LOAD_ATTEMPTS.load(Ordering::SeqCst), 2);
    }

    failing_backend!(flaky_send, "flaky-send");
    const FLAKY_SEND_TABLE: &[ModelDescriptor] = &[
        NONE_ROW,
        ModelDescriptor {
            name: "flaky-send",
            model_id: 1,
            built_in: true,
            loader: Some(flaky_send::load),
        },
    ];

    #[test]
    fn send_path_is_never_rate_limited() {
        let registry = CompressRegistry::with_table(FLAKY_SEND_TABLE);
        let handle = HandleId::next();

        for attempt in 1usize..=3 {
            let err = registry.ensure_ready(handle, 1, false).unwrap_err();
            assert!(matches!(err, CompressionError::LoadFailure { .. }));
            assert_eq!(flaky_send::LOAD_ATTEMPTS.load(Ordering::SeqCst), attempt);
        }
    }

    mock_backend!(undo, "undo", stateful: false, init_fail: false);
    const UNDO_TABLE: &[ModelDescriptor] = &[
        NONE_ROW,
        ModelDescriptor {
            name: "undo",
            model_id: 1,
            built_in: true,
            loader: Some(undo::load),
        },
    ];

    #[test]
    fn release_charge_undoes_only_a_new_charge() {
        let registry = CompressRegistry::with_table(UNDO_TABLE);
        let handle = HandleId::next();

        let guard = registry.ensure_ready(handle, 1, false).unwrap();
        assert!(guard.newly_charged);
        registry.release_charge(guard);
        assert_eq!(registry.libref(1), 0);
        assert!(!registry.is_loaded(1));
        assert_eq!(undo::DROPS.load(Ordering::SeqCst), 1);

        // An established charge survives a later fast-path guard release.
        drop(registry.ensure_ready(handle, 1, false).unwrap());
        let guard = registry.ensure_ready(handle, 1, false).unwrap();
        assert!(!guard.newly_charged);
        registry.release_charge(guard);
        assert_eq!(registry.libref(1), 1);
        assert!(registry.is_loaded(1));
        assert_eq!(undo::LOAD_CALLS.load(Ordering::SeqCst), 2);
    }

    mock_backend!(conc, "conc", stateful: false, init_fail: false);
    const CONC_TABLE: &[ModelDescriptor] = &[
        NONE_ROW,
        ModelDescriptor {
            name: "conc",
            model_id: 1,
            built_in: true,
            loader: Some(conc::load),
        },
    ];

    #[test]
    fn concurrent_first_use_loads_once() {
        let registry = CompressRegistry::with_table(CONC_TABLE);
        let handles: Vec<HandleId> = (0..8).map(|_| HandleId::next()).collect();

        let registry = &registry;
        std::thread::scope(|scope| {
            for handle in &handles {
                let handle = *handle;
                scope.spawn(move || {
                    let guard = registry.ensure_ready(handle, 1, false).unwrap();
                    let compressed = guard.ops().compress(b"payload", 1, guard.session()).unwrap();
                    let recovered = guard.ops().decompress(&compressed, 64, guard.session()).unwrap();
                    assert_eq!(recovered, b"payload");
                });
            }
        });

        assert_eq!(conc::LOAD_CALLS.load(Ordering::SeqCst), 1);
        assert_eq!(registry.libref(1), 8);

        for handle in &handles {
            registry.release_handle(*handle);
        }
        assert_eq!(registry.libref(1), 0);
        assert_eq!(conc::DROPS.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unknown_and_placeholder_ids_are_rejected() {
        let registry = CompressRegistry::with_table(BUILTIN_MODELS);
        let handle = HandleId::next();

        let err = registry.ensure_ready(handle, 200, false).unwrap_err();
        assert!(matches!(err, CompressionError::InvalidArgument(_)));

        // lzo2 is a placeholder row with nothing to load.
        let err = registry.ensure_ready(handle, 4, false).unwrap_err();
        assert!(matches!(err, CompressionError::InvalidArgument(_)));
    }

    #[test]
    fn builtin_table_is_wire_stable() {
        assert!(BUILTIN_MODELS.len() <= MAX_COMPRESS_METHODS);
        for pair in BUILTIN_MODELS.windows(2) {
            assert!(pair[0].model_id < pair[1].model_id, "wire ids must be ordered");
        }
        let registry = CompressRegistry::new();
        assert_eq!(registry.max_model(), 7);
        assert_eq!(global().max_model(), 7);
    }
}
