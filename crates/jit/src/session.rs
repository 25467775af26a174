//! Execution session and symbol namespace.
//!
//! The session owns the symbol table, the resource trackers, the internal
//! symbol rename table and the in-flight work counter. Every piece of shared
//! mutable state is reached through the locked accessors below.
//!
//! Lock order: `trackers` before `symbols` before any stub target. The
//! rename table is only held while probing `symbols` for free names.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use lazyjit_ir::DataLayout;
use rustc_hash::FxHashMap;

use crate::activity::ActivityTracker;
use crate::backend::{ExecutorSymbolDef, SymbolBody};
use crate::error::JitError;
use crate::intake::RenameTable;
use crate::lazy::{LazyUnit, Stub};
use crate::types::{ExecutorAddr, SymbolFlags};

/// Identifies a resource tracker within one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TrackerId(u64);

impl TrackerId {
    /// The tracker modules are added to unless the caller supplies one.
    pub const DEFAULT: TrackerId = TrackerId(0);

    pub fn value(self) -> u64 {
        self.0
    }
}

/// Base of the address range handed out to data symbols.
const DATA_ADDR_BASE: u64 = 0x7f00_0000_0000;

/// State of one symbol table entry.
#[derive(Debug, Clone)]
pub(crate) enum EntryState {
    /// Not compiled yet. Callers go through the stub.
    Lazy { stub: Arc<Stub> },
    /// Compiled. The stub stays valid and forwards to `def`.
    Materialized { def: ExecutorSymbolDef, stub: Arc<Stub> },
    /// Defined directly: data, host functions, absolute definitions.
    Absolute { def: ExecutorSymbolDef },
}

#[derive(Debug)]
struct SymbolEntry {
    flags: SymbolFlags,
    tracker: TrackerId,
    state: EntryState,
}

/// Everything a tracker owns.
#[derive(Default)]
pub(crate) struct TrackerState {
    pub(crate) units: Vec<Arc<LazyUnit>>,
    pub(crate) symbols: Vec<String>,
}

/// Process-wide owner of the symbol namespace.
pub struct ExecutionSession {
    data_layout: DataLayout,
    symbols: RwLock<FxHashMap<String, SymbolEntry>>,
    trackers: Mutex<FxHashMap<TrackerId, TrackerState>>,
    renames: Mutex<RenameTable>,
    next_tracker: AtomicU64,
    next_unit: AtomicU64,
    next_data_addr: AtomicU64,
    ended: AtomicBool,
    activity: ActivityTracker,
}

impl ExecutionSession {
    pub fn new(data_layout: DataLayout) -> Self {
        let mut trackers = FxHashMap::default();
        trackers.insert(TrackerId::DEFAULT, TrackerState::default());
        Self {
            data_layout,
            symbols: RwLock::new(FxHashMap::default()),
            trackers: Mutex::new(trackers),
            renames: Mutex::new(RenameTable::default()),
            next_tracker: AtomicU64::new(1),
            next_unit: AtomicU64::new(0),
            next_data_addr: AtomicU64::new(DATA_ADDR_BASE),
            ended: AtomicBool::new(false),
            activity: ActivityTracker::new(),
        }
    }

    /// The target layout every module must match.
    pub fn data_layout(&self) -> &DataLayout {
        &self.data_layout
    }

    pub fn activity(&self) -> &ActivityTracker {
        &self.activity
    }

    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::SeqCst)
    }

    /// Flag the session as ended. Returns `false` if it already was.
    pub(crate) fn mark_ended(&self) -> bool {
        !self.ended.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn ensure_live(&self) -> Result<(), JitError> {
        if self.is_ended() {
            return Err(JitError::SessionEnded);
        }
        Ok(())
    }

    pub(crate) fn next_unit_id(&self) -> u64 {
        self.next_unit.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn allocate_data_addr(&self) -> ExecutorAddr {
        ExecutorAddr::new(self.next_data_addr.fetch_add(8, Ordering::Relaxed))
    }

    pub(crate) fn create_tracker(&self) -> TrackerId {
        let id = TrackerId(self.next_tracker.fetch_add(1, Ordering::Relaxed));
        #[expect(clippy::unwrap_used, reason = "Mutex poisoning is unrecoverable")]
        let mut trackers = self.trackers.lock().unwrap();
        trackers.insert(id, TrackerState::default());
        id
    }

    pub(crate) fn tracker_is_live(&self, id: TrackerId) -> bool {
        #[expect(clippy::unwrap_used, reason = "Mutex poisoning is unrecoverable")]
        let trackers = self.trackers.lock().unwrap();
        trackers.contains_key(&id)
    }

    /// Run `f` with exclusive access to the rename table.
    pub(crate) fn with_renames<T>(&self, f: impl FnOnce(&mut RenameTable) -> T) -> T {
        #[expect(clippy::unwrap_used, reason = "Mutex poisoning is unrecoverable")]
        let mut renames = self.renames.lock().unwrap();
        f(&mut renames)
    }

    pub fn is_defined(&self, name: &str) -> bool {
        #[expect(clippy::unwrap_used, reason = "RwLock poisoning is unrecoverable")]
        let symbols = self.symbols.read().unwrap();
        symbols.contains_key(name)
    }

    /// Number of entries in the namespace.
    pub fn symbol_count(&self) -> usize {
        #[expect(clippy::unwrap_used, reason = "RwLock poisoning is unrecoverable")]
        let symbols = self.symbols.read().unwrap();
        symbols.len()
    }

    /// Flags of a defined symbol.
    pub fn flags(&self, name: &str) -> Option<SymbolFlags> {
        #[expect(clippy::unwrap_used, reason = "RwLock poisoning is unrecoverable")]
        let symbols = self.symbols.read().unwrap();
        symbols.get(name).map(|entry| entry.flags)
    }

    pub(crate) fn get(&self, name: &str) -> Option<EntryState> {
        #[expect(clippy::unwrap_used, reason = "RwLock poisoning is unrecoverable")]
        let symbols = self.symbols.read().unwrap();
        symbols.get(name).map(|entry| entry.state.clone())
    }

    /// Define a resolved symbol directly.
    pub(crate) fn define(
        &self,
        tracker: TrackerId,
        name: &str,
        def: ExecutorSymbolDef,
    ) -> Result<(), JitError> {
        #[expect(clippy::unwrap_used, reason = "Mutex poisoning is unrecoverable")]
        let mut trackers = self.trackers.lock().unwrap();
        let state = trackers
            .get_mut(&tracker)
            .ok_or(JitError::ResourceTrackerDefunct(tracker.value()))?;
        #[expect(clippy::unwrap_used, reason = "RwLock poisoning is unrecoverable")]
        let mut symbols = self.symbols.write().unwrap();
        if symbols.contains_key(name) {
            return Err(JitError::DuplicateSymbol(name.to_owned()));
        }
        symbols.insert(
            name.to_owned(),
            SymbolEntry {
                flags: def.flags,
                tracker,
                state: EntryState::Absolute { def },
            },
        );
        state.symbols.push(name.to_owned());
        Ok(())
    }

    /// Register a lazy unit's stubs and its data symbols.
    ///
    /// All or nothing: on a duplicate name no entry is added.
    pub(crate) fn define_unit(
        &self,
        unit: &Arc<LazyUnit>,
        data: Vec<(String, ExecutorSymbolDef)>,
    ) -> Result<(), JitError> {
        let tracker = unit.tracker();
        #[expect(clippy::unwrap_used, reason = "Mutex poisoning is unrecoverable")]
        let mut trackers = self.trackers.lock().unwrap();
        let state = trackers
            .get_mut(&tracker)
            .ok_or(JitError::ResourceTrackerDefunct(tracker.value()))?;
        #[expect(clippy::unwrap_used, reason = "RwLock poisoning is unrecoverable")]
        let mut symbols = self.symbols.write().unwrap();

        let mut names: Vec<&str> = unit.stubs().iter().map(|stub| stub.name()).collect();
        names.extend(data.iter().map(|(name, _)| name.as_str()));
        let mut seen = rustc_hash::FxHashSet::default();
        for name in &names {
            if symbols.contains_key(*name) || !seen.insert(*name) {
                return Err(JitError::DuplicateSymbol((*name).to_owned()));
            }
        }

        for stub in unit.stubs() {
            symbols.insert(
                stub.name().to_owned(),
                SymbolEntry {
                    flags: SymbolFlags::EXPORTED_FUNCTION,
                    tracker,
                    state: EntryState::Lazy {
                        stub: Arc::clone(stub),
                    },
                },
            );
            state.symbols.push(stub.name().to_owned());
        }
        for (name, def) in data {
            state.symbols.push(name.clone());
            symbols.insert(
                name,
                SymbolEntry {
                    flags: def.flags,
                    tracker,
                    state: EntryState::Absolute { def },
                },
            );
        }
        state.units.push(Arc::clone(unit));
        Ok(())
    }

    /// Point `stub` and its table entry at freshly loaded code.
    ///
    /// Covers both the first promise-to-resolved transition and the
    /// resolved-to-resolved replacement done by reoptimization. The stub
    /// target and the entry change under the same write lock, so a lookup
    /// never pairs the new address with the old body. Returns `false` if the
    /// entry no longer belongs to this stub (its tracker was removed).
    pub(crate) fn resolve(&self, stub: &Arc<Stub>, def: ExecutorSymbolDef) -> bool {
        let SymbolBody::Function(body) = def.body.clone() else {
            return false;
        };
        #[expect(clippy::unwrap_used, reason = "RwLock poisoning is unrecoverable")]
        let mut symbols = self.symbols.write().unwrap();
        let Some(entry) = symbols.get_mut(stub.name()) else {
            return false;
        };
        let owned = match &entry.state {
            EntryState::Lazy { stub: current } | EntryState::Materialized { stub: current, .. } => {
                Arc::ptr_eq(current, stub)
            }
            EntryState::Absolute { .. } => false,
        };
        if !owned || !stub.redirect(body) {
            return false;
        }
        entry.state = EntryState::Materialized {
            def,
            stub: Arc::clone(stub),
        };
        true
    }

    /// Detach a tracker and drop its symbols from the namespace.
    pub(crate) fn remove_tracker(&self, id: TrackerId) -> Result<TrackerState, JitError> {
        #[expect(clippy::unwrap_used, reason = "Mutex poisoning is unrecoverable")]
        let mut trackers = self.trackers.lock().unwrap();
        let state = trackers
            .remove(&id)
            .ok_or(JitError::ResourceTrackerDefunct(id.value()))?;
        #[expect(clippy::unwrap_used, reason = "RwLock poisoning is unrecoverable")]
        let mut symbols = self.symbols.write().unwrap();
        for name in &state.symbols {
            if symbols.get(name).is_some_and(|entry| entry.tracker == id) {
                symbols.remove(name);
            }
        }
        Ok(state)
    }

    /// Detach every tracker and clear the namespace.
    pub(crate) fn drain_trackers(&self) -> Vec<TrackerState> {
        #[expect(clippy::unwrap_used, reason = "Mutex poisoning is unrecoverable")]
        let mut trackers = self.trackers.lock().unwrap();
        #[expect(clippy::unwrap_used, reason = "RwLock poisoning is unrecoverable")]
        let mut symbols = self.symbols.write().unwrap();
        symbols.clear();
        drop(symbols);
        let mut drained: Vec<(TrackerId, TrackerState)> = trackers.drain().collect();
        drained.sort_by_key(|(id, _)| *id);
        drained.into_iter().map(|(_, state)| state).collect()
    }
}

impl std::fmt::Debug for ExecutionSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionSession")
            .field("data_layout", &self.data_layout.as_string())
            .field("symbols", &self.symbol_count())
            .field("ended", &self.is_ended())
            .finish_non_exhaustive()
    }
}
