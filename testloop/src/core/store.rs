//! Versioned key-value store holding every artifact of a run.
//!
//! One store exists per run and it is mutated only by the orchestrating
//! thread. Stages never see the store directly: they receive a [`Snapshot`]
//! restricted to their declared inputs and hand back [`Produced`] entries.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::core::keys::StateKey;
use crate::core::types::{
    AnalysisReport, ExecutionRecord, FinalArtifact, IterationState, ResultReport, ScenarioSet,
    SourceUnit, TestCode,
};
use crate::error::{EngineError, Result};

/// A typed value stored under one [`StateKey`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Entry {
    SourceUnit(SourceUnit),
    AnalysisReport(AnalysisReport),
    ScenarioSet(ScenarioSet),
    TestCode(TestCode),
    ExecutionRecord(ExecutionRecord),
    ResultReport(ResultReport),
    IterationState(IterationState),
    FinalArtifact(Box<FinalArtifact>),
}

impl Entry {
    /// The only key this entry may be stored under.
    pub fn key(&self) -> StateKey {
        match self {
            Entry::SourceUnit(_) => StateKey::SourceUnit,
            Entry::AnalysisReport(_) => StateKey::AnalysisReport,
            Entry::ScenarioSet(_) => StateKey::ScenarioSet,
            Entry::TestCode(_) => StateKey::TestCode,
            Entry::ExecutionRecord(_) => StateKey::ExecutionRecord,
            Entry::ResultReport(_) => StateKey::ResultReport,
            Entry::IterationState(_) => StateKey::IterationState,
            Entry::FinalArtifact(_) => StateKey::FinalArtifact,
        }
    }
}

/// Typed getters over a `lookup` method returning `Result<&Entry>`.
macro_rules! typed_accessors {
    ($lookup:ident; $($method:ident => $variant:ident : $ty:ty),* $(,)?) => {
        $(
            pub fn $method(&self) -> Result<&$ty> {
                match self.$lookup(StateKey::$variant)? {
                    Entry::$variant(value) => {
                        let value: &$ty = value;
                        Ok(value)
                    }
                    other => Err(EngineError::EntryKindMismatch {
                        key: StateKey::$variant,
                        found: other.key(),
                    }),
                }
            }
        )*
    };
}

/// Entries returned by a stage, keyed by the state key they target.
pub type Produced = BTreeMap<StateKey, Entry>;

/// Read-only view of the store restricted to a stage's declared inputs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Snapshot {
    entries: BTreeMap<StateKey, Entry>,
}

impl Snapshot {
    pub fn keys(&self) -> impl Iterator<Item = StateKey> + '_ {
        self.entries.keys().copied()
    }

    pub fn has(&self, key: StateKey) -> bool {
        self.entries.contains_key(&key)
    }

    pub fn entry(&self, key: StateKey) -> Result<&Entry> {
        self.entries
            .get(&key)
            .ok_or(EngineError::MissingKey { key })
    }

    typed_accessors! {
        entry;
        source_unit => SourceUnit: SourceUnit,
        analysis_report => AnalysisReport: AnalysisReport,
        scenario_set => ScenarioSet: ScenarioSet,
        test_code => TestCode: TestCode,
        execution_record => ExecutionRecord: ExecutionRecord,
        result_report => ResultReport: ResultReport,
    }
}

/// One accepted write, in global order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteRecord {
    pub seq: u64,
    pub key: StateKey,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Slot {
    entry: Entry,
    /// Number of accepted writes to this key.
    writes: u64,
    /// Global sequence number of the latest write.
    last_seq: u64,
}

/// Persistable view of a store: entries plus write counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreDump {
    pub write_counter: u64,
    pub frozen: bool,
    pub entries: BTreeMap<StateKey, DumpedEntry>,
    pub log: Vec<WriteRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DumpedEntry {
    pub writes: u64,
    pub last_seq: u64,
    pub entry: Entry,
}

#[derive(Debug, Default)]
pub struct StateStore {
    slots: BTreeMap<StateKey, Slot>,
    write_counter: u64,
    log: Vec<WriteRecord>,
    frozen: bool,
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite `key`.
    ///
    /// Fails when the store is frozen, when `value` belongs under a different
    /// key, or when `key` is write-once and already present. Writing the final
    /// artifact freezes the store.
    pub fn put(&mut self, key: StateKey, value: Entry) -> Result<u64> {
        if self.frozen {
            return Err(EngineError::StoreFrozen { key });
        }
        if value.key() != key {
            return Err(EngineError::EntryKindMismatch {
                key,
                found: value.key(),
            });
        }
        if key.is_write_once() && self.slots.contains_key(&key) {
            return Err(EngineError::IllegalOverwrite { key });
        }

        self.write_counter += 1;
        let seq = self.write_counter;
        let writes = self.slots.get(&key).map_or(0, |slot| slot.writes) + 1;
        self.slots.insert(
            key,
            Slot {
                entry: value,
                writes,
                last_seq: seq,
            },
        );
        self.log.push(WriteRecord { seq, key });
        debug!(%key, seq, writes, "store write");

        if key == StateKey::FinalArtifact {
            self.frozen = true;
            info!(seq, "store frozen");
        }
        Ok(seq)
    }

    pub fn get(&self, key: StateKey) -> Result<&Entry> {
        self.slots
            .get(&key)
            .map(|slot| &slot.entry)
            .ok_or(EngineError::MissingKey { key })
    }

    pub fn has(&self, key: StateKey) -> bool {
        self.slots.contains_key(&key)
    }

    /// Keys from `required` that are not present, in key order.
    pub fn missing<'a, I: IntoIterator<Item = &'a StateKey>>(&self, required: I) -> Vec<StateKey> {
        let missing: BTreeSet<StateKey> = required
            .into_iter()
            .filter(|key| !self.has(**key))
            .copied()
            .collect();
        missing.into_iter().collect()
    }

    /// Copy the entries named by `keys` into a snapshot.
    pub fn snapshot<'a, I: IntoIterator<Item = &'a StateKey>>(&self, keys: I) -> Result<Snapshot> {
        let mut entries = BTreeMap::new();
        for key in keys {
            entries.insert(*key, self.get(*key)?.clone());
        }
        Ok(Snapshot { entries })
    }

    /// Global write counter (number of accepted writes so far).
    pub fn write_counter(&self) -> u64 {
        self.write_counter
    }

    /// Number of accepted writes to `key`.
    pub fn writes_to(&self, key: StateKey) -> u64 {
        self.slots.get(&key).map_or(0, |slot| slot.writes)
    }

    pub fn log(&self) -> &[WriteRecord] {
        &self.log
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    pub fn dump(&self) -> StoreDump {
        StoreDump {
            write_counter: self.write_counter,
            frozen: self.frozen,
            entries: self
                .slots
                .iter()
                .map(|(key, slot)| {
                    (
                        *key,
                        DumpedEntry {
                            writes: slot.writes,
                            last_seq: slot.last_seq,
                            entry: slot.entry.clone(),
                        },
                    )
                })
                .collect(),
            log: self.log.clone(),
        }
    }

    typed_accessors! {
        get;
        source_unit => SourceUnit: SourceUnit,
        test_code => TestCode: TestCode,
        execution_record => ExecutionRecord: ExecutionRecord,
        result_report => ResultReport: ResultReport,
        iteration_state => IterationState: IterationState,
        final_artifact => FinalArtifact: FinalArtifact,
    }
}
