//! Recording fakes shared by the decorator tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use operon_common::{Error, Result};

use crate::crud::CrudResourceOps;
use crate::operation::Operation;
use crate::patch::Patch;
use crate::resource::BasicResource;

/// Ordered log of the calls a fake received
#[derive(Clone, Default)]
pub(crate) struct CallLog(Arc<Mutex<Vec<Operation>>>);

impl CallLog {
    fn push(&self, op: Operation) {
        self.0.lock().unwrap().push(op);
    }

    /// Drain the recorded calls
    pub(crate) fn take(&self) -> Vec<Operation> {
        std::mem::take(&mut *self.0.lock().unwrap())
    }
}

/// Which changes the fake's patches carry
#[derive(Clone, Copy)]
pub(crate) struct ChangeSet {
    create: bool,
    delete: bool,
    update: bool,
}

impl ChangeSet {
    pub(crate) const NONE: Self = Self::new(false, false, false);
    pub(crate) const CREATE: Self = Self::new(true, false, false);
    pub(crate) const DELETE: Self = Self::new(false, true, false);
    pub(crate) const UPDATE: Self = Self::new(false, false, true);
    pub(crate) const ALL: Self = Self::new(true, true, true);

    const fn new(create: bool, delete: bool, update: bool) -> Self {
        Self {
            create,
            delete,
            update,
        }
    }

    fn patch(&self) -> Patch<()> {
        let mut patch = Patch::default();
        if self.create {
            patch = patch.with_create_change(());
        }
        if self.delete {
            patch = patch.with_delete_change(());
        }
        if self.update {
            patch = patch.with_update_change(());
        }
        patch
    }
}

/// Records calls and fails chosen ones
struct Recorder {
    name: String,
    calls: CallLog,
    seen: Mutex<HashMap<Operation, u32>>,
    failures: Vec<(Operation, u32)>,
}

impl Recorder {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            calls: CallLog::default(),
            seen: Mutex::new(HashMap::new()),
            failures: Vec::new(),
        }
    }

    fn record(&self, op: Operation) -> Result<()> {
        self.calls.push(op);
        let nth = {
            let mut seen = self.seen.lock().unwrap();
            let count = seen.entry(op).or_insert(0);
            *count += 1;
            *count
        };
        if self.failures.contains(&(op, nth)) {
            return Err(Error::resource(&self.name, format!("{op} failed")));
        }
        Ok(())
    }
}

/// CRUD ops that record every call
pub(crate) struct RecordingOps {
    recorder: Recorder,
    changes: ChangeSet,
}

impl RecordingOps {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            recorder: Recorder::new(name),
            changes: ChangeSet::ALL,
        }
    }

    pub(crate) fn with_changes(mut self, changes: ChangeSet) -> Self {
        self.changes = changes;
        self
    }

    /// Make the `nth` call (1-based) of `op` fail with a retryable error
    pub(crate) fn fail_on(mut self, op: Operation, nth: u32) -> Self {
        self.recorder.failures.push((op, nth));
        self
    }

    pub(crate) fn calls(&self) -> CallLog {
        self.recorder.calls.clone()
    }
}

#[async_trait]
impl CrudResourceOps<String> for RecordingOps {
    type State = ();
    type Change = ();

    fn name(&self) -> &str {
        &self.recorder.name
    }

    async fn get_current_state(&self, _obj: &String) -> Result<()> {
        self.recorder.record(Operation::GetCurrentState)
    }

    async fn get_desired_state(&self, _obj: &String) -> Result<()> {
        self.recorder.record(Operation::GetDesiredState)
    }

    async fn new_update_patch(
        &self,
        _obj: &String,
        _current: &(),
        _desired: &(),
    ) -> Result<Patch<()>> {
        self.recorder.record(Operation::NewUpdatePatch)?;
        Ok(self.changes.patch())
    }

    async fn new_delete_patch(
        &self,
        _obj: &String,
        _current: &(),
        _desired: &(),
    ) -> Result<Patch<()>> {
        self.recorder.record(Operation::NewDeletePatch)?;
        Ok(self.changes.patch())
    }

    async fn apply_create_change(&self, _obj: &String, _change: &()) -> Result<()> {
        self.recorder.record(Operation::ApplyCreateChange)
    }

    async fn apply_delete_change(&self, _obj: &String, _change: &()) -> Result<()> {
        self.recorder.record(Operation::ApplyDeleteChange)
    }

    async fn apply_update_change(&self, _obj: &String, _change: &()) -> Result<()> {
        self.recorder.record(Operation::ApplyUpdateChange)
    }
}

/// Basic resource that records its ensure calls
pub(crate) struct RecordingResource {
    recorder: Recorder,
}

impl RecordingResource {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            recorder: Recorder::new(name),
        }
    }

    /// Make the `nth` call (1-based) of `op` fail with a retryable error
    pub(crate) fn fail_on(mut self, op: Operation, nth: u32) -> Self {
        self.recorder.failures.push((op, nth));
        self
    }

    pub(crate) fn calls(&self) -> CallLog {
        self.recorder.calls.clone()
    }
}

#[async_trait]
impl BasicResource<String> for RecordingResource {
    fn name(&self) -> &str {
        &self.recorder.name
    }

    async fn ensure_created(&self, _obj: &String) -> Result<()> {
        self.recorder.record(Operation::EnsureCreated)
    }

    async fn ensure_deleted(&self, _obj: &String) -> Result<()> {
        self.recorder.record(Operation::EnsureDeleted)
    }
}
