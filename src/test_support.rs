//! Test support utilities shared across unit and integration tests.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::error::VolumeError;
use crate::volume::{
    CallContext, CreateOpts, GIB, Volume, VolumeFilter, VolumeFuture, VolumeLookup,
    VolumeService, VolumeState,
};

/// Operation recorded by [`ScriptedVolumeService`].
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Call {
    /// `create_volume`.
    Create,
    /// `delete_volume`.
    Delete,
    /// `attach_volume`.
    Attach,
    /// `detach_volume`.
    Detach,
    /// `resize_volume`.
    Resize,
    /// `get_volume`.
    Get,
    /// `list_volumes`.
    List,
}

#[derive(Clone, Debug)]
struct Fault {
    error: VolumeError,
    applied: bool,
}

#[derive(Debug)]
struct ScriptState {
    volumes: BTreeMap<u64, Volume>,
    next_id: u64,
    calls: HashMap<Call, u32>,
    faults: HashMap<Call, VecDeque<Fault>>,
    latency: HashMap<Call, Duration>,
}

impl Default for ScriptState {
    fn default() -> Self {
        Self {
            volumes: BTreeMap::new(),
            next_id: 1,
            calls: HashMap::new(),
            faults: HashMap::new(),
            latency: HashMap::new(),
        }
    }
}

/// In-memory volume provider with scripted failures and latency.
///
/// Provider semantics follow the cloud API: names are unique, attaching an
/// attached volume conflicts and deleting an attached volume is refused.
#[derive(Clone, Debug, Default)]
pub struct ScriptedVolumeService {
    state: Arc<Mutex<ScriptState>>,
}

impl ScriptedVolumeService {
    /// Creates an empty provider.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ScriptState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Seeds a volume and returns its id.
    pub fn insert_volume(&self, volume: Volume) -> u64 {
        let mut state = self.lock();
        let id = volume.id;
        state.next_id = state.next_id.max(id + 1);
        state.volumes.insert(id, volume);
        id
    }

    /// Seeds an unattached volume in `location`.
    pub fn seed(&self, name: &str, size_gib: u64, location: &str) -> u64 {
        let id = self.lock().next_id;
        self.insert_volume(Volume {
            id,
            name: name.to_owned(),
            size_bytes: size_gib * GIB,
            location: location.to_owned(),
            state: VolumeState::Available,
            server: None,
        })
    }

    /// Returns the stored volume, if any.
    #[must_use]
    pub fn volume(&self, id: u64) -> Option<Volume> {
        self.lock().volumes.get(&id).cloned()
    }

    /// Returns all stored volumes ordered by id.
    #[must_use]
    pub fn volumes(&self) -> Vec<Volume> {
        self.lock().volumes.values().cloned().collect()
    }

    /// Number of times `call` reached the provider.
    #[must_use]
    pub fn calls(&self, call: Call) -> u32 {
        self.lock().calls.get(&call).copied().unwrap_or(0)
    }

    /// Makes the next `call` fail with `error` without touching state.
    pub fn fail_next(&self, call: Call, error: VolumeError) {
        self.fail_times(call, 1, error);
    }

    /// Makes the next `times` invocations of `call` fail with `error`.
    pub fn fail_times(&self, call: Call, times: u32, error: VolumeError) {
        let mut state = self.lock();
        let queue = state.faults.entry(call).or_default();
        for _ in 0..times {
            queue.push_back(Fault {
                error: error.clone(),
                applied: false,
            });
        }
    }

    /// Applies the next `call` but reports `error` to the caller, as when a
    /// response is lost after the provider committed the change.
    pub fn lose_next_response(&self, call: Call, error: VolumeError) {
        self.lock().faults.entry(call).or_default().push_back(Fault {
            error,
            applied: true,
        });
    }

    /// Delays every `call` by `latency` before it takes effect.
    pub fn set_latency(&self, call: Call, latency: Duration) {
        self.lock().latency.insert(call, latency);
    }

    async fn enter(&self, call: Call) -> Option<Fault> {
        let latency = {
            let mut state = self.lock();
            *state.calls.entry(call).or_insert(0) += 1;
            state.latency.get(&call).copied()
        };
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        self.lock()
            .faults
            .get_mut(&call)
            .and_then(VecDeque::pop_front)
    }

    async fn invoke<T>(
        &self,
        call: Call,
        apply: impl FnOnce(&mut ScriptState) -> Result<T, VolumeError>,
    ) -> Result<T, VolumeError> {
        match self.enter(call).await {
            Some(Fault {
                error,
                applied: false,
            }) => Err(error),
            Some(Fault {
                error,
                applied: true,
            }) => {
                let _committed = apply(&mut self.lock());
                Err(error)
            }
            None => apply(&mut self.lock()),
        }
    }
}

fn existing(state: &mut ScriptState, id: u64) -> Result<&mut Volume, VolumeError> {
    state
        .volumes
        .get_mut(&id)
        .ok_or_else(|| VolumeError::volume_not_found(id))
}

fn create(state: &mut ScriptState, opts: &CreateOpts) -> Result<Volume, VolumeError> {
    if opts.source_snapshot.is_some() {
        return Err(VolumeError::Invalid(String::from(
            "volumes cannot be restored from snapshots",
        )));
    }
    if state.volumes.values().any(|volume| volume.name == opts.name) {
        return Err(VolumeError::Conflict(format!(
            "name {} is already used",
            opts.name
        )));
    }
    let id = state.next_id;
    state.next_id += 1;
    let volume = Volume {
        id,
        name: opts.name.clone(),
        size_bytes: opts.min_size_bytes.div_ceil(GIB) * GIB,
        location: opts.location.clone(),
        state: VolumeState::Available,
        server: None,
    };
    state.volumes.insert(id, volume.clone());
    Ok(volume)
}

fn delete(state: &mut ScriptState, id: u64) -> Result<(), VolumeError> {
    if let Some(server) = existing(state, id)?.server {
        return Err(VolumeError::Invalid(format!(
            "volume {id} is attached to server {server}"
        )));
    }
    state.volumes.remove(&id);
    Ok(())
}

fn attach(state: &mut ScriptState, volume_id: u64, server_id: u64) -> Result<(), VolumeError> {
    let volume = existing(state, volume_id)?;
    if volume.server.is_some() {
        return Err(VolumeError::Conflict(format!(
            "volume {volume_id} is already attached"
        )));
    }
    volume.server = Some(server_id);
    volume.state = VolumeState::Attached;
    Ok(())
}

fn detach(state: &mut ScriptState, volume_id: u64) -> Result<(), VolumeError> {
    let volume = existing(state, volume_id)?;
    volume.server = None;
    volume.state = VolumeState::Available;
    Ok(())
}

fn resize(state: &mut ScriptState, id: u64, size_bytes: u64) -> Result<u64, VolumeError> {
    let volume = existing(state, id)?;
    let rounded = size_bytes.div_ceil(GIB) * GIB;
    if rounded < volume.size_bytes {
        return Err(VolumeError::Invalid(String::from("volumes cannot shrink")));
    }
    volume.size_bytes = rounded;
    Ok(rounded)
}

fn get(state: &ScriptState, lookup: &VolumeLookup) -> Result<Volume, VolumeError> {
    let found = match lookup {
        VolumeLookup::Id(id) => state.volumes.get(id),
        VolumeLookup::Name(name) => state.volumes.values().find(|volume| &volume.name == name),
    };
    found.cloned().ok_or_else(|| VolumeError::NotFound {
        resource: lookup.to_string(),
    })
}

impl VolumeService for ScriptedVolumeService {
    fn create_volume<'a>(
        &'a self,
        _ctx: &'a CallContext,
        opts: &'a CreateOpts,
    ) -> VolumeFuture<'a, Volume> {
        Box::pin(self.invoke(Call::Create, move |state| create(state, opts)))
    }

    fn delete_volume<'a>(&'a self, _ctx: &'a CallContext, id: u64) -> VolumeFuture<'a, ()> {
        Box::pin(self.invoke(Call::Delete, move |state| delete(state, id)))
    }

    fn attach_volume<'a>(
        &'a self,
        _ctx: &'a CallContext,
        volume_id: u64,
        server_id: u64,
    ) -> VolumeFuture<'a, ()> {
        Box::pin(self.invoke(Call::Attach, move |state| {
            attach(state, volume_id, server_id)
        }))
    }

    fn detach_volume<'a>(
        &'a self,
        _ctx: &'a CallContext,
        volume_id: u64,
        _server_id: Option<u64>,
    ) -> VolumeFuture<'a, ()> {
        Box::pin(self.invoke(Call::Detach, move |state| detach(state, volume_id)))
    }

    fn resize_volume<'a>(
        &'a self,
        _ctx: &'a CallContext,
        id: u64,
        size_bytes: u64,
    ) -> VolumeFuture<'a, u64> {
        Box::pin(self.invoke(Call::Resize, move |state| {
            resize(state, id, size_bytes)
        }))
    }

    fn get_volume<'a>(
        &'a self,
        _ctx: &'a CallContext,
        lookup: &'a VolumeLookup,
    ) -> VolumeFuture<'a, Volume> {
        Box::pin(self.invoke(Call::Get, move |state| get(state, lookup)))
    }

    fn list_volumes<'a>(
        &'a self,
        _ctx: &'a CallContext,
        filter: &'a VolumeFilter,
    ) -> VolumeFuture<'a, Vec<Volume>> {
        Box::pin(self.invoke(Call::List, move |state| {
            Ok(state
                .volumes
                .values()
                .filter(|volume| filter.name.as_ref().is_none_or(|name| &volume.name == name))
                .cloned()
                .collect())
        }))
    }
}
