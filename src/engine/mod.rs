//! The settings engine
//!
//! [`Settings`] ties the pieces together:
//!
//! - the live [`MeshState`], shared with the protocol layer
//! - a [`PendingChangeSet`] of what is owed to storage
//! - a [`FlushTimer`] and its worker thread, which runs flush passes
//! - the [`Backend`] the passes write to
//!
//! Mutation entry points only mark things dirty and arm the timer. Backend
//! I/O happens on the worker or in [`Settings::flush_now`], except for the
//! few operations that must reach storage before returning.
//!
//! Lock order is flush lock, then state, then pending, then backend. Callers
//! must not hold the state lock while calling into the engine.

mod flush;
mod load;

pub use flush::FlushReport;

use crate::codec::{records, ModelAttr, RecordKey};
use crate::config::{StoreConfig, MODEL_DATA_MAX};
use crate::error::{DecodeError, Result, SettingsError, StoreError};
use crate::pending::{Category, DirtySet, KeyKind, PendingChangeSet, UpdateOp};
use crate::scheduler::{flush_delay, FlushTimer};
use crate::stack::MeshStack;
use crate::state::{MeshState, ModelId};
use crate::store::Backend;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Lifecycle phase of the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Not initialized, or deinitialized
    Uninitialized,
    /// Worker running, nothing loaded yet
    Idle,
    /// Reading records from the backend
    Loading,
    /// Applying the loaded configuration to the stack
    Committing,
    /// Loaded and committed
    Running,
}

/// What a successful load found
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    /// A provisioned configuration was restored and committed
    Provisioned,
    /// No subnet was stored; the device is unprovisioned
    Unprovisioned,
}

pub(crate) struct Inner<B: Backend> {
    config: StoreConfig,
    state: Arc<Mutex<MeshState>>,
    pending: Mutex<PendingChangeSet>,
    backend: Mutex<B>,
    stack: Arc<dyn MeshStack>,
    timer: Mutex<FlushTimer>,
    /// Held for the whole of a flush pass
    flush_lock: Mutex<()>,
    phase: Mutex<Phase>,
    /// Backend updates made since the last backend flush
    save_pending: AtomicBool,
}

impl<B: Backend> Inner<B> {
    /// Arm the timer for the given dirty set
    fn schedule(&self, dirty: DirtySet) {
        if dirty.is_empty() {
            return;
        }
        let delay = flush_delay(dirty, &self.config);
        self.timer.lock().schedule(delay);
    }

    /// Arm the timer for whatever is currently pending
    pub(crate) fn reschedule(&self) {
        let dirty = self.pending.lock().dirty();
        self.schedule(dirty);
    }

    fn set_phase(&self, phase: Phase) {
        *self.phase.lock() = phase;
    }

    /// One backend update outside a flush pass
    fn write_through(&self, key: RecordKey, value: Option<&[u8]>) -> Result<()> {
        let name = key.to_string();
        self.backend.lock().update(&name, value)?;
        self.save_pending.store(true, Ordering::Release);
        debug!(key = %name, stored = value.is_some(), "written through");
        Ok(())
    }
}

/// Persistence engine for mesh configuration
///
/// Dropping the engine stops the flush worker without flushing. Call
/// [`Settings::flush_now`] first to persist outstanding changes.
pub struct Settings<B: Backend> {
    inner: Arc<Inner<B>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<B: Backend> Settings<B> {
    /// Create an engine over `backend`
    ///
    /// # Arguments
    ///
    /// * `backend` - Key-value store to persist into
    /// * `state` - Device composition and live state; usually freshly created
    /// * `stack` - Protocol layer hooks used when committing a load
    /// * `config` - Flush timing
    pub fn new(
        backend: B,
        state: MeshState,
        stack: Arc<dyn MeshStack>,
        config: StoreConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                state: Arc::new(Mutex::new(state)),
                pending: Mutex::new(PendingChangeSet::new()),
                backend: Mutex::new(backend),
                stack,
                timer: Mutex::new(FlushTimer::new()),
                flush_lock: Mutex::new(()),
                phase: Mutex::new(Phase::Uninitialized),
                save_pending: AtomicBool::new(false),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Start the flush worker
    pub fn init(&self) -> Result<()> {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            debug!("settings already initialized");
            return Ok(());
        }

        let timer = FlushTimer::new();
        let weak: Weak<Inner<B>> = Arc::downgrade(&self.inner);
        let handle = timer
            .spawn(move || {
                let Some(inner) = weak.upgrade() else {
                    return false;
                };
                if let Err(err) = inner.run_pass() {
                    warn!(error = %err, "scheduled flush failed");
                }
                true
            })
            .map_err(StoreError::from)?;

        *self.inner.timer.lock() = timer;
        *worker = Some(handle);
        drop(worker);

        self.inner.set_phase(Phase::Idle);
        // Changes marked before init still need a pass
        self.inner.reschedule();
        info!("settings initialized");
        Ok(())
    }

    /// Stop the flush worker
    ///
    /// Pending changes stay pending; nothing is flushed.
    pub fn deinit(&self) {
        self.stop_worker();
        self.inner.set_phase(Phase::Uninitialized);
        info!("settings deinitialized");
    }

    fn stop_worker(&self) {
        self.inner.timer.lock().shutdown();
        if let Some(handle) = self.worker.lock().take() {
            if handle.join().is_err() {
                error!("flush worker panicked");
            }
        }
    }

    /// Current lifecycle phase
    pub fn phase(&self) -> Phase {
        *self.inner.phase.lock()
    }

    /// Shared handle to the live mesh state
    pub fn state(&self) -> Arc<Mutex<MeshState>> {
        Arc::clone(&self.inner.state)
    }

    /// Flush timing in use
    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    /// Categories waiting for a flush pass
    pub fn pending(&self) -> DirtySet {
        self.inner.pending.lock().dirty()
    }

    /// Time until the armed flush deadline, if any
    pub fn next_flush(&self) -> Option<Duration> {
        self.inner.timer.lock().remaining()
    }

    /// Run a flush pass now and make the result durable
    pub fn flush_now(&self) -> Result<FlushReport> {
        let report = self.inner.run_pass()?;
        if self.inner.save_pending.swap(false, Ordering::AcqRel) {
            if let Err(err) = self.inner.backend.lock().flush() {
                self.inner.save_pending.store(true, Ordering::Release);
                return Err(err.into());
            }
        }
        Ok(report)
    }

    /// Erase every stored record and drop everything pending
    pub fn clear_all(&self) -> Result<()> {
        let _pass = self.inner.flush_lock.lock();
        self.inner.pending.lock().clear();
        self.inner.backend.lock().erase_all()?;
        self.inner.save_pending.store(true, Ordering::Release);
        info!("all settings erased");
        Ok(())
    }

    fn mark(&self, categories: &[Category]) {
        let dirty = {
            let mut pending = self.inner.pending.lock();
            for category in categories {
                pending.mark(*category);
            }
            pending.dirty()
        };
        self.inner.schedule(dirty);
    }

    /// Persist the primary address and device key
    pub fn store_net(&self) {
        debug!("network identity marked for storage");
        self.mark(&[Category::Net]);
    }

    /// Remove the network identity, IV index and configuration
    ///
    /// The records are deleted by the next pass as long as the state is not
    /// valid.
    pub fn clear_net(&self) {
        debug!("network identity marked for clearing");
        self.mark(&[Category::Net, Category::Iv, Category::Cfg]);
    }

    /// Persist the IV index
    ///
    /// Unless only the IV update duration changed, the sequence number is
    /// stored along with it.
    pub fn store_iv(&self, only_duration: bool) {
        if only_duration {
            self.mark(&[Category::Iv]);
        } else {
            self.mark(&[Category::Iv, Category::Seq]);
        }
    }

    /// Persist the sequence number if it sits on a store-rate boundary
    ///
    /// Returns whether the sequence number was marked.
    pub fn store_seq(&self) -> bool {
        let rate = self.inner.config.seq_store_rate;
        let seq = self.inner.state.lock().seq;
        if rate != 0 && seq % rate != 0 {
            return false;
        }
        self.mark(&[Category::Seq]);
        true
    }

    /// Reset the sequence number to zero and persist it
    pub fn clear_seq(&self) {
        self.inner.state.lock().seq = 0;
        self.mark(&[Category::Seq]);
    }

    /// Persist the operating role
    pub fn store_role(&self) {
        self.mark(&[Category::Role]);
    }

    /// Persist the replay entry of `src`
    pub fn store_rpl(&self, src: u16) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            let entry = state
                .replay
                .find_mut(src)
                .ok_or_else(|| SettingsError::NotFound(format!("replay entry {src:#06x}")))?;
            entry.store_pending = true;
        }
        self.mark(&[Category::Rpl]);
        Ok(())
    }

    /// Delete every replay entry from storage and memory, immediately
    pub fn clear_rpl(&self) -> Result<()> {
        let sources: Vec<u16> = {
            let state = self.inner.state.lock();
            state.replay.iter().map(|(_, entry)| entry.src).collect()
        };

        for src in sources {
            self.inner.write_through(RecordKey::Rpl(src), None)?;
            self.inner.state.lock().replay.remove(src);
        }
        debug!("replay list cleared");
        Ok(())
    }

    fn mark_key(&self, kind: KeyKind, idx: u16, op: UpdateOp) -> Result<()> {
        let marked = {
            let mut pending = self.inner.pending.lock();
            pending.mark_key(kind, idx, op).map(|()| pending.dirty())
        };
        match marked {
            Ok(dirty) => {
                self.inner.schedule(dirty);
                Ok(())
            }
            Err(exhausted) => {
                warn!(error = %exhausted, idx, "key update table full, writing through");
                let key = match kind {
                    KeyKind::Net => RecordKey::NetKey(idx),
                    KeyKind::App => RecordKey::AppKey(idx),
                };
                let value = match op {
                    UpdateOp::Clear => None,
                    UpdateOp::Store => {
                        let state = self.inner.state.lock();
                        match kind {
                            KeyKind::Net => {
                                state.subnets.find(idx).map(|s| records::encode_net_key(s).to_vec())
                            }
                            KeyKind::App => state
                                .app_keys
                                .find(idx)
                                .map(|k| records::encode_app_key(k).to_vec()),
                        }
                    }
                };
                match (op, value) {
                    (UpdateOp::Store, None) => Err(SettingsError::NotFound(key.to_string())),
                    (_, value) => self.inner.write_through(key, value.as_deref()),
                }
            }
        }
    }

    /// Persist the network key `net_idx`
    pub fn store_subnet(&self, net_idx: u16) -> Result<()> {
        if self.inner.state.lock().subnets.find(net_idx).is_none() {
            return Err(SettingsError::NotFound(format!("subnet {net_idx:#05x}")));
        }
        debug!(net_idx, "network key marked for storage");
        self.mark_key(KeyKind::Net, net_idx, UpdateOp::Store)
    }

    /// Delete the network key `net_idx` from storage
    pub fn clear_subnet(&self, net_idx: u16) -> Result<()> {
        debug!(net_idx, "network key marked for clearing");
        self.mark_key(KeyKind::Net, net_idx, UpdateOp::Clear)
    }

    /// Persist the application key `app_idx`
    pub fn store_app_key(&self, app_idx: u16) -> Result<()> {
        if self.inner.state.lock().app_keys.find(app_idx).is_none() {
            return Err(SettingsError::NotFound(format!("app key {app_idx:#05x}")));
        }
        debug!(app_idx, "application key marked for storage");
        self.mark_key(KeyKind::App, app_idx, UpdateOp::Store)
    }

    /// Delete the application key `app_idx` from storage
    pub fn clear_app_key(&self, app_idx: u16) -> Result<()> {
        debug!(app_idx, "application key marked for clearing");
        self.mark_key(KeyKind::App, app_idx, UpdateOp::Clear)
    }

    /// Persist the heartbeat publication
    pub fn store_hb_pub(&self) {
        self.mark(&[Category::HbPub]);
    }

    /// Persist the configuration server state on the next pass
    pub fn store_cfg(&self) {
        self.mark(&[Category::Cfg]);
    }

    /// Persist the configuration server state before returning
    pub fn store_cfg_now(&self) -> Result<()> {
        let value = {
            let state = self.inner.state.lock();
            state.valid.then(|| records::encode_cfg(&state.cfg))
        };
        self.inner
            .write_through(RecordKey::Cfg, value.as_ref().map(|value| &value[..]))
    }

    fn mark_model(&self, id: ModelId, attr: ModelAttr) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            let model = state
                .model_mut(id)
                .ok_or_else(|| SettingsError::NotFound(format!("model {id:?}")))?;
            match attr {
                ModelAttr::Bind => model.bind_pending = true,
                ModelAttr::Sub => model.sub_pending = true,
                ModelAttr::Pub => model.pub_pending = true,
                ModelAttr::Data => {}
            }
        }
        self.mark(&[Category::Model]);
        Ok(())
    }

    /// Persist the AppKey bindings of a model
    pub fn store_mod_bind(&self, id: ModelId) -> Result<()> {
        self.mark_model(id, ModelAttr::Bind)
    }

    /// Persist the subscription list of a model
    pub fn store_mod_sub(&self, id: ModelId) -> Result<()> {
        self.mark_model(id, ModelAttr::Sub)
    }

    /// Persist the publication parameters of a model
    pub fn store_mod_pub(&self, id: ModelId) -> Result<()> {
        self.mark_model(id, ModelAttr::Pub)
    }

    /// Store opaque model data before returning
    ///
    /// Empty `data` deletes a previously stored value and is a no-op when
    /// there is none.
    pub fn model_data_store(&self, id: ModelId, data: &[u8]) -> Result<()> {
        let key = RecordKey::Model {
            id,
            attr: ModelAttr::Data,
        };
        if data.len() > MODEL_DATA_MAX {
            return Err(DecodeError::Length {
                key: key.to_string(),
                expected: MODEL_DATA_MAX,
                actual: data.len(),
            }
            .into());
        }

        let present = self
            .inner
            .state
            .lock()
            .model(id)
            .map(|model| model.data_present)
            .ok_or_else(|| SettingsError::NotFound(format!("model {id:?}")))?;

        let value = if !data.is_empty() {
            Some(data)
        } else if present {
            None
        } else {
            return Ok(());
        };

        self.inner.write_through(key, value)?;
        if let Some(model) = self.inner.state.lock().model_mut(id) {
            model.data_present = value.is_some();
        }
        Ok(())
    }

    /// Persist the virtual address label in `slot`
    ///
    /// A label whose reference count dropped to zero is deleted from storage.
    pub fn store_label(&self, slot: usize) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            let label = state
                .labels
                .slot_mut(slot)
                .ok_or_else(|| SettingsError::NotFound(format!("label slot {slot}")))?;
            label.changed = true;
        }
        self.mark(&[Category::Labels]);
        Ok(())
    }

    fn mark_node(&self, addr: u16, op: UpdateOp) -> Result<()> {
        let marked = {
            let mut pending = self.inner.pending.lock();
            pending.mark_node(addr, op).map(|()| pending.dirty())
        };
        match marked {
            Ok(dirty) => {
                self.inner.schedule(dirty);
                Ok(())
            }
            Err(exhausted) => {
                warn!(error = %exhausted, addr, "node update table full, writing through");
                let key = RecordKey::Node(addr);
                match op {
                    UpdateOp::Clear => self.inner.write_through(key, None),
                    UpdateOp::Store => {
                        let value = self
                            .inner
                            .state
                            .lock()
                            .nodes
                            .find(addr)
                            .map(records::encode_node)
                            .ok_or_else(|| SettingsError::NotFound(key.to_string()))?;
                        self.inner.write_through(key, Some(&value))
                    }
                }
            }
        }
    }

    /// Persist the registry entry of node `addr`
    pub fn store_node(&self, addr: u16) -> Result<()> {
        if self.inner.state.lock().nodes.find(addr).is_none() {
            return Err(SettingsError::NotFound(format!("node {addr:#06x}")));
        }
        debug!(addr, "node marked for storage");
        self.mark_node(addr, UpdateOp::Store)
    }

    /// Delete the registry entry of node `addr` from storage
    pub fn clear_node(&self, addr: u16) -> Result<()> {
        debug!(addr, "node marked for clearing");
        self.mark_node(addr, UpdateOp::Clear)
    }
}

impl<B: Backend> Drop for Settings<B> {
    fn drop(&mut self) {
        self.stop_worker();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{Model, Subnet};
    use crate::store::{MemoryStore, WriteOp};

    struct NullStack;

    impl MeshStack for NullStack {
        fn app_id(&self, _key: &[u8; 16]) -> u8 {
            0
        }
    }

    fn settings(store: &MemoryStore, state: MeshState) -> Settings<MemoryStore> {
        Settings::new(store.clone(), state, Arc::new(NullStack), StoreConfig::default())
    }

    #[test]
    fn test_mutations_only_mark() {
        let store = MemoryStore::new();
        let settings = settings(&store, MeshState::default());

        settings.store_net();
        settings.store_hb_pub();
        assert!(store.writes().is_empty());
        assert!(settings.pending().contains(Category::Net));
        assert!(settings.next_flush().unwrap() <= Duration::from_millis(500));
    }

    #[test]
    fn test_store_seq_respects_rate() {
        let store = MemoryStore::new();
        let settings = settings(&store, MeshState::default());

        settings.state().lock().seq = 129;
        assert!(!settings.store_seq());
        settings.state().lock().seq = 256;
        assert!(settings.store_seq());
        assert!(settings.pending().contains(Category::Seq));
    }

    #[test]
    fn test_missing_entities_are_not_found() {
        let store = MemoryStore::new();
        let settings = settings(&store, MeshState::default());

        assert!(matches!(settings.store_subnet(1), Err(SettingsError::NotFound(_))));
        assert!(matches!(settings.store_rpl(0x10), Err(SettingsError::NotFound(_))));
        assert!(matches!(
            settings.store_mod_bind(ModelId::sig(0, 0)),
            Err(SettingsError::NotFound(_))
        ));
        assert!(matches!(settings.store_label(0), Err(SettingsError::NotFound(_))));
    }

    #[test]
    fn test_model_data_store() {
        let store = MemoryStore::new();
        let id = ModelId::sig(0, 2);
        let settings = settings(&store, MeshState::new(vec![Model::new(id)]));

        // Nothing stored, nothing to delete
        settings.model_data_store(id, &[]).unwrap();
        assert!(store.writes().is_empty());

        settings.model_data_store(id, b"level").unwrap();
        assert_eq!(store.get("s/2/data"), Some(b"level".to_vec()));
        assert!(settings.state().lock().model(id).unwrap().data_present);

        settings.model_data_store(id, &[]).unwrap();
        assert_eq!(store.take_writes().last(), Some(&WriteOp::Delete("s/2/data".into())));
        assert!(!settings.state().lock().model(id).unwrap().data_present);

        let oversized = vec![0; MODEL_DATA_MAX + 1];
        assert!(matches!(
            settings.model_data_store(id, &oversized),
            Err(SettingsError::Decode(DecodeError::Length { .. }))
        ));
    }

    #[test]
    fn test_flush_now_flushes_backend_once() {
        let store = MemoryStore::new();
        let mut state = MeshState::default();
        state.subnets.allocate(Subnet::new(0, [1; 16])).unwrap();
        let settings = settings(&store, state);

        settings.store_subnet(0).unwrap();
        let report = settings.flush_now().unwrap();
        assert_eq!(report.written, 1);
        assert_eq!(store.flush_count(), 1);

        // Nothing pending: no backend flush
        assert_eq!(settings.flush_now().unwrap().written, 0);
        assert_eq!(store.flush_count(), 1);
    }

    #[test]
    fn test_init_and_deinit() {
        let store = MemoryStore::new();
        let settings = settings(&store, MeshState::default());
        assert_eq!(settings.phase(), Phase::Uninitialized);

        settings.init().unwrap();
        settings.init().unwrap();
        assert_eq!(settings.phase(), Phase::Idle);

        settings.deinit();
        assert_eq!(settings.phase(), Phase::Uninitialized);
        settings.init().unwrap();
        assert_eq!(settings.phase(), Phase::Idle);
    }
}
