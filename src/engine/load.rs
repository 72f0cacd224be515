//! Loading and committing
//!
//! Loading walks the backend cursor once and folds every record into the live
//! state. A record that cannot be decoded is logged and skipped; only a
//! backend failure aborts the load. Committing then checks the stored role and
//! hands the restored configuration to the protocol layer.

use crate::codec::{self, Applied, RecordKey, Restore};
use crate::config::{IVU_MIN_HOURS, IVU_TIMEOUT};
use crate::engine::{Inner, LoadOutcome, Phase, Settings};
use crate::error::{Result, SettingsError};
use crate::state::{ConfigState, ModelId, Role, Subnet, ADDR_UNASSIGNED};
use crate::store::Backend;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// What the commit step needs, copied out of the state lock
struct CommitPlan {
    subnets: Vec<Subnet>,
    app_keys: Vec<(u16, [[u8; 16]; 2])>,
    iv_duration: u8,
    publications: Vec<(ModelId, Duration)>,
    models: Vec<ModelId>,
    heartbeat: bool,
}

impl<B: Backend> Inner<B> {
    /// Read every record into the state, returning the stored configuration
    fn read_records(&self) -> Result<Option<ConfigState>> {
        let records = {
            let mut backend = self.backend.lock();
            backend.rewind()?;
            let mut records = Vec::new();
            while let Some(record) = backend.retrieve_next()? {
                records.push(record);
            }
            records
        };
        debug!(count = records.len(), "settings records read");

        let mut stored_cfg = None;
        let mut model_data = Vec::new();
        {
            let mut state = self.state.lock();
            let mut target = Restore {
                state: &mut *state,
                stored_cfg: &mut stored_cfg,
                seq_store_rate: self.config.seq_store_rate,
            };

            for record in records {
                let key: RecordKey = match record.key.parse() {
                    Ok(key) => key,
                    Err(err) => {
                        warn!(key = %record.key, error = %err, "skipping unknown settings key");
                        continue;
                    }
                };

                match codec::apply(&mut target, &key, &record.value) {
                    Ok(Applied::State) => {}
                    Ok(Applied::ModelData(id)) => model_data.push((id, record.value)),
                    Err(err) => warn!(key = %record.key, error = %err, "failed to restore setting"),
                }
            }
        }

        for (id, data) in model_data {
            if let Err(reason) = self.stack.restore_model_data(id, &data) {
                warn!(model = ?id, reason = %reason, "model rejected its stored data");
            }
        }
        Ok(stored_cfg)
    }

    fn check_role(&self, expected: Role) -> Result<()> {
        let stored = self.state.lock().role;
        if stored != Some(expected) {
            error!(?expected, ?stored, "stored role does not match");
            return Err(SettingsError::RoleMismatch { expected, stored });
        }
        Ok(())
    }

    fn plan_commit(&self) -> Option<CommitPlan> {
        let state = self.state.lock();
        if state.subnets.is_empty() {
            return None;
        }

        let publications = state
            .models
            .iter()
            .filter_map(|model| {
                let publication = model.publication.as_ref()?;
                let period = publication.period();
                (publication.is_assigned() && !period.is_zero()).then_some((model.id, period))
            })
            .collect();

        let heartbeat = &state.heartbeat;
        Some(CommitPlan {
            subnets: state.subnets.iter().map(|(_, subnet)| *subnet).collect(),
            app_keys: state
                .app_keys
                .iter()
                .map(|(_, key)| (key.app_idx, [key.keys[0].val, key.keys[1].val]))
                .collect(),
            iv_duration: state.iv.duration_hours,
            publications,
            models: state.models.iter().map(|model| model.id).collect(),
            heartbeat: heartbeat.dst != ADDR_UNASSIGNED
                && heartbeat.count != 0
                && heartbeat.period != 0,
        })
    }

    /// Apply a loaded, provisioned configuration through the stack hooks
    fn commit(&self, plan: CommitPlan, stored_cfg: Option<ConfigState>) {
        self.stack.disable_provisioning_proxy();

        for subnet in &plan.subnets {
            if let Err(reason) = self.stack.init_subnet(subnet) {
                error!(net_idx = subnet.net_idx, reason = %reason, "failed to init subnet");
            }
        }

        let app_ids: Vec<(u16, [u8; 2])> = plan
            .app_keys
            .iter()
            .map(|(app_idx, keys)| {
                (*app_idx, [self.stack.app_id(&keys[0]), self.stack.app_id(&keys[1])])
            })
            .collect();

        if plan.iv_duration < IVU_MIN_HOURS {
            debug!(duration = plan.iv_duration, "resuming IV update recovery");
            self.stack.start_iv_recovery(IVU_TIMEOUT);
        }

        for model in &plan.models {
            if let Some((_, period)) = plan.publications.iter().find(|(id, _)| id == model) {
                let period_ms = period.as_millis() as u64;
                debug!(model = ?model, period_ms, "starting publication");
                self.stack.start_publication(*model, *period);
            }
            self.stack.commit_model(*model);
        }

        if plan.heartbeat {
            self.stack.start_heartbeat();
        }

        {
            let mut state = self.state.lock();
            for (app_idx, ids) in app_ids {
                if let Some(key) = state.app_keys.find_mut(app_idx) {
                    key.keys[0].id = ids[0];
                    key.keys[1].id = ids[1];
                }
            }
            if let Some(cfg) = stored_cfg {
                state.cfg = cfg;
            }
            state.valid = true;
        }
    }
}

impl<B: Backend> Settings<B> {
    /// Restore the persisted configuration and commit it
    ///
    /// Fails with [`SettingsError::RoleMismatch`] when the stored role is
    /// absent or differs from `expected`; the network is not started then.
    pub fn load(&self, expected: Role) -> Result<LoadOutcome> {
        let inner = &self.inner;
        inner.set_phase(Phase::Loading);

        let stored_cfg = match inner.read_records() {
            Ok(cfg) => cfg,
            Err(err) => {
                error!(error = %err, "failed to load settings");
                inner.set_phase(Phase::Idle);
                return Err(err);
            }
        };

        inner.set_phase(Phase::Committing);
        if let Err(err) = inner.check_role(expected) {
            inner.set_phase(Phase::Idle);
            return Err(err);
        }

        let Some(plan) = inner.plan_commit() else {
            info!("no subnets stored, device is unprovisioned");
            inner.set_phase(Phase::Running);
            return Ok(LoadOutcome::Unprovisioned);
        };

        inner.commit(plan, stored_cfg);
        if expected != Role::Provisioner {
            inner.stack.start_network();
        }

        inner.set_phase(Phase::Running);
        info!(role = ?expected, "mesh settings loaded");
        Ok(LoadOutcome::Provisioned)
    }
}
