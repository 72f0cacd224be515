//! Provisioning and reload example for mesh settings
//!
//! This example demonstrates:
//! 1. Opening a file-backed store and starting the engine
//! 2. Provisioning a node: identity, network key, application key, role
//! 3. Configuring a model and letting the debounce worker persist it
//! 4. "Rebooting" by dropping the engine and loading from the same file
//!
//! The store lives in a temporary directory which is removed at the end.

use mesh_settings::state::{AppKey, Subnet};
use mesh_settings::{
    FileStore, LoadOutcome, MeshStack, MeshState, Model, ModelId, Role, Settings, StoreConfig,
};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

const ONOFF_SERVER: ModelId = ModelId::sig(0, 1);

/// Stack that only prints what the engine asks of it
struct PrintingStack;

impl MeshStack for PrintingStack {
    fn app_id(&self, key: &[u8; 16]) -> u8 {
        key.iter().fold(0, |acc, byte| acc ^ byte) & 0x3f
    }

    fn init_subnet(&self, subnet: &Subnet) -> Result<(), String> {
        println!("  stack: deriving credentials for NetKey {:#05x}", subnet.net_idx);
        Ok(())
    }

    fn start_network(&self) {
        println!("  stack: network enabled");
    }

    fn commit_model(&self, model: ModelId) {
        println!("  stack: model {:#06x} committed", model.key());
    }
}

fn composition() -> MeshState {
    MeshState::new(vec![Model::new(ModelId::sig(0, 0)), Model::with_publication(ONOFF_SERVER)])
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let dir = tempfile::tempdir()?;
    let path = dir.path().join("mesh_settings.dat");
    println!("Using settings store at: {:?}", path);

    let config = StoreConfig {
        store_timeout: Duration::from_millis(200),
        ..StoreConfig::default()
    };

    // First boot: nothing stored yet
    {
        let store = FileStore::open(&path, 64 * 1024)?;
        let settings = Settings::new(store, composition(), Arc::new(PrintingStack), config.clone());
        settings.init()?;

        match settings.load(Role::Node) {
            Ok(outcome) => println!("First boot: {:?}", outcome),
            Err(err) => println!("First boot: {}", err),
        }

        println!("Provisioning...");
        {
            let state = settings.state();
            let mut state = state.lock();
            state.role = Some(Role::Node);
            state.identity.primary_addr = 0x0042;
            state.identity.dev_key = [0x11; 16];
            state.subnets.allocate(Subnet::new(0x000, [0x22; 16]))?;
            state.app_keys.allocate(AppKey::new(0x001, 0x000, [0x33; 16]))?;
            state.valid = true;
        }
        settings.store_role();
        settings.store_net();
        settings.store_iv(false);
        settings.store_subnet(0x000)?;
        settings.store_app_key(0x001)?;

        if let Some(model) = settings.state().lock().model_mut(ONOFF_SERVER) {
            model.bind(0x001);
        }
        settings.store_mod_bind(ONOFF_SERVER)?;
        settings.model_data_store(ONOFF_SERVER, &[1])?;

        println!("Next flush in {:?}", settings.next_flush());
        thread::sleep(Duration::from_millis(800));
        println!("Still pending after the worker ran: {:?}", settings.pending());

        let report = settings.flush_now()?;
        println!("Forced flush wrote {} records", report.written);
        settings.deinit();
    }

    // Second boot: everything comes back
    let store = FileStore::open(&path, 64 * 1024)?;
    println!("Store holds {} records", store.len());
    let settings = Settings::new(store, composition(), Arc::new(PrintingStack), config);
    settings.init()?;

    let outcome = settings.load(Role::Node)?;
    assert_eq!(outcome, LoadOutcome::Provisioned);

    let state = settings.state();
    let state = state.lock();
    println!("Reloaded primary address: {:#06x}", state.identity.primary_addr);
    if let Some(app_key) = state.app_keys.find(0x001) {
        println!("AppKey {:#05x} AID: {:#04x}", app_key.app_idx, app_key.keys[0].id);
    }
    if let Some(model) = state.model(ONOFF_SERVER) {
        println!("OnOff server bound to {:?}, data stored: {}", model.keys, model.data_present);
    }

    Ok(())
}
