//! Simulated Remote
//!
//! TigerStyle: Deterministic, in-memory device for testing every flow.
//!
//! [`SimDevice`] implements [`DeviceApi`] without a network:
//! - setup pages are scripted per driver with a [`SetupResponder`]
//! - every call is recorded in order ([`SimCall`])
//! - faults can be injected per operation ([`SimOp`], [`SimFault`]),
//!   optionally skipping the first matching calls
//! - open setup sessions are tracked so tests can assert cleanup
//!
//! A restore step (`restore_data` submitted) creates the instance
//! `{driver_id}.main`, exposing the entities set with
//! [`SimDevice::set_driver_entities`].
//!
//! # Usage
//!
//! ```rust
//! use intg_manager::sim::{dropdown_field, page, SetupRequest, SimDevice};
//! use serde_json::json;
//!
//! let device = SimDevice::new();
//! device.add_driver("psn", "1.0.0");
//! device.set_responder("psn", |_req: &SetupRequest| {
//!     page("WAIT_USER_ACTION", json!([dropdown_field("choice", "ps5")]))
//! });
//! ```

use crate::release::{ReleaseArtifact, ReleaseError, ReleaseSource};
use crate::remote::{
    DeviceApi, DriverInfo, EntityFilter, EntityInfo, InstanceInfo, RemoteError, SetupInputs,
    DRIVER_TYPE_CUSTOM,
};
use crate::setup::fields::FIELD_RESTORE_DATA;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

// =============================================================================
// TigerStyle Constants
// =============================================================================

/// Suffix of instances created by a simulated restore
pub const SIM_INSTANCE_SUFFIX: &str = ".main";

/// Device state of simulated instances
pub const SIM_DEVICE_STATE: &str = "CONNECTED";

// =============================================================================
// Types
// =============================================================================

/// A setup-flow request as seen by a responder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetupRequest {
    Begin { reconfigure: bool },
    Advance { inputs: SetupInputs },
}

/// Produces the setup page for a begin/advance request.
pub type SetupResponder = Arc<dyn Fn(&SetupRequest) -> Value + Send + Sync>;

/// Produces the page for a read (overrides "last page").
pub type ReadResponder = Arc<dyn Fn() -> Value + Send + Sync>;

/// Operations faults can be injected into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SimOp {
    StartSetup,
    GetSetup,
    SendSetupInput,
    DeleteSetup,
    GetDriver,
    ListDrivers,
    ListInstances,
    ListEnabledInstances,
    GetInstance,
    ListEntities,
    RegisterEntities,
    DeleteAllEntities,
    DeleteDriver,
    InstallDriver,
}

/// A fault returned instead of the operation's result.
#[derive(Debug, Clone)]
pub struct SimFault {
    error: RemoteError,
    persistent: bool,
    /// Matching calls to let through before firing
    skip: usize,
}

impl SimFault {
    pub fn new(error: RemoteError) -> Self {
        Self {
            error,
            persistent: false,
            skip: 0,
        }
    }

    /// Connection failure.
    pub fn transport() -> Self {
        Self::new(RemoteError::Transport("connection refused".to_string()))
    }

    /// HTTP error status.
    pub fn api(status: u16) -> Self {
        Self::new(RemoteError::Api {
            status,
            body: format!("simulated {}", status),
        })
    }

    /// Keep firing instead of firing once.
    pub fn persistent(mut self) -> Self {
        self.persistent = true;
        self
    }

    /// Let the first `calls` matching calls succeed.
    pub fn after(mut self, calls: usize) -> Self {
        self.skip = calls;
        self
    }
}

/// One recorded call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimCall {
    StartSetup { driver_id: String, reconfigure: bool },
    GetSetup { driver_id: String },
    SendSetupInput { driver_id: String, inputs: SetupInputs },
    DeleteSetup { driver_id: String },
    GetDriver { driver_id: String },
    ListDrivers,
    ListInstances,
    ListEnabledInstances,
    GetInstance { instance_id: String },
    ListEntities { instance_id: String, filter: EntityFilter },
    RegisterEntities { instance_id: String, entity_ids: Option<Vec<String>> },
    DeleteAllEntities { instance_id: String },
    DeleteDriver { driver_id: String },
    InstallDriver { filename: String, bytes: usize },
}

#[derive(Debug, Clone)]
struct SimInstance {
    info: InstanceInfo,
    available: Vec<String>,
}

#[derive(Default)]
struct SimState {
    drivers: BTreeMap<String, DriverInfo>,
    instances: BTreeMap<String, SimInstance>,
    driver_entities: HashMap<String, Vec<String>>,
    responders: HashMap<String, SetupResponder>,
    read_responders: HashMap<String, ReadResponder>,
    pages: HashMap<String, Value>,
    sessions: BTreeSet<String>,
    staged_install: Option<DriverInfo>,
    faults: Vec<(SimOp, SimFault)>,
    calls: Vec<SimCall>,
}

// =============================================================================
// Page Builders
// =============================================================================

/// A setup response with the given state and settings list.
pub fn page(state: &str, settings: Value) -> Value {
    json!({
        "state": state,
        "require_user_action": {"input": {"settings": settings}}
    })
}

pub fn dropdown_field(id: &str, value: &str) -> Value {
    json!({"id": id, "field": {"dropdown": {"value": value, "items": [{"id": value}]}}})
}

pub fn textarea_field(id: &str, value: &str) -> Value {
    json!({"id": id, "field": {"textarea": {"value": value}}})
}

pub fn label_field(id: &str, text: &str) -> Value {
    json!({"id": id, "field": {"label": {"value": {"en": text}}}})
}

// =============================================================================
// SimDevice
// =============================================================================

/// In-memory remote.
#[derive(Default)]
pub struct SimDevice {
    state: Mutex<SimState>,
}

impl SimDevice {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Install a custom driver.
    pub fn add_driver(&self, driver_id: &str, version: &str) {
        self.add_driver_info(DriverInfo {
            driver_id: driver_id.to_string(),
            name: json!({"en": driver_id}),
            version: Some(version.to_string()),
            driver_type: Some(DRIVER_TYPE_CUSTOM.to_string()),
            home_page: None,
        });
    }

    pub fn add_driver_info(&self, info: DriverInfo) {
        self.state().drivers.insert(info.driver_id.clone(), info);
    }

    /// Entities an instance of `driver_id` exposes.
    pub fn set_driver_entities(&self, driver_id: &str, entities: &[&str]) {
        self.state().driver_entities.insert(
            driver_id.to_string(),
            entities.iter().map(|e| e.to_string()).collect(),
        );
    }

    /// Add a configured instance with its registered entities.
    pub fn add_instance(&self, driver_id: &str, instance_id: &str, configured: &[&str]) {
        let mut state = self.state();
        let available = state
            .driver_entities
            .get(driver_id)
            .cloned()
            .unwrap_or_else(|| configured.iter().map(|e| e.to_string()).collect());
        let version = state.drivers.get(driver_id).and_then(|d| d.version.clone());
        state.instances.insert(
            instance_id.to_string(),
            SimInstance {
                info: InstanceInfo {
                    integration_id: instance_id.to_string(),
                    driver_id: driver_id.to_string(),
                    name: json!(instance_id),
                    device_state: Some(SIM_DEVICE_STATE.to_string()),
                    configured_entities: configured.iter().map(|e| e.to_string()).collect(),
                    version,
                    ..InstanceInfo::default()
                },
                available,
            },
        );
    }

    /// Driver the next `install_driver` call installs.
    pub fn stage_install(&self, driver_id: &str, version: &str) {
        self.state().staged_install = Some(DriverInfo {
            driver_id: driver_id.to_string(),
            name: json!({"en": driver_id}),
            version: Some(version.to_string()),
            driver_type: Some(DRIVER_TYPE_CUSTOM.to_string()),
            home_page: None,
        });
    }

    /// Script begin/advance responses for a driver.
    pub fn set_responder<F>(&self, driver_id: &str, responder: F)
    where
        F: Fn(&SetupRequest) -> Value + Send + Sync + 'static,
    {
        self.state()
            .responders
            .insert(driver_id.to_string(), Arc::new(responder));
    }

    /// Script read responses for a driver.
    pub fn set_read_responder<F>(&self, driver_id: &str, responder: F)
    where
        F: Fn() -> Value + Send + Sync + 'static,
    {
        self.state()
            .read_responders
            .insert(driver_id.to_string(), Arc::new(responder));
    }

    pub fn inject_fault(&self, op: SimOp, fault: SimFault) {
        self.state().faults.push((op, fault));
    }

    pub fn clear_faults(&self) {
        self.state().faults.clear();
    }

    // -------------------------------------------------------------------------
    // Inspection
    // -------------------------------------------------------------------------

    pub fn calls(&self) -> Vec<SimCall> {
        self.state().calls.clone()
    }

    /// Drivers with a setup session currently open.
    pub fn open_sessions(&self) -> Vec<String> {
        self.state().sessions.iter().cloned().collect()
    }

    /// Number of `DELETE /setup` calls for a driver.
    pub fn setup_ends(&self, driver_id: &str) -> usize {
        self.state()
            .calls
            .iter()
            .filter(|c| matches!(c, SimCall::DeleteSetup { driver_id: d } if d == driver_id))
            .count()
    }

    /// Inputs submitted to a driver's setup flow, in order.
    pub fn inputs_sent(&self, driver_id: &str) -> Vec<SetupInputs> {
        self.state()
            .calls
            .iter()
            .filter_map(|c| match c {
                SimCall::SendSetupInput { driver_id: d, inputs } if d == driver_id => Some(inputs.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn drivers(&self) -> Vec<DriverInfo> {
        self.state().drivers.values().cloned().collect()
    }

    pub fn instances(&self) -> Vec<InstanceInfo> {
        self.state().instances.values().map(|i| i.info.clone()).collect()
    }

    /// Registered entities of an instance.
    pub fn configured_entities(&self, instance_id: &str) -> Option<Vec<String>> {
        self.state()
            .instances
            .get(instance_id)
            .map(|i| i.info.configured_entities.clone())
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    /// Record the call and return an injected fault, if any.
    fn enter(&self, op: SimOp, call: SimCall) -> Result<MutexGuard<'_, SimState>, RemoteError> {
        let mut state = self.state();
        state.calls.push(call);
        if let Some(pos) = state.faults.iter().position(|(o, _)| *o == op) {
            if state.faults[pos].1.skip > 0 {
                state.faults[pos].1.skip -= 1;
                return Ok(state);
            }
            let fault = if state.faults[pos].1.persistent {
                state.faults[pos].1.clone()
            } else {
                state.faults.remove(pos).1
            };
            return Err(fault.error);
        }
        Ok(state)
    }

    fn not_found(what: &str, id: &str) -> RemoteError {
        RemoteError::Api {
            status: 404,
            body: format!("{} {} not found", what, id),
        }
    }

    fn respond(&self, driver_id: &str, request: &SetupRequest) -> Value {
        let responder = self.state().responders.get(driver_id).cloned();
        let response = match responder {
            Some(responder) => (*responder)(request),
            None => page("WAIT_USER_ACTION", json!([])),
        };
        self.state()
            .pages
            .insert(driver_id.to_string(), response.clone());
        response
    }

    fn create_restored_instance(&self, driver_id: &str) {
        let mut state = self.state();
        let instance_id = format!("{}{}", driver_id, SIM_INSTANCE_SUFFIX);
        let available = state.driver_entities.get(driver_id).cloned().unwrap_or_default();
        let version = state.drivers.get(driver_id).and_then(|d| d.version.clone());
        state.instances.insert(
            instance_id.clone(),
            SimInstance {
                info: InstanceInfo {
                    integration_id: instance_id,
                    driver_id: driver_id.to_string(),
                    name: json!(driver_id),
                    device_state: Some(SIM_DEVICE_STATE.to_string()),
                    version,
                    ..InstanceInfo::default()
                },
                available,
            },
        );
    }
}

#[async_trait]
impl DeviceApi for SimDevice {
    async fn start_setup(&self, driver_id: &str, reconfigure: bool) -> Result<Value, RemoteError> {
        {
            let mut state = self.enter(
                SimOp::StartSetup,
                SimCall::StartSetup {
                    driver_id: driver_id.to_string(),
                    reconfigure,
                },
            )?;
            if !state.drivers.contains_key(driver_id) {
                return Err(Self::not_found("driver", driver_id));
            }
            state.sessions.insert(driver_id.to_string());
        }
        Ok(self.respond(driver_id, &SetupRequest::Begin { reconfigure }))
    }

    async fn get_setup(&self, driver_id: &str) -> Result<Value, RemoteError> {
        let (read_responder, last_page) = {
            let state = self.enter(
                SimOp::GetSetup,
                SimCall::GetSetup {
                    driver_id: driver_id.to_string(),
                },
            )?;
            (
                state.read_responders.get(driver_id).cloned(),
                state.pages.get(driver_id).cloned(),
            )
        };
        match (read_responder, last_page) {
            (Some(responder), _) => Ok((*responder)()),
            (None, Some(page)) => Ok(page),
            (None, None) => Err(Self::not_found("setup session", driver_id)),
        }
    }

    async fn send_setup_input(&self, driver_id: &str, inputs: &SetupInputs) -> Result<Value, RemoteError> {
        {
            let state = self.enter(
                SimOp::SendSetupInput,
                SimCall::SendSetupInput {
                    driver_id: driver_id.to_string(),
                    inputs: inputs.clone(),
                },
            )?;
            if !state.sessions.contains(driver_id) {
                return Err(Self::not_found("setup session", driver_id));
            }
        }
        if inputs.contains_key(FIELD_RESTORE_DATA) {
            self.create_restored_instance(driver_id);
        }
        Ok(self.respond(
            driver_id,
            &SetupRequest::Advance {
                inputs: inputs.clone(),
            },
        ))
    }

    async fn delete_setup(&self, driver_id: &str) -> Result<(), RemoteError> {
        let mut state = self.enter(
            SimOp::DeleteSetup,
            SimCall::DeleteSetup {
                driver_id: driver_id.to_string(),
            },
        )?;
        state.sessions.remove(driver_id);
        state.pages.remove(driver_id);
        Ok(())
    }

    async fn get_driver(&self, driver_id: &str) -> Result<Option<DriverInfo>, RemoteError> {
        let state = self.enter(
            SimOp::GetDriver,
            SimCall::GetDriver {
                driver_id: driver_id.to_string(),
            },
        )?;
        Ok(state.drivers.get(driver_id).cloned())
    }

    async fn list_drivers(&self) -> Result<Vec<DriverInfo>, RemoteError> {
        let state = self.enter(SimOp::ListDrivers, SimCall::ListDrivers)?;
        Ok(state.drivers.values().cloned().collect())
    }

    async fn list_instances(&self) -> Result<Vec<InstanceInfo>, RemoteError> {
        let state = self.enter(SimOp::ListInstances, SimCall::ListInstances)?;
        Ok(state.instances.values().map(|i| i.info.clone()).collect())
    }

    async fn list_enabled_instances(&self) -> Result<Vec<InstanceInfo>, RemoteError> {
        let state = self.enter(SimOp::ListEnabledInstances, SimCall::ListEnabledInstances)?;
        Ok(state
            .instances
            .values()
            .filter(|i| i.info.enabled)
            .map(|i| i.info.clone())
            .collect())
    }

    async fn get_instance(&self, instance_id: &str) -> Result<InstanceInfo, RemoteError> {
        let state = self.enter(
            SimOp::GetInstance,
            SimCall::GetInstance {
                instance_id: instance_id.to_string(),
            },
        )?;
        state
            .instances
            .get(instance_id)
            .map(|i| i.info.clone())
            .ok_or_else(|| Self::not_found("instance", instance_id))
    }

    async fn list_instance_entities(
        &self,
        instance_id: &str,
        filter: EntityFilter,
    ) -> Result<Vec<EntityInfo>, RemoteError> {
        let state = self.enter(
            SimOp::ListEntities,
            SimCall::ListEntities {
                instance_id: instance_id.to_string(),
                filter,
            },
        )?;
        let instance = state
            .instances
            .get(instance_id)
            .ok_or_else(|| Self::not_found("instance", instance_id))?;
        let configured = &instance.info.configured_entities;
        let ids: Vec<&String> = match filter {
            EntityFilter::All => instance.available.iter().collect(),
            EntityFilter::Configured => configured.iter().collect(),
            EntityFilter::New => instance
                .available
                .iter()
                .filter(|e| !configured.contains(e))
                .collect(),
        };
        Ok(ids
            .into_iter()
            .map(|id| EntityInfo {
                entity_id: id.clone(),
                ..EntityInfo::default()
            })
            .collect())
    }

    async fn register_entities(&self, instance_id: &str, entity_ids: Option<&[String]>) -> Result<(), RemoteError> {
        let mut state = self.enter(
            SimOp::RegisterEntities,
            SimCall::RegisterEntities {
                instance_id: instance_id.to_string(),
                entity_ids: entity_ids.map(<[String]>::to_vec),
            },
        )?;
        let instance = state
            .instances
            .get_mut(instance_id)
            .ok_or_else(|| Self::not_found("instance", instance_id))?;
        let wanted = match entity_ids {
            Some(ids) if !ids.is_empty() => ids.to_vec(),
            _ => instance.available.clone(),
        };
        for id in wanted {
            if !instance.info.configured_entities.contains(&id) {
                instance.info.configured_entities.push(id);
            }
        }
        Ok(())
    }

    async fn delete_all_entities(&self, instance_id: &str) -> Result<(), RemoteError> {
        let mut state = self.enter(
            SimOp::DeleteAllEntities,
            SimCall::DeleteAllEntities {
                instance_id: instance_id.to_string(),
            },
        )?;
        let instance = state
            .instances
            .get_mut(instance_id)
            .ok_or_else(|| Self::not_found("instance", instance_id))?;
        instance.info.configured_entities.clear();
        Ok(())
    }

    async fn delete_driver(&self, driver_id: &str) -> Result<(), RemoteError> {
        let mut state = self.enter(
            SimOp::DeleteDriver,
            SimCall::DeleteDriver {
                driver_id: driver_id.to_string(),
            },
        )?;
        if state.drivers.remove(driver_id).is_none() {
            return Err(Self::not_found("driver", driver_id));
        }
        state.instances.retain(|_, i| i.info.driver_id != driver_id);
        state.sessions.remove(driver_id);
        state.pages.remove(driver_id);
        Ok(())
    }

    async fn install_driver(&self, package: Vec<u8>, filename: &str) -> Result<Value, RemoteError> {
        let mut state = self.enter(
            SimOp::InstallDriver,
            SimCall::InstallDriver {
                filename: filename.to_string(),
                bytes: package.len(),
            },
        )?;
        let Some(driver) = state.staged_install.take() else {
            return Err(RemoteError::Api {
                status: 400,
                body: "invalid driver package".to_string(),
            });
        };
        let driver_id = driver.driver_id.clone();
        state.drivers.insert(driver_id.clone(), driver);
        Ok(json!({"driver_id": driver_id}))
    }
}

// =============================================================================
// SimReleases
// =============================================================================

/// In-memory release source returning a fixed artifact.
pub struct SimReleases {
    artifact: Mutex<Result<ReleaseArtifact, ReleaseError>>,
    requests: Mutex<Vec<(String, Option<String>)>>,
}

impl SimReleases {
    /// Serve a package for release `tag_name`.
    pub fn new(tag_name: &str) -> Self {
        Self::with_result(Ok(ReleaseArtifact {
            filename: format!("driver-{}.tar.gz", tag_name.trim_start_matches('v')),
            bytes: vec![0x1f, 0x8b, 0x08, 0x00],
            tag_name: tag_name.to_string(),
        }))
    }

    /// Fail every fetch with `error`.
    pub fn failing(error: ReleaseError) -> Self {
        Self::with_result(Err(error))
    }

    fn with_result(result: Result<ReleaseArtifact, ReleaseError>) -> Self {
        Self {
            artifact: Mutex::new(result),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// `(repository_url, tag)` of every fetch so far.
    pub fn requests(&self) -> Vec<(String, Option<String>)> {
        self.requests
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[async_trait]
impl ReleaseSource for SimReleases {
    async fn fetch_asset(
        &self,
        repository_url: &str,
        _pattern: &str,
        tag: Option<&str>,
    ) -> Result<ReleaseArtifact, ReleaseError> {
        self.requests
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((repository_url.to_string(), tag.map(str::to_string)));
        self.artifact
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    async fn latest_tag(&self, _repository_url: &str) -> Result<String, ReleaseError> {
        self.artifact
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
            .map(|artifact| artifact.tag_name.clone())
            .map_err(Clone::clone)
    }
}

// =============================================================================
// Tests
// =============================================================================
