//! Service Registry (C3).
//!
//! Process-wide `name -> Service` map owned exclusively by the supervisor
//! thread (see [`crate::constants::Lock::Registry`] for where this sits in
//! the cross-thread lock order).
use crate::config::Config;
use crate::error::SupervisorError;
use crate::service::Service;
use std::collections::HashMap;
use tracing::warn;

/// Name -> Service map plus the registry-wide state bits described in.
#[derive(Debug, Default)]
pub struct Registry {
    services: HashMap<String, Service>,
    services_updated: bool,
    post_data: bool,
    delayed_services: Vec<String>,
}

impl Registry {
    /// Builds an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a registry from a loaded configuration document, in `depends_on`
    /// order, without starting any service.
    pub fn from_config(config: &Config) -> Result<Self, SupervisorError> {
        let mut registry = Registry::new();
        let order = config
            .service_start_order()
            .map_err(SupervisorError::Config)?;
        for name in order {
            let service_config = config.services[&name].clone();
            registry.insert(Service::new(name, service_config));
        }
        Ok(registry)
    }

    /// Registers a new service. Overwrites silently are not expected outside
    /// of tests; config loading already rejects duplicate names.
    pub fn insert(&mut self, mut service: Service) {
        service.set_post_data(self.post_data);
        self.services.insert(service.name.clone(), service);
    }

    /// Looks up a service by name.
    pub fn get(&self, name: &str) -> Option<&Service> {
        self.services.get(name)
    }

    /// Looks up a service by name, mutably.
    pub fn get_mut(&mut self, name: &str) -> Option<&mut Service> {
        self.services.get_mut(name)
    }

    /// Iterates all services in insertion (boot) order is not guaranteed;
    /// callers that need start order should sort on `start_order()`.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Service)> {
        self.services.iter()
    }

    /// Iterates all services, mutably.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&String, &mut Service)> {
        self.services.iter_mut()
    }

    /// Whether `MarkServicesUpdated` has run.
    pub fn services_updated(&self) -> bool {
        self.services_updated
    }

    /// Drains the delayed-services list, calling Start on each; before this
    /// runs, updatable Starts enqueue rather than launch.
    pub fn mark_services_updated(
        &mut self,
        property_snapshot: &HashMap<String, String>,
    ) -> Result<(), SupervisorError> {
        self.services_updated = true;
        let pending: Vec<String> = self.delayed_services.drain(..).collect();
        for name in pending {
            if let Some(service) = self.services.get_mut(&name)
                && let Err(err) = service.start(true, property_snapshot)
            {
                warn!("delayed start of '{}' failed: {}", name, err);
            }
        }
        Ok(())
    }

    /// Enqueues a service name onto the delayed-services list (used by
    /// `Service::start` callers that observe an enqueue-rather-than-launch
    /// result).
    pub fn delay(&mut self, name: impl Into<String>) {
        self.delayed_services.push(name.into());
    }

    /// `IsPostData()`: monotonic true once userdata is mounted. Starting a
    /// new Service copies this bit in as its own `post_data` field.
    pub fn is_post_data(&self) -> bool {
        self.post_data
    }

    /// Latches `post_data` true; irreversible for the life of the registry.
    pub fn mark_post_data(&mut self) {
        self.post_data = true;
    }

    /// For each service whose `post_data` is true, records
    /// `running_at_post_data_reset := RUNNING` then calls
    /// `StopOrReset(RESET)`.
    pub fn reset_if_post_data(&mut self) {
        for service in self.services.values_mut() {
            if service.post_data() {
                service.mark_running_at_post_data_reset();
                service.reset();
            }
        }
    }

    /// Starts only the services that were running at the moment of a prior
    /// `ResetIfPostData` (i.e. `running_at_post_data_reset` is set) — not
    /// every `RESET`-flagged service, since a service already `RC_DISABLED`
    /// at reset time never latches `RESET` at all and must stay down.
    pub fn start_if_post_data(
        &mut self,
        property_snapshot: &HashMap<String, String>,
    ) -> Result<(), SupervisorError> {
        let services_updated = self.services_updated;
        for service in self.services.values_mut() {
            if service.post_data() && service.running_at_post_data_reset() {
                service.start(services_updated, property_snapshot)?;
            }
        }
        Ok(())
    }

    /// Implements `MakeTemporaryOneshotService`: parses the `ctl.exec` argv,
    /// builds the anonymous `ONESHOT|TEMPORARY` service, registers it under
    /// its generated `"exec <N> (...)"` name, and starts it immediately.
    /// Returns whether the service actually launched (`false` means it was
    /// enqueued pending `services_updated`, matching `start()`'s contract).
    pub fn make_temporary_oneshot_service(
        &mut self,
        argv: &[String],
    ) -> Result<bool, SupervisorError> {
        let mut service = Service::make_temporary_oneshot(argv)?;
        let name = service.name.clone();
        let services_updated = self.services_updated;
        let snapshot = crate::property::store::global().snapshot();
        let started = service.exec_start(services_updated, &snapshot)?;
        self.insert(service);
        if !started {
            self.delay(name);
        }
        Ok(started)
    }

    /// Number of registered services.
    pub fn len(&self) -> usize {
        self.services.len()
    }

    /// Whether the registry holds no services.
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}
