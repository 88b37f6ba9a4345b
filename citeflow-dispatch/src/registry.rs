//! Service registry and per-request collections
//!
//! A [`Collection`] is the set of services eligible for one request,
//! bucketed by tier. The shipped [`InstitutionRegistry`] builds it from a
//! list of default services plus the services of every institution the
//! request belongs to, by name or by client network.

use crate::error::{DispatchError, Result};
use crate::model::{Request, Tier};
use crate::service::Service;
use citeflow_common::config::RegistrySection;
use ipnetwork::IpNetwork;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

/// Services eligible for one request, per tier
#[derive(Clone, Default)]
pub struct Collection {
    levels: BTreeMap<Tier, Vec<Arc<dyn Service>>>,
}

impl Collection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a service to its tier; a service id already present is ignored
    pub fn add(&mut self, service: Arc<dyn Service>) {
        if self.contains(service.id()) {
            return;
        }
        self.levels.entry(service.tier()).or_default().push(service);
    }

    pub fn contains(&self, service_id: &str) -> bool {
        self.services().any(|s| s.id() == service_id)
    }

    /// Services of one tier, in registration order
    pub fn service_level(&self, tier: Tier) -> &[Arc<dyn Service>] {
        self.levels.get(&tier).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Non-empty tiers in ascending order
    pub fn tiers(&self) -> impl Iterator<Item = Tier> + '_ {
        self.levels
            .iter()
            .filter(|(_, services)| !services.is_empty())
            .map(|(tier, _)| *tier)
    }

    pub fn foreground_tiers(&self) -> Vec<Tier> {
        self.tiers().filter(Tier::is_foreground).collect()
    }

    pub fn background_tiers(&self) -> Vec<Tier> {
        self.tiers().filter(Tier::is_background).collect()
    }

    /// All services, tier by tier
    pub fn services(&self) -> impl Iterator<Item = &Arc<dyn Service>> + '_ {
        self.levels.values().flatten()
    }

    pub fn service_ids(&self) -> Vec<String> {
        self.services().map(|s| s.id().to_string()).collect()
    }

    pub fn get(&self, service_id: &str) -> Option<&Arc<dyn Service>> {
        self.services().find(|s| s.id() == service_id)
    }

    /// Restrict to the given ids, keeping tier placement and order
    pub fn subset(&self, service_ids: &[String]) -> Collection {
        let wanted: HashSet<&str> = service_ids.iter().map(String::as_str).collect();
        let mut subset = Collection::new();
        for service in self.services() {
            if wanted.contains(service.id()) {
                subset.add(Arc::clone(service));
            }
        }
        subset
    }

    pub fn is_empty(&self) -> bool {
        self.levels.values().all(Vec::is_empty)
    }

    pub fn len(&self) -> usize {
        self.services().count()
    }
}

/// Source of eligible services for a request
pub trait ServiceRegistry: Send + Sync {
    fn collection_for(&self, request: &Request) -> Collection;

    /// Eligible services of one tier
    fn eligible_services(&self, request: &Request, tier: Tier) -> Vec<Arc<dyn Service>> {
        self.collection_for(request).service_level(tier).to_vec()
    }
}

/// An institution and the extra services its patrons get
#[derive(Clone, Debug)]
pub struct Institution {
    pub name: String,
    pub networks: Vec<IpNetwork>,
    pub service_ids: Vec<String>,
}

impl Institution {
    fn applies_to(&self, request: &Request) -> bool {
        if request.institution.as_deref() == Some(self.name.as_str()) {
            return true;
        }
        match request.client_ip {
            Some(ip) => self.networks.iter().any(|net| net.contains(ip)),
            None => false,
        }
    }
}

/// Registry keyed by service id, with institution-specific additions
#[derive(Default)]
pub struct InstitutionRegistry {
    services: HashMap<String, Arc<dyn Service>>,
    default_services: Vec<String>,
    institutions: Vec<Institution>,
}

impl InstitutionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make a service known to the registry without enabling it
    pub fn register(&mut self, service: Arc<dyn Service>) -> Result<()> {
        let id = service.id().to_string();
        if self.services.contains_key(&id) {
            return Err(DispatchError::Config(format!(
                "service '{}' registered twice",
                id
            )));
        }
        self.services.insert(id, service);
        Ok(())
    }

    /// Register a service and apply it to every request
    pub fn register_default(&mut self, service: Arc<dyn Service>) -> Result<()> {
        let id = service.id().to_string();
        self.register(service)?;
        self.default_services.push(id);
        Ok(())
    }

    pub fn add_institution(&mut self, institution: Institution) -> Result<()> {
        for id in &institution.service_ids {
            self.ensure_known(id)?;
        }
        self.institutions.push(institution);
        Ok(())
    }

    /// Apply the `[registry]` config section to already-registered services
    pub fn apply_config(&mut self, section: &RegistrySection) -> Result<()> {
        for id in &section.default_services {
            self.ensure_known(id)?;
            if !self.default_services.contains(id) {
                self.default_services.push(id.clone());
            }
        }

        for entry in &section.institutions {
            let networks = entry
                .ip_networks
                .iter()
                .map(|cidr| {
                    cidr.parse::<IpNetwork>().map_err(|e| {
                        DispatchError::Config(format!(
                            "institution '{}': invalid network '{}': {}",
                            entry.name, cidr, e
                        ))
                    })
                })
                .collect::<Result<Vec<_>>>()?;

            self.add_institution(Institution {
                name: entry.name.clone(),
                networks,
                service_ids: entry.services.clone(),
            })?;
        }

        Ok(())
    }

    fn ensure_known(&self, id: &str) -> Result<()> {
        if self.services.contains_key(id) {
            Ok(())
        } else {
            Err(DispatchError::Config(format!("unknown service '{}'", id)))
        }
    }
}

impl ServiceRegistry for InstitutionRegistry {
    fn collection_for(&self, request: &Request) -> Collection {
        let mut collection = Collection::new();

        let institution_services = self
            .institutions
            .iter()
            .filter(|inst| inst.applies_to(request))
            .flat_map(|inst| inst.service_ids.iter());

        for id in self.default_services.iter().chain(institution_services) {
            if let Some(service) = self.services.get(id) {
                collection.add(Arc::clone(service));
            }
        }

        debug!(
            request_id = %request.id,
            services = collection.len(),
            "Built service collection"
        );

        collection
    }
}
