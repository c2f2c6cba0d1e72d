use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::blueprint::Blueprint;
use crate::building::Building;
use crate::catalog::MaterialCatalog;
use crate::types::ResourceKind;

pub type MaterialCounts = BTreeMap<ResourceKind, u32>;

static STORE_LOCK_POISON_WARNED: AtomicBool = AtomicBool::new(false);

fn warn_store_lock_poison_once(operation: &'static str) {
    if STORE_LOCK_POISON_WARNED
        .compare_exchange(false, true, Ordering::Relaxed, Ordering::Relaxed)
        .is_ok()
    {
        warn!(operation, "material store lock poisoned; recovered inner value");
    }
}

/// A settlement's resource quantities.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MaterialStore {
    quantities: MaterialCounts,
}

impl MaterialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, resource: impl Into<String>, quantity: u32) -> Self {
        self.deposit(&ResourceKind::new(resource), quantity);
        self
    }

    pub fn quantity(&self, resource: &ResourceKind) -> u32 {
        self.quantities.get(resource).copied().unwrap_or(0)
    }

    pub fn quantities(&self) -> &MaterialCounts {
        &self.quantities
    }

    pub fn deposit(&mut self, resource: &ResourceKind, quantity: u32) {
        if quantity == 0 {
            return;
        }
        let entry = self.quantities.entry(resource.clone()).or_insert(0);
        *entry = entry.saturating_add(quantity);
    }

    /// Removes exactly `quantity` or nothing.
    pub fn withdraw(&mut self, resource: &ResourceKind, quantity: u32) -> bool {
        if quantity == 0 {
            return true;
        }
        match self.quantities.get_mut(resource) {
            Some(available) if *available >= quantity => {
                *available -= quantity;
                true
            }
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Shortfall {
    pub resource: ResourceKind,
    pub required: u32,
    pub available: u32,
}

impl fmt::Display for Shortfall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (need {}, have {})",
            self.resource, self.required, self.available
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("insufficient materials: {}", describe_shortfalls(.shortfalls))]
pub struct InsufficientMaterials {
    pub shortfalls: Vec<Shortfall>,
}

fn describe_shortfalls(shortfalls: &[Shortfall]) -> String {
    shortfalls
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Converts blueprint content into resource quantities and moves them
/// between settlement stores and buildings.
#[derive(Debug, Clone, Default)]
pub struct MaterialLedger {
    catalog: MaterialCatalog,
}

impl MaterialLedger {
    pub fn new(catalog: MaterialCatalog) -> Self {
        Self { catalog }
    }

    pub fn catalog(&self) -> &MaterialCatalog {
        &self.catalog
    }

    pub fn compute_requirements(&self, blueprint: &Blueprint) -> MaterialCounts {
        let mut requirements = MaterialCounts::new();
        for (kind, count) in blueprint.materials() {
            let Some(mapping) = self.catalog.resolve(kind) else {
                continue;
            };
            let quantity = count.saturating_mul(mapping.units);
            if quantity == 0 {
                continue;
            }
            let entry = requirements.entry(mapping.resource).or_insert(0);
            *entry = entry.saturating_add(quantity);
        }
        requirements
    }

    pub fn can_afford(&self, store: &MaterialStore, requirements: &MaterialCounts) -> bool {
        self.shortfalls(store, requirements).is_empty()
    }

    pub fn shortfalls(&self, store: &MaterialStore, requirements: &MaterialCounts) -> Vec<Shortfall> {
        shortfalls_with_credit(store, requirements, &MaterialCounts::new())
    }

    /// Charges `building.required_materials` to `store` and records them as
    /// provided. Anything the building already holds is credited back first,
    /// so repeating the call debits the store once in total. On error
    /// neither side changes.
    pub fn consume(
        &self,
        building: &mut Building,
        store: &mut MaterialStore,
    ) -> Result<(), InsufficientMaterials> {
        let shortfalls =
            shortfalls_with_credit(store, &building.required_materials, &building.provided_materials);
        if !shortfalls.is_empty() {
            return Err(InsufficientMaterials { shortfalls });
        }

        let mut staged = store.clone();
        for (resource, quantity) in &building.provided_materials {
            staged.deposit(resource, *quantity);
        }
        for (resource, quantity) in &building.required_materials {
            if !staged.withdraw(resource, *quantity) {
                return Err(InsufficientMaterials {
                    shortfalls: vec![Shortfall {
                        resource: resource.clone(),
                        required: *quantity,
                        available: staged.quantity(resource),
                    }],
                });
            }
        }
        if !building.provided_materials.is_empty() {
            warn!(building_id = %building.id, "materials_already_provided_recharging");
        }
        *store = staged;
        building.provided_materials = building.required_materials.clone();
        debug!(
            building_id = %building.id,
            kinds = building.provided_materials.len(),
            "materials_consumed"
        );
        Ok(())
    }

    /// Gives back exactly what the building holds and clears it. A second
    /// call finds nothing to return.
    pub fn return_to_store(&self, building: &mut Building, store: &mut MaterialStore) -> MaterialCounts {
        let returned = std::mem::take(&mut building.provided_materials);
        for (resource, quantity) in &returned {
            store.deposit(resource, *quantity);
        }
        if !returned.is_empty() {
            debug!(building_id = %building.id, kinds = returned.len(), "materials_returned");
        }
        returned
    }
}

fn shortfalls_with_credit(
    store: &MaterialStore,
    requirements: &MaterialCounts,
    credit: &MaterialCounts,
) -> Vec<Shortfall> {
    requirements
        .iter()
        .filter_map(|(resource, required)| {
            let available = store
                .quantity(resource)
                .saturating_add(credit.get(resource).copied().unwrap_or(0));
            (available < *required).then(|| Shortfall {
                resource: resource.clone(),
                required: *required,
                available,
            })
        })
        .collect()
}

/// A store shared by every subsystem of one settlement. All check-then-act
/// sequences run under the one lock.
#[derive(Debug, Clone, Default)]
pub struct SharedMaterialStore {
    inner: Arc<Mutex<MaterialStore>>,
}

impl SharedMaterialStore {
    pub fn new(store: MaterialStore) -> Self {
        Self {
            inner: Arc::new(Mutex::new(store)),
        }
    }

    pub fn with_store<R>(&self, operation: impl FnOnce(&mut MaterialStore) -> R) -> R {
        let mut guard = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn_store_lock_poison_once("with_store");
                poisoned.into_inner()
            }
        };
        operation(&mut guard)
    }

    pub fn snapshot(&self) -> MaterialStore {
        self.with_store(|store| store.clone())
    }
}
