//! Allocation entry points invoked from the container-runtime side.
//!
//! `preferred` answers the runtime's placement query with the configured
//! policy; `allocate` finalizes the pending reservation for the chosen
//! cards (the ledger debit taken at reserve time becomes committed) and
//! assembles the container response.

use std::sync::Arc;

use api_types::ContainerAllocation;
use error_stack::Report;

use crate::alloc::distributed_alloc;
use crate::alloc::packed_alloc;
use crate::alloc::TopologyPolicy;
use crate::config::AllocationPolicy;
use crate::config::DeviceIdStrategy;
use crate::errors::AccountantError;
use crate::errors::AllocError;
use crate::registry::unique_device_ids;
use crate::registry::DeviceRegistry;
use crate::response::ResponseAssembler;
use crate::store::CardStore;

pub struct AllocationEngine {
    registry: DeviceRegistry,
    store: Arc<CardStore>,
    policy: AllocationPolicy,
    topology: Box<dyn TopologyPolicy>,
    id_strategy: DeviceIdStrategy,
    assembler: ResponseAssembler,
}

impl AllocationEngine {
    pub fn new(
        registry: DeviceRegistry,
        store: Arc<CardStore>,
        policy: AllocationPolicy,
        topology: Box<dyn TopologyPolicy>,
        id_strategy: DeviceIdStrategy,
        assembler: ResponseAssembler,
    ) -> Self {
        Self {
            registry,
            store,
            policy,
            topology,
            id_strategy,
            assembler,
        }
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    /// Placement query: pick `size` replica IDs (including `required`)
    /// using the configured policy.
    pub fn preferred(
        &self,
        available: &[String],
        required: &[String],
        size: usize,
    ) -> Result<Vec<String>, Report<AllocError>> {
        match self.policy {
            AllocationPolicy::Packed => packed_alloc(&self.registry, available, required, size),
            AllocationPolicy::Distributed => {
                distributed_alloc(&self.registry, available, required, size)
            }
            AllocationPolicy::Aligned => {
                self.topology
                    .allocate(&self.registry, available, required, size)
            }
        }
    }

    /// Concrete allocation: consume the pending ledger entries for the
    /// cards backing `ids` and build the container response.
    pub fn allocate(&self, ids: &[String]) -> Result<ContainerAllocation, Report<AccountantError>> {
        // Finalization is keyed by base card ID, whatever form the runtime
        // asked for.
        let bases = unique_device_ids(&self.registry, ids, DeviceIdStrategy::Uuid);
        self.store.finalize(&bases)?;

        let mut allocation = self.assembler.assemble(&self.registry, ids);
        if !allocation.devices.is_empty() {
            let runtime_ids = unique_device_ids(&self.registry, ids, self.id_strategy);
            allocation
                .envs
                .insert("CARDSHARE_ALLOCATED_CARDS".to_string(), runtime_ids.join(","));
        }
        Ok(allocation)
    }
}
