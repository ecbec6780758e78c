//! Container allocation assembly.
//!
//! Turns the replica IDs selected for a container into the environment
//! variables, annotations, device nodes and directory mounts the container
//! runtime injects. The container always sees a contiguous device index
//! space (0, 1, ...) even when the host indices are sparse.

use std::collections::BTreeMap;
use std::path::Path;
use std::path::PathBuf;

use api_types::AnnotatedId;
use api_types::ContainerAllocation;
use api_types::DeviceNodeSpec;
use api_types::MountSpec;
use api_types::ASSIGNED_CARDS_ANNOTATION;
use api_types::CARD_DEVICE_MAP_ANNOTATION;
use tracing::debug;
use tracing::warn;

use crate::config::SharingStrategy;
use crate::registry::DeviceRegistry;

/// Control device nodes every allocation receives alongside its cards.
const CONTROL_DEVICES: [&str; 4] = [
    "/dev/nvidiactl",
    "/dev/nvidia-uvm",
    "/dev/nvidia-uvm-tools",
    "/dev/nvidia-modeset",
];

/// Pipe directory as seen from inside the container.
const CONTAINER_PIPE_DIR: &str = "/tmp/cardshare/pipe";

/// Shared-memory directory as seen from inside the container.
const CONTAINER_SHM_DIR: &str = "/dev/shm";

/// Builds container allocation responses for this node's cards.
pub struct ResponseAssembler {
    sharing: SharingStrategy,
    pipe_dir: PathBuf,
    shm_dir: PathBuf,
}

impl ResponseAssembler {
    pub fn new(sharing: SharingStrategy, pipe_dir: &Path, shm_dir: &Path) -> Self {
        Self {
            sharing,
            pipe_dir: pipe_dir.to_path_buf(),
            shm_dir: shm_dir.to_path_buf(),
        }
    }

    /// Assemble the runtime response for the given replica IDs.
    ///
    /// IDs that resolve to no known card are skipped; if none resolve the
    /// result is empty rather than a fabricated binding.
    pub fn assemble(&self, registry: &DeviceRegistry, ids: &[String]) -> ContainerAllocation {
        let mut per_base_count: BTreeMap<String, usize> = BTreeMap::new();
        for id in ids {
            *per_base_count
                .entry(AnnotatedId::from(id.as_str()).base().to_string())
                .or_default() += 1;
        }

        let mut index_quota: BTreeMap<String, usize> = BTreeMap::new();
        let mut index_to_base: BTreeMap<String, String> = BTreeMap::new();
        for id in ids {
            let base = AnnotatedId::from(id.as_str()).base().to_string();
            let Some(device) = registry.resolve(id) else {
                warn!(id = %id, base = %base, "Skipping unknown requested card");
                continue;
            };
            *index_quota.entry(device.index.clone()).or_default() += 1;
            index_to_base.entry(device.index.clone()).or_insert(base);
        }

        if index_to_base.is_empty() {
            warn!(?ids, "No card indices resolved for allocation request");
            return ContainerAllocation::default();
        }

        let indices: Vec<String> = index_to_base.keys().cloned().collect();

        let mut allocation = ContainerAllocation::default();

        let relative: Vec<String> = (0..indices.len()).map(|i| i.to_string()).collect();
        let visible = relative.join(",");
        allocation
            .envs
            .insert("NVIDIA_VISIBLE_DEVICES".to_string(), visible.clone());
        allocation
            .envs
            .insert("CUDA_VISIBLE_DEVICES".to_string(), visible);

        if self.sharing == SharingStrategy::CoScheduled {
            let per_card = (100 / indices.len()).clamp(1, 100);
            allocation.envs.insert(
                "CUDA_MPS_ACTIVE_THREAD_PERCENTAGE".to_string(),
                per_card.to_string(),
            );
        }

        let device_map: Vec<String> = indices
            .iter()
            .enumerate()
            .map(|(rel, idx)| {
                let base = &index_to_base[idx];
                format!("{rel}:{base}:{}", per_base_count[base])
            })
            .collect();
        let device_map = device_map.join(";");
        allocation
            .envs
            .insert("GPU_DEVICE_MAP".to_string(), device_map.clone());

        let quota_map: Vec<String> = indices
            .iter()
            .map(|idx| format!("{idx}:{}", index_quota[idx]))
            .collect();
        allocation
            .envs
            .insert("MPS_GPU_QUOTA".to_string(), quota_map.join(";"));

        allocation.annotations.insert(
            ASSIGNED_CARDS_ANNOTATION.to_string(),
            indices.join(","),
        );
        allocation
            .annotations
            .insert(CARD_DEVICE_MAP_ANNOTATION.to_string(), device_map);

        for idx in &indices {
            let path = format!("/dev/nvidia{idx}");
            allocation.devices.push(DeviceNodeSpec {
                container_path: path.clone(),
                host_path: path,
                permissions: "rw".to_string(),
            });
        }
        for dev in CONTROL_DEVICES {
            allocation.devices.push(DeviceNodeSpec {
                container_path: dev.to_string(),
                host_path: dev.to_string(),
                permissions: "rw".to_string(),
            });
        }

        allocation.mounts.push(MountSpec {
            container_path: CONTAINER_PIPE_DIR.to_string(),
            host_path: self.pipe_dir.display().to_string(),
            read_only: false,
        });
        allocation.mounts.push(MountSpec {
            container_path: CONTAINER_SHM_DIR.to_string(),
            host_path: self.shm_dir.display().to_string(),
            read_only: false,
        });

        debug!(
            cards = indices.len(),
            devices = allocation.devices.len(),
            "Container allocation assembled"
        );
        allocation
    }
}
