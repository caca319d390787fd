use serde::{Deserialize, Serialize};

/// Sentinel for [`GpuRequirement::memory_available`]: any amount of free memory will do.
pub const NO_MEMORY_CONSTRAINT: i64 = -1;

/// One GPU as reported by an agent's telemetry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GpuInfo {
    pub name: String,
    pub temperature: i32,
    pub memory_total_mb: i64,
    pub memory_free_mb: i64,
    pub utilization: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpuRequirement {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub gpu_type: Option<String>,
    #[serde(default = "no_memory_constraint")]
    pub memory_available: i64,
}

fn no_memory_constraint() -> i64 {
    NO_MEMORY_CONSTRAINT
}

impl GpuRequirement {
    pub fn any() -> Self {
        Self {
            gpu_type: None,
            memory_available: NO_MEMORY_CONSTRAINT,
        }
    }

    pub fn with_memory(mut self, memory_mb: i64) -> Self {
        self.memory_available = memory_mb;
        self
    }

    pub fn with_type(mut self, gpu_type: impl Into<String>) -> Self {
        self.gpu_type = Some(gpu_type.into());
        self
    }

    pub fn min_free_mb(&self) -> Option<i64> {
        (self.memory_available != NO_MEMORY_CONSTRAINT).then_some(self.memory_available)
    }

    /// Type matching ignores case and whitespace since nvidia-smi names come
    /// back with spaces stripped.
    fn matches_type(&self, gpu: &GpuInfo) -> bool {
        match self.gpu_type.as_deref() {
            None | Some("") => true,
            Some(wanted) => normalize(&gpu.name).contains(&normalize(wanted)),
        }
    }

    fn accepts(&self, gpu: &GpuInfo) -> bool {
        self.matches_type(gpu) && self.min_free_mb().map_or(true, |mb| gpu.memory_free_mb >= mb)
    }
}

fn normalize(s: &str) -> String {
    s.chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(char::to_lowercase)
        .collect()
}

/// Match every requirement to a distinct GPU, first fit in requirement order.
///
/// All or nothing: on success the matched GPUs have the requested memory
/// debited and their indices are returned; on failure `gpus` is untouched.
pub fn reserve_gpus(requirements: &[GpuRequirement], gpus: &mut [GpuInfo]) -> Option<Vec<usize>> {
    let mut used = vec![false; gpus.len()];
    let mut picked = Vec::with_capacity(requirements.len());

    for requirement in requirements {
        let slot = gpus
            .iter()
            .enumerate()
            .find(|(i, gpu)| !used[*i] && requirement.accepts(gpu))
            .map(|(i, _)| i)?;
        used[slot] = true;
        picked.push(slot);
    }

    for (requirement, &slot) in requirements.iter().zip(&picked) {
        if let Some(mb) = requirement.min_free_mb() {
            gpus[slot].memory_free_mb -= mb;
        }
    }
    Some(picked)
}
