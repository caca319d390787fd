//! Matching of WAITING jobs to nodes.
//!
//! [`distribute`] is a pure function over value snapshots: it never touches
//! live node state. Capacity it hands out is only accounted for in its own
//! copies, so several jobs can be placed in one pass without racing the real
//! counters, which are refreshed later from the agents' own reports.

use serde::Serialize;

use crate::scheduler::gpu::{reserve_gpus, GpuInfo};
use crate::scheduler::Job;

/// Placement-relevant copy of a registered node.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct NodeSnapshot {
    pub name: String,
    pub address: String,
    pub capacity: u32,
    pub jobs_running: u32,
    pub capabilities: Vec<String>,
    pub gpus: Vec<GpuInfo>,
}

impl NodeSnapshot {
    pub fn new(name: impl Into<String>, capacity: u32, jobs_running: u32) -> Self {
        Self {
            name: name.into(),
            capacity,
            jobs_running,
            ..Default::default()
        }
    }

    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_gpus(mut self, gpus: Vec<GpuInfo>) -> Self {
        self.gpus = gpus;
        self
    }

    pub fn free_slots(&self) -> u32 {
        self.capacity.saturating_sub(self.jobs_running)
    }

    /// Whether the node advertises every tag in `restrict`.
    pub fn satisfies(&self, restrict: &[String]) -> bool {
        is_subset(restrict, &self.capabilities)
    }
}

/// Order-insensitive set inclusion of `required` in `available`.
pub fn is_subset(required: &[String], available: &[String]) -> bool {
    required.iter().all(|tag| available.contains(tag))
}

#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    pub node: String,
    pub job: Job,
}

/// Stable sort by priority, highest first. Jobs of equal priority keep the
/// order they were given in.
pub fn sort_by_priority(jobs: &mut [Job]) {
    jobs.sort_by(|a, b| b.priority.cmp(&a.priority));
}

/// Compute one placement pass.
///
/// For each job in priority order: keep nodes with free capacity whose
/// capabilities cover the job's restrictions, prefer nodes with fewer
/// capabilities, and require that every GPU requirement maps to a distinct
/// GPU. Jobs without a candidate are left out of the result.
pub fn distribute(jobs: &[Job], nodes: &[NodeSnapshot]) -> Vec<Assignment> {
    let mut nodes: Vec<NodeSnapshot> = nodes.to_vec();
    let mut jobs: Vec<Job> = jobs.to_vec();
    sort_by_priority(&mut jobs);

    let mut assignments = Vec::new();
    for job in jobs {
        let mut candidates: Vec<usize> = nodes
            .iter()
            .enumerate()
            .filter(|(_, node)| node.free_slots() > 0 && node.satisfies(&job.restrict))
            .map(|(i, _)| i)
            .collect();
        candidates.sort_by_key(|&i| nodes[i].capabilities.len());

        let chosen = candidates.into_iter().find(|&i| {
            let mut gpus = nodes[i].gpus.clone();
            match reserve_gpus(&job.gpu_requirements, &mut gpus) {
                Some(_) => {
                    nodes[i].gpus = gpus;
                    true
                }
                None => false,
            }
        });

        let Some(i) = chosen else {
            tracing::debug!(job_id = %job.id, identifier = %job.identifier, "No eligible node for job");
            continue;
        };

        nodes[i].jobs_running += 1;
        assignments.push(Assignment {
            node: nodes[i].name.clone(),
            job,
        });
    }

    assignments
}
