//! Dependency-aware ordering of the active queue.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

use chrono::{DateTime, Utc};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use uuid::Uuid;

use super::model::JobStatus;

/// Scheduling view of a pending or running job.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedJob {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub priority: i64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub dependencies: Vec<Uuid>,
}

impl QueuedJob {
    fn sort_key(&self, seq: usize) -> (i64, DateTime<Utc>, usize) {
        (self.priority, self.created_at, seq)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    /// At least one dependency is still pending or running.
    Waiting,
    /// A dependency failed, was cancelled, or no longer exists.
    Blocked {
        dependency: Uuid,
        status: Option<JobStatus>,
    },
}

impl Readiness {
    pub fn block_reason(&self) -> Option<String> {
        match self {
            Readiness::Blocked {
                dependency,
                status: Some(status),
            } => Some(format!("dependency {dependency} ended as {status}")),
            Readiness::Blocked {
                dependency,
                status: None,
            } => Some(format!("dependency {dependency} no longer exists")),
            _ => None,
        }
    }
}

/// `statuses` must hold the current status of every dependency of `job`.
pub fn readiness(job: &QueuedJob, statuses: &HashMap<Uuid, JobStatus>) -> Readiness {
    let mut waiting = false;
    for dependency in &job.dependencies {
        match statuses.get(dependency).copied() {
            None => {
                return Readiness::Blocked {
                    dependency: *dependency,
                    status: None,
                }
            }
            Some(status) if status.blocks_dependents() => {
                return Readiness::Blocked {
                    dependency: *dependency,
                    status: Some(status),
                }
            }
            Some(status) if !status.satisfies_dependents() => waiting = true,
            Some(_) => {}
        }
    }

    if waiting {
        Readiness::Waiting
    } else {
        Readiness::Ready
    }
}

/// Order in which the active jobs are expected to run: running jobs first
/// (by start time), then a topological walk over dependency edges that always
/// takes the lowest `(priority, created_at)` among the unblocked jobs.
/// Jobs stuck in a cycle are appended last in priority order.
pub fn execution_order(jobs: &[QueuedJob]) -> Vec<Uuid> {
    let mut graph: DiGraph<usize, ()> = DiGraph::new();
    let mut nodes: HashMap<Uuid, NodeIndex> = HashMap::with_capacity(jobs.len());
    for (seq, job) in jobs.iter().enumerate() {
        nodes.insert(job.job_id, graph.add_node(seq));
    }
    for job in jobs {
        let target = nodes[&job.job_id];
        for dependency in &job.dependencies {
            if let Some(source) = nodes.get(dependency) {
                graph.update_edge(*source, target, ());
            }
        }
    }

    let mut order = Vec::with_capacity(jobs.len());
    let mut emitted = vec![false; jobs.len()];
    let mut in_degree: Vec<usize> = graph
        .node_indices()
        .map(|node| graph.neighbors_directed(node, Direction::Incoming).count())
        .collect();

    let mut running: Vec<usize> = (0..jobs.len())
        .filter(|seq| jobs[*seq].status == JobStatus::Running)
        .collect();
    running.sort_by_key(|seq| (jobs[*seq].started_at, *seq));

    let mut frontier = BinaryHeap::new();
    let release = |seq: usize,
                       order: &mut Vec<Uuid>,
                       emitted: &mut Vec<bool>,
                       in_degree: &mut Vec<usize>,
                       frontier: &mut BinaryHeap<Reverse<(i64, DateTime<Utc>, usize)>>| {
        emitted[seq] = true;
        order.push(jobs[seq].job_id);
        for next in graph.neighbors_directed(NodeIndex::new(seq), Direction::Outgoing) {
            let next_seq = graph[next];
            in_degree[next_seq] = in_degree[next_seq].saturating_sub(1);
            if in_degree[next_seq] == 0 && !emitted[next_seq] {
                frontier.push(Reverse(jobs[next_seq].sort_key(next_seq)));
            }
        }
    };

    for seq in running {
        release(seq, &mut order, &mut emitted, &mut in_degree, &mut frontier);
    }
    for seq in 0..jobs.len() {
        if !emitted[seq] && in_degree[seq] == 0 {
            frontier.push(Reverse(jobs[seq].sort_key(seq)));
        }
    }

    while let Some(Reverse((_, _, seq))) = frontier.pop() {
        if emitted[seq] {
            continue;
        }
        release(seq, &mut order, &mut emitted, &mut in_degree, &mut frontier);
    }

    let mut leftovers: Vec<usize> = (0..jobs.len()).filter(|seq| !emitted[*seq]).collect();
    leftovers.sort_by_key(|seq| jobs[*seq].sort_key(*seq));
    order.extend(leftovers.into_iter().map(|seq| jobs[seq].job_id));
    order
}

pub fn position_of(jobs: &[QueuedJob], job_id: Uuid) -> Option<usize> {
    execution_order(jobs).iter().position(|id| *id == job_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(priority: i64, minutes: i64, deps: &[Uuid]) -> QueuedJob {
        QueuedJob {
            job_id: Uuid::new_v4(),
            status: JobStatus::Pending,
            priority,
            created_at: DateTime::<Utc>::from_timestamp(minutes * 60, 0).expect("valid timestamp"),
            started_at: None,
            dependencies: deps.to_vec(),
        }
    }

    #[test]
    fn orders_by_priority_then_age() {
        let a = job(100, 0, &[]);
        let b = job(10, 5, &[]);
        let c = job(100, 1, &[]);

        let order = execution_order(&[a.clone(), b.clone(), c.clone()]);
        assert_eq!(order, vec![b.job_id, a.job_id, c.job_id]);
    }

    #[test]
    fn dependents_wait_for_their_dependencies() {
        let base = job(100, 0, &[]);
        let urgent_child = job(0, 1, &[base.job_id]);
        let other = job(50, 2, &[]);

        let order = execution_order(&[base.clone(), urgent_child.clone(), other.clone()]);
        assert_eq!(order, vec![other.job_id, base.job_id, urgent_child.job_id]);
        assert_eq!(
            position_of(&[base, urgent_child.clone(), other], urgent_child.job_id),
            Some(2)
        );
    }

    #[test]
    fn running_jobs_come_first() {
        let mut running = job(500, 9, &[]);
        running.status = JobStatus::Running;
        running.started_at = DateTime::<Utc>::from_timestamp(0, 0);
        let pending = job(0, 0, &[]);

        let order = execution_order(&[pending.clone(), running.clone()]);
        assert_eq!(order, vec![running.job_id, pending.job_id]);
    }

    #[test]
    fn cycles_are_appended_instead_of_dropped() {
        let mut a = job(1, 0, &[]);
        let mut b = job(2, 0, &[]);
        a.dependencies.push(b.job_id);
        b.dependencies.push(a.job_id);
        let free = job(100, 0, &[]);

        let order = execution_order(&[a.clone(), b.clone(), free.clone()]);
        assert_eq!(order, vec![free.job_id, a.job_id, b.job_id]);
    }

    #[test]
    fn readiness_follows_dependency_status() {
        let dep = Uuid::new_v4();
        let child = job(100, 0, &[dep]);
        let mut statuses = HashMap::new();

        assert_eq!(
            readiness(&child, &statuses),
            Readiness::Blocked {
                dependency: dep,
                status: None
            }
        );

        statuses.insert(dep, JobStatus::Running);
        assert_eq!(readiness(&child, &statuses), Readiness::Waiting);

        statuses.insert(dep, JobStatus::Partial);
        assert_eq!(readiness(&child, &statuses), Readiness::Ready);

        statuses.insert(dep, JobStatus::Cancelled);
        let blocked = readiness(&child, &statuses);
        assert_eq!(
            blocked.block_reason().as_deref(),
            Some(format!("dependency {dep} ended as cancelled").as_str())
        );
    }
}
