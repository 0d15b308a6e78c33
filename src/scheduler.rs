//! Scheduler: layered `WorkUnit` selection, auto-spawn sizing, and the
//! verify-retry / reroute budgets the supervisor consults.
//!
//! Grounded on `features.rs`'s `next_claimable`/`next_n_claimable` (priority-sorted,
//! dependency-gated selection), re-targeted from a flat feature list onto the PRD's
//! story/subtask layering plus an external issue source.

use crate::task_source::{decompose_story, topo_layers, Prd, RawIssue, Story, TaskSourceError, WorkUnit};
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};

/// Verify retries per agent before a reroute is forced.
pub const MAX_VERIFY: u32 = 5;
/// Reroutes per task before it is permanently failed.
pub const MAX_REROUTES: u32 = 2;

/// The issue tracker is an external collaborator: this crate only defines
/// the seam it plugs into, never a concrete GitHub/Jira/etc. client.
pub trait IssueTracker: Send + Sync {
    /// Ready issues (dependencies met), already priority-ordered.
    fn ready_issues(&self) -> Vec<RawIssue>;
    /// Mark an issue claimed so it isn't handed out again.
    fn claim(&self, number: u64);
}

/// An `IssueTracker` with no issues, used when no tracker is configured.
#[derive(Debug, Default)]
pub struct NullIssueTracker;

impl IssueTracker for NullIssueTracker {
    fn ready_issues(&self) -> Vec<RawIssue> {
        Vec::new()
    }
    fn claim(&self, _number: u64) {}
}

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error(transparent)]
    TaskSource(#[from] TaskSourceError),
}

/// Per-story subtask ledger: remaining (unclaimed) subtasks and the set of ids
/// already marked complete, used to decide when a parent story is fully done.
#[derive(Debug, Default)]
struct SubtaskLedger {
    remaining: VecDeque<WorkUnit>,
    completed: HashSet<String>,
    total: usize,
}

pub struct Scheduler {
    project_dir: PathBuf,
    prd: Option<Prd>,
    ledgers: HashMap<String, SubtaskLedger>,
    issue_tracker: Box<dyn IssueTracker>,
    verify_attempts: HashMap<String, u32>,
    reroute_counts: HashMap<String, u32>,
    /// `(kind, key)` identities currently held by a non-terminal agent (per §3's
    /// claim invariant), cleared on `mark_passed`/`mark_failed`.
    claimed: HashSet<String>,
}

/// `(kind, key)` identity string used as the claim-set key, per §3.
fn identity_key(unit: &WorkUnit) -> String {
    let (kind, key) = unit.identity();
    format!("{kind}:{key}")
}

impl Scheduler {
    pub fn new(project_dir: &Path) -> Result<Self, SchedulerError> {
        Self::with_issue_tracker(project_dir, Box::new(NullIssueTracker))
    }

    pub fn with_issue_tracker(project_dir: &Path, issue_tracker: Box<dyn IssueTracker>) -> Result<Self, SchedulerError> {
        let prd = Prd::load(project_dir)?;
        Ok(Self {
            project_dir: project_dir.to_path_buf(),
            prd,
            ledgers: HashMap::new(),
            issue_tracker,
            verify_attempts: HashMap::new(),
            reroute_counts: HashMap::new(),
            claimed: HashSet::new(),
        })
    }

    /// Selection policy, in order: pending subtasks, then the next story
    /// (decomposing if needed), then the issue tracker. `None` means "stop".
    ///
    /// Every unit handed out here is recorded in `claimed` so a second call
    /// (e.g. another `auto_spawn` iteration before the first agent's verify
    /// completes) cannot be handed the same `(kind, key)` again, per §3.
    pub fn next_work_unit(&mut self) -> Option<WorkUnit> {
        if let Some(unit) = self.next_pending_subtask() {
            return Some(unit);
        }

        if let Some(prd) = &self.prd {
            let candidates: Vec<Story> = prd.candidate_stories().into_iter().cloned().collect();
            for story in candidates {
                let story_key = format!("story:{}", story.id);

                // A ledger already exists for this story: every still-outstanding
                // subtask is in flight with some other agent (any that were free
                // were already drained by `next_pending_subtask` above), so there
                // is nothing new to hand out here -- and re-decomposing would
                // overwrite the ledger and double-claim its first subtask.
                if self.ledgers.contains_key(&story.id) {
                    continue;
                }
                if self.claimed.contains(&story_key) {
                    continue;
                }

                if let Some(subtasks) = decompose_story(&story) {
                    let mut ledger = SubtaskLedger { total: subtasks.len(), ..Default::default() };
                    let mut iter = subtasks.into_iter();
                    let first = iter.next();
                    ledger.remaining.extend(iter);
                    self.ledgers.insert(story.id.clone(), ledger);
                    if let Some(first) = &first {
                        self.claimed.insert(identity_key(first));
                    }
                    return first;
                }

                self.claimed.insert(story_key);
                return Some(story_to_work_unit(&story));
            }
        }

        self.next_ready_issue()
    }

    fn next_pending_subtask(&mut self) -> Option<WorkUnit> {
        for ledger in self.ledgers.values_mut() {
            if let Some(unit) = ledger.remaining.pop_front() {
                self.claimed.insert(identity_key(&unit));
                return Some(unit);
            }
        }
        None
    }

    fn next_ready_issue(&mut self) -> Option<WorkUnit> {
        let issues = self.issue_tracker.ready_issues();
        let graph = crate::task_source::build_graph(&issues);
        let layers = topo_layers(&graph).ok()?;
        let first_layer: HashSet<u64> = layers.into_iter().next()?.into_iter().collect();

        let mut ready: Vec<&RawIssue> = issues.iter().filter(|i| first_layer.contains(&i.number)).collect();
        ready.sort_by_key(|i| i.number);
        let issue = ready.into_iter().next()?;
        self.issue_tracker.claim(issue.number);
        let unit = WorkUnit::Issue {
            number: issue.number,
            title: issue.title.clone(),
            body: issue.body.clone(),
            labels: issue.labels.clone(),
        };
        self.claimed.insert(identity_key(&unit));
        Some(unit)
    }

    /// Record that `unit` passed verification. Subtasks roll up: a parent story is
    /// marked passed in the PRD iff every one of its subtask ids is now complete.
    pub fn mark_passed(&mut self, unit: &WorkUnit) -> Result<(), SchedulerError> {
        self.claimed.remove(&identity_key(unit));
        match unit {
            WorkUnit::Story { id, .. } => {
                if let Some(prd) = &mut self.prd {
                    prd.mark_story_passed(id, &self.project_dir)?;
                }
            }
            WorkUnit::Subtask { id, parent_id, .. } => {
                let done = {
                    let ledger = self.ledgers.entry(parent_id.clone()).or_default();
                    ledger.completed.insert(id.clone());
                    ledger.completed.len() >= ledger.total
                };
                if done {
                    if let Some(prd) = &mut self.prd {
                        prd.mark_story_passed(parent_id, &self.project_dir)?;
                    }
                    self.ledgers.remove(parent_id);
                }
            }
            WorkUnit::Issue { number, .. } => {
                self.issue_tracker.claim(*number);
            }
        }
        self.reset_verify_attempts(&unit.task_key());
        Ok(())
    }

    /// Record a permanent task failure (reroute budget exhausted). Marks any
    /// backing story failed and drops its subtask ledger so it is never reissued.
    pub fn mark_failed(&mut self, unit: &WorkUnit, reason: &str) -> Result<(), SchedulerError> {
        self.claimed.remove(&identity_key(unit));
        let story_id = match unit {
            WorkUnit::Story { id, .. } => Some(id.clone()),
            WorkUnit::Subtask { parent_id, .. } => Some(parent_id.clone()),
            WorkUnit::Issue { .. } => None,
        };
        if let Some(id) = story_id {
            if let Some(prd) = &mut self.prd {
                prd.mark_story_failed(&id, reason, &self.project_dir)?;
            }
            self.ledgers.remove(&id);
        }
        Ok(())
    }

    /// `active = |{agents : status in {working, verifying}}|`; returns how many
    /// replacements to auto-spawn.
    pub fn auto_spawn_count(max_agents: usize, active: usize) -> usize {
        max_agents.saturating_sub(active)
    }

    pub fn verify_attempts(&self, task_key: &str) -> u32 {
        *self.verify_attempts.get(task_key).unwrap_or(&0)
    }

    /// Increment and return the new verify-attempt count for `task_key`.
    pub fn record_verify_attempt(&mut self, task_key: &str) -> u32 {
        let count = self.verify_attempts.entry(task_key.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    pub fn reset_verify_attempts(&mut self, task_key: &str) {
        self.verify_attempts.remove(task_key);
    }

    pub fn should_reroute(&self, task_key: &str) -> bool {
        self.verify_attempts(task_key) >= MAX_VERIFY
    }

    pub fn reroute_count(&self, task_key: &str) -> u32 {
        *self.reroute_counts.get(task_key).unwrap_or(&0)
    }

    /// Attempts a reroute for `task_key`. Returns `true` and increments the counter
    /// if under budget; returns `false` (no increment) if the task must instead be
    /// permanently failed.
    pub fn try_reroute(&mut self, task_key: &str) -> bool {
        let count = self.reroute_count(task_key);
        if count >= MAX_REROUTES {
            return false;
        }
        self.reroute_counts.insert(task_key.to_string(), count + 1);
        self.reset_verify_attempts(task_key);
        true
    }
}

fn story_to_work_unit(story: &Story) -> WorkUnit {
    WorkUnit::Story {
        id: story.id.clone(),
        title: story.title.clone(),
        description: story.description.clone(),
        criteria: story.acceptance_criteria.clone(),
        priority: story.priority.unwrap_or(99),
        passed: story.passes,
        notes: story.notes.clone(),
    }
}
