//! Task Source: PRD load/save, the `WorkUnit` tagged variant, story decomposition,
//! and issue-tracker -> PRD conversion with dependency topo-layering.
//!
//! Grounded on `features.rs`'s FeatureList load/save/claim shape, re-keyed from
//! feature/scope vocabulary to PRD/story/issue vocabulary.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum TaskSourceError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse PRD: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("story not found: {0}")]
    NotFound(String),
    #[error("dependency cycle detected among issues: {0:?}")]
    Cycle(Vec<u64>),
}

/// PRD file format (bit-exact field naming for on-disk compatibility).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Prd {
    pub project: String,
    #[serde(rename = "branchName", skip_serializing_if = "Option::is_none")]
    pub branch_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "userStories")]
    pub user_stories: Vec<Story>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Story {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "acceptanceCriteria")]
    pub acceptance_criteria: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<u32>,
    pub passes: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// A tagged variant of the unit of work the scheduler hands to an agent.
/// Equality is by (kind, key), not full structural equality.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum WorkUnit {
    Story {
        id: String,
        title: String,
        description: String,
        criteria: Vec<String>,
        priority: u32,
        passed: bool,
        notes: Option<String>,
    },
    Subtask {
        id: String,
        #[serde(rename = "parentId")]
        parent_id: String,
        criterion: String,
        title: String,
    },
    Issue {
        number: u64,
        title: String,
        body: String,
        labels: Vec<String>,
    },
}

impl WorkUnit {
    /// `(kind, key)` identity used for claim uniqueness.
    pub fn identity(&self) -> (&'static str, String) {
        match self {
            WorkUnit::Story { id, .. } => ("story", id.clone()),
            WorkUnit::Subtask { id, .. } => ("subtask", id.clone()),
            WorkUnit::Issue { number, .. } => ("issue", number.to_string()),
        }
    }

    /// Memory join key: `story:<id>` or `issue:<num>`. Subtasks roll up to their
    /// parent story's task_key since memory and budgets are tracked per-task, and a
    /// story's task is the sum of its subtasks.
    pub fn task_key(&self) -> String {
        match self {
            WorkUnit::Story { id, .. } => format!("story:{id}"),
            WorkUnit::Subtask { parent_id, .. } => format!("story:{parent_id}"),
            WorkUnit::Issue { number, .. } => format!("issue:{number}"),
        }
    }
}

impl PartialEq for WorkUnit {
    fn eq(&self, other: &Self) -> bool {
        self.identity() == other.identity()
    }
}
impl Eq for WorkUnit {}

impl Prd {
    pub fn discover(project_dir: &Path) -> Option<PathBuf> {
        for candidate in [
            project_dir.join("prd.json"),
            project_dir.join("ralph/prd.json"),
            project_dir.join(".homer/prd.json"),
        ] {
            if candidate.is_file() {
                return Some(candidate);
            }
        }
        None
    }

    /// Load the PRD at the discovered path. Malformed JSON is treated as absent
    /// (returns `Ok(None)`).
    pub fn load(project_dir: &Path) -> Result<Option<Self>, TaskSourceError> {
        let Some(path) = Self::discover(project_dir) else {
            return Ok(None);
        };
        let content = std::fs::read_to_string(&path)?;
        match serde_json::from_str::<Prd>(&content) {
            Ok(prd) => Ok(Some(prd)),
            Err(_) => Ok(None),
        }
    }

    /// Atomic write: serialize to a sibling temp file, then rename over the target.
    pub fn save(&self, project_dir: &Path) -> Result<(), TaskSourceError> {
        let path = Prd::discover(project_dir).unwrap_or_else(|| project_dir.join("prd.json"));
        let json = serde_json::to_string_pretty(self)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Stable-sort stories where `not passes` ascending by priority (missing = 99);
    /// return the first.
    pub fn next_story(&self) -> Option<&Story> {
        self.candidate_stories().into_iter().next()
    }

    /// All not-yet-passed stories, stable-sorted ascending by priority (missing =
    /// 99). Used by the scheduler to walk past stories that are fully claimed.
    pub fn candidate_stories(&self) -> Vec<&Story> {
        let mut candidates: Vec<&Story> = self.user_stories.iter().filter(|s| !s.passes).collect();
        candidates.sort_by_key(|s| s.priority.unwrap_or(99));
        candidates
    }

    pub fn mark_story_passed(&mut self, id: &str, project_dir: &Path) -> Result<(), TaskSourceError> {
        let story = self
            .user_stories
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| TaskSourceError::NotFound(id.to_string()))?;
        story.passes = true;
        self.save(project_dir)
    }

    pub fn mark_story_failed(&mut self, id: &str, reason: &str, project_dir: &Path) -> Result<(), TaskSourceError> {
        let story = self
            .user_stories
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| TaskSourceError::NotFound(id.to_string()))?;
        story.passes = false;
        story.notes = Some(reason.to_string());
        self.save(project_dir)
    }
}

/// `decomposeStory`: iff `criteria.len() > 2`, emit one Subtask per criterion with
/// `id = "<storyId>-<i+1>"`. Otherwise, no decomposition.
pub fn decompose_story(story: &Story) -> Option<Vec<WorkUnit>> {
    if story.acceptance_criteria.len() <= 2 {
        return None;
    }
    Some(
        story
            .acceptance_criteria
            .iter()
            .enumerate()
            .map(|(i, criterion)| WorkUnit::Subtask {
                id: format!("{}-{}", story.id, i + 1),
                parent_id: story.id.clone(),
                criterion: criterion.clone(),
                title: story.title.clone(),
            })
            .collect(),
    )
}

/// Raw issue as handed over by the external issue-tracker collaborator.
#[derive(Debug, Clone)]
pub struct RawIssue {
    pub number: u64,
    pub title: String,
    pub body: String,
    pub labels: Vec<String>,
}

/// `issuesToPRD`: map an issue list into an equivalent PRD. Criteria are extracted,
/// per issue, in precedence order: (a) markdown checkbox lines, (b) an
/// "Acceptance Criteria/Requirements/Tasks" section, (c) fallback to the title plus
/// an implicit "typecheck passes".
pub fn issues_to_prd(issues: &[RawIssue], repo: &str) -> Prd {
    let stories = issues
        .iter()
        .map(|issue| Story {
            id: format!("ISSUE-{}", issue.number),
            title: issue.title.clone(),
            description: issue.body.clone(),
            acceptance_criteria: extract_criteria(&issue.body, &issue.title),
            priority: None,
            passes: false,
            notes: None,
        })
        .collect();
    Prd {
        project: repo.to_string(),
        branch_name: None,
        description: None,
        user_stories: stories,
    }
}

fn extract_criteria(body: &str, title: &str) -> Vec<String> {
    let checkboxes: Vec<String> = body
        .lines()
        .filter_map(|line| {
            let trimmed = line.trim_start();
            if let Some(rest) = trimmed.strip_prefix("- [ ]") {
                Some(rest.trim().to_string())
            } else if let Some(rest) = trimmed.strip_prefix("- [x]") {
                Some(rest.trim().to_string())
            } else {
                None
            }
        })
        .collect();
    if !checkboxes.is_empty() {
        return checkboxes;
    }

    if let Some(section) = extract_section(body, &["Acceptance Criteria", "Requirements", "Tasks"]) {
        let lines: Vec<String> = section
            .lines()
            .map(|l| l.trim_start_matches(['-', '*']).trim().to_string())
            .filter(|l| !l.is_empty())
            .collect();
        if !lines.is_empty() {
            return lines;
        }
    }

    vec![title.to_string(), "typecheck passes".to_string()]
}

fn extract_section(body: &str, headers: &[&str]) -> Option<String> {
    let lines: Vec<&str> = body.lines().collect();
    for (i, line) in lines.iter().enumerate() {
        let clean = line.trim_start_matches('#').trim().to_lowercase();
        if headers.iter().any(|h| clean == h.to_lowercase()) {
            let mut section = Vec::new();
            for l in &lines[i + 1..] {
                if l.trim_start().starts_with('#') {
                    break;
                }
                section.push(*l);
            }
            return Some(section.join("\n"));
        }
    }
    None
}

/// Build a dependency graph (`issue number -> depended-upon issue numbers`) by
/// scanning each body for "depends on #N" / "blocked by #N" (case-insensitive).
pub fn build_graph(issues: &[RawIssue]) -> HashMap<u64, Vec<u64>> {
    let dep_re = regex::Regex::new(r"(?i)(?:depends on|blocked by)\s+#(\d+)").unwrap();
    let known: HashSet<u64> = issues.iter().map(|i| i.number).collect();
    issues
        .iter()
        .map(|issue| {
            let deps: Vec<u64> = dep_re
                .captures_iter(&issue.body)
                .filter_map(|c| c[1].parse::<u64>().ok())
                .filter(|n| known.contains(n) && *n != issue.number)
                .collect();
            (issue.number, deps)
        })
        .collect()
}

/// Kahn's-algorithm layering: each layer contains every node whose dependencies are
/// all satisfied by prior layers. Errors if a cycle prevents full layering.
pub fn topo_layers(graph: &HashMap<u64, Vec<u64>>) -> Result<Vec<Vec<u64>>, TaskSourceError> {
    let mut remaining: HashMap<u64, Vec<u64>> = graph.clone();
    let mut resolved: HashSet<u64> = HashSet::new();
    let mut layers = Vec::new();

    while !remaining.is_empty() {
        let ready: Vec<u64> = remaining
            .iter()
            .filter(|(_, deps)| deps.iter().all(|d| resolved.contains(d)))
            .map(|(n, _)| *n)
            .collect();

        if ready.is_empty() {
            let mut stuck: Vec<u64> = remaining.keys().copied().collect();
            stuck.sort();
            return Err(TaskSourceError::Cycle(stuck));
        }

        let mut layer = ready.clone();
        layer.sort();
        for n in &layer {
            remaining.remove(n);
            resolved.insert(*n);
        }
        layers.push(layer);
    }

    Ok(layers)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_prd() -> Prd {
        Prd {
            project: "acme".into(),
            branch_name: Some("main".into()),
            description: None,
            user_stories: vec![
                Story {
                    id: "US-001".into(),
                    title: "Add auth".into(),
                    description: "".into(),
                    acceptance_criteria: vec!["a".into(), "b".into()],
                    priority: Some(1),
                    passes: false,
                    notes: None,
                },
                Story {
                    id: "US-002".into(),
                    title: "Add logout".into(),
                    description: "".into(),
                    acceptance_criteria: vec!["c".into()],
                    priority: Some(2),
                    passes: false,
                    notes: None,
                },
            ],
        }
    }

    #[test]
    fn prd_field_names_are_bit_exact() {
        let prd = sample_prd();
        let json = serde_json::to_string(&prd).unwrap();
        assert!(json.contains("\"userStories\""));
        assert!(json.contains("\"acceptanceCriteria\""));
        assert!(json.contains("\"passes\""));
        assert!(json.contains("\"branchName\""));
    }

    #[test]
    fn roundtrip_save_load_preserves_order() {
        let dir = tempfile::tempdir().unwrap();
        let prd = sample_prd();
        prd.save(dir.path()).unwrap();
        let loaded = Prd::load(dir.path()).unwrap().unwrap();
        assert_eq!(loaded.user_stories[0].id, "US-001");
        assert_eq!(loaded, prd);
    }

    #[test]
    fn discover_prefers_prd_json() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(".homer")).unwrap();
        std::fs::write(dir.path().join(".homer/prd.json"), "{}").unwrap();
        std::fs::write(dir.path().join("prd.json"), "{}").unwrap();
        let found = Prd::discover(dir.path()).unwrap();
        assert_eq!(found, dir.path().join("prd.json"));
    }

    #[test]
    fn malformed_json_is_absent() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("prd.json"), "{not json").unwrap();
        assert!(Prd::load(dir.path()).unwrap().is_none());
    }

    #[test]
    fn next_story_picks_lowest_priority_unpassed() {
        let prd = sample_prd();
        let next = prd.next_story().unwrap();
        assert_eq!(next.id, "US-001");
    }

    #[test]
    fn next_story_missing_priority_sorts_last() {
        let mut prd = sample_prd();
        prd.user_stories[0].priority = None;
        let next = prd.next_story().unwrap();
        assert_eq!(next.id, "US-002");
    }

    #[test]
    fn mark_story_passed_persists() {
        let dir = tempfile::tempdir().unwrap();
        let mut prd = sample_prd();
        prd.save(dir.path()).unwrap();
        prd.mark_story_passed("US-001", dir.path()).unwrap();
        let reloaded = Prd::load(dir.path()).unwrap().unwrap();
        assert!(reloaded.user_stories[0].passes);
    }

    #[test]
    fn decompose_requires_more_than_two_criteria() {
        let story = &sample_prd().user_stories[0];
        assert!(decompose_story(story).is_none());
    }

    #[test]
    fn decompose_emits_one_subtask_per_criterion() {
        let story = Story {
            id: "US-007".into(),
            title: "Big feature".into(),
            description: "".into(),
            acceptance_criteria: vec!["a".into(), "b".into(), "c".into()],
            priority: Some(1),
            passes: false,
            notes: None,
        };
        let subtasks = decompose_story(&story).unwrap();
        assert_eq!(subtasks.len(), 3);
        assert_eq!(subtasks[0].identity(), ("subtask", "US-007-1".to_string()));
        assert_eq!(subtasks[2].identity(), ("subtask", "US-007-3".to_string()));
    }

    #[test]
    fn issues_to_prd_checkbox_precedence() {
        let issues = vec![RawIssue {
            number: 1,
            title: "Fix bug".into(),
            body: "Some text\n- [ ] step one\n- [x] step two\n".into(),
            labels: vec![],
        }];
        let prd = issues_to_prd(&issues, "acme/widgets");
        assert_eq!(prd.user_stories[0].acceptance_criteria, vec!["step one", "step two"]);
    }

    #[test]
    fn issues_to_prd_section_fallback() {
        let issues = vec![RawIssue {
            number: 2,
            title: "Improve perf".into(),
            body: "## Acceptance Criteria\n- fast enough\n- no regressions\n".into(),
            labels: vec![],
        }];
        let prd = issues_to_prd(&issues, "acme/widgets");
        assert_eq!(prd.user_stories[0].acceptance_criteria, vec!["fast enough", "no regressions"]);
    }

    #[test]
    fn issues_to_prd_title_fallback() {
        let issues = vec![RawIssue {
            number: 3,
            title: "Just a title".into(),
            body: "no structure here".into(),
            labels: vec![],
        }];
        let prd = issues_to_prd(&issues, "acme/widgets");
        assert_eq!(
            prd.user_stories[0].acceptance_criteria,
            vec!["Just a title", "typecheck passes"]
        );
    }

    #[test]
    fn topo_layers_union_equals_input_p7() {
        let issues = vec![
            RawIssue { number: 1, title: "a".into(), body: "".into(), labels: vec![] },
            RawIssue { number: 2, title: "b".into(), body: "depends on #1".into(), labels: vec![] },
            RawIssue { number: 3, title: "c".into(), body: "blocked by #2".into(), labels: vec![] },
        ];
        let graph = build_graph(&issues);
        let layers = topo_layers(&graph).unwrap();
        let union: HashSet<u64> = layers.iter().flatten().copied().collect();
        let input: HashSet<u64> = issues.iter().map(|i| i.number).collect();
        assert_eq!(union, input);
        // edges point strictly forward: layer index of 1 < layer index of 2 < layer index of 3
        let layer_of = |n: u64| layers.iter().position(|l| l.contains(&n)).unwrap();
        assert!(layer_of(1) < layer_of(2));
        assert!(layer_of(2) < layer_of(3));
    }

    #[test]
    fn topo_layers_detects_cycle() {
        let mut graph = HashMap::new();
        graph.insert(1u64, vec![2u64]);
        graph.insert(2u64, vec![1u64]);
        assert!(topo_layers(&graph).is_err());
    }

    #[test]
    fn topo_layers_independent_nodes_share_a_layer() {
        let issues = vec![
            RawIssue { number: 1, title: "a".into(), body: "".into(), labels: vec![] },
            RawIssue { number: 2, title: "b".into(), body: "".into(), labels: vec![] },
        ];
        let graph = build_graph(&issues);
        let layers = topo_layers(&graph).unwrap();
        assert_eq!(layers.len(), 1);
        assert_eq!(layers[0].len(), 2);
    }
}
