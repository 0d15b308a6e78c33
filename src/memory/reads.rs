//! Memory Store read APIs: deterministic, text-producing context builders injected
//! into agent prompts and reroute/feedback blocks.

use super::{from_json, MemoryError, MemoryStore, TaskRunError};
use rusqlite::{params, OptionalExtension};

const MAX_PREVIOUS_ATTEMPTS: usize = 5;
const MAX_SOLUTIONS_PER_FILE: usize = 3;
const MAX_RULES: usize = 8;

struct RankedSolution {
    error_key: String,
    error_text: String,
    fix_summary: Option<String>,
    resolved: bool,
    confidence: f64,
}

struct RankedRule {
    id: i64,
    scope: String,
    rule: String,
    confidence: f64,
}

impl MemoryStore {
    /// `buildTaskMemory(taskKey, filePaths[])`.
    pub fn build_task_memory(&self, task_key: &str, file_paths: &[String]) -> Result<String, MemoryError> {
        let result = self.with_conn(|conn| {
            let mut sections = Vec::new();

            // 1. PREVIOUS ATTEMPTS ON THIS TASK.
            let mut attempts_stmt = conn.prepare(
                "SELECT attempts, outcome, errors, created_at FROM task_runs
                 WHERE task_key = ?1 ORDER BY id DESC LIMIT ?2",
            )?;
            let mut rows: Vec<(i64, String, String, String)> = attempts_stmt
                .query_map(params![task_key, MAX_PREVIOUS_ATTEMPTS as i64], |r| {
                    Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?))
                })?
                .collect::<Result<_, _>>()?;
            rows.reverse();
            if !rows.is_empty() {
                let mut block = String::from("PREVIOUS ATTEMPTS ON THIS TASK\n");
                for (attempts, outcome, errors_json, created_at) in &rows {
                    let errors: Vec<TaskRunError> = serde_json::from_str(errors_json).unwrap_or_default();
                    block.push_str(&format!("- attempt #{attempts} ({outcome}) at {created_at}\n"));
                    for err in &errors {
                        block.push_str(&format!("  - {}: {}\n", err.check, truncate(&err.output, 200)));
                    }
                }
                sections.push(block);
            }

            // 2. KNOWN ERRORS ON THESE FILES.
            let mut solutions = rank_solutions_for_files(conn, file_paths)?;
            let mut by_task = rank_solutions_for_task(conn, task_key)?;
            solutions.append(&mut by_task);
            dedup_solutions(&mut solutions);
            solutions.sort_by(|a, b| b.confidence.partial_cmp(&a.confidence).unwrap());
            if !solutions.is_empty() {
                let mut block = String::from("KNOWN ERRORS ON THESE FILES\n");
                for sol in solutions.iter().take(MAX_SOLUTIONS_PER_FILE * file_paths.len().max(1)) {
                    let summary = sol.fix_summary.clone().unwrap_or_else(|| sol.error_text.clone());
                    block.push_str(&format!(
                        "- {} (confidence {:.2}{}): {}\n",
                        sol.error_key,
                        sol.confidence,
                        if sol.resolved { ", resolved" } else { "" },
                        truncate(&summary, 200)
                    ));
                }
                sections.push(block);
            }

            // 3. FILE DEPENDENCIES.
            let mut dep_block = String::new();
            for file in file_paths {
                let cochanges: Option<String> = conn
                    .query_row("SELECT cochanges FROM file_knowledge WHERE path = ?1", params![file], |r| r.get(0))
                    .optional()?;
                if let Some(json) = cochanges {
                    let list = from_json(&json);
                    if !list.is_empty() {
                        dep_block.push_str(&format!("- {file} tends to change together with: {}\n", list.join(", ")));
                    }
                }
            }
            if !dep_block.is_empty() {
                sections.push(format!("FILE DEPENDENCIES\n{dep_block}"));
            }

            // 4. PATTERNS FROM MEMORY.
            let rules = rank_rules(conn, file_paths, &[])?;
            if !rules.is_empty() {
                let mut block = String::from("PATTERNS FROM MEMORY\n");
                for rule in &rules {
                    block.push_str(&format!("- [{}] {}\n", rule.scope, rule.rule));
                }
                sections.push(block);
                *self.last_injected.lock().unwrap() = rules.iter().map(|r| r.id).collect();
            } else {
                *self.last_injected.lock().unwrap() = Vec::new();
            }

            Ok(sections.join("\n"))
        })?;
        Ok(result.unwrap_or_default())
    }

    /// Ids surfaced by the last `build_task_memory` call; not cleared on read.
    pub fn get_last_injected_rule_ids(&self) -> Vec<i64> {
        self.last_injected.lock().unwrap().clone()
    }

    /// `buildErrorContext(errorKey, filePath?)`.
    pub fn build_error_context(&self, error_key: &str, file_path: Option<&str>) -> Result<String, MemoryError> {
        let result = self.with_conn(|conn| {
            let exact: Option<(Option<String>, bool)> = conn
                .query_row(
                    "SELECT fix_summary, resolved FROM solutions WHERE error_key = ?1 ORDER BY confidence DESC LIMIT 1",
                    params![error_key],
                    |r| Ok((r.get(0)?, r.get::<_, i64>(1)? == 1)),
                )
                .optional()?;

            if let Some((Some(summary), true)) = &exact {
                let _ = file_path;
                return Ok(format!("KNOWN FIX FOR {error_key}\n- {summary}\n"));
            }

            let prefix = error_key.splitn(3, ':').take(2).collect::<Vec<_>>().join(":");
            let pattern = format!("{prefix}%");
            let mut stmt = conn.prepare(
                "SELECT error_key, fix_summary FROM solutions
                 WHERE error_key LIKE ?1 AND resolved = 1 AND fix_summary IS NOT NULL
                 ORDER BY confidence DESC LIMIT 2",
            )?;
            let related: Vec<(String, String)> = stmt
                .query_map(params![pattern], |r| Ok((r.get(0)?, r.get(1)?)))?
                .collect::<Result<_, _>>()?;

            if related.is_empty() {
                return Ok(String::new());
            }
            let mut block = format!("RELATED FIXES FOR {prefix}\n");
            for (key, summary) in related {
                block.push_str(&format!("- {key}: {summary}\n"));
            }
            Ok(block)
        })?;
        Ok(result.unwrap_or_default())
    }

    /// `buildRerouteContext(taskKey, filePaths[])` — the same material as
    /// `build_task_memory`, voiced as "what previous agents tried".
    pub fn build_reroute_context(&self, task_key: &str, file_paths: &[String]) -> Result<String, MemoryError> {
        let memory = self.build_task_memory(task_key, file_paths)?;
        if memory.is_empty() {
            return Ok(String::new());
        }
        Ok(format!("WHAT PREVIOUS AGENTS TRIED\n{memory}"))
    }

    /// `buildRuleHints(filePaths[], errorKeys[])`.
    pub fn build_rule_hints(&self, file_paths: &[String], error_keys: &[String]) -> Result<String, MemoryError> {
        let result = self.with_conn(|conn| {
            let checks: Vec<String> = error_keys
                .iter()
                .filter_map(|k| k.split(':').next())
                .map(|s| s.to_string())
                .collect();
            let rules = rank_rules(conn, file_paths, &checks)?;
            if rules.is_empty() {
                return Ok(String::new());
            }
            let mut block = String::from("RULES TO FOLLOW THIS RETRY\n");
            for rule in rules {
                block.push_str(&format!("- [{}] {}\n", rule.scope, rule.rule));
            }
            Ok(block)
        })?;
        Ok(result.unwrap_or_default())
    }

    /// Row counts per table, for the export manifest. Returns all zeros if the
    /// store is closed rather than erroring — export is best-effort.
    pub fn stats(&self) -> MemoryStats {
        self.with_conn(|conn| {
            let count = |table: &str| -> Result<i64, MemoryError> {
                Ok(conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |r| r.get(0))?)
            };
            Ok(MemoryStats {
                file_knowledge: count("file_knowledge")?,
                solutions: count("solutions")?,
                task_runs: count("task_runs")?,
                repo_rules: count("repo_rules")?,
                verification_episodes: count("verification_episodes")?,
                error_file_relations: count("error_file_relations")?,
            })
        })
        .ok()
        .flatten()
        .unwrap_or_default()
    }
}

#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct MemoryStats {
    pub file_knowledge: i64,
    pub solutions: i64,
    pub task_runs: i64,
    pub repo_rules: i64,
    pub verification_episodes: i64,
    pub error_file_relations: i64,
}

fn truncate(s: &str, n: usize) -> String {
    s.chars().take(n).collect()
}

fn rank_solutions_for_files(conn: &rusqlite::Connection, file_paths: &[String]) -> Result<Vec<RankedSolution>, MemoryError> {
    let mut out = Vec::new();
    for file in file_paths {
        let pattern = format!("%{file}%");
        let mut stmt = conn.prepare(
            "SELECT error_key, error_text, fix_summary, resolved, confidence FROM solutions
             WHERE error_key LIKE ?1
             ORDER BY (0.5 * resolved + 0.5 * confidence) DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![pattern, MAX_SOLUTIONS_PER_FILE as i64], |r| {
            Ok(RankedSolution {
                error_key: r.get(0)?,
                error_text: r.get(1)?,
                fix_summary: r.get(2)?,
                resolved: r.get::<_, i64>(3)? == 1,
                confidence: r.get(4)?,
            })
        })?;
        for row in rows {
            out.push(row?);
        }
    }
    Ok(out)
}

fn rank_solutions_for_task(conn: &rusqlite::Connection, task_key: &str) -> Result<Vec<RankedSolution>, MemoryError> {
    let mut stmt = conn.prepare(
        "SELECT error_key, error_text, fix_summary, resolved, confidence FROM solutions
         WHERE task_key = ?1
         ORDER BY (0.5 * resolved + 0.5 * confidence) DESC LIMIT ?2",
    )?;
    let rows = stmt.query_map(params![task_key, MAX_SOLUTIONS_PER_FILE as i64], |r| {
        Ok(RankedSolution {
            error_key: r.get(0)?,
            error_text: r.get(1)?,
            fix_summary: r.get(2)?,
            resolved: r.get::<_, i64>(3)? == 1,
            confidence: r.get(4)?,
        })
    })?;
    Ok(rows.collect::<Result<_, _>>()?)
}

fn dedup_solutions(solutions: &mut Vec<RankedSolution>) {
    let mut seen = std::collections::HashSet::new();
    solutions.retain(|s| seen.insert(s.error_key.clone()));
}

/// File-scoped, then check-scoped, then repo-scoped rules, up to MAX_RULES, deduped.
fn rank_rules(conn: &rusqlite::Connection, file_paths: &[String], checks: &[String]) -> Result<Vec<RankedRule>, MemoryError> {
    let mut out = Vec::new();
    let mut seen = std::collections::HashSet::new();

    for file in file_paths {
        let scope = format!("file:{file}");
        append_rules_for_scope(conn, &scope, &mut out, &mut seen)?;
    }
    for check in checks {
        let scope = format!("check:{check}");
        append_rules_for_scope(conn, &scope, &mut out, &mut seen)?;
    }
    append_rules_for_scope(conn, "repo", &mut out, &mut seen)?;

    out.truncate(MAX_RULES);
    Ok(out)
}

fn append_rules_for_scope(
    conn: &rusqlite::Connection,
    scope: &str,
    out: &mut Vec<RankedRule>,
    seen: &mut std::collections::HashSet<String>,
) -> Result<(), MemoryError> {
    if out.len() >= MAX_RULES {
        return Ok(());
    }
    let mut stmt = conn.prepare(
        "SELECT id, scope, rule, confidence FROM repo_rules WHERE scope = ?1 ORDER BY confidence DESC",
    )?;
    let rows: Vec<RankedRule> = stmt
        .query_map(params![scope], |r| {
            Ok(RankedRule { id: r.get(0)?, scope: r.get(1)?, rule: r.get(2)?, confidence: r.get(3)? })
        })?
        .collect::<Result<_, _>>()?;
    for rule in rows {
        if out.len() >= MAX_RULES {
            break;
        }
        if seen.insert(rule.rule.clone()) {
            out.push(rule);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verify::{CheckResult, VerificationResult};

    fn store_with_failed_attempt() -> MemoryStore {
        let store = MemoryStore::open_in_memory().unwrap();
        let result = VerificationResult {
            passed: false,
            skipped: false,
            results: vec![CheckResult {
                name: "typecheck".into(),
                command: "npm run typecheck".into(),
                passed: false,
                truncated_output: "TS2322: mismatch".into(),
                error_key: Some("typecheck:TS2322:lib/auth.js".into()),
            }],
        };
        store
            .record_verification("agent-1", "story:US-001", &result, &["lib/auth.js".to_string()], "claude", 1)
            .unwrap();
        store
    }

    #[test]
    fn p9_build_task_memory_includes_previous_attempts() {
        let store = store_with_failed_attempt();
        let memory = store.build_task_memory("story:US-001", &["lib/auth.js".to_string()]).unwrap();
        assert!(memory.contains("PREVIOUS ATTEMPTS ON THIS TASK"));
        assert!(memory.contains("KNOWN ERRORS ON THESE FILES"));
    }

    #[test]
    fn p10_last_injected_rule_ids_stable_across_reads() {
        let store = MemoryStore::open_in_memory().unwrap();
        {
            let conn = store.conn.lock().unwrap();
            let conn = conn.as_ref().unwrap();
            conn.execute(
                "INSERT INTO repo_rules (scope, rule, confidence, source, hits, misses, created_at, updated_at)
                 VALUES ('file:lib/auth.js', 'watch the export shape', 0.7, 'test', 1, 0, '2020', '2020')",
                [],
            )
            .unwrap();
        }
        store.build_task_memory("story:US-001", &["lib/auth.js".to_string()]).unwrap();
        let first = store.get_last_injected_rule_ids();
        let second = store.get_last_injected_rule_ids();
        assert_eq!(first, second);
        assert!(!first.is_empty());
    }

    #[test]
    fn build_error_context_reports_resolved_fix() {
        let store = MemoryStore::open_in_memory().unwrap();
        {
            let conn = store.conn.lock().unwrap();
            let conn = conn.as_ref().unwrap();
            conn.execute(
                "INSERT INTO solutions (error_key, error_text, fix_summary, fix_files, confidence, attempts, resolved, task_key, created_at, updated_at)
                 VALUES ('typecheck:TS2322:lib/auth.js', 'type mismatch', 'cast to string', '[]', 0.9, 2, 1, 'story:US-001', '2020', '2020')",
                [],
            )
            .unwrap();
        }
        let context = store.build_error_context("typecheck:TS2322:lib/auth.js", None).unwrap();
        assert!(context.contains("cast to string"));
    }

    #[test]
    fn build_reroute_context_voices_previous_agents() {
        let store = store_with_failed_attempt();
        let context = store.build_reroute_context("story:US-001", &["lib/auth.js".to_string()]).unwrap();
        assert!(context.contains("WHAT PREVIOUS AGENTS TRIED"));
    }

    #[test]
    fn empty_store_reads_return_empty_strings() {
        let store = MemoryStore::open_in_memory().unwrap();
        assert_eq!(store.build_task_memory("story:none", &[]).unwrap(), "");
        assert_eq!(store.build_error_context("nothing:here", None).unwrap(), "");
        assert_eq!(store.build_rule_hints(&[], &[]).unwrap(), "");
    }

    #[test]
    fn closed_store_reads_are_empty_not_error() {
        let store = MemoryStore::open_in_memory().unwrap();
        store.close();
        assert_eq!(store.build_task_memory("story:US-001", &["a".to_string()]).unwrap(), "");
    }
}
