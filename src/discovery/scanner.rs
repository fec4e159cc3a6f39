//! Synchronous filesystem scan that produces a [`Catalog`].

use std::collections::BTreeMap;
use std::fs;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use simd_json::OwnedValue;
use simd_json::prelude::*;
use walkdir::WalkDir;

use super::{Catalog, ProjectEntry, SessionEntry};
use crate::utils::{Mtime, is_valid_uuid};

pub const SIDE_FILE: &str = "sessions-index.json";
pub const UNKNOWN_PROJECT_PATH: &str = "Unknown";

/// Directory Claude Code creates for sessions started in the home directory itself.
const HOME_PROJECT_DIR: &str = "-home-";
/// How far into a log to look for a `cwd` when no side file names the project.
const CWD_SCAN_LINES: usize = 20;

/// Scan every project under `projects_dir`. A missing directory is an empty catalog;
/// anything else in its place is an error.
pub fn scan_catalog(projects_dir: &Path) -> Result<Catalog> {
    let mut catalog = Catalog {
        projects: BTreeMap::new(),
        scanned_at: Utc::now(),
    };

    if !projects_dir.exists() {
        tracing::debug!(dir = %projects_dir.display(), "projects directory does not exist");
        return Ok(catalog);
    }
    if !projects_dir.is_dir() {
        anyhow::bail!("{} is not a directory", projects_dir.display());
    }

    for entry in WalkDir::new(projects_dir).min_depth(1).max_depth(1).sort_by_file_name() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) if err.depth() == 0 => {
                return Err(err).with_context(|| format!("Failed to read {}", projects_dir.display()));
            }
            Err(err) => {
                tracing::warn!("skipping unreadable projects entry: {err}");
                continue;
            }
        };
        if !entry.file_type().is_dir() {
            continue;
        }
        let project_dir = entry.path();
        let Some(project_id) = file_name(project_dir) else {
            continue;
        };
        if project_id == HOME_PROJECT_DIR {
            continue;
        }

        match scan_project(project_dir, &project_id) {
            Ok(project) => {
                catalog.projects.insert(project_id, project);
            }
            Err(err) => {
                tracing::warn!(project = %project_id, "skipping unreadable project: {err:#}");
            }
        }
    }

    Ok(catalog)
}

/// Scan one project directory: side file first, then the directory listing.
pub fn scan_project(project_dir: &Path, project_id: &str) -> Result<ProjectEntry> {
    let mut project = ProjectEntry {
        project_id: project_id.to_string(),
        project_path: UNKNOWN_PROJECT_PATH.to_string(),
        sessions: BTreeMap::new(),
        scanned_at: Utc::now(),
    };

    let side_file = project_dir.join(SIDE_FILE);
    if side_file.exists() {
        read_side_file(&side_file, project_dir, &mut project);
    }

    let listing = fs::read_dir(project_dir)
        .with_context(|| format!("Failed to read {}", project_dir.display()))?;
    let mut logs: Vec<PathBuf> = listing
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "jsonl") && path.is_file())
        .collect();
    logs.sort();

    for path in logs {
        let Some(session_id) = session_stem(&path) else {
            continue;
        };
        // Side-file entries may all say "Unknown", so this runs before the dedup below.
        if project.project_path == UNKNOWN_PROJECT_PATH
            && let Some(cwd) = cwd_from_log(&path)
        {
            project.project_path = cwd;
        }

        if project.sessions.contains_key(&session_id) {
            continue;
        }

        project.sessions.insert(
            session_id.clone(),
            SessionEntry {
                session_id,
                slug: None,
                project_id: project_id.to_string(),
                directory: Some(project_dir.to_string_lossy().into_owned()),
                mtime: Mtime::of(&path),
                path,
            },
        );
    }

    Ok(project)
}

/// Session id for a top-level log file, or `None` for agent logs and non-UUID names.
fn session_stem(path: &Path) -> Option<String> {
    let name = file_name(path)?;
    if name.starts_with("agent-") {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    is_valid_uuid(stem).then(|| stem.to_string())
}

fn file_name(path: &Path) -> Option<String> {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(|name| name.to_string())
}

/// Merge the entries of a `sessions-index.json` into `project`.
///
/// Accepts both `{"entries": [...]}` and a bare list. A file that cannot be read or
/// parsed is ignored; the directory listing still finds the sessions.
fn read_side_file(side_file: &Path, project_dir: &Path, project: &mut ProjectEntry) {
    let entries = match parse_side_file(side_file) {
        Ok(entries) => entries,
        Err(err) => {
            tracing::warn!(file = %side_file.display(), "ignoring session index: {err:#}");
            return;
        }
    };

    for entry in &entries {
        let Some(session_id) = str_field(entry, "sessionId").or_else(|| str_field(entry, "id"))
        else {
            continue;
        };
        if !is_valid_uuid(&session_id) {
            continue;
        }

        let log = project_dir.join(format!("{session_id}.jsonl"));
        if !log.is_file() {
            continue;
        }

        let directory = str_field(entry, "projectPath").or_else(|| str_field(entry, "directory"));
        if project.project_path == UNKNOWN_PROJECT_PATH
            && let Some(dir) = &directory
            && dir != UNKNOWN_PROJECT_PATH
        {
            project.project_path = dir.clone();
        }

        project.sessions.insert(
            session_id.clone(),
            SessionEntry {
                session_id,
                slug: str_field(entry, "slug"),
                project_id: project.project_id.clone(),
                directory,
                mtime: Mtime::of(&log),
                path: log,
            },
        );
    }
}

fn parse_side_file(side_file: &Path) -> Result<Vec<OwnedValue>> {
    let mut bytes = fs::read(side_file).context("Failed to read session index")?;
    let value = simd_json::to_owned_value(&mut bytes).context("Failed to parse session index")?;

    let entries = if let Some(list) = value.as_array() {
        list.clone()
    } else if value.as_object().is_some() {
        value
            .get("entries")
            .and_then(|entries| entries.as_array())
            .cloned()
            .unwrap_or_default()
    } else {
        anyhow::bail!("session index is neither an object nor a list");
    };

    Ok(entries
        .into_iter()
        .filter(|entry| entry.as_object().is_some())
        .collect())
}

fn str_field(entry: &OwnedValue, key: &str) -> Option<String> {
    entry
        .get(key)
        .and_then(|value| value.as_str())
        .filter(|value| !value.is_empty())
        .map(|value| value.to_string())
}

/// First `cwd` found near the top of a log.
pub fn cwd_from_log(path: &Path) -> Option<String> {
    let file = fs::File::open(path).ok()?;
    BufReader::new(file)
        .lines()
        .take(CWD_SCAN_LINES)
        .map_while(|line| line.ok())
        .find_map(|line| {
            let mut bytes = line.into_bytes();
            let value = simd_json::to_owned_value(&mut bytes).ok()?;
            str_field(&value, "cwd")
        })
}

/// A string field of the first line of a log.
fn first_line_field(path: &Path, key: &str) -> Option<String> {
    let file = fs::File::open(path).ok()?;
    let mut first = String::new();
    BufReader::new(file).read_line(&mut first).ok()?;
    let mut bytes = first.into_bytes();
    let value = simd_json::to_owned_value(&mut bytes).ok()?;
    str_field(&value, key)
}

pub fn first_session_id(path: &Path) -> Option<String> {
    first_line_field(path, "sessionId")
}

/// `subagentType` as recorded on the first line of a subagent log.
pub fn first_subagent_type(path: &Path) -> Option<String> {
    first_line_field(path, "subagentType")
}

/// Subagent logs of one session, in both on-disk layouts.
pub fn subagent_files(project_dir: &Path, session_id: &str) -> Vec<PathBuf> {
    let mut files = Vec::new();

    let nested = project_dir.join(session_id).join("subagents");
    if nested.is_dir() {
        files.extend(agent_logs_in(&nested));
    }

    files.extend(
        agent_logs_in(project_dir)
            .into_iter()
            .filter(|path| first_session_id(path).as_deref() == Some(session_id)),
    );

    files
}

/// Path of one subagent's log, checking the nested layout first.
pub fn subagent_file(project_dir: &Path, session_id: &str, agent_id: &str) -> Option<PathBuf> {
    let file_name = format!("agent-{agent_id}.jsonl");

    let nested = project_dir.join(session_id).join("subagents").join(&file_name);
    if nested.is_file() {
        return Some(nested);
    }

    let flat = project_dir.join(&file_name);
    (flat.is_file() && first_session_id(&flat).as_deref() == Some(session_id)).then_some(flat)
}

/// Find a subagent log by agent id alone: every session's `subagents/` directory in
/// name order, then the flat layout. Returns the owning session id with the path.
pub fn find_agent_file(project_dir: &Path, agent_id: &str) -> Option<(Option<String>, PathBuf)> {
    let log_name = format!("agent-{agent_id}.jsonl");

    let mut session_dirs: Vec<PathBuf> = fs::read_dir(project_dir)
        .ok()?
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .collect();
    session_dirs.sort();
    for dir in session_dirs {
        let candidate = dir.join("subagents").join(&log_name);
        if candidate.is_file() {
            return Some((file_name(&dir), candidate));
        }
    }

    let flat = project_dir.join(&log_name);
    flat.is_file().then(|| (first_session_id(&flat), flat))
}

fn agent_logs_in(dir: &Path) -> Vec<PathBuf> {
    let pattern = format!("{}/agent-*.jsonl", glob::Pattern::escape(&dir.to_string_lossy()));
    let mut paths: Vec<PathBuf> = match glob::glob(&pattern) {
        Ok(entries) => entries.flatten().filter(|path| path.is_file()).collect(),
        Err(err) => {
            tracing::warn!(dir = %dir.display(), "bad agent log pattern: {err}");
            Vec::new()
        }
    };
    paths.sort();
    paths
}
