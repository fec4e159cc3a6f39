use super::*;
use super::scanner::SIDE_FILE;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

const S1: &str = "11111111-1111-4111-8111-111111111111";
const S2: &str = "22222222-2222-4222-8222-222222222222";
const S3: &str = "33333333-3333-4333-8333-333333333333";

fn log_line(session_id: &str, cwd: &str) -> String {
    format!(
        r#"{{"type":"user","uuid":"u1","sessionId":"{session_id}","cwd":"{cwd}","timestamp":"2025-01-01T00:00:00Z","message":{{"role":"user","content":"hi"}}}}"#
    )
}

fn write_session(project: &Path, session_id: &str, cwd: &str) -> PathBuf {
    fs::create_dir_all(project).unwrap();
    let path = project.join(format!("{session_id}.jsonl"));
    fs::write(&path, log_line(session_id, cwd) + "\n").unwrap();
    path
}

fn set_mtime(path: &Path, secs_ago: u64) {
    let file = fs::File::options().write(true).open(path).unwrap();
    file.set_modified(std::time::SystemTime::now() - Duration::from_secs(secs_ago))
        .unwrap();
}

#[test]
fn test_fallback_matches_published_scan() {
    let root = TempDir::new().unwrap();
    let project = root.path().join("-work-app");
    write_session(&project, S1, "/work/app");
    write_session(&project, S2, "/work/app");

    let index = DiscoveryIndex::new(root.path());
    assert!(!index.is_initialized());
    let before_projects = index.list_projects();
    let before_sessions = index.list_sessions("-work-app").unwrap();
    // the fallback does not publish
    assert!(!index.is_initialized());

    index.refresh_once().unwrap();
    assert!(index.is_initialized());
    assert_eq!(index.list_projects(), before_projects);
    assert_eq!(index.list_sessions("-work-app").unwrap(), before_sessions);
    assert_eq!(before_projects[0].project_path, "/work/app");
    assert_eq!(before_projects[0].session_count, 2);
}

#[test]
fn test_sessions_sorted_by_mtime_desc() {
    let root = TempDir::new().unwrap();
    let project = root.path().join("p");
    let old = write_session(&project, S1, "/p");
    let new = write_session(&project, S2, "/p");
    set_mtime(&old, 500);
    set_mtime(&new, 5);

    let index = DiscoveryIndex::new(root.path());
    let ids: Vec<String> = index
        .list_sessions("p")
        .unwrap()
        .into_iter()
        .map(|s| s.session_id)
        .collect();
    assert_eq!(ids, vec![S2.to_string(), S1.to_string()]);
}

#[test]
fn test_side_file_wins_and_supplies_slug() {
    let root = TempDir::new().unwrap();
    let project = root.path().join("-work-app");
    write_session(&project, S1, "/from/cwd");
    write_session(&project, S2, "/from/cwd");
    fs::write(
        project.join(SIDE_FILE),
        format!(
            r#"{{"entries":[{{"sessionId":"{S1}","slug":"brave-otter","projectPath":"/from/index"}},{{"sessionId":"not-a-uuid"}},{{"sessionId":"{S3}","slug":"gone"}}]}}"#
        ),
    )
    .unwrap();

    let index = DiscoveryIndex::new(root.path());
    index.refresh_once().unwrap();

    let project_entry = index.project("-work-app").unwrap();
    assert_eq!(project_entry.project_path, "/from/index");
    // S3 is listed in the side file but has no log
    assert_eq!(project_entry.sessions.len(), 2);
    assert_eq!(
        project_entry.sessions[S1].slug.as_deref(),
        Some("brave-otter")
    );
    assert!(project_entry.sessions[S2].slug.is_none());
}

#[test]
fn test_legacy_list_side_file() {
    let root = TempDir::new().unwrap();
    let project = root.path().join("p");
    write_session(&project, S1, "/from/cwd");
    fs::write(
        project.join(SIDE_FILE),
        format!(r#"[{{"id":"{S1}","slug":"legacy","directory":"Unknown"}}]"#),
    )
    .unwrap();

    let index = DiscoveryIndex::new(root.path());
    let entry = index.find_session("p", S1).unwrap();
    assert_eq!(entry.slug.as_deref(), Some("legacy"));
    // "Unknown" never wins, so the cwd is used
    assert_eq!(index.list_projects()[0].project_path, "/from/cwd");
}

#[test]
fn test_all_unknown_side_file_entries_use_the_log_cwd() {
    let root = TempDir::new().unwrap();
    let project = root.path().join("p");
    write_session(&project, S1, "/from/cwd");
    write_session(&project, S2, "/from/cwd");
    fs::write(
        project.join(SIDE_FILE),
        format!(
            r#"{{"entries":[{{"sessionId":"{S1}","projectPath":"Unknown"}},{{"sessionId":"{S2}","projectPath":"Unknown"}}]}}"#
        ),
    )
    .unwrap();

    let index = DiscoveryIndex::new(root.path());
    let catalog = index.refresh_once().unwrap();
    assert_eq!(catalog.projects["p"].sessions.len(), 2);
    assert_eq!(catalog.projects["p"].project_path, "/from/cwd");
}

#[test]
fn test_malformed_side_file_is_ignored() {
    let root = TempDir::new().unwrap();
    let project = root.path().join("p");
    write_session(&project, S1, "/p");
    fs::write(project.join(SIDE_FILE), "{ definitely not json").unwrap();

    let index = DiscoveryIndex::new(root.path());
    let catalog = index.refresh_once().unwrap();
    assert_eq!(catalog.projects["p"].sessions.len(), 1);
}

#[test]
fn test_agent_logs_home_dir_and_non_uuid_names_are_skipped() {
    let root = TempDir::new().unwrap();
    let project = root.path().join("p");
    write_session(&project, S1, "/p");
    fs::write(project.join("agent-abc123.jsonl"), log_line(S1, "/p")).unwrap();
    fs::write(project.join("notes.jsonl"), "{}").unwrap();
    write_session(&root.path().join("-home-"), S2, "/home");

    let index = DiscoveryIndex::new(root.path());
    let catalog = index.refresh_once().unwrap();
    assert_eq!(catalog.projects.len(), 1);
    assert_eq!(catalog.projects["p"].sessions.len(), 1);
}

#[test]
fn test_missing_projects_dir_is_empty() {
    let root = TempDir::new().unwrap();
    let index = DiscoveryIndex::new(root.path().join("nope"));
    assert!(index.list_projects().is_empty());
    assert!(index.list_sessions("p").is_none());
    assert!(index.refresh_once().unwrap().projects.is_empty());
}

#[test]
fn test_projects_path_that_is_a_file_fails_the_scan() {
    let root = TempDir::new().unwrap();
    let projects = root.path().join("projects");
    fs::write(&projects, "not a directory").unwrap();

    let index = DiscoveryIndex::new(&projects);
    assert!(index.refresh_once().is_err());
    assert!(!index.is_initialized());
    assert!(index.list_projects().is_empty());
}

#[test]
fn test_session_path_falls_back_to_convention() {
    let root = TempDir::new().unwrap();
    let index = DiscoveryIndex::new(root.path());
    assert_eq!(
        index.session_path("p", S1),
        root.path().join("p").join(format!("{S1}.jsonl"))
    );
}

#[test]
fn test_subagent_files_in_both_layouts() {
    let root = TempDir::new().unwrap();
    let project = root.path().join("p");
    write_session(&project, S1, "/p");

    let nested = project.join(S1).join("subagents");
    fs::create_dir_all(&nested).unwrap();
    fs::write(nested.join("agent-aaa.jsonl"), log_line(S1, "/p")).unwrap();
    fs::write(project.join("agent-bbb.jsonl"), log_line(S1, "/p")).unwrap();
    fs::write(project.join("agent-ccc.jsonl"), log_line(S2, "/p")).unwrap();

    let index = DiscoveryIndex::new(root.path());
    let files = index.subagent_files_for_session("p", S1);
    assert_eq!(files.len(), 2);
    assert!(files.iter().any(|f| f.ends_with("subagents/agent-aaa.jsonl")));
    assert!(files.iter().any(|f| f.ends_with("agent-bbb.jsonl")));

    assert!(index.subagent_path("p", S1, "aaa").is_some());
    assert!(index.subagent_path("p", S1, "bbb").is_some());
    assert!(index.subagent_path("p", S1, "ccc").is_none());
    assert!(index.subagent_path("../etc", S1, "aaa").is_none());
}

#[test]
fn test_find_subagent_by_agent_id_alone() {
    let root = TempDir::new().unwrap();
    let project = root.path().join("p");
    write_session(&project, S1, "/p");

    let nested = project.join(S1).join("subagents");
    fs::create_dir_all(&nested).unwrap();
    fs::write(
        nested.join("agent-aaa.jsonl"),
        format!(r#"{{"type":"user","sessionId":"{S1}","subagentType":"Explore"}}"#),
    )
    .unwrap();
    fs::write(project.join("agent-bbb.jsonl"), log_line(S2, "/p")).unwrap();

    let index = DiscoveryIndex::new(root.path());
    let nested_log = index.find_subagent("p", "aaa").unwrap();
    assert_eq!(nested_log.session_id.as_deref(), Some(S1));
    assert_eq!(nested_log.subagent_type.as_deref(), Some("Explore"));
    assert!(nested_log.path.ends_with("subagents/agent-aaa.jsonl"));

    let flat_log = index.find_subagent("p", "bbb").unwrap();
    assert_eq!(flat_log.session_id.as_deref(), Some(S2));
    assert!(flat_log.subagent_type.is_none());

    assert!(index.find_subagent("p", "zzz").is_none());
    assert!(index.find_subagent("p", "../p/agent-aaa").is_none());
    assert!(index.find_subagent("missing", "aaa").is_none());
}

#[tokio::test]
async fn test_background_scanner_publishes_and_stops() {
    let root = TempDir::new().unwrap();
    let project = root.path().join("p");
    write_session(&project, S1, "/p");

    let index = Arc::new(DiscoveryIndex::new(root.path()));
    let handle = index
        .start_background_scanner(Duration::from_millis(20))
        .await;
    assert!(index.is_initialized());
    assert_eq!(index.list_sessions("p").unwrap().len(), 1);

    write_session(&project, S2, "/p");
    let mut seen = false;
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        if index.list_sessions("p").unwrap().len() == 2 {
            seen = true;
            break;
        }
    }
    assert!(seen, "background refresh never picked up the new session");

    assert!(handle.is_running());
    handle.stop().await;
}

#[tokio::test]
async fn test_background_scanner_survives_failed_scans() {
    let root = TempDir::new().unwrap();
    let projects = root.path().join("projects");
    fs::write(&projects, "not yet").unwrap();

    let index = Arc::new(DiscoveryIndex::new(&projects));
    let handle = index
        .start_background_scanner(Duration::from_millis(20))
        .await;
    // the initial scan failed, and a few more ticks fail the same way
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert!(!index.is_initialized());
    assert!(handle.is_running());

    fs::remove_file(&projects).unwrap();
    write_session(&projects.join("p"), S1, "/p");

    let mut published = false;
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        if index.is_initialized() {
            published = true;
            break;
        }
    }
    assert!(published, "no scan was published after the failures");
    assert_eq!(index.list_sessions("p").unwrap().len(), 1);
    assert!(handle.is_running());
    handle.stop().await;
}
