use super::*;
use chrono::{Datelike, TimeZone, Timelike};
use tempfile::TempDir;

#[test]
fn test_fast_hash_is_stable() {
    let a = fast_hash("hello world");
    let b = fast_hash("hello world");
    assert_eq!(a, b);
    assert_eq!(a.len(), 16);
    assert_ne!(a, fast_hash("hello world!"));
}

#[test]
fn test_parse_timestamp_with_z_suffix() {
    let parsed = parse_timestamp("2025-01-15T10:30:00.123Z").unwrap();
    assert_eq!(parsed.year(), 2025);
    assert_eq!(parsed.hour(), 10);
    assert_eq!(parsed.timestamp_subsec_millis(), 123);
}

#[test]
fn test_parse_timestamp_with_offset_normalizes_to_utc() {
    let parsed = parse_timestamp("2025-01-15T12:30:00+02:00").unwrap();
    assert_eq!(parsed, Utc.with_ymd_and_hms(2025, 1, 15, 10, 30, 0).unwrap());
}

#[test]
fn test_parse_timestamp_naive_is_utc() {
    let parsed = parse_timestamp("2025-01-15T10:30:00").unwrap();
    assert_eq!(parsed, Utc.with_ymd_and_hms(2025, 1, 15, 10, 30, 0).unwrap());

    let spaced = parse_timestamp("2025-01-15 10:30:00").unwrap();
    assert_eq!(spaced, parsed);
}

#[test]
fn test_parse_timestamp_rejects_garbage() {
    assert!(parse_timestamp("").is_none());
    assert!(parse_timestamp("   ").is_none());
    assert!(parse_timestamp("invalid-timestamp").is_none());
}

#[test]
fn test_is_valid_uuid() {
    assert!(is_valid_uuid("550e8400-e29b-41d4-a716-446655440000"));
    assert!(!is_valid_uuid("agent-1234"));
    assert!(!is_valid_uuid("not-a-uuid"));
}

#[test]
fn test_truncate_chars_respects_char_boundaries() {
    assert_eq!(truncate_chars("hello", 10), "hello");
    assert_eq!(truncate_chars("hello", 3), "hel");
    assert_eq!(truncate_chars("héllo wörld", 4), "héll");
    assert_eq!(truncate_chars("", 4), "");
}

#[test]
fn test_count_lines() {
    assert_eq!(count_lines(""), 0);
    assert_eq!(count_lines("one"), 1);
    assert_eq!(count_lines("one\ntwo\nthree"), 3);
}

#[test]
fn test_mtime_of_missing_file() {
    let dir = TempDir::new().unwrap();
    assert!(Mtime::of(&dir.path().join("nope.jsonl")).is_missing());
}

#[test]
fn test_mtime_tracks_set_modified() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("file.jsonl");
    std::fs::write(&path, "{}\n").unwrap();

    let t1 = UNIX_EPOCH + Duration::from_secs(1_700_000_000);
    let file = std::fs::File::options().write(true).open(&path).unwrap();
    file.set_modified(t1).unwrap();
    drop(file);

    let mtime = Mtime::of(&path);
    assert_eq!(mtime, Mtime::from_system_time(t1));
    assert_eq!(mtime.0, 1_700_000_000 * 1_000_000_000);
    assert!(mtime.age().unwrap() > Duration::from_secs(60));
}
