mod common;

use common::{avatar_doc, MockFetcher, RecordingSink};
use savestate_engine::codec::FlattenOptions;
use savestate_engine::osc::OscArg;
use savestate_engine::store::{Capture, ProfileStore, StoreError, NAME_FILE, PROFILES_DIR};
use savestate_protocol::{RemoteEndpoint, AVATAR_PARAMETERS_PATH};
use std::fs;
use std::path::Path;

fn capture<'a>(fetcher: &'a MockFetcher, endpoint: Option<&'a RemoteEndpoint>) -> Capture<'a> {
    Capture {
        fetcher,
        endpoint,
        path: AVATAR_PARAMETERS_PATH,
        options: FlattenOptions::default(),
    }
}

fn write_profile(root: &Path, avatar: &str, file: &str) {
    let dir = root.join(PROFILES_DIR).join(avatar);
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join(file), r#"{"/avatar/parameters/Hue":["0.5","f"]}"#).unwrap();
}

#[test]
fn save_assigns_next_index_and_default_name() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = ProfileStore::new(dir.path(), 20);
    let fetcher = MockFetcher::serving(avatar_doc("avtr_A", 0.5));
    let endpoint = RemoteEndpoint::new("127.0.0.1", 9001);

    let first = store.save_profile("avtr_A", "", &capture(&fetcher, Some(&endpoint))).unwrap();
    assert_eq!(first.index, Some(1));
    assert_eq!(first.display_name, "Profile 1");

    let second = store
        .save_profile("avtr_A", "Combat", &capture(&fetcher, Some(&endpoint)))
        .unwrap();
    assert_eq!(second.index, Some(2));
    assert!(dir.path().join("Profiles/avtr_A/2_Combat").is_file());

    let stored = fs::read_to_string(&second.path).unwrap();
    let value: serde_json::Value = serde_json::from_str(&stored).unwrap();
    assert_eq!(value["/avatar/parameters/Hue"], serde_json::json!(["0.5", "f"]));

    let names: Vec<&str> = store.entries().iter().map(|e| e.display_name.as_str()).collect();
    assert_eq!(names, ["Profile 1", "Combat"]);
}

#[test]
fn save_checks_avatar_then_connection_and_writes_nothing_on_failure() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = ProfileStore::new(dir.path(), 20);
    let fetcher = MockFetcher::serving(avatar_doc("avtr_A", 0.5));
    let endpoint = RemoteEndpoint::new("127.0.0.1", 9001);

    assert!(matches!(
        store.save_profile("", "x", &capture(&fetcher, None)),
        Err(StoreError::NoAvatar)
    ));
    assert!(matches!(
        store.save_profile("avtr_A", "x", &capture(&fetcher, None)),
        Err(StoreError::NoConnection)
    ));

    fetcher.set(None);
    assert!(matches!(
        store.save_profile("avtr_A", "x", &capture(&fetcher, Some(&endpoint))),
        Err(StoreError::Fetch(_))
    ));
    let avatar_dir = dir.path().join(PROFILES_DIR).join("avtr_A");
    let leftovers = fs::read_dir(&avatar_dir).map(|d| d.count()).unwrap_or(0);
    assert_eq!(leftovers, 0);
}

#[test]
fn pagination_over_forty_one_profiles() {
    let dir = tempfile::tempdir().unwrap();
    for i in 1..=41 {
        write_profile(dir.path(), "avtr_A", &format!("{i}_P{i}"));
    }
    let mut store = ProfileStore::new(dir.path(), 20);
    store.load_profiles("avtr_A").unwrap();

    assert_eq!(store.total_pages(), 3);
    assert_eq!(store.current_page_profiles().len(), 20);
    assert_eq!(store.current_page_profiles()[0].index, Some(1));
    assert!(!store.prev_page());

    assert!(store.next_page());
    assert_eq!(store.current_page_profiles()[0].index, Some(21));
    assert!(store.next_page());
    assert_eq!(store.current_page_profiles().len(), 1);
    assert_eq!(store.current_page_profiles()[0].index, Some(41));
    assert!(!store.next_page());
    assert_eq!(store.current_page(), 2);

    assert!(store.set_page(0));
    assert!(!store.set_page(3));
    assert_eq!(store.next_index(), 42);
}

#[test]
fn listing_sorts_numerically_and_tolerates_odd_names() {
    let dir = tempfile::tempdir().unwrap();
    write_profile(dir.path(), "avtr_A", "10_Ten");
    write_profile(dir.path(), "avtr_A", "2_Two");
    write_profile(dir.path(), "avtr_A", "loose");
    write_profile(dir.path(), "avtr_A", ".2_Two.tmp");
    write_profile(dir.path(), "avtr_A", NAME_FILE);

    let mut store = ProfileStore::new(dir.path(), 20);
    let entries = store.load_profiles("avtr_A").unwrap();
    let listed: Vec<(Option<u32>, &str)> = entries
        .iter()
        .map(|e| (e.index, e.display_name.as_str()))
        .collect();
    assert_eq!(listed, [(Some(2), "Two"), (Some(10), "Ten"), (None, "loose")]);
    assert_eq!(store.next_index(), 11);
}

#[test]
fn avatar_switch_scenario() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = ProfileStore::new(dir.path(), 20);
    let endpoint = RemoteEndpoint::new("127.0.0.1", 9001);

    let fetcher = MockFetcher::serving(avatar_doc("avtr_A", 0.25));
    store.save_profile("avtr_A", "", &capture(&fetcher, Some(&endpoint))).unwrap();
    store.save_profile("avtr_A", "", &capture(&fetcher, Some(&endpoint))).unwrap();

    fetcher.set(Some(avatar_doc("avtr_B", 0.75)));
    store.load_profiles("avtr_B").unwrap();
    assert!(store.entries().is_empty());
    let saved = store.save_profile("avtr_B", "", &capture(&fetcher, Some(&endpoint))).unwrap();
    assert_eq!(saved.display_name, "Profile 1");

    store.load_profiles("avtr_A").unwrap();
    let names: Vec<&str> = store.entries().iter().map(|e| e.display_name.as_str()).collect();
    assert_eq!(names, ["Profile 1", "Profile 2"]);

    let sink = RecordingSink::default();
    store.apply_profile("avtr_A", "Profile 2", &sink).unwrap();
    assert!(sink
        .sent()
        .contains(&("/avatar/parameters/Hue".to_string(), OscArg::Float(0.25))));
}

#[test]
fn apply_missing_profile_sends_nothing() {
    let dir = tempfile::tempdir().unwrap();
    write_profile(dir.path(), "avtr_A", "1_Only");
    let mut store = ProfileStore::new(dir.path(), 20);
    let sink = RecordingSink::default();

    assert!(matches!(
        store.apply_profile("avtr_A", "Ghost", &sink),
        Err(StoreError::ProfileNotFound(_))
    ));
    assert!(matches!(
        store.apply_profile_at("avtr_A", 9, &sink),
        Err(StoreError::ProfileNotFound(_))
    ));
    assert!(sink.sent().is_empty());

    let report = store.apply_profile_at("avtr_A", 1, &sink).unwrap();
    assert_eq!(report.sent, 1);
}

#[test]
fn apply_with_duplicate_names_uses_first_entry() {
    let dir = tempfile::tempdir().unwrap();
    let avatar_dir = dir.path().join(PROFILES_DIR).join("avtr_A");
    fs::create_dir_all(&avatar_dir).unwrap();
    fs::write(avatar_dir.join("1_Same"), r#"{"/a":["1","i"]}"#).unwrap();
    fs::write(avatar_dir.join("2_Same"), r#"{"/a":["2","i"]}"#).unwrap();

    let mut store = ProfileStore::new(dir.path(), 20);
    let sink = RecordingSink::default();
    store.apply_profile("avtr_A", "Same", &sink).unwrap();
    store.apply_profile_at("avtr_A", 2, &sink).unwrap();
    assert_eq!(
        sink.sent(),
        vec![
            ("/a".to_string(), OscArg::Int(1)),
            ("/a".to_string(), OscArg::Int(2)),
        ]
    );
}

#[test]
fn delete_keeps_other_indices() {
    let dir = tempfile::tempdir().unwrap();
    for f in ["1_A", "2_B", "3_C"] {
        write_profile(dir.path(), "avtr_A", f);
    }
    let mut store = ProfileStore::new(dir.path(), 20);

    assert!(store.delete_profile("avtr_A", "B").unwrap());
    assert!(!store.delete_profile("avtr_A", "B").unwrap());
    let indices: Vec<Option<u32>> = store.entries().iter().map(|e| e.index).collect();
    assert_eq!(indices, [Some(1), Some(3)]);
    assert_eq!(store.next_index(), 4);

    assert!(store.delete_profile_at("avtr_A", 3).unwrap());
    assert!(!store.delete_profile_at("avtr_A", 3).unwrap());
    assert_eq!(store.entries().len(), 1);
}

#[test]
fn rename_keeps_index_and_rejects_collisions() {
    let dir = tempfile::tempdir().unwrap();
    write_profile(dir.path(), "avtr_A", "4_Old");
    write_profile(dir.path(), "avtr_A", "5_Other");
    let mut store = ProfileStore::new(dir.path(), 20);

    let renamed = store.rename_profile("avtr_A", "Old", "New").unwrap();
    assert_eq!(renamed.index, Some(4));
    assert!(dir.path().join("Profiles/avtr_A/4_New").is_file());
    assert!(!dir.path().join("Profiles/avtr_A/4_Old").exists());

    assert!(matches!(
        store.rename_profile("avtr_A", "New", "Other"),
        Err(StoreError::NameTaken(_))
    ));
    assert!(matches!(
        store.rename_profile("avtr_A", "New", "a/b"),
        Err(StoreError::InvalidName(_))
    ));
    assert!(matches!(
        store.rename_profile("avtr_A", "Missing", "Z"),
        Err(StoreError::ProfileNotFound(_))
    ));
}

#[test]
fn override_rewrites_contents_in_place() {
    let dir = tempfile::tempdir().unwrap();
    write_profile(dir.path(), "avtr_A", "3_Keep");
    let mut store = ProfileStore::new(dir.path(), 20);
    let endpoint = RemoteEndpoint::new("127.0.0.1", 9001);
    let fetcher = MockFetcher::serving(avatar_doc("avtr_A", 0.125));

    let entry = store
        .override_profile("avtr_A", "Keep", &capture(&fetcher, Some(&endpoint)))
        .unwrap();
    assert_eq!(entry.index, Some(3));
    let snapshot = store.read_snapshot(&entry).unwrap();
    assert_eq!(snapshot.len(), 3);
    assert_eq!(snapshot.get("/avatar/parameters/Hue").unwrap().value, "0.125");
}

#[test]
fn copy_overwrites_target_and_carries_name_record() {
    let dir = tempfile::tempdir().unwrap();
    write_profile(dir.path(), "avtr_A", "1_First");
    write_profile(dir.path(), "avtr_A", "2_Second");
    let mut store = ProfileStore::new(dir.path(), 20);
    store.save_avatar_name("avtr_A", "Fox").unwrap();

    let target_dir = dir.path().join(PROFILES_DIR).join("avtr_B");
    fs::create_dir_all(&target_dir).unwrap();
    fs::write(target_dir.join("1_First"), "stale").unwrap();

    store.load_profiles("avtr_B").unwrap();
    let copied = store.copy_profiles_from_avatar("avtr_A", "avtr_B").unwrap();
    assert_eq!(copied, 3);
    assert_eq!(store.entries().len(), 2);
    assert_ne!(fs::read_to_string(target_dir.join("1_First")).unwrap(), "stale");
    assert_eq!(store.load_avatar_name("avtr_B").unwrap().as_deref(), Some("Fox"));

    assert_eq!(store.copy_profiles_from_avatar("avtr_missing", "avtr_B").unwrap(), 0);
}

#[test]
fn copy_onto_same_avatar_leaves_files_intact() {
    let dir = tempfile::tempdir().unwrap();
    write_profile(dir.path(), "avtr_A", "1_Combat");
    let mut store = ProfileStore::new(dir.path(), 20);
    store.save_avatar_name("avtr_A", "Fox").unwrap();
    let file = dir.path().join(PROFILES_DIR).join("avtr_A").join("1_Combat");
    let before = fs::read_to_string(&file).unwrap();

    assert!(matches!(
        store.copy_profiles_from_avatar("avtr_A", "avtr_A"),
        Err(StoreError::SameAvatar(_))
    ));
    assert_eq!(fs::read_to_string(&file).unwrap(), before);
    assert_eq!(store.load_avatar_name("avtr_A").unwrap().as_deref(), Some("Fox"));
}

#[test]
fn avatar_name_record_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let store = ProfileStore::new(dir.path(), 20);
    assert_eq!(store.load_avatar_name("avtr_A").unwrap(), None);
    store.save_avatar_name("avtr_A", "Casual").unwrap();
    assert_eq!(store.load_avatar_name("avtr_A").unwrap().as_deref(), Some("Casual"));
    assert!(matches!(store.load_avatar_name(""), Err(StoreError::NoAvatar)));
}
