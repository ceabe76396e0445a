//! Selective sync and root namespace migration

mod common;

use common::{fixture, read_local, write_local, FakeRemote};
use skysync_core::domain::RemotePath;
use skysync_sync::FileStatus;

fn path(p: &str) -> RemotePath {
    RemotePath::new(p.to_string()).unwrap()
}

#[tokio::test]
async fn test_exclude_removes_local_copy_only() {
    let remote = FakeRemote::new();
    remote.put_file("/Photos/a.jpg", b"a");
    remote.put_file("/notes.txt", b"notes");
    let fx = fixture(remote.clone()).await;
    fx.engine.startup().await.unwrap();

    fx.engine.exclude_item(&path("/Photos")).await.unwrap();

    assert!(!fx.root.join("Photos").exists());
    assert!(remote.exists("/Photos/a.jpg"));
    assert_eq!(fx.engine.excluded_items().await.paths(), vec!["/photos".to_string()]);
    assert_eq!(
        fx.engine.file_status(&fx.root.join("Photos")).await.unwrap(),
        FileStatus::Unwatched
    );

    remote.put_file("/Photos/b.jpg", b"b");
    fx.engine.download_sync_cycle().await.unwrap();
    assert!(!fx.root.join("Photos").exists());
}

#[tokio::test]
async fn test_exclusions_survive_restart() {
    let remote = FakeRemote::new();
    remote.put_file("/Big/video.mkv", b"frames");
    let fx = fixture(remote.clone()).await;
    fx.engine.startup().await.unwrap();
    fx.engine.exclude_item(&path("/Big")).await.unwrap();

    let stored = fx.engine.state().excluded_items().await.unwrap();
    assert!(stored.is_excluded("/big/video.mkv"));

    fx.engine.full_sync().await.unwrap();
    assert!(!fx.root.join("Big").exists());
}

#[tokio::test]
async fn test_include_child_of_excluded_folder() {
    let remote = FakeRemote::new();
    remote.put_file("/Photos/a.jpg", b"a");
    remote.put_file("/Photos/Trip/b.jpg", b"b");
    let fx = fixture(remote.clone()).await;
    fx.engine.startup().await.unwrap();
    fx.engine.exclude_item(&path("/Photos")).await.unwrap();

    let included = fx.engine.include_item(&path("/Photos/Trip")).await.unwrap();
    assert_eq!(included, vec![path("/photos/trip")]);
    assert_eq!(
        fx.engine.excluded_items().await.paths(),
        vec!["/photos/a.jpg".to_string()]
    );

    for item in &included {
        fx.engine.download_tree(item).await.unwrap();
    }
    assert_eq!(read_local(&fx.root, "Photos/Trip/b.jpg"), b"b");
    assert!(!fx.root.join("Photos/a.jpg").exists());
}

#[tokio::test]
async fn test_remote_deletion_drops_exclusion() {
    let remote = FakeRemote::new();
    remote.put_file("/Old/x.txt", b"x");
    let fx = fixture(remote.clone()).await;
    fx.engine.startup().await.unwrap();
    fx.engine.exclude_item(&path("/Old")).await.unwrap();

    remote.delete("/Old");
    fx.engine.download_sync_cycle().await.unwrap();

    assert!(fx.engine.excluded_items().await.is_empty());
    assert!(fx.engine.state().excluded_items().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_items_created_in_excluded_folder_are_renamed() {
    let remote = FakeRemote::new();
    remote.put_file("/A/remote.txt", b"remote");
    let fx = fixture(remote.clone()).await;
    fx.engine.startup().await.unwrap();
    fx.engine.exclude_item(&path("/A")).await.unwrap();

    write_local(&fx.root, "A/x.txt", b"one");
    fx.engine.upload_local_scan().await.unwrap();

    assert!(!fx.root.join("A").exists());
    assert_eq!(read_local(&fx.root, "A (selective sync conflict)/x.txt"), b"one");
    assert_eq!(remote.file_content("/A (selective sync conflict)/x.txt").unwrap(), b"one");

    write_local(&fx.root, "A/y.txt", b"two");
    fx.engine.upload_local_scan().await.unwrap();

    assert_eq!(read_local(&fx.root, "A (selective sync conflict 1)/y.txt"), b"two");
    assert_eq!(remote.file_content("/A (selective sync conflict 1)/y.txt").unwrap(), b"two");
    assert_eq!(remote.file_content("/A/remote.txt").unwrap(), b"remote");
    assert!(!remote.exists("/A/x.txt"));
    assert!(!remote.exists("/A/y.txt"));
}

#[tokio::test]
async fn test_joining_team_moves_items_below_home_folder() {
    let remote = FakeRemote::new();
    remote.put_file("/notes.txt", b"notes");
    remote.put_file("/Photos/cat.jpg", b"meow");
    remote.put_file("/Archive/2019.zip", b"zip");
    let fx = fixture(remote.clone()).await;
    fx.engine.startup().await.unwrap();
    fx.engine.exclude_item(&path("/Archive")).await.unwrap();

    remote.join_team("/Robin Smith");
    fx.engine.startup().await.unwrap();

    assert_eq!(read_local(&fx.root, "Robin Smith/notes.txt"), b"notes");
    assert_eq!(read_local(&fx.root, "Robin Smith/Photos/cat.jpg"), b"meow");
    assert!(!fx.root.join("notes.txt").exists());
    assert!(!fx.root.join("Robin Smith/Archive").exists());
    assert_eq!(
        fx.engine.excluded_items().await.paths(),
        vec!["/robin smith/archive".to_string()]
    );
    assert_eq!(
        fx.engine.state().namespace_id().await.unwrap().as_deref(),
        Some("ns:team")
    );
    assert!(remote.paths().iter().all(|p| !p.contains("conflicting copy")));
    assert!(fx.engine.scan_local_changes().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_leaving_team_moves_home_folder_to_root() {
    let remote = FakeRemote::new();
    remote.put_file("/notes.txt", b"notes");
    remote.put_file("/Archive/2019.zip", b"zip");
    remote.join_team("/Robin Smith");
    remote.put_file("/Team Docs/plan.txt", b"plan");
    remote.put_file("/Team Media/launch.mkv", b"frames");
    let fx = fixture(remote.clone()).await;
    fx.engine.startup().await.unwrap();
    fx.engine.exclude_item(&path("/Robin Smith/Archive")).await.unwrap();
    fx.engine.exclude_item(&path("/Team Media")).await.unwrap();
    assert_eq!(read_local(&fx.root, "Robin Smith/notes.txt"), b"notes");

    remote.leave_team();
    fx.engine.startup().await.unwrap();

    assert_eq!(read_local(&fx.root, "notes.txt"), b"notes");
    assert!(!fx.root.join("Robin Smith").exists());
    assert!(!fx.root.join("Archive").exists());
    assert_eq!(read_local(&fx.root, "Team Docs/plan.txt"), b"plan");
    assert_eq!(remote.file_content("/Team Docs/plan.txt").unwrap(), b"plan");
    assert_eq!(
        fx.engine.excluded_items().await.paths(),
        vec!["/archive".to_string()]
    );
    assert_eq!(
        fx.engine.state().namespace_id().await.unwrap().as_deref(),
        Some("ns:home")
    );
    assert!(remote.paths().iter().all(|p| !p.contains("conflicting copy")));
    assert!(fx.engine.scan_local_changes().await.unwrap().is_empty());
}
