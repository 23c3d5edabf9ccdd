//! Supplemental repository operations: listings, metadata, file bundles,
//! and the update-for-paths relabel flow.

mod common;

use common::{harness, sha, MockRepo};
use repogen::cache::{CacheStore, CachedManifestEntry, ManifestCacheKey};
use repogen::models::{AppIdentity, ManifestResponse};
use repogen::service::UpdateRevisionRequest;
use repogen::source::{SourceKind, SourceRef};
use std::collections::BTreeMap;
use std::sync::atomic::Ordering;

const REPO_URL: &str = "https://github.com/example/deploys.git";

#[tokio::test]
async fn test_list_apps_discovers_and_caches() {
    let h = harness(|_| {});
    let repo = MockRepo::resolving("main", &sha('a'))
        .with_file("charts/demo/Chart.yaml", "name: demo\n")
        .with_file("overlays/prod/kustomization.yaml", "resources: []\n")
        .with_file("docs/README.md", "nothing here\n");
    h.world.insert(REPO_URL, repo.clone());

    let apps = h.service.list_apps(REPO_URL, "main").await.unwrap();
    assert_eq!(apps.get("charts/demo").map(String::as_str), Some("Template"));
    assert_eq!(apps.get("overlays/prod").map(String::as_str), Some("Overlay"));
    assert!(!apps.contains_key("docs"));

    // Second call is served from the cache without another checkout.
    let checkouts = repo.checkouts.load(Ordering::SeqCst);
    let again = h.service.list_apps(REPO_URL, "main").await.unwrap();
    assert_eq!(again, apps);
    assert_eq!(repo.checkouts.load(Ordering::SeqCst), checkouts);
}

#[tokio::test]
async fn test_git_files_bundles_matching_contents() {
    let h = harness(|_| {});
    let repo = MockRepo::resolving("main", &sha('b'))
        .with_file("apps/a/config.json", "{\"a\": 1}")
        .with_file("apps/b/config.json", "{\"b\": 2}")
        .with_file("apps/b/notes.txt", "skip me");
    h.world.insert(REPO_URL, repo);

    let bundle = h.service.git_files(REPO_URL, "main", "apps/*/config.json").await.unwrap();
    assert_eq!(bundle.files.len(), 2);
    assert_eq!(bundle.files.get("apps/a/config.json").unwrap(), b"{\"a\": 1}");
}

#[tokio::test]
async fn test_git_directories_skips_hidden_by_default() {
    let h = harness(|_| {});
    let repo = MockRepo::resolving("main", &sha('c'))
        .with_file("apps/demo/deploy.yaml", "kind: A\n")
        .with_file(".hidden/config.yaml", "kind: B\n");
    h.world.insert(REPO_URL, repo);

    let listing = h.service.git_directories(REPO_URL, "main").await.unwrap();
    assert!(listing.paths.contains(&"apps".to_string()));
    assert!(listing.paths.contains(&"apps/demo".to_string()));
    assert!(!listing.paths.iter().any(|p| p.starts_with(".hidden")));
}

#[tokio::test]
async fn test_revision_metadata_cached() {
    let h = harness(|_| {});
    h.world.insert(REPO_URL, MockRepo::resolving("main", &sha('d')));

    let metadata = h.service.revision_metadata(REPO_URL, "main").await.unwrap();
    assert_eq!(metadata.author, "Test Author <author@example.com>");
    assert_eq!(metadata.message, "mock commit");

    let again = h.service.revision_metadata(REPO_URL, "main").await.unwrap();
    assert_eq!(again, metadata);
}

fn update_request(source: &SourceRef, app: &AppIdentity, paths: &[&str]) -> UpdateRevisionRequest {
    UpdateRevisionRequest {
        source: source.clone(),
        revision: "main".to_string(),
        sync_revision: sha('1'),
        paths: paths.iter().map(|p| (*p).to_string()).collect(),
        app: app.clone(),
        cross_refs: BTreeMap::new(),
        no_revision_cache: false,
    }
}

// When no watched path changed between revisions, the cached manifests are
// relabeled for the new revision instead of re-rendering.
#[tokio::test]
async fn test_update_revision_moves_cache_when_paths_unchanged() {
    let h = harness(|_| {});
    let old_commit = sha('1');
    let new_commit = sha('2');
    let repo = MockRepo::resolving("main", &new_commit);
    *repo.changed_files.lock().unwrap() = vec!["docs/README.md".to_string()];
    h.world.insert(REPO_URL, repo);

    let source = SourceRef {
        kind: SourceKind::Repo,
        url: REPO_URL.to_string(),
        path: "apps/demo".to_string(),
        target_revision: "main".to_string(),
        ..Default::default()
    };
    let app = AppIdentity { app_name: "demo".to_string(), ..Default::default() };

    // Seed a rendered entry at the old revision.
    let old_key = ManifestCacheKey::new(&source, &old_commit, &BTreeMap::new(), &app);
    let entry = CachedManifestEntry::success(ManifestResponse {
        manifests: vec!["{\"kind\":\"ConfigMap\"}".to_string()],
        revision: old_commit.clone(),
        ..Default::default()
    });
    h.store
        .set(&old_key.store_key(), serde_json::to_vec(&entry).unwrap(), None)
        .await
        .unwrap();

    let response = h
        .service
        .update_revision_for_paths(&update_request(&source, &app, &["apps/demo"]))
        .await
        .unwrap();
    assert_eq!(response.revision, new_commit);
    assert!(!response.changes);

    // The entry now lives at the new key.
    let new_key = ManifestCacheKey::new(&source, &new_commit, &BTreeMap::new(), &app);
    assert!(h.store.get(&new_key.store_key()).await.is_ok());
    assert!(h.store.get(&old_key.store_key()).await.is_err());
}

// A change under a watched path reports `changes` and leaves the cache
// alone.
#[tokio::test]
async fn test_update_revision_reports_changes_for_watched_paths() {
    let h = harness(|_| {});
    let repo = MockRepo::resolving("main", &sha('2'));
    *repo.changed_files.lock().unwrap() = vec!["apps/demo/deploy.yaml".to_string()];
    h.world.insert(REPO_URL, repo);

    let source = SourceRef {
        kind: SourceKind::Repo,
        url: REPO_URL.to_string(),
        path: "apps/demo".to_string(),
        target_revision: "main".to_string(),
        ..Default::default()
    };
    let app = AppIdentity { app_name: "demo".to_string(), ..Default::default() };

    let response = h
        .service
        .update_revision_for_paths(&update_request(&source, &app, &["apps/demo"]))
        .await
        .unwrap();
    assert!(response.changes);
}

// Identical old and new revisions are a no-op.
#[tokio::test]
async fn test_update_revision_same_commit_is_noop() {
    let h = harness(|_| {});
    let commit = sha('1');
    h.world.insert(REPO_URL, MockRepo::resolving("main", &commit));

    let source = SourceRef {
        kind: SourceKind::Repo,
        url: REPO_URL.to_string(),
        path: "apps/demo".to_string(),
        target_revision: "main".to_string(),
        ..Default::default()
    };
    let app = AppIdentity { app_name: "demo".to_string(), ..Default::default() };

    let response = h
        .service
        .update_revision_for_paths(&update_request(&source, &app, &["apps/demo"]))
        .await
        .unwrap();
    assert_eq!(response.revision, commit);
    assert!(!response.changes);
}
