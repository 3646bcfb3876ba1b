//! End-to-end workflow tests against the in-memory store
//!
//! Run with: cargo test --test engine_tests

use std::fs;
use std::path::Path;
use std::sync::Arc;

use pretty_assertions::assert_eq;

use cloudsync::local::LocalSaves;
use cloudsync::store::MemoryStore;
use cloudsync::{
    CloudClient, CloudSyncError, ContainerLayout, PurgeReport, RemoteStore, SaveInfo, Staleness,
};

const FARM1_INFO: &str = r#"{"farmerName":"Alex","farmName":"Green Acres","daysPlayed":42}"#;

fn write_save(root: &Path, name: &str, info: &str) {
    let dir = root.join(name);
    fs::create_dir_all(dir.join("nested")).unwrap();
    fs::write(dir.join("SaveGameInfo"), info).unwrap();
    fs::write(dir.join(name), b"<save/>").unwrap();
    fs::write(dir.join("BACKUP_SAVE"), b"rollback").unwrap();
    fs::write(dir.join(format!("{}_old", name)), b"rollback").unwrap();
    fs::write(dir.join("nested").join("BACKUP_SAVE"), b"content").unwrap();
}

struct Fixture {
    _dir: tempfile::TempDir,
    root: std::path::PathBuf,
    store: Arc<MemoryStore>,
    client: CloudClient,
    layout: ContainerLayout,
}

async fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("Saves");
    fs::create_dir_all(&root).unwrap();
    write_save(&root, "Farm1", FARM1_INFO);

    let store = Arc::new(MemoryStore::new());
    let layout = store.ensure_layout().await.unwrap();
    let client = CloudClient::new(store.clone(), LocalSaves::with_json_reader(&root));

    Fixture {
        _dir: dir,
        root,
        store,
        client,
        layout,
    }
}

impl Fixture {
    async fn save_folder(&self, name: &str) -> Vec<cloudsync::RemoteEntry> {
        self.store
            .find_folders(&self.layout.saves, name)
            .await
            .unwrap()
    }

    fn seed_backup(&self, cloud_name: &str) {
        let folder = self.store.insert_folder(&self.layout.backups, cloud_name, None);
        self.store.insert_file(&folder, "Farm1", b"old");
    }
}

#[tokio::test]
async fn test_upload_writes_save_info_and_filtered_tree() {
    let fx = fixture().await;
    fx.client.upload_save("Farm1").await.unwrap();

    let folders = fx.save_folder("Farm1").await;
    assert_eq!(folders.len(), 1);
    let folder = &folders[0];
    assert_eq!(
        folder.metadata.as_deref(),
        Some(r#"{"folderName":"Farm1","farmerName":"Alex","farmName":"Green Acres","daysPlayed":42}"#)
    );

    assert_eq!(
        fx.store.child_names(&folder.reference),
        vec!["Farm1", "SaveGameInfo", "nested"]
    );
    let nested = fx.store.find_folders(&folder.reference, "nested").await.unwrap();
    assert_eq!(
        fx.store.file_data(&nested[0].reference, "BACKUP_SAVE"),
        Some(b"content".to_vec())
    );
}

#[tokio::test]
async fn test_get_saves_flags_unreadable_metadata() {
    let fx = fixture().await;
    fx.client.upload_save("Farm1").await.unwrap();
    fx.store.insert_folder(&fx.layout.saves, "NoInfo", None);
    fx.store
        .insert_folder(&fx.layout.saves, "Broken", Some(r#"{"folderName":"Broken"}"#));

    let listing = fx.client.get_saves().await.unwrap();
    assert_eq!(
        listing.saves,
        vec![SaveInfo::new("Farm1", "Alex", "Green Acres", 42)]
    );
    assert!(listing.load_failed);
}

#[tokio::test]
async fn test_download_mirrors_uploaded_tree() {
    let fx = fixture().await;
    fx.client.upload_save("Farm1").await.unwrap();

    let dest = tempfile::tempdir().unwrap();
    fx.client.download_save("Farm1", dest.path()).await.unwrap();

    let save = dest.path().join("Farm1");
    assert_eq!(fs::read(save.join("Farm1")).unwrap(), b"<save/>");
    assert_eq!(fs::read(save.join("nested").join("BACKUP_SAVE")).unwrap(), b"content");
    assert!(!save.join("BACKUP_SAVE").exists());
    assert!(!save.join("Farm1_old").exists());
}

#[tokio::test]
async fn test_download_missing_save_is_not_found() {
    let fx = fixture().await;
    let dest = tempfile::tempdir().unwrap();
    let err = fx.client.download_save("Nope", dest.path()).await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_delete_save_removes_duplicates_and_is_idempotent() {
    let fx = fixture().await;
    fx.client.upload_save("Farm1").await.unwrap();
    fx.client.upload_save("Farm1").await.unwrap();
    assert_eq!(fx.save_folder("Farm1").await.len(), 2);

    fx.client.delete_save("Farm1").await.unwrap();
    assert!(fx.save_folder("Farm1").await.is_empty());

    fx.client.delete_save("Farm1").await.unwrap();
    fx.client.delete_backup("Farm1_[2024-01-01T10.00.00+0000]").await.unwrap();
}

#[tokio::test]
async fn test_upload_failure_drains_siblings() {
    let fx = fixture().await;
    fx.store.fail_uploads_named("Farm1");

    let err = fx.client.upload_save("Farm1").await.unwrap_err();
    assert!(matches!(err.root(), CloudSyncError::Api { status: 500, .. }));

    // the sibling dispatched alongside the failure still landed
    let folder = &fx.save_folder("Farm1").await[0];
    assert!(fx.store.file_data(&folder.reference, "SaveGameInfo").is_some());
    assert!(fx.client.engine().uploads().is_empty());
}

#[tokio::test]
async fn test_backup_of_absent_save_is_noop() {
    let fx = fixture().await;
    assert_eq!(fx.client.backup_save("Farm1").await.unwrap(), None);
    assert!(fx.store.child_names(&fx.layout.backups).is_empty());
    assert!(fx.client.get_backups().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_backup_copies_save_with_decodable_name() {
    let fx = fixture().await;
    fx.client.upload_save("Farm1").await.unwrap();

    let cloud_name = fx.client.backup_save("Farm1").await.unwrap().unwrap();
    let backups = fx.client.get_backups().await.unwrap();
    assert_eq!(backups.len(), 1);
    assert_eq!(backups[0].folder_name, "Farm1");
    assert_eq!(backups[0].cloud_folder_name, cloud_name);

    let copy = &fx
        .store
        .find_folders(&fx.layout.backups, &cloud_name)
        .await
        .unwrap()[0];
    assert_eq!(fx.store.file_data(&copy.reference, "Farm1"), Some(b"<save/>".to_vec()));
    let description = copy.metadata.clone().unwrap();
    assert_eq!(description.matches(':').count(), 1);
    assert!(cloud_name.ends_with(&format!("_[{}]", description.replace(':', ""))));

    let dest = tempfile::tempdir().unwrap();
    fx.client.download_backup(&cloud_name, dest.path()).await.unwrap();
    assert!(dest.path().join(&cloud_name).join("nested").join("BACKUP_SAVE").exists());
}

#[tokio::test]
async fn test_listing_skips_unmatched_names_and_prune_keeps_two() {
    let fx = fixture().await;
    fx.seed_backup("Farm1_[2024-01-01T10.00.00+0000]");
    fx.seed_backup("Farm1_[2024-01-05T10.00.00+0000]");
    fx.seed_backup("Farm1_[2024-01-10T10.00.00+0000]");
    fx.seed_backup("Farm1_random");

    let names: Vec<String> = fx
        .client
        .get_backups()
        .await
        .unwrap()
        .into_iter()
        .map(|b| b.cloud_folder_name)
        .collect();
    assert_eq!(
        names,
        vec![
            "Farm1_[2024-01-10T10.00.00+0000]",
            "Farm1_[2024-01-05T10.00.00+0000]",
            "Farm1_[2024-01-01T10.00.00+0000]",
        ]
    );

    let report = fx.client.purge_backups(2).await;
    assert_eq!(report.deleted, vec!["Farm1_[2024-01-01T10.00.00+0000]"]);
    assert_eq!(report.kept, 2);
    assert!(report.failed.is_empty());
    assert_eq!(
        fx.store.child_names(&fx.layout.backups),
        vec![
            "Farm1_[2024-01-05T10.00.00+0000]",
            "Farm1_[2024-01-10T10.00.00+0000]",
            "Farm1_random",
        ]
    );

    let again = fx.client.purge_backups(2).await;
    assert!(again.deleted.is_empty());
}

#[tokio::test]
async fn test_purge_failure_is_reported_not_raised() {
    let fx = fixture().await;
    fx.seed_backup("Farm1_[2024-01-01T10.00.00+0000]");
    fx.seed_backup("Farm1_[2024-01-02T10.00.00+0000]");
    fx.seed_backup("Farm1_[2024-01-03T10.00.00+0000]");
    fx.store.fail_deletes_named("Farm1_[2024-01-01T10.00.00+0000]");

    let report = fx.client.purge_backups(1).await;
    assert_eq!(report.deleted, vec!["Farm1_[2024-01-02T10.00.00+0000]"]);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, "Farm1_[2024-01-01T10.00.00+0000]");
}

#[tokio::test]
async fn test_spawned_purge_runs_in_background() {
    let fx = fixture().await;
    fx.seed_backup("Farm1_[2024-01-01T10.00.00+0000]");
    fx.seed_backup("Farm1_[2024-01-02T10.00.00+0000]");

    fx.client.spawn_purge(1).await.unwrap();
    assert_eq!(
        fx.store.child_names(&fx.layout.backups),
        vec!["Farm1_[2024-01-02T10.00.00+0000]"]
    );
}

#[tokio::test]
async fn test_replace_backs_up_then_reuploads() {
    let fx = fixture().await;
    fx.client.upload_save("Farm1").await.unwrap();
    write_save(
        &fx.root,
        "Farm1",
        r#"{"farmerName":"Alex","farmName":"Green Acres","daysPlayed":43}"#,
    );

    let settings = cloudsync::config::SyncSettings::default();
    fx.client.replace_save("Farm1", &settings).await.unwrap();

    let folders = fx.save_folder("Farm1").await;
    assert_eq!(folders.len(), 1);
    let info = SaveInfo::from_json(folders[0].metadata.as_deref().unwrap()).unwrap();
    assert_eq!(info.days_played, 43);
    assert_eq!(fx.client.get_backups().await.unwrap().len(), 1);

    fx.client.replace_save_without_backup("Farm1").await.unwrap();
    assert_eq!(fx.client.get_backups().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_busy_save_rejects_download_and_delete() {
    let fx = fixture().await;
    let _guard = fx.client.engine().uploads().register("farm1").unwrap();

    let dest = tempfile::tempdir().unwrap();
    assert!(matches!(
        fx.client.download_save("Farm1", dest.path()).await,
        Err(CloudSyncError::SaveBusy(_))
    ));
    assert!(matches!(
        fx.client.delete_save("Farm1").await,
        Err(CloudSyncError::SaveBusy(_))
    ));
    assert!(matches!(
        fx.client.upload_save("Farm1").await,
        Err(CloudSyncError::SaveBusy(_))
    ));
}

#[tokio::test]
async fn test_restore_replaces_local_save() {
    let fx = fixture().await;
    fx.client.upload_save("Farm1").await.unwrap();

    let local = fx.root.join("Farm1");
    fs::write(local.join("Farm1"), b"<changed/>").unwrap();
    fs::write(local.join("stray"), b"x").unwrap();

    fx.client.restore_save("Farm1").await.unwrap();

    assert_eq!(fs::read(local.join("Farm1")).unwrap(), b"<save/>");
    assert!(!local.join("stray").exists());
    assert!(!fx.root.join("cstemp").exists());
}

#[tokio::test]
async fn test_restore_backup_replaces_local_save() {
    let fx = fixture().await;
    fx.seed_backup("Farm1_[2024-01-01T10.00.00+0000]");
    let backup = fx.client.get_backups().await.unwrap().remove(0);

    fx.client.restore_backup(&backup).await.unwrap();

    let local = fx.root.join("Farm1");
    assert_eq!(fs::read(local.join("Farm1")).unwrap(), b"old");
    assert!(!local.join("SaveGameInfo").exists());
    assert!(!fx.root.join("cstemp").exists());
}

#[tokio::test]
async fn test_restore_of_missing_save_keeps_local_copy() {
    let fx = fixture().await;
    let err = fx.client.restore_save("Farm1").await.unwrap_err();
    assert!(err.is_not_found());
    assert!(fx.root.join("Farm1").join("SaveGameInfo").exists());
    assert!(!fx.root.join("cstemp").exists());
}

#[tokio::test]
async fn test_staleness_against_cloud_copy() {
    let fx = fixture().await;
    assert_eq!(
        fx.client.upload_staleness("Farm1").await.unwrap(),
        Staleness::UpToDate
    );

    fx.client.upload_save("Farm1").await.unwrap();
    write_save(
        &fx.root,
        "Farm1",
        r#"{"farmerName":"Alex","farmName":"Green Acres","daysPlayed":40}"#,
    );
    assert_eq!(
        fx.client.upload_staleness("Farm1").await.unwrap(),
        Staleness::OtherIsNewer {
            current_days: 42,
            incoming_days: 40
        }
    );
    assert_eq!(
        fx.client.download_staleness("Farm1").await.unwrap(),
        Staleness::UpToDate
    );
}

#[tokio::test]
async fn test_signed_out_store_fails_before_any_request() {
    let dir = tempfile::tempdir().unwrap();
    write_save(dir.path(), "Farm1", FARM1_INFO);
    let store = Arc::new(MemoryStore::signed_out());
    let client = CloudClient::new(store.clone(), LocalSaves::with_json_reader(dir.path()));

    assert!(!client.is_authenticated());
    assert!(matches!(
        client.upload_save("Farm1").await,
        Err(CloudSyncError::NotAuthenticated(_))
    ));
    assert!(matches!(
        client.get_backups().await,
        Err(CloudSyncError::NotAuthenticated(_))
    ));
    assert_eq!(client.purge_backups(2).await, PurgeReport::default());
    assert_eq!(store.request_count(), 0);
}
