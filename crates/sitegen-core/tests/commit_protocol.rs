//! Integration tests for the blob/tree/commit/ref write path against the
//! in-memory repository host.

use std::sync::Arc;

use sitegen_core::{
    BlobTreeCommitter, FileEntry, FileSet, MemoryRepoHost, RefUpdate, RepoTarget, TreeChange,
};

fn target() -> RepoTarget {
    RepoTarget::new("acme", "landing")
}

/// Test: a large mixed-encoding file set lands as exactly one commit
#[tokio::test]
async fn test_many_files_single_commit() {
    let host = Arc::new(MemoryRepoHost::with_repository(&target()));
    let committer = BlobTreeCommitter::new(host.clone());

    let mut entries: Vec<FileEntry> = (0..40)
        .map(|i| FileEntry::utf8(format!("app/section-{i:02}.tsx"), format!("export default {i}")))
        .collect();
    entries.push(FileEntry::binary("public/favicon.ico", &[0x00, 0x01, 0xfe, 0xff]));
    let files = FileSet::new(entries).unwrap();

    let result = committer
        .commit(&target(), "main", &files, "Initial site")
        .await
        .unwrap();

    assert_eq!(result.branch_advanced, RefUpdate::Created);
    assert_eq!(host.history(&target(), "main").len(), 1);
    assert_eq!(host.tree_paths(&target(), "main").len(), 41);
    assert_eq!(
        host.file(&target(), "main", "public/favicon.ico").unwrap(),
        vec![0x00, 0x01, 0xfe, 0xff]
    );
    assert_eq!(
        host.commit_message(&target(), &result.commit_id).as_deref(),
        Some("Initial site")
    );
}

/// Test: an upsert and a delete in one change list produce one commit
/// parented on the previous tip
#[tokio::test]
async fn test_mixed_changes_chain_onto_tip() {
    let host = Arc::new(MemoryRepoHost::with_repository(&target()));
    let committer = BlobTreeCommitter::new(host.clone());

    let files = FileSet::new(vec![
        FileEntry::utf8("index.html", "v1"),
        FileEntry::utf8("old.html", "gone soon"),
    ])
    .unwrap();
    let first = committer
        .commit(&target(), "main", &files, "v1")
        .await
        .unwrap();

    let second = committer
        .commit_changes(
            &target(),
            "main",
            vec![
                TreeChange::Upsert(FileEntry::utf8("index.html", "v2")),
                TreeChange::Delete {
                    path: "old.html".into(),
                },
            ],
            "v2",
        )
        .await
        .unwrap();

    assert_eq!(second.branch_advanced, RefUpdate::Updated);
    assert_eq!(
        host.history(&target(), "main"),
        vec![second.commit_id, first.commit_id]
    );
    assert_eq!(host.tree_paths(&target(), "main"), vec!["index.html"]);
    assert_eq!(
        host.file(&target(), "main", "index.html").unwrap(),
        b"v2".to_vec()
    );
}
