//! End-to-end behavior against real directories and under concurrency.

use crate::{Gateway, ListOptions, Request, SearchOptions};
use async_trait::async_trait;
use futures::future::join_all;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Notify;
use warden_core::{ErrorCode, GatewayConfig, ManualClock, TenantId, TenantOverrides, WardenError};
use warden_storage::{DirEntry, MemoryStorage, Metadata, StorageBackend, StorageResult};

fn tenant(id: &str) -> TenantId {
    TenantId::new(id).unwrap()
}

async fn local_gateway(dir: &TempDir, config: GatewayConfig) -> Gateway {
    Gateway::builder(GatewayConfig {
        base_dir: dir.path().to_path_buf(),
        ..config
    })
    .open()
    .await
    .unwrap()
}

fn sandbox_root(dir: &TempDir, t: &TenantId) -> PathBuf {
    std::fs::canonicalize(dir.path())
        .unwrap()
        .join(t.sandbox_key())
}

fn roomy() -> GatewayConfig {
    GatewayConfig::default().with_rate(100_000, 1.0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stall {
    Never,
    /// Hang before touching storage
    Before,
    /// Apply the change, then hang like a call stuck on the blocking pool
    After,
}

/// In-memory tree whose content-changing calls can be made to hang
#[derive(Debug)]
struct StallingStorage {
    inner: MemoryStorage,
    stall: Mutex<Stall>,
    entered: Notify,
}

impl StallingStorage {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: MemoryStorage::new(),
            stall: Mutex::new(Stall::Never),
            entered: Notify::new(),
        })
    }

    fn set(&self, stall: Stall) {
        *self.stall.lock().unwrap() = stall;
    }

    async fn gated(&self, op: impl Future<Output = StorageResult<()>> + Send) -> StorageResult<()> {
        let stall = *self.stall.lock().unwrap();
        match stall {
            Stall::Never => return op.await,
            Stall::Before => drop(op),
            Stall::After => op.await?,
        }
        self.entered.notify_one();
        std::future::pending().await
    }
}

#[async_trait]
impl StorageBackend for StallingStorage {
    async fn metadata(&self, path: &Path) -> StorageResult<Metadata> {
        self.inner.metadata(path).await
    }

    async fn symlink_metadata(&self, path: &Path) -> StorageResult<Metadata> {
        self.inner.symlink_metadata(path).await
    }

    async fn canonicalize(&self, path: &Path) -> StorageResult<PathBuf> {
        self.inner.canonicalize(path).await
    }

    async fn read(&self, path: &Path) -> StorageResult<Vec<u8>> {
        self.inner.read(path).await
    }

    async fn write(&self, path: &Path, data: &[u8]) -> StorageResult<()> {
        self.gated(self.inner.write(path, data)).await
    }

    async fn append(&self, path: &Path, data: &[u8]) -> StorageResult<()> {
        self.gated(self.inner.append(path, data)).await
    }

    async fn create_dir(&self, path: &Path) -> StorageResult<()> {
        self.inner.create_dir(path).await
    }

    async fn create_dir_all(&self, path: &Path) -> StorageResult<()> {
        self.inner.create_dir_all(path).await
    }

    async fn remove_file(&self, path: &Path) -> StorageResult<()> {
        self.gated(self.inner.remove_file(path)).await
    }

    async fn remove_dir(&self, path: &Path) -> StorageResult<()> {
        self.inner.remove_dir(path).await
    }

    async fn remove_dir_all(&self, path: &Path) -> StorageResult<()> {
        self.gated(self.inner.remove_dir_all(path)).await
    }

    async fn rename(&self, from: &Path, to: &Path) -> StorageResult<()> {
        self.gated(self.inner.rename(from, to)).await
    }

    async fn read_dir(&self, path: &Path) -> StorageResult<Vec<DirEntry>> {
        self.inner.read_dir(path).await
    }
}

async fn stalling_gateway(config: GatewayConfig) -> (Gateway, Arc<StallingStorage>) {
    let storage = StallingStorage::new();
    let gateway = Gateway::builder(config.with_rate(1_000, 1.0))
        .with_backend(storage.clone())
        .with_clock(Arc::new(ManualClock::new()))
        .open()
        .await
        .unwrap();
    (gateway, storage)
}

/// Poll `op` until the storage call inside it hangs
async fn until_stalled<F: Future + Unpin>(storage: &StallingStorage, op: &mut F) {
    tokio::select! {
        _ = op => panic!("operation finished instead of stalling"),
        () = storage.entered.notified() => {}
    }
}

#[tokio::test]
async fn test_local_roundtrip_and_reopen() {
    let dir = TempDir::new().unwrap();
    let t = tenant("alice");
    {
        let gateway = local_gateway(&dir, roomy()).await;
        gateway.write(&t, "notes/a.txt", b"first").await.unwrap();
        gateway.write(&t, "empty.txt", b"").await.unwrap();

        let read = gateway.read(&t, "empty.txt").await.unwrap();
        assert!(read.content.is_empty());
        assert_eq!(read.size, 0);
        assert_eq!(gateway.usage(&t).await.unwrap().file_count, 2);
    }

    // Usage is rebuilt from disk
    let gateway = local_gateway(&dir, roomy()).await;
    let usage = gateway.usage(&t).await.unwrap();
    assert_eq!(usage.bytes_used, 5);
    assert_eq!(usage.file_count, 2);
    assert_eq!(
        gateway.read(&t, "notes/a.txt").await.unwrap().content,
        b"first"
    );
    assert!(sandbox_root(&dir, &t).join("notes/a.txt").is_file());
}

#[tokio::test]
async fn test_cross_tenant_traversal() {
    let dir = TempDir::new().unwrap();
    let gateway = local_gateway(&dir, roomy()).await;
    let a = tenant("tenantA");
    let b = tenant("tenantB");
    gateway.write(&b, "secret.txt", b"classified").await.unwrap();

    let attempts = [
        format!("../{}/secret.txt", b.sandbox_key()),
        "../tenantB/secret.txt".to_string(),
        "/etc/passwd".to_string(),
        "a/../../x.txt".to_string(),
    ];
    for path in &attempts {
        let err = gateway.read(&a, path).await.unwrap_err();
        assert!(
            matches!(err, WardenError::PathEscape { .. } | WardenError::InvalidPath { .. }),
            "{path}: {err:?}"
        );
        assert_ne!(err.public().code, ErrorCode::PathEscape);
    }
    assert!(gateway.write(&a, &attempts[0], b"overwrite").await.is_err());
    assert_eq!(
        gateway.read(&b, "secret.txt").await.unwrap().content,
        b"classified"
    );
}

#[cfg(unix)]
#[tokio::test]
async fn test_symlink_escape_rejected() {
    let dir = TempDir::new().unwrap();
    let outside = TempDir::new().unwrap();
    std::fs::write(outside.path().join("secret.txt"), b"outside").unwrap();

    let gateway = local_gateway(&dir, roomy()).await;
    let t = tenant("alice");
    gateway.usage(&t).await.unwrap();
    let root = sandbox_root(&dir, &t);
    std::os::unix::fs::symlink(outside.path(), root.join("link")).unwrap();
    std::os::unix::fs::symlink(outside.path().join("secret.txt"), root.join("leak.txt")).unwrap();

    for path in ["link/secret.txt", "leak.txt", "link"] {
        let err = gateway.read(&t, path).await.unwrap_err();
        assert!(err.is_escape(), "{path}: {err:?}");
        assert_eq!(err.public().code, ErrorCode::NotFound);
    }
    assert!(gateway.write(&t, "link/new.txt", b"x").await.unwrap_err().is_escape());
    assert!(gateway.delete(&t, "leak.txt", false).await.unwrap_err().is_escape());
    assert!(!outside.path().join("new.txt").exists());
    assert!(outside.path().join("secret.txt").exists());

    // Links show up in searches but are never descended into
    let found = gateway
        .search(&t, ".", &SearchOptions::pattern("*").with_directories())
        .await
        .unwrap();
    assert!(found.matches.iter().all(|m| !m.path.contains("secret")));
}

#[cfg(unix)]
#[tokio::test]
async fn test_internal_symlink_allowed() {
    let dir = TempDir::new().unwrap();
    let gateway = local_gateway(&dir, roomy()).await;
    let t = tenant("alice");
    gateway.write(&t, "real/data.txt", b"inside").await.unwrap();
    let root = sandbox_root(&dir, &t);
    std::os::unix::fs::symlink(root.join("real"), root.join("alias")).unwrap();

    let read = gateway.read(&t, "alias/data.txt").await.unwrap();
    assert_eq!(read.content, b"inside");
    assert_eq!(read.path, "alias/data.txt");
}

#[tokio::test]
async fn test_quota_overflow_scenario() {
    let dir = TempDir::new().unwrap();
    let gateway = local_gateway(&dir, roomy().with_quota(1000, 100)).await;
    let t = tenant("alice");
    gateway.write(&t, "base.txt", &[b'a'; 950]).await.unwrap();

    let err = gateway.write(&t, "sub/extra.txt", &[b'b'; 100]).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::QuotaExceeded);
    assert_eq!(gateway.usage(&t).await.unwrap().bytes_used, 950);
    assert!(!sandbox_root(&dir, &t).join("sub").exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_writes_same_path() {
    let dir = TempDir::new().unwrap();
    let gateway = local_gateway(&dir, roomy()).await;
    let t = tenant("alice");

    let payloads: Vec<Vec<u8>> = (1..=16).map(|n| vec![b'x'; n * 10]).collect();
    let results = join_all(payloads.iter().map(|p| gateway.write(&t, "same.txt", p))).await;
    assert!(results.iter().all(Result::is_ok));

    let read = gateway.read(&t, "same.txt").await.unwrap();
    assert!(payloads.contains(&read.content));
    let usage = gateway.usage(&t).await.unwrap();
    assert_eq!(usage.bytes_used, read.size);
    assert_eq!(usage.file_count, 1);
    assert_eq!(usage.reserved_bytes, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_writes_never_overshoot_quota() {
    let config = GatewayConfig::new("/ws")
        .with_rate(1_000, 1.0)
        .with_quota(1000, 100);
    let gateway = Gateway::builder(config)
        .with_backend(Arc::new(MemoryStorage::new()))
        .open()
        .await
        .unwrap();
    let t = tenant("alice");

    let names: Vec<String> = (0..20).map(|i| format!("f{i}.txt")).collect();
    let results = join_all(names.iter().map(|n| gateway.write(&t, n, &[0; 100]))).await;
    let accepted = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(accepted, 10);
    assert!(results
        .iter()
        .filter_map(|r| r.as_ref().err())
        .all(|e| e.code() == ErrorCode::QuotaExceeded));

    let usage = gateway.usage(&t).await.unwrap();
    assert_eq!(usage.bytes_used, 1000);
    assert_eq!(usage.file_count, 10);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_opposite_moves() {
    let dir = TempDir::new().unwrap();
    let gateway = local_gateway(&dir, roomy()).await;
    let t = tenant("alice");
    gateway.write(&t, "x.txt", b"x").await.unwrap();
    gateway.write(&t, "y.txt", b"y").await.unwrap();

    let (a, b) = tokio::time::timeout(Duration::from_secs(10), async {
        tokio::join!(
            gateway.r#move(&t, "x.txt", "y.txt"),
            gateway.r#move(&t, "y.txt", "x.txt")
        )
    })
    .await
    .unwrap();
    assert!(a.is_ok() || b.is_ok());

    let root = sandbox_root(&dir, &t);
    let remaining = [root.join("x.txt").exists(), root.join("y.txt").exists()];
    assert_eq!(remaining.iter().filter(|e| **e).count(), 1);
    let usage = gateway.usage(&t).await.unwrap();
    assert_eq!(usage.file_count, 1);
    assert_eq!(usage.bytes_used, 1);
}

#[tokio::test]
async fn test_rate_limit_and_refill() {
    let clock = Arc::new(ManualClock::new());
    let gateway = Gateway::builder(GatewayConfig::new("/ws").with_rate(3, 1.0))
        .with_backend(Arc::new(MemoryStorage::new()))
        .with_clock(clock.clone())
        .open()
        .await
        .unwrap();
    let t = tenant("alice");
    let other = tenant("bob");

    for _ in 0..3 {
        gateway.stat(&t, ".").await.unwrap();
    }
    let err = gateway.stat(&t, ".").await.unwrap_err();
    match err {
        WardenError::RateLimited { retry_after_ms } => assert!(retry_after_ms > 0),
        other => panic!("expected RateLimited, got {other:?}"),
    }
    // Buckets are per tenant
    assert!(gateway.stat(&other, ".").await.is_ok());

    clock.advance(Duration::from_secs(1));
    assert!(gateway.stat(&t, ".").await.is_ok());
    assert!(gateway.stat(&t, ".").await.is_err());
}

#[tokio::test]
async fn test_tenant_overrides_apply() {
    let overrides = TenantOverrides {
        max_bytes: Some(10),
        max_files: Some(1),
        ..TenantOverrides::default()
    };
    let gateway = Gateway::builder(
        GatewayConfig::new("/ws")
            .with_rate(100, 1.0)
            .with_tenant("small", overrides),
    )
    .with_backend(Arc::new(MemoryStorage::new()))
    .open()
    .await
    .unwrap();

    let small = tenant("small");
    gateway.write(&small, "a.txt", b"1").await.unwrap();
    assert_eq!(
        gateway.write(&small, "b.txt", b"2").await.unwrap_err().code(),
        ErrorCode::QuotaExceeded
    );
    assert!(gateway.write(&tenant("large"), "b.txt", b"2").await.is_ok());
}

#[tokio::test]
async fn test_execute_session() {
    let dir = TempDir::new().unwrap();
    let gateway = local_gateway(&dir, roomy()).await;
    let t = tenant("alice");

    let steps = [
        r#"{"op": "mkdir", "path": "docs"}"#,
        r#"{"op": "write", "path": "docs/a.md", "content": "hello"}"#,
        r#"{"op": "append", "path": "docs/a.md", "content": " world"}"#,
        r#"{"op": "copy", "from": "docs/a.md", "to": "docs/b.md"}"#,
        r#"{"op": "move", "from": "docs/b.md", "to": "c.md"}"#,
        r#"{"op": "list", "path": "docs"}"#,
        r#"{"op": "search", "pattern": "*.md"}"#,
    ];
    for step in steps {
        let response = gateway.execute_json(&t, step).await;
        assert!(response.ok, "{step}: {response:?}");
    }

    let read = gateway
        .execute(
            &t,
            Request::Read {
                path: "c.md".to_string(),
                max_lines: None,
            },
        )
        .await;
    assert_eq!(read.data.unwrap()["content"], "hello world");

    let removed = gateway
        .execute_json(&t, r#"{"op": "delete", "path": "docs", "recursive": true}"#)
        .await;
    assert!(removed.ok);
    let usage = gateway.usage(&t).await.unwrap();
    assert_eq!(usage.file_count, 1);
    assert_eq!(usage.bytes_used, 11);
}

#[tokio::test]
async fn test_scratch_names_rejected_and_swept() {
    let dir = TempDir::new().unwrap();
    let t = tenant("alice");
    let config = roomy().with_quota(1000, 100);
    {
        let gateway = local_gateway(&dir, config.clone()).await;
        for path in [".warden-tmp-b.txt", "d/.warden-tmp-a.txt"] {
            let err = gateway.write(&t, path, &[7; 900]).await.unwrap_err();
            assert_eq!(err.code(), ErrorCode::InvalidPath, "{path}");
        }
        gateway.write(&t, "d/a.txt", &[7; 900]).await.unwrap();
        assert_eq!(
            gateway
                .r#move(&t, "d/a.txt", "d/.warden-tmp-a.txt")
                .await
                .unwrap_err()
                .code(),
            ErrorCode::InvalidPath
        );
        let listing = gateway
            .list(
                &t,
                "d",
                ListOptions {
                    show_hidden: true,
                    ..ListOptions::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(listing.entries.len(), 1);
    }

    // Left behind by a write that never finished
    let root = sandbox_root(&dir, &t);
    let leftover = root.join("d/.warden-tmp-0f1e2d");
    std::fs::write(&leftover, [0u8; 500]).unwrap();

    let gateway = local_gateway(&dir, config).await;
    let usage = gateway.usage(&t).await.unwrap();
    assert_eq!(usage.bytes_used, 900);
    assert_eq!(usage.file_count, 1);
    assert!(!leftover.exists());

    let receipt = gateway.delete(&t, "d", true).await.unwrap();
    assert_eq!(receipt.bytes_freed, 900);
    assert_eq!(gateway.usage(&t).await.unwrap().bytes_used, 0);
    assert!(gateway.write(&t, "e.txt", &[1; 900]).await.is_ok());
}

#[tokio::test]
async fn test_timed_out_mutations_recount_usage() {
    let (gateway, storage) = stalling_gateway(GatewayConfig::new("/ws").with_io_timeout(50)).await;
    let t = tenant("alice");
    gateway.write(&t, "a.txt", &[1; 100]).await.unwrap();

    // The write lands after the caller has given up on it
    storage.set(Stall::After);
    let err = gateway.write(&t, "b.txt", &[2; 300]).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::StorageError);
    storage.set(Stall::Never);

    let usage = gateway.usage(&t).await.unwrap();
    assert_eq!(usage.bytes_used, 400);
    assert_eq!(usage.file_count, 2);
    assert_eq!(usage.reserved_bytes, 0);

    storage.set(Stall::After);
    let err = gateway.r#move(&t, "b.txt", "a.txt").await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::StorageError);
    storage.set(Stall::After);
    assert!(gateway.delete(&t, "a.txt", false).await.is_err());
    storage.set(Stall::Never);

    let usage = gateway.usage(&t).await.unwrap();
    assert_eq!(usage.bytes_used, 0);
    assert_eq!(usage.file_count, 0);
    assert_eq!(gateway.lock_stats().tracked_tenants, 0);
}

#[tokio::test]
async fn test_lock_timeout_surfaces_as_retryable() {
    let (gateway, storage) = stalling_gateway(GatewayConfig::new("/ws").with_lock_timeout(50)).await;
    let t = tenant("alice");
    gateway.write(&t, "busy.txt", b"old").await.unwrap();
    gateway.write(&t, "other.txt", b"o").await.unwrap();

    storage.set(Stall::Before);
    let mut holder = Box::pin(gateway.write(&t, "busy.txt", b"new"));
    until_stalled(&storage, &mut holder).await;
    storage.set(Stall::Never);

    let err = gateway.write(&t, "busy.txt", b"again").await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::LockTimeout);
    assert!(err.is_retryable());
    assert!(err.public().retryable);

    let err = gateway.r#move(&t, "other.txt", "busy.txt").await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::LockTimeout);

    // Unrelated paths proceed
    gateway.write(&t, "free.txt", b"f").await.unwrap();
    assert_eq!(gateway.lock_stats().timed_out, 2);

    drop(holder);
    gateway.write(&t, "busy.txt", b"again").await.unwrap();
    assert_eq!(gateway.read(&t, "busy.txt").await.unwrap().content, b"again");
}

#[tokio::test]
async fn test_cancelled_write_releases_lock_and_claim() {
    let (gateway, storage) = stalling_gateway(GatewayConfig::new("/ws").with_lock_timeout(50)).await;
    let t = tenant("alice");

    storage.set(Stall::Before);
    let mut cancelled = Box::pin(gateway.write(&t, "doc.txt", &[1; 400]));
    until_stalled(&storage, &mut cancelled).await;
    storage.set(Stall::Never);

    // Lock taken and quota claimed, storage not yet touched
    let usage = gateway.usage(&t).await.unwrap();
    assert_eq!(usage.reserved_bytes, 400);
    assert_eq!(usage.reserved_files, 1);
    assert_eq!(gateway.lock_stats().tracked_paths, 1);

    drop(cancelled);

    let usage = gateway.usage(&t).await.unwrap();
    assert_eq!(usage.reserved_bytes, 0);
    assert_eq!(usage.reserved_files, 0);
    assert_eq!(usage.bytes_used, 0);
    let stats = gateway.lock_stats();
    assert_eq!(stats.tracked_paths, 0);
    assert_eq!(stats.tracked_tenants, 0);

    // Well inside the 50ms lock timeout
    gateway.write(&t, "doc.txt", &[2; 400]).await.unwrap();
    assert_eq!(gateway.usage(&t).await.unwrap().bytes_used, 400);
}
