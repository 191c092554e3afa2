//! 校验和登记表 - 为没有原生校验和属性的存储后端保存已计算的校验和

use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// 数据库行
#[derive(Debug, sqlx::FromRow)]
struct ChecksumRow {
    object_size: i64,
    etag: Option<String>,
    modified_at: Option<i64>,
    checksum: String,
}

/// 存储报告的对象版本
///
/// 大小相同的覆盖写只能靠 ETag 或修改时间发现，两者都没有的对象无法判断记录是否过期。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectVersion {
    pub size: u64,
    pub etag: Option<String>,
    /// 修改时间（Unix 纳秒）
    pub modified: Option<i64>,
}

impl ObjectVersion {
    pub fn is_verifiable(&self) -> bool {
        self.etag.is_some() || self.modified.is_some()
    }

    fn matches(&self, row: &ChecksumRow) -> bool {
        row.object_size == self.size as i64
            && row.etag == self.etag
            && row.modified_at == self.modified
    }
}

/// 校验和登记表
///
/// 以 (仓库名, 对象路径) 为键。对象的大小、ETag 或修改时间任何一项与记录不同，
/// 旧记录即失效；上传覆盖对象时由仓库主动删除记录。
#[derive(Clone)]
pub struct ChecksumRegistry {
    db: Arc<SqlitePool>,
}

impl ChecksumRegistry {
    /// 打开（必要时创建）登记表数据库文件
    pub async fn open(db_path: &Path) -> Result<Self, sqlx::Error> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        // Windows 路径需要转换反斜杠为正斜杠
        let db_path_str = db_path.to_string_lossy().replace('\\', "/");

        let db = SqlitePoolOptions::new()
            .max_connections(5) // SQLite 单文件，不需要太多连接
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(&format!("sqlite:{}?mode=rwc", db_path_str))
            .await?;

        sqlx::migrate!("./migrations").run(&db).await?;

        Ok(Self { db: Arc::new(db) })
    }

    /// 内存数据库（只有一个连接，连接关闭数据即丢失）
    pub async fn in_memory() -> Result<Self, sqlx::Error> {
        let db = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;

        sqlx::migrate!("./migrations").run(&db).await?;

        Ok(Self { db: Arc::new(db) })
    }

    /// 查询对象的校验和，版本不一致或无法核对版本时视为没有记录
    pub async fn lookup(
        &self,
        repository: &str,
        object_path: &str,
        version: &ObjectVersion,
    ) -> Result<Option<String>, sqlx::Error> {
        if !version.is_verifiable() {
            return Ok(None);
        }

        let row = sqlx::query_as::<_, ChecksumRow>(
            "SELECT object_size, etag, modified_at, checksum FROM object_checksums WHERE repository = ? AND object_path = ?",
        )
        .bind(repository)
        .bind(object_path)
        .fetch_optional(&*self.db)
        .await?;

        Ok(row.filter(|r| version.matches(r)).map(|r| r.checksum))
    }

    /// 记录对象的校验和
    ///
    /// 无法核对版本的对象不记录。
    pub async fn record(
        &self,
        repository: &str,
        object_path: &str,
        version: &ObjectVersion,
        checksum: &str,
    ) -> Result<(), sqlx::Error> {
        if !version.is_verifiable() {
            debug!("对象没有 ETag 和修改时间, 不登记校验和: {}", object_path);
            return Ok(());
        }
        let now = chrono::Utc::now().timestamp();

        sqlx::query(
            r#"INSERT INTO object_checksums (repository, object_path, object_size, etag, modified_at, checksum, computed_at)
               VALUES (?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(repository, object_path) DO UPDATE SET
                   object_size = excluded.object_size,
                   etag = excluded.etag,
                   modified_at = excluded.modified_at,
                   checksum = excluded.checksum,
                   computed_at = excluded.computed_at"#,
        )
        .bind(repository)
        .bind(object_path)
        .bind(version.size as i64)
        .bind(version.etag.as_deref())
        .bind(version.modified)
        .bind(checksum)
        .bind(now)
        .execute(&*self.db)
        .await?;

        debug!("登记校验和: {} {} = {}", repository, object_path, checksum);
        Ok(())
    }

    /// 删除对象的校验和记录
    pub async fn forget(&self, repository: &str, object_path: &str) -> Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM object_checksums WHERE repository = ? AND object_path = ?")
            .bind(repository)
            .bind(object_path)
            .execute(&*self.db)
            .await?;

        Ok(())
    }

    /// 关闭连接池
    pub async fn close(&self) {
        self.db.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn version(size: u64, etag: &str, modified: i64) -> ObjectVersion {
        ObjectVersion {
            size,
            etag: Some(etag.to_string()),
            modified: Some(modified),
        }
    }

    #[tokio::test]
    async fn test_record_and_lookup() {
        let registry = ChecksumRegistry::in_memory().await.unwrap();
        let v = version(10, "e1", 100);

        registry
            .record("fs:/data", "/coll/a.txt", &v, "sha2:abc=")
            .await
            .unwrap();

        let found = registry.lookup("fs:/data", "/coll/a.txt", &v).await.unwrap();
        assert_eq!(found.as_deref(), Some("sha2:abc="));

        // 其它仓库互不影响
        let other = registry.lookup("fs:/other", "/coll/a.txt", &v).await.unwrap();
        assert!(other.is_none());
    }

    #[tokio::test]
    async fn test_version_change_invalidates_record() {
        let registry = ChecksumRegistry::in_memory().await.unwrap();
        registry
            .record("r", "/a", &version(10, "e1", 100), "sha2:abc=")
            .await
            .unwrap();

        assert!(registry.lookup("r", "/a", &version(11, "e1", 100)).await.unwrap().is_none());
        // 大小相同的覆盖写
        assert!(registry.lookup("r", "/a", &version(10, "e2", 100)).await.unwrap().is_none());
        assert!(registry.lookup("r", "/a", &version(10, "e1", 101)).await.unwrap().is_none());
        let no_etag = ObjectVersion {
            etag: None,
            ..version(10, "e1", 100)
        };
        assert!(registry.lookup("r", "/a", &no_etag).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unverifiable_objects_are_not_recorded() {
        let registry = ChecksumRegistry::in_memory().await.unwrap();
        let bare = ObjectVersion {
            size: 10,
            ..Default::default()
        };

        registry.record("r", "/a", &bare, "sha2:abc=").await.unwrap();
        assert!(registry.lookup("r", "/a", &bare).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_forget_and_overwrite() {
        let registry = ChecksumRegistry::in_memory().await.unwrap();
        let v = version(10, "e1", 100);
        registry.record("r", "/a", &v, "sha2:old=").await.unwrap();
        registry.record("r", "/a", &v, "sha2:new=").await.unwrap();
        assert_eq!(
            registry.lookup("r", "/a", &v).await.unwrap().as_deref(),
            Some("sha2:new=")
        );

        registry.forget("r", "/a").await.unwrap();
        assert!(registry.lookup("r", "/a", &v).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_open_creates_database_file() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("state").join("checksums.db");

        let registry = ChecksumRegistry::open(&db_path).await.unwrap();
        registry
            .record("r", "/a", &version(1, "e", 1), "sha2:x=")
            .await
            .unwrap();
        registry.close().await;

        assert!(db_path.exists());
    }
}
