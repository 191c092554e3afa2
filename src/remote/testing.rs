//! 测试用的内存仓库

use super::{parent_remote, Children, RemoteError, RemoteObject, Repository};
use crate::core::checksum::sha256_descriptor;
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone)]
struct FakeObject {
    data: Vec<u8>,
    checksum: Option<String>,
}

#[derive(Debug, Clone)]
struct Failure {
    error: RemoteError,
    /// 剩余失败次数，None 表示一直失败
    remaining: Option<usize>,
}

#[derive(Default)]
struct State {
    collections: BTreeSet<String>,
    objects: BTreeMap<String, FakeObject>,
    failures: HashMap<String, Failure>,
    free_space: Option<u64>,
    corrupt_uploads: bool,
}

pub struct FakeRepository {
    state: Mutex<State>,
    latency: Duration,
    pub compute_calls: AtomicUsize,
    pub put_calls: AtomicUsize,
    pub get_calls: AtomicUsize,
}

impl FakeRepository {
    /// 创建仓库，根集合及其上级集合都存在
    pub fn new(root: &str) -> Self {
        let repo = Self {
            state: Mutex::new(State::default()),
            latency: Duration::ZERO,
            compute_calls: AtomicUsize::new(0),
            put_calls: AtomicUsize::new(0),
            get_calls: AtomicUsize::new(0),
        };
        repo.add_collection(root);
        repo
    }

    fn add_collection(&self, path: &str) {
        let mut state = self.state.lock().unwrap();
        let mut current = Some(path.trim_end_matches('/'));
        while let Some(p) = current {
            if p.is_empty() {
                break;
            }
            state.collections.insert(p.to_string());
            current = parent_remote(p);
        }
    }

    pub fn with_collection(self, path: &str) -> Self {
        self.add_collection(path);
        self
    }

    /// 添加对象（自动创建上级集合），没有校验和
    pub fn with_object(self, path: &str, data: &[u8]) -> Self {
        if let Some(parent) = parent_remote(path) {
            self.add_collection(parent);
        }
        self.state.lock().unwrap().objects.insert(
            path.to_string(),
            FakeObject {
                data: data.to_vec(),
                checksum: None,
            },
        );
        self
    }

    pub fn with_checksum(self, path: &str, checksum: &str) -> Self {
        if let Some(obj) = self.state.lock().unwrap().objects.get_mut(path) {
            obj.checksum = Some(checksum.to_string());
        }
        self
    }

    /// 针对某个路径的操作一直失败
    pub fn with_failure(self, path: &str, error: RemoteError) -> Self {
        self.fail(path, error, None);
        self
    }

    /// 针对某个路径的操作先失败 `times` 次
    pub fn with_transient_failure(self, path: &str, error: RemoteError, times: usize) -> Self {
        self.fail(path, error, Some(times));
        self
    }

    fn fail(&self, path: &str, error: RemoteError, remaining: Option<usize>) {
        self.state
            .lock()
            .unwrap()
            .failures
            .insert(path.to_string(), Failure { error, remaining });
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_free_space(self, bytes: u64) -> Self {
        self.state.lock().unwrap().free_space = Some(bytes);
        self
    }

    /// 上传的内容被篡改（用于校验失败测试）
    pub fn with_corrupt_uploads(self) -> Self {
        self.state.lock().unwrap().corrupt_uploads = true;
        self
    }

    pub fn object_data(&self, path: &str) -> Option<Vec<u8>> {
        self.state
            .lock()
            .unwrap()
            .objects
            .get(path)
            .map(|o| o.data.clone())
    }

    pub fn stored_checksum(&self, path: &str) -> Option<String> {
        self.state
            .lock()
            .unwrap()
            .objects
            .get(path)
            .and_then(|o| o.checksum.clone())
    }

    pub fn has_collection(&self, path: &str) -> bool {
        self.state.lock().unwrap().collections.contains(path)
    }

    pub fn computes(&self) -> usize {
        self.compute_calls.load(Ordering::SeqCst)
    }

    pub fn puts(&self) -> usize {
        self.put_calls.load(Ordering::SeqCst)
    }

    pub fn gets(&self) -> usize {
        self.get_calls.load(Ordering::SeqCst)
    }

    async fn enter(&self, path: &str) -> Result<(), RemoteError> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let mut state = self.state.lock().unwrap();
        let Some(failure) = state.failures.get_mut(path) else {
            return Ok(());
        };
        let error = failure.error.clone();
        match failure.remaining.as_mut() {
            None => Err(error),
            Some(0) => Ok(()),
            Some(n) => {
                *n -= 1;
                Err(error)
            }
        }
    }
}

#[async_trait]
impl Repository for FakeRepository {
    async fn list_children(&self, path: &str) -> Result<Children, RemoteError> {
        self.enter(path).await?;
        let state = self.state.lock().unwrap();
        if !state.collections.contains(path) {
            return Err(RemoteError::NotFound(path.to_string()));
        }

        let mut children = Children::default();
        for coll in &state.collections {
            if parent_remote(coll) == Some(path) && coll != path {
                children.collections.push(coll.clone());
            }
        }
        for (obj_path, obj) in &state.objects {
            if parent_remote(obj_path) == Some(path) {
                let name = obj_path.rsplit('/').next().unwrap_or_default();
                children.objects.push(RemoteObject {
                    name: name.to_string(),
                    size: obj.data.len() as u64,
                    checksum: obj.checksum.clone(),
                });
            }
        }
        Ok(children)
    }

    async fn object_exists(&self, path: &str) -> Result<bool, RemoteError> {
        self.enter(path).await?;
        Ok(self.state.lock().unwrap().objects.contains_key(path))
    }

    async fn collection_exists(&self, path: &str) -> Result<bool, RemoteError> {
        self.enter(path).await?;
        Ok(self.state.lock().unwrap().collections.contains(path))
    }

    async fn compute_checksum(&self, path: &str) -> Result<String, RemoteError> {
        self.compute_calls.fetch_add(1, Ordering::SeqCst);
        self.enter(path).await?;
        let mut state = self.state.lock().unwrap();
        let obj = state
            .objects
            .get_mut(path)
            .ok_or_else(|| RemoteError::NotFound(path.to_string()))?;
        if obj.checksum.is_none() {
            obj.checksum = Some(sha256_descriptor(&obj.data));
        }
        Ok(obj.checksum.clone().unwrap_or_default())
    }

    async fn create_collection(&self, path: &str) -> Result<(), RemoteError> {
        self.enter(path).await?;
        self.add_collection(path);
        Ok(())
    }

    async fn put(
        &self,
        local: &Path,
        remote: &str,
        _resource: Option<&str>,
    ) -> Result<(), RemoteError> {
        self.put_calls.fetch_add(1, Ordering::SeqCst);
        self.enter(remote).await?;
        let mut data = tokio::fs::read(local)
            .await
            .map_err(|e| RemoteError::from_io(local, &e))?;

        let mut state = self.state.lock().unwrap();
        let parent = parent_remote(remote).unwrap_or("/");
        if !state.collections.contains(parent) {
            return Err(RemoteError::NotFound(parent.to_string()));
        }
        if state.corrupt_uploads {
            data.push(0xff);
        }
        state.objects.insert(
            remote.to_string(),
            FakeObject {
                data,
                checksum: None,
            },
        );
        Ok(())
    }

    async fn get(&self, remote: &str, local: &Path) -> Result<(), RemoteError> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        self.enter(remote).await?;
        let data = self
            .object_data(remote)
            .ok_or_else(|| RemoteError::NotFound(remote.to_string()))?;
        tokio::fs::write(local, data)
            .await
            .map_err(|e| RemoteError::from_io(local, &e))
    }

    async fn free_space(&self, _resource: Option<&str>) -> Result<Option<u64>, RemoteError> {
        self.enter("free_space").await?;
        Ok(self.state.lock().unwrap().free_space)
    }

    fn name(&self) -> &str {
        "fake"
    }
}
