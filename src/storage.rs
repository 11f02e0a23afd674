use std::path::{Component, Path, PathBuf};
use std::pin::Pin;

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use sqlx::PgPool;
use tokio::fs;
use tokio::io::{AsyncRead, AsyncWriteExt};
use uuid::Uuid;

use crate::models::Node;

pub type ByteStream = Pin<Box<dyn AsyncRead + Send>>;

#[async_trait]
pub trait NodeRepository: Send + Sync {
  async fn fetch_node(&self, id: Uuid) -> Result<Node>;
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
  async fn get(&self, bucket: &str, key: &str) -> Result<ByteStream>;
  async fn put(&self, bucket: &str, key: &str, data: ByteStream, size: u64) -> Result<()>;
  async fn delete(&self, bucket: &str, key: &str) -> Result<()>;
}

pub struct PgNodeRepository {
  pool: PgPool,
}

impl PgNodeRepository {
  pub fn new(pool: PgPool) -> Self {
    Self { pool }
  }
}

#[async_trait]
impl NodeRepository for PgNodeRepository {
  async fn fetch_node(&self, id: Uuid) -> Result<Node> {
    let row = sqlx::query_as::<_, (String, Option<i64>, Option<String>)>(
      "SELECT name, size_bytes, object_storage_key FROM nodes WHERE id = $1",
    )
      .bind(id)
      .fetch_optional(&self.pool)
      .await?;

    let (name, size_bytes, key) = row.ok_or_else(|| anyhow!("node {id} not found"))?;
    let storage_key = key.ok_or_else(|| anyhow!("node {id} is a directory"))?;
    Ok(Node { name, size_bytes, storage_key })
  }
}

/// Object store laid out on the local filesystem as `<root>/<bucket>/<key>`.
pub struct LocalObjectStore {
  root: PathBuf,
}

impl LocalObjectStore {
  pub fn new(root: impl Into<PathBuf>) -> Self {
    Self { root: root.into() }
  }

  fn object_path(&self, bucket: &str, key: &str) -> Result<PathBuf> {
    let mut path = self.root.join(checked_segment(bucket)?);
    for part in key.split('/').filter(|p| !p.is_empty()) {
      path.push(checked_segment(part)?);
    }
    Ok(path)
  }
}

fn checked_segment(segment: &str) -> Result<&str> {
  let mut components = Path::new(segment).components();
  match (components.next(), components.next()) {
    (Some(Component::Normal(_)), None) => Ok(segment),
    _ => bail!("invalid object key segment '{segment}'"),
  }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
  async fn get(&self, bucket: &str, key: &str) -> Result<ByteStream> {
    let path = self.object_path(bucket, key)?;
    let file = fs::File::open(&path)
      .await
      .with_context(|| format!("object {bucket}/{key} not readable"))?;
    Ok(Box::pin(file))
  }

  async fn put(&self, bucket: &str, key: &str, mut data: ByteStream, size: u64) -> Result<()> {
    let path = self.object_path(bucket, key)?;
    if let Some(parent) = path.parent() {
      fs::create_dir_all(parent).await?;
    }
    let mut file = fs::File::create(&path).await?;
    let written = tokio::io::copy(&mut data, &mut file).await?;
    file.flush().await?;
    if written != size {
      drop(file);
      let _ = fs::remove_file(&path).await;
      bail!("short write for {bucket}/{key}: expected {size} bytes, got {written}");
    }
    Ok(())
  }

  async fn delete(&self, bucket: &str, key: &str) -> Result<()> {
    let path = self.object_path(bucket, key)?;
    match fs::remove_file(&path).await {
      Ok(()) => Ok(()),
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
      Err(e) => Err(e.into()),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tokio::io::AsyncReadExt;

  #[tokio::test]
  async fn local_store_round_trips_nested_keys() {
    let dir = tempfile::tempdir().unwrap();
    let store = LocalObjectStore::new(dir.path());
    let body = b"#EXTM3U\n".to_vec();

    store
      .put("hls", "abc/720/index.m3u8", Box::pin(std::io::Cursor::new(body.clone())), body.len() as u64)
      .await
      .unwrap();
    assert!(dir.path().join("hls/abc/720/index.m3u8").exists());

    let mut read_back = Vec::new();
    store.get("hls", "abc/720/index.m3u8").await.unwrap().read_to_end(&mut read_back).await.unwrap();
    assert_eq!(read_back, body);

    store.delete("hls", "abc/720/index.m3u8").await.unwrap();
    store.delete("hls", "abc/720/index.m3u8").await.unwrap();
    assert!(store.get("hls", "abc/720/index.m3u8").await.is_err());
  }

  #[tokio::test]
  async fn local_store_rejects_escaping_keys() {
    let dir = tempfile::tempdir().unwrap();
    let store = LocalObjectStore::new(dir.path());
    assert!(store.get("hls", "../secret").await.is_err());
    assert!(store.get("..", "x").await.is_err());
  }

  #[tokio::test]
  async fn short_write_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let store = LocalObjectStore::new(dir.path());
    let result = store.put("b", "k", Box::pin(std::io::Cursor::new(vec![1u8, 2])), 3).await;
    assert!(result.is_err());
    assert!(!dir.path().join("b/k").exists());
  }
}
