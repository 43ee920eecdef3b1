//! Out-of-band file transfer for JSON payloads
//!
//! Payloads may mention local files by path. On send, every such path is
//! read into a [`ResourceBuffer`] and shipped next to the payload; the
//! payload itself keeps the original path. On receive, each buffer is
//! stored locally and the sender's path is swapped for the local one.

use crate::types::{ResourceBuffer, ResourceMap};
use async_trait::async_trait;
use regex_lite::Regex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::OnceLock;
use thiserror::Error;

/// Resource errors
#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("Failed to read {path}: {reason}")]
    Read { path: String, reason: String },
    #[error("Failed to store {name}: {reason}")]
    Upload { name: String, reason: String },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Local file storage used to materialize and persist resources
#[async_trait]
pub trait FileStore: Send + Sync {
    /// Load the file behind `path`
    async fn read_buffer(&self, path: &str) -> Result<ResourceBuffer, ResourceError>;

    /// Persist a received buffer, returning a path valid in this store
    async fn upload_buffer(&self, buffer: &ResourceBuffer) -> Result<String, ResourceError>;
}

fn windows_path() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?i)^[a-z]:[\\/](?:[^\\/:*?"<>|\r\n]+[\\/])*[^\\/:*?"<>|\r\n]*$"#)
            .expect("valid windows path pattern")
    })
}

fn unix_path() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(/[^/]+)+/?$").expect("valid unix path pattern"))
}

/// Whether a string looks like a reference to a local file
pub fn is_file_reference(s: &str) -> bool {
    s.starts_with("file://") || windows_path().is_match(s) || unix_path().is_match(s)
}

/// Collect every distinct file reference in a payload, depth first
pub fn find_file_references(payload: &Value) -> Vec<String> {
    let mut found = Vec::new();
    collect(payload, &mut found);
    found
}

fn collect(value: &Value, found: &mut Vec<String>) {
    match value {
        Value::String(s) if is_file_reference(s) => {
            if !found.iter().any(|f| f == s) {
                found.push(s.clone());
            }
        }
        Value::Array(items) => items.iter().for_each(|v| collect(v, found)),
        Value::Object(map) => map.values().for_each(|v| collect(v, found)),
        _ => {}
    }
}

/// Read every file referenced by `payload`.
///
/// Returns `None` when the payload references no files.
pub async fn extract_resources(
    store: &dyn FileStore,
    payload: &Value,
) -> Result<Option<ResourceMap>, ResourceError> {
    let paths = find_file_references(payload);
    if paths.is_empty() {
        return Ok(None);
    }

    let mut resources = ResourceMap::new();
    for path in paths {
        let buffer = store.read_buffer(&path).await?;
        resources.insert(path, buffer);
    }
    Ok(Some(resources))
}

/// Store received resources locally and rewrite the payload to point at them.
///
/// References without a matching resource are left untouched.
pub async fn reinject_resources(
    store: &dyn FileStore,
    payload: &mut Value,
    resources: Option<&ResourceMap>,
) -> Result<(), ResourceError> {
    let Some(resources) = resources.filter(|r| !r.is_empty()) else {
        return Ok(());
    };

    let mut replacements = HashMap::new();
    for path in find_file_references(payload) {
        if let Some(buffer) = resources.get(&path) {
            let local = store.upload_buffer(buffer).await?;
            replacements.insert(path, local);
        }
    }

    if !replacements.is_empty() {
        rewrite(payload, &replacements);
    }
    Ok(())
}

fn rewrite(value: &mut Value, replacements: &HashMap<String, String>) {
    match value {
        Value::String(s) => {
            if let Some(local) = replacements.get(s.as_str()) {
                *s = local.clone();
            }
        }
        Value::Array(items) => items.iter_mut().for_each(|v| rewrite(v, replacements)),
        Value::Object(map) => map.values_mut().for_each(|v| rewrite(v, replacements)),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;

    /// In-memory store: reads synthesize content from the path, uploads
    /// land under `/local/`.
    #[derive(Default)]
    struct MemoryStore {
        reads: Mutex<Vec<String>>,
        uploads: Mutex<Vec<ResourceBuffer>>,
    }

    #[async_trait]
    impl FileStore for MemoryStore {
        async fn read_buffer(&self, path: &str) -> Result<ResourceBuffer, ResourceError> {
            if path.contains("missing") {
                return Err(ResourceError::Read {
                    path: path.to_string(),
                    reason: "not found".into(),
                });
            }
            self.reads.lock().push(path.to_string());
            let name = path.rsplit(['/', '\\']).next().unwrap_or(path);
            Ok(ResourceBuffer::new(
                path.as_bytes().to_vec(),
                name,
                "application/octet-stream",
            ))
        }

        async fn upload_buffer(&self, buffer: &ResourceBuffer) -> Result<String, ResourceError> {
            let mut uploads = self.uploads.lock();
            uploads.push(buffer.clone());
            Ok(format!("/local/{}-{}", uploads.len(), buffer.name))
        }
    }

    #[test]
    fn test_path_heuristic() {
        assert!(is_file_reference("file:///tmp/a.png"));
        assert!(is_file_reference("/home/alice/photo.jpg"));
        assert!(is_file_reference("/var/data/"));
        assert!(is_file_reference(r"C:\Users\alice\doc.pdf"));
        assert!(is_file_reference("d:/media/clip.mp4"));

        assert!(!is_file_reference("hello world"));
        assert!(!is_file_reference("/"));
        assert!(!is_file_reference("//double"));
        assert!(!is_file_reference("relative/path.txt"));
        assert!(!is_file_reference("https://example.com/a.png"));
        assert!(!is_file_reference(""));
    }

    #[test]
    fn test_find_nested_references() {
        let payload = json!({
            "text": "see attachments",
            "avatar": "/home/a/avatar.png",
            "messages": [
                {"file": "/home/a/one.txt", "size": 3},
                [{"deep": {"deeper": "C:\\files\\two.bin"}}],
                "/home/a/avatar.png"
            ],
            "count": 7,
            "none": null
        });

        let refs = find_file_references(&payload);
        assert_eq!(refs.len(), 3);
        assert!(refs.contains(&"/home/a/avatar.png".to_string()));
        assert!(refs.contains(&"/home/a/one.txt".to_string()));
        assert!(refs.contains(&"C:\\files\\two.bin".to_string()));
    }

    #[tokio::test]
    async fn test_extract_leaves_payload_intact() {
        let store = MemoryStore::default();
        let payload = json!(["/a/one.txt", {"x": "/a/two.txt"}, "plain"]);
        let before = payload.clone();

        let resources = extract_resources(&store, &payload).await.unwrap().unwrap();

        assert_eq!(payload, before);
        assert_eq!(resources.len(), 2);
        assert_eq!(resources["/a/one.txt"].name, "one.txt");
        assert_eq!(resources["/a/two.txt"].size, "/a/two.txt".len() as u64);
    }

    #[tokio::test]
    async fn test_extract_without_references() {
        let store = MemoryStore::default();
        let resources = extract_resources(&store, &json!({"a": [1, "b"]})).await.unwrap();
        assert!(resources.is_none());
        assert!(store.reads.lock().is_empty());
    }

    #[tokio::test]
    async fn test_extract_propagates_read_failure() {
        let store = MemoryStore::default();
        let result = extract_resources(&store, &json!({"f": "/a/missing.txt"})).await;
        assert!(matches!(result, Err(ResourceError::Read { .. })));
    }

    #[tokio::test]
    async fn test_reinject_rewrites_every_reference() {
        let sender = MemoryStore::default();
        let receiver = MemoryStore::default();
        let original = json!({
            "cover": "/a/cover.png",
            "pages": ["/a/p1.txt", {"again": "/a/cover.png"}, "/a/p2.txt"],
            "title": "book",
            "n": 3
        });

        let resources = extract_resources(&sender, &original).await.unwrap();
        let mut received = original.clone();
        reinject_resources(&receiver, &mut received, resources.as_ref())
            .await
            .unwrap();

        // one upload per distinct path
        assert_eq!(receiver.uploads.lock().len(), 3);
        assert_eq!(received["title"], "book");
        assert_eq!(received["n"], 3);
        assert_eq!(received["cover"], received["pages"][1]["again"]);
        for path in find_file_references(&received) {
            assert!(path.starts_with("/local/"));
        }
        assert!(received["pages"][0].as_str().unwrap().ends_with("p1.txt"));
    }

    #[tokio::test]
    async fn test_reinject_without_resources_is_noop() {
        let store = MemoryStore::default();
        let mut payload = json!({"f": "/a/b.txt"});

        reinject_resources(&store, &mut payload, None).await.unwrap();
        reinject_resources(&store, &mut payload, Some(&ResourceMap::new()))
            .await
            .unwrap();

        assert_eq!(payload, json!({"f": "/a/b.txt"}));
        assert!(store.uploads.lock().is_empty());
    }

    #[tokio::test]
    async fn test_reinject_skips_unknown_references() {
        let store = MemoryStore::default();
        let mut resources = ResourceMap::new();
        resources.insert(
            "/a/known.txt".into(),
            ResourceBuffer::new(vec![1, 2], "known.txt", "text/plain"),
        );
        let mut payload = json!(["/a/known.txt", "/a/unknown.txt"]);

        reinject_resources(&store, &mut payload, Some(&resources))
            .await
            .unwrap();

        assert_eq!(payload[0], "/local/1-known.txt");
        assert_eq!(payload[1], "/a/unknown.txt");
    }
}
