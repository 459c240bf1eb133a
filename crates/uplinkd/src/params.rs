//! Directory-backed parameter store.
//!
//! Each key is one file under the store directory. Writes go to a
//! temporary file in the same directory and are renamed over the target,
//! so readers see either the old or the new value, never a torn one.

use rand::Rng;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;
use uplink_core::{UplinkError, UplinkResult};

pub const UPLOAD_QUEUE: &str = "UploadQueue";
pub const REMOTE_SSH_ENABLED: &str = "RemoteSshEnabled";
pub const REMOTE_SSH: &str = "RemoteSsh";
pub const PIN_ENABLED: &str = "RemoteAccessPinEnabled";
pub const PIN_SALT: &str = "RemoteAccessPinSalt";
pub const PIN_HASH: &str = "RemoteAccessPinHash";
pub const PIN_ITERATIONS: &str = "RemoteAccessPinIterations";
pub const LAST_PING_TIME: &str = "LastAthenaPingTime";
pub const IS_ONROAD: &str = "IsOnroad";
pub const DONGLE_ID: &str = "DongleId";
pub const NAV_DESTINATION: &str = "NavDestination";
pub const RECENTLY_VIEWED_ROUTES: &str = "AthenadRecentlyViewedRoutes";
pub const GITHUB_SSH_KEYS: &str = "GithubSshKeys";
pub const GITHUB_USERNAME: &str = "GithubUsername";
pub const GIT_REMOTE: &str = "GitRemote";
pub const GIT_BRANCH: &str = "GitBranch";
pub const GIT_COMMIT: &str = "GitCommit";

#[derive(Debug, Clone)]
pub struct Params {
    dir: PathBuf,
}

impl Params {
    pub fn open(dir: impl Into<PathBuf>) -> UplinkResult<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, key: &str) -> UplinkResult<PathBuf> {
        if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(UplinkError::InvalidParams(format!("bad param key: {key:?}")));
        }
        Ok(self.dir.join(key))
    }

    /// Raw value, or `None` when the key is unset or unreadable.
    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        let path = self.path(key).ok()?;
        match std::fs::read(&path) {
            Ok(bytes) => Some(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                debug!(key, error = %e, "param read failed");
                None
            }
        }
    }

    pub fn put(&self, key: &str, value: &[u8]) -> UplinkResult<()> {
        let path = self.path(key)?;
        let suffix: u32 = rand::thread_rng().gen();
        let tmp = self.dir.join(format!(".tmp_{key}_{suffix:08x}"));
        let result = (|| -> std::io::Result<()> {
            let mut file = std::fs::File::create(&tmp)?;
            file.write_all(value)?;
            file.sync_all()?;
            std::fs::rename(&tmp, &path)
        })();
        if result.is_err() {
            let _ = std::fs::remove_file(&tmp);
        }
        result.map_err(UplinkError::from)
    }

    pub fn remove(&self, key: &str) -> UplinkResult<()> {
        let path = self.path(key)?;
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn get_string(&self, key: &str) -> Option<String> {
        self.get(key)
            .and_then(|bytes| String::from_utf8(bytes).ok())
    }

    pub fn put_string(&self, key: &str, value: &str) -> UplinkResult<()> {
        self.put(key, value.as_bytes())
    }

    /// `true` only for a stored `"1"`.
    pub fn get_bool(&self, key: &str) -> bool {
        self.get(key)
            .map(|v| v.trim_ascii() == b"1")
            .unwrap_or(false)
    }

    pub fn put_bool(&self, key: &str, value: bool) -> UplinkResult<()> {
        self.put(key, if value { b"1" } else { b"0" })
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.get_string(key)?.trim().parse().ok()
    }

    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let bytes = self.get(key)?;
        match serde_json::from_slice(&bytes) {
            Ok(v) => Some(v),
            Err(e) => {
                debug!(key, error = %e, "param is not valid json");
                None
            }
        }
    }

    pub fn put_json<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> UplinkResult<()> {
        let bytes = serde_json::to_vec(value)?;
        self.put(key, &bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> (tempfile::TempDir, Params) {
        let dir = tempfile::tempdir().unwrap();
        let params = Params::open(dir.path().join("params")).unwrap();
        (dir, params)
    }

    #[test]
    fn missing_keys() {
        let (_dir, params) = store();
        assert!(params.get("Nope").is_none());
        assert!(!params.get_bool("Nope"));
        assert!(params.get_string("Nope").is_none());
        params.remove("Nope").unwrap();
    }

    #[test]
    fn typed_round_trip() {
        let (_dir, params) = store();
        params.put_bool(REMOTE_SSH_ENABLED, true).unwrap();
        assert!(params.get_bool(REMOTE_SSH_ENABLED));
        params.put_bool(REMOTE_SSH_ENABLED, false).unwrap();
        assert!(!params.get_bool(REMOTE_SSH_ENABLED));

        params.put_string(PIN_ITERATIONS, "150000").unwrap();
        assert_eq!(params.get_u64(PIN_ITERATIONS), Some(150_000));

        params.put_json(NAV_DESTINATION, &json!({"latitude": 1.5})).unwrap();
        let v: serde_json::Value = params.get_json(NAV_DESTINATION).unwrap();
        assert_eq!(v["latitude"], json!(1.5));
    }

    #[test]
    fn put_replaces_and_leaves_no_temp_files() {
        let (_dir, params) = store();
        params.put(DONGLE_ID, b"first").unwrap();
        params.put(DONGLE_ID, b"second").unwrap();
        assert_eq!(params.get(DONGLE_ID).unwrap(), b"second");
        let names: Vec<_> = std::fs::read_dir(params.dir())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, vec![DONGLE_ID.to_string()]);
    }

    #[test]
    fn rejects_path_like_keys() {
        let (_dir, params) = store();
        assert!(params.put("../escape", b"x").is_err());
        assert!(params.get("a/b").is_none());
    }

    #[test]
    fn remove_deletes() {
        let (_dir, params) = store();
        params.put(LAST_PING_TIME, b"1").unwrap();
        params.remove(LAST_PING_TIME).unwrap();
        assert!(params.get(LAST_PING_TIME).is_none());
    }
}
