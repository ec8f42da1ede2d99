//! Persisted alias to backend-session-id map.
//!
//! Real session ids are never posted to chat. Each session gets a
//! three-word alias instead, and the mapping is kept in a small JSON file
//! so a thread can be reconnected after a restart.
//!
//! Writes go to a temporary file that is renamed over the target, so a
//! crash mid-write leaves the previous map intact.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::Result;

/// Maximum number of aliases kept; the oldest are evicted first.
pub const MAX_ALIASES: usize = 200;

const ALIAS_RETRIES: usize = 50;

const MOODS: &[&str] = &[
    "bouncy", "brave", "calm", "cheeky", "clever", "cosy", "curious", "dancing", "dreamy",
    "eager", "fancy", "fuzzy", "gentle", "giddy", "grumpy", "happy", "humble", "jolly", "lazy",
    "lucky", "mellow", "mighty", "nimble", "plucky", "proud", "quiet", "rowdy", "sleepy",
    "sneaky", "sunny", "swift", "witty",
];

const TEXTURES: &[&str] = &[
    "amber", "arctic", "blazing", "bronze", "cosmic", "crimson", "crystal", "dusty", "electric",
    "emerald", "frosty", "golden", "hidden", "icy", "jade", "lunar", "misty", "neon", "polar",
    "quantum", "rusty", "silent", "silver", "solar", "stormy", "velvet", "wild", "woolly",
];

const CREATURES: &[&str] = &[
    "badger", "beaver", "bison", "camel", "cobra", "corgi", "crab", "dolphin", "dragon", "eagle",
    "falcon", "ferret", "gecko", "giraffe", "hamster", "hedgehog", "koala", "lemur", "lion",
    "llama", "lobster", "moose", "narwhal", "octopus", "otter", "owl", "panda", "parrot",
    "penguin", "rabbit", "raccoon", "shark", "sloth", "squid", "tiger", "turtle", "unicorn",
    "walrus", "whale", "zebra",
];

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct AliasFile {
    #[serde(default)]
    entries: Vec<AliasEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AliasEntry {
    alias: String,
    session_id: String,
}

/// File-backed alias map shared by every thread.
///
/// All reads and writes are serialised through an internal lock, so
/// concurrent threads never interleave a read-modify-write cycle.
#[derive(Debug)]
pub struct AliasStore {
    path: PathBuf,
    guard: Mutex<()>,
}

impl AliasStore {
    /// Open the store at `path`. The file is created on first save.
    #[must_use]
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            guard: Mutex::new(()),
        }
    }

    /// Location of the backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record `alias -> session_id`, replacing any earlier mapping for the
    /// alias and evicting the oldest entries beyond [`MAX_ALIASES`].
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the map cannot be written.
    pub async fn save_alias(&self, alias: &str, session_id: &str) -> Result<()> {
        let _held = self.guard.lock().await;
        let mut file = self.read().await;
        file.entries.retain(|entry| entry.alias != alias);
        file.entries.push(AliasEntry {
            alias: alias.to_owned(),
            session_id: session_id.to_owned(),
        });
        if file.entries.len() > MAX_ALIASES {
            let excess = file.entries.len() - MAX_ALIASES;
            file.entries.drain(..excess);
        }
        self.write(&file).await?;
        debug!(alias, "alias saved");
        Ok(())
    }

    /// Session id recorded for `alias`, if any.
    pub async fn load_alias(&self, alias: &str) -> Option<String> {
        let _held = self.guard.lock().await;
        self.read()
            .await
            .entries
            .into_iter()
            .find(|entry| entry.alias == alias)
            .map(|entry| entry.session_id)
    }

    /// A fresh alias not present in the map.
    ///
    /// Gives up on uniqueness after a bounded number of draws and returns
    /// the last candidate.
    pub async fn generate_alias(&self) -> String {
        let taken: Vec<String> = {
            let _held = self.guard.lock().await;
            self.read()
                .await
                .entries
                .into_iter()
                .map(|entry| entry.alias)
                .collect()
        };
        let mut candidate = random_alias();
        for _ in 1..ALIAS_RETRIES {
            if !taken.contains(&candidate) {
                break;
            }
            candidate = random_alias();
        }
        candidate
    }

    async fn read(&self) -> AliasFile {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return AliasFile::default(),
            Err(err) => {
                warn!(path = %self.path.display(), %err, "alias map unreadable; treating as empty");
                return AliasFile::default();
            }
        };
        if raw.trim().is_empty() {
            return AliasFile::default();
        }
        serde_json::from_str(&raw).unwrap_or_else(|err| {
            warn!(path = %self.path.display(), %err, "alias map corrupt; treating as empty");
            AliasFile::default()
        })
    }

    async fn write(&self, file: &AliasFile) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.path.with_extension("json.tmp");
        let body = serde_json::to_vec_pretty(file)?;
        tokio::fs::write(&tmp, body).await?;
        restrict_permissions(&tmp).await;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[cfg(unix)]
async fn restrict_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;

    if let Err(err) =
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await
    {
        debug!(%err, "could not restrict alias map permissions");
    }
}

#[cfg(not(unix))]
async fn restrict_permissions(_path: &Path) {}

/// Draw one `mood-texture-creature` alias.
#[must_use]
pub fn random_alias() -> String {
    let bytes = uuid::Uuid::new_v4().into_bytes();
    let pick = |words: &[&'static str], hi: u8, lo: u8| -> &'static str {
        let n = usize::from(u16::from_be_bytes([hi, lo]));
        words[n % words.len()]
    };
    format!(
        "{}-{}-{}",
        pick(MOODS, bytes[0], bytes[1]),
        pick(TEXTURES, bytes[2], bytes[3]),
        pick(CREATURES, bytes[4], bytes[5]),
    )
}
