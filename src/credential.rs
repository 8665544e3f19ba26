//! Credential gate and durable token storage.
//!
//! [`validate`] is a structural check only: it rejects tokens that cannot be a
//! three-part bearer token before any network round trip is spent on them.
//! It does not verify signatures or expiry.
//!
//! [`TokenStore`] abstracts the durable local storage the token lives in. The
//! session reads it once when connecting and clears it on every
//! credential-fatal failure.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

/// Number of dot-separated segments in a well-formed bearer token.
const TOKEN_SEGMENTS: usize = 3;

/// Returns `true` if `token` is non-empty and made of exactly three
/// dot-separated, non-empty segments.
///
/// # Example
///
/// ```
/// use huddle_client::credential::validate;
///
/// assert!(validate("aaa.bbb.ccc"));
/// assert!(!validate(""));
/// assert!(!validate("aaa.bbb"));
/// assert!(!validate("aaa..ccc"));
/// ```
pub fn validate(token: &str) -> bool {
    if token.is_empty() {
        debug!("token rejected: empty");
        return false;
    }
    let mut segments = 0usize;
    for segment in token.split('.') {
        if segment.is_empty() {
            debug!("token rejected: empty segment");
            return false;
        }
        segments += 1;
    }
    if segments != TOKEN_SEGMENTS {
        debug!(segments, "token rejected: wrong segment count");
        return false;
    }
    true
}

/// Durable storage for the bearer token.
///
/// Implementations must be cheap to call from the session loop; failures are
/// logged and otherwise ignored.
pub trait TokenStore: Send + Sync + 'static {
    /// Read the stored token, if any.
    fn load(&self) -> Option<String>;

    /// Replace the stored token.
    fn store(&self, token: &str);

    /// Delete the stored token. Clearing an empty store is not an error.
    fn clear(&self);
}

/// An in-memory [`TokenStore`]. Clones share the same slot.
#[derive(Debug, Clone, Default)]
pub struct MemoryTokenStore {
    slot: Arc<Mutex<Option<String>>>,
}

impl MemoryTokenStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store that already holds `token`.
    pub fn with_token(token: impl Into<String>) -> Self {
        Self {
            slot: Arc::new(Mutex::new(Some(token.into()))),
        }
    }
}

impl TokenStore for MemoryTokenStore {
    fn load(&self) -> Option<String> {
        match self.slot.lock() {
            Ok(slot) => slot.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn store(&self, token: &str) {
        match self.slot.lock() {
            Ok(mut slot) => *slot = Some(token.to_owned()),
            Err(poisoned) => *poisoned.into_inner() = Some(token.to_owned()),
        }
    }

    fn clear(&self) {
        match self.slot.lock() {
            Ok(mut slot) => *slot = None,
            Err(poisoned) => *poisoned.into_inner() = None,
        }
    }
}

/// A [`TokenStore`] backed by a single file.
///
/// A missing file means no token. Surrounding whitespace is trimmed on load.
#[derive(Debug, Clone)]
pub struct FileTokenStore {
    path: PathBuf,
}

impl FileTokenStore {
    /// Create a store that reads and writes `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The file this store uses.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl TokenStore for FileTokenStore {
    fn load(&self) -> Option<String> {
        match std::fs::read_to_string(&self.path) {
            Ok(contents) => {
                let token = contents.trim();
                (!token.is_empty()).then(|| token.to_owned())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                warn!(path = %self.path.display(), "failed to read token file: {e}");
                None
            }
        }
    }

    fn store(&self, token: &str) {
        if let Err(e) = std::fs::write(&self.path, token) {
            warn!(path = %self.path.display(), "failed to write token file: {e}");
        }
    }

    fn clear(&self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "token file removed"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), "failed to remove token file: {e}"),
        }
    }
}
