//! Private-mode detection. Consulted before every seed and add to pick the piece store.

use std::path::PathBuf;

/// Browsing mode reported by a detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BrowsingMode {
    pub is_private: bool,
}

#[allow(async_fn_in_trait)]
pub trait PrivateModeDetector: Send + Sync {
    async fn detect(&self) -> BrowsingMode;
}

/// Always reports the same mode.
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedMode(pub bool);

impl PrivateModeDetector for FixedMode {
    async fn detect(&self) -> BrowsingMode {
        BrowsingMode { is_private: self.0 }
    }
}

/// Treats an unwritable store directory as private mode: nothing may persist there.
#[derive(Debug, Clone)]
pub struct WritableDirCheck {
    root: PathBuf,
}

impl WritableDirCheck {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl PrivateModeDetector for WritableDirCheck {
    async fn detect(&self) -> BrowsingMode {
        let check = self
            .root
            .join(format!(".write-check-{}", uuid::Uuid::new_v4()));
        let writable = match tokio::fs::create_dir_all(&self.root).await {
            Ok(()) => tokio::fs::write(&check, b"").await.is_ok(),
            Err(_) => false,
        };
        if writable {
            let _ = tokio::fs::remove_file(&check).await;
        } else {
            tracing::debug!(root = %self.root.display(), "store directory not writable, private mode");
        }
        BrowsingMode {
            is_private: !writable,
        }
    }
}
