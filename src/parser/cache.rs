use std::path::{Path, PathBuf};

use log::debug;

use crate::error::Result;
use crate::utils::fs_url;

/// On-disk cache of fetched include files.
///
/// Layout under `<cwd>/.gitlab-ci-local/includes/`:
/// - remote and template includes: `<url without scheme>`
/// - project includes: `<host>/<project>/<ref>/<file>`
///
/// There is no locking: two resolutions must not share a cache directory
/// at the same time.
#[derive(Debug, Clone)]
pub struct IncludeCache {
    root: PathBuf,
    fetch_includes: bool,
}

impl IncludeCache {
    pub const LOCAL_STORAGE: &'static str = ".gitlab-ci-local";

    pub fn new(cwd: &Path, fetch_includes: bool) -> Self {
        Self {
            root: cwd.join(Self::LOCAL_STORAGE).join("includes"),
            fetch_includes,
        }
    }

    pub fn remote_path(&self, url: &str) -> PathBuf {
        self.root.join(fs_url(url))
    }

    pub fn project_dir(&self, host: &str, project: &str) -> PathBuf {
        self.root.join(host).join(project)
    }

    pub fn ref_dir(&self, host: &str, project: &str, ref_: &str) -> PathBuf {
        self.project_dir(host, project).join(ref_)
    }

    pub fn project_file(&self, host: &str, project: &str, ref_: &str, file: &str) -> PathBuf {
        self.ref_dir(host, project, ref_)
            .join(file.trim_start_matches('/'))
    }

    /// Whether every path is already cached and fetching is not forced.
    pub async fn is_fresh(&self, paths: &[PathBuf]) -> Result<bool> {
        if self.fetch_includes {
            return Ok(false);
        }
        for path in paths {
            if !tokio::fs::try_exists(path).await? {
                return Ok(false);
            }
        }
        debug!("Include cache hit for {} file(s)", paths.len());
        Ok(true)
    }

    pub async fn store(&self, path: &Path, content: &[u8]) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, content).await?;
        debug!("Cached include at {}", path.display());
        Ok(())
    }

    /// Removes `ref_dir` if it is a symlink left over from a local project alias.
    pub async fn unlink_stale(&self, ref_dir: &Path) -> Result<()> {
        if let Ok(meta) = tokio::fs::symlink_metadata(ref_dir).await {
            if meta.file_type().is_symlink() {
                tokio::fs::remove_file(ref_dir).await?;
            }
        }
        Ok(())
    }

    /// Points `ref_dir` at a local checkout of the project.
    pub async fn link(&self, local_path: &Path, ref_dir: &Path) -> Result<()> {
        if let Some(project_dir) = ref_dir.parent() {
            tokio::fs::create_dir_all(project_dir).await?;
        }
        if tokio::fs::try_exists(ref_dir).await? {
            tokio::fs::remove_dir_all(ref_dir).await?;
        }
        #[cfg(unix)]
        tokio::fs::symlink(local_path, ref_dir).await?;
        #[cfg(windows)]
        tokio::fs::symlink_dir(local_path, ref_dir).await?;
        debug!("Linked {} to {}", ref_dir.display(), local_path.display());
        Ok(())
    }

    /// Recreates `dir` as an empty directory.
    pub async fn empty_dir(&self, dir: &Path) -> Result<()> {
        if tokio::fs::try_exists(dir).await? {
            tokio::fs::remove_dir_all(dir).await?;
        }
        tokio::fs::create_dir_all(dir).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_layout() {
        let cache = IncludeCache::new(Path::new("/work"), false);

        assert_eq!(
            cache.remote_path("https://example.com/ci/build.yml"),
            PathBuf::from("/work/.gitlab-ci-local/includes/example.com/ci/build.yml")
        );
        assert_eq!(
            cache.project_file("gitlab.com", "group/templates", "main", "/ci/test.yml"),
            PathBuf::from("/work/.gitlab-ci-local/includes/gitlab.com/group/templates/main/ci/test.yml")
        );
    }

    #[tokio::test]
    async fn test_store_and_freshness() {
        let dir = tempfile::tempdir().unwrap();
        let cache = IncludeCache::new(dir.path(), false);
        let path = cache.remote_path("https://example.com/a.yml");

        assert!(!cache.is_fresh(&[path.clone()]).await.unwrap());
        cache.store(&path, b"a: 1\n").await.unwrap();
        assert!(cache.is_fresh(&[path.clone()]).await.unwrap());

        let forced = IncludeCache::new(dir.path(), true);
        assert!(!forced.is_fresh(&[path]).await.unwrap());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_link_replaces_stale_symlink() {
        let dir = tempfile::tempdir().unwrap();
        let cache = IncludeCache::new(dir.path(), false);
        let first = dir.path().join("first");
        let second = dir.path().join("second");
        std::fs::create_dir_all(&first).unwrap();
        std::fs::create_dir_all(&second).unwrap();
        std::fs::write(second.join("ci.yml"), "x: 1\n").unwrap();

        let ref_dir = cache.ref_dir("gitlab.com", "group/project", "main");
        cache.link(&first, &ref_dir).await.unwrap();
        cache.unlink_stale(&ref_dir).await.unwrap();
        assert!(std::fs::symlink_metadata(&ref_dir).is_err());

        cache.link(&second, &ref_dir).await.unwrap();
        assert!(ref_dir.join("ci.yml").exists());
    }
}
