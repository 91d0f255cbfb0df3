use bridgectl_core::paths::CONFIG_FILE;
use std::path::{Path, PathBuf};

/// Resolve the project root.
///
/// Priority:
/// 1. `--root` flag / `BRIDGECTL_ROOT` env var (passed in as `explicit`)
/// 2. Walk upward from `cwd` looking for `bridgectl.yaml`
/// 3. Walk upward from `cwd` looking for `.git/`
/// 4. Fall back to `cwd`
pub fn resolve_root(explicit: Option<&Path>) -> PathBuf {
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    resolve_from(explicit, &cwd)
}

fn resolve_from(explicit: Option<&Path>, cwd: &Path) -> PathBuf {
    if let Some(p) = explicit {
        return p.to_path_buf();
    }
    find_upward(cwd, |dir| dir.join(CONFIG_FILE).is_file())
        .or_else(|| find_upward(cwd, |dir| dir.join(".git").is_dir()))
        .unwrap_or_else(|| cwd.to_path_buf())
}

fn find_upward(start: &Path, found: impl Fn(&Path) -> bool) -> Option<PathBuf> {
    start.ancestors().find(|d| found(d)).map(Path::to_path_buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn explicit_root_wins() {
        let dir = TempDir::new().unwrap();
        let result = resolve_from(Some(dir.path()), Path::new("/"));
        assert_eq!(result, dir.path());
    }

    #[test]
    fn finds_config_file_above_cwd() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), "").unwrap();
        let subdir = dir.path().join("bridge/handlers");
        std::fs::create_dir_all(&subdir).unwrap();

        assert_eq!(resolve_from(None, &subdir), dir.path());
    }

    #[test]
    fn config_file_beats_enclosing_git_dir() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join(".git")).unwrap();
        let project = dir.path().join("ops/bridge");
        std::fs::create_dir_all(&project).unwrap();
        std::fs::write(project.join(CONFIG_FILE), "").unwrap();

        assert_eq!(resolve_from(None, &project), project);
    }

    #[test]
    fn falls_back_to_git_dir() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join(".git")).unwrap();
        let subdir = dir.path().join("bridge");
        std::fs::create_dir_all(&subdir).unwrap();

        assert_eq!(resolve_from(None, &subdir), dir.path());
    }
}
