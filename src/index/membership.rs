use std::sync::Arc;

use crate::core::{InputId, Project};
use crate::storage::FileIdRegistry;

/// 项目过滤协作者：某个文件是否在项目的 content roots 之内
pub trait ContentRootMembership: Send + Sync {
    fn contains(&self, input_id: InputId, project: &Project) -> bool;
}

/// 默认实现：id → 当前路径 → `starts_with(root)`。
/// 未知 id（孤儿）不属于任何项目。
pub struct PathContentRoots {
    registry: Arc<FileIdRegistry>,
}

impl PathContentRoots {
    pub fn new(registry: Arc<FileIdRegistry>) -> Self {
        Self { registry }
    }
}

impl ContentRootMembership for PathContentRoots {
    fn contains(&self, input_id: InputId, project: &Project) -> bool {
        self.registry
            .path_of(input_id)
            .is_some_and(|p| project.contains_path(&p))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::{Path, PathBuf};

    #[test]
    fn membership_follows_registered_path() {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let dir = std::env::temp_dir().join(format!("fb-index-member-{}", nanos));
        let registry = Arc::new(FileIdRegistry::open(dir.join("file_ids.bin")));
        let inside = registry.id_for(Path::new("/work/p1/src/a.rs"));
        let outside = registry.id_for(Path::new("/work/p2/b.rs"));

        let roots = PathContentRoots::new(registry.clone());
        let p1 = Project::new("p1", vec![PathBuf::from("/work/p1")]);
        assert!(roots.contains(inside, &p1));
        assert!(!roots.contains(outside, &p1));
        assert!(!roots.contains(999, &p1));

        registry.rename(Path::new("/work/p2/b.rs"), Path::new("/work/p1/b.rs"));
        assert!(roots.contains(outside, &p1));
    }
}
