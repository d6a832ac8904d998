use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::core::Project;

/// 引擎配置
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// 索引根目录（indexes/、stamps/、file_ids.bin ...）
    pub index_root: PathBuf,
    /// 设置时覆盖每个扩展自己的 `cache_size()`
    pub cache_capacity: Option<usize>,
    /// 批量扫描是否包含隐藏文件
    pub include_hidden: bool,
    /// 批量扫描是否遵守 .gitignore / .ignore
    pub respect_gitignore: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            index_root: default_index_root(),
            cache_capacity: None,
            include_hidden: false,
            respect_gitignore: true,
        }
    }
}

impl EngineConfig {
    pub fn with_root(index_root: impl Into<PathBuf>) -> Self {
        Self {
            index_root: index_root.into(),
            ..Default::default()
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProjectConfig {
    pub name: String,
    pub roots: Vec<PathBuf>,
}

impl From<&ProjectConfig> for Project {
    fn from(p: &ProjectConfig) -> Self {
        Project::new(p.name.clone(), p.roots.clone())
    }
}

/// 守护进程配置（TOML，所有字段都有默认值）
///
/// ```toml
/// port = 6061
/// debounce_ms = 200
///
/// [engine]
/// index_root = "/var/cache/fb-index"
///
/// [[projects]]
/// name = "main"
/// roots = ["/src/main"]
/// ```
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub engine: EngineConfig,
    pub projects: Vec<ProjectConfig>,
    pub port: u16,
    /// notify → 管道的有界队列长度
    pub event_channel_size: usize,
    pub debounce_ms: u64,
    /// 标识符索引接受的文件 glob
    pub source_globs: Vec<String>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            projects: Vec::new(),
            port: 6061,
            event_channel_size: 4096,
            debounce_ms: 200,
            source_globs: ["*.rs", "*.java", "*.kt", "*.py", "*.go", "*.c", "*.h", "*.ts", "*.js"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl DaemonConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: DaemonConfig = toml::from_str(&raw)?;
        Ok(config)
    }

    /// 文件缺失时使用默认值
    pub fn load_or_default(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(p) if p.exists() => Self::load(p),
            Some(p) => {
                tracing::warn!("Config file {:?} not found, using defaults", p);
                Ok(Self::default())
            }
            None => Ok(Self::default()),
        }
    }
}

pub fn default_index_root() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("fb-index")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_toml_keeps_defaults() {
        let raw = r#"
            port = 7000

            [engine]
            index_root = "/tmp/idx"

            [[projects]]
            name = "p"
            roots = ["/src/p"]
        "#;
        let config: DaemonConfig = toml::from_str(raw).unwrap();
        assert_eq!(config.port, 7000);
        assert_eq!(config.engine.index_root, PathBuf::from("/tmp/idx"));
        assert!(config.engine.respect_gitignore);
        assert_eq!(config.engine.cache_capacity, None);
        assert_eq!(config.event_channel_size, 4096);
        assert_eq!(config.projects.len(), 1);
        assert!(!config.source_globs.is_empty());

        let project: Project = (&config.projects[0]).into();
        assert!(project.contains_path(Path::new("/src/p/lib.rs")));
    }
}
