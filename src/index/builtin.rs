use std::collections::HashMap;

use regex::Regex;
use wildmatch::WildMatch;

use crate::core::{ContentSnapshot, FileBasedIndexExtension, FileHandle, IndexId};

/// 标识符 → 在该文件中出现的次数
pub const IDENTIFIERS: IndexId<String, u32> = IndexId::new("Identifiers");

/// 文件名 → ()（不依赖内容）
pub const FILE_NAMES: IndexId<String, ()> = IndexId::new("FileNames");

pub const DEFAULT_IDENTIFIER_PATTERN: &str = r"[A-Za-z_][A-Za-z0-9_]*";

/// 文件名 glob 集合（匹配 basename）
#[derive(Debug)]
pub struct NameGlobs {
    globs: Vec<WildMatch>,
}

impl NameGlobs {
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Self {
        Self {
            globs: patterns.iter().map(|p| WildMatch::new(p.as_ref())).collect(),
        }
    }

    /// 空集合匹配一切
    pub fn matches(&self, file_name: &str) -> bool {
        self.globs.is_empty() || self.globs.iter().any(|g| g.matches(file_name))
    }
}

/// 源码标识符索引
pub struct IdentifierIndex {
    globs: NameGlobs,
    pattern: Regex,
    min_len: usize,
}

impl IdentifierIndex {
    pub fn new<S: AsRef<str>>(globs: &[S]) -> Result<Self, regex::Error> {
        Self::with_pattern(globs, DEFAULT_IDENTIFIER_PATTERN)
    }

    pub fn with_pattern<S: AsRef<str>>(globs: &[S], pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            globs: NameGlobs::new(globs),
            pattern: Regex::new(pattern)?,
            min_len: 2,
        })
    }
}

impl FileBasedIndexExtension for IdentifierIndex {
    type Key = String;
    type Value = u32;

    fn name(&self) -> IndexId<String, u32> {
        IDENTIFIERS
    }

    fn map(&self, content: &ContentSnapshot) -> Vec<(String, u32)> {
        let mut counts: HashMap<&str, u32> = HashMap::new();
        for m in self.pattern.find_iter(&content.text) {
            if m.as_str().len() >= self.min_len {
                *counts.entry(m.as_str()).or_insert(0) += 1;
            }
        }
        counts
            .into_iter()
            .map(|(ident, n)| (ident.to_string(), n))
            .collect()
    }

    fn accepts(&self, file: &FileHandle) -> bool {
        file.file_name().is_some_and(|n| self.globs.matches(n))
    }

    fn version(&self) -> u32 {
        1
    }
}

/// 文件名索引：只看路径，引擎不会为它加载内容
pub struct FileNameIndex;

impl FileBasedIndexExtension for FileNameIndex {
    type Key = String;
    type Value = ();

    fn name(&self) -> IndexId<String, ()> {
        FILE_NAMES
    }

    fn map(&self, content: &ContentSnapshot) -> Vec<(String, ())> {
        content
            .file_name()
            .map(|n| vec![(n.to_string(), ())])
            .unwrap_or_default()
    }

    fn accepts(&self, _file: &FileHandle) -> bool {
        true
    }

    fn depends_on_content(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifiers_are_counted_per_file() {
        let index = IdentifierIndex::new(&["*.rs"]).unwrap();
        let snap = ContentSnapshot::new(1, "/p/a.rs", "fn main() { let x = foo(foo); }");
        let mut pairs = index.map(&snap);
        pairs.sort();
        assert_eq!(
            pairs,
            vec![
                ("fn".to_string(), 1),
                ("foo".to_string(), 2),
                ("let".to_string(), 1),
                ("main".to_string(), 1),
            ]
        );
    }

    #[test]
    fn globs_select_files_by_name() {
        let index = IdentifierIndex::new(&["*.rs", "*.py"]).unwrap();
        assert!(index.accepts(&FileHandle::new(1, "/p/lib.rs")));
        assert!(index.accepts(&FileHandle::new(2, "/p/tool.py")));
        assert!(!index.accepts(&FileHandle::new(3, "/p/readme.md")));
        assert!(IdentifierIndex::with_pattern(&["*"], "(").is_err());
    }

    #[test]
    fn file_name_index_ignores_text() {
        let snap = ContentSnapshot::new(4, "/p/dir/Cargo.toml", "");
        assert_eq!(FileNameIndex.map(&snap), vec![("Cargo.toml".to_string(), ())]);
        assert!(!FileNameIndex.depends_on_content());
    }
}
