//! XML table file wrapper
//!
//! One engine owns one file; nothing else reads or writes it. Writes go
//! through a sibling temp file and a rename so a crash mid-dump never leaves
//! a half-written table document behind.

use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use xmltree::Element;

use crate::Result;

/// Handle to a single on-disk XML table document.
#[derive(Debug, Clone)]
pub struct DocumentFile {
    path: PathBuf,
}

impl DocumentFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Parse the document and return its root element.
    pub fn read(&self) -> Result<Element> {
        let file = File::open(&self.path)?;
        Ok(Element::parse(file)?)
    }

    /// Write the document, replacing any previous content atomically.
    pub fn write(&self, root: &Element) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let tmp = self.path.with_extension("xml.tmp");
        {
            let file = File::create(&tmp)?;
            let mut writer = BufWriter::new(file);
            root.write(&mut writer)?;
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use xmltree::XMLNode;

    #[test]
    fn test_write_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let file = DocumentFile::new(dir.path().join("t.xml"));
        assert!(!file.exists());

        let mut root = Element::new("table");
        root.attributes
            .insert("name".to_string(), "t".to_string());
        let mut row = Element::new("row");
        row.attributes.insert("id".to_string(), "a".to_string());
        row.children.push(XMLNode::Text("hello".to_string()));
        root.children.push(XMLNode::Element(row));

        file.write(&root).unwrap();
        assert!(file.exists());

        let read = file.read().unwrap();
        assert_eq!(read.name, "table");
        assert_eq!(read.attributes.get("name").map(String::as_str), Some("t"));
        let row = read.get_child("row").unwrap();
        assert_eq!(row.attributes.get("id").map(String::as_str), Some("a"));
    }

    #[test]
    fn test_overwrite_replaces_content() {
        let dir = tempfile::tempdir().unwrap();
        let file = DocumentFile::new(dir.path().join("t.xml"));

        let mut root = Element::new("table");
        root.attributes
            .insert("name".to_string(), "first".to_string());
        file.write(&root).unwrap();

        root.attributes
            .insert("name".to_string(), "second".to_string());
        file.write(&root).unwrap();

        let read = file.read().unwrap();
        assert_eq!(
            read.attributes.get("name").map(String::as_str),
            Some("second")
        );
    }
}
