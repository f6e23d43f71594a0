//! Shared domain types

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::RowsyncError;

/// Identity of one logical import file: a type name plus an id.
///
/// Every raw and parsed row is scoped by a `FileRef`, so two files of different
/// types may share the same numeric id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FileRef {
    pub file_type: String,
    pub file_id: i64,
}

impl FileRef {
    pub fn new(file_type: impl Into<String>, file_id: i64) -> Self {
        Self {
            file_type: file_type.into(),
            file_id,
        }
    }
}

impl fmt::Display for FileRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.file_type, self.file_id)
    }
}

impl FromStr for FileRef {
    type Err = RowsyncError;

    /// Parse the `type#id` form produced by `Display`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (file_type, file_id) = s
            .rsplit_once('#')
            .ok_or_else(|| RowsyncError::InvalidFileRef(format!("missing '#' in '{}'", s)))?;

        if file_type.is_empty() {
            return Err(RowsyncError::InvalidFileRef(format!("empty file type in '{}'", s)));
        }

        let file_id = file_id
            .parse()
            .map_err(|_| RowsyncError::InvalidFileRef(format!("invalid file id in '{}'", s)))?;

        Ok(Self::new(file_type, file_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_round_trips_through_from_str() {
        let file = FileRef::new("csv_files", 7);
        assert_eq!(file.to_string(), "csv_files#7");
        assert_eq!("csv_files#7".parse::<FileRef>().unwrap(), file);
    }

    #[test]
    fn test_from_str_rejects_malformed() {
        assert!("csv_files".parse::<FileRef>().is_err());
        assert!("#7".parse::<FileRef>().is_err());
        assert!("csv_files#seven".parse::<FileRef>().is_err());
    }

    #[test]
    fn test_same_id_different_type_are_distinct() {
        assert_ne!(FileRef::new("a", 1), FileRef::new("b", 1));
    }
}
