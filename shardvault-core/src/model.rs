use crate::error::{Result, VaultError};
use crate::storage::shard::ShardKey;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Container format declared by the caller. The store never decodes pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ImageFormat {
    Jpeg,
    Png,
    Gif,
}

impl ImageFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ImageFormat::Jpeg => "jpg",
            ImageFormat::Png => "png",
            ImageFormat::Gif => "gif",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ImageFormat::Jpeg => "JPEG",
            ImageFormat::Png => "PNG",
            ImageFormat::Gif => "GIF",
        }
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ImageFormat {
    type Err = VaultError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "jpeg" | "jpg" => Ok(ImageFormat::Jpeg),
            "png" => Ok(ImageFormat::Png),
            "gif" => Ok(ImageFormat::Gif),
            other => Err(VaultError::InvalidRequest(format!(
                "unsupported image format: {}",
                other
            ))),
        }
    }
}

/// Authoritative row for a stored object. Only `tags` is mutable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredObject {
    pub id: i64,
    pub primary_hash: String,
    pub secondary_hash: String,
    pub shard1: String,
    pub shard2: String,
    pub sequence: u64,
    pub filename: String,
    pub format: ImageFormat,
    pub width: u32,
    pub height: u32,
    pub byte_size: u64,
    pub tags: String,
    pub has_extended_metadata: bool,
    pub created_at: DateTime<Utc>,
    pub owner_ref: Option<i64>,
}

impl StoredObject {
    pub fn shard(&self) -> ShardKey {
        ShardKey::new(self.shard1.clone(), self.shard2.clone())
    }

    /// `<shard1>/<shard2>/<filename>`, relative to the store root.
    pub fn relative_path(&self) -> String {
        format!("{}/{}/{}", self.shard1, self.shard2, self.filename)
    }

    pub fn address(&self) -> ObjectAddress {
        ObjectAddress {
            object_id: self.id,
            primary_hash: self.primary_hash.clone(),
            shard: self.shard(),
            sequence: self.sequence,
            filename: self.filename.clone(),
        }
    }
}

/// Row values for an object that has not been committed yet.
#[derive(Debug, Clone)]
pub struct NewObject {
    pub primary_hash: String,
    pub secondary_hash: String,
    pub shard: ShardKey,
    pub sequence: u64,
    pub format: ImageFormat,
    pub width: u32,
    pub height: u32,
    pub byte_size: u64,
    pub tags: String,
    pub owner_ref: Option<i64>,
    pub created_at: DateTime<Utc>,
}

impl NewObject {
    pub fn filename(&self) -> String {
        object_filename(self.sequence, self.format)
    }
}

pub fn object_filename(sequence: u64, format: ImageFormat) -> String {
    format!("{}.{}", sequence, format.extension())
}

/// Where a committed object lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectAddress {
    pub object_id: i64,
    pub primary_hash: String,
    pub shard: ShardKey,
    pub sequence: u64,
    pub filename: String,
}

impl ObjectAddress {
    pub fn relative_path(&self) -> String {
        format!("{}/{}", self.shard, self.filename)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_parse() {
        assert_eq!("JPEG".parse::<ImageFormat>().unwrap(), ImageFormat::Jpeg);
        assert_eq!("jpg".parse::<ImageFormat>().unwrap(), ImageFormat::Jpeg);
        assert_eq!(" png ".parse::<ImageFormat>().unwrap(), ImageFormat::Png);
        assert_eq!("Gif".parse::<ImageFormat>().unwrap(), ImageFormat::Gif);
        assert!(matches!(
            "webp".parse::<ImageFormat>(),
            Err(VaultError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_filename_uses_extension() {
        assert_eq!(object_filename(1, ImageFormat::Jpeg), "1.jpg");
        assert_eq!(object_filename(42, ImageFormat::Png), "42.png");
    }

    #[test]
    fn test_format_serializes_uppercase() {
        let json = serde_json::to_string(&ImageFormat::Jpeg).unwrap();
        assert_eq!(json, "\"JPEG\"");
    }

    #[test]
    fn test_address_matches_relative_path() {
        let object = StoredObject {
            id: 3,
            primary_hash: "0a1b2c3d4e5f6a7b".to_string(),
            secondary_hash: "0".repeat(40),
            shard1: "0a".to_string(),
            shard2: "1b".to_string(),
            sequence: 12,
            filename: object_filename(12, ImageFormat::Gif),
            format: ImageFormat::Gif,
            width: 1,
            height: 1,
            byte_size: 1,
            tags: String::new(),
            has_extended_metadata: false,
            created_at: Utc::now(),
            owner_ref: None,
        };

        let address = object.address();
        assert_eq!(address.shard, ShardKey::new("0a", "1b"));
        assert_eq!(address.relative_path(), "0a/1b/12.gif");
        assert_eq!(address.relative_path(), object.relative_path());
    }
}
