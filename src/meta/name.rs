//! Bucket and key name validation (S3-compatible rules).

use crate::error::{Result, StoreError};

/// Bucket names must be at least 3 characters of lowercase ASCII letters,
/// digits, dots and hyphens, and must begin and end with a letter or digit.
pub fn validate_bucket_name(bucket: &str) -> Result<()> {
    if bucket.len() < 3 {
        return Err(StoreError::InvalidArgument(format!(
            "bucket name '{bucket}' is too short (minimum 3 characters)"
        )));
    }
    let valid_char = |c: char| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '.' || c == '-';
    if !bucket.chars().all(valid_char) {
        return Err(StoreError::InvalidArgument(format!(
            "bucket name '{bucket}' contains invalid characters"
        )));
    }
    let edge_ok = |c: Option<char>| c.is_some_and(|c| c.is_ascii_lowercase() || c.is_ascii_digit());
    if !edge_ok(bucket.chars().next()) || !edge_ok(bucket.chars().last()) {
        return Err(StoreError::InvalidArgument(format!(
            "bucket name '{bucket}' must begin and end with a letter or digit"
        )));
    }
    Ok(())
}

/// Keys must be non-empty, must not start or end with `/`, and must not
/// contain a `..` path segment.
pub fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(StoreError::InvalidArgument("key must not be empty".into()));
    }
    if key.starts_with('/') || key.ends_with('/') {
        return Err(StoreError::InvalidArgument(format!(
            "key '{key}' must not start or end with '/'"
        )));
    }
    if key.split('/').any(|segment| segment == "..") {
        return Err(StoreError::InvalidArgument(format!(
            "key '{key}' must not contain '..' segments"
        )));
    }
    Ok(())
}

pub fn validate(bucket: &str, key: &str) -> Result<()> {
    validate_bucket_name(bucket)?;
    validate_key(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_names() {
        assert!(validate_bucket_name("data").is_ok());
        assert!(validate_bucket_name("my-bucket.01").is_ok());
        assert!(validate_bucket_name("ab").is_err());
        assert!(validate_bucket_name("Data").is_err());
        assert!(validate_bucket_name("-edge").is_err());
        assert!(validate_bucket_name("edge-").is_err());
    }

    #[test]
    fn test_keys() {
        assert!(validate_key("a/b/c.txt").is_ok());
        assert!(validate_key("").is_err());
        assert!(validate_key("/abs").is_err());
        assert!(validate_key("dir/").is_err());
        assert!(validate_key("a/../b").is_err());
        assert!(validate_key("a/..b/c").is_ok());
    }
}
