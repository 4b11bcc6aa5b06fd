//! Secrets file parsing.

use std::collections::HashMap;
use std::path::Path;

use crate::error::{Error, Result};

/// Read a `.env`-style secrets file (`KEY=VALUE` per line).
///
/// Lines starting with `#` are comments, blank lines are skipped, and a
/// matching pair of surrounding quotes is stripped from values.
pub fn load_secrets(path: &Path) -> Result<HashMap<String, String>> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Parse(format!("opening secrets file {}: {}", path.display(), e)))?;

    let mut secrets = HashMap::new();
    for (idx, raw) in content.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((key, value)) = line.split_once('=') else {
            return Err(Error::Parse(format!(
                "secrets file line {}: invalid format (expected KEY=VALUE)",
                idx + 1
            )));
        };

        let key = key.trim();
        let mut value = value.trim();
        if value.len() >= 2 {
            let first = value.as_bytes()[0];
            let last = value.as_bytes()[value.len() - 1];
            if (first == b'"' && last == b'"') || (first == b'\'' && last == b'\'') {
                value = &value[1..value.len() - 1];
            }
        }

        secrets.insert(key.to_string(), value.to_string());
    }

    Ok(secrets)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_secrets() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".env");
        std::fs::write(
            &path,
            r#"# Database config
DB_HOST=localhost
DB_PORT=5432
DB_PASSWORD="super secret"
API_KEY='sk-test-123'

# Empty line above is fine
SIMPLE=value
"#,
        )
        .unwrap();

        let secrets = load_secrets(&path).unwrap();
        assert_eq!(secrets.len(), 5);
        assert_eq!(secrets["DB_HOST"], "localhost");
        assert_eq!(secrets["DB_PORT"], "5432");
        assert_eq!(secrets["DB_PASSWORD"], "super secret");
        assert_eq!(secrets["API_KEY"], "sk-test-123");
        assert_eq!(secrets["SIMPLE"], "value");
    }

    #[test]
    fn test_load_secrets_invalid_format() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".env");
        std::fs::write(&path, "OK=1\nINVALID LINE WITHOUT EQUALS\n").unwrap();

        let err = load_secrets(&path).unwrap_err();
        assert!(err.to_string().contains("line 2"));
    }

    #[test]
    fn test_load_secrets_mismatched_quotes_kept() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".env");
        std::fs::write(&path, "ODD=\"half quoted\n").unwrap();

        let secrets = load_secrets(&path).unwrap();
        assert_eq!(secrets["ODD"], "\"half quoted");
    }

    #[test]
    fn test_load_secrets_missing_file() {
        let err = load_secrets(Path::new("/nonexistent/.env")).unwrap_err();
        assert!(err.to_string().contains("opening secrets file"));
    }
}
