//! `.pgpass` password file lookup.
//!
//! One entry per line, `host:port:dbname:user:password`, where `*` matches
//! anything and `\` escapes `:`, `\` and `*`.
use std::path::PathBuf;

use super::ConfigParseError;

/// Look up the password for a connection candidate.
///
/// A missing file is not an error (the common case); an unreadable or
/// malformed one is.
pub(crate) fn lookup(
    path: Option<&str>,
    host: &str,
    port: u16,
    dbname: &str,
    user: &str,
) -> Result<Option<String>, ConfigParseError> {
    let path = match path {
        Some(path) => PathBuf::from(path),
        None => match std::env::var_os("HOME") {
            Some(home) => PathBuf::from(home).join(".pgpass"),
            None => return Ok(None),
        },
    };

    let contents = match std::fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(ConfigParseError::Io { path: path.display().to_string(), err })
        }
    };

    let port = port.to_string();
    for (n, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let fields = split_fields(line).ok_or(ConfigParseError::File {
            kind: "password",
            path: path.display().to_string(),
            line: n + 1,
        })?;
        if matches(&fields.0, host)
            && matches(&fields.1, &port)
            && matches(&fields.2, dbname)
            && matches(&fields.3, user)
        {
            return Ok(Some(fields.4));
        }
    }
    Ok(None)
}

fn matches(pattern: &str, value: &str) -> bool {
    pattern == "*" || pattern == value
}

/// Split one line into its five fields, honoring backslash escapes.
fn split_fields(line: &str) -> Option<(String, String, String, String, String)> {
    let mut fields = Vec::with_capacity(5);
    let mut current = String::new();
    let mut chars = line.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => current.push(chars.next()?),
            ':' if fields.len() < 4 => fields.push(std::mem::take(&mut current)),
            c => current.push(c),
        }
    }
    fields.push(current);
    let mut fields = fields.into_iter();
    Some((fields.next()?, fields.next()?, fields.next()?, fields.next()?, fields.next()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_pgpass(contents: &str) -> (tempdir::TempDir, String) {
        let dir = tempdir::TempDir::new();
        let path = dir.path("pgpass");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        (dir, path)
    }

    // minimal scratch-dir helper, no external crates
    mod tempdir {
        pub struct TempDir(std::path::PathBuf);

        impl TempDir {
            pub fn new() -> Self {
                static SEQ: std::sync::atomic::AtomicUsize = std::sync::atomic::AtomicUsize::new(0);
                let seq = SEQ.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                let mut path = std::env::temp_dir();
                path.push(format!("postwire-test-{}-{seq}", std::process::id()));
                std::fs::create_dir_all(&path).unwrap();
                Self(path)
            }

            pub fn path(&self, name: &str) -> String {
                self.0.join(name).display().to_string()
            }
        }

        impl Drop for TempDir {
            fn drop(&mut self) {
                let _ = std::fs::remove_dir_all(&self.0);
            }
        }
    }

    #[test]
    fn exact_match_wins() {
        let (_dir, path) = write_pgpass(
            "# comment\n\
             db1:5432:app:alice:secret1\n\
             *:*:*:alice:fallback\n",
        );
        let found = lookup(Some(&path), "db1", 5432, "app", "alice").unwrap();
        assert_eq!(found.as_deref(), Some("secret1"));
    }

    #[test]
    fn wildcards_match_anything() {
        let (_dir, path) = write_pgpass("*:*:*:alice:fallback\n");
        let found = lookup(Some(&path), "other", 9999, "whatever", "alice").unwrap();
        assert_eq!(found.as_deref(), Some("fallback"));
    }

    #[test]
    fn no_entry_yields_none() {
        let (_dir, path) = write_pgpass("db1:5432:app:bob:secret\n");
        assert_eq!(lookup(Some(&path), "db1", 5432, "app", "alice").unwrap(), None);
    }

    #[test]
    fn escaped_colon_in_password() {
        let (_dir, path) = write_pgpass("db1:5432:app:alice:se\\:cret\n");
        let found = lookup(Some(&path), "db1", 5432, "app", "alice").unwrap();
        assert_eq!(found.as_deref(), Some("se:cret"));
    }

    #[test]
    fn missing_file_is_not_an_error() {
        assert_eq!(
            lookup(Some("/nonexistent/pgpass"), "db", 5432, "app", "alice").unwrap(),
            None
        );
    }

    #[test]
    fn short_line_is_malformed() {
        let (_dir, path) = write_pgpass("db1:5432:app\n");
        assert!(matches!(
            lookup(Some(&path), "db1", 5432, "app", "alice"),
            Err(ConfigParseError::File { kind: "password", .. })
        ));
    }
}
