//! `.pg_service.conf` connection service files.
//!
//! INI sections named after services; each section is a bundle of
//! keyword/value pairs merged under the explicit settings.
use std::{collections::BTreeMap, path::PathBuf};

use super::ConfigParseError;

/// Merge the named service's keywords into `keywords`, without overriding
/// anything already set.
pub(crate) fn apply(
    name: &str,
    keywords: &mut BTreeMap<String, String>,
) -> Result<(), ConfigParseError> {
    let path = match keywords.get("servicefile") {
        Some(path) => PathBuf::from(path),
        None => match std::env::var_os("PGSERVICEFILE") {
            Some(path) => PathBuf::from(path),
            None => match std::env::var_os("HOME") {
                Some(home) => PathBuf::from(home).join(".pg_service.conf"),
                None => return Err(ConfigParseError::ServiceNotFound(name.to_string())),
            },
        },
    };

    let contents = std::fs::read_to_string(&path)
        .map_err(|err| ConfigParseError::Io { path: path.display().to_string(), err })?;

    let section = parse(&contents, &path.display().to_string())?
        .remove(name)
        .ok_or_else(|| ConfigParseError::ServiceNotFound(name.to_string()))?;

    for (keyword, value) in section {
        keywords.entry(keyword).or_insert(value);
    }
    Ok(())
}

fn parse(
    contents: &str,
    path: &str,
) -> Result<BTreeMap<String, BTreeMap<String, String>>, ConfigParseError> {
    let mut services: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
    let mut current: Option<String> = None;

    for (n, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }

        let malformed = || ConfigParseError::File {
            kind: "service",
            path: path.to_string(),
            line: n + 1,
        };

        if let Some(rest) = line.strip_prefix('[') {
            let name = rest.strip_suffix(']').ok_or_else(malformed)?;
            if name.is_empty() {
                return Err(malformed());
            }
            services.entry(name.to_string()).or_default();
            current = Some(name.to_string());
            continue;
        }

        let (keyword, value) = line.split_once('=').ok_or_else(malformed)?;
        let section = current.as_ref().ok_or_else(malformed)?;
        services
            .get_mut(section)
            .expect("section inserted when entered")
            .insert(keyword.trim().to_string(), value.trim().to_string());
    }

    Ok(services)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
# global comment
[mydb]
host = db.internal
port = 5433
user = svc

[other]
host=elsewhere
";

    #[test]
    fn section_lookup() {
        let services = parse(SAMPLE, "test").unwrap();
        let mydb = &services["mydb"];
        assert_eq!(mydb["host"], "db.internal");
        assert_eq!(mydb["port"], "5433");
        assert_eq!(mydb["user"], "svc");
        assert_eq!(services["other"]["host"], "elsewhere");
    }

    #[test]
    fn keyword_outside_section_is_malformed() {
        let err = parse("host=oops\n", "test").unwrap_err();
        assert!(matches!(err, ConfigParseError::File { kind: "service", line: 1, .. }));
    }

    #[test]
    fn unterminated_section_is_malformed() {
        let err = parse("[mydb\nhost=x\n", "test").unwrap_err();
        assert!(matches!(err, ConfigParseError::File { kind: "service", .. }));
    }
}
