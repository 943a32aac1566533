//! Reader and writer for `KEY=VALUE` environment files.
//!
//! The same line format backs systemd `EnvironmentFile=` units, the
//! `os-release` file, and the update-channel configuration. Entries keep
//! their file order so that a rewritten file stays diffable against its
//! template.

use crate::error::{CommonError, Result};
use camino::Utf8Path;
use std::fmt;

/// An ordered set of environment assignments.
///
/// # Examples
///
/// ```
/// use nodeprep_common::env_file::EnvFile;
///
/// let mut env = EnvFile::parse("# comment\nA=1\nB=\"two\"\n");
/// assert_eq!(env.get("B"), Some("two"));
///
/// env.set("A", "3");
/// assert_eq!(env.to_string(), "A=3\nB=two\n");
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvFile {
    entries: Vec<(String, String)>,
}

impl EnvFile {
    /// Parses file contents.
    ///
    /// Blank lines and `#` comments are skipped, as are lines without an
    /// `=`. Values lose one layer of matching single or double quotes. A
    /// repeated key keeps its first position and its last value.
    #[must_use]
    pub fn parse(contents: &str) -> Self {
        let mut env = Self::default();
        for (number, raw) in contents.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                log::debug!("ignoring line {} without assignment: {line:?}", number + 1);
                continue;
            };
            env.set(key.trim(), unquote(value.trim()));
        }
        env
    }

    /// Reads and parses the file at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`CommonError::Read`] if the file cannot be read.
    pub fn read(path: &Utf8Path) -> Result<Self> {
        std::fs::read_to_string(path)
            .map(|contents| Self::parse(&contents))
            .map_err(|source| CommonError::Read {
                path: path.to_owned(),
                source,
            })
    }

    /// Reads the file at `path`, treating a missing file as empty.
    ///
    /// # Errors
    ///
    /// Returns [`CommonError::Read`] for failures other than absence.
    pub fn read_optional(path: &Utf8Path) -> Result<Option<Self>> {
        match std::fs::read_to_string(path) {
            Ok(contents) => Ok(Some(Self::parse(&contents))),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(CommonError::Read {
                path: path.to_owned(),
                source,
            }),
        }
    }

    /// Returns the value assigned to `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(name, _)| name == key)
            .map(|(_, value)| value.as_str())
    }

    /// Assigns `value` to `key`, appending the key when it is new.
    pub fn set(&mut self, key: &str, value: &str) {
        match self.entries.iter_mut().find(|(name, _)| name == key) {
            Some(entry) => value.clone_into(&mut entry.1),
            None => self.entries.push((key.to_owned(), value.to_owned())),
        }
    }

    /// Iterates over the assignments in file order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .map(|(key, value)| (key.as_str(), value.as_str()))
    }

    /// Writes the rendered file to `path`, replacing any previous content.
    ///
    /// # Errors
    ///
    /// Returns [`CommonError::Write`] if the file cannot be written.
    pub fn write(&self, path: &Utf8Path) -> Result<()> {
        std::fs::write(path, self.to_string()).map_err(|source| CommonError::Write {
            path: path.to_owned(),
            source,
        })
    }
}

impl fmt::Display for EnvFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (key, value) in &self.entries {
            writeln!(f, "{key}={value}")?;
        }
        Ok(())
    }
}

fn unquote(value: &str) -> &str {
    ['"', '\'']
        .iter()
        .find_map(|quote| {
            value
                .strip_prefix(*quote)
                .and_then(|rest| rest.strip_suffix(*quote))
        })
        .unwrap_or(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::bare("A=1", "1")]
    #[case::double_quoted("A=\"1 2\"", "1 2")]
    #[case::single_quoted("A='x'", "x")]
    #[case::unbalanced("A=\"x", "\"x")]
    #[case::embedded_equals("A=b=c", "b=c")]
    fn parses_values(#[case] line: &str, #[case] expected: &str) {
        assert_eq!(EnvFile::parse(line).get("A"), Some(expected));
    }

    #[test]
    fn skips_comments_blanks_and_garbage() {
        let env = EnvFile::parse("\n# A=0\nnot an entry\nA=1\n");
        assert_eq!(env.iter().count(), 1);
        assert_eq!(env.get("A"), Some("1"));
    }

    #[test]
    fn set_replaces_in_place() {
        let mut env = EnvFile::parse("A=1\nB=2\nC=3\n");
        env.set("B", "x");
        env.set("D", "4");
        assert_eq!(env.to_string(), "A=1\nB=x\nC=3\nD=4\n");
    }

    #[test]
    fn read_optional_tolerates_absence() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = Utf8Path::from_path(dir.path())
            .expect("utf8 temp dir")
            .join("missing.env");
        assert!(EnvFile::read_optional(&path).expect("read").is_none());
    }

    #[test]
    fn write_then_read_preserves_order() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = Utf8Path::from_path(dir.path())
            .expect("utf8 temp dir")
            .join("kubelet.env");
        let env = EnvFile::parse("Z=1\nA=2\n");
        env.write(&path).expect("write");
        let keys: Vec<_> = EnvFile::read(&path)
            .expect("read")
            .iter()
            .map(|(key, _)| key.to_owned())
            .collect();
        assert_eq!(keys, ["Z", "A"]);
    }
}
