//! Typed wrapper over the `torcx` package-manager CLI.
//!
//! Every JSON reply is an envelope of the form `{"kind": ..., "value": ...}`;
//! the kind is not checked here.

use crate::exec::{CommandExecutor, ExecError, stderr_text};
use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

/// Default location of the package manager.
pub const DEFAULT_TORCX_BIN: &str = "/usr/bin/torcx";

/// Profile created when the node has none of its own.
pub const DEFAULT_PROFILE_NAME: &str = "tectonic";

/// Name of the profile shipped with the OS image.
pub const VENDOR_PROFILE_NAME: &str = "vendor";

/// Errors raised while driving the package manager.
#[derive(Debug, Error)]
pub enum TorcxError {
    /// The package manager could not be run.
    #[error("failed to run torcx {args}")]
    Command {
        /// The subcommand and its arguments.
        args: String,
        /// The subprocess failure.
        #[source]
        source: ExecError,
    },

    /// The package manager exited unsuccessfully.
    #[error("torcx {args} failed: {stderr}")]
    Failed {
        /// The subcommand and its arguments.
        args: String,
        /// Captured standard error.
        stderr: String,
    },

    /// A JSON reply could not be decoded.
    #[error("unexpected output from torcx {args}")]
    Parse {
        /// The subcommand and its arguments.
        args: String,
        /// The decoding failure.
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Deserialize)]
struct Envelope<T> {
    value: T,
}

/// One archive known to the package manager.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ImageEntry {
    /// Package name.
    pub name: String,
    /// Package version.
    pub reference: String,
    /// Archive location.
    #[serde(default)]
    pub filepath: String,
}

/// Profile state reported by `torcx profile list`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(default)]
pub struct ProfileList {
    /// Profiles shipped below the user profile.
    pub lower_profile_names: Vec<String>,
    /// The user profile in effect, if any.
    pub user_profile_name: Option<String>,
    /// Path of the profile the running system booted with.
    pub current_profile_path: Option<String>,
    /// Profile selected for the next boot.
    pub next_profile_name: Option<String>,
    /// Every known profile.
    pub profiles: Vec<String>,
}

/// Runs `torcx` subcommands through a [`CommandExecutor`].
pub struct TorcxClient<'a> {
    executor: &'a dyn CommandExecutor,
    binary: Utf8PathBuf,
}

impl<'a> TorcxClient<'a> {
    /// Creates a client that runs `binary`.
    #[must_use]
    pub fn new(executor: &'a dyn CommandExecutor, binary: &Utf8Path) -> Self {
        Self {
            executor,
            binary: binary.to_owned(),
        }
    }

    fn run(&self, args: &[&str]) -> Result<Vec<u8>, TorcxError> {
        let joined = args.join(" ");
        log::debug!("executing {} {joined}", self.binary);
        let output = self
            .executor
            .run(self.binary.as_str(), args)
            .map_err(|source| TorcxError::Command {
                args: joined.clone(),
                source,
            })?;
        if !output.status.success() {
            return Err(TorcxError::Failed {
                args: joined,
                stderr: stderr_text(&output),
            });
        }
        Ok(output.stdout)
    }

    fn run_json<T: DeserializeOwned>(&self, args: &[&str]) -> Result<T, TorcxError> {
        let stdout = self.run(args)?;
        serde_json::from_slice::<Envelope<T>>(&stdout)
            .map(|envelope| envelope.value)
            .map_err(|source| TorcxError::Parse {
                args: args.join(" "),
                source,
            })
    }

    /// Checks that the package manager can be executed.
    ///
    /// # Errors
    ///
    /// Returns a [`TorcxError`] when `torcx help` fails.
    pub fn check_available(&self) -> Result<(), TorcxError> {
        self.run(&["help"]).map(|_| ())
    }

    /// Lists archives named `name` visible to `os_version`.
    ///
    /// # Errors
    ///
    /// Returns a [`TorcxError`] when the listing fails or is malformed.
    pub fn image_list(&self, os_version: &str, name: &str) -> Result<Vec<ImageEntry>, TorcxError> {
        self.run_json(&["image", "list", "-n", os_version, name])
    }

    /// Returns `true` when `name:version` is already in a store for
    /// `os_version`. A failed listing counts as absent.
    #[must_use]
    pub fn has_image(&self, os_version: &str, name: &str, version: &str) -> bool {
        self.image_list(os_version, name).map_or_else(
            |err| {
                log::debug!("treating {name}:{version} as absent for OS {os_version}: {err}");
                false
            },
            |images| {
                images
                    .iter()
                    .any(|image| image.name == name && image.reference == version)
            },
        )
    }

    /// Reports the known profiles.
    ///
    /// # Errors
    ///
    /// Returns a [`TorcxError`] when the listing fails or is malformed.
    pub fn profile_list(&self) -> Result<ProfileList, TorcxError> {
        self.run_json(&["profile", "list"])
    }

    /// Creates an empty profile.
    ///
    /// # Errors
    ///
    /// Returns a [`TorcxError`] when the profile cannot be created.
    pub fn profile_new(&self, profile: &str) -> Result<(), TorcxError> {
        self.run(&["profile", "new", "--name", profile]).map(|_| ())
    }

    /// Adds `name:version` to `profile`, even if not yet in a store.
    ///
    /// # Errors
    ///
    /// Returns a [`TorcxError`] when the profile cannot be updated.
    pub fn use_image(&self, profile: &str, name: &str, version: &str) -> Result<(), TorcxError> {
        let image = format!("{name}:{version}");
        self.run(&[
            "profile",
            "use-image",
            "--allow=missing",
            "--name",
            profile,
            &image,
        ])
        .map(|_| ())
    }

    /// Selects `profile` for the next boot.
    ///
    /// # Errors
    ///
    /// Returns a [`TorcxError`] when the selection fails.
    pub fn set_next_profile(&self, profile: &str) -> Result<(), TorcxError> {
        self.run(&["profile", "set-next", profile]).map(|_| ())
    }

    /// Picks the profile to modify.
    ///
    /// A next profile other than the vendor one is reused. Otherwise
    /// `configured` is created if missing and returned.
    ///
    /// # Errors
    ///
    /// Returns a [`TorcxError`] when profiles cannot be listed or created.
    pub fn select_profile(&self, configured: &str) -> Result<String, TorcxError> {
        let profiles = self.profile_list()?;
        if let Some(next) = profiles
            .next_profile_name
            .filter(|next| next != VENDOR_PROFILE_NAME)
        {
            log::debug!("torcx profile {next} already selected; reusing it");
            return Ok(next);
        }

        if !profiles.profiles.iter().any(|name| name == configured) {
            log::debug!("creating torcx profile {configured}");
            self.profile_new(configured)?;
        }
        Ok(configured.to_owned())
    }

    /// Adds `name:version` to the selected profile and schedules it for the
    /// next boot. Returns the profile used.
    ///
    /// # Errors
    ///
    /// Returns a [`TorcxError`] when any profile step fails.
    pub fn activate(
        &self,
        configured_profile: &str,
        name: &str,
        version: &str,
    ) -> Result<String, TorcxError> {
        let profile = self.select_profile(configured_profile)?;
        self.use_image(&profile, name, version)?;
        self.set_next_profile(&profile)?;
        log::info!("{name}:{version} scheduled in torcx profile {profile}");
        Ok(profile)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{ExpectedCall, StubExecutor, failure_output, stdout_output};
    use rstest::rstest;

    const BIN: &str = "/usr/bin/torcx";

    fn call(args: Vec<&'static str>, stdout: &str) -> ExpectedCall {
        ExpectedCall {
            cmd: BIN,
            args,
            result: Ok(stdout_output(stdout)),
        }
    }

    fn profile_list_json(next: Option<&str>, profiles: &[&str]) -> String {
        serde_json::json!({
            "kind": "profile-list-v0",
            "value": {
                "lower_profile_names": ["vendor"],
                "user_profile_name": null,
                "current_profile_path": "/run/torcx/profile.json",
                "next_profile_name": next,
                "profiles": profiles,
            }
        })
        .to_string()
    }

    #[test]
    fn image_list_decodes_envelope() {
        let executor = StubExecutor::new(vec![call(
            vec!["image", "list", "-n", "1576.4.0", "docker"],
            r#"{"kind":"image-list-v0","value":[{"name":"docker","reference":"17.09","filepath":"/var/lib/torcx/store/1576.4.0/docker:17.09.torcx.tgz"}]}"#,
        )]);
        let torcx = TorcxClient::new(&executor, Utf8Path::new(BIN));

        let images = torcx.image_list("1576.4.0", "docker").expect("images");

        assert_eq!(images.len(), 1);
        assert_eq!(images.first().map(|image| image.reference.as_str()), Some("17.09"));
        executor.assert_finished();
    }

    #[rstest]
    #[case::present("17.09", true)]
    #[case::other_version("1.12", false)]
    fn has_image_matches_name_and_reference(#[case] version: &str, #[case] expected: bool) {
        let executor = StubExecutor::new(vec![call(
            vec!["image", "list", "-n", "1576.4.0", "docker"],
            r#"{"kind":"image-list-v0","value":[{"name":"docker","reference":"17.09","filepath":""}]}"#,
        )]);
        let torcx = TorcxClient::new(&executor, Utf8Path::new(BIN));

        assert_eq!(torcx.has_image("1576.4.0", "docker", version), expected);
    }

    #[test]
    fn failed_listing_counts_as_absent() {
        let executor = StubExecutor::new(vec![ExpectedCall {
            cmd: BIN,
            args: vec!["image", "list", "-n", "1576.4.0", "docker"],
            result: Ok(failure_output("no such store")),
        }]);
        let torcx = TorcxClient::new(&executor, Utf8Path::new(BIN));

        assert!(!torcx.has_image("1576.4.0", "docker", "17.09"));
    }

    #[test]
    fn non_vendor_next_profile_is_reused() {
        let executor = StubExecutor::new(vec![call(
            vec!["profile", "list"],
            &profile_list_json(Some("custom"), &["custom"]),
        )]);
        let torcx = TorcxClient::new(&executor, Utf8Path::new(BIN));

        assert_eq!(torcx.select_profile("tectonic").expect("profile"), "custom");
        executor.assert_finished();
    }

    #[test]
    fn vendor_next_profile_creates_configured_profile() {
        let executor = StubExecutor::new(vec![
            call(vec!["profile", "list"], &profile_list_json(Some("vendor"), &[])),
            call(vec!["profile", "new", "--name", "tectonic"], ""),
        ]);
        let torcx = TorcxClient::new(&executor, Utf8Path::new(BIN));

        assert_eq!(torcx.select_profile("tectonic").expect("profile"), "tectonic");
        executor.assert_finished();
    }

    #[test]
    fn existing_configured_profile_is_not_recreated() {
        let executor = StubExecutor::new(vec![call(
            vec!["profile", "list"],
            &profile_list_json(None, &["tectonic"]),
        )]);
        let torcx = TorcxClient::new(&executor, Utf8Path::new(BIN));

        assert_eq!(torcx.select_profile("tectonic").expect("profile"), "tectonic");
        executor.assert_finished();
    }

    #[test]
    fn activate_adds_image_and_sets_next_profile() {
        let executor = StubExecutor::new(vec![
            call(vec!["profile", "list"], &profile_list_json(None, &["tectonic"])),
            call(
                vec![
                    "profile",
                    "use-image",
                    "--allow=missing",
                    "--name",
                    "tectonic",
                    "docker:17.09",
                ],
                "",
            ),
            call(vec!["profile", "set-next", "tectonic"], ""),
        ]);
        let torcx = TorcxClient::new(&executor, Utf8Path::new(BIN));

        torcx.activate("tectonic", "docker", "17.09").expect("activated");
        executor.assert_finished();
    }

    #[test]
    fn failures_carry_stderr() {
        let executor = StubExecutor::new(vec![ExpectedCall {
            cmd: BIN,
            args: vec!["help"],
            result: Ok(failure_output("permission denied")),
        }]);
        let torcx = TorcxClient::new(&executor, Utf8Path::new(BIN));

        let err = torcx.check_available().expect_err("unavailable");
        assert!(matches!(err, TorcxError::Failed { ref stderr, .. } if stderr.contains("permission")));
    }

    #[test]
    fn malformed_reply_is_a_parse_error() {
        let executor = StubExecutor::new(vec![call(vec!["profile", "list"], "not json")]);
        let torcx = TorcxClient::new(&executor, Utf8Path::new(BIN));

        assert!(matches!(
            torcx.profile_list(),
            Err(TorcxError::Parse { .. })
        ));
    }
}
