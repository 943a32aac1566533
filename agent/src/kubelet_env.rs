//! The kubelet environment file.
//!
//! Image tags cannot contain `+`, so the cluster version is stored in
//! `KUBELET_IMAGE_TAG` with `+` replaced by `_`.

use camino::Utf8Path;
use nodeprep_common::env_file::EnvFile;

/// Template written by the cluster installer.
pub const INSTALLER_ENV_PATH: &str = "/etc/kubernetes/installer/kubelet.env";

/// File sourced by the kubelet service.
pub const KUBELET_ENV_PATH: &str = "/etc/kubernetes/kubelet.env";

/// Key holding the kubelet image tag.
pub const IMAGE_TAG_KEY: &str = "KUBELET_IMAGE_TAG";

/// Converts a cluster version into an image tag.
///
/// # Examples
///
/// ```
/// use nodeprep_agent::kubelet_env::{image_tag_for, version_from_image_tag};
///
/// assert_eq!(image_tag_for("v1.8.4+coreos.0"), "v1.8.4_coreos.0");
/// assert_eq!(version_from_image_tag("v1.8.4_coreos.0"), "v1.8.4+coreos.0");
/// ```
#[must_use]
pub fn image_tag_for(cluster_version: &str) -> String {
    cluster_version.replace('+', "_")
}

/// Converts an image tag back into a cluster version.
#[must_use]
pub fn version_from_image_tag(tag: &str) -> String {
    tag.replace('_', "+")
}

/// Reads the cluster version recorded in an env file.
///
/// Returns `None` when the file or the key is absent or empty.
///
/// # Errors
///
/// Returns an error when the file exists but cannot be read.
pub fn cluster_version_from_env(path: &Utf8Path) -> nodeprep_common::Result<Option<String>> {
    let version = EnvFile::read_optional(path)?
        .and_then(|env| env.get(IMAGE_TAG_KEY).map(str::to_owned))
        .filter(|tag| !tag.is_empty())
        .map(|tag| version_from_image_tag(&tag));
    Ok(version)
}

/// Writes `dest` from `template` with the image tag set for
/// `cluster_version`. Other keys keep their order and values.
///
/// # Errors
///
/// Returns an error when the template cannot be read or `dest` cannot be
/// written.
pub fn write_kubelet_env(
    template: &Utf8Path,
    dest: &Utf8Path,
    cluster_version: &str,
) -> nodeprep_common::Result<()> {
    let mut env = EnvFile::read(template)?;
    env.set(IMAGE_TAG_KEY, &image_tag_for(cluster_version));
    log::info!("writing kubelet environment to {dest}");
    env.write(dest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::utf8_temp_dir;

    #[test]
    fn writer_replaces_tag_and_keeps_other_keys() {
        let (_guard, dir) = utf8_temp_dir();
        let template = dir.join("installer.env");
        std::fs::write(
            &template,
            "KUBELET_IMAGE_URL=quay.io/coreos/hyperkube\nKUBELET_IMAGE_TAG=v1.7.0_coreos.0\nKUBELET_OPTS=\"--v=2\"\n",
        )
        .expect("template");
        let dest = dir.join("kubelet.env");

        write_kubelet_env(&template, &dest, "v1.8.4+coreos.0").expect("written");

        let written = std::fs::read_to_string(&dest).expect("read");
        assert_eq!(
            written,
            "KUBELET_IMAGE_URL=quay.io/coreos/hyperkube\nKUBELET_IMAGE_TAG=v1.8.4_coreos.0\nKUBELET_OPTS=--v=2\n"
        );
    }

    #[test]
    fn writer_adds_missing_tag() {
        let (_guard, dir) = utf8_temp_dir();
        let template = dir.join("installer.env");
        std::fs::write(&template, "KUBELET_IMAGE_URL=quay.io/coreos/hyperkube\n").expect("template");
        let dest = dir.join("kubelet.env");

        write_kubelet_env(&template, &dest, "v1.8.4+coreos.0").expect("written");

        let env = EnvFile::read(&dest).expect("read");
        assert_eq!(env.get(IMAGE_TAG_KEY), Some("v1.8.4_coreos.0"));
    }

    #[test]
    fn version_is_read_back_from_tag() {
        let (_guard, dir) = utf8_temp_dir();
        let path = dir.join("kubelet.env");
        std::fs::write(&path, "KUBELET_IMAGE_TAG=\"v1.8.4_coreos.0\"\n").expect("env");

        assert_eq!(
            cluster_version_from_env(&path).expect("read").as_deref(),
            Some("v1.8.4+coreos.0")
        );
    }

    #[test]
    fn absent_file_or_key_yields_none() {
        let (_guard, dir) = utf8_temp_dir();
        assert_eq!(cluster_version_from_env(&dir.join("missing.env")).expect("read"), None);

        let path = dir.join("kubelet.env");
        std::fs::write(&path, "OTHER=1\n").expect("env");
        assert_eq!(cluster_version_from_env(&path).expect("read"), None);
    }
}
