use std::collections::BTreeMap;
use std::fmt::Write;
use std::path::PathBuf;

/// Renders guest shell commands that mount virtio-fs shares.
#[derive(Debug, Clone, Default)]
pub struct MountHelper {
    shares: BTreeMap<String, PathBuf>,
}

impl MountHelper {
    pub fn new(shares: impl IntoIterator<Item = (String, PathBuf)>) -> Self {
        Self {
            shares: shares.into_iter().collect(),
        }
    }

    /// Mount tags in sorted order.
    pub fn tags(&self) -> Vec<&str> {
        self.shares.keys().map(String::as_str).collect()
    }

    pub fn has_shares(&self) -> bool {
        !self.shares.is_empty()
    }

    pub fn mount_command(&self, tag: &str, mountpoint: &str) -> String {
        let mp = quote(mountpoint);
        format!(
            "mkdir -p {mp} && mount -t virtiofs {} {mp}",
            quote(tag)
        )
    }

    /// A standalone `/bin/sh` script mounting every share under `base`.
    /// Empty when there is nothing to mount.
    pub fn mount_script(&self, base: &str) -> String {
        if self.shares.is_empty() {
            return String::new();
        }

        let mut script = String::from(
            "#!/bin/sh\n\
             # Mount host directories shared over virtio-fs.\n\
             if ! grep -q virtiofs /proc/filesystems; then\n\
             \x20   echo \"virtiofs is not supported by this kernel\" >&2\n\
             \x20   exit 1\n\
             fi\n",
        );

        for tag in self.shares.keys() {
            let mountpoint = format!("{}/{}", base.trim_end_matches('/'), tag);
            let mp = quote(&mountpoint);
            let t = quote(tag);
            let _ = write!(
                script,
                "\n# Mount {tag}\n\
                 if mountpoint -q {mp}; then\n\
                 \x20   echo \"{tag} already mounted at \"{mp}\n\
                 elif mkdir -p {mp} && mount -t virtiofs {t} {mp}; then\n\
                 \x20   echo \"Mounted {tag} at \"{mp}\n\
                 else\n\
                 \x20   echo \"Failed to mount {tag}\" >&2\n\
                 fi\n"
            );
        }
        script
    }
}

fn is_shell_safe(c: char) -> bool {
    c.is_ascii_alphanumeric() || "/._-+=:,@%".contains(c)
}

/// Single-quotes `s` for `/bin/sh` unless every character is safe bare.
pub fn quote(s: &str) -> String {
    if !s.is_empty() && s.chars().all(is_shell_safe) {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', r#"'"'"'"#))
}
