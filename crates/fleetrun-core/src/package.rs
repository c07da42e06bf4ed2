//! Package manager family detection

use std::fmt;

use serde::{Deserialize, Serialize};

/// Package tooling family of a host, used to branch shell syntax
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PackageFamily {
    /// RHEL, CentOS, Fedora
    Rpm,
    /// Debian, Ubuntu
    Deb,
}

impl PackageFamily {
    /// Classify from the exit status of the marker-file probe
    #[must_use]
    pub fn from_probe_status(status: Option<i32>) -> Self {
        if status == Some(0) {
            PackageFamily::Rpm
        } else {
            PackageFamily::Deb
        }
    }

    /// Package manager binary
    #[must_use]
    pub fn manager(&self) -> &'static str {
        match self {
            PackageFamily::Rpm => "yum",
            PackageFamily::Deb => "apt-get",
        }
    }

    /// Build a non-interactive install command
    #[must_use]
    pub fn install_command(&self, packages: &[&str], use_sudo: bool) -> String {
        self.command("install", packages, use_sudo)
    }

    /// Build a non-interactive remove command
    #[must_use]
    pub fn remove_command(&self, packages: &[&str], use_sudo: bool) -> String {
        self.command("remove", packages, use_sudo)
    }

    fn command(&self, verb: &str, packages: &[&str], use_sudo: bool) -> String {
        let env = match self {
            PackageFamily::Rpm => "",
            PackageFamily::Deb => "DEBIAN_FRONTEND=noninteractive ",
        };
        let sudo = if use_sudo { "sudo " } else { "" };
        format!(
            "{sudo}{env}{} {verb} -y {}",
            self.manager(),
            packages.join(" ")
        )
    }
}

impl fmt::Display for PackageFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PackageFamily::Rpm => write!(f, "rpm"),
            PackageFamily::Deb => write!(f, "deb"),
        }
    }
}
