//! Agent binary descriptors and local tools management.
//!
//! Agent tools are unpacked under `<data_dir>/tools/<binary>/`, one directory
//! per binary version. Each agent runs out of `<data_dir>/tools/<agent>`, a
//! symlink to one of those directories. Changing an agent's tools repoints
//! that symlink; restarting the process is left to the external supervisor.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::error::{AgentError, Result};

// =============================================================================
// Version
// =============================================================================

/// An agent version number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl Version {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for Version {
    type Err = AgentError;

    /// Accepts `major.minor` or `major.minor.patch`.
    fn from_str(s: &str) -> Result<Self> {
        let invalid = || AgentError::Tools(format!("invalid version {s:?}"));
        let parts = s
            .split('.')
            .map(|p| p.parse::<u32>().map_err(|_| invalid()))
            .collect::<Result<Vec<_>>>()?;

        match parts.as_slice() {
            [major, minor] => Ok(Self::new(*major, *minor, 0)),
            [major, minor, patch] => Ok(Self::new(*major, *minor, *patch)),
            _ => Err(invalid()),
        }
    }
}

// =============================================================================
// Binary
// =============================================================================

/// A specific agent binary: version plus the platform it was built for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Binary {
    pub version: Version,
    pub series: String,
    pub arch: String,
}

impl Binary {
    /// The binary of the running process.
    pub fn current() -> Self {
        let version = env!("CARGO_PKG_VERSION")
            .parse()
            .unwrap_or(Version::new(0, 0, 0));
        Self {
            version,
            series: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
        }
    }
}

impl fmt::Display for Binary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.version, self.series, self.arch)
    }
}

impl FromStr for Binary {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.splitn(3, '-');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(version), Some(series), Some(arch)) if !series.is_empty() && !arch.is_empty() => {
                Ok(Self {
                    version: version.parse()?,
                    series: series.to_string(),
                    arch: arch.to_string(),
                })
            }
            _ => Err(AgentError::Tools(format!("invalid binary version {s:?}"))),
        }
    }
}

impl serde::Serialize for Binary {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> serde::Deserialize<'de> for Binary {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Tools
// =============================================================================

/// Agent tools that have been made available locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tools {
    pub binary: Binary,
    pub dir: PathBuf,
}

/// Materializes agent binaries on the local machine.
#[async_trait]
pub trait ToolsManager: Send + Sync {
    /// Switch `agent` over to run `binary`.
    async fn change_agent_tools(&self, agent: &str, binary: &Binary) -> Result<Tools>;
}

/// Tools kept under a data directory.
#[derive(Debug, Clone)]
pub struct LocalTools {
    tools_dir: PathBuf,
}

impl LocalTools {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            tools_dir: data_dir.as_ref().join("tools"),
        }
    }

    /// Directory holding the unpacked tools for `binary`.
    pub fn binary_dir(&self, binary: &Binary) -> PathBuf {
        self.tools_dir.join(binary.to_string())
    }

    /// Symlink the named agent runs from.
    pub fn agent_dir(&self, agent: &str) -> PathBuf {
        self.tools_dir.join(agent)
    }

    /// The binary the named agent currently points at, if any.
    pub async fn agent_binary(&self, agent: &str) -> Result<Option<Binary>> {
        match tokio::fs::read_link(self.agent_dir(agent)).await {
            Ok(target) => {
                let name = target
                    .file_name()
                    .and_then(|n| n.to_str())
                    .ok_or_else(|| AgentError::Tools(format!("bad tools link {target:?}")))?;
                Ok(Some(name.parse()?))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl ToolsManager for LocalTools {
    async fn change_agent_tools(&self, agent: &str, binary: &Binary) -> Result<Tools> {
        let dir = self.binary_dir(binary);
        match tokio::fs::metadata(&dir).await {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => {
                return Err(AgentError::Tools(format!(
                    "{} is not a directory",
                    dir.display()
                )))
            }
            Err(e) => {
                return Err(AgentError::Tools(format!(
                    "tools {binary} not available at {}: {e}",
                    dir.display()
                )))
            }
        }

        // Link via a temporary name and rename over the old link so the
        // agent path is never missing.
        let link = self.agent_dir(agent);
        let tmp = self
            .tools_dir
            .join(format!(".{agent}-{}", ulid::Ulid::new()));
        symlink(Path::new(&binary.to_string()), &tmp).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &link).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(AgentError::Tools(format!(
                "cannot replace {}: {e}",
                link.display()
            )));
        }

        debug!(agent, link = %link.display(), "Agent tools link replaced");
        info!(agent, binary = %binary, "Changed agent tools");

        Ok(Tools {
            binary: binary.clone(),
            dir,
        })
    }
}

#[cfg(unix)]
async fn symlink(target: &Path, link: &Path) -> Result<()> {
    tokio::fs::symlink(target, link).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn symlink(_target: &Path, _link: &Path) -> Result<()> {
    Err(AgentError::Tools(
        "tools links are only supported on unix".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("2.0", Version::new(2, 0, 0))]
    #[case("2.0.1", Version::new(2, 0, 1))]
    #[case("10.4.7", Version::new(10, 4, 7))]
    fn test_parse_version(#[case] input: &str, #[case] expected: Version) {
        assert_eq!(input.parse::<Version>().unwrap(), expected);
    }

    #[rstest]
    #[case("")]
    #[case("2")]
    #[case("2.x")]
    #[case("1.2.3.4")]
    fn test_parse_version_invalid(#[case] input: &str) {
        assert!(input.parse::<Version>().is_err());
    }

    #[test]
    fn test_parse_binary() {
        let binary: Binary = "2.0-jammy-amd64".parse().unwrap();
        assert_eq!(binary.version, Version::new(2, 0, 0));
        assert_eq!(binary.series, "jammy");
        assert_eq!(binary.arch, "amd64");
        assert_eq!(binary.to_string(), "2.0.0-jammy-amd64");
    }

    #[rstest]
    #[case("2.0.0")]
    #[case("2.0.0-jammy")]
    #[case("2.0.0--amd64")]
    #[case("two-jammy-amd64")]
    fn test_parse_binary_invalid(#[case] input: &str) {
        assert!(input.parse::<Binary>().is_err());
    }

    #[test]
    fn test_binary_serde() {
        let binary: Binary = "1.2.3-linux-x86_64".parse().unwrap();
        let json = serde_json::to_string(&binary).unwrap();
        assert_eq!(json, "\"1.2.3-linux-x86_64\"");
        let back: Binary = serde_json::from_str(&json).unwrap();
        assert_eq!(back, binary);
    }

    #[test]
    fn test_current_binary() {
        let current = Binary::current();
        assert_eq!(current.series, std::env::consts::OS);
        assert_eq!(current.arch, std::env::consts::ARCH);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_change_agent_tools() {
        let dir = tempfile::tempdir().unwrap();
        let tools = LocalTools::new(dir.path());
        let old: Binary = "1.0.0-linux-amd64".parse().unwrap();
        let new: Binary = "2.0.0-linux-amd64".parse().unwrap();
        std::fs::create_dir_all(tools.binary_dir(&old)).unwrap();
        std::fs::create_dir_all(tools.binary_dir(&new)).unwrap();

        tools.change_agent_tools("machine", &old).await.unwrap();
        assert_eq!(tools.agent_binary("machine").await.unwrap(), Some(old));

        let changed = tools.change_agent_tools("machine", &new).await.unwrap();
        assert_eq!(changed.binary, new);
        assert_eq!(changed.dir, tools.binary_dir(&new));
        assert_eq!(tools.agent_binary("machine").await.unwrap(), Some(new));
    }

    #[tokio::test]
    async fn test_change_agent_tools_missing() {
        let dir = tempfile::tempdir().unwrap();
        let tools = LocalTools::new(dir.path());
        let binary: Binary = "2.0.0-linux-amd64".parse().unwrap();

        let err = tools.change_agent_tools("machine", &binary).await.unwrap_err();
        assert!(matches!(err, AgentError::Tools(_)));
        assert_eq!(tools.agent_binary("machine").await.unwrap(), None);
    }
}
