use crate::error::PipelineError;
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// 构建环境名称（封闭集合）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProfileName {
    Stable,
    Beta,
    Alpha,
    Test,
}

impl ProfileName {
    pub const ALL: [ProfileName; 4] = [Self::Stable, Self::Beta, Self::Alpha, Self::Test];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stable => "stable",
            Self::Beta => "beta",
            Self::Alpha => "alpha",
            Self::Test => "test",
        }
    }

    /// 除 stable 外的所有环境都输出 source map
    pub fn debug(self) -> bool {
        self != Self::Stable
    }
}

impl fmt::Display for ProfileName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProfileName {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| PipelineError::UnknownProfile(s.to_owned()))
    }
}

/// 一次构建所使用的环境，解析后不可变
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentProfile {
    pub name: ProfileName,
    pub destination: PathBuf,
    pub debug: bool,
}

/// 环境注册表：环境名 -> 输出目录 + 调试开关
#[derive(Debug, Clone)]
pub struct ProfileRegistry {
    build_root: PathBuf,
}

impl ProfileRegistry {
    pub fn new(build_root: impl Into<PathBuf>) -> Self {
        Self {
            build_root: build_root.into(),
        }
    }

    pub fn build_root(&self) -> &Path {
        &self.build_root
    }

    pub fn resolve(&self, name: &str) -> Result<EnvironmentProfile, PipelineError> {
        let name: ProfileName = name.parse()?;
        Ok(self.profile(name))
    }

    pub fn profile(&self, name: ProfileName) -> EnvironmentProfile {
        EnvironmentProfile {
            name,
            destination: self.build_root.join(name.as_str()),
            debug: name.debug(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn resolves_every_known_profile_under_build_root() {
        let registry = ProfileRegistry::new("/tmp/site/build");
        for name in ["stable", "beta", "alpha", "test"] {
            let profile = registry.resolve(name).unwrap();
            assert_eq!(profile.destination, PathBuf::from("/tmp/site/build").join(name));
            assert_eq!(profile.debug, name != "stable");
            assert_eq!(profile.name.as_str(), name);
        }
    }

    #[test]
    fn rejects_unknown_profile() {
        let registry = ProfileRegistry::new("build");
        let err = registry.resolve("nonexistent").unwrap_err();
        assert!(matches!(err, PipelineError::UnknownProfile(ref n) if n == "nonexistent"));
    }

    #[test]
    fn profile_names_are_case_sensitive() {
        assert!("Stable".parse::<ProfileName>().is_err());
        assert_eq!("beta".parse::<ProfileName>().unwrap(), ProfileName::Beta);
    }
}
