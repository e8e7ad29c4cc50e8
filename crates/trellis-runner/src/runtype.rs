//! Runtime types

use crate::info::RunnerInfo;
use async_trait::async_trait;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use trellis_core::{Error, Result, SharedHandler};

/// Runtime types supported by the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunType {
    /// External OS process
    Exec,
    /// In-process handler compiled into the binary
    Builtin,
}

impl RunType {
    /// Name used in configuration
    pub fn as_str(&self) -> &'static str {
        match self {
            RunType::Exec => "exec",
            RunType::Builtin => "builtin",
        }
    }
}

impl FromStr for RunType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "" | "exec" => Ok(RunType::Exec),
            "builtin" => Ok(RunType::Builtin),
            other => Err(Error::UnknownRuntype(other.to_string())),
        }
    }
}

impl fmt::Display for RunType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle operations of one runtime type
#[async_trait]
pub trait TypeHandler: Send + Sync + fmt::Debug {
    /// Start a long-running runner, returning its request handler if it has one
    async fn start(&self, info: Arc<RunnerInfo>) -> Result<Option<SharedHandler>>;

    /// Run a runner to completion
    async fn run(&self, info: Arc<RunnerInfo>) -> Result<()>;

    /// Gracefully stop a started runner
    async fn stop(&self, api_key: &str) -> Result<()>;

    /// Forcefully stop a started runner
    async fn kill(&self, api_key: &str) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        assert_eq!("exec".parse::<RunType>().unwrap(), RunType::Exec);
        assert_eq!("".parse::<RunType>().unwrap(), RunType::Exec);
        assert_eq!("builtin".parse::<RunType>().unwrap(), RunType::Builtin);
        assert!(matches!(
            "docker".parse::<RunType>(),
            Err(Error::UnknownRuntype(t)) if t == "docker"
        ));
    }
}
