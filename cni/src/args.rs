use std::{env, path::PathBuf, str::FromStr};

use crate::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Command {
    Add,
    Del,
    Check,
    Version,
}

impl FromStr for Command {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ADD" => Ok(Command::Add),
            "DEL" => Ok(Command::Del),
            "CHECK" => Ok(Command::Check),
            "VERSION" => Ok(Command::Version),
            _ => Err(Error::InvalidEnv(format!("unknown CNI_COMMAND {s:?}"))),
        }
    }
}

/// Invocation parameters the runtime passes through the environment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CniArgs {
    pub command: Command,
    pub container_id: Option<String>,
    pub netns: Option<PathBuf>,
    pub if_name: Option<String>,
    pub args: Option<String>,
    pub path: Option<String>,
}

impl CniArgs {
    pub fn from_env() -> Result<Self, Error> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, Error> {
        let var = |key: &str| lookup(key).filter(|value| !value.is_empty());

        let command = var("CNI_COMMAND")
            .ok_or_else(|| missing("CNI_COMMAND"))?
            .parse()?;

        let args = Self {
            command,
            container_id: var("CNI_CONTAINERID"),
            netns: var("CNI_NETNS").map(PathBuf::from),
            if_name: var("CNI_IFNAME"),
            args: var("CNI_ARGS"),
            path: var("CNI_PATH"),
        };

        match command {
            Command::Add | Command::Check => {
                args.container_id()?;
                args.netns()?;
                args.if_name()?;
            }
            // the namespace may already be gone on DEL
            Command::Del => {
                args.container_id()?;
                args.if_name()?;
            }
            Command::Version => {}
        }

        Ok(args)
    }

    pub fn container_id(&self) -> Result<&str, Error> {
        self.container_id
            .as_deref()
            .ok_or_else(|| missing("CNI_CONTAINERID"))
    }

    pub fn netns(&self) -> Result<&PathBuf, Error> {
        self.netns.as_ref().ok_or_else(|| missing("CNI_NETNS"))
    }

    pub fn if_name(&self) -> Result<&str, Error> {
        self.if_name.as_deref().ok_or_else(|| missing("CNI_IFNAME"))
    }
}

fn missing(key: &str) -> Error {
    Error::InvalidEnv(format!("{key} is not set"))
}
