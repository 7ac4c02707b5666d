use std::io::Write;

use tracing::debug;
use weft_config::{NetConf, SUPPORTED_VERSIONS};
use weft_devices::Devices;
use weft_ipam::{Storage, StoragePaths};

use crate::{CniArgs, Command, Error};

use self::{add::AddCommand, check::CheckCommand, delete::DeleteCommand, version::VersionCommand};

mod add;
mod check;
mod delete;
mod version;

/// One plugin invocation: environment, stdin and the kernel behind it.
pub struct Invocation<'a> {
    pub args: &'a CniArgs,
    pub stdin: &'a str,
    pub devices: &'a dyn Devices,
}

impl Invocation<'_> {
    fn net_conf(&self) -> Result<NetConf, Error> {
        let conf = NetConf::from_json(self.stdin)?;
        debug!(?conf, "network configuration");

        if !SUPPORTED_VERSIONS.contains(&conf.cni_version.as_str()) {
            return Err(Error::IncompatibleVersion(conf.cni_version));
        }
        Ok(conf)
    }

    fn storage_paths(conf: &NetConf) -> StoragePaths {
        conf.data_dir
            .as_ref()
            .map(StoragePaths::in_dir)
            .unwrap_or_default()
    }

    fn storage(conf: &NetConf) -> Result<Storage, Error> {
        Ok(Storage::open(Self::storage_paths(conf))?)
    }
}

pub trait CniCommand {
    fn run(&self, invocation: &Invocation<'_>, out: &mut dyn Write) -> Result<(), Error>;
}

pub fn cni_command_from(command: Command) -> Box<dyn CniCommand> {
    match command {
        Command::Add => Box::new(AddCommand),
        Command::Del => Box::new(DeleteCommand),
        Command::Check => Box::new(CheckCommand),
        Command::Version => Box::new(VersionCommand),
    }
}

fn write_json<T: serde::Serialize>(out: &mut dyn Write, value: &T) -> Result<(), Error> {
    serde_json::to_writer(&mut *out, value).map_err(|err| Error::Io(err.into()))?;
    writeln!(out)?;
    Ok(())
}
