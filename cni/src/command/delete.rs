use std::io::Write;

use tracing::{debug, info, instrument};
use weft_ipam::StorageError;

use super::{add::release, CniCommand, Invocation};
use crate::Error;

pub struct DeleteCommand;

impl CniCommand for DeleteCommand {
    #[instrument(skip_all, fields(container_id = invocation.args.container_id.as_deref()))]
    fn run(&self, invocation: &Invocation<'_>, _out: &mut dyn Write) -> Result<(), Error> {
        let args = invocation.args;
        let container_id = args.container_id()?;
        let if_name = args.if_name()?;

        let conf = invocation.net_conf()?;

        match &args.netns {
            Some(netns) => invocation.devices.del_veth(netns, container_id, if_name)?,
            None => debug!("no network namespace, skipping interface removal"),
        }

        let mut storage = match Invocation::storage(&conf) {
            Ok(storage) => storage,
            Err(Error::Storage(StorageError::NotBootstrapped(path))) => {
                debug!(path = %path.display(), "store not initialized, nothing to release");
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        storage.atomic_do(|state| {
            release(state, container_id);
            Ok::<_, Error>(())
        })?;
        info!("released");

        Ok(())
    }
}
