use std::io::Write;

use ipnet::IpNet;
use tracing::{debug, instrument};

use super::{CniCommand, Invocation};
use crate::Error;

pub struct CheckCommand;

impl CniCommand for CheckCommand {
    #[instrument(skip_all, fields(container_id = invocation.args.container_id.as_deref()))]
    fn run(&self, invocation: &Invocation<'_>, _out: &mut dyn Write) -> Result<(), Error> {
        let args = invocation.args;
        let container_id = args.container_id()?;
        let netns = args.netns()?;
        let if_name = args.if_name()?;

        let conf = invocation.net_conf()?;
        let mut storage = Invocation::storage(&conf)?;

        let allocated = storage.read(|state| {
            Ok::<_, Error>(
                state
                    .enabled()
                    .filter_map(|family| state.family(family)?.record.get_by_id(container_id))
                    .collect::<Vec<IpNet>>(),
            )
        })?;
        if allocated.is_empty() {
            return Err(Error::UnknownContainer(container_id.to_owned()));
        }

        let present = invocation
            .devices
            .container_addrs(netns, container_id, if_name)?;
        debug!(?allocated, ?present, "comparing addresses");

        if let Some(missing) = allocated.iter().find(|addr| !present.contains(addr)) {
            return Err(Error::Check(format!("{if_name} is missing {missing}")));
        }

        Ok(())
    }
}
