use std::io::Write;

use super::{write_json, CniCommand, Invocation};
use crate::{add_result::VersionResult, Error};

pub struct VersionCommand;

impl CniCommand for VersionCommand {
    fn run(&self, _invocation: &Invocation<'_>, out: &mut dyn Write) -> Result<(), Error> {
        write_json(out, &VersionResult::default())
    }
}
