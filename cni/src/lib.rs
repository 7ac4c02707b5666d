//! The `weft` CNI plugin.

use std::io::{self, Write};

mod add_result;
mod args;
mod command;
mod error;
mod interface;
mod ip;

pub use add_result::{AddResult, VersionResult};
pub use args::{CniArgs, Command};
pub use command::{cni_command_from, CniCommand, Invocation};
pub use error::{Error, ErrorResult};

/// Runs the command named by `invocation.args`, writing its result to `out`.
pub fn execute(invocation: &Invocation<'_>, out: &mut dyn Write) -> Result<(), Error> {
    cni_command_from(invocation.args.command).run(invocation, out)
}

/// `cniVersion` of the request, for error replies to echo back.
pub fn requested_version(stdin: &str) -> String {
    #[derive(serde::Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct Versioned {
        cni_version: String,
    }

    serde_json::from_str::<Versioned>(stdin)
        .map(|v| v.cni_version)
        .unwrap_or_else(|_| weft_config::CNI_VERSION.to_owned())
}

/// Prints the CNI error object for `err`, echoing the requested version.
pub fn write_error(out: &mut dyn Write, err: &Error, stdin: &str) -> io::Result<()> {
    let reply = err.to_result(&requested_version(stdin));
    serde_json::to_writer(&mut *out, &reply)?;
    writeln!(out)
}
