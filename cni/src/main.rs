use std::{
    io::{self, Write},
    process::ExitCode,
};

use tracing::{debug, error};
use weft_cni::{execute, write_error, CniArgs, Error, Invocation};
use weft_devices::IpRoute2;

const LOG_DIR: &str = "/var/log/weft";

fn main() -> ExitCode {
    // stdout carries the CNI result, so logs go to a file
    let _guard = weft_trace::setup_tracing_to_file(LOG_DIR, "cni.log", "info").ok();

    let mut stdout = io::stdout().lock();
    let stdin = match io::read_to_string(io::stdin()) {
        Ok(stdin) => stdin,
        Err(err) => return fail(&mut stdout, Error::Io(err), ""),
    };
    debug!("stdin: {stdin}");

    let result = CniArgs::from_env().and_then(|args| {
        debug!(?args, "invoked");
        let devices = IpRoute2::new();
        let invocation = Invocation {
            args: &args,
            stdin: &stdin,
            devices: &devices,
        };
        execute(&invocation, &mut stdout)
    });

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => fail(&mut stdout, err, &stdin),
    }
}

fn fail(out: &mut impl Write, err: Error, stdin: &str) -> ExitCode {
    error!(code = err.code(), "{err}");
    if let Err(write_err) = write_error(out, &err, stdin) {
        error!(%write_err, "failed to write error result");
    }
    ExitCode::FAILURE
}
