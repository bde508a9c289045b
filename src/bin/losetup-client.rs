//! A `losetup(8)` stand-in for containers, running the real thing on the host agent.
//!
//! The arguments are taken verbatim.  Relative paths are made absolute before they are sent, and
//! whatever the agent's losetup printed is printed back unchanged.

use std::io::Write;

use anyhow::{anyhow, Result};

use losetup_proxy::{
    client::{exit_status, Client, TRANSPORT_FAILURE_EXIT},
    paths,
};

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let args = std::env::args_os()
        .skip(1)
        .map(|arg| arg.into_string())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|arg| anyhow!("Argument {arg:?} is not valid UTF-8"))?;

    let args = paths::to_wire(&args)?;
    let client = Client::discover().await?;
    log::debug!("POST {} {args:?}", client.url());

    let code = match client.losetup(args).await {
        Ok(response) => {
            print!("{}", response.stdout);
            eprint!("{}", response.stderr);
            exit_status(response.returncode)
        }
        Err(err) => {
            eprintln!("losetup-client: {err}");
            TRANSPORT_FAILURE_EXIT
        }
    };

    std::io::stdout().flush()?;
    std::process::exit(code)
}
