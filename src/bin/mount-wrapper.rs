//! A `mount(8)` stand-in for containers which routes loop mounts through losetup.

use std::{ffi::OsString, process::ExitCode};

use losetup_proxy::{
    client::{Client, DelegatingRunner},
    command::HostRunner,
    wrapper::{exec, loop_mount, MountPlan, WrapperConfig},
};

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let config = WrapperConfig::from_env();
    let args: Vec<OsString> = std::env::args_os().skip(1).collect();
    log::debug!("called with {args:?}");

    let mount_args = match MountPlan::from_args(&args) {
        MountPlan::PassThrough => args,
        MountPlan::Loop(mount) => {
            let result = if config.delegate {
                let client = match Client::discover().await {
                    Ok(client) => client,
                    Err(err) => {
                        eprintln!("mount-wrapper: {err:#}");
                        return ExitCode::FAILURE;
                    }
                };
                loop_mount(&DelegatingRunner { client }, &config, &mount).await
            } else {
                loop_mount(&HostRunner, &config, &mount).await
            };
            match result {
                Ok(mount_args) => mount_args,
                Err(err) => {
                    eprintln!("mount-wrapper: {err}");
                    return ExitCode::FAILURE;
                }
            }
        }
    };

    let err = exec(&config.real_mount, &mount_args);
    eprintln!(
        "mount-wrapper: failed to execute {}: {err}",
        config.real_mount.display()
    );
    ExitCode::FAILURE
}
