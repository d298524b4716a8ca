//! Thin wrapper over the host's `ip` tool for installing and removing
//! lease addresses. Address application is a host-stack concern; the core
//! only needs "put this CIDR on that interface".

use std::io;

use log::debug;
use tokio::process::Command;

/// `ip addr replace <cidr> dev <ifname>`.
pub async fn replace_addr(ifname: &str, cidr: &str) -> io::Result<()> {
    run_ip(&["addr", "replace", cidr, "dev", ifname]).await
}

/// `ip addr del <cidr> dev <ifname>`.
pub async fn del_addr(ifname: &str, cidr: &str) -> io::Result<()> {
    run_ip(&["addr", "del", cidr, "dev", ifname]).await
}

async fn run_ip(args: &[&str]) -> io::Result<()> {
    debug!("ip {}", args.join(" "));
    let status = Command::new("ip").args(args).status().await?;
    if !status.success() {
        return Err(io::Error::new(
            io::ErrorKind::Other,
            format!("ip {} exited with {status}", args.join(" ")),
        ));
    }
    Ok(())
}
