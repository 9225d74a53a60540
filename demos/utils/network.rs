use std::io;
use std::process::Command;

use micro_ip::Ipv4Address;

fn run_ip(args: &[&str]) -> io::Result<()> {
    let status = Command::new("ip").args(args).status()?;
    if !status.success() {
        return Err(io::Error::new(
            io::ErrorKind::Other,
            format!("`ip {}` failed", args.join(" ")),
        ));
    }
    Ok(())
}

/// Give the host side of the TAP device an address and bring it up.
pub fn configure_interface(iface_name: &str, ip_cidr: &str) -> io::Result<()> {
    // ip addr add <ip_cidr> dev <iface_name>
    run_ip(&["addr", "add", ip_cidr, "dev", iface_name])?;
    // ip link set up dev <iface_name>
    run_ip(&["link", "set", "up", "dev", iface_name])?;

    println!(
        "Interface {} configured with IP {} and brought up",
        iface_name, ip_cidr
    );
    Ok(())
}

/// Split `a.b.c.d/len` into an address and a netmask.
pub fn parse_ip_cidr(ip_cidr: &str) -> io::Result<(Ipv4Address, Ipv4Address)> {
    let invalid = || io::Error::new(io::ErrorKind::InvalidInput, format!("invalid CIDR {}", ip_cidr));

    let (addr, prefix) = ip_cidr.split_once('/').ok_or_else(invalid)?;
    let addr: std::net::Ipv4Addr = addr.parse().map_err(|_| invalid())?;
    let prefix_len: u32 = prefix.parse().map_err(|_| invalid())?;
    if prefix_len > 32 {
        return Err(invalid());
    }

    let mask = u32::MAX.checked_shl(32 - prefix_len).unwrap_or(0);
    Ok((Ipv4Address(addr.octets()), Ipv4Address(mask.to_be_bytes())))
}
