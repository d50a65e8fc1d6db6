//! Guest network configuration.
//!
//! Applies the first IP config from the run config to `eth0`, installs the
//! default gateway and writes /etc/resolv.conf.

use std::fs;
use std::net::Ipv4Addr;
use std::process::Command;

use ravel_init_config::{EtcResolv, IpConfig, NetworkConfig};
use tracing::{debug, info};

use crate::error::InitError;

/// First virtio-net device inside the guest.
const INTERFACE: &str = "eth0";

/// Configure guest networking from the run config.
pub fn configure(network: &NetworkConfig, resolv: &EtcResolv) -> Result<(), InitError> {
    let ip_config = network
        .ip_configs
        .first()
        .ok_or_else(|| InitError::NetConfigFailed("no ip configs".to_string()))?;

    validate(ip_config)?;

    run_ip(&["link", "set", "dev", "lo", "up"])?;
    run_ip(&["link", "set", "dev", INTERFACE, "up"])?;
    debug!("interfaces up");

    run_ip(&[
        "addr",
        "add",
        &ip_config.ip_net,
        "broadcast",
        &ip_config.broadcast,
        "dev",
        INTERFACE,
    ])?;
    info!(address = %ip_config.ip_net, "address configured");

    let gateway = if network.default_gateway.is_empty() {
        &ip_config.gateway
    } else {
        &network.default_gateway
    };
    run_ip(&["route", "replace", "default", "via", gateway, "dev", INTERFACE])?;
    info!(gateway = %gateway, "default route configured");

    if !resolv.nameservers.is_empty() {
        write_resolv_conf(&resolv.nameservers)?;
        info!(servers = ?resolv.nameservers, "resolv.conf written");
    }

    Ok(())
}

fn validate(ip_config: &IpConfig) -> Result<(), InitError> {
    let (address, prefix) = ip_config.ip_net.split_once('/').ok_or_else(|| {
        InitError::NetConfigFailed(format!("invalid ip_net '{}'", ip_config.ip_net))
    })?;
    address.parse::<Ipv4Addr>().map_err(|err| {
        InitError::NetConfigFailed(format!("invalid address '{address}': {err}"))
    })?;
    let prefix: u8 = prefix.parse().map_err(|_| {
        InitError::NetConfigFailed(format!("invalid prefix '{prefix}'"))
    })?;
    if prefix > 32 {
        return Err(InitError::NetConfigFailed(format!(
            "invalid prefix '{prefix}'"
        )));
    }
    ip_config.broadcast.parse::<Ipv4Addr>().map_err(|err| {
        InitError::NetConfigFailed(format!(
            "invalid broadcast '{}': {err}",
            ip_config.broadcast
        ))
    })?;
    ip_config.gateway.parse::<Ipv4Addr>().map_err(|err| {
        InitError::NetConfigFailed(format!("invalid gateway '{}': {err}", ip_config.gateway))
    })?;
    Ok(())
}

fn run_ip(args: &[&str]) -> Result<(), InitError> {
    let output = Command::new("ip")
        .args(args)
        .output()
        .map_err(|err| InitError::NetConfigFailed(format!("failed to execute ip: {err}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(InitError::NetConfigFailed(format!(
            "ip {} failed: {}",
            args.join(" "),
            stderr.trim()
        )));
    }
    Ok(())
}

/// Atomic write so a crashed init never leaves a half-written resolv.conf.
fn write_resolv_conf(nameservers: &[String]) -> Result<(), InitError> {
    let mut content = String::new();
    for server in nameservers {
        content.push_str(&format!("nameserver {server}\n"));
    }

    let tmp_path = "/etc/resolv.conf.tmp";
    fs::write(tmp_path, &content)
        .map_err(|err| InitError::NetConfigFailed(format!("write resolv.conf: {err}")))?;
    fs::rename(tmp_path, "/etc/resolv.conf")
        .map_err(|err| InitError::NetConfigFailed(format!("rename resolv.conf: {err}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip_config() -> IpConfig {
        IpConfig {
            ip_net: "10.0.0.2/30".to_string(),
            broadcast: "10.0.0.3".to_string(),
            gateway: "10.0.0.1".to_string(),
        }
    }

    #[test]
    fn accepts_valid_ip_config() {
        assert!(validate(&ip_config()).is_ok());
    }

    #[test]
    fn rejects_malformed_ip_net() {
        let mut config = ip_config();
        config.ip_net = "10.0.0.2".to_string();
        assert!(validate(&config).is_err());

        config.ip_net = "10.0.0.2/33".to_string();
        assert!(validate(&config).is_err());

        config.ip_net = "not-an-ip/30".to_string();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn rejects_malformed_gateway() {
        let mut config = ip_config();
        config.gateway = "fe80::1".to_string();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn missing_ip_configs_is_an_error() {
        let network = NetworkConfig {
            ip_configs: vec![],
            default_gateway: "10.0.0.1".to_string(),
        };
        let resolv = EtcResolv { nameservers: vec![] };
        let err = configure(&network, &resolv).unwrap_err();
        assert_eq!(err.reason_code(), "net_config_failed");
    }

    #[test]
    fn resolv_conf_format() {
        let servers = vec!["8.8.8.8".to_string(), "1.1.1.1".to_string()];
        let mut content = String::new();
        for server in &servers {
            content.push_str(&format!("nameserver {server}\n"));
        }
        assert_eq!(content, "nameserver 8.8.8.8\nnameserver 1.1.1.1\n");
    }
}
