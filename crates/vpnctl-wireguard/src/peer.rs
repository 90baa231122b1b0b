use std::path::PathBuf;
use std::process::{Command, Stdio};

use vpnctl_core::{Settings, VpnctlError};

use crate::config_file::{append_peer_block, remove_peer_block};
use crate::ip_alloc::allocate_client_ip;
use vpnctl_store::{IpAllocGuard, Store};

/// Thin wrapper over the `wg` CLI and the on-disk config file. Every blocking
/// subprocess/file call runs through [`tokio::task::spawn_blocking`] so the
/// async runtime's worker threads never stall on `wg`'s I/O.
#[derive(Clone)]
pub struct Gateway {
    interface_name: String,
    server_public_key: String,
    server_endpoint: String,
    client_network_prefix: String,
    client_network_cidr: u8,
    client_ip_start: u8,
    config_path: PathBuf,
    lock_path: PathBuf,
}

impl Gateway {
    pub fn new(settings: &Settings) -> Self {
        Self {
            interface_name: settings.wg_interface_name.clone(),
            server_public_key: settings.wg_server_public_key.clone(),
            server_endpoint: settings.wg_server_endpoint.clone(),
            client_network_prefix: settings.wg_client_network_prefix.clone(),
            client_network_cidr: settings.wg_client_network_cidr,
            client_ip_start: settings.wg_client_ip_start,
            config_path: PathBuf::from(&settings.wg_config_path),
            lock_path: PathBuf::from(&settings.wg_config_lock_path),
        }
    }

    /// Scans the configured client pool (`WG_CLIENT_NETWORK_PREFIX`/
    /// `WG_CLIENT_NETWORK_CIDR`/`WG_CLIENT_IP_START`) for the first address
    /// free of any active subscription. Must be called with `guard` already
    /// held.
    pub async fn allocate_ip(&self, store: &Store, guard: &mut IpAllocGuard) -> Result<String, VpnctlError> {
        allocate_client_ip(
            store,
            guard,
            &self.client_network_prefix,
            self.client_network_cidr,
            self.client_ip_start,
        )
        .await
    }

    fn run_cmd(cmd: &str, args: &[&str]) -> Result<String, VpnctlError> {
        let output = Command::new(cmd)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .map_err(|e| VpnctlError::GatewayDown(format!("spawn {cmd}: {e}")))?;
        if !output.status.success() {
            return Err(VpnctlError::GatewayDown(format!(
                "{cmd} exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    fn run_cmd_with_stdin(cmd: &str, args: &[&str], input: &str) -> Result<String, VpnctlError> {
        use std::io::Write;
        let mut child = Command::new(cmd)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| VpnctlError::GatewayDown(format!("spawn {cmd}: {e}")))?;
        child
            .stdin
            .take()
            .expect("piped stdin")
            .write_all(format!("{input}\n").as_bytes())
            .map_err(|e| VpnctlError::GatewayDown(format!("write stdin to {cmd}: {e}")))?;
        let output = child
            .wait_with_output()
            .map_err(|e| VpnctlError::GatewayDown(format!("wait for {cmd}: {e}")))?;
        if !output.status.success() {
            return Err(VpnctlError::GatewayDown(format!(
                "{cmd} exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Verifies the WireGuard interface is up; `wg show <iface>` fails
    /// non-zero if it isn't.
    pub async fn ensure_up(&self) -> Result<(), VpnctlError> {
        let iface = self.interface_name.clone();
        tokio::task::spawn_blocking(move || Self::run_cmd("wg", &["show", &iface]))
            .await
            .map_err(|e| VpnctlError::GatewayDown(e.to_string()))??;
        Ok(())
    }

    /// Generates a fresh WireGuard keypair via `wg genkey` / `wg pubkey`.
    pub async fn generate_keypair(&self) -> Result<(String, String), VpnctlError> {
        tokio::task::spawn_blocking(|| {
            let private_key = Self::run_cmd("wg", &["genkey"])?;
            let public_key = Self::run_cmd_with_stdin("wg", &["pubkey"], &private_key)?;
            Ok::<_, VpnctlError>((private_key, public_key))
        })
        .await
        .map_err(|e| VpnctlError::GatewayDown(e.to_string()))?
    }

    /// Adds a peer at runtime (`wg set ... peer ... allowed-ips ...`) and
    /// persists the same peer block to the on-disk config so it survives a
    /// restart of `wg-quick`.
    pub async fn add_peer(
        &self,
        public_key: &str,
        allowed_ip: &str,
        telegram_user_id: Option<i64>,
    ) -> Result<(), VpnctlError> {
        self.ensure_up().await?;

        let iface = self.interface_name.clone();
        let pk = public_key.to_string();
        let ip = allowed_ip.to_string();
        tokio::task::spawn_blocking(move || {
            Self::run_cmd(
                "wg",
                &["set", &iface, "peer", &pk, "allowed-ips", &ip],
            )
        })
        .await
        .map_err(|e| VpnctlError::GatewayDown(e.to_string()))??;

        let config_path = self.config_path.clone();
        let lock_path = self.lock_path.clone();
        let pk = public_key.to_string();
        let ip = allowed_ip.to_string();
        tokio::task::spawn_blocking(move || {
            append_peer_block(&config_path, &lock_path, &pk, &ip, telegram_user_id)
        })
        .await
        .map_err(|e| VpnctlError::GatewayDown(e.to_string()))?;

        Ok(())
    }

    /// Removes a peer at runtime and strips its block from the config file.
    pub async fn remove_peer(&self, public_key: &str) -> Result<(), VpnctlError> {
        self.ensure_up().await?;

        let iface = self.interface_name.clone();
        let pk = public_key.to_string();
        tokio::task::spawn_blocking(move || {
            Self::run_cmd("wg", &["set", &iface, "peer", &pk, "remove"])
        })
        .await
        .map_err(|e| VpnctlError::GatewayDown(e.to_string()))??;

        let config_path = self.config_path.clone();
        let lock_path = self.lock_path.clone();
        let pk = public_key.to_string();
        tokio::task::spawn_blocking(move || remove_peer_block(&config_path, &lock_path, &pk))
            .await
            .map_err(|e| VpnctlError::GatewayDown(e.to_string()))?;

        Ok(())
    }

    /// Renders the client-facing `.conf` text handed to the user (or
    /// encoded into a QR code by `vpnctl-notify`).
    pub fn build_client_config(&self, client_private_key: &str, client_ip: &str) -> String {
        format!(
            "[Interface]\nPrivateKey = {}\nAddress = {}/{}\nDNS = 1.1.1.1\n\n[Peer]\nPublicKey = {}\nEndpoint = {}\nAllowedIPs = 0.0.0.0/0\nPersistentKeepalive = 25\n",
            client_private_key, client_ip, self.client_network_cidr,
            self.server_public_key, self.server_endpoint,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_gateway() -> Gateway {
        Gateway {
            interface_name: "wg0".into(),
            server_public_key: "server-pub".into(),
            server_endpoint: "vpn.example.com:51820".into(),
            client_network_prefix: "10.8.0.0".into(),
            client_network_cidr: 24,
            client_ip_start: 2,
            config_path: PathBuf::from("/tmp/unused.conf"),
            lock_path: PathBuf::from("/tmp/unused.conf.lock"),
        }
    }

    #[test]
    fn build_client_config_renders_expected_shape() {
        let gw = test_gateway();
        let cfg = gw.build_client_config("client-priv", "10.8.0.42");
        assert!(cfg.contains("PrivateKey = client-priv"));
        assert!(cfg.contains("Address = 10.8.0.42/24"));
        assert!(cfg.contains("Endpoint = vpn.example.com:51820"));
        assert!(cfg.contains("PersistentKeepalive = 25"));
    }
}
