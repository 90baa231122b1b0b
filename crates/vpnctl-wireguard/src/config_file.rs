use std::io::Write as _;
use std::path::{Path, PathBuf};

use fd_lock::RwLock;
use vpnctl_core::VpnctlError;

/// Comment marker prefixing every peer block this service manages inside
/// the WireGuard config file, so removal never touches peers a human added
/// by hand.
const BLOCK_MARKER: &str = "# auto-added by vpn_service";

/// Runs `f` while holding an exclusive OS-level lock on a path *sibling to*
/// the WireGuard config file, never the config file itself — `wg-quick`/
/// `wg syncconf` may hold their own handle on the config path, and locking
/// it directly risks a deadlock against those tools. The lock file's only
/// job is mutual exclusion between concurrent calls into this module.
fn with_config_lock<T>(lock_path: &Path, f: impl FnOnce() -> T) -> Result<T, VpnctlError> {
    if let Some(dir) = lock_path.parent() {
        std::fs::create_dir_all(dir)
            .map_err(|e| VpnctlError::GatewayDown(format!("create lock dir: {e}")))?;
    }
    let file = std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .open(lock_path)
        .map_err(|e| VpnctlError::GatewayDown(format!("open lock file: {e}")))?;
    let mut lock = RwLock::new(file);
    let _guard = lock
        .write()
        .map_err(|e| VpnctlError::GatewayDown(format!("lock config file: {e}")))?;
    Ok(f())
}

fn read_config_lines(config_path: &Path) -> Vec<String> {
    match std::fs::read_to_string(config_path) {
        Ok(s) => s.lines().map(|l| format!("{l}\n")).collect(),
        Err(_) => Vec::new(),
    }
}

fn write_config_atomic(config_path: &Path, lines: &[String]) -> Result<(), VpnctlError> {
    let dir = config_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    std::fs::create_dir_all(&dir)
        .map_err(|e| VpnctlError::GatewayDown(format!("create config dir: {e}")))?;

    let mut tmp = tempfile::NamedTempFile::new_in(&dir)
        .map_err(|e| VpnctlError::GatewayDown(format!("create temp config file: {e}")))?;
    for line in lines {
        tmp.write_all(line.as_bytes())
            .map_err(|e| VpnctlError::GatewayDown(format!("write temp config file: {e}")))?;
    }
    tmp.as_file()
        .sync_all()
        .map_err(|e| VpnctlError::GatewayDown(format!("fsync temp config file: {e}")))?;
    tmp.persist(config_path)
        .map_err(|e| VpnctlError::GatewayDown(format!("rename temp config file: {e}")))?;
    Ok(())
}

/// Appends a peer block to the config file. Best-effort: a failure to touch
/// the file does not fail the caller, matching the original, which treats
/// the on-disk config as a convenience mirror of the runtime `wg set` state
/// rather than a source of truth.
pub fn append_peer_block(
    config_path: &Path,
    lock_path: &Path,
    public_key: &str,
    allowed_ip: &str,
    telegram_user_id: Option<i64>,
) {
    let result = with_config_lock(lock_path, || {
        let mut comment = BLOCK_MARKER.to_string();
        if let Some(id) = telegram_user_id {
            comment.push_str(&format!(" user={id}"));
        }

        let mut lines = read_config_lines(config_path);
        lines.push("\n".to_string());
        lines.push("\n".to_string());
        lines.push(format!("{comment}\n"));
        lines.push("[Peer]\n".to_string());
        lines.push(format!("PublicKey = {public_key}\n"));
        lines.push(format!("AllowedIPs = {allowed_ip}\n"));

        write_config_atomic(config_path, &lines)
    });

    match result {
        Ok(Err(e)) | Err(e) => {
            tracing::warn!(error = %e, "failed to append peer block to wireguard config");
        }
        Ok(Ok(())) => {}
    }
}

/// Removes a peer block this service previously added, identified by the
/// `BLOCK_MARKER` comment immediately preceding a `[Peer]` section whose
/// `PublicKey` matches. Stops at the first blank line (or EOF) after the
/// block, mirroring the original's line-scanning removal.
pub fn remove_peer_block(config_path: &Path, lock_path: &Path, public_key: &str) {
    let result = with_config_lock(lock_path, || {
        let lines = read_config_lines(config_path);
        if lines.is_empty() {
            return Ok(());
        }

        let target_pub_line = format!("PublicKey = {public_key}");
        let mut new_lines = Vec::with_capacity(lines.len());
        let mut i = 0;
        let n = lines.len();

        while i < n {
            let line = &lines[i];
            if line.starts_with(BLOCK_MARKER) && i + 2 < n {
                let line_peer = lines[i + 1].trim();
                let line_pub = lines[i + 2].trim();

                if line_peer == "[Peer]" && line_pub == target_pub_line {
                    i += 3;
                    while i < n && !lines[i].trim().is_empty() {
                        i += 1;
                    }
                    if i < n && lines[i].trim().is_empty() {
                        i += 1;
                    }
                    continue;
                }
            }
            new_lines.push(line.clone());
            i += 1;
        }

        write_config_atomic(config_path, &new_lines)
    });

    match result {
        Ok(Err(e)) | Err(e) => {
            tracing::warn!(error = %e, "failed to remove peer block from wireguard config");
        }
        Ok(Ok(())) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_then_remove_round_trips_to_empty() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("wg0.conf");
        let lock_path = dir.path().join("wg0.conf.lock");
        std::fs::write(&config_path, "[Interface]\nPrivateKey = srv\n").unwrap();

        append_peer_block(&config_path, &lock_path, "pubkey-A", "10.8.0.10/32", Some(42));
        let contents = std::fs::read_to_string(&config_path).unwrap();
        assert!(contents.contains("# auto-added by vpn_service user=42"));
        assert!(contents.contains("PublicKey = pubkey-A"));

        remove_peer_block(&config_path, &lock_path, "pubkey-A");
        let contents = std::fs::read_to_string(&config_path).unwrap();
        assert!(!contents.contains("pubkey-A"));
        assert!(contents.contains("[Interface]"));
    }

    #[test]
    fn remove_only_touches_matching_public_key() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("wg0.conf");
        let lock_path = dir.path().join("wg0.conf.lock");
        std::fs::write(&config_path, "").unwrap();

        append_peer_block(&config_path, &lock_path, "pubkey-A", "10.8.0.10/32", None);
        append_peer_block(&config_path, &lock_path, "pubkey-B", "10.8.0.11/32", None);

        remove_peer_block(&config_path, &lock_path, "pubkey-A");
        let contents = std::fs::read_to_string(&config_path).unwrap();
        assert!(!contents.contains("pubkey-A"));
        assert!(contents.contains("pubkey-B"));
    }
}
