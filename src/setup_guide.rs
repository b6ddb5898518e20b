//! Guide for running the watchdog as a systemd service.

use crate::paths::TOOL_NAME;
use std::path::Path;

pub const SERVICE_NAME: &str = "auto-backup-pvs";

pub struct GuideParams<'a> {
    pub chain_name: &'a str,
    pub network: &'a str,
    pub user: &'a str,
    pub node_home: &'a Path,
    pub binary: &'a Path,
    pub keep_recent: usize,
}

pub fn render(params: &GuideParams<'_>) -> String {
    let mut out = String::new();
    out.push_str("1. Create service file\n");
    out.push_str(&format!(
        "> sudo vi /etc/systemd/system/{SERVICE_NAME}.service\n"
    ));
    out.push_str(&unit_file(params));
    out.push('\n');
    out.push_str("2. Setup visudo\n\n> sudo visudo\n");
    out.push_str(&sudoers(params.user));
    out.push('\n');
    out.push_str("3. Enable service to automatically run at startup\n\n");
    out.push_str(&format!(
        "> sudo systemctl daemon-reload && sudo systemctl enable {SERVICE_NAME}\n"
    ));
    out
}

fn unit_file(params: &GuideParams<'_>) -> String {
    format!(
        "[Unit]\n\
         Description=Auto backup priv_validator_state.json for Validator on {chain} {network}\n\
         After=network.target\n\
         #\n\
         [Service]\n\
         User={user}\n\
         ExecStart=/usr/local/bin/{TOOL_NAME} {SERVICE_NAME} {home} --binary {binary} --keep {keep}\n\
         RestartSec=1\n\
         Restart=on-failure\n\
         LimitNOFILE=1024\n\
         #\n\
         [Install]\n\
         WantedBy=multi-user.target\n",
        chain = params.chain_name,
        network = params.network,
        user = params.user,
        home = params.node_home.display(),
        binary = params.binary.display(),
        keep = params.keep_recent,
    )
}

/// The service may be started, stopped and restarted without a password,
/// but not disabled.
fn sudoers(user: &str) -> String {
    let mut out = format!("# Allow user {user} to manage {SERVICE_NAME} service\n");
    for action in ["start", "stop", "restart", "enable"] {
        out.push_str(&format!(
            "{user} ALL= NOPASSWD: /usr/bin/systemctl {action} {SERVICE_NAME}\n"
        ));
    }
    out.push_str("# Do not allow disable\n");
    out.push_str(&format!(
        "{user} ALL= NOPASSWD: /usr/bin/systemctl status {SERVICE_NAME}\n"
    ));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_guide() {
        let guide = render(&GuideParams {
            chain_name: "Cosmos Hub",
            network: "Mainnet",
            user: "val",
            node_home: Path::new("/home/val/.gaia"),
            binary: Path::new("/home/val/go/bin/gaiad"),
            keep_recent: 5,
        });

        assert!(guide.contains("/etc/systemd/system/auto-backup-pvs.service"));
        assert!(guide.contains("Description=Auto backup priv_validator_state.json for Validator on Cosmos Hub Mainnet"));
        assert!(guide.contains("User=val\n"));
        assert!(guide.contains(
            "ExecStart=/usr/local/bin/pvguard auto-backup-pvs /home/val/.gaia --binary /home/val/go/bin/gaiad --keep 5"
        ));
        assert!(guide.contains("val ALL= NOPASSWD: /usr/bin/systemctl restart auto-backup-pvs"));
        assert!(!guide.contains("systemctl disable"));
    }
}
