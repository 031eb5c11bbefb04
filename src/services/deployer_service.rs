//! One-shot agent deployment over SSH.
//!
//! Invoked when a server is created with a password: uploads the agent
//! binary, writes its config with the controller URL the remote can actually
//! reach, installs a systemd unit, and verifies the service came up. The SSH
//! session is blocking (ssh2), so the whole flow runs on a blocking task.
//! The password is used for this one session and never persisted.

use std::io::{Read, Write};
use std::net::{Ipv4Addr, TcpStream, UdpSocket};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{AppError, Result};
use crate::ws::AgentRegistry;

const REMOTE_BINARY_PATH: &str = "/usr/local/bin/backup-agent";
const REMOTE_CONFIG_DIR: &str = "/etc/backup-agent";
const REMOTE_CONFIG_PATH: &str = "/etc/backup-agent/config.toml";
const SYSTEMD_SERVICE_PATH: &str = "/etc/systemd/system/backup-agent.service";
const AGENT_PORT: u16 = 9990;

/// How long to wait for the freshly installed agent to register.
const REGISTRATION_WAIT: Duration = Duration::from_secs(30);
/// Settle delay between service start and the is-active check.
const SERVICE_SETTLE: Duration = Duration::from_secs(2);

pub struct DeployOptions {
    pub hostname: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub server_id: String,
    /// Controller HTTP port the agent dials back to
    pub controller_port: u16,
    /// Operator-supplied controller IP, tried when source-IP detection fails
    pub fallback_ip: Option<String>,
    pub binary_path: PathBuf,
}

/// Run the full deploy flow. Every step must succeed before the next; the
/// caller rolls the server row back on error.
pub async fn deploy_agent(opts: DeployOptions, agents: Arc<AgentRegistry>) -> Result<()> {
    if !opts.binary_path.exists() {
        return Err(AppError::Precondition(format!(
            "Agent binary not found at {}",
            opts.binary_path.display()
        )));
    }

    tracing::info!(hostname = %opts.hostname, "Starting agent deployment");
    let server_id = opts.server_id.clone();

    tokio::task::spawn_blocking(move || deploy_via_ssh(&opts))
        .await
        .map_err(|e| AppError::Internal(format!("Deploy task panicked: {}", e)))??;

    // Registration is confirmation, not a requirement: the agent may still
    // be starting when we return.
    wait_for_registration(&server_id, &agents).await;
    Ok(())
}

fn deploy_via_ssh(opts: &DeployOptions) -> Result<()> {
    let tcp = TcpStream::connect((opts.hostname.as_str(), opts.port))
        .map_err(|e| AppError::Unprocessable(format!("SSH connect failed: {}", e)))?;
    let mut session =
        ssh2::Session::new().map_err(|e| AppError::Internal(format!("SSH init failed: {}", e)))?;
    session.set_tcp_stream(tcp);
    session
        .handshake()
        .map_err(|e| AppError::Unprocessable(format!("SSH handshake failed: {}", e)))?;

    authenticate(&session, &opts.username, &opts.password)?;

    // 1. Binary upload, then promoted into place with sudo.
    tracing::info!(hostname = %opts.hostname, "Uploading agent binary");
    let staged = staging_path("backup-agent-upload");
    let binary = std::fs::read(&opts.binary_path)?;
    sftp_write(&session, &staged, &binary)?;
    exec(&session, &opts.password, &format!("sudo mv {} {}", staged, REMOTE_BINARY_PATH))?;
    exec(&session, &opts.password, &format!("sudo chmod +x {}", REMOTE_BINARY_PATH))?;

    // 2. The remote sees our source address; that is the URL the agent can
    //    reach us at, NAT or not.
    let controller_ip = detect_source_ip(&session, &opts.password, opts.fallback_ip.as_deref());
    let controller_url = format!("http://{}:{}", controller_ip, opts.controller_port);
    tracing::info!(hostname = %opts.hostname, controller_url = %controller_url, "Detected controller URL");

    // 3. Agent config.
    let config = render_agent_config(&opts.hostname, &controller_url, &opts.server_id);
    exec(&session, &opts.password, &format!("sudo mkdir -p {}", REMOTE_CONFIG_DIR))?;
    write_remote_file(&session, &opts.password, REMOTE_CONFIG_PATH, &config)?;

    // 4. Service unit.
    write_remote_file(
        &session,
        &opts.password,
        SYSTEMD_SERVICE_PATH,
        &render_systemd_unit(),
    )?;

    // 5. Stop any existing instance and free its port before starting.
    let _ = exec(&session, &opts.password, "sudo systemctl stop backup-agent || true");
    let _ = exec(
        &session,
        &opts.password,
        &format!("sudo fuser -k {}/tcp || true", AGENT_PORT),
    );
    std::thread::sleep(Duration::from_secs(1));

    exec(&session, &opts.password, "sudo systemctl daemon-reload")?;
    exec(&session, &opts.password, "sudo systemctl enable backup-agent")?;
    exec(&session, &opts.password, "sudo systemctl restart backup-agent")?;

    // 6. Verify, surfacing the journal tail on failure.
    std::thread::sleep(SERVICE_SETTLE);
    let status = exec(&session, &opts.password, "sudo systemctl is-active backup-agent")?;
    if status.trim() != "active" {
        let journal = exec(
            &session,
            &opts.password,
            "sudo journalctl -u backup-agent -n 30 --no-pager",
        )
        .unwrap_or_default();
        tracing::error!(
            hostname = %opts.hostname,
            status = %status.trim(),
            journal = %journal,
            "Agent service failed to start"
        );
        return Err(AppError::Unprocessable(format!(
            "Agent service failed to start (status: {}): {}",
            status.trim(),
            journal.lines().last().unwrap_or_default()
        )));
    }

    tracing::info!(hostname = %opts.hostname, "Agent service is active");
    Ok(())
}

/// Password auth with keyboard-interactive fallback (some sshd setups only
/// expose the latter).
fn authenticate(session: &ssh2::Session, username: &str, password: &str) -> Result<()> {
    if session.userauth_password(username, password).is_err() {
        struct PasswordPrompt<'a> {
            password: &'a str,
        }
        impl ssh2::KeyboardInteractivePrompt for PasswordPrompt<'_> {
            fn prompt<'b>(
                &mut self,
                _username: &str,
                _instructions: &str,
                prompts: &[ssh2::Prompt<'b>],
            ) -> Vec<String> {
                prompts.iter().map(|_| self.password.to_string()).collect()
            }
        }
        let mut prompter = PasswordPrompt { password };
        session
            .userauth_keyboard_interactive(username, &mut prompter)
            .map_err(|e| AppError::Unprocessable(format!("SSH authentication failed: {}", e)))?;
    }

    if !session.authenticated() {
        return Err(AppError::Unprocessable("SSH authentication failed".into()));
    }
    Ok(())
}

/// Run a command, piping the password to stdin for `sudo -S`.
fn exec(session: &ssh2::Session, password: &str, command: &str) -> Result<String> {
    let sudo_command = command.replace("sudo", "sudo -S");
    let mut channel = session
        .channel_session()
        .map_err(|e| AppError::Internal(format!("SSH channel failed: {}", e)))?;
    channel
        .exec(&sudo_command)
        .map_err(|e| AppError::Internal(format!("SSH exec failed: {}", e)))?;

    if sudo_command.contains("sudo -S") {
        channel.write_all(format!("{}\n", password).as_bytes())?;
    }

    let mut stdout = String::new();
    channel.read_to_string(&mut stdout)?;
    channel
        .wait_close()
        .map_err(|e| AppError::Internal(format!("SSH channel close failed: {}", e)))?;
    Ok(stdout)
}

fn sftp_write(session: &ssh2::Session, remote_path: &str, data: &[u8]) -> Result<()> {
    let sftp = session
        .sftp()
        .map_err(|e| AppError::Internal(format!("SFTP subsystem failed: {}", e)))?;
    let mut file = sftp
        .create(Path::new(remote_path))
        .map_err(|e| AppError::Internal(format!("SFTP create failed: {}", e)))?;
    file.write_all(data)?;
    Ok(())
}

/// Privileged files go through a temp path plus `sudo mv`; SFTP itself runs
/// as the login user.
fn write_remote_file(
    session: &ssh2::Session,
    password: &str,
    remote_path: &str,
    content: &str,
) -> Result<()> {
    let staged = staging_path("backup-agent-deploy");
    sftp_write(session, &staged, content.as_bytes())?;
    exec(session, password, &format!("sudo mv {} {}", staged, remote_path))?;
    Ok(())
}

fn staging_path(prefix: &str) -> String {
    format!("/tmp/{}-{}", prefix, uuid::Uuid::new_v4())
}

/// The controller IP as the remote host sees it: the first field of
/// `$SSH_CONNECTION`, then the configured fallback, then the first
/// non-loopback IPv4 interface, then loopback.
fn detect_source_ip(
    session: &ssh2::Session,
    password: &str,
    fallback: Option<&str>,
) -> String {
    if let Ok(output) = exec(session, password, "echo $SSH_CONNECTION") {
        if let Some(ip) = output.split_whitespace().next() {
            if is_ipv4(ip) {
                return ip.to_string();
            }
        }
    }
    if let Some(ip) = fallback {
        return ip.to_string();
    }
    if let Some(ip) = local_ipv4() {
        return ip;
    }
    "127.0.0.1".into()
}

fn is_ipv4(candidate: &str) -> bool {
    candidate.parse::<Ipv4Addr>().is_ok()
}

/// Address of the first non-loopback IPv4 interface, discovered by asking
/// the kernel which local address it would route an outbound packet from.
/// No packet is sent.
fn local_ipv4() -> Option<String> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("198.51.100.1:9").ok()?;
    let addr = socket.local_addr().ok()?;
    match addr.ip() {
        std::net::IpAddr::V4(ip) if !ip.is_loopback() => Some(ip.to_string()),
        _ => None,
    }
}

fn render_agent_config(hostname: &str, controller_url: &str, server_id: &str) -> String {
    format!(
        r#"[agent]
id = "{hostname}"
port = {AGENT_PORT}
data_dir = "/var/lib/backup-agent"

[server]
url = "{controller_url}"
server_id = "{server_id}"

[sync]
chunk_size = 1048576
compression = "zstd"
compression_level = 3

[log]
level = "info"
output = "stdout"

[performance]
max_concurrent_jobs = 1
io_threads = 4
"#
    )
}

fn render_systemd_unit() -> String {
    format!(
        r#"[Unit]
Description=Backup Agent
After=network.target

[Service]
Type=simple
ExecStart={REMOTE_BINARY_PATH} --config {REMOTE_CONFIG_PATH}
Restart=always
RestartSec=5
User=root
Environment=RUST_LOG=info

[Install]
WantedBy=multi-user.target
"#
    )
}

async fn wait_for_registration(server_id: &str, agents: &AgentRegistry) {
    let deadline = tokio::time::Instant::now() + REGISTRATION_WAIT;
    while tokio::time::Instant::now() < deadline {
        if agents.is_connected(server_id) {
            tracing::info!(server_id, "Agent registered after deployment");
            return;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
    tracing::warn!(server_id, "Agent did not register within timeout; it may connect later");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_config_embeds_identity_and_compression() {
        let config = render_agent_config("web-01", "http://10.0.0.1:3000", "srv-uuid");
        assert!(config.contains(r#"url = "http://10.0.0.1:3000""#));
        assert!(config.contains(r#"server_id = "srv-uuid""#));
        assert!(config.contains(r#"compression = "zstd""#));
        assert!(config.contains("compression_level = 3"));
        assert!(config.contains("port = 9990"));
    }

    #[test]
    fn systemd_unit_restarts_and_enables_at_boot() {
        let unit = render_systemd_unit();
        assert!(unit.contains("Restart=always"));
        assert!(unit.contains("WantedBy=multi-user.target"));
        assert!(unit.contains("--config /etc/backup-agent/config.toml"));
    }

    #[test]
    fn ipv4_validation() {
        assert!(is_ipv4("10.0.0.5"));
        assert!(!is_ipv4("fe80::1"));
        assert!(!is_ipv4("not-an-ip"));
        assert!(!is_ipv4(""));
    }

    #[test]
    fn staging_paths_are_unique() {
        assert_ne!(staging_path("x"), staging_path("x"));
    }
}
