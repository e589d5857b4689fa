//! Remote shell on a standalone ESXi host
//!
//! Standalone hosts have no server-side clone, so the create path copies the
//! template disks with `vmkfstools` over SSH before building the VM.

use async_trait::async_trait;
use russh::client::{self, Handle};
use russh::{ChannelMsg, Disconnect};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum RemoteShellError {
    /// Host unreachable or the SSH handshake did not complete
    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Command ran but did not succeed
    #[error("Command {command:?} failed: {message}")]
    Command { command: String, message: String },

    #[error("SSH error: {0}")]
    Ssh(#[from] russh::Error),
}

/// Output of one remote command
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandOutput {
    pub exit_status: u32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_status == 0
    }
}

/// An authenticated shell session
#[async_trait]
pub trait RemoteShell: Send + Sync {
    /// Run `command` to completion
    async fn exec(&self, command: &str) -> Result<CommandOutput, RemoteShellError>;

    async fn close(&self);
}

#[derive(Clone, PartialEq, Eq)]
pub struct ShellParams {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

impl fmt::Debug for ShellParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShellParams")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Opens shell sessions
#[async_trait]
pub trait RemoteShellFactory: Send + Sync {
    async fn connect(&self, params: &ShellParams) -> Result<Box<dyn RemoteShell>, RemoteShellError>;
}

/// Host part of a server given as a host name or URL
///
/// `https://esx-01.lab:443/sdk` becomes `esx-01.lab`.
pub fn server_host(server: &str) -> String {
    let without_scheme = server.split_once("://").map_or(server, |(_, rest)| rest);
    let authority = without_scheme.split('/').next().unwrap_or(without_scheme);
    let authority = authority.rsplit_once('@').map_or(authority, |(_, host)| host);

    if let Some(bracketed) = authority.strip_prefix('[') {
        return bracketed.split(']').next().unwrap_or(bracketed).to_string();
    }
    match authority.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host.to_string(),
        _ => authority.to_string(),
    }
}

struct HostKeyAcceptor;

#[async_trait]
impl client::Handler for HostKeyAcceptor {
    type Error = russh::Error;

    // Host keys are not pinned.
    async fn check_server_key(
        &mut self,
        _server_public_key: &russh_keys::key::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

/// SSH-backed [`RemoteShellFactory`]
#[derive(Debug, Default, Clone)]
pub struct SshShellFactory;

#[async_trait]
impl RemoteShellFactory for SshShellFactory {
    async fn connect(&self, params: &ShellParams) -> Result<Box<dyn RemoteShell>, RemoteShellError> {
        let config = Arc::new(client::Config {
            inactivity_timeout: Some(Duration::from_secs(300)),
            ..Default::default()
        });

        let address = (params.host.as_str(), params.port);
        let mut handle = tokio::time::timeout(
            CONNECT_TIMEOUT,
            client::connect(config, address, HostKeyAcceptor),
        )
        .await
        .map_err(|_| {
            RemoteShellError::Connect(format!(
                "timed out connecting to {}:{}",
                params.host, params.port
            ))
        })?
        .map_err(|e| RemoteShellError::Connect(format!("{}:{}: {}", params.host, params.port, e)))?;

        let authenticated = handle
            .authenticate_password(params.username.as_str(), params.password.as_str())
            .await?;
        if !authenticated {
            return Err(RemoteShellError::Authentication(format!(
                "password rejected for {}@{}",
                params.username, params.host
            )));
        }

        debug!("SSH session established to {}:{}", params.host, params.port);
        Ok(Box::new(SshShell { handle }))
    }
}

struct SshShell {
    handle: Handle<HostKeyAcceptor>,
}

#[async_trait]
impl RemoteShell for SshShell {
    async fn exec(&self, command: &str) -> Result<CommandOutput, RemoteShellError> {
        let mut channel = self.handle.channel_open_session().await?;
        channel.exec(true, command).await?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut exit_status = None;
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { ref data } => stdout.extend_from_slice(data),
                ChannelMsg::ExtendedData { ref data, ext: 1 } => stderr.extend_from_slice(data),
                ChannelMsg::ExitStatus { exit_status: status } => exit_status = Some(status),
                _ => {}
            }
        }

        let stderr = String::from_utf8_lossy(&stderr).into_owned();
        let exit_status = exit_status.ok_or_else(|| RemoteShellError::Command {
            command: command.to_string(),
            message: format!("channel closed without an exit status: {}", stderr.trim()),
        })?;

        Ok(CommandOutput {
            exit_status,
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr,
        })
    }

    async fn close(&self) {
        if let Err(e) = self
            .handle
            .disconnect(Disconnect::ByApplication, "", "English")
            .await
        {
            debug!("SSH disconnect failed: {}", e);
        }
    }
}
