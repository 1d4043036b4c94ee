//! berth-ssh: SSH tunnels and the remote process bridge
//!
//! One persistent, multiplexed SSH connection per remote worker. Two
//! operations share it: one-shot `exec` commands (directory bootstrap,
//! `$HOME` discovery, git setup) and long-lived interactive `shell`
//! channels that back remote [`Process`](berth_pty::Process)es.

pub mod keys;
pub mod remote;
pub mod tunnel;

pub use keys::validate_private_key;
pub use remote::RemoteBridge;
pub use tunnel::{RemoteChannel, RemoteChannelEvent, SshTunnel, TunnelManager};
