//! Unix domain socket control channel between the CLI and the daemon.
//!
//! Newline-delimited JSON: each request and response is one JSON value on
//! its own line. A `Subscribe` request turns the connection into a one-way
//! stream of `Event` responses.
//!
//! ## Socket Path
//!
//! - `$XDG_RUNTIME_DIR/agentrelay/daemon.sock` when the variable is set
//! - `/tmp/agentrelay-$UID/daemon.sock` otherwise
//!
//! ```rust,no_run
//! use agentrelay::ipc::{get_socket_path, IpcClient};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut client = IpcClient::connect(&get_socket_path()).await?;
//!     if client.ping().await? {
//!         println!("daemon is running");
//!     }
//!     Ok(())
//! }
//! ```

mod client;
mod messages;
pub mod pidfile;
mod server;

pub use client::IpcClient;
pub use messages::{IpcRequest, IpcResponse};
pub use pidfile::PidFile;
pub use server::{IpcConnection, IpcError, IpcServer};

use std::path::PathBuf;

/// Directory name used under the runtime directory.
const SOCKET_DIR_NAME: &str = "agentrelay";

/// Socket file name.
const SOCKET_FILE_NAME: &str = "daemon.sock";

/// Returns the daemon's socket path.
pub fn get_socket_path() -> PathBuf {
    socket_path_for(std::env::var_os("XDG_RUNTIME_DIR").map(PathBuf::from))
}

fn socket_path_for(runtime_dir: Option<PathBuf>) -> PathBuf {
    match runtime_dir {
        Some(dir) if !dir.as_os_str().is_empty() => {
            dir.join(SOCKET_DIR_NAME).join(SOCKET_FILE_NAME)
        }
        _ => {
            let uid = nix::unistd::getuid();
            PathBuf::from(format!("/tmp/{SOCKET_DIR_NAME}-{uid}")).join(SOCKET_FILE_NAME)
        }
    }
}
