//! Control Channel
//!
//! An embedding host drives a running node through a command stream:
//! `rebind` re-opens the UDP sockets without disturbing sessions, `exit`
//! performs a graceful shutdown. Every request carries a reply channel so
//! the caller can observe completion.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use crate::error::{CoreError, CoreResult};
use crate::interface::Interface;
use lantern_network::udp::UdpListenerPool;

/// Commands an embedding host may issue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Re-open the UDP sockets on the same port
    Rebind,
    /// Graceful shutdown
    Exit,
}

/// One command plus its reply channel
pub struct CommandRequest {
    pub command: Command,
    pub reply: oneshot::Sender<CoreResult<()>>,
}

impl CommandRequest {
    /// Build a request and the receiver for its outcome
    pub fn new(command: Command) -> (Self, oneshot::Receiver<CoreResult<()>>) {
        let (reply, rx) = oneshot::channel();
        (Self { command, reply }, rx)
    }
}

/// Consume the command stream until `Exit` arrives or the stream closes
pub async fn run_command_loop(
    mut commands: mpsc::Receiver<CommandRequest>,
    interface: Arc<Interface>,
    udp: Arc<UdpListenerPool>,
) {
    while let Some(request) = commands.recv().await {
        match request.command {
            Command::Rebind => {
                info!("rebind requested");
                let result = udp.rebind().await.map_err(CoreError::Network);
                if let Err(e) = &result {
                    warn!(error = %e, "rebind failed");
                }
                let _ = request.reply.send(result);
            }
            Command::Exit => {
                info!("exit requested");
                interface.shutdown().await;
                let _ = request.reply.send(Ok(()));
                break;
            }
        }
    }
}
