//! Channel bridge between binding callers and the USB worker thread

use async_channel::{Receiver, Sender, bounded};
use std::fmt;
use usb_binding::{
    BindingError, ConfigRecord, ConnectionHandle, ControlTransferInfo, DeviceId, DeviceRecord,
    GenericTransferInfo, RequestResult, TransferCallback, TransferResultInfo,
};

/// Reply channel of a request/response command
pub type Reply<T> = Sender<RequestResult<T>>;

/// A transfer request for the worker
#[derive(Debug, Clone)]
pub enum TransferRequest {
    Control(ControlTransferInfo),
    Bulk(GenericTransferInfo),
    Interrupt(GenericTransferInfo),
}

/// Where the outcome of a transfer goes
pub enum Completion {
    /// A caller blocked on the reply channel
    Reply(Reply<TransferResultInfo>),
    /// An asynchronous submitter's callback, run on the transfer's thread
    Callback(TransferCallback),
}

impl Completion {
    pub fn complete(self, result: RequestResult<TransferResultInfo>) {
        match self {
            Completion::Reply(response) => {
                let _ = response.send_blocking(result);
            }
            Completion::Callback(callback) => callback(result),
        }
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Completion::Reply(_) => f.write_str("Completion::Reply"),
            Completion::Callback(_) => f.write_str("Completion::Callback"),
        }
    }
}

/// Commands to the USB worker thread
#[derive(Debug)]
pub enum BindingCommand {
    /// Refresh and list the visible devices
    GetDevices { response: Reply<Vec<DeviceRecord>> },

    GetConfigurations {
        device: DeviceId,
        response: Reply<Vec<ConfigRecord>>,
    },

    OpenDevice {
        device: DeviceId,
        response: Reply<ConnectionHandle>,
    },

    CloseDevice {
        connection: ConnectionHandle,
        response: Reply<()>,
    },

    ClaimInterface {
        connection: ConnectionHandle,
        interface_number: u8,
        response: Reply<()>,
    },

    ReleaseInterface {
        connection: ConnectionHandle,
        interface_number: u8,
        response: Reply<()>,
    },

    ResetDevice {
        connection: ConnectionHandle,
        response: Reply<()>,
    },

    /// Run a transfer and hand its outcome to `completion`
    Transfer {
        connection: ConnectionHandle,
        request: TransferRequest,
        completion: Completion,
    },

    /// Stop the worker thread
    Shutdown,
}

impl BindingCommand {
    /// Answer a command that never reached the worker
    fn fail(self, message: &str) {
        match self {
            BindingCommand::GetDevices { response } => fail_reply(response, message),
            BindingCommand::GetConfigurations { response, .. } => fail_reply(response, message),
            BindingCommand::OpenDevice { response, .. } => fail_reply(response, message),
            BindingCommand::CloseDevice { response, .. }
            | BindingCommand::ClaimInterface { response, .. }
            | BindingCommand::ReleaseInterface { response, .. }
            | BindingCommand::ResetDevice { response, .. } => fail_reply(response, message),
            BindingCommand::Transfer { completion, .. } => {
                completion.complete(RequestResult::failed(message))
            }
            BindingCommand::Shutdown => {}
        }
    }
}

fn fail_reply<T>(response: Reply<T>, message: &str) {
    let _ = response.try_send(RequestResult::failed(message));
}

/// Caller side of the bridge
#[derive(Clone)]
pub struct BindingClient {
    cmd_tx: Sender<BindingCommand>,
}

impl BindingClient {
    /// Queue a command for the worker (blocking while the queue is full)
    ///
    /// A command that cannot be queued is answered with a failure, so
    /// callbacks still fire exactly once.
    pub fn send_command(&self, cmd: BindingCommand) -> usb_binding::Result<()> {
        self.cmd_tx.send_blocking(cmd).map_err(|e| {
            let error = BindingError::ChannelClosed("USB worker is not running".to_string());
            e.into_inner().fail(&error.to_string());
            error
        })
    }

    /// Send a request/response command and wait for its answer
    pub fn request<T>(&self, make: impl FnOnce(Reply<T>) -> BindingCommand) -> RequestResult<T> {
        let (tx, rx) = bounded(1);
        if self.send_command(make(tx)).is_err() {
            return RequestResult::failed("USB worker is not running");
        }
        rx.recv_blocking().unwrap_or_else(|e| {
            RequestResult::failed(BindingError::ChannelClosed(e.to_string()).to_string())
        })
    }

    /// Ask the worker to stop; false when it already has
    pub fn shutdown(&self) -> bool {
        self.cmd_tx.send_blocking(BindingCommand::Shutdown).is_ok()
    }
}

/// Worker side of the bridge
pub struct BindingWorker {
    cmd_rx: Receiver<BindingCommand>,
}

impl BindingWorker {
    /// Receive the next command (blocking)
    pub fn recv_command(&self) -> usb_binding::Result<BindingCommand> {
        self.cmd_rx
            .recv_blocking()
            .map_err(|e| BindingError::ChannelClosed(e.to_string()))
    }

    /// Close the queue and fail every command still waiting in it
    pub fn close(self, reason: &str) {
        self.cmd_rx.close();
        while let Ok(cmd) = self.cmd_rx.try_recv() {
            cmd.fail(reason);
        }
    }
}

/// Create the bridge with a command queue of `capacity` entries
pub fn create_binding_bridge(capacity: usize) -> (BindingClient, BindingWorker) {
    let (cmd_tx, cmd_rx) = bounded(capacity);
    (BindingClient { cmd_tx }, BindingWorker { cmd_rx })
}
