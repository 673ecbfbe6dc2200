//! Property Server (C5).
//!
//! A single dedicated thread owns the client listen socket and the
//! property-store write path. The "internal socketpair" the original design
//! describes becomes an `mpsc` channel pair here: both ends live in this
//! process, so a channel gives the same FIFO, ownership-transferring
//! handoff a `SOCK_SEQPACKET` pair would, without an extra syscall layer.
use crate::constants::{
    CONTROL_PREFIX, POWERCTL_PROPERTY, RESTORECON_RECURSIVE_PROPERTY,
};
use crate::error::PropertyErrorCode;
use crate::property::info::PropertyInfoTrie;
use crate::property::protocol::{ClientRequest, Deadline, read_request, write_length_prefixed};
use crate::property::{InternalMessage, store};
use crate::runtime;
use std::collections::VecDeque;
use std::io::Write;
use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::mpsc::{Receiver, Sender, channel};
use std::sync::{Arc, Mutex};
use std::thread;
use tracing::{debug, info, warn};

/// Commands the supervisor sends back into the property server thread,
/// carried over the same channel direction as `InternalMessage` would be on
/// a real socketpair, but typed separately since they flow the other way.
#[derive(Debug, Clone)]
pub enum ServerCommand {
    /// Load the durable `persist.*` store from disk.
    LoadPersistentProperties,
    /// Suppress `PropertyChanged` notifications.
    StopSendingMessages,
    /// Resume `PropertyChanged` notifications.
    StartSendingMessages,
}

struct RestoreconQueue {
    pending: Mutex<VecDeque<String>>,
    worker_running: Mutex<bool>,
}

impl RestoreconQueue {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            pending: Mutex::new(VecDeque::new()),
            worker_running: Mutex::new(false),
        })
    }

    fn enqueue(self: &Arc<Self>, path: String) {
        self.pending.lock().expect("restorecon queue poisoned").push_back(path);
        self.spawn_worker_if_idle();
    }

    fn spawn_worker_if_idle(self: &Arc<Self>) {
        let mut running = self.worker_running.lock().expect("restorecon queue poisoned");
        if *running {
            return;
        }
        *running = true;
        drop(running);

        let queue = Arc::clone(self);
        thread::spawn(move || {
            loop {
                let next = queue.pending.lock().expect("restorecon queue poisoned").pop_front();
                let Some(path) = next else {
                    *queue.worker_running.lock().expect("restorecon queue poisoned") = false;
                    return;
                };
                debug!("restorecon_recursive: restoring context under {path}");
                // No genuine SELinux filesystem-label layer is present;
                // completion is marked by storing the path as a normal
                // property, matching the upstream worker's finish signal.
                store::global().set(RESTORECON_RECURSIVE_PROPERTY, &path, None);
            }
        });
    }
}

/// Owns the client listen socket, the PropertyInfo trie, and the
/// async-restorecon worker handle.
pub struct PropertyServer {
    listener: UnixListener,
    info: PropertyInfoTrie,
    internal_tx: Sender<InternalMessage>,
    commands: Receiver<ServerCommand>,
    restorecon: Arc<RestoreconQueue>,
}

impl PropertyServer {
    /// Binds the client socket at `socket_path` and wires the internal
    /// channel through to the store (for `PropertyChanged` emission).
    pub fn bind(
        socket_path: &std::path::Path,
        info: PropertyInfoTrie,
    ) -> std::io::Result<(Self, Receiver<InternalMessage>, Sender<ServerCommand>)> {
        let _ = std::fs::remove_file(socket_path);
        let listener = UnixListener::bind(socket_path)?;
        listener.set_nonblocking(true)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(
                socket_path,
                std::fs::Permissions::from_mode(crate::constants::CLIENT_SOCKET_MODE),
            )?;
        }

        let (internal_tx, internal_rx) = channel();
        let (command_tx, command_rx) = channel();
        store::global().set_notifier(internal_tx.clone());

        Ok((
            Self {
                listener,
                info,
                internal_tx,
                commands: command_rx,
                restorecon: RestoreconQueue::new(),
            },
            internal_rx,
            command_tx,
        ))
    }

    /// Runs the accept loop. Blocks forever; intended to run on its own
    /// thread spawned by the supervisor at startup.
    pub fn run(&mut self) {
        info!("property server listening on {:?}", self.listener.local_addr());
        loop {
            while let Ok(command) = self.commands.try_recv() {
                self.handle_command(command);
            }

            match self.listener.accept() {
                Ok((stream, _addr)) => {
                    if let Err(err) = stream.set_nonblocking(false) {
                        warn!("failed to set client stream blocking: {err}");
                        continue;
                    }
                    if let Err(err) =
                        stream.set_read_timeout(Some(crate::constants::CLIENT_REQUEST_DEADLINE))
                    {
                        warn!("failed to set client stream read timeout: {err}");
                    }
                    self.handle_connection(stream);
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                    thread::sleep(std::time::Duration::from_millis(10));
                }
                Err(err) => {
                    warn!("property server accept error: {err}");
                }
            }
        }
    }

    fn handle_command(&mut self, command: ServerCommand) {
        match command {
            ServerCommand::LoadPersistentProperties => {
                runtime::set_persistent_properties_loaded(true);
                store::global().set_force(
                    crate::constants::PERSISTENT_PROPERTIES_READY,
                    "true",
                );
            }
            ServerCommand::StopSendingMessages => runtime::set_accept_messages(false),
            ServerCommand::StartSendingMessages => runtime::set_accept_messages(true),
        }
    }

    fn handle_connection(&mut self, mut stream: UnixStream) {
        let (peer_pid, peer_uid) = peer_credentials(&stream).unwrap_or((-1, u32::MAX));
        let deadline = Deadline::start();

        let request = match read_request(&mut stream, &deadline) {
            Ok(request) => request,
            Err(err) => {
                debug!("property request from pid {peer_pid} failed to parse: {err}");
                let code = PropertyErrorCode::from(&err);
                let _ = write_result(&mut stream, code);
                return;
            }
        };

        let request = match request {
            ClientRequest::Get { name } => {
                let value = store::global().get(&name);
                let _ = write_result(&mut stream, PropertyErrorCode::Success);
                let _ = write_length_prefixed(&mut stream, value.as_deref().unwrap_or(""));
                return;
            }
            ClientRequest::Set(request) => request,
        };

        if let Some(service_name) = request.name.strip_prefix(CONTROL_PREFIX) {
            self.handle_control(
                stream,
                peer_pid,
                peer_uid,
                service_name,
                &request.name,
                &request.value,
                request.legacy,
            );
            return;
        }

        if request.name == POWERCTL_PROPERTY {
            info!(
                "sys.powerctl write from pid {peer_pid} (cmdline: {})",
                read_cmdline(peer_pid)
            );
        }

        if request.name == RESTORECON_RECURSIVE_PROPERTY && peer_pid != 1 && !request.value.is_empty() {
            self.restorecon.enqueue(request.value.clone());
            if !request.legacy {
                let _ = write_result(&mut stream, PropertyErrorCode::Success);
            }
            return;
        }

        let code = self.set_authorized(&request.name, &request.value, peer_uid);
        if !request.legacy {
            let _ = write_result(&mut stream, code);
        }
    }

    fn set_authorized(&self, name: &str, value: &str, peer_uid: u32) -> PropertyErrorCode {
        let info = self.info.lookup(name);
        if let Some(info) = info {
            debug!("setting '{name}' under context '{}' (type {})", info.context, info.ty);
            if !info.permits(peer_uid) {
                return PropertyErrorCode::PermissionDenied;
            }
        }
        PropertyErrorCode::from(store::global().set(name, value, info))
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_control(
        &self,
        mut stream: UnixStream,
        peer_pid: i32,
        peer_uid: u32,
        service_name: &str,
        full_name: &str,
        value: &str,
        legacy: bool,
    ) {
        // Legacy check is keyed on the target service name (`ctl.<value>`);
        // full check is keyed on the original property name plus target
        // (`<name>$<value>`, e.g. `ctl.start$zygote`). Either entry granting
        // access is enough; a deny is only authoritative when at least one
        // of the two patterns is actually configured in the trie — an
        // unconfigured control name falls through to the supervisor as
        // before, matching upstream's "no policy means no audit" behavior.
        let legacy_info = self.info.lookup(&format!("{CONTROL_PREFIX}{value}"));
        let full_info = self.info.lookup(&format!("{full_name}${value}"));
        let configured = legacy_info.is_some() || full_info.is_some();
        let granted = legacy_info.is_some_and(|i| i.permits(peer_uid))
            || full_info.is_some_and(|i| i.permits(peer_uid));

        if configured && !granted {
            debug!(
                "control message '{service_name}' on '{value}' denied for uid {peer_uid}"
            );
            if !legacy {
                let _ = write_result(&mut stream, PropertyErrorCode::ControlMessageError);
            }
            return;
        }

        let reply_fd = if legacy {
            None
        } else {
            use std::os::fd::IntoRawFd;
            Some(stream.into_raw_fd())
        };

        let sent = self.internal_tx.send(InternalMessage::ControlRequest {
            msg: service_name.to_string(),
            name: value.to_string(),
            pid: peer_pid,
            reply_fd,
        });

        if sent.is_err()
            && let Some(fd) = reply_fd
        {
            unsafe {
                libc::close(fd);
            }
        }
    }

    /// Replies through a transferred client descriptor, closing it afterward.
    pub fn reply_through_fd(fd: std::os::fd::RawFd, code: PropertyErrorCode) {
        use std::os::fd::FromRawFd;
        let mut stream = unsafe { UnixStream::from_raw_fd(fd) };
        let _ = write_result(&mut stream, code);
    }
}

fn write_result(stream: &mut UnixStream, code: PropertyErrorCode) -> std::io::Result<()> {
    stream.write_all(&code.as_u32().to_ne_bytes())
}

fn peer_credentials(stream: &UnixStream) -> Option<(i32, u32)> {
    use std::os::fd::AsRawFd;
    let mut cred: libc::ucred = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::ucred>() as libc::socklen_t;
    let res = unsafe {
        libc::getsockopt(
            stream.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_PEERCRED,
            &mut cred as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    if res == 0 { Some((cred.pid, cred.uid)) } else { None }
}

fn read_cmdline(pid: i32) -> String {
    std::fs::read_to_string(format!("/proc/{pid}/cmdline"))
        .unwrap_or_default()
        .replace('\0', " ")
        .trim()
        .to_string()
}
