//! Process-wide server state and the serial dispatcher.
//!
//! A [`Server`] owns the four tables every request touches: the handle
//! registry, the lock table, the backend registry and the mount table.
//! Handlers take `&mut self`, so the type itself is the proof that registry
//! mutations never interleave.
//!
//! [`BackgroundServer`] puts that guarantee on a wire: one dispatch thread
//! drains a FIFO queue of envelopes, and any number of transport threads
//! enqueue through cloned [`ServerHandle`]s and block for their reply. A
//! handler runs to completion before the next envelope is popped; the only
//! suspension points are inside backend callbacks.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::panic::catch_unwind;
use std::sync::Arc;
use std::sync::mpsc;
use std::thread;

use log::debug;
use log::error;
use log::info;
use log::warn;

use parking_lot::RwLock;

use crate::BackendModule;
use crate::NfsString;
use crate::NodeId;
use crate::dispatch::NfsCall;
use crate::dispatch::NfsReply;
use crate::handle::FileHandle;
use crate::handle::FsId;
use crate::handle::HandleRegistry;
use crate::lock::LockTable;
use crate::mount::ExportEntry;
use crate::mount::FhStatus;
use crate::mount::MountCall;
use crate::mount::MountOpts;
use crate::mount::MountReply;
use crate::mount::MountTable;
use crate::nlm::KlmCall;
use crate::nlm::KlmReply;
use crate::registry::BackendRegistry;
use crate::status::FsError;
use crate::status::NfsStat;

/// Run a backend callback inside the crash barrier.
///
/// A panicking backend must not take the dispatcher down with it; the
/// panic is caught, logged, and reported as an I/O failure.
pub(crate) fn crash_barrier<T>(
    op: &str,
    f: impl FnOnce() -> Result<T, FsError>,
) -> Result<T, FsError> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(_) => {
            error!("backend panicked in {op}; reporting I/O error");
            Err(FsError::Io)
        }
    }
}

/// Server construction options.
#[derive(Clone, Copy, Debug, Default)]
pub struct ServerConfig {
    /// Trace every admitted request and its reply at debug level.
    pub debug: bool,
}

/// The server core: all protocol state plus one handler per RPC program.
#[derive(Debug)]
pub struct Server {
    // Reads may come from outside the dispatch thread (stale probes by the
    // transport); every write happens under `&mut self`.
    pub(crate) handles: RwLock<HandleRegistry>,
    pub(crate) locks: LockTable,
    pub(crate) backends: BackendRegistry,
    pub(crate) mounts: MountTable,
    debug: bool,
}

impl Server {
    /// Create a server with the given configuration.
    pub fn new(config: ServerConfig) -> Server {
        Server {
            handles: RwLock::new(HandleRegistry::new()),
            locks: LockTable::new(),
            backends: BackendRegistry::new(),
            mounts: MountTable::new(),
            debug: config.debug,
        }
    }

    /// Register an exported path in the unmounted state.
    ///
    /// Duplicates are allowed; `mnt` uses the first match.
    pub fn add_mountpoint(
        &mut self,
        path: NfsString,
        module: Arc<dyn BackendModule>,
        opts: MountOpts,
    ) {
        info!("export {path} via {}", module.name());
        self.mounts.add(path, module, opts);
    }

    /// Toggle per-request debug tracing.
    pub fn set_debug(&mut self, on: bool) {
        self.debug = on;
    }

    /// Whether per-request debug tracing is on.
    pub fn debug_enabled(&self) -> bool {
        self.debug
    }

    /// The node id behind a handle, if this instance ever minted it.
    /// Read-only; safe to call from outside the dispatch thread.
    pub fn lookup_id(&self, fh: &FileHandle) -> Option<NodeId> {
        self.handles.read().lookup_id(fh)
    }

    /// Resolve a handle to a live backend, or the stale status.
    pub(crate) fn resolve(&self, fh: &FileHandle) -> Result<(NodeId, FsId), NfsStat> {
        let id = self
            .handles
            .read()
            .lookup_id(fh)
            .ok_or(NfsStat::NFSERR_STALE)?;
        let (_, fs_id) = fh.parse();
        if !self.backends.is_live(fs_id) {
            debug!("{fh:?} names an unmounted filesystem");
            return Err(NfsStat::NFSERR_STALE);
        }
        Ok((id, fs_id))
    }

    /// Handle one decoded request, producing exactly one reply.
    pub fn handle(&mut self, request: Request) -> Response {
        let Request { meta, body } = request;
        if self.debug {
            debug!("xid {:#x} uid {} gid {}: {body:?}", meta.xid, meta.uid, meta.gid);
        }
        let response = match body {
            RequestBody::Mount(call) => Response::Mount(self.handle_mount(call)),
            RequestBody::Nfs(call) => Response::Nfs(self.handle_nfs(call)),
            RequestBody::Klm(call) => Response::Klm(self.handle_klm(call)),
            RequestBody::AddMountpoint { path, module, opts } => {
                self.add_mountpoint(path, module, opts);
                Response::Done
            }
            RequestBody::SetDebug(on) => {
                self.set_debug(on);
                Response::Done
            }
        };
        if self.debug {
            debug!("xid {:#x}: reply {response:?}", meta.xid);
        }
        response
    }

    /// Handle a MOUNT program call.
    pub fn handle_mount(&mut self, call: MountCall) -> MountReply {
        match call {
            MountCall::Null => MountReply::Void,
            MountCall::Mnt(path) => MountReply::Fh(self.mnt(&path)),
            MountCall::Umnt(path) => {
                self.umnt(&path);
                MountReply::Void
            }
            MountCall::UmntAll => {
                self.umntall();
                MountReply::Void
            }
            MountCall::Export => MountReply::Export(self.export()),
        }
    }

    fn mnt(&mut self, path: &NfsString) -> FhStatus {
        let Some(index) = self.mounts.find(path) else {
            warn!("mnt {path}: no matching export");
            return FhStatus::error();
        };
        if let Some(fh) = self.mounts.get(index).root_fh {
            // Remounting a mounted path is idempotent.
            return FhStatus::ok(fh);
        }
        let module = Arc::clone(&self.mounts.get(index).module);
        let opts = self.mounts.get(index).opts.clone();
        match crash_barrier("init", || module.init(&opts)) {
            Err(err) => {
                warn!("mnt {path}: init failed: {err}");
                FhStatus::error()
            }
            Ok((root_id, instance)) => {
                let fs_id = self.backends.allocate(module);
                self.backends.install(fs_id, instance);
                let root_fh = self.handles.write().handle_for(root_id, fs_id);
                let entry = self.mounts.get_mut(index);
                entry.root_fh = Some(root_fh);
                entry.fs_id = Some(fs_id);
                info!("mnt {path}: fs {fs_id}");
                FhStatus::ok(root_fh)
            }
        }
    }

    fn umnt_index(&mut self, index: usize) {
        let entry = self.mounts.get_mut(index);
        let Some(fs_id) = entry.fs_id.take() else {
            return;
        };
        entry.root_fh = None;
        let path = entry.path.clone();
        if let Some(mut instance) = self.backends.remove_instance(fs_id) {
            let _ = crash_barrier("terminate", || {
                instance.terminate();
                Ok(())
            });
        }
        info!("umnt {path}: fs {fs_id} detached");
    }

    fn umnt(&mut self, path: &NfsString) {
        // Void regardless of whether anything matched or was mounted.
        if let Some(index) = self.mounts.find(path) {
            self.umnt_index(index);
        }
    }

    fn umntall(&mut self) {
        for index in 0..self.mounts.len() {
            self.umnt_index(index);
        }
    }

    fn export(&self) -> Vec<ExportEntry> {
        self.mounts
            .entries()
            .iter()
            .map(|entry| ExportEntry {
                path: entry.path.clone(),
                groups: Vec::new(),
            })
            .collect()
    }
}

impl Default for Server {
    fn default() -> Server {
        Server::new(ServerConfig::default())
    }
}

/// Transport-supplied metadata for one request: the RPC transaction id and
/// the AUTH_SYS credentials. The core traces them and otherwise passes no
/// judgement (authentication is the transport's concern).
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct RequestMeta {
    /// RPC transaction id.
    pub xid: u32,
    /// AUTH_SYS uid, 0 when the call carried no credentials.
    pub uid: u32,
    /// AUTH_SYS gid, 0 when the call carried no credentials.
    pub gid: u32,
}

/// The body of an admitted request: a protocol call or an administrative
/// action.
pub enum RequestBody {
    /// A MOUNT program call.
    Mount(MountCall),
    /// An NFS program call.
    Nfs(NfsCall),
    /// A KLM program call.
    Klm(KlmCall),
    /// Administrative: register an exported path.
    AddMountpoint {
        /// Exported path.
        path: NfsString,
        /// Backend module serving the path.
        module: Arc<dyn BackendModule>,
        /// Options handed to `init` on every mount.
        opts: MountOpts,
    },
    /// Administrative: toggle per-request tracing.
    SetDebug(bool),
}

impl fmt::Debug for RequestBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestBody::Mount(call) => f.debug_tuple("Mount").field(call).finish(),
            RequestBody::Nfs(call) => f.debug_tuple("Nfs").field(call).finish(),
            RequestBody::Klm(call) => f.debug_tuple("Klm").field(call).finish(),
            RequestBody::AddMountpoint { path, module, .. } => f
                .debug_struct("AddMountpoint")
                .field("path", path)
                .field("module", &module.name())
                .finish(),
            RequestBody::SetDebug(on) => f.debug_tuple("SetDebug").field(on).finish(),
        }
    }
}

/// One admitted request.
#[derive(Debug)]
pub struct Request {
    /// Transport metadata.
    pub meta: RequestMeta,
    /// The call itself.
    pub body: RequestBody,
}

impl Request {
    /// A MOUNT call with default metadata.
    pub fn mount(call: MountCall) -> Request {
        Request {
            meta: RequestMeta::default(),
            body: RequestBody::Mount(call),
        }
    }

    /// An NFS call with default metadata.
    pub fn nfs(call: NfsCall) -> Request {
        Request {
            meta: RequestMeta::default(),
            body: RequestBody::Nfs(call),
        }
    }

    /// A KLM call with default metadata.
    pub fn klm(call: KlmCall) -> Request {
        Request {
            meta: RequestMeta::default(),
            body: RequestBody::Klm(call),
        }
    }

    /// Attach transport metadata.
    pub fn with_meta(mut self, meta: RequestMeta) -> Request {
        self.meta = meta;
        self
    }
}

/// The reply to one admitted request.
#[derive(Debug, PartialEq)]
pub enum Response {
    /// Reply to a MOUNT call.
    Mount(MountReply),
    /// Reply to an NFS call.
    Nfs(NfsReply),
    /// Reply to a KLM call.
    Klm(KlmReply),
    /// Acknowledgement of an administrative action.
    Done,
}

enum Envelope {
    Call(Request, mpsc::SyncSender<Response>),
    Stop,
}

/// Clonable admission point for transport threads.
///
/// Every call is enqueued in arrival order and handled to completion on the
/// dispatch thread; `call` blocks until the reply comes back. All methods
/// return `None` once the server has stopped.
#[derive(Clone, Debug)]
pub struct ServerHandle {
    tx: mpsc::Sender<Envelope>,
}

impl ServerHandle {
    /// Enqueue a request and wait for its reply.
    pub fn call(&self, request: Request) -> Option<Response> {
        let (reply_tx, reply_rx) = mpsc::sync_channel(1);
        self.tx.send(Envelope::Call(request, reply_tx)).ok()?;
        reply_rx.recv().ok()
    }

    /// Enqueue a MOUNT call.
    pub fn mount(&self, call: MountCall) -> Option<MountReply> {
        match self.call(Request::mount(call))? {
            Response::Mount(reply) => Some(reply),
            _ => None,
        }
    }

    /// Enqueue an NFS call.
    pub fn nfs(&self, call: NfsCall) -> Option<NfsReply> {
        match self.call(Request::nfs(call))? {
            Response::Nfs(reply) => Some(reply),
            _ => None,
        }
    }

    /// Enqueue a KLM call.
    pub fn klm(&self, call: KlmCall) -> Option<KlmReply> {
        match self.call(Request::klm(call))? {
            Response::Klm(reply) => Some(reply),
            _ => None,
        }
    }

    /// Register an exported path through the dispatch queue, keeping it
    /// ordered with in-flight mounts.
    pub fn add_mountpoint(
        &self,
        path: NfsString,
        module: Arc<dyn BackendModule>,
        opts: MountOpts,
    ) -> Option<()> {
        match self.call(Request {
            meta: RequestMeta::default(),
            body: RequestBody::AddMountpoint { path, module, opts },
        })? {
            Response::Done => Some(()),
            _ => None,
        }
    }

    /// Toggle per-request tracing.
    pub fn set_debug(&self, on: bool) -> Option<()> {
        match self.call(Request {
            meta: RequestMeta::default(),
            body: RequestBody::SetDebug(on),
        })? {
            Response::Done => Some(()),
            _ => None,
        }
    }

    /// Ask the dispatch thread to stop after the requests already queued.
    pub fn stop(&self) {
        let _ = self.tx.send(Envelope::Stop);
    }
}

fn serve(mut server: Server, rx: mpsc::Receiver<Envelope>) -> Server {
    info!("dispatcher running");
    while let Ok(envelope) = rx.recv() {
        match envelope {
            Envelope::Stop => break,
            Envelope::Call(request, reply) => {
                let response = server.handle(request);
                // The caller may have given up on the reply; that loss is
                // the transport's to notice.
                let _ = reply.send(response);
            }
        }
    }
    info!("dispatcher stopped");
    server
}

/// A server running on its own dispatch thread.
#[derive(Debug)]
pub struct BackgroundServer {
    handle: ServerHandle,
    thread: thread::JoinHandle<Server>,
}

impl BackgroundServer {
    /// Move the server onto a dispatch thread and start serving.
    pub fn start(server: Server) -> BackgroundServer {
        let (tx, rx) = mpsc::channel();
        let thread = thread::spawn(move || serve(server, rx));
        BackgroundServer {
            handle: ServerHandle { tx },
            thread,
        }
    }

    /// A new admission handle.
    pub fn handle(&self) -> ServerHandle {
        self.handle.clone()
    }

    /// Stop the dispatch thread and take the server state back. `None` if
    /// the thread died abnormally.
    pub fn stop(self) -> Option<Server> {
        self.handle.stop();
        self.thread.join().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Backend;
    use crate::FsError;
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;

    #[derive(Default)]
    struct CountingModule {
        inits: AtomicUsize,
        terminates: Arc<AtomicUsize>,
        fail_init: bool,
    }

    struct CountingBackend {
        terminates: Arc<AtomicUsize>,
    }

    impl BackendModule for CountingModule {
        fn name(&self) -> &str {
            "counting"
        }

        fn init(&self, _opts: &MountOpts) -> Result<(NodeId, Box<dyn Backend>), FsError> {
            if self.fail_init {
                return Err(FsError::NoConnection);
            }
            self.inits.fetch_add(1, Ordering::SeqCst);
            Ok((
                NodeId(42),
                Box::new(CountingBackend {
                    terminates: Arc::clone(&self.terminates),
                }),
            ))
        }
    }

    impl Backend for CountingBackend {
        fn terminate(&mut self) {
            self.terminates.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn mnt_of_unknown_path_fails() {
        let mut server = Server::default();
        let reply = server.handle_mount(MountCall::Mnt("/nope".into()));
        assert_eq!(reply, MountReply::Fh(FhStatus::error()));
    }

    #[test]
    fn mnt_is_idempotent_while_mounted() {
        let mut server = Server::default();
        let module = Arc::new(CountingModule::default());
        server.add_mountpoint("/x".into(), module.clone(), vec![]);

        let MountReply::Fh(first) = server.handle_mount(MountCall::Mnt("/x".into())) else {
            panic!("mnt must answer with fhstatus");
        };
        let MountReply::Fh(second) = server.handle_mount(MountCall::Mnt("/x".into())) else {
            panic!("mnt must answer with fhstatus");
        };
        assert_eq!(first.status, 0);
        assert_eq!(first, second);
        assert_eq!(module.inits.load(Ordering::SeqCst), 1);

        let (file_id, fs_id) = first.fh.expect("root handle").parse();
        assert_eq!(file_id, 1);
        assert_eq!(fs_id, FsId(1));
    }

    #[test]
    fn remount_allocates_a_fresh_filesystem() {
        let mut server = Server::default();
        let module = Arc::new(CountingModule::default());
        server.add_mountpoint("/x".into(), module.clone(), vec![]);

        let MountReply::Fh(first) = server.handle_mount(MountCall::Mnt("/x".into())) else {
            panic!("mnt must answer with fhstatus");
        };
        assert_eq!(
            server.handle_mount(MountCall::Umnt("/x".into())),
            MountReply::Void
        );
        let MountReply::Fh(second) = server.handle_mount(MountCall::Mnt("/x".into())) else {
            panic!("mnt must answer with fhstatus");
        };

        assert_eq!(module.inits.load(Ordering::SeqCst), 2);
        assert_eq!(module.terminates.load(Ordering::SeqCst), 1);
        assert_ne!(first.fh, second.fh);
        assert_eq!(second.fh.expect("root handle").parse().1, FsId(2));
    }

    #[test]
    fn failed_init_reports_status_one() {
        let mut server = Server::default();
        let module = Arc::new(CountingModule {
            fail_init: true,
            ..CountingModule::default()
        });
        server.add_mountpoint("/x".into(), module, vec![]);
        assert_eq!(
            server.handle_mount(MountCall::Mnt("/x".into())),
            MountReply::Fh(FhStatus::error())
        );
    }

    #[test]
    fn umnt_of_unmounted_path_is_void() {
        let mut server = Server::default();
        server.add_mountpoint("/x".into(), Arc::new(CountingModule::default()), vec![]);
        assert_eq!(
            server.handle_mount(MountCall::Umnt("/x".into())),
            MountReply::Void
        );
        assert_eq!(
            server.handle_mount(MountCall::Umnt("/absent".into())),
            MountReply::Void
        );
    }

    #[test]
    fn umntall_covers_every_mounted_entry() {
        let mut server = Server::default();
        let module = Arc::new(CountingModule::default());
        server.add_mountpoint("/a".into(), module.clone(), vec![]);
        server.add_mountpoint("/b".into(), module.clone(), vec![]);
        server.handle_mount(MountCall::Mnt("/a".into()));
        server.handle_mount(MountCall::Mnt("/b".into()));

        server.handle_mount(MountCall::UmntAll);
        assert_eq!(module.terminates.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn export_lists_every_entry() {
        let mut server = Server::default();
        let module = Arc::new(CountingModule::default());
        server.add_mountpoint("/a".into(), module.clone(), vec![]);
        server.add_mountpoint("/b".into(), module, vec![]);
        server.handle_mount(MountCall::Mnt("/a".into()));

        let MountReply::Export(entries) = server.handle_mount(MountCall::Export) else {
            panic!("export must answer with a listing");
        };
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].path, "/a".into());
        assert!(entries[0].groups.is_empty());
        assert_eq!(entries[1].path, "/b".into());
    }

    #[test]
    fn background_server_round_trip() {
        let server = Server::default();
        let running = BackgroundServer::start(server);
        let handle = running.handle();

        handle
            .add_mountpoint("/x".into(), Arc::new(CountingModule::default()), vec![])
            .expect("admin call");
        let reply = handle.mount(MountCall::Mnt("/x".into())).expect("reply");
        let MountReply::Fh(status) = reply else {
            panic!("mnt must answer with fhstatus");
        };
        assert_eq!(status.status, 0);
        assert_eq!(handle.set_debug(true), Some(()));

        let server = running.stop().expect("dispatcher exits cleanly");
        assert!(server.debug_enabled());
        assert_eq!(server.mounts.len(), 1);
    }

    #[test]
    fn handle_after_stop_returns_none() {
        let running = BackgroundServer::start(Server::default());
        let handle = running.handle();
        running.stop();
        assert!(handle.mount(MountCall::Null).is_none());
    }
}
