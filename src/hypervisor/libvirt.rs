//! [`Hypervisor`] backed by a libvirt connection.

use std::ffi::{CStr, CString};
use std::os::raw::{c_int, c_void};
use std::ptr;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::event_loop;
use super::ffi::{
    self, CloseCallback, GenericCallback, LifecycleCallback, VirConnectPtr, VirDomainPtr, VirtApi,
    ERR_NO_DOMAIN, ERR_OPERATION_INVALID, EVENT_ID_LIFECYCLE,
};
use super::{Hypervisor, NotificationSink, RECONNECT_QUEUE_CAPACITY};
use crate::domain::{DomainConfig, DomainNotification, DomainState, StateReason};
use crate::error::{Error, Result};
use crate::retry::{retry_with_backoff, RetryConfig};

/// Opaque data handed to the lifecycle callback.
struct LifecycleContext {
    api: &'static VirtApi,
    sink: NotificationSink,
}

struct ConnState {
    ptr: VirConnectPtr,
    lifecycle_callback: Option<c_int>,
}

// SAFETY: a virConnectPtr may be used from any thread; access is serialized
// by the surrounding mutex.
unsafe impl Send for ConnState {}

/// A libvirt connection that reopens itself when it dies.
///
/// Every call first checks liveness; a dead connection is replaced and a
/// reconnect notification is queued so the owner can re-register its
/// lifecycle callback on the new connection.
pub struct LibvirtConnection {
    api: &'static VirtApi,
    uri: String,
    uri_c: CString,
    state: Mutex<ConnState>,
    reconnect_tx: mpsc::Sender<()>,
    reconnect_rx: Mutex<Option<mpsc::Receiver<()>>>,
}

impl LibvirtConnection {
    /// Open a connection to `uri`, retrying until `timeout` has elapsed.
    pub fn open(uri: &str, timeout: Duration) -> Result<Self> {
        let api = ffi::api()?;
        event_loop::ensure_registered(api)?;

        let uri_c = CString::new(uri)
            .map_err(|_| Error::config("parse libvirt uri", "contains a NUL byte"))?;
        let (reconnect_tx, reconnect_rx) = mpsc::channel(RECONNECT_QUEUE_CAPACITY);

        let ptr = retry_with_backoff(
            RetryConfig::for_connection(timeout),
            "connect to libvirt",
            || connect(api, &uri_c, uri),
            |_| true,
        )?;

        let conn = Self {
            api,
            uri: uri.to_string(),
            uri_c,
            state: Mutex::new(ConnState {
                ptr,
                lifecycle_callback: None,
            }),
            reconnect_tx,
            reconnect_rx: Mutex::new(Some(reconnect_rx)),
        };
        conn.watch_close(ptr);
        tracing::info!(uri = %conn.uri, "connected to libvirt");
        Ok(conn)
    }

    /// Route libvirt's close callback into the reconnect queue.
    fn watch_close(&self, ptr: VirConnectPtr) {
        let ctx = Box::into_raw(Box::new(self.reconnect_tx.clone()));
        // SAFETY: ptr is a live connection; ctx is freed by free_close_ctx.
        let rc = unsafe {
            (self.api.connect_register_close_callback)(
                ptr,
                on_close as CloseCallback,
                ctx as *mut c_void,
                Some(free_close_ctx),
            )
        };
        if rc < 0 {
            // SAFETY: registration failed, libvirt does not own ctx.
            drop(unsafe { Box::from_raw(ctx) });
            let (_, message) = self.api.last_error();
            tracing::warn!(error = %message, "could not watch libvirt connection for close");
        }
    }

    /// Make sure `state.ptr` is a live connection.
    ///
    /// Returns `true` when a new connection had to be opened.
    fn ensure_alive(&self, state: &mut ConnState) -> Result<bool> {
        // SAFETY: non-null pointers in state are open connections.
        if !state.ptr.is_null() && unsafe { (self.api.connect_is_alive)(state.ptr) } == 1 {
            return Ok(false);
        }

        tracing::warn!(uri = %self.uri, "libvirt connection lost, reconnecting");
        self.release(state);
        state.ptr = connect(self.api, &self.uri_c, &self.uri)?;
        self.watch_close(state.ptr);
        tracing::info!(uri = %self.uri, "reconnected to libvirt");
        Ok(true)
    }

    /// Drop the callback registration and close the connection.
    fn release(&self, state: &mut ConnState) {
        if state.ptr.is_null() {
            return;
        }
        // SAFETY: ptr is an open connection that is not used after this.
        unsafe {
            if let Some(id) = state.lifecycle_callback.take() {
                (self.api.domain_event_deregister_any)(state.ptr, id);
            }
            (self.api.connect_unregister_close_callback)(state.ptr, on_close as CloseCallback);
            (self.api.connect_close)(state.ptr);
        }
        state.ptr = ptr::null_mut();
    }

    /// Look up `name` and run `f` on its handle.
    ///
    /// Holds the connection lock for the duration so the handle cannot
    /// outlive a reconnect.
    fn with_domain<T>(&self, name: &str, f: impl FnOnce(VirDomainPtr) -> Result<T>) -> Result<T> {
        let name_c = CString::new(name).map_err(|_| Error::domain_not_found(name))?;

        let mut state = self.state.lock();
        if self.ensure_alive(&mut state)? {
            let _ = self.reconnect_tx.try_send(());
        }

        // SAFETY: state.ptr is live; name_c outlives the call.
        let dom = unsafe { (self.api.domain_lookup_by_name)(state.ptr, name_c.as_ptr()) };
        if dom.is_null() {
            return Err(self.last_error("lookup domain", name));
        }

        let result = f(dom);
        // SAFETY: dom came from virDomainLookupByName and is not used again.
        unsafe { (self.api.domain_free)(dom) };
        result
    }

    /// Map the thread's last libvirt error onto this crate's error classes.
    fn last_error(&self, operation: &str, name: &str) -> Error {
        let (code, message) = self.api.last_error();
        match code {
            ERR_NO_DOMAIN => Error::domain_not_found(name),
            ERR_OPERATION_INVALID => Error::invalid_operation(operation, message),
            _ => Error::hypervisor(format!("{} {}", operation, name), message),
        }
    }
}

impl Hypervisor for LibvirtConnection {
    fn domain_state(&self, name: &str) -> Result<(DomainState, StateReason)> {
        self.with_domain(name, |dom| {
            let mut state: c_int = 0;
            let mut reason: c_int = 0;
            // SAFETY: dom is a live handle; out-params point to locals.
            if unsafe { (self.api.domain_get_state)(dom, &mut state, &mut reason, 0) } < 0 {
                return Err(self.last_error("get domain state", name));
            }
            let state = DomainState::from_libvirt(state);
            Ok((state, StateReason::from_libvirt(state, reason)))
        })
    }

    fn domain_config(&self, name: &str) -> Result<DomainConfig> {
        self.with_domain(name, |dom| {
            // SAFETY: dom is a live handle.
            let xml = unsafe { (self.api.domain_get_xml_desc)(dom, 0) };
            if xml.is_null() {
                return Err(self.last_error("get domain xml", name));
            }
            // SAFETY: libvirt returns a NUL-terminated, malloc'd string that
            // the caller must free.
            let text = unsafe {
                let text = CStr::from_ptr(xml).to_string_lossy().into_owned();
                libc::free(xml as *mut c_void);
                text
            };
            Ok(DomainConfig::from_xml(text))
        })
    }

    fn register_lifecycle(&self, sink: NotificationSink) -> Result<()> {
        event_loop::ensure_running(self.api)?;

        let mut state = self.state.lock();
        self.ensure_alive(&mut state)?;

        if let Some(id) = state.lifecycle_callback.take() {
            // SAFETY: id was returned by a registration on this connection.
            unsafe { (self.api.domain_event_deregister_any)(state.ptr, id) };
            tracing::debug!(callback = id, "replaced lifecycle callback");
        }

        let ctx = Box::into_raw(Box::new(LifecycleContext {
            api: self.api,
            sink,
        }));
        // SAFETY: libvirt casts every typed event callback to the generic
        // signature and calls it back with the lifecycle arguments.
        let callback: GenericCallback =
            unsafe { std::mem::transmute(on_lifecycle as LifecycleCallback) };
        // SAFETY: state.ptr is live; ctx is freed by free_lifecycle_ctx.
        let id = unsafe {
            (self.api.domain_event_register_any)(
                state.ptr,
                ptr::null_mut(),
                EVENT_ID_LIFECYCLE,
                callback,
                ctx as *mut c_void,
                Some(free_lifecycle_ctx),
            )
        };
        if id < 0 {
            // Ownership of ctx is unspecified on failure; leak it.
            let (_, message) = self.api.last_error();
            return Err(Error::hypervisor("register lifecycle callback", message));
        }

        state.lifecycle_callback = Some(id);
        tracing::debug!(callback = id, "registered lifecycle callback");
        Ok(())
    }

    fn take_reconnect_notifications(&self) -> Option<mpsc::Receiver<()>> {
        self.reconnect_rx.lock().take()
    }
}

impl Drop for LibvirtConnection {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        self.release(&mut state);
        tracing::debug!(uri = %self.uri, "closed libvirt connection");
    }
}

/// One `virConnectOpen` attempt.
fn connect(api: &'static VirtApi, uri_c: &CString, uri: &str) -> Result<VirConnectPtr> {
    // SAFETY: uri_c is a valid C string.
    let ptr = unsafe { (api.connect_open)(uri_c.as_ptr()) };
    if ptr.is_null() {
        let (_, message) = api.last_error();
        return Err(Error::HypervisorUnavailable(format!("{}: {}", uri, message)));
    }
    Ok(ptr)
}

unsafe extern "C" fn on_lifecycle(
    _conn: VirConnectPtr,
    dom: VirDomainPtr,
    event: c_int,
    detail: c_int,
    opaque: *mut c_void,
) -> c_int {
    let ctx = &*(opaque as *const LifecycleContext);
    let name = (ctx.api.domain_get_name)(dom);
    if name.is_null() {
        tracing::warn!(event, detail, "lifecycle event for a domain without a name");
        return 0;
    }
    let name = CStr::from_ptr(name).to_string_lossy().into_owned();
    tracing::debug!(domain = %name, event, detail, "lifecycle notification");
    // Only fails once the monitor is gone.
    let _ = ctx.sink.send(DomainNotification::new(name, event, detail));
    0
}

unsafe extern "C" fn free_lifecycle_ctx(opaque: *mut c_void) {
    drop(Box::from_raw(opaque as *mut LifecycleContext));
}

unsafe extern "C" fn on_close(_conn: VirConnectPtr, reason: c_int, opaque: *mut c_void) {
    let tx = &*(opaque as *const mpsc::Sender<()>);
    tracing::warn!(reason, "libvirt connection closed");
    let _ = tx.try_send(());
}

unsafe extern "C" fn free_close_ctx(opaque: *mut c_void) {
    drop(Box::from_raw(opaque as *mut mpsc::Sender<()>));
}
